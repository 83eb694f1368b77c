use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{Repository, transition};
use crate::error::Result;
use crate::model::{ChainPatch, Snapshot, SnapshotChain, SnapshotPatch, SnapshotStatus, timestamp};

const COLUMNS: &str = "id, vm_id, name, description, parent_id, status, is_current, information, \
                       created_at, updated_at";

pub struct SnapshotRepo<'a> {
    conn: &'a mut SqliteConnection,
}

impl<'a> SnapshotRepo<'a> {
    pub(super) fn new(conn: &'a mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn list_for_vm(&mut self, vm_id: &str) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM snapshots WHERE vm_id = ? ORDER BY created_at"
        ))
        .bind(vm_id)
        .fetch_all(&mut *self.conn)
        .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    pub async fn chain(&mut self, vm_id: &str) -> Result<SnapshotChain> {
        Ok(SnapshotChain::new(self.list_for_vm(vm_id).await?))
    }

    /// Apply a planned chain edit.
    pub async fn apply(&mut self, patch: &ChainPatch) -> Result<()> {
        let now = timestamp();
        for (child, parent) in &patch.reparent {
            sqlx::query("UPDATE snapshots SET parent_id = ?, updated_at = ? WHERE id = ?")
                .bind(parent)
                .bind(&now)
                .bind(child)
                .execute(&mut *self.conn)
                .await?;
        }
        for id in &patch.clear_current {
            sqlx::query("UPDATE snapshots SET is_current = 0, updated_at = ? WHERE id = ?")
                .bind(&now)
                .bind(id)
                .execute(&mut *self.conn)
                .await?;
        }
        if let Some(id) = &patch.set_current {
            sqlx::query(
                "UPDATE snapshots SET is_current = 1, status = ?, information = '', updated_at = ? WHERE id = ?",
            )
            .bind(SnapshotStatus::Running.as_str())
            .bind(&now)
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        }
        if let Some(id) = &patch.remove {
            self.delete(id).await?;
        }
        Ok(())
    }

    /// Move a snapshot into an in-flight status. Only `running` snapshots
    /// may be current, so the flag is dropped with the same update.
    pub async fn begin_operation(
        &mut self,
        id: &str,
        from: SnapshotStatus,
        to: SnapshotStatus,
    ) -> Result<()> {
        self.transition(id, &[from], to, None).await?;
        self.clear_current(id).await
    }

    /// Move a snapshot to `error`, dropping the current flag it can no
    /// longer hold.
    pub async fn fail(&mut self, id: &str, from: SnapshotStatus, message: &str) -> Result<()> {
        self.transition(id, &[from], SnapshotStatus::Error, Some(message))
            .await?;
        self.clear_current(id).await
    }

    async fn clear_current(&mut self, id: &str) -> Result<()> {
        sqlx::query("UPDATE snapshots SET is_current = 0 WHERE id = ?")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Repository for SnapshotRepo<'_> {
    type Entity = Snapshot;
    type Patch = SnapshotPatch;
    type Status = SnapshotStatus;

    async fn find(&mut self, id: &str) -> Result<Option<Snapshot>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM snapshots WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn get_all(&mut self) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM snapshots ORDER BY vm_id, created_at"
        ))
        .fetch_all(&mut *self.conn)
        .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn add(&mut self, snapshot: &Snapshot) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO snapshots ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&snapshot.id)
        .bind(&snapshot.vm_id)
        .bind(&snapshot.name)
        .bind(&snapshot.description)
        .bind(&snapshot.parent_id)
        .bind(snapshot.status.as_str())
        .bind(snapshot.is_current)
        .bind(&snapshot.information)
        .bind(&snapshot.created_at)
        .bind(&snapshot.updated_at)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn delete(&mut self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM snapshots WHERE id = ?")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bulk_update(&mut self, patches: &[SnapshotPatch]) -> Result<u64> {
        let now = timestamp();
        let mut applied = 0;
        for patch in patches {
            let result = sqlx::query(
                "UPDATE snapshots SET status = ?, is_current = ?, information = ?, updated_at = ? \
                 WHERE id = ? AND status = ?",
            )
            .bind(patch.status.as_str())
            .bind(patch.is_current)
            .bind(&patch.information)
            .bind(&now)
            .bind(&patch.id)
            .bind(patch.expected_status.as_str())
            .execute(&mut *self.conn)
            .await?;
            applied += result.rows_affected();
        }
        Ok(applied)
    }

    async fn transition(
        &mut self,
        id: &str,
        from: &[SnapshotStatus],
        to: SnapshotStatus,
        information: Option<&str>,
    ) -> Result<()> {
        transition(&mut *self.conn, "snapshots", id, from, to, information).await
    }
}

fn snapshot_from_row(r: &SqliteRow) -> Result<Snapshot> {
    Ok(Snapshot {
        id: r.get("id"),
        vm_id: r.get("vm_id"),
        name: r.get("name"),
        description: r.get("description"),
        parent_id: r.get("parent_id"),
        status: r.get::<String, _>("status").parse()?,
        is_current: r.get("is_current"),
        information: r.get("information"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VirtualMachine;
    use crate::store::Store;

    async fn store_with_vm() -> (Store, String) {
        let store = Store::in_memory().await.unwrap();
        let vm = VirtualMachine::new("vm".into(), 1, 512, "u".into());
        let mut uow = store.begin().await.unwrap();
        uow.vms().add(&vm).await.unwrap();
        uow.commit().await.unwrap();
        (store, vm.id)
    }

    #[tokio::test]
    async fn apply_delete_patch_splices_chain() {
        let (store, vm_id) = store_with_vm().await;
        let mut uow = store.begin().await.unwrap();

        let mut s1 = Snapshot::new(&vm_id, "s1".into(), String::new(), None);
        s1.status = SnapshotStatus::Running;
        uow.snapshots().add(&s1).await.unwrap();
        let mut s2 = Snapshot::new(&vm_id, "s2".into(), String::new(), Some(s1.id.clone()));
        s2.status = SnapshotStatus::Running;
        s2.is_current = true;
        uow.snapshots().add(&s2).await.unwrap();
        let mut s3 = Snapshot::new(&vm_id, "s3".into(), String::new(), Some(s2.id.clone()));
        s3.status = SnapshotStatus::Running;
        uow.snapshots().add(&s3).await.unwrap();

        let chain = uow.snapshots().chain(&vm_id).await.unwrap();
        let patch = chain.plan_delete(&s2.id).unwrap();
        uow.snapshots().apply(&patch).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let chain = uow.snapshots().chain(&vm_id).await.unwrap();
        assert!(chain.get(&s2.id).is_none());
        assert_eq!(chain.get(&s3.id).unwrap().parent_id.as_deref(), Some(s1.id.as_str()));
        assert_eq!(chain.current().unwrap().id, s1.id);
        assert!(chain.validate().is_ok());
    }

    #[tokio::test]
    async fn fail_clears_current_flag() {
        let (store, vm_id) = store_with_vm().await;
        let mut uow = store.begin().await.unwrap();
        let mut s1 = Snapshot::new(&vm_id, "s1".into(), String::new(), None);
        s1.status = SnapshotStatus::Reverting;
        s1.is_current = true;
        uow.snapshots().add(&s1).await.unwrap();

        uow.snapshots()
            .fail(&s1.id, SnapshotStatus::Reverting, "revert failed")
            .await
            .unwrap();
        let stored = uow.snapshots().get(&s1.id).await.unwrap();
        assert_eq!(stored.status, SnapshotStatus::Error);
        assert!(!stored.is_current);
    }

    #[tokio::test]
    async fn deleting_vm_removes_snapshots() {
        let (store, vm_id) = store_with_vm().await;
        let mut uow = store.begin().await.unwrap();
        uow.snapshots()
            .add(&Snapshot::new(&vm_id, "s1".into(), String::new(), None))
            .await
            .unwrap();
        assert!(uow.vms().delete(&vm_id).await.unwrap());
        assert!(uow.snapshots().list_for_vm(&vm_id).await.unwrap().is_empty());
    }
}
