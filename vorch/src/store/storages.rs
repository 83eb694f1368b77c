use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{Repository, to_i64, to_u64, transition};
use crate::error::{Error, Result};
use crate::model::{Storage, StorageBackend, StoragePatch, StorageStatus, timestamp};

const COLUMNS: &str = "id, name, kind, spec, status, size, available, mount_point, user_id, \
                       description, information, created_at, updated_at";

pub struct StorageRepo<'a> {
    conn: &'a mut SqliteConnection,
}

impl<'a> StorageRepo<'a> {
    pub(super) fn new(conn: &'a mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn find_by_name(&mut self, name: &str) -> Result<Option<Storage>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM storages WHERE name = ?"))
            .bind(name)
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(storage_from_row).transpose()
    }

    /// Storage already registered for the same backend.
    pub async fn find_by_backend(&mut self, backend: &StorageBackend) -> Result<Option<Storage>> {
        let all = self.get_all().await?;
        Ok(all.into_iter().find(|s| &s.backend == backend))
    }

    /// Record the backend's view after creation or a refresh.
    pub async fn set_capacity(
        &mut self,
        id: &str,
        size: u64,
        available: u64,
        mount_point: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE storages SET size = ?, available = ?, mount_point = COALESCE(?, mount_point), \
             updated_at = ? WHERE id = ?",
        )
        .bind(to_i64(size))
        .bind(to_i64(available))
        .bind(mount_point)
        .bind(timestamp())
        .bind(id)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Repository for StorageRepo<'_> {
    type Entity = Storage;
    type Patch = StoragePatch;
    type Status = StorageStatus;

    async fn find(&mut self, id: &str) -> Result<Option<Storage>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM storages WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(storage_from_row).transpose()
    }

    async fn get_all(&mut self) -> Result<Vec<Storage>> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM storages ORDER BY created_at"))
            .fetch_all(&mut *self.conn)
            .await?;
        rows.iter().map(storage_from_row).collect()
    }

    async fn add(&mut self, storage: &Storage) -> Result<()> {
        let spec = serde_json::to_string(&storage.backend)
            .map_err(|e| Error::Internal(format!("encode storage spec: {e}")))?;
        sqlx::query(&format!(
            "INSERT INTO storages ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&storage.id)
        .bind(&storage.name)
        .bind(storage.kind().as_str())
        .bind(spec)
        .bind(storage.status.as_str())
        .bind(to_i64(storage.size))
        .bind(to_i64(storage.available))
        .bind(&storage.mount_point)
        .bind(&storage.user_id)
        .bind(&storage.description)
        .bind(&storage.information)
        .bind(&storage.created_at)
        .bind(&storage.updated_at)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn delete(&mut self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM storages WHERE id = ?")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bulk_update(&mut self, patches: &[StoragePatch]) -> Result<u64> {
        let now = timestamp();
        let mut applied = 0;
        for patch in patches {
            let result = sqlx::query(
                "UPDATE storages SET status = ?, size = COALESCE(?, size), \
                 available = COALESCE(?, available), information = ?, updated_at = ? \
                 WHERE id = ? AND status = ?",
            )
            .bind(patch.status.as_str())
            .bind(patch.size.map(to_i64))
            .bind(patch.available.map(to_i64))
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
        from: &[StorageStatus],
        to: StorageStatus,
        information: Option<&str>,
    ) -> Result<()> {
        transition(&mut *self.conn, "storages", id, from, to, information).await
    }
}

fn storage_from_row(r: &SqliteRow) -> Result<Storage> {
    let spec: String = r.get("spec");
    let backend: StorageBackend = serde_json::from_str(&spec)
        .map_err(|e| Error::Internal(format!("decode storage spec: {e}")))?;
    Ok(Storage {
        id: r.get("id"),
        name: r.get("name"),
        backend,
        status: r.get::<String, _>("status").parse()?,
        size: to_u64(r.get("size")),
        available: to_u64(r.get("available")),
        mount_point: r.get("mount_point"),
        user_id: r.get("user_id"),
        description: r.get("description"),
        information: r.get("information"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}
