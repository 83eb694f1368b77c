use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{Repository, to_i64, to_u64, transition};
use crate::error::Result;
use crate::model::{Attachment, Volume, VolumePatch, VolumeStatus, timestamp};

const COLUMNS: &str = "id, name, format, size, used, status, storage_id, user_id, read_only, \
                       description, information, path, created_at, updated_at";

pub struct VolumeRepo<'a> {
    conn: &'a mut SqliteConnection,
}

impl<'a> VolumeRepo<'a> {
    pub(super) fn new(conn: &'a mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn find_by_name(&mut self, storage_id: &str, name: &str) -> Result<Option<Volume>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM volumes WHERE storage_id = ? AND name = ?"
        ))
        .bind(storage_id)
        .bind(name)
        .fetch_optional(&mut *self.conn)
        .await?;

        match row {
            Some(r) => {
                let mut volume = volume_from_row(&r)?;
                volume.attachments = self.attachments_of(&volume.id).await?;
                Ok(Some(volume))
            }
            None => Ok(None),
        }
    }

    pub async fn list_by_storage(&mut self, storage_id: &str) -> Result<Vec<Volume>> {
        let all = self.get_all().await?;
        Ok(all.into_iter().filter(|v| v.storage_id == storage_id).collect())
    }

    pub async fn count_on_storage(&mut self, storage_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM volumes WHERE storage_id = ?")
            .bind(storage_id)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(to_u64(count))
    }

    /// Record backend results after a create or extend.
    pub async fn set_usage(
        &mut self,
        id: &str,
        size: u64,
        used: u64,
        path: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE volumes SET size = ?, used = ?, path = COALESCE(?, path), updated_at = ? WHERE id = ?",
        )
        .bind(to_i64(size))
        .bind(to_i64(used))
        .bind(path)
        .bind(timestamp())
        .bind(id)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn set_used(&mut self, id: &str, used: u64) -> Result<()> {
        sqlx::query("UPDATE volumes SET used = ?, updated_at = ? WHERE id = ?")
            .bind(to_i64(used))
            .bind(timestamp())
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    pub async fn edit(
        &mut self,
        id: &str,
        name: &str,
        description: &str,
        read_only: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE volumes SET name = ?, description = ?, read_only = ?, updated_at = ? WHERE id = ?",
        )
        .bind(name)
        .bind(description)
        .bind(read_only)
        .bind(timestamp())
        .bind(id)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn add_attachment(&mut self, attachment: &Attachment) -> Result<()> {
        sqlx::query(
            "INSERT INTO volume_attachments (id, volume_id, vm_id, target, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&attachment.id)
        .bind(&attachment.volume_id)
        .bind(&attachment.vm_id)
        .bind(&attachment.target)
        .bind(&attachment.created_at)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    /// Detach `vm_id` from one volume. Returns the number of rows removed.
    pub async fn remove_attachments(&mut self, volume_id: &str, vm_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM volume_attachments WHERE volume_id = ? AND vm_id = ?")
            .bind(volume_id)
            .bind(vm_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Drop every attachment that references `vm_id`.
    pub async fn remove_attachments_for_vm(&mut self, vm_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM volume_attachments WHERE vm_id = ?")
            .bind(vm_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected())
    }

    async fn attachments_of(&mut self, volume_id: &str) -> Result<Vec<Attachment>> {
        let rows = sqlx::query(
            "SELECT id, volume_id, vm_id, target, created_at FROM volume_attachments \
             WHERE volume_id = ? ORDER BY created_at",
        )
        .bind(volume_id)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows.iter().map(attachment_from_row).collect())
    }
}

#[async_trait]
impl Repository for VolumeRepo<'_> {
    type Entity = Volume;
    type Patch = VolumePatch;
    type Status = VolumeStatus;

    async fn find(&mut self, id: &str) -> Result<Option<Volume>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM volumes WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;

        match row {
            Some(r) => {
                let mut volume = volume_from_row(&r)?;
                volume.attachments = self.attachments_of(id).await?;
                Ok(Some(volume))
            }
            None => Ok(None),
        }
    }

    async fn get_all(&mut self) -> Result<Vec<Volume>> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM volumes ORDER BY created_at"))
            .fetch_all(&mut *self.conn)
            .await?;

        let attachment_rows = sqlx::query(
            "SELECT id, volume_id, vm_id, target, created_at FROM volume_attachments ORDER BY created_at",
        )
        .fetch_all(&mut *self.conn)
        .await?;
        let mut attachments: HashMap<String, Vec<Attachment>> = HashMap::new();
        for r in &attachment_rows {
            let a = attachment_from_row(r);
            attachments.entry(a.volume_id.clone()).or_default().push(a);
        }

        rows.iter()
            .map(|r| {
                let mut volume = volume_from_row(r)?;
                volume.attachments = attachments.remove(&volume.id).unwrap_or_default();
                Ok(volume)
            })
            .collect()
    }

    async fn add(&mut self, volume: &Volume) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO volumes ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&volume.id)
        .bind(&volume.name)
        .bind(volume.format.as_str())
        .bind(to_i64(volume.size))
        .bind(to_i64(volume.used))
        .bind(volume.status.as_str())
        .bind(&volume.storage_id)
        .bind(&volume.user_id)
        .bind(volume.read_only)
        .bind(&volume.description)
        .bind(&volume.information)
        .bind(&volume.path)
        .bind(&volume.created_at)
        .bind(&volume.updated_at)
        .execute(&mut *self.conn)
        .await?;

        for attachment in &volume.attachments {
            self.add_attachment(attachment).await?;
        }
        Ok(())
    }

    async fn delete(&mut self, id: &str) -> Result<bool> {
        sqlx::query("DELETE FROM volume_attachments WHERE volume_id = ?")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        let result = sqlx::query("DELETE FROM volumes WHERE id = ?")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bulk_update(&mut self, patches: &[VolumePatch]) -> Result<u64> {
        let now = timestamp();
        let mut applied = 0;
        for patch in patches {
            let result = sqlx::query(
                "UPDATE volumes SET status = ?, size = COALESCE(?, size), used = COALESCE(?, used), \
                 information = ?, updated_at = ? WHERE id = ? AND status = ?",
            )
            .bind(patch.status.as_str())
            .bind(patch.size.map(to_i64))
            .bind(patch.used.map(to_i64))
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
        from: &[VolumeStatus],
        to: VolumeStatus,
        information: Option<&str>,
    ) -> Result<()> {
        transition(&mut *self.conn, "volumes", id, from, to, information).await
    }
}

fn volume_from_row(r: &SqliteRow) -> Result<Volume> {
    Ok(Volume {
        id: r.get("id"),
        name: r.get("name"),
        format: r.get::<String, _>("format").parse()?,
        size: to_u64(r.get("size")),
        used: to_u64(r.get("used")),
        status: r.get::<String, _>("status").parse()?,
        storage_id: r.get("storage_id"),
        user_id: r.get("user_id"),
        read_only: r.get("read_only"),
        description: r.get("description"),
        information: r.get("information"),
        path: r.get("path"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        attachments: Vec::new(),
    })
}

fn attachment_from_row(r: &SqliteRow) -> Attachment {
    Attachment {
        id: r.get("id"),
        volume_id: r.get("volume_id"),
        vm_id: r.get("vm_id"),
        target: r.get("target"),
        created_at: r.get("created_at"),
    }
}
