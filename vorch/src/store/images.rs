use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{Repository, to_i64, to_u64, transition};
use crate::error::Result;
use crate::model::{Image, ImageAttachment, ImagePatch, ImageStatus, timestamp};

const COLUMNS: &str = "id, name, format, size, status, storage_id, source, path, user_id, \
                       description, information, created_at, updated_at";

pub struct ImageRepo<'a> {
    conn: &'a mut SqliteConnection,
}

impl<'a> ImageRepo<'a> {
    pub(super) fn new(conn: &'a mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn find_by_name(&mut self, name: &str) -> Result<Option<Image>> {
        let id: Option<String> = sqlx::query_scalar("SELECT id FROM images WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *self.conn)
            .await?;
        match id {
            Some(id) => self.find(&id).await,
            None => Ok(None),
        }
    }

    pub async fn count_on_storage(&mut self, storage_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images WHERE storage_id = ?")
            .bind(storage_id)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(to_u64(count))
    }

    pub async fn set_uploaded(&mut self, id: &str, size: u64, path: &str) -> Result<()> {
        sqlx::query("UPDATE images SET size = ?, path = ?, updated_at = ? WHERE id = ?")
            .bind(to_i64(size))
            .bind(path)
            .bind(timestamp())
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    pub async fn add_attachment(&mut self, attachment: &ImageAttachment) -> Result<()> {
        sqlx::query(
            "INSERT INTO image_attachments (id, image_id, vm_id, target, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&attachment.id)
        .bind(&attachment.image_id)
        .bind(&attachment.vm_id)
        .bind(&attachment.target)
        .bind(&attachment.created_at)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn remove_attachments(&mut self, image_id: &str, vm_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM image_attachments WHERE image_id = ? AND vm_id = ?")
            .bind(image_id)
            .bind(vm_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn remove_attachments_for_vm(&mut self, vm_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM image_attachments WHERE vm_id = ?")
            .bind(vm_id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected())
    }

    async fn attachments(&mut self, image_id: Option<&str>) -> Result<Vec<ImageAttachment>> {
        let rows = sqlx::query(
            "SELECT id, image_id, vm_id, target, created_at FROM image_attachments \
             WHERE ? IS NULL OR image_id = ? ORDER BY created_at",
        )
        .bind(image_id)
        .bind(image_id)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ImageAttachment {
                id: r.get("id"),
                image_id: r.get("image_id"),
                vm_id: r.get("vm_id"),
                target: r.get("target"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}

#[async_trait]
impl Repository for ImageRepo<'_> {
    type Entity = Image;
    type Patch = ImagePatch;
    type Status = ImageStatus;

    async fn find(&mut self, id: &str) -> Result<Option<Image>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM images WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;
        match row {
            Some(r) => {
                let mut image = image_from_row(&r)?;
                image.attachments = self.attachments(Some(id)).await?;
                Ok(Some(image))
            }
            None => Ok(None),
        }
    }

    async fn get_all(&mut self) -> Result<Vec<Image>> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM images ORDER BY created_at"))
            .fetch_all(&mut *self.conn)
            .await?;
        let mut attachments: HashMap<String, Vec<ImageAttachment>> = HashMap::new();
        for a in self.attachments(None).await? {
            attachments.entry(a.image_id.clone()).or_default().push(a);
        }
        rows.iter()
            .map(|r| {
                let mut image = image_from_row(r)?;
                image.attachments = attachments.remove(&image.id).unwrap_or_default();
                Ok(image)
            })
            .collect()
    }

    async fn add(&mut self, image: &Image) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO images ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&image.id)
        .bind(&image.name)
        .bind(image.format.as_str())
        .bind(to_i64(image.size))
        .bind(image.status.as_str())
        .bind(&image.storage_id)
        .bind(&image.source)
        .bind(&image.path)
        .bind(&image.user_id)
        .bind(&image.description)
        .bind(&image.information)
        .bind(&image.created_at)
        .bind(&image.updated_at)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn delete(&mut self, id: &str) -> Result<bool> {
        sqlx::query("DELETE FROM image_attachments WHERE image_id = ?")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        let result = sqlx::query("DELETE FROM images WHERE id = ?")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bulk_update(&mut self, patches: &[ImagePatch]) -> Result<u64> {
        let now = timestamp();
        let mut applied = 0;
        for patch in patches {
            let result = sqlx::query(
                "UPDATE images SET status = ?, size = COALESCE(?, size), information = ?, \
                 updated_at = ? WHERE id = ? AND status = ?",
            )
            .bind(patch.status.as_str())
            .bind(patch.size.map(to_i64))
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
        from: &[ImageStatus],
        to: ImageStatus,
        information: Option<&str>,
    ) -> Result<()> {
        transition(&mut *self.conn, "images", id, from, to, information).await
    }
}

fn image_from_row(r: &SqliteRow) -> Result<Image> {
    Ok(Image {
        id: r.get("id"),
        name: r.get("name"),
        format: r.get::<String, _>("format").parse()?,
        size: to_u64(r.get("size")),
        status: r.get::<String, _>("status").parse()?,
        storage_id: r.get("storage_id"),
        source: r.get("source"),
        path: r.get("path"),
        user_id: r.get("user_id"),
        description: r.get("description"),
        information: r.get("information"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        attachments: Vec::new(),
    })
}
