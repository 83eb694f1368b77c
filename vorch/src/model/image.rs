use serde::Serialize;
use uuid::Uuid;

use super::{Status, VolumeFormat, timestamp};

string_enum! {
    /// Image lifecycle status
    pub enum ImageStatus {
        New => "new",
        Uploading => "uploading",
        Available => "available",
        Error => "error",
        Deleting => "deleting",
    }
}

impl Status for ImageStatus {
    const ENTITY: &'static str = "image";

    fn as_str(&self) -> &'static str {
        ImageStatus::as_str(self)
    }

    fn allows(self, next: Self) -> bool {
        use ImageStatus::*;
        matches!(
            (self, next),
            (New, Uploading)
                | (Uploading, Available | Error)
                | (Available, Deleting | Error)
                | (Deleting, Error)
                | (Error, Deleting)
        )
    }
}

impl ImageStatus {
    pub const MONITORED: &'static [ImageStatus] = &[ImageStatus::Available, ImageStatus::Error];
}

/// Image record
#[derive(Debug, Clone, Serialize)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub format: VolumeFormat,
    pub size: u64,
    pub status: ImageStatus,
    pub storage_id: String,
    pub source: String,
    pub path: Option<String>,
    pub user_id: String,
    pub description: String,
    pub information: String,
    pub created_at: String,
    pub updated_at: String,
    pub attachments: Vec<ImageAttachment>,
}

impl Image {
    pub fn new(
        name: String,
        format: VolumeFormat,
        storage_id: String,
        source: String,
        user_id: String,
    ) -> Self {
        let now = timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            format,
            size: 0,
            status: ImageStatus::New,
            storage_id,
            source,
            path: None,
            user_id,
            description: String::new(),
            information: String::new(),
            created_at: now.clone(),
            updated_at: now,
            attachments: Vec::new(),
        }
    }
}

/// Image mounted into a VM (e.g. as a cdrom)
#[derive(Debug, Clone, Serialize)]
pub struct ImageAttachment {
    pub id: String,
    pub image_id: String,
    pub vm_id: String,
    pub target: Option<String>,
    pub created_at: String,
}

impl ImageAttachment {
    pub fn new(image_id: &str, vm_id: &str, target: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            image_id: image_id.to_string(),
            vm_id: vm_id.to_string(),
            target,
            created_at: timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImagePatch {
    pub id: String,
    pub expected_status: ImageStatus,
    pub status: ImageStatus,
    pub size: Option<u64>,
    pub information: String,
}
