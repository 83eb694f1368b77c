use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Status, timestamp};

string_enum! {
    /// Storage lifecycle status
    pub enum StorageStatus {
        New => "new",
        Creating => "creating",
        Available => "available",
        Error => "error",
        Deleting => "deleting",
    }
}

impl Status for StorageStatus {
    const ENTITY: &'static str = "storage";

    fn as_str(&self) -> &'static str {
        StorageStatus::as_str(self)
    }

    fn allows(self, next: Self) -> bool {
        use StorageStatus::*;
        matches!(
            (self, next),
            (New, Creating)
                | (Creating, Available | Error)
                | (Available, Deleting)
                | (Deleting, Error)
                | (Error, Deleting)
        )
    }
}

impl StorageStatus {
    pub const MONITORED: &'static [StorageStatus] =
        &[StorageStatus::Available, StorageStatus::Error];
}

string_enum! {
    /// Driver family a storage belongs to
    pub enum StorageKind {
        LocalFs => "localfs",
        Nfs => "nfs",
    }
}

/// Backend-specific storage parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackend {
    /// Block device formatted and mounted locally.
    #[serde(rename = "localfs")]
    LocalFs { device: String, fs_type: String },
    /// NFS export mounted locally.
    Nfs { ip: String, path: String },
}

impl StorageBackend {
    pub fn kind(&self) -> StorageKind {
        match self {
            StorageBackend::LocalFs { .. } => StorageKind::LocalFs,
            StorageBackend::Nfs { .. } => StorageKind::Nfs,
        }
    }
}

/// Storage record
#[derive(Debug, Clone, Serialize)]
pub struct Storage {
    pub id: String,
    pub name: String,
    pub backend: StorageBackend,
    pub status: StorageStatus,
    pub size: u64,
    pub available: u64,
    pub mount_point: Option<String>,
    pub user_id: String,
    pub description: String,
    pub information: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Storage {
    pub fn new(name: String, backend: StorageBackend, user_id: String) -> Self {
        let now = timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            backend,
            status: StorageStatus::New,
            size: 0,
            available: 0,
            mount_point: None,
            user_id,
            description: String::new(),
            information: String::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn kind(&self) -> StorageKind {
        self.backend.kind()
    }

    pub fn is_available(&self) -> bool {
        self.status == StorageStatus::Available
    }
}

/// Reconciler correction for a storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoragePatch {
    pub id: String,
    pub expected_status: StorageStatus,
    pub status: StorageStatus,
    pub size: Option<u64>,
    pub available: Option<u64>,
    pub information: String,
}
