use serde::Serialize;
use uuid::Uuid;

use super::{Status, timestamp};

string_enum! {
    /// Volume lifecycle status
    pub enum VolumeStatus {
        New => "new",
        Creating => "creating",
        Available => "available",
        Error => "error",
        Deleting => "deleting",
        Extending => "extending",
    }
}

impl Status for VolumeStatus {
    const ENTITY: &'static str = "volume";

    fn as_str(&self) -> &'static str {
        VolumeStatus::as_str(self)
    }

    fn allows(self, next: Self) -> bool {
        use VolumeStatus::*;
        matches!(
            (self, next),
            (New, Creating)
                | (Creating, Available | Error)
                | (Available, Extending | Deleting)
                // attach could not query the backend
                | (Available, Error)
                | (Extending, Available | Error)
                | (Deleting, Error)
                | (Error, Deleting)
        )
    }
}

impl VolumeStatus {
    /// Statuses the reconciler refreshes.
    pub const MONITORED: &'static [VolumeStatus] = &[
        VolumeStatus::Available,
        VolumeStatus::Error,
        VolumeStatus::Creating,
        VolumeStatus::Deleting,
        VolumeStatus::Extending,
    ];
}

string_enum! {
    /// On-disk image format
    pub enum VolumeFormat {
        Qcow2 => "qcow2",
        Raw => "raw",
    }
}

/// Volume record
#[derive(Debug, Clone, Serialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub format: VolumeFormat,
    pub size: u64,
    pub used: u64,
    pub status: VolumeStatus,
    pub storage_id: String,
    pub user_id: String,
    pub read_only: bool,
    pub description: String,
    pub information: String,
    pub path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub attachments: Vec<Attachment>,
}

impl Volume {
    pub fn new(
        name: String,
        format: VolumeFormat,
        size: u64,
        storage_id: String,
        user_id: String,
    ) -> Self {
        let now = timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            format,
            size,
            used: 0,
            status: VolumeStatus::New,
            storage_id,
            user_id,
            read_only: false,
            description: String::new(),
            information: String::new(),
            path: None,
            created_at: now.clone(),
            updated_at: now,
            attachments: Vec::new(),
        }
    }

    pub fn attached_vm_ids(&self) -> Vec<&str> {
        self.attachments.iter().map(|a| a.vm_id.as_str()).collect()
    }
}

/// Link between a volume and a VM
#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    pub id: String,
    pub volume_id: String,
    pub vm_id: String,
    pub target: Option<String>,
    pub created_at: String,
}

impl Attachment {
    pub fn new(volume_id: &str, vm_id: &str, target: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            volume_id: volume_id.to_string(),
            vm_id: vm_id.to_string(),
            target,
            created_at: timestamp(),
        }
    }
}

/// Reconciler correction, applied only if the volume is still in
/// `expected_status`.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumePatch {
    pub id: String,
    pub expected_status: VolumeStatus,
    pub status: VolumeStatus,
    pub size: Option<u64>,
    pub used: Option<u64>,
    pub information: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_roundtrip() {
        for s in [
            VolumeStatus::New,
            VolumeStatus::Creating,
            VolumeStatus::Available,
            VolumeStatus::Error,
            VolumeStatus::Deleting,
            VolumeStatus::Extending,
        ] {
            assert_eq!(VolumeStatus::from_str(s.as_str()).unwrap(), s);
        }
        assert!(VolumeStatus::from_str("bogus").is_err());
    }

    #[test]
    fn transition_table() {
        use VolumeStatus::*;
        assert!(New.allows(Creating));
        assert!(Creating.allows(Available));
        assert!(Creating.allows(Error));
        assert!(Available.allows(Extending));
        assert!(Available.allows(Deleting));
        assert!(Extending.allows(Available));
        assert!(Extending.allows(Error));
        assert!(Deleting.allows(Error));
        assert!(Error.allows(Deleting));
        assert!(Available.allows(Error));

        assert!(!New.allows(Available));
        assert!(!New.allows(Error));
        assert!(!Available.allows(Creating));
        assert!(!Deleting.allows(Available));
        assert!(!Error.allows(Extending));
        assert!(!Extending.allows(Deleting));
    }

    #[test]
    fn format_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&VolumeFormat::Qcow2).unwrap(), "\"qcow2\"");
        let f: VolumeFormat = serde_json::from_str("\"raw\"").unwrap();
        assert_eq!(f, VolumeFormat::Raw);
    }

    #[test]
    fn new_volume_starts_new() {
        let v = Volume::new("data".into(), VolumeFormat::Qcow2, 1024, "s1".into(), "u".into());
        assert_eq!(v.status, VolumeStatus::New);
        assert_eq!(v.used, 0);
        assert!(v.attachments.is_empty());
    }
}
