//! Persisted entity records and their status machines.

use std::fmt;

use chrono::{SecondsFormat, Utc};

use crate::error::{Error, Result};

/// Enum persisted and transmitted as a lowercase string.
macro_rules! string_enum {
    ($(#[$meta:meta])* pub enum $name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($s => Ok($name::$variant),)+
                    other => Err($crate::error::Error::InvalidArgument(format!(
                        "unknown {} {other:?}",
                        stringify!($name)
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub mod image;
pub mod network;
pub mod snapshot;
pub mod storage;
pub mod vm;
pub mod volume;

pub use image::{Image, ImageAttachment, ImagePatch, ImageStatus};
pub use network::{NetworkPatch, NetworkState, NetworkStatus, VirtualNetwork};
pub use snapshot::{ChainPatch, Snapshot, SnapshotChain, SnapshotPatch, SnapshotStatus};
pub use storage::{Storage, StorageBackend, StorageKind, StoragePatch, StorageStatus};
pub use vm::{
    Disk, DiskSource, PowerState, VirtualInterface, VirtualMachine, VmPatch, VmStatus, valid_mac,
};
pub use volume::{Attachment, Volume, VolumeFormat, VolumePatch, VolumeStatus};

/// A per-entity status machine.
pub trait Status: Copy + Eq + fmt::Display + Send + Sync + 'static {
    /// Entity name used in errors and logs.
    const ENTITY: &'static str;

    fn as_str(&self) -> &'static str;

    /// Whether a command path may move an entity from `self` to `next`.
    fn allows(self, next: Self) -> bool;
}

/// Fail with `InvalidStatus` unless `current` is one of `allowed`.
pub fn require_status<S: Status>(id: &str, current: S, allowed: &[S]) -> Result<()> {
    if allowed.contains(&current) {
        return Ok(());
    }
    Err(Error::InvalidStatus {
        entity: S::ENTITY,
        id: id.to_string(),
        status: current.to_string(),
        expected: join(allowed),
    })
}

pub(crate) fn join<S: Status>(statuses: &[S]) -> String {
    statuses
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// RFC 3339 timestamp with microseconds, so creation order sorts lexically.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
