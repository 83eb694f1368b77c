//! Domain executors: the capability interface managers use to act on the
//! host.
//!
//! Managers never touch a backend directly. They `call` a typed command on
//! the executor queue of the entity kind; the executor worker picks the
//! driver registered for the entity's backend kind and runs it. Drivers
//! return what the backend observed after the operation so managers can
//! persist it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{Command, Failure};
use crate::model::{NetworkState, PowerState, StorageBackend, StorageKind, VolumeFormat};

mod bridge;
mod libvirt;
mod mounts;
mod process;
mod qemu;
mod registry;
mod server;

pub use bridge::IpBridges;
pub use libvirt::VirshDomains;
pub use mounts::{LocalFsStorage, NfsStorage};
pub use qemu::{QemuImages, QemuVolumes};
pub use registry::DriverRegistry;
pub use server::Executors;

/// Driver-level failure.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{program} failed ({code:?}): {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected output: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl DriverError {
    pub fn kind(&self) -> &'static str {
        match self {
            DriverError::Command { .. } => "CommandFailed",
            DriverError::Io(_) => "Io",
            DriverError::Parse(_) => "Parse",
            DriverError::NotFound(_) => "NotFound",
            DriverError::Unsupported(_) => "Unsupported",
        }
    }
}

impl From<DriverError> for Failure {
    fn from(e: DriverError) -> Self {
        Failure::new(e.kind(), e.to_string())
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

// === Specs sent to executors ===

/// What a volume driver needs to know about a volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub id: String,
    pub format: VolumeFormat,
    pub size: u64,
    pub kind: StorageKind,
    pub mount_point: String,
    pub path: Option<String>,
}

impl VolumeSpec {
    /// Backing file path, as assigned at creation or derived from the id.
    pub fn file_path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("{}/volume-{}", self.mount_point, self.id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSpec {
    pub id: String,
    pub backend: StorageBackend,
    pub mount_point: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub id: String,
    pub format: VolumeFormat,
    pub source: String,
    pub kind: StorageKind,
    pub mount_point: String,
    pub path: Option<String>,
}

impl ImageSpec {
    pub fn file_path(&self) -> String {
        self.path.clone().unwrap_or_else(|| {
            format!("{}/image-{}.{}", self.mount_point, self.id, self.format)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub id: String,
    pub name: String,
    pub cpu: u32,
    pub ram_mb: u64,
    #[serde(default)]
    pub disks: Vec<DomainDisk>,
    #[serde(default)]
    pub interfaces: Vec<DomainInterface>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainDisk {
    pub path: String,
    pub format: VolumeFormat,
    pub device: String,
    pub read_only: bool,
    /// Plugged in as a CD-ROM rather than a block device.
    pub cdrom: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainInterface {
    pub bridge: String,
    pub mac: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub id: String,
    pub name: String,
    pub bridge: String,
}

// === Replies ===

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub size: u64,
    pub used: u64,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub size: u64,
    pub available: u64,
    pub mount_point: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub size: u64,
    pub path: String,
}

/// Hypervisor view of a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainState {
    pub power_state: PowerState,
    pub snapshots: Vec<String>,
    pub current_snapshot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub state: NetworkState,
}

/// Reply of an executor queue: what the backend observed, or `done` for
/// commands that leave nothing behind.
macro_rules! reply {
    ($name:ident($info:ty)) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            Info($info),
            Done,
        }

        impl $name {
            pub fn into_info(self) -> crate::error::Result<$info> {
                match self {
                    $name::Info(info) => Ok(info),
                    $name::Done => Err(crate::error::Error::Internal(format!(
                        "{} without payload",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

reply!(VolumeReply(VolumeInfo));
reply!(StorageReply(StorageInfo));
reply!(ImageReply(ImageInfo));
reply!(VmReply(DomainState));
reply!(NetworkReply(NetworkInfo));

// === Commands ===

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command_name", content = "payload", rename_all = "snake_case")]
pub enum VolumeCommand {
    Create { volume: VolumeSpec },
    Delete { volume: VolumeSpec },
    Extend { volume: VolumeSpec, new_size: u64 },
    QueryInfo { volume: VolumeSpec },
}

impl Command for VolumeCommand {
    fn name(&self) -> &'static str {
        match self {
            VolumeCommand::Create { .. } => "create",
            VolumeCommand::Delete { .. } => "delete",
            VolumeCommand::Extend { .. } => "extend",
            VolumeCommand::QueryInfo { .. } => "query_info",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command_name", content = "payload", rename_all = "snake_case")]
pub enum StorageCommand {
    Create { storage: StorageSpec },
    Delete { storage: StorageSpec },
    QueryInfo { storage: StorageSpec },
}

impl Command for StorageCommand {
    fn name(&self) -> &'static str {
        match self {
            StorageCommand::Create { .. } => "create",
            StorageCommand::Delete { .. } => "delete",
            StorageCommand::QueryInfo { .. } => "query_info",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command_name", content = "payload", rename_all = "snake_case")]
pub enum ImageCommand {
    Upload { image: ImageSpec },
    Delete { image: ImageSpec },
    QueryInfo { image: ImageSpec },
}

impl Command for ImageCommand {
    fn name(&self) -> &'static str {
        match self {
            ImageCommand::Upload { .. } => "upload",
            ImageCommand::Delete { .. } => "delete",
            ImageCommand::QueryInfo { .. } => "query_info",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command_name", content = "payload", rename_all = "snake_case")]
pub enum VmCommand {
    Create {
        domain: DomainSpec,
    },
    Delete {
        domain: DomainSpec,
    },
    Start {
        domain: DomainSpec,
    },
    ShutOff {
        domain: DomainSpec,
    },
    QueryState {
        domain: DomainSpec,
    },
    CreateSnapshot {
        domain: DomainSpec,
        name: String,
        description: String,
    },
    DeleteSnapshot {
        domain: DomainSpec,
        name: String,
        children: Vec<String>,
    },
    RevertSnapshot {
        domain: DomainSpec,
        name: String,
    },
}

impl Command for VmCommand {
    fn name(&self) -> &'static str {
        match self {
            VmCommand::Create { .. } => "create",
            VmCommand::Delete { .. } => "delete",
            VmCommand::Start { .. } => "start",
            VmCommand::ShutOff { .. } => "shut_off",
            VmCommand::QueryState { .. } => "query_state",
            VmCommand::CreateSnapshot { .. } => "create_snapshot",
            VmCommand::DeleteSnapshot { .. } => "delete_snapshot",
            VmCommand::RevertSnapshot { .. } => "revert_snapshot",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command_name", content = "payload", rename_all = "snake_case")]
pub enum NetworkCommand {
    Create { network: NetworkSpec },
    Delete { network: NetworkSpec },
    Enable { network: NetworkSpec },
    Disable { network: NetworkSpec },
    QueryState { network: NetworkSpec },
}

impl Command for NetworkCommand {
    fn name(&self) -> &'static str {
        match self {
            NetworkCommand::Create { .. } => "create",
            NetworkCommand::Delete { .. } => "delete",
            NetworkCommand::Enable { .. } => "enable",
            NetworkCommand::Disable { .. } => "disable",
            NetworkCommand::QueryState { .. } => "query_state",
        }
    }
}

// === Driver capabilities ===

#[async_trait]
pub trait VolumeDriver: Send + Sync {
    async fn create(&self, volume: &VolumeSpec) -> DriverResult<VolumeInfo>;
    async fn delete(&self, volume: &VolumeSpec) -> DriverResult<()>;
    async fn extend(&self, volume: &VolumeSpec, new_size: u64) -> DriverResult<VolumeInfo>;
    async fn query_info(&self, volume: &VolumeSpec) -> DriverResult<VolumeInfo>;
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn create(&self, storage: &StorageSpec) -> DriverResult<StorageInfo>;
    async fn delete(&self, storage: &StorageSpec) -> DriverResult<()>;
    async fn query_info(&self, storage: &StorageSpec) -> DriverResult<StorageInfo>;
}

#[async_trait]
pub trait ImageDriver: Send + Sync {
    async fn upload(&self, image: &ImageSpec) -> DriverResult<ImageInfo>;
    async fn delete(&self, image: &ImageSpec) -> DriverResult<()>;
    async fn query_info(&self, image: &ImageSpec) -> DriverResult<ImageInfo>;
}

#[async_trait]
pub trait DomainDriver: Send + Sync {
    async fn create(&self, domain: &DomainSpec) -> DriverResult<DomainState>;
    async fn delete(&self, domain: &DomainSpec) -> DriverResult<()>;
    async fn start(&self, domain: &DomainSpec) -> DriverResult<DomainState>;
    async fn shut_off(&self, domain: &DomainSpec) -> DriverResult<DomainState>;
    async fn query_state(&self, domain: &DomainSpec) -> DriverResult<DomainState>;
    async fn create_snapshot(
        &self,
        domain: &DomainSpec,
        name: &str,
        description: &str,
    ) -> DriverResult<DomainState>;
    /// `children` are the names of snapshots whose backing chain references
    /// the deleted one.
    async fn delete_snapshot(
        &self,
        domain: &DomainSpec,
        name: &str,
        children: &[String],
    ) -> DriverResult<DomainState>;
    async fn revert_snapshot(&self, domain: &DomainSpec, name: &str) -> DriverResult<DomainState>;
}

#[async_trait]
pub trait NetworkDriver: Send + Sync {
    async fn create(&self, network: &NetworkSpec) -> DriverResult<NetworkInfo>;
    async fn delete(&self, network: &NetworkSpec) -> DriverResult<()>;
    async fn enable(&self, network: &NetworkSpec) -> DriverResult<NetworkInfo>;
    async fn disable(&self, network: &NetworkSpec) -> DriverResult<NetworkInfo>;
    async fn query_state(&self, network: &NetworkSpec) -> DriverResult<NetworkInfo>;
}
