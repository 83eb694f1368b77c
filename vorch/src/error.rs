//! Error types shared by every manager.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by managers, the store and the command bus.
///
/// Variants fall into the groups the managers react to differently:
/// preconditions are raised before anything is written, execution failures
/// are raised after the entity has been moved to `error`.
#[derive(Debug, Error)]
pub enum Error {
    /// Entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Name already taken within its scope.
    #[error("{entity} with name {name:?} already exists")]
    AlreadyExists { entity: &'static str, name: String },

    /// Malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not allowed in the entity's current status.
    #[error("{entity} {id} has status {status}, expected one of [{expected}]")]
    InvalidStatus {
        entity: &'static str,
        id: String,
        status: String,
        expected: String,
    },

    /// Entity is still attached and cannot be removed.
    #[error("{entity} {id} has attachments: {vms}")]
    HasAttachments {
        entity: &'static str,
        id: String,
        vms: String,
    },

    /// Entity still hosts other entities.
    #[error("{entity} {id} still has dependents: {dependents}")]
    HasDependents {
        entity: &'static str,
        id: String,
        dependents: String,
    },

    /// Per-VM snapshot limit reached.
    #[error("VM {vm_id} already has {limit} snapshots")]
    SnapshotLimit { vm_id: String, limit: usize },

    /// VM power state does not allow the operation.
    #[error("VM {vm_id} power state is {power_state}, expected {expected}")]
    PowerState {
        vm_id: String,
        power_state: String,
        expected: String,
    },

    /// An attached VM was not shut off when the backend was about to change.
    #[error("Vm {vm_name} power state is not shut off ({power_state}).")]
    NotShutOff {
        vm_name: String,
        power_state: String,
    },

    /// Parent storage missing or not available.
    #[error("storage {storage_id} is not available: {reason}")]
    StorageUnavailable { storage_id: String, reason: String },

    /// Parent storage cannot fit the request.
    #[error("not enough space on storage {storage_id}: requested {requested} bytes, {available} bytes available")]
    InsufficientSpace {
        storage_id: String,
        requested: u64,
        available: u64,
    },

    /// No reply from the executor within the call timeout.
    #[error("{command} on queue {queue} timed out after {after:?}")]
    ExecutionTimeout {
        queue: &'static str,
        command: String,
        after: Duration,
    },

    /// Executor returned a structured failure.
    #[error("{kind}: {message}")]
    ExecutionFailure { kind: String, message: String },

    /// A conditional status update lost its race.
    #[error("{entity} {id} changed status concurrently (expected one of [{expected}])")]
    StatusConflict {
        entity: &'static str,
        id: String,
        expected: String,
    },

    /// Queue worker is gone.
    #[error("queue {0} is closed")]
    QueueClosed(&'static str),

    #[error("store: {0}")]
    Store(#[from] sqlx::Error),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Stable, machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NotFound",
            Error::AlreadyExists { .. } => "AlreadyExists",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::InvalidStatus { .. } => "InvalidStatus",
            Error::HasAttachments { .. } => "HasAttachments",
            Error::HasDependents { .. } => "HasDependents",
            Error::SnapshotLimit { .. } => "SnapshotLimit",
            Error::PowerState { .. } => "PowerState",
            Error::NotShutOff { .. } => "NotShutOff",
            Error::StorageUnavailable { .. } => "StorageUnavailable",
            Error::InsufficientSpace { .. } => "InsufficientSpace",
            Error::ExecutionTimeout { .. } => "ExecutionTimeout",
            Error::ExecutionFailure { .. } => "ExecutionFailure",
            Error::StatusConflict { .. } => "StatusConflict",
            Error::QueueClosed(_) => "QueueClosed",
            Error::Store(_) => "Store",
            Error::Internal(_) => "Internal",
        }
    }

    /// True for errors raised before any state was written.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::AlreadyExists { .. }
                | Error::InvalidArgument(_)
                | Error::InvalidStatus { .. }
                | Error::HasAttachments { .. }
                | Error::HasDependents { .. }
                | Error::SnapshotLimit { .. }
                | Error::PowerState { .. }
        )
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn already_exists(entity: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            entity,
            name: name.into(),
        }
    }
}

/// Result type for vorch operations.
pub type Result<T> = std::result::Result<T, Error>;
