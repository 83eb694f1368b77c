//! SQLite persistence: the shared store, units of work and per-entity
//! repositories.
//!
//! Every read and write goes through a [`UnitOfWork`]. It wraps one SQLite
//! transaction; [`UnitOfWork::commit`] makes the work durable and dropping
//! it without committing rolls everything back, so an early `?` return never
//! leaves half-written state behind.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Status, join, timestamp};

mod images;
mod networks;
mod snapshots;
mod storages;
mod vms;
mod volumes;

pub use images::ImageRepo;
pub use networks::NetworkRepo;
pub use snapshots::SnapshotRepo;
pub use storages::StorageRepo;
pub use vms::VmRepo;
pub use volumes::VolumeRepo;

/// Repository contract shared by every entity kind.
#[async_trait]
pub trait Repository: Send {
    type Entity: Send + Sync;
    type Patch: Send + Sync;
    type Status: Status;

    async fn find(&mut self, id: &str) -> Result<Option<Self::Entity>>;

    /// Like [`find`](Self::find) but a missing entity is an error.
    async fn get(&mut self, id: &str) -> Result<Self::Entity> {
        self.find(id)
            .await?
            .ok_or_else(|| Error::not_found(<Self::Status as Status>::ENTITY, id))
    }

    async fn get_all(&mut self) -> Result<Vec<Self::Entity>>;

    async fn add(&mut self, entity: &Self::Entity) -> Result<()>;

    /// Remove the entity. Returns false if it did not exist.
    async fn delete(&mut self, id: &str) -> Result<bool>;

    /// Apply reconciler corrections. Each patch only touches its entity if
    /// the entity is still in the status the patch was computed from.
    /// Returns the number of patches applied.
    async fn bulk_update(&mut self, patches: &[Self::Patch]) -> Result<u64>;

    /// Move the entity from any of `from` to `to`. `information`, when
    /// given, replaces the stored message.
    ///
    /// Fails with `StatusConflict` if the entity is no longer in `from`.
    async fn transition(
        &mut self,
        id: &str,
        from: &[Self::Status],
        to: Self::Status,
        information: Option<&str>,
    ) -> Result<()>;
}

/// Shared SQLite store.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) `<data_dir>/vorch.db`.
    pub async fn open(data_dir: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{data_dir}/vorch.db"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store on a single pinned connection (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Store schema ready");
        Ok(())
    }

    /// Start a unit of work.
    pub async fn begin(&self) -> Result<UnitOfWork> {
        Ok(UnitOfWork {
            tx: self.pool.begin().await?,
        })
    }
}

/// One transaction over all repositories.
pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
}

impl UnitOfWork {
    pub fn volumes(&mut self) -> VolumeRepo<'_> {
        VolumeRepo::new(&mut *self.tx)
    }

    pub fn storages(&mut self) -> StorageRepo<'_> {
        StorageRepo::new(&mut *self.tx)
    }

    pub fn images(&mut self) -> ImageRepo<'_> {
        ImageRepo::new(&mut *self.tx)
    }

    pub fn vms(&mut self) -> VmRepo<'_> {
        VmRepo::new(&mut *self.tx)
    }

    pub fn snapshots(&mut self) -> SnapshotRepo<'_> {
        SnapshotRepo::new(&mut *self.tx)
    }

    pub fn networks(&mut self) -> NetworkRepo<'_> {
        NetworkRepo::new(&mut *self.tx)
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Conditional status update shared by all repositories.
pub(crate) async fn transition<S: Status>(
    conn: &mut SqliteConnection,
    table: &str,
    id: &str,
    from: &[S],
    to: S,
    information: Option<&str>,
) -> Result<()> {
    if let Some(bad) = from.iter().find(|s| !s.allows(to)) {
        return Err(Error::Internal(format!(
            "illegal {} transition {bad} -> {to}",
            S::ENTITY
        )));
    }

    let placeholders = vec!["?"; from.len()].join(", ");
    let sql = format!(
        "UPDATE {table} SET status = ?, information = COALESCE(?, information), updated_at = ? \
         WHERE id = ? AND status IN ({placeholders})"
    );
    let mut query = sqlx::query(&sql)
        .bind(to.as_str())
        .bind(information)
        .bind(timestamp())
        .bind(id);
    for status in from {
        query = query.bind(status.as_str());
    }

    let result = query.execute(&mut *conn).await?;
    if result.rows_affected() == 0 {
        return Err(Error::StatusConflict {
            entity: S::ENTITY,
            id: id.to_string(),
            expected: join(from),
        });
    }
    debug!(entity = S::ENTITY, id, to = %to, "Status transition");
    Ok(())
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS storages (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        spec TEXT NOT NULL,
        status TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        available INTEGER NOT NULL DEFAULT 0,
        mount_point TEXT,
        user_id TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        information TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS volumes (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        format TEXT NOT NULL,
        size INTEGER NOT NULL,
        used INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        storage_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        read_only INTEGER NOT NULL DEFAULT 0,
        description TEXT NOT NULL DEFAULT '',
        information TEXT NOT NULL DEFAULT '',
        path TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (storage_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS volume_attachments (
        id TEXT PRIMARY KEY,
        volume_id TEXT NOT NULL REFERENCES volumes(id) ON DELETE CASCADE,
        vm_id TEXT NOT NULL,
        target TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_volume_attachments_vm ON volume_attachments(vm_id)",
    r#"
    CREATE TABLE IF NOT EXISTS images (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        format TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        storage_id TEXT NOT NULL,
        source TEXT NOT NULL,
        path TEXT,
        user_id TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        information TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS image_attachments (
        id TEXT PRIMARY KEY,
        image_id TEXT NOT NULL REFERENCES images(id) ON DELETE CASCADE,
        vm_id TEXT NOT NULL,
        target TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vms (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        cpu INTEGER NOT NULL,
        ram_mb INTEGER NOT NULL,
        power_state TEXT NOT NULL,
        status TEXT NOT NULL,
        user_id TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        information TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vm_disks (
        id TEXT PRIMARY KEY,
        vm_id TEXT NOT NULL REFERENCES vms(id) ON DELETE CASCADE,
        source TEXT NOT NULL,
        source_id TEXT NOT NULL,
        target TEXT,
        path TEXT NOT NULL,
        size INTEGER NOT NULL,
        format TEXT NOT NULL,
        read_only INTEGER NOT NULL DEFAULT 0,
        position INTEGER NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vm_interfaces (
        id TEXT PRIMARY KEY,
        vm_id TEXT NOT NULL REFERENCES vms(id) ON DELETE CASCADE,
        network_id TEXT NOT NULL,
        bridge TEXT NOT NULL,
        mac TEXT NOT NULL UNIQUE,
        model TEXT NOT NULL,
        position INTEGER NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_vm_interfaces_network ON vm_interfaces(network_id)",
    r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        id TEXT PRIMARY KEY,
        vm_id TEXT NOT NULL REFERENCES vms(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        parent_id TEXT,
        status TEXT NOT NULL,
        is_current INTEGER NOT NULL DEFAULT 0,
        information TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (vm_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS networks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        bridge TEXT NOT NULL,
        state TEXT NOT NULL,
        status TEXT NOT NULL,
        user_id TEXT NOT NULL,
        information TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];
