//! Storage drivers that mount a backend under a local directory.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{info, warn};

use super::process::{run, run_optional};
use super::{DriverError, DriverResult, StorageDriver, StorageInfo, StorageSpec};
use crate::model::StorageBackend;

/// Parse `df -B1 --output=size,avail` into (size, available).
fn parse_df(output: &str) -> DriverResult<(u64, u64)> {
    let line = output
        .lines()
        .nth(1)
        .ok_or_else(|| DriverError::Parse(format!("df: {output:?}")))?;
    let mut fields = line.split_whitespace().map(str::parse::<u64>);
    match (fields.next(), fields.next()) {
        (Some(Ok(size)), Some(Ok(avail))) => Ok((size, avail)),
        _ => Err(DriverError::Parse(format!("df: {line:?}"))),
    }
}

async fn capacity(mount_point: &str) -> DriverResult<StorageInfo> {
    let output = run("df", &["-B1", "--output=size,avail", mount_point]).await?;
    let (size, available) = parse_df(&output)?;
    Ok(StorageInfo {
        size,
        available,
        mount_point: mount_point.to_string(),
    })
}

async fn is_mounted(mount_point: &str) -> DriverResult<bool> {
    Ok(run_optional("findmnt", &["-n", "--mountpoint", mount_point])
        .await?
        .is_some())
}

/// Mount directories live under a common root, one per storage id.
#[derive(Debug, Clone)]
struct MountRoot(PathBuf);

impl MountRoot {
    fn mount_point(&self, storage: &StorageSpec) -> String {
        storage
            .mount_point
            .clone()
            .unwrap_or_else(|| self.0.join(&storage.id).to_string_lossy().into_owned())
    }

    async fn prepare(&self, mount_point: &str) -> DriverResult<()> {
        tokio::fs::create_dir_all(mount_point).await?;
        Ok(())
    }

    async fn release(&self, storage: &StorageSpec) -> DriverResult<()> {
        let mount_point = self.mount_point(storage);
        if is_mounted(&mount_point).await? {
            run("umount", &[&mount_point]).await?;
        }
        if let Err(e) = tokio::fs::remove_dir(&mount_point).await {
            warn!(mount_point = %mount_point, error = %e, "Could not remove mount directory");
        }
        info!(storage_id = %storage.id, mount_point = %mount_point, "Storage unmounted");
        Ok(())
    }

    async fn query(&self, storage: &StorageSpec) -> DriverResult<StorageInfo> {
        let mount_point = self.mount_point(storage);
        if !is_mounted(&mount_point).await? {
            return Err(DriverError::NotFound(format!("{mount_point} is not mounted")));
        }
        capacity(&mount_point).await
    }
}

/// Block device formatted on first use and mounted locally.
#[derive(Debug, Clone)]
pub struct LocalFsStorage {
    root: MountRoot,
}

impl LocalFsStorage {
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        Self {
            root: MountRoot(mount_root.into()),
        }
    }
}

#[async_trait]
impl StorageDriver for LocalFsStorage {
    async fn create(&self, storage: &StorageSpec) -> DriverResult<StorageInfo> {
        let StorageBackend::LocalFs { device, fs_type } = &storage.backend else {
            return Err(DriverError::Unsupported(format!(
                "{} backend on localfs driver",
                storage.backend.kind()
            )));
        };
        let mount_point = self.root.mount_point(storage);
        self.root.prepare(&mount_point).await?;

        let existing = run_optional("blkid", &["-o", "value", "-s", "TYPE", device]).await?;
        if existing.as_deref().map(str::trim).unwrap_or_default().is_empty() {
            info!(device = %device, fs_type = %fs_type, "Formatting device");
            run("mkfs", &["-t", fs_type, device]).await?;
        }

        if !is_mounted(&mount_point).await? {
            run("mount", &[device, &mount_point]).await?;
        }
        info!(storage_id = %storage.id, device = %device, mount_point = %mount_point, "Storage mounted");
        capacity(&mount_point).await
    }

    async fn delete(&self, storage: &StorageSpec) -> DriverResult<()> {
        self.root.release(storage).await
    }

    async fn query_info(&self, storage: &StorageSpec) -> DriverResult<StorageInfo> {
        self.root.query(storage).await
    }
}

/// NFS export mounted locally.
#[derive(Debug, Clone)]
pub struct NfsStorage {
    root: MountRoot,
}

impl NfsStorage {
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        Self {
            root: MountRoot(mount_root.into()),
        }
    }
}

#[async_trait]
impl StorageDriver for NfsStorage {
    async fn create(&self, storage: &StorageSpec) -> DriverResult<StorageInfo> {
        let StorageBackend::Nfs { ip, path } = &storage.backend else {
            return Err(DriverError::Unsupported(format!(
                "{} backend on nfs driver",
                storage.backend.kind()
            )));
        };
        let mount_point = self.root.mount_point(storage);
        self.root.prepare(&mount_point).await?;

        if !is_mounted(&mount_point).await? {
            let export = format!("{ip}:{path}");
            run("mount", &["-t", "nfs", &export, &mount_point]).await?;
        }
        info!(storage_id = %storage.id, ip = %ip, path = %path, "NFS export mounted");
        capacity(&mount_point).await
    }

    async fn delete(&self, storage: &StorageSpec) -> DriverResult<()> {
        self.root.release(storage).await
    }

    async fn query_info(&self, storage: &StorageSpec) -> DriverResult<StorageInfo> {
        self.root.query(storage).await
    }
}
