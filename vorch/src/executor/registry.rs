use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::{
    DomainDriver, DriverError, DriverResult, ImageDriver, IpBridges, LocalFsStorage,
    NetworkDriver, NfsStorage, QemuImages, QemuVolumes, StorageDriver, VirshDomains,
    VolumeDriver,
};
use crate::model::StorageKind;

/// Drivers available to the executors.
///
/// Volume, storage and image drivers are keyed by the storage backend kind;
/// domains and networks have one driver each.
#[derive(Default)]
pub struct DriverRegistry {
    volumes: HashMap<StorageKind, Arc<dyn VolumeDriver>>,
    storages: HashMap<StorageKind, Arc<dyn StorageDriver>>,
    images: HashMap<StorageKind, Arc<dyn ImageDriver>>,
    domains: Option<Arc<dyn DomainDriver>>,
    networks: Option<Arc<dyn NetworkDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drivers that shell out to the host's tools.
    pub fn host(mount_root: &Path, libvirt_uri: &str, definitions: &Path) -> Self {
        let files = Arc::new(QemuVolumes);
        let images = Arc::new(QemuImages);
        Self::new()
            .with_storage_driver(StorageKind::LocalFs, Arc::new(LocalFsStorage::new(mount_root)))
            .with_storage_driver(StorageKind::Nfs, Arc::new(NfsStorage::new(mount_root)))
            .with_volume_driver(StorageKind::LocalFs, files.clone())
            .with_volume_driver(StorageKind::Nfs, files)
            .with_image_driver(StorageKind::LocalFs, images.clone())
            .with_image_driver(StorageKind::Nfs, images)
            .with_domain_driver(Arc::new(VirshDomains::new(libvirt_uri, definitions)))
            .with_network_driver(Arc::new(IpBridges))
    }

    pub fn with_volume_driver(mut self, kind: StorageKind, driver: Arc<dyn VolumeDriver>) -> Self {
        self.volumes.insert(kind, driver);
        self
    }

    pub fn with_storage_driver(
        mut self,
        kind: StorageKind,
        driver: Arc<dyn StorageDriver>,
    ) -> Self {
        self.storages.insert(kind, driver);
        self
    }

    pub fn with_image_driver(mut self, kind: StorageKind, driver: Arc<dyn ImageDriver>) -> Self {
        self.images.insert(kind, driver);
        self
    }

    pub fn with_domain_driver(mut self, driver: Arc<dyn DomainDriver>) -> Self {
        self.domains = Some(driver);
        self
    }

    pub fn with_network_driver(mut self, driver: Arc<dyn NetworkDriver>) -> Self {
        self.networks = Some(driver);
        self
    }

    pub fn volume(&self, kind: StorageKind) -> DriverResult<&dyn VolumeDriver> {
        self.volumes
            .get(&kind)
            .map(|d| d.as_ref())
            .ok_or_else(|| unsupported("volume", kind))
    }

    pub fn storage(&self, kind: StorageKind) -> DriverResult<&dyn StorageDriver> {
        self.storages
            .get(&kind)
            .map(|d| d.as_ref())
            .ok_or_else(|| unsupported("storage", kind))
    }

    pub fn image(&self, kind: StorageKind) -> DriverResult<&dyn ImageDriver> {
        self.images
            .get(&kind)
            .map(|d| d.as_ref())
            .ok_or_else(|| unsupported("image", kind))
    }

    pub fn domain(&self) -> DriverResult<&dyn DomainDriver> {
        self.domains
            .as_deref()
            .ok_or_else(|| DriverError::Unsupported("no domain driver registered".into()))
    }

    pub fn network(&self) -> DriverResult<&dyn NetworkDriver> {
        self.networks
            .as_deref()
            .ok_or_else(|| DriverError::Unsupported("no network driver registered".into()))
    }
}

fn unsupported(what: &str, kind: StorageKind) -> DriverError {
    DriverError::Unsupported(format!("no {what} driver for {kind} storage"))
}
