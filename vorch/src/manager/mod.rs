//! Service layer managers, one per entity kind.
//!
//! A manager validates a request against the entity's status machine,
//! persists the transitional status, and hands the slow part to its own
//! continuation queue. The continuation worker calls the executor and
//! persists the outcome. Each manager is also a [`Monitor`] that the
//! reconciliation loop drives.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::error;
use vorch_log::EventLogger;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::Executors;
use crate::model::Storage;
use crate::reconcile::{self, Monitor, MonitorHandle};
use crate::store::Store;

mod image;
mod network;
mod snapshot;
mod storage;
mod vm;
mod volume;

pub use image::{ImageAttachInfo, ImageManager, ImageTask, UploadImage};
pub use network::{CreateNetwork, NetworkManager, NetworkTask};
pub use snapshot::CreateSnapshot;
pub use storage::{CreateStorage, StorageManager, StorageTask};
pub use vm::{CreateVm, DiskRequest, EditVm, InterfaceRequest, VmManager, VmTask};
pub use volume::{AttachInfo, CreateVolume, EditVolume, VolumeFilter, VolumeManager, VolumeTask};

/// Everything a manager needs from the outside.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<Store>,
    pub executors: Executors,
    pub events: EventLogger,
    pub config: Config,
}

impl Context {
    fn for_component(&self, component: &str) -> Self {
        Self {
            events: self.events.for_component(component),
            ..self.clone()
        }
    }

    /// Log and record a failed action.
    fn report(&self, object_id: &str, user_id: &str, action: &str, err: &Error) {
        error!(
            component = self.events.component(),
            object_id,
            action,
            kind = err.kind(),
            error = %err,
            "Operation failed"
        );
        self.events.add_failure(object_id, user_id, action, err.to_string());
    }
}

/// Storage a volume or image can be placed on, or `StorageUnavailable`.
fn usable_storage(storage: Option<&Storage>, storage_id: &str) -> Result<Storage> {
    let unavailable = |reason: String| Error::StorageUnavailable {
        storage_id: storage_id.to_string(),
        reason,
    };
    let storage = storage.ok_or_else(|| unavailable("not found".into()))?;
    if !storage.is_available() {
        return Err(unavailable(format!("status is {}", storage.status)));
    }
    if storage.mount_point.is_none() {
        return Err(unavailable("not mounted".into()));
    }
    Ok(storage.clone())
}

fn require_space(storage: &Storage, requested: u64) -> Result<()> {
    if requested >= storage.available {
        return Err(Error::InsufficientSpace {
            storage_id: storage.id.clone(),
            requested,
            available: storage.available,
        });
    }
    Ok(())
}

/// All managers with their continuation workers running.
pub struct Managers {
    pub volumes: VolumeManager,
    pub storages: StorageManager,
    pub images: ImageManager,
    pub vms: VmManager,
    pub networks: NetworkManager,
    workers: Vec<JoinHandle<()>>,
}

impl Managers {
    pub fn start(ctx: Context) -> Self {
        let (volumes, volume_worker) = VolumeManager::spawn(ctx.for_component("volume"));
        let (storages, storage_worker) = StorageManager::spawn(ctx.for_component("storage"));
        let (images, image_worker) = ImageManager::spawn(ctx.for_component("image"));
        let (vms, vm_worker) =
            VmManager::spawn(ctx.for_component("vm"), volumes.clone(), images.clone());
        let (networks, network_worker) = NetworkManager::spawn(ctx.for_component("network"));

        Self {
            volumes,
            storages,
            images,
            vms,
            networks,
            workers: vec![
                volume_worker,
                storage_worker,
                image_worker,
                vm_worker,
                network_worker,
            ],
        }
    }

    /// Start one reconciliation loop per manager.
    pub fn spawn_monitors(&self, config: &Config) -> Vec<MonitorHandle> {
        let monitors: Vec<Arc<dyn Monitor>> = vec![
            Arc::new(self.storages.clone()),
            Arc::new(self.volumes.clone()),
            Arc::new(self.images.clone()),
            Arc::new(self.vms.clone()),
            Arc::new(self.networks.clone()),
        ];
        monitors
            .into_iter()
            .map(|m| reconcile::spawn(m, config.monitor_interval, config.tick_budget))
            .collect()
    }

    /// Drop the managers and wait for their workers to drain.
    pub async fn shutdown(self) {
        let Managers {
            volumes,
            storages,
            images,
            vms,
            networks,
            workers,
        } = self;
        drop((volumes, storages, images, vms, networks));
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Manager worker panicked");
            }
        }
    }
}
