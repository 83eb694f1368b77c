use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Context, require_space, usable_storage};
use crate::bus::{Command, Failure, Handler, Queue, queue, serve};
use crate::error::{Error, Result};
use crate::executor::{VolumeCommand, VolumeInfo, VolumeReply, VolumeSpec};
use crate::model::{
    Attachment, DiskSource, PowerState, Storage, Volume, VolumeFormat, VolumePatch, VolumeStatus,
    require_status,
};
use crate::reconcile::{Monitor, TickReport};
use crate::store::Repository;

/// Continuations of volume commands.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command_name", content = "payload", rename_all = "snake_case")]
pub enum VolumeTask {
    Create { volume_id: String },
    Extend { volume_id: String, new_size: u64 },
    Delete { volume_id: String },
}

impl Command for VolumeTask {
    fn name(&self) -> &'static str {
        match self {
            VolumeTask::Create { .. } => "create",
            VolumeTask::Extend { .. } => "extend",
            VolumeTask::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateVolume {
    pub name: String,
    pub storage_id: String,
    pub format: VolumeFormat,
    pub size: u64,
    pub user_id: String,
    pub description: String,
    pub read_only: bool,
}

/// Fields `edit` may change; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct EditVolume {
    pub name: Option<String>,
    pub description: Option<String>,
    pub read_only: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct VolumeFilter {
    pub storage_id: Option<String>,
    /// Only volumes without attachments.
    pub free_only: bool,
}

/// What a hypervisor needs to plug an attached volume in.
#[derive(Debug, Clone, Serialize)]
pub struct AttachInfo {
    pub attachment: Attachment,
    pub path: String,
    pub size: u64,
    pub format: VolumeFormat,
    pub read_only: bool,
}

fn volume_spec(volume: &Volume, storage: &Storage) -> VolumeSpec {
    VolumeSpec {
        id: volume.id.clone(),
        format: volume.format,
        size: volume.size,
        kind: storage.kind(),
        mount_point: storage.mount_point.clone().unwrap_or_default(),
        path: volume.path.clone(),
    }
}

#[derive(Clone)]
pub struct VolumeManager {
    ctx: Context,
    tasks: Queue<VolumeTask, ()>,
}

impl VolumeManager {
    pub fn spawn(ctx: Context) -> (Self, JoinHandle<()>) {
        let (tasks, inbox) = queue("volume.tasks");
        let worker = serve(inbox, Arc::new(VolumeWorker { ctx: ctx.clone() }));
        (Self { ctx, tasks }, worker)
    }

    pub async fn get(&self, id: &str) -> Result<Volume> {
        let mut uow = self.ctx.store.begin().await?;
        uow.volumes().get(id).await
    }

    pub async fn list(&self, filter: &VolumeFilter) -> Result<Vec<Volume>> {
        let mut uow = self.ctx.store.begin().await?;
        let volumes = match &filter.storage_id {
            Some(storage_id) => uow.volumes().list_by_storage(storage_id).await?,
            None => uow.volumes().get_all().await?,
        };
        Ok(volumes
            .into_iter()
            .filter(|v| !filter.free_only || v.attachments.is_empty())
            .collect())
    }

    /// Persist a new volume and schedule its creation on the backend.
    ///
    /// Returns the record in status `new`; the continuation moves it on.
    pub async fn create(&self, request: CreateVolume) -> Result<Volume> {
        if request.name.trim().is_empty() {
            return Err(Error::InvalidArgument("volume name must not be empty".into()));
        }
        if request.size == 0 {
            return Err(Error::InvalidArgument("volume size must be positive".into()));
        }

        let mut uow = self.ctx.store.begin().await?;
        let storage = uow.storages().get(&request.storage_id).await?;
        usable_storage(Some(&storage), &storage.id)?;
        if uow
            .volumes()
            .find_by_name(&request.storage_id, &request.name)
            .await?
            .is_some()
        {
            return Err(Error::already_exists("volume", request.name));
        }

        let mut volume = Volume::new(
            request.name,
            request.format,
            request.size,
            request.storage_id,
            request.user_id,
        );
        volume.description = request.description;
        volume.read_only = request.read_only;
        uow.volumes().add(&volume).await?;
        uow.commit().await?;

        info!(volume_id = %volume.id, name = %volume.name, size = volume.size, "Volume inserted");
        self.ctx.events.add_event(
            &volume.id,
            &volume.user_id,
            "create_volume",
            "Volume successfully inserted into db.",
        );
        self.tasks.cast(VolumeTask::Create {
            volume_id: volume.id.clone(),
        });
        Ok(volume)
    }

    /// Grow a volume. Only `available` volumes can be extended, and only
    /// to a larger size.
    pub async fn extend(&self, id: &str, new_size: u64, user_id: &str) -> Result<Volume> {
        let mut uow = self.ctx.store.begin().await?;
        let mut volume = uow.volumes().get(id).await?;
        require_status(id, volume.status, &[VolumeStatus::Available])?;
        if new_size <= volume.size {
            return Err(Error::InvalidArgument(format!(
                "new size {new_size} must be greater than current size {}",
                volume.size
            )));
        }
        uow.volumes()
            .transition(id, &[VolumeStatus::Available], VolumeStatus::Extending, None)
            .await?;
        uow.commit().await?;
        volume.status = VolumeStatus::Extending;

        self.ctx.events.add_event(
            id,
            user_id,
            "extend_volume",
            format!("Volume extension to {new_size} bytes requested."),
        );
        self.tasks.cast(VolumeTask::Extend {
            volume_id: id.to_string(),
            new_size,
        });
        Ok(volume)
    }

    /// Remove a volume that is not attached to any VM.
    pub async fn delete(&self, id: &str, user_id: &str) -> Result<Volume> {
        let mut uow = self.ctx.store.begin().await?;
        let mut volume = uow.volumes().get(id).await?;
        let removable = [VolumeStatus::Available, VolumeStatus::Error];
        require_status(id, volume.status, &removable)?;
        if !volume.attachments.is_empty() {
            return Err(Error::HasAttachments {
                entity: "volume",
                id: id.to_string(),
                vms: volume.attached_vm_ids().join(", "),
            });
        }
        uow.volumes()
            .transition(id, &removable, VolumeStatus::Deleting, None)
            .await?;
        uow.commit().await?;
        volume.status = VolumeStatus::Deleting;

        self.ctx
            .events
            .add_event(id, user_id, "delete_volume", "Volume deletion requested.");
        self.tasks.cast(VolumeTask::Delete {
            volume_id: id.to_string(),
        });
        Ok(volume)
    }

    pub async fn edit(&self, id: &str, changes: EditVolume, user_id: &str) -> Result<Volume> {
        let mut uow = self.ctx.store.begin().await?;
        let volume = uow.volumes().get(id).await?;
        require_status(id, volume.status, &[VolumeStatus::Available])?;

        let name = changes.name.unwrap_or_else(|| volume.name.clone());
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument("volume name must not be empty".into()));
        }
        if name != volume.name
            && uow
                .volumes()
                .find_by_name(&volume.storage_id, &name)
                .await?
                .is_some()
        {
            return Err(Error::already_exists("volume", name));
        }
        let description = changes
            .description
            .unwrap_or_else(|| volume.description.clone());
        let read_only = changes.read_only.unwrap_or(volume.read_only);

        uow.volumes().edit(id, &name, &description, read_only).await?;
        let edited = uow.volumes().get(id).await?;
        uow.commit().await?;

        self.ctx
            .events
            .add_event(id, user_id, "edit_volume", "Volume successfully edited.");
        Ok(edited)
    }

    /// Attach an `available` volume to a VM.
    ///
    /// The backend is asked for the volume's current path and size; if it
    /// cannot answer, the volume is moved to `error` and nothing is attached.
    pub async fn attach(
        &self,
        id: &str,
        vm_id: &str,
        target: Option<String>,
        user_id: &str,
    ) -> Result<AttachInfo> {
        let (volume, storage) = {
            let mut uow = self.ctx.store.begin().await?;
            let volume = uow.volumes().get(id).await?;
            require_status(id, volume.status, &[VolumeStatus::Available])?;
            uow.vms().get(vm_id).await?;
            if volume.attachments.iter().any(|a| a.vm_id == vm_id) {
                return Err(Error::already_exists("attachment", format!("{id}/{vm_id}")));
            }
            let storage = uow.storages().find(&volume.storage_id).await?;
            (volume, storage)
        };

        let info = match self.query(&volume, storage.as_ref()).await {
            Ok(info) => info,
            Err(e) => {
                let message = format!("Error while attaching volume: {e}");
                self.ctx.report(id, user_id, "attach_volume", &e);
                let mut uow = self.ctx.store.begin().await?;
                uow.volumes()
                    .transition(
                        id,
                        &[VolumeStatus::Available],
                        VolumeStatus::Error,
                        Some(&message),
                    )
                    .await?;
                uow.commit().await?;
                return Err(e);
            }
        };

        let attachment = Attachment::new(id, vm_id, target);
        let mut uow = self.ctx.store.begin().await?;
        let current = uow.volumes().get(id).await?;
        require_status(id, current.status, &[VolumeStatus::Available])?;
        uow.volumes().add_attachment(&attachment).await?;
        uow.commit().await?;

        info!(volume_id = %id, vm_id = %vm_id, path = %info.path, "Volume attached");
        self.ctx
            .events
            .add_event(id, user_id, "attach_volume", format!("Volume attached to VM {vm_id}."));
        Ok(AttachInfo {
            attachment,
            path: info.path,
            size: info.size,
            format: volume.format,
            read_only: volume.read_only,
        })
    }

    /// Remove the VM's attachments of this volume and refresh `used`.
    pub async fn detach(&self, id: &str, vm_id: &str, user_id: &str) -> Result<Volume> {
        let mut uow = self.ctx.store.begin().await?;
        let volume = uow.volumes().get(id).await?;
        require_status(
            id,
            volume.status,
            &[VolumeStatus::Available, VolumeStatus::Error],
        )?;
        let removed = uow.volumes().remove_attachments(id, vm_id).await?;
        uow.vms()
            .remove_disks_of(vm_id, DiskSource::Volume, id)
            .await?;
        let storage = uow.storages().find(&volume.storage_id).await?;
        uow.commit().await?;
        debug!(volume_id = %id, vm_id = %vm_id, removed, "Attachments removed");

        match self.query(&volume, storage.as_ref()).await {
            Ok(info) => {
                let mut uow = self.ctx.store.begin().await?;
                uow.volumes().set_used(id, info.used.min(volume.size)).await?;
                uow.commit().await?;
            }
            Err(e) => warn!(volume_id = %id, error = %e, "Could not refresh usage after detach"),
        }

        self.ctx
            .events
            .add_event(id, user_id, "detach_volume", format!("Volume detached from VM {vm_id}."));
        self.get(id).await
    }

    async fn query(&self, volume: &Volume, storage: Option<&Storage>) -> Result<VolumeInfo> {
        let storage = usable_storage(storage, &volume.storage_id)?;
        self.ctx
            .executors
            .volumes
            .call(
                VolumeCommand::QueryInfo {
                    volume: volume_spec(volume, &storage),
                },
                self.ctx.config.call_timeout,
            )
            .await?
            .into_info()
    }
}

/// Reconciler correction for one volume.
///
/// Stable volumes are declared `available` with the observed size; volumes
/// with an operation in flight keep their status and message and only get
/// their usage refreshed.
fn correction(volume: &Volume, info: &VolumeInfo) -> VolumePatch {
    match volume.status {
        VolumeStatus::Available | VolumeStatus::Error => VolumePatch {
            id: volume.id.clone(),
            expected_status: volume.status,
            status: VolumeStatus::Available,
            size: Some(info.size),
            used: Some(info.used.min(info.size)),
            information: String::new(),
        },
        status => VolumePatch {
            id: volume.id.clone(),
            expected_status: status,
            status,
            size: None,
            used: Some(info.used.min(volume.size)),
            information: volume.information.clone(),
        },
    }
}

#[async_trait]
impl Monitor for VolumeManager {
    fn name(&self) -> &'static str {
        "volume"
    }

    async fn tick(&self) -> Result<TickReport> {
        let (volumes, storages) = {
            let mut uow = self.ctx.store.begin().await?;
            let volumes = uow.volumes().get_all().await?;
            let storages: HashMap<String, Storage> = uow
                .storages()
                .get_all()
                .await?
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect();
            (volumes, storages)
        };

        let mut report = TickReport::default();
        let mut patches = Vec::new();
        for volume in &volumes {
            if !VolumeStatus::MONITORED.contains(&volume.status) {
                debug!(volume_id = %volume.id, status = %volume.status, "Volume not monitored in this status");
                report.skipped += 1;
                continue;
            }
            let storage = match usable_storage(storages.get(&volume.storage_id), &volume.storage_id)
            {
                Ok(storage) => storage,
                Err(e) => {
                    debug!(volume_id = %volume.id, reason = %e, "Skipping volume");
                    report.skipped += 1;
                    continue;
                }
            };

            report.checked += 1;
            let reply = self
                .ctx
                .executors
                .volumes
                .call(
                    VolumeCommand::QueryInfo {
                        volume: volume_spec(volume, &storage),
                    },
                    self.ctx.config.call_timeout,
                )
                .await
                .and_then(|r| r.into_info());
            match reply {
                Ok(info) => patches.push(correction(volume, &info)),
                Err(e) => {
                    warn!(volume_id = %volume.id, error = %e, "Volume query failed");
                    report.failed += 1;
                }
            }
        }

        let mut uow = self.ctx.store.begin().await?;
        report.corrected = uow.volumes().bulk_update(&patches).await?;
        uow.commit().await?;
        debug!(?report, "Volume monitor tick");
        Ok(report)
    }
}

struct VolumeWorker {
    ctx: Context,
}

#[async_trait]
impl Handler<VolumeTask, ()> for VolumeWorker {
    async fn handle(&self, task: VolumeTask) -> std::result::Result<(), Failure> {
        let result = match task {
            VolumeTask::Create { volume_id } => self.create(&volume_id).await,
            VolumeTask::Extend {
                volume_id,
                new_size,
            } => self.extend(&volume_id, new_size).await,
            VolumeTask::Delete { volume_id } => self.delete(&volume_id).await,
        };
        result.map_err(Failure::from)
    }
}

impl VolumeWorker {
    /// Move the volume from `from` to `to` with `message`, then record `err`.
    async fn settle(
        &self,
        volume: &Volume,
        from: VolumeStatus,
        to: VolumeStatus,
        action: &str,
        err: Error,
    ) -> Error {
        self.ctx.report(&volume.id, &volume.user_id, action, &err);
        let message = err.to_string();
        let persisted = async {
            let mut uow = self.ctx.store.begin().await?;
            uow.volumes()
                .transition(&volume.id, &[from], to, Some(&message))
                .await?;
            uow.commit().await
        }
        .await;
        if let Err(e) = persisted {
            warn!(volume_id = %volume.id, error = %e, "Could not persist volume failure");
        }
        err
    }

    async fn call(&self, command: VolumeCommand) -> Result<VolumeInfo> {
        self.ctx
            .executors
            .volumes
            .call(command, self.ctx.config.call_timeout)
            .await?
            .into_info()
    }

    async fn create(&self, id: &str) -> Result<()> {
        let (volume, storage) = {
            let mut uow = self.ctx.store.begin().await?;
            let volume = uow.volumes().get(id).await?;
            let storage = uow.storages().find(&volume.storage_id).await?;
            uow.volumes()
                .transition(id, &[VolumeStatus::New], VolumeStatus::Creating, None)
                .await?;
            uow.commit().await?;
            (volume, storage)
        };

        let outcome = async {
            let storage = usable_storage(storage.as_ref(), &volume.storage_id)?;
            require_space(&storage, volume.size)?;
            self.call(VolumeCommand::Create {
                volume: volume_spec(&volume, &storage),
            })
            .await
        }
        .await;

        let info = match outcome {
            Ok(info) => info,
            Err(e) => {
                return Err(self
                    .settle(&volume, VolumeStatus::Creating, VolumeStatus::Error, "create_volume", e)
                    .await);
            }
        };

        let mut uow = self.ctx.store.begin().await?;
        uow.volumes()
            .set_usage(id, info.size, info.used.min(info.size), Some(&info.path))
            .await?;
        uow.volumes()
            .transition(id, &[VolumeStatus::Creating], VolumeStatus::Available, Some(""))
            .await?;
        uow.commit().await?;

        info!(volume_id = %id, path = %info.path, size = info.size, "Volume created");
        self.ctx.events.add_event(
            id,
            &volume.user_id,
            "create_volume",
            "Volume successfully created.",
        );
        Ok(())
    }

    async fn extend(&self, id: &str, new_size: u64) -> Result<()> {
        let (volume, storage, vms) = {
            let mut uow = self.ctx.store.begin().await?;
            let volume = uow.volumes().get(id).await?;
            let storage = uow.storages().find(&volume.storage_id).await?;
            let mut vms = Vec::new();
            for vm_id in volume.attached_vm_ids() {
                if let Some(vm) = uow.vms().find(vm_id).await? {
                    vms.push(vm);
                }
            }
            (volume, storage, vms)
        };

        let storage = match usable_storage(storage.as_ref(), &volume.storage_id) {
            Ok(storage) => storage,
            Err(e) => {
                return Err(self
                    .settle(&volume, VolumeStatus::Extending, VolumeStatus::Error, "extend_volume", e)
                    .await);
            }
        };

        if let Some(vm) = vms.iter().find(|vm| vm.power_state != PowerState::ShutOff) {
            let err = Error::NotShutOff {
                vm_name: vm.name.clone(),
                power_state: vm.power_state.to_string(),
            };
            return Err(self
                .settle(
                    &volume,
                    VolumeStatus::Extending,
                    VolumeStatus::Available,
                    "extend_volume",
                    err,
                )
                .await);
        }

        let outcome = async {
            require_space(&storage, new_size.saturating_sub(volume.size))?;
            self.call(VolumeCommand::Extend {
                volume: volume_spec(&volume, &storage),
                new_size,
            })
            .await
        }
        .await;

        let info = match outcome {
            Ok(info) => info,
            Err(e) => {
                return Err(self
                    .settle(&volume, VolumeStatus::Extending, VolumeStatus::Error, "extend_volume", e)
                    .await);
            }
        };

        let size = info.size.max(new_size);
        let mut uow = self.ctx.store.begin().await?;
        uow.volumes()
            .set_usage(id, size, info.used.min(size), None)
            .await?;
        uow.volumes()
            .transition(id, &[VolumeStatus::Extending], VolumeStatus::Available, Some(""))
            .await?;
        uow.commit().await?;

        info!(volume_id = %id, size, "Volume extended");
        self.ctx.events.add_event(
            id,
            &volume.user_id,
            "extend_volume",
            format!("Volume successfully extended to {size} bytes."),
        );
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let (volume, storage) = {
            let mut uow = self.ctx.store.begin().await?;
            let volume = uow.volumes().get(id).await?;
            let storage = uow.storages().find(&volume.storage_id).await?;
            (volume, storage)
        };

        let outcome = match &storage {
            Some(storage) => {
                self.ctx
                    .executors
                    .volumes
                    .call(
                        VolumeCommand::Delete {
                            volume: volume_spec(&volume, storage),
                        },
                        self.ctx.config.call_timeout,
                    )
                    .await
            }
            None => {
                warn!(
                    volume_id = %id,
                    storage_id = %volume.storage_id,
                    "Storage is gone, removing the volume record only"
                );
                Ok(VolumeReply::Done)
            }
        };

        if let Err(e) = outcome {
            return Err(self
                .settle(&volume, VolumeStatus::Deleting, VolumeStatus::Error, "delete_volume", e)
                .await);
        }

        let mut uow = self.ctx.store.begin().await?;
        uow.volumes().delete(id).await?;
        uow.commit().await?;

        info!(volume_id = %id, "Volume deleted");
        self.ctx.events.add_event(
            id,
            &volume.user_id,
            "delete_volume",
            "Volume successfully deleted.",
        );
        Ok(())
    }
}
