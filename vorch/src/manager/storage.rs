use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Context;
use crate::bus::{Command, Failure, Handler, Queue, queue, serve};
use crate::error::{Error, Result};
use crate::executor::{StorageCommand, StorageInfo, StorageSpec};
use crate::model::{Storage, StorageBackend, StoragePatch, StorageStatus, require_status};
use crate::reconcile::{Monitor, TickReport};
use crate::store::Repository;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command_name", content = "payload", rename_all = "snake_case")]
pub enum StorageTask {
    Create { storage_id: String },
    Delete { storage_id: String },
}

impl Command for StorageTask {
    fn name(&self) -> &'static str {
        match self {
            StorageTask::Create { .. } => "create",
            StorageTask::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateStorage {
    pub name: String,
    pub backend: StorageBackend,
    pub user_id: String,
    pub description: String,
}

fn storage_spec(storage: &Storage) -> StorageSpec {
    StorageSpec {
        id: storage.id.clone(),
        backend: storage.backend.clone(),
        mount_point: storage.mount_point.clone(),
    }
}

/// Owner of storage pools. Volumes and images only read storages.
#[derive(Clone)]
pub struct StorageManager {
    ctx: Context,
    tasks: Queue<StorageTask, ()>,
}

impl StorageManager {
    pub fn spawn(ctx: Context) -> (Self, JoinHandle<()>) {
        let (tasks, inbox) = queue("storage.tasks");
        let worker = serve(inbox, Arc::new(StorageWorker { ctx: ctx.clone() }));
        (Self { ctx, tasks }, worker)
    }

    pub async fn get(&self, id: &str) -> Result<Storage> {
        let mut uow = self.ctx.store.begin().await?;
        uow.storages().get(id).await
    }

    pub async fn list(&self) -> Result<Vec<Storage>> {
        let mut uow = self.ctx.store.begin().await?;
        uow.storages().get_all().await
    }

    pub async fn create(&self, request: CreateStorage) -> Result<Storage> {
        if request.name.trim().is_empty() {
            return Err(Error::InvalidArgument("storage name must not be empty".into()));
        }

        let mut uow = self.ctx.store.begin().await?;
        if uow.storages().find_by_name(&request.name).await?.is_some() {
            return Err(Error::already_exists("storage", request.name));
        }
        if let Some(existing) = uow.storages().find_by_backend(&request.backend).await? {
            return Err(Error::InvalidArgument(format!(
                "backend is already used by storage {}",
                existing.name
            )));
        }

        let mut storage = Storage::new(request.name, request.backend, request.user_id);
        storage.description = request.description;
        uow.storages().add(&storage).await?;
        uow.commit().await?;

        info!(storage_id = %storage.id, name = %storage.name, kind = %storage.kind(), "Storage inserted");
        self.ctx.events.add_event(
            &storage.id,
            &storage.user_id,
            "create_storage",
            "Storage successfully inserted into db.",
        );
        self.tasks.cast(StorageTask::Create {
            storage_id: storage.id.clone(),
        });
        Ok(storage)
    }

    /// Remove a storage that no longer hosts volumes or images.
    pub async fn delete(&self, id: &str, user_id: &str) -> Result<Storage> {
        let mut uow = self.ctx.store.begin().await?;
        let mut storage = uow.storages().get(id).await?;
        let removable = [StorageStatus::Available, StorageStatus::Error];
        require_status(id, storage.status, &removable)?;

        let volumes = uow.volumes().count_on_storage(id).await?;
        let images = uow.images().count_on_storage(id).await?;
        if volumes + images > 0 {
            return Err(Error::HasDependents {
                entity: "storage",
                id: id.to_string(),
                dependents: format!("{volumes} volume(s), {images} image(s)"),
            });
        }

        uow.storages()
            .transition(id, &removable, StorageStatus::Deleting, None)
            .await?;
        uow.commit().await?;
        storage.status = StorageStatus::Deleting;

        self.ctx
            .events
            .add_event(id, user_id, "delete_storage", "Storage deletion requested.");
        self.tasks.cast(StorageTask::Delete {
            storage_id: id.to_string(),
        });
        Ok(storage)
    }
}

/// A reachable storage is `available` with fresh capacity; an unreachable
/// one is `error` with the executor's message.
fn correction(storage: &Storage, observed: Result<StorageInfo>) -> StoragePatch {
    match observed {
        Ok(info) => StoragePatch {
            id: storage.id.clone(),
            expected_status: storage.status,
            status: StorageStatus::Available,
            size: Some(info.size),
            available: Some(info.available),
            information: String::new(),
        },
        Err(e) => StoragePatch {
            id: storage.id.clone(),
            expected_status: storage.status,
            status: StorageStatus::Error,
            size: None,
            available: None,
            information: e.to_string(),
        },
    }
}

#[async_trait]
impl Monitor for StorageManager {
    fn name(&self) -> &'static str {
        "storage"
    }

    async fn tick(&self) -> Result<TickReport> {
        let storages = {
            let mut uow = self.ctx.store.begin().await?;
            uow.storages().get_all().await?
        };

        let mut report = TickReport::default();
        let mut patches = Vec::new();
        for storage in &storages {
            if !StorageStatus::MONITORED.contains(&storage.status) {
                debug!(storage_id = %storage.id, status = %storage.status, "Storage not monitored in this status");
                report.skipped += 1;
                continue;
            }
            report.checked += 1;
            let observed = self
                .ctx
                .executors
                .storages
                .call(
                    StorageCommand::QueryInfo {
                        storage: storage_spec(storage),
                    },
                    self.ctx.config.call_timeout,
                )
                .await
                .and_then(|r| r.into_info());
            if let Err(e) = &observed {
                warn!(storage_id = %storage.id, error = %e, "Storage query failed");
                report.failed += 1;
            }
            patches.push(correction(storage, observed));
        }

        let mut uow = self.ctx.store.begin().await?;
        report.corrected = uow.storages().bulk_update(&patches).await?;
        uow.commit().await?;
        debug!(?report, "Storage monitor tick");
        Ok(report)
    }
}

struct StorageWorker {
    ctx: Context,
}

#[async_trait]
impl Handler<StorageTask, ()> for StorageWorker {
    async fn handle(&self, task: StorageTask) -> std::result::Result<(), Failure> {
        let result = match task {
            StorageTask::Create { storage_id } => self.create(&storage_id).await,
            StorageTask::Delete { storage_id } => self.delete(&storage_id).await,
        };
        result.map_err(Failure::from)
    }
}

impl StorageWorker {
    async fn fail(&self, storage: &Storage, from: StorageStatus, action: &str, err: Error) -> Error {
        self.ctx.report(&storage.id, &storage.user_id, action, &err);
        let message = err.to_string();
        let persisted = async {
            let mut uow = self.ctx.store.begin().await?;
            uow.storages()
                .transition(&storage.id, &[from], StorageStatus::Error, Some(&message))
                .await?;
            uow.commit().await
        }
        .await;
        if let Err(e) = persisted {
            warn!(storage_id = %storage.id, error = %e, "Could not persist storage failure");
        }
        err
    }

    async fn create(&self, id: &str) -> Result<()> {
        let storage = {
            let mut uow = self.ctx.store.begin().await?;
            let storage = uow.storages().get(id).await?;
            uow.storages()
                .transition(id, &[StorageStatus::New], StorageStatus::Creating, None)
                .await?;
            uow.commit().await?;
            storage
        };

        let outcome = self
            .ctx
            .executors
            .storages
            .call(
                StorageCommand::Create {
                    storage: storage_spec(&storage),
                },
                self.ctx.config.call_timeout,
            )
            .await
            .and_then(|r| r.into_info());
        let info = match outcome {
            Ok(info) => info,
            Err(e) => {
                return Err(self
                    .fail(&storage, StorageStatus::Creating, "create_storage", e)
                    .await);
            }
        };

        let mut uow = self.ctx.store.begin().await?;
        uow.storages()
            .set_capacity(id, info.size, info.available, Some(&info.mount_point))
            .await?;
        uow.storages()
            .transition(id, &[StorageStatus::Creating], StorageStatus::Available, Some(""))
            .await?;
        uow.commit().await?;

        info!(storage_id = %id, mount_point = %info.mount_point, size = info.size, "Storage created");
        self.ctx.events.add_event(
            id,
            &storage.user_id,
            "create_storage",
            "Storage successfully created.",
        );
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let storage = {
            let mut uow = self.ctx.store.begin().await?;
            uow.storages().get(id).await?
        };

        let outcome = self
            .ctx
            .executors
            .storages
            .call(
                StorageCommand::Delete {
                    storage: storage_spec(&storage),
                },
                self.ctx.config.call_timeout,
            )
            .await;
        if let Err(e) = outcome {
            return Err(self
                .fail(&storage, StorageStatus::Deleting, "delete_storage", e)
                .await);
        }

        let mut uow = self.ctx.store.begin().await?;
        uow.storages().delete(id).await?;
        uow.commit().await?;

        info!(storage_id = %id, "Storage deleted");
        self.ctx.events.add_event(
            id,
            &storage.user_id,
            "delete_storage",
            "Storage successfully deleted.",
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(status: StorageStatus) -> Storage {
        let mut s = Storage::new(
            "fast".into(),
            StorageBackend::LocalFs {
                device: "/dev/sdb".into(),
                fs_type: "ext4".into(),
            },
            "u".into(),
        );
        s.status = status;
        s
    }

    #[test]
    fn reachable_storage_recovers() {
        let s = storage(StorageStatus::Error);
        let patch = correction(
            &s,
            Ok(StorageInfo {
                size: 100,
                available: 40,
                mount_point: "/mnt/fast".into(),
            }),
        );
        assert_eq!(patch.expected_status, StorageStatus::Error);
        assert_eq!(patch.status, StorageStatus::Available);
        assert_eq!(patch.available, Some(40));
    }

    #[test]
    fn unreachable_storage_goes_to_error() {
        let s = storage(StorageStatus::Available);
        let patch = correction(&s, Err(Error::Internal("mount lost".into())));
        assert_eq!(patch.status, StorageStatus::Error);
        assert_eq!(patch.size, None);
        assert!(patch.information.contains("mount lost"));
    }
}
