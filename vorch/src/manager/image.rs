use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Context, require_space, usable_storage};
use crate::bus::{Command, Failure, Handler, Queue, queue, serve};
use crate::error::{Error, Result};
use crate::executor::{ImageCommand, ImageInfo, ImageReply, ImageSpec};
use crate::model::{
    DiskSource, Image, ImageAttachment, ImagePatch, ImageStatus, Storage, VolumeFormat,
    require_status,
};
use crate::reconcile::{Monitor, TickReport};
use crate::store::Repository;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command_name", content = "payload", rename_all = "snake_case")]
pub enum ImageTask {
    Upload { image_id: String },
    Delete { image_id: String },
}

impl Command for ImageTask {
    fn name(&self) -> &'static str {
        match self {
            ImageTask::Upload { .. } => "upload",
            ImageTask::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadImage {
    pub name: String,
    pub storage_id: String,
    /// Local file to import.
    pub source: String,
    pub format: VolumeFormat,
    pub description: String,
    pub user_id: String,
}

/// Where an attached image lives on the host.
#[derive(Debug, Clone, Serialize)]
pub struct ImageAttachInfo {
    pub attachment: ImageAttachment,
    pub path: String,
    pub size: u64,
    pub format: VolumeFormat,
}

fn image_spec(image: &Image, storage: &Storage) -> ImageSpec {
    ImageSpec {
        id: image.id.clone(),
        format: image.format,
        source: image.source.clone(),
        kind: storage.kind(),
        mount_point: storage.mount_point.clone().unwrap_or_default(),
        path: image.path.clone(),
    }
}

#[derive(Clone)]
pub struct ImageManager {
    ctx: Context,
    tasks: Queue<ImageTask, ()>,
}

impl ImageManager {
    pub fn spawn(ctx: Context) -> (Self, JoinHandle<()>) {
        let (tasks, inbox) = queue("image.tasks");
        let worker = serve(inbox, Arc::new(ImageWorker { ctx: ctx.clone() }));
        (Self { ctx, tasks }, worker)
    }

    pub async fn get(&self, id: &str) -> Result<Image> {
        let mut uow = self.ctx.store.begin().await?;
        uow.images().get(id).await
    }

    pub async fn list(&self) -> Result<Vec<Image>> {
        let mut uow = self.ctx.store.begin().await?;
        uow.images().get_all().await
    }

    /// Register an image and schedule the copy of `source` onto the storage.
    pub async fn upload(&self, request: UploadImage) -> Result<Image> {
        if request.name.trim().is_empty() {
            return Err(Error::InvalidArgument("image name must not be empty".into()));
        }
        let size = tokio::fs::metadata(&request.source)
            .await
            .map_err(|e| Error::InvalidArgument(format!("source {}: {e}", request.source)))?
            .len();

        let mut uow = self.ctx.store.begin().await?;
        let storage = uow.storages().get(&request.storage_id).await?;
        usable_storage(Some(&storage), &storage.id)?;
        if uow.images().find_by_name(&request.name).await?.is_some() {
            return Err(Error::already_exists("image", request.name));
        }

        let mut image = Image::new(
            request.name,
            request.format,
            request.storage_id,
            request.source,
            request.user_id,
        );
        image.size = size;
        image.description = request.description;
        uow.images().add(&image).await?;
        uow.commit().await?;

        info!(image_id = %image.id, name = %image.name, size, "Image inserted");
        self.ctx.events.add_event(
            &image.id,
            &image.user_id,
            "upload_image",
            "Image successfully inserted into db.",
        );
        self.tasks.cast(ImageTask::Upload {
            image_id: image.id.clone(),
        });
        Ok(image)
    }

    pub async fn delete(&self, id: &str, user_id: &str) -> Result<Image> {
        let mut uow = self.ctx.store.begin().await?;
        let mut image = uow.images().get(id).await?;
        let removable = [ImageStatus::Available, ImageStatus::Error];
        require_status(id, image.status, &removable)?;
        if !image.attachments.is_empty() {
            let vms: Vec<&str> = image.attachments.iter().map(|a| a.vm_id.as_str()).collect();
            return Err(Error::HasAttachments {
                entity: "image",
                id: id.to_string(),
                vms: vms.join(", "),
            });
        }
        uow.images()
            .transition(id, &removable, ImageStatus::Deleting, None)
            .await?;
        uow.commit().await?;
        image.status = ImageStatus::Deleting;

        self.ctx
            .events
            .add_event(id, user_id, "delete_image", "Image deletion requested.");
        self.tasks.cast(ImageTask::Delete {
            image_id: id.to_string(),
        });
        Ok(image)
    }

    /// Attach an `available` image to a VM, at most once per VM.
    ///
    /// The backend is asked where the image file is; if it cannot answer,
    /// the image is moved to `error` and nothing is attached.
    pub async fn attach(
        &self,
        id: &str,
        vm_id: &str,
        target: Option<String>,
        user_id: &str,
    ) -> Result<ImageAttachInfo> {
        let (image, storage) = {
            let mut uow = self.ctx.store.begin().await?;
            let image = uow.images().get(id).await?;
            require_status(id, image.status, &[ImageStatus::Available])?;
            uow.vms().get(vm_id).await?;
            if image.attachments.iter().any(|a| a.vm_id == vm_id) {
                return Err(Error::already_exists("attachment", format!("{id}/{vm_id}")));
            }
            let storage = uow.storages().find(&image.storage_id).await?;
            (image, storage)
        };

        let info = match self.query(&image, storage.as_ref()).await {
            Ok(info) => info,
            Err(e) => {
                let message = format!("Error while attaching image: {e}");
                self.ctx.report(id, user_id, "attach_image", &e);
                let mut uow = self.ctx.store.begin().await?;
                uow.images()
                    .transition(id, &[ImageStatus::Available], ImageStatus::Error, Some(&message))
                    .await?;
                uow.commit().await?;
                return Err(e);
            }
        };

        let attachment = ImageAttachment::new(id, vm_id, target);
        let mut uow = self.ctx.store.begin().await?;
        let current = uow.images().get(id).await?;
        require_status(id, current.status, &[ImageStatus::Available])?;
        if current.attachments.iter().any(|a| a.vm_id == vm_id) {
            return Err(Error::already_exists("attachment", format!("{id}/{vm_id}")));
        }
        uow.images().add_attachment(&attachment).await?;
        uow.commit().await?;

        info!(image_id = %id, vm_id = %vm_id, path = %info.path, "Image attached");
        self.ctx
            .events
            .add_event(id, user_id, "attach_image", format!("Image attached to VM {vm_id}."));
        Ok(ImageAttachInfo {
            attachment,
            path: info.path,
            size: info.size,
            format: image.format,
        })
    }

    pub async fn detach(&self, id: &str, vm_id: &str, user_id: &str) -> Result<Image> {
        let mut uow = self.ctx.store.begin().await?;
        let image = uow.images().get(id).await?;
        require_status(id, image.status, &[ImageStatus::Available, ImageStatus::Error])?;
        let removed = uow.images().remove_attachments(id, vm_id).await?;
        uow.vms().remove_disks_of(vm_id, DiskSource::Image, id).await?;
        let image = uow.images().get(id).await?;
        uow.commit().await?;

        debug!(image_id = %id, vm_id = %vm_id, removed, "Image attachments removed");
        self.ctx
            .events
            .add_event(id, user_id, "detach_image", format!("Image detached from VM {vm_id}."));
        Ok(image)
    }

    async fn query(&self, image: &Image, storage: Option<&Storage>) -> Result<ImageInfo> {
        let storage = usable_storage(storage, &image.storage_id)?;
        self.ctx
            .executors
            .images
            .call(
                ImageCommand::QueryInfo {
                    image: image_spec(image, &storage),
                },
                self.ctx.config.call_timeout,
            )
            .await?
            .into_info()
    }
}

#[async_trait]
impl Monitor for ImageManager {
    fn name(&self) -> &'static str {
        "image"
    }

    async fn tick(&self) -> Result<TickReport> {
        let (images, storages) = {
            let mut uow = self.ctx.store.begin().await?;
            let images = uow.images().get_all().await?;
            let storages: HashMap<String, Storage> = uow
                .storages()
                .get_all()
                .await?
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect();
            (images, storages)
        };

        let mut report = TickReport::default();
        let mut patches = Vec::new();
        for image in &images {
            if !ImageStatus::MONITORED.contains(&image.status) {
                report.skipped += 1;
                continue;
            }
            let storage = match usable_storage(storages.get(&image.storage_id), &image.storage_id) {
                Ok(storage) => storage,
                Err(e) => {
                    debug!(image_id = %image.id, reason = %e, "Skipping image");
                    report.skipped += 1;
                    continue;
                }
            };

            report.checked += 1;
            let reply = self
                .ctx
                .executors
                .images
                .call(
                    ImageCommand::QueryInfo {
                        image: image_spec(image, &storage),
                    },
                    self.ctx.config.call_timeout,
                )
                .await
                .and_then(|r| r.into_info());
            match reply {
                Ok(info) => patches.push(ImagePatch {
                    id: image.id.clone(),
                    expected_status: image.status,
                    status: ImageStatus::Available,
                    size: Some(info.size),
                    information: String::new(),
                }),
                Err(e) => {
                    warn!(image_id = %image.id, error = %e, "Image query failed");
                    report.failed += 1;
                }
            }
        }

        let mut uow = self.ctx.store.begin().await?;
        report.corrected = uow.images().bulk_update(&patches).await?;
        uow.commit().await?;
        debug!(?report, "Image monitor tick");
        Ok(report)
    }
}

struct ImageWorker {
    ctx: Context,
}

#[async_trait]
impl Handler<ImageTask, ()> for ImageWorker {
    async fn handle(&self, task: ImageTask) -> std::result::Result<(), Failure> {
        let result = match task {
            ImageTask::Upload { image_id } => self.upload(&image_id).await,
            ImageTask::Delete { image_id } => self.delete(&image_id).await,
        };
        result.map_err(Failure::from)
    }
}

impl ImageWorker {
    async fn fail(&self, image: &Image, from: ImageStatus, action: &str, err: Error) -> Error {
        self.ctx.report(&image.id, &image.user_id, action, &err);
        let message = err.to_string();
        let persisted = async {
            let mut uow = self.ctx.store.begin().await?;
            uow.images()
                .transition(&image.id, &[from], ImageStatus::Error, Some(&message))
                .await?;
            uow.commit().await
        }
        .await;
        if let Err(e) = persisted {
            warn!(image_id = %image.id, error = %e, "Could not persist image failure");
        }
        err
    }

    async fn upload(&self, id: &str) -> Result<()> {
        let (image, storage) = {
            let mut uow = self.ctx.store.begin().await?;
            let image = uow.images().get(id).await?;
            let storage = uow.storages().find(&image.storage_id).await?;
            uow.images()
                .transition(id, &[ImageStatus::New], ImageStatus::Uploading, None)
                .await?;
            uow.commit().await?;
            (image, storage)
        };

        let outcome = async {
            let storage = usable_storage(storage.as_ref(), &image.storage_id)?;
            require_space(&storage, image.size)?;
            self.ctx
                .executors
                .images
                .call(
                    ImageCommand::Upload {
                        image: image_spec(&image, &storage),
                    },
                    self.ctx.config.call_timeout,
                )
                .await?
                .into_info()
        }
        .await;
        let info = match outcome {
            Ok(info) => info,
            Err(e) => {
                return Err(self.fail(&image, ImageStatus::Uploading, "upload_image", e).await);
            }
        };

        let mut uow = self.ctx.store.begin().await?;
        uow.images().set_uploaded(id, info.size, &info.path).await?;
        uow.images()
            .transition(id, &[ImageStatus::Uploading], ImageStatus::Available, Some(""))
            .await?;
        uow.commit().await?;

        info!(image_id = %id, path = %info.path, "Image uploaded");
        self.ctx.events.add_event(
            id,
            &image.user_id,
            "upload_image",
            "Image successfully uploaded.",
        );
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let (image, storage) = {
            let mut uow = self.ctx.store.begin().await?;
            let image = uow.images().get(id).await?;
            let storage = uow.storages().find(&image.storage_id).await?;
            (image, storage)
        };

        let outcome = match &storage {
            Some(storage) => {
                self.ctx
                    .executors
                    .images
                    .call(
                        ImageCommand::Delete {
                            image: image_spec(&image, storage),
                        },
                        self.ctx.config.call_timeout,
                    )
                    .await
            }
            None => {
                warn!(
                    image_id = %id,
                    storage_id = %image.storage_id,
                    "Storage is gone, removing the image record only"
                );
                Ok(ImageReply::Done)
            }
        };
        if let Err(e) = outcome {
            return Err(self.fail(&image, ImageStatus::Deleting, "delete_image", e).await);
        }

        let mut uow = self.ctx.store.begin().await?;
        uow.images().delete(id).await?;
        uow.commit().await?;

        info!(image_id = %id, "Image deleted");
        self.ctx.events.add_event(
            id,
            &image.user_id,
            "delete_image",
            "Image successfully deleted.",
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::WireMessage;
    use crate::model::StorageBackend;

    #[test]
    fn spec_places_image_under_mount_point() {
        let mut storage = Storage::new(
            "s".into(),
            StorageBackend::Nfs {
                ip: "10.0.0.2".into(),
                path: "/isos".into(),
            },
            "u".into(),
        );
        storage.mount_point = Some("/mnt/isos".into());
        let image = Image::new(
            "debian".into(),
            VolumeFormat::Raw,
            storage.id.clone(),
            "/tmp/debian.iso".into(),
            "u".into(),
        );

        let spec = image_spec(&image, &storage);
        assert_eq!(spec.source, "/tmp/debian.iso");
        assert_eq!(spec.file_path(), format!("/mnt/isos/image-{}.raw", image.id));
    }

    #[test]
    fn task_wire_names() {
        let message = WireMessage::encode(&ImageTask::Delete {
            image_id: "i1".into(),
        })
        .unwrap();
        assert_eq!(message.command_name, "delete");
        assert_eq!(message.payload["image_id"], "i1");
    }
}
