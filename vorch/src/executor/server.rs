//! Executor workers: one queue per entity kind, each dispatching to the
//! driver registered for the command's backend.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::{
    DriverRegistry, ImageCommand, ImageReply, NetworkCommand, NetworkReply, StorageCommand,
    StorageReply, VmCommand, VmReply, VolumeCommand, VolumeReply,
};
use crate::bus::{Failure, Handler, Queue, queue, serve};

/// Sending halves of the executor queues.
#[derive(Clone)]
pub struct Executors {
    pub volumes: Queue<VolumeCommand, VolumeReply>,
    pub storages: Queue<StorageCommand, StorageReply>,
    pub images: Queue<ImageCommand, ImageReply>,
    pub vms: Queue<VmCommand, VmReply>,
    pub networks: Queue<NetworkCommand, NetworkReply>,
}

impl Executors {
    /// Start one worker per queue. Workers stop once every clone of the
    /// returned handle is dropped.
    pub fn spawn(registry: Arc<DriverRegistry>) -> (Self, Vec<JoinHandle<()>>) {
        let dispatch = Arc::new(Dispatch { registry });

        let (volumes, volume_inbox) = queue("executor.volume");
        let (storages, storage_inbox) = queue("executor.storage");
        let (images, image_inbox) = queue("executor.image");
        let (vms, vm_inbox) = queue("executor.vm");
        let (networks, network_inbox) = queue("executor.network");

        let workers = vec![
            serve(volume_inbox, dispatch.clone()),
            serve(storage_inbox, dispatch.clone()),
            serve(image_inbox, dispatch.clone()),
            serve(vm_inbox, dispatch.clone()),
            serve(network_inbox, dispatch),
        ];

        (
            Self {
                volumes,
                storages,
                images,
                vms,
                networks,
            },
            workers,
        )
    }
}

struct Dispatch {
    registry: Arc<DriverRegistry>,
}

#[async_trait]
impl Handler<VolumeCommand, VolumeReply> for Dispatch {
    async fn handle(&self, command: VolumeCommand) -> Result<VolumeReply, Failure> {
        let reply = match command {
            VolumeCommand::Create { volume } => {
                let driver = self.registry.volume(volume.kind)?;
                VolumeReply::Info(driver.create(&volume).await?)
            }
            VolumeCommand::Delete { volume } => {
                self.registry.volume(volume.kind)?.delete(&volume).await?;
                VolumeReply::Done
            }
            VolumeCommand::Extend { volume, new_size } => {
                let driver = self.registry.volume(volume.kind)?;
                VolumeReply::Info(driver.extend(&volume, new_size).await?)
            }
            VolumeCommand::QueryInfo { volume } => {
                let driver = self.registry.volume(volume.kind)?;
                VolumeReply::Info(driver.query_info(&volume).await?)
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl Handler<StorageCommand, StorageReply> for Dispatch {
    async fn handle(&self, command: StorageCommand) -> Result<StorageReply, Failure> {
        let reply = match command {
            StorageCommand::Create { storage } => {
                let driver = self.registry.storage(storage.backend.kind())?;
                StorageReply::Info(driver.create(&storage).await?)
            }
            StorageCommand::Delete { storage } => {
                let driver = self.registry.storage(storage.backend.kind())?;
                driver.delete(&storage).await?;
                StorageReply::Done
            }
            StorageCommand::QueryInfo { storage } => {
                let driver = self.registry.storage(storage.backend.kind())?;
                StorageReply::Info(driver.query_info(&storage).await?)
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl Handler<ImageCommand, ImageReply> for Dispatch {
    async fn handle(&self, command: ImageCommand) -> Result<ImageReply, Failure> {
        let reply = match command {
            ImageCommand::Upload { image } => {
                let driver = self.registry.image(image.kind)?;
                ImageReply::Info(driver.upload(&image).await?)
            }
            ImageCommand::Delete { image } => {
                self.registry.image(image.kind)?.delete(&image).await?;
                ImageReply::Done
            }
            ImageCommand::QueryInfo { image } => {
                let driver = self.registry.image(image.kind)?;
                ImageReply::Info(driver.query_info(&image).await?)
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl Handler<VmCommand, VmReply> for Dispatch {
    async fn handle(&self, command: VmCommand) -> Result<VmReply, Failure> {
        let driver = self.registry.domain()?;
        let state = match command {
            VmCommand::Create { domain } => driver.create(&domain).await?,
            VmCommand::Delete { domain } => {
                driver.delete(&domain).await?;
                return Ok(VmReply::Done);
            }
            VmCommand::Start { domain } => driver.start(&domain).await?,
            VmCommand::ShutOff { domain } => driver.shut_off(&domain).await?,
            VmCommand::QueryState { domain } => driver.query_state(&domain).await?,
            VmCommand::CreateSnapshot {
                domain,
                name,
                description,
            } => driver.create_snapshot(&domain, &name, &description).await?,
            VmCommand::DeleteSnapshot {
                domain,
                name,
                children,
            } => driver.delete_snapshot(&domain, &name, &children).await?,
            VmCommand::RevertSnapshot { domain, name } => {
                driver.revert_snapshot(&domain, &name).await?
            }
        };
        Ok(VmReply::Info(state))
    }
}

#[async_trait]
impl Handler<NetworkCommand, NetworkReply> for Dispatch {
    async fn handle(&self, command: NetworkCommand) -> Result<NetworkReply, Failure> {
        let driver = self.registry.network()?;
        let info = match command {
            NetworkCommand::Create { network } => driver.create(&network).await?,
            NetworkCommand::Delete { network } => {
                driver.delete(&network).await?;
                return Ok(NetworkReply::Done);
            }
            NetworkCommand::Enable { network } => driver.enable(&network).await?,
            NetworkCommand::Disable { network } => driver.disable(&network).await?,
            NetworkCommand::QueryState { network } => driver.query_state(&network).await?,
        };
        Ok(NetworkReply::Info(info))
    }
}
