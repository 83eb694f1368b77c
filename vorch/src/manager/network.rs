use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Context;
use crate::bus::{Command, Failure, Handler, Queue, queue, serve};
use crate::error::{Error, Result};
use crate::executor::{NetworkCommand, NetworkInfo, NetworkSpec};
use crate::model::{NetworkPatch, NetworkState, NetworkStatus, VirtualNetwork, require_status};
use crate::reconcile::{Monitor, TickReport};
use crate::store::Repository;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command_name", content = "payload", rename_all = "snake_case")]
pub enum NetworkTask {
    Create { network_id: String },
    Delete { network_id: String },
}

impl Command for NetworkTask {
    fn name(&self) -> &'static str {
        match self {
            NetworkTask::Create { .. } => "create",
            NetworkTask::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateNetwork {
    pub name: String,
    /// Host bridge backing the network.
    pub bridge: String,
    pub user_id: String,
}

fn network_spec(network: &VirtualNetwork) -> NetworkSpec {
    NetworkSpec {
        id: network.id.clone(),
        name: network.name.clone(),
        bridge: network.bridge.clone(),
    }
}

#[derive(Clone)]
pub struct NetworkManager {
    ctx: Context,
    tasks: Queue<NetworkTask, ()>,
}

impl NetworkManager {
    pub fn spawn(ctx: Context) -> (Self, JoinHandle<()>) {
        let (tasks, inbox) = queue("network.tasks");
        let worker = serve(inbox, Arc::new(NetworkWorker { ctx: ctx.clone() }));
        (Self { ctx, tasks }, worker)
    }

    pub async fn get(&self, id: &str) -> Result<VirtualNetwork> {
        let mut uow = self.ctx.store.begin().await?;
        uow.networks().get(id).await
    }

    pub async fn list(&self) -> Result<Vec<VirtualNetwork>> {
        let mut uow = self.ctx.store.begin().await?;
        uow.networks().get_all().await
    }

    pub async fn create(&self, request: CreateNetwork) -> Result<VirtualNetwork> {
        if request.name.trim().is_empty() || request.bridge.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "network name and bridge must not be empty".into(),
            ));
        }

        let mut uow = self.ctx.store.begin().await?;
        if uow.networks().find_by_name(&request.name).await?.is_some() {
            return Err(Error::already_exists("network", request.name));
        }
        let network = VirtualNetwork::new(request.name, request.bridge, request.user_id);
        uow.networks().add(&network).await?;
        uow.commit().await?;

        info!(network_id = %network.id, name = %network.name, bridge = %network.bridge, "Network inserted");
        self.ctx.events.add_event(
            &network.id,
            &network.user_id,
            "create_network",
            "Network successfully inserted into db.",
        );
        self.tasks.cast(NetworkTask::Create {
            network_id: network.id.clone(),
        });
        Ok(network)
    }

    pub async fn delete(&self, id: &str, user_id: &str) -> Result<VirtualNetwork> {
        let mut uow = self.ctx.store.begin().await?;
        let mut network = uow.networks().get(id).await?;
        let removable = [NetworkStatus::Available, NetworkStatus::Error];
        require_status(id, network.status, &removable)?;
        let vms = uow.vms().names_on_network(id).await?;
        if !vms.is_empty() {
            return Err(Error::HasDependents {
                entity: "network",
                id: id.to_string(),
                dependents: vms.join(", "),
            });
        }
        uow.networks()
            .transition(id, &removable, NetworkStatus::Deleting, None)
            .await?;
        uow.commit().await?;
        network.status = NetworkStatus::Deleting;

        self.ctx
            .events
            .add_event(id, user_id, "delete_network", "Network deletion requested.");
        self.tasks.cast(NetworkTask::Delete {
            network_id: id.to_string(),
        });
        Ok(network)
    }

    pub async fn turn_on(&self, id: &str, user_id: &str) -> Result<VirtualNetwork> {
        self.switch(id, NetworkState::On, user_id).await
    }

    pub async fn turn_off(&self, id: &str, user_id: &str) -> Result<VirtualNetwork> {
        self.switch(id, NetworkState::Off, user_id).await
    }

    /// Bring the bridge up or down and persist the observed link state.
    async fn switch(
        &self,
        id: &str,
        wanted: NetworkState,
        user_id: &str,
    ) -> Result<VirtualNetwork> {
        let network = {
            let mut uow = self.ctx.store.begin().await?;
            let network = uow.networks().get(id).await?;
            require_status(id, network.status, &[NetworkStatus::Available])?;
            network
        };

        let action = match wanted {
            NetworkState::On => "turn_on_network",
            NetworkState::Off => "turn_off_network",
        };
        let spec = network_spec(&network);
        let command = match wanted {
            NetworkState::On => NetworkCommand::Enable { network: spec },
            NetworkState::Off => NetworkCommand::Disable { network: spec },
        };
        let info = match self.call(command).await {
            Ok(info) => info,
            Err(e) => {
                self.ctx.report(id, user_id, action, &e);
                return Err(e);
            }
        };

        let mut uow = self.ctx.store.begin().await?;
        uow.networks().set_state(id, info.state).await?;
        let network = uow.networks().get(id).await?;
        uow.commit().await?;

        info!(network_id = %id, state = %info.state, "Network state changed");
        self.ctx.events.add_event(
            id,
            user_id,
            action,
            format!("Network {} is {}.", network.name, info.state),
        );
        Ok(network)
    }

    async fn call(&self, command: NetworkCommand) -> Result<NetworkInfo> {
        self.ctx
            .executors
            .networks
            .call(command, self.ctx.config.call_timeout)
            .await?
            .into_info()
    }
}

#[async_trait]
impl Monitor for NetworkManager {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn tick(&self) -> Result<TickReport> {
        let networks = {
            let mut uow = self.ctx.store.begin().await?;
            uow.networks().get_all().await?
        };

        let mut report = TickReport::default();
        let mut patches = Vec::new();
        for network in &networks {
            if network.status != NetworkStatus::Available {
                report.skipped += 1;
                continue;
            }
            report.checked += 1;
            match self
                .call(NetworkCommand::QueryState {
                    network: network_spec(network),
                })
                .await
            {
                Ok(info) if info.state != network.state => patches.push(NetworkPatch {
                    id: network.id.clone(),
                    expected_status: network.status,
                    state: info.state,
                }),
                Ok(_) => {}
                Err(e) => {
                    warn!(network_id = %network.id, error = %e, "Network query failed");
                    report.failed += 1;
                }
            }
        }

        let mut uow = self.ctx.store.begin().await?;
        report.corrected = uow.networks().bulk_update(&patches).await?;
        uow.commit().await?;
        debug!(?report, "Network monitor tick");
        Ok(report)
    }
}

struct NetworkWorker {
    ctx: Context,
}

#[async_trait]
impl Handler<NetworkTask, ()> for NetworkWorker {
    async fn handle(&self, task: NetworkTask) -> std::result::Result<(), Failure> {
        let result = match task {
            NetworkTask::Create { network_id } => self.create(&network_id).await,
            NetworkTask::Delete { network_id } => self.delete(&network_id).await,
        };
        result.map_err(Failure::from)
    }
}

impl NetworkWorker {
    async fn fail(
        &self,
        network: &VirtualNetwork,
        from: NetworkStatus,
        action: &str,
        err: Error,
    ) -> Error {
        self.ctx.report(&network.id, &network.user_id, action, &err);
        let message = err.to_string();
        let persisted = async {
            let mut uow = self.ctx.store.begin().await?;
            uow.networks()
                .transition(&network.id, &[from], NetworkStatus::Error, Some(&message))
                .await?;
            uow.commit().await
        }
        .await;
        if let Err(e) = persisted {
            warn!(network_id = %network.id, error = %e, "Could not persist network failure");
        }
        err
    }

    async fn create(&self, id: &str) -> Result<()> {
        let network = {
            let mut uow = self.ctx.store.begin().await?;
            let network = uow.networks().get(id).await?;
            uow.networks()
                .transition(id, &[NetworkStatus::New], NetworkStatus::Creating, None)
                .await?;
            uow.commit().await?;
            network
        };

        let outcome = self
            .ctx
            .executors
            .networks
            .call(
                NetworkCommand::Create {
                    network: network_spec(&network),
                },
                self.ctx.config.call_timeout,
            )
            .await
            .and_then(|r| r.into_info());
        let info = match outcome {
            Ok(info) => info,
            Err(e) => {
                return Err(self
                    .fail(&network, NetworkStatus::Creating, "create_network", e)
                    .await);
            }
        };

        let mut uow = self.ctx.store.begin().await?;
        uow.networks().set_state(id, info.state).await?;
        uow.networks()
            .transition(id, &[NetworkStatus::Creating], NetworkStatus::Available, Some(""))
            .await?;
        uow.commit().await?;

        info!(network_id = %id, bridge = %network.bridge, state = %info.state, "Network created");
        self.ctx.events.add_event(
            id,
            &network.user_id,
            "create_network",
            "Network successfully created.",
        );
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let network = {
            let mut uow = self.ctx.store.begin().await?;
            uow.networks().get(id).await?
        };

        let outcome = self
            .ctx
            .executors
            .networks
            .call(
                NetworkCommand::Delete {
                    network: network_spec(&network),
                },
                self.ctx.config.call_timeout,
            )
            .await;
        if let Err(e) = outcome {
            return Err(self
                .fail(&network, NetworkStatus::Deleting, "delete_network", e)
                .await);
        }

        let mut uow = self.ctx.store.begin().await?;
        uow.networks().delete(id).await?;
        uow.commit().await?;

        info!(network_id = %id, "Network deleted");
        self.ctx.events.add_event(
            id,
            &network.user_id,
            "delete_network",
            "Network successfully deleted.",
        );
        Ok(())
    }
}
