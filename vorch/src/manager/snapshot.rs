//! Snapshot operations on a VM.
//!
//! Unlike the other entity operations these run synchronously: validate,
//! commit the transitional status, call the executor and commit the outcome
//! before returning. Only one snapshot operation may be in flight per VM.

use tracing::{info, warn};

use super::VmManager;
use super::vm::{domain_spec, require_power};
use crate::error::{Error, Result};
use crate::executor::{DomainState, VmCommand};
use crate::model::{PowerState, Snapshot, SnapshotChain, SnapshotStatus, join, require_status};
use crate::store::{Repository, UnitOfWork};

#[derive(Debug, Clone)]
pub struct CreateSnapshot {
    pub vm_id: String,
    pub name: String,
    pub description: String,
    pub user_id: String,
}

/// Reject the request while another snapshot of the VM is changing.
fn ensure_idle(chain: &SnapshotChain) -> Result<()> {
    match chain.in_flight() {
        Some(busy) => Err(Error::InvalidStatus {
            entity: "snapshot",
            id: busy.id.clone(),
            status: busy.status.to_string(),
            expected: join(&[SnapshotStatus::Running, SnapshotStatus::Error]),
        }),
        None => Ok(()),
    }
}

fn member(chain: &SnapshotChain, snapshot_id: &str) -> Result<Snapshot> {
    chain
        .get(snapshot_id)
        .cloned()
        .ok_or_else(|| Error::not_found("snapshot", snapshot_id))
}

impl VmManager {
    pub async fn list_snapshots(&self, vm_id: &str) -> Result<Vec<Snapshot>> {
        let mut uow = self.ctx.store.begin().await?;
        uow.vms().get(vm_id).await?;
        uow.snapshots().list_for_vm(vm_id).await
    }

    pub async fn get_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<Snapshot> {
        let mut uow = self.ctx.store.begin().await?;
        let snapshot = uow.snapshots().get(snapshot_id).await?;
        if snapshot.vm_id != vm_id {
            return Err(Error::not_found("snapshot", snapshot_id));
        }
        Ok(snapshot)
    }

    /// Snapshot a running VM. The new snapshot becomes the VM's current one
    /// and is a child of the previous current snapshot.
    pub async fn create_snapshot(&self, request: CreateSnapshot) -> Result<Snapshot> {
        if request.name.trim().is_empty() {
            return Err(Error::InvalidArgument("snapshot name must not be empty".into()));
        }

        let (vm, snapshot) = {
            let mut uow = self.ctx.store.begin().await?;
            let vm = uow.vms().get(&request.vm_id).await?;
            require_power(&vm, PowerState::Running)?;
            let chain = uow.snapshots().chain(&vm.id).await?;
            ensure_idle(&chain)?;
            if chain.len() >= self.ctx.config.max_snapshots {
                return Err(Error::SnapshotLimit {
                    vm_id: vm.id,
                    limit: self.ctx.config.max_snapshots,
                });
            }
            if chain.by_name(&request.name).is_some() {
                return Err(Error::already_exists("snapshot", request.name));
            }

            let parent = chain.current().map(|s| s.id.clone());
            let snapshot = Snapshot::new(&vm.id, request.name, request.description, parent);
            uow.snapshots().add(&snapshot).await?;
            uow.commit().await?;
            (vm, snapshot)
        };
        info!(vm_id = %vm.id, snapshot_id = %snapshot.id, name = %snapshot.name, parent = ?snapshot.parent_id, "Creating snapshot");

        let outcome = self
            .snapshot_call(VmCommand::CreateSnapshot {
                domain: domain_spec(&vm),
                name: snapshot.name.clone(),
                description: snapshot.description.clone(),
            })
            .await;
        if let Err(e) = outcome {
            return Err(self
                .fail_snapshot(&snapshot, SnapshotStatus::Creating, &request.user_id, "create_snapshot", e)
                .await);
        }

        let mut uow = self.ctx.store.begin().await?;
        uow.snapshots()
            .transition(&snapshot.id, &[SnapshotStatus::Creating], SnapshotStatus::Running, Some(""))
            .await?;
        let chain = uow.snapshots().chain(&vm.id).await?;
        uow.snapshots()
            .apply(&chain.plan_make_current(&snapshot.id))
            .await?;
        let created = uow.snapshots().get(&snapshot.id).await?;
        uow.commit().await?;

        self.ctx.events.add_event(
            &snapshot.id,
            &request.user_id,
            "create_snapshot",
            format!("Snapshot {} of VM {} created.", created.name, vm.name),
        );
        Ok(created)
    }

    /// Delete a snapshot, splicing its children onto its parent.
    ///
    /// A snapshot in `error` has nothing left on the hypervisor and is only
    /// removed from the records.
    pub async fn delete_snapshot(
        &self,
        vm_id: &str,
        snapshot_id: &str,
        user_id: &str,
    ) -> Result<Snapshot> {
        let (vm, snapshot, children) = {
            let mut uow = self.ctx.store.begin().await?;
            let vm = uow.vms().get(vm_id).await?;
            let chain = uow.snapshots().chain(vm_id).await?;
            let snapshot = member(&chain, snapshot_id)?;
            require_status(
                snapshot_id,
                snapshot.status,
                &[SnapshotStatus::Running, SnapshotStatus::Error],
            )?;
            ensure_idle(&chain)?;

            uow.snapshots()
                .begin_operation(snapshot_id, snapshot.status, SnapshotStatus::Deleting)
                .await?;
            if snapshot.status == SnapshotStatus::Error {
                self.remove_from_chain(&mut uow, vm_id, snapshot_id, false).await?;
                uow.commit().await?;
                info!(vm_id, snapshot_id, "Errored snapshot removed");
                self.ctx.events.add_event(
                    snapshot_id,
                    user_id,
                    "delete_snapshot",
                    format!("Snapshot {} removed.", snapshot.name),
                );
                return Ok(snapshot);
            }

            let children: Vec<String> = chain.children(snapshot_id).map(|c| c.name.clone()).collect();
            uow.commit().await?;
            (vm, snapshot, children)
        };

        let outcome = self
            .snapshot_call(VmCommand::DeleteSnapshot {
                domain: domain_spec(&vm),
                name: snapshot.name.clone(),
                children,
            })
            .await;
        if let Err(e) = outcome {
            return Err(self
                .fail_snapshot(&snapshot, SnapshotStatus::Deleting, user_id, "delete_snapshot", e)
                .await);
        }

        let mut uow = self.ctx.store.begin().await?;
        self.remove_from_chain(&mut uow, vm_id, snapshot_id, snapshot.is_current)
            .await?;
        uow.commit().await?;

        info!(vm_id, snapshot_id, "Snapshot deleted");
        self.ctx.events.add_event(
            snapshot_id,
            user_id,
            "delete_snapshot",
            format!("Snapshot {} of VM {} deleted.", snapshot.name, vm.name),
        );
        Ok(snapshot)
    }

    /// Revert a running VM to one of its snapshots, which becomes current.
    pub async fn revert_snapshot(
        &self,
        vm_id: &str,
        snapshot_id: &str,
        user_id: &str,
    ) -> Result<Snapshot> {
        let (vm, snapshot) = {
            let mut uow = self.ctx.store.begin().await?;
            let vm = uow.vms().get(vm_id).await?;
            require_power(&vm, PowerState::Running)?;
            let chain = uow.snapshots().chain(vm_id).await?;
            let snapshot = member(&chain, snapshot_id)?;
            require_status(snapshot_id, snapshot.status, &[SnapshotStatus::Running])?;
            ensure_idle(&chain)?;
            uow.snapshots()
                .begin_operation(snapshot_id, SnapshotStatus::Running, SnapshotStatus::Reverting)
                .await?;
            uow.commit().await?;
            (vm, snapshot)
        };

        let outcome = self
            .snapshot_call(VmCommand::RevertSnapshot {
                domain: domain_spec(&vm),
                name: snapshot.name.clone(),
            })
            .await;
        if let Err(e) = outcome {
            return Err(self
                .fail_snapshot(&snapshot, SnapshotStatus::Reverting, user_id, "revert_snapshot", e)
                .await);
        }

        let mut uow = self.ctx.store.begin().await?;
        uow.snapshots()
            .transition(snapshot_id, &[SnapshotStatus::Reverting], SnapshotStatus::Running, Some(""))
            .await?;
        let chain = uow.snapshots().chain(vm_id).await?;
        uow.snapshots()
            .apply(&chain.plan_make_current(snapshot_id))
            .await?;
        let reverted = uow.snapshots().get(snapshot_id).await?;
        uow.commit().await?;

        info!(vm_id, snapshot_id, "VM reverted to snapshot");
        self.ctx.events.add_event(
            snapshot_id,
            user_id,
            "revert_snapshot",
            format!("VM {} reverted to snapshot {}.", vm.name, reverted.name),
        );
        Ok(reverted)
    }

    /// Drop the snapshot from its chain. `was_current` is the flag it held
    /// before the delete started; its parent inherits it unless another
    /// snapshot became current in the meantime.
    async fn remove_from_chain(
        &self,
        uow: &mut UnitOfWork,
        vm_id: &str,
        snapshot_id: &str,
        was_current: bool,
    ) -> Result<()> {
        let mut chain = uow.snapshots().chain(vm_id).await?;
        if was_current && chain.current().is_none() {
            let restore = chain.plan_make_current(snapshot_id);
            chain.apply(&restore);
        }
        let patch = chain
            .plan_delete(snapshot_id)
            .ok_or_else(|| Error::not_found("snapshot", snapshot_id))?;
        uow.snapshots().apply(&patch).await
    }

    async fn snapshot_call(&self, command: VmCommand) -> Result<DomainState> {
        self.ctx
            .executors
            .vms
            .call(command, self.ctx.config.call_timeout)
            .await?
            .into_info()
    }

    async fn fail_snapshot(
        &self,
        snapshot: &Snapshot,
        from: SnapshotStatus,
        user_id: &str,
        action: &str,
        err: Error,
    ) -> Error {
        self.ctx.report(&snapshot.id, user_id, action, &err);
        let message = err.to_string();
        let persisted = async {
            let mut uow = self.ctx.store.begin().await?;
            uow.snapshots().fail(&snapshot.id, from, &message).await?;
            uow.commit().await
        }
        .await;
        if let Err(e) = persisted {
            warn!(snapshot_id = %snapshot.id, error = %e, "Could not persist snapshot failure");
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: &str, status: SnapshotStatus) -> Snapshot {
        let mut s = Snapshot::new("vm", id.into(), String::new(), None);
        s.id = id.into();
        s.status = status;
        s
    }

    #[test]
    fn idle_chain_accepts_operations() {
        let chain = SnapshotChain::new(vec![
            snap("s1", SnapshotStatus::Running),
            snap("s2", SnapshotStatus::Error),
        ]);
        assert!(ensure_idle(&chain).is_ok());
    }

    #[test]
    fn in_flight_operation_blocks_the_vm() {
        let chain = SnapshotChain::new(vec![
            snap("s1", SnapshotStatus::Running),
            snap("s2", SnapshotStatus::Reverting),
        ]);
        let err = ensure_idle(&chain).unwrap_err();
        assert_eq!(err.kind(), "InvalidStatus");
        assert!(err.to_string().contains("s2"));
    }

    #[test]
    fn member_is_scoped_to_chain() {
        let chain = SnapshotChain::new(vec![snap("s1", SnapshotStatus::Running)]);
        assert_eq!(member(&chain, "s1").unwrap().name, "s1");
        assert_eq!(member(&chain, "other").unwrap_err().kind(), "NotFound");
    }
}
