use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use uuid::Uuid;

use super::{Context, ImageManager, VolumeManager};
use crate::bus::{Command, Failure, Handler, Queue, queue, serve};
use crate::error::{Error, Result};
use crate::executor::{DomainDisk, DomainInterface, DomainSpec, DomainState, VmCommand};
use crate::model::{
    Disk, DiskSource, NetworkStatus, PowerState, Snapshot, SnapshotPatch, SnapshotStatus,
    VirtualInterface, VirtualMachine, VmPatch, VmStatus, require_status, timestamp, valid_mac,
};
use crate::reconcile::{Monitor, TickReport};
use crate::store::{Repository, Store, UnitOfWork};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command_name", content = "payload", rename_all = "snake_case")]
pub enum VmTask {
    Create { vm_id: String, disks: Vec<DiskRequest> },
    Start { vm_id: String },
    ShutOff { vm_id: String },
    Delete { vm_id: String },
}

impl Command for VmTask {
    fn name(&self) -> &'static str {
        match self {
            VmTask::Create { .. } => "create",
            VmTask::Start { .. } => "start",
            VmTask::ShutOff { .. } => "shut_off",
            VmTask::Delete { .. } => "delete",
        }
    }
}

/// Volume or image to plug into a VM.
#[derive(Debug, Clone, Serialize)]
pub struct DiskRequest {
    pub source: DiskSource,
    pub source_id: String,
    /// Guest device name; derived from the disk's position when absent.
    pub target: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InterfaceRequest {
    pub network_id: String,
    pub mac: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateVm {
    pub name: String,
    pub cpu: u32,
    pub ram_mb: u64,
    pub user_id: String,
    pub description: String,
    pub disks: Vec<DiskRequest>,
    pub interfaces: Vec<InterfaceRequest>,
}

/// Changes `edit` applies to a shut off VM; `None` and empty lists keep
/// the current configuration.
#[derive(Debug, Clone, Default)]
pub struct EditVm {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cpu: Option<u32>,
    pub ram_mb: Option<u64>,
    pub attach_disks: Vec<DiskRequest>,
    /// Disk IDs
    pub detach_disks: Vec<String>,
    pub add_interfaces: Vec<InterfaceRequest>,
    /// Interface IDs
    pub remove_interfaces: Vec<String>,
}

pub(super) fn domain_spec(vm: &VirtualMachine) -> DomainSpec {
    DomainSpec {
        id: vm.id.clone(),
        name: vm.name.clone(),
        cpu: vm.cpu,
        ram_mb: vm.ram_mb,
        disks: vm
            .disks
            .iter()
            .map(|d| DomainDisk {
                path: d.path.clone(),
                format: d.format,
                device: d.device(),
                read_only: d.read_only,
                cdrom: d.source == DiskSource::Image,
            })
            .collect(),
        interfaces: vm
            .virtual_interfaces
            .iter()
            .map(|i| DomainInterface {
                bridge: i.bridge.clone(),
                mac: i.mac.clone(),
                model: i.model.clone(),
            })
            .collect(),
    }
}

pub(super) fn require_power(vm: &VirtualMachine, expected: PowerState) -> Result<()> {
    if vm.power_state == expected {
        return Ok(());
    }
    Err(Error::PowerState {
        vm_id: vm.id.clone(),
        power_state: vm.power_state.to_string(),
        expected: expected.to_string(),
    })
}

/// Reject a disk request whose volume or image does not exist.
async fn check_disk_sources(uow: &mut UnitOfWork, requests: &[DiskRequest]) -> Result<()> {
    for request in requests {
        match request.source {
            DiskSource::Volume => {
                uow.volumes().get(&request.source_id).await?;
            }
            DiskSource::Image => {
                uow.images().get(&request.source_id).await?;
            }
        }
    }
    Ok(())
}

/// Interfaces for `requests`, numbered from `first`. Every network must be
/// `available` and explicit MACs must be well formed and unused.
async fn new_interfaces(
    uow: &mut UnitOfWork,
    vm_id: &str,
    first: u32,
    requests: &[InterfaceRequest],
) -> Result<Vec<VirtualInterface>> {
    let mut planned: Vec<VirtualInterface> = Vec::with_capacity(requests.len());
    for (position, request) in (first..).zip(requests) {
        let network = uow.networks().get(&request.network_id).await?;
        require_status(&network.id, network.status, &[NetworkStatus::Available])?;
        if let Some(mac) = &request.mac {
            if !valid_mac(mac) {
                return Err(Error::InvalidArgument(format!("invalid MAC address {mac:?}")));
            }
            if uow.vms().mac_in_use(mac).await? || planned.iter().any(|p| &p.mac == mac) {
                return Err(Error::already_exists("interface", mac.clone()));
            }
        }
        planned.push(VirtualInterface::new(
            vm_id,
            &network.id,
            &network.bridge,
            request.mac.clone(),
            request.model.clone(),
            position,
        ));
    }
    Ok(planned)
}

/// Volume and image managers VM disks are plugged in through.
#[derive(Clone)]
struct DiskSources {
    volumes: VolumeManager,
    images: ImageManager,
}

impl DiskSources {
    /// Attach each requested disk in order, recording it on the VM as soon as
    /// its backend answered. Stops at the first failure.
    async fn attach(
        &self,
        store: &Store,
        vm: &VirtualMachine,
        requests: &[DiskRequest],
        user_id: &str,
    ) -> Result<()> {
        let first = vm.disks.iter().map(|d| d.position + 1).max().unwrap_or(0);
        for (position, request) in (first..).zip(requests) {
            let target = request.target.clone();
            let (path, size, format, read_only) = match request.source {
                DiskSource::Volume => {
                    let info = self
                        .volumes
                        .attach(&request.source_id, &vm.id, target.clone(), user_id)
                        .await?;
                    (info.path, info.size, info.format, info.read_only)
                }
                DiskSource::Image => {
                    let info = self
                        .images
                        .attach(&request.source_id, &vm.id, target.clone(), user_id)
                        .await?;
                    (info.path, info.size, info.format, true)
                }
            };
            let disk = Disk {
                id: Uuid::new_v4().to_string(),
                vm_id: vm.id.clone(),
                source: request.source,
                source_id: request.source_id.clone(),
                target,
                path,
                size,
                format,
                read_only,
                position,
                created_at: timestamp(),
            };
            let mut uow = store.begin().await?;
            uow.vms().add_disk(&disk).await?;
            uow.commit().await?;
            debug!(vm_id = %vm.id, disk_id = %disk.id, device = %disk.device(), "Disk recorded");
        }
        Ok(())
    }

    /// Detach the disk's volume or image; the disk record goes with it.
    async fn detach(&self, disk: &Disk, user_id: &str) -> Result<()> {
        match disk.source {
            DiskSource::Volume => {
                self.volumes.detach(&disk.source_id, &disk.vm_id, user_id).await?;
            }
            DiskSource::Image => {
                self.images.detach(&disk.source_id, &disk.vm_id, user_id).await?;
            }
        }
        Ok(())
    }
}

/// Virtual machines and, through `snapshot.rs`, their snapshot chains.
#[derive(Clone)]
pub struct VmManager {
    pub(super) ctx: Context,
    tasks: Queue<VmTask, ()>,
    disks: DiskSources,
}

impl VmManager {
    pub fn spawn(
        ctx: Context,
        volumes: VolumeManager,
        images: ImageManager,
    ) -> (Self, JoinHandle<()>) {
        let disks = DiskSources { volumes, images };
        let (tasks, inbox) = queue("vm.tasks");
        let worker = serve(
            inbox,
            Arc::new(VmWorker {
                ctx: ctx.clone(),
                disks: disks.clone(),
            }),
        );
        (Self { ctx, tasks, disks }, worker)
    }

    pub async fn get(&self, id: &str) -> Result<VirtualMachine> {
        let mut uow = self.ctx.store.begin().await?;
        uow.vms().get(id).await
    }

    pub async fn list(&self) -> Result<Vec<VirtualMachine>> {
        let mut uow = self.ctx.store.begin().await?;
        uow.vms().get_all().await
    }

    pub async fn create(&self, request: CreateVm) -> Result<VirtualMachine> {
        if request.name.trim().is_empty() {
            return Err(Error::InvalidArgument("vm name must not be empty".into()));
        }
        if request.cpu == 0 || request.ram_mb == 0 {
            return Err(Error::InvalidArgument(
                "cpu and ram_mb must be greater than 0".into(),
            ));
        }

        let mut uow = self.ctx.store.begin().await?;
        if uow.vms().find_by_name(&request.name).await?.is_some() {
            return Err(Error::already_exists("vm", request.name));
        }
        check_disk_sources(&mut uow, &request.disks).await?;
        let mut vm = VirtualMachine::new(request.name, request.cpu, request.ram_mb, request.user_id);
        vm.description = request.description;
        vm.virtual_interfaces = new_interfaces(&mut uow, &vm.id, 0, &request.interfaces).await?;
        uow.vms().add(&vm).await?;
        uow.commit().await?;

        info!(
            vm_id = %vm.id,
            name = %vm.name,
            cpu = vm.cpu,
            ram_mb = vm.ram_mb,
            disks = request.disks.len(),
            interfaces = vm.virtual_interfaces.len(),
            "VM inserted"
        );
        self.ctx
            .events
            .add_event(&vm.id, &vm.user_id, "create_vm", "VM successfully inserted into db.");
        self.tasks.cast(VmTask::Create {
            vm_id: vm.id.clone(),
            disks: request.disks,
        });
        Ok(vm)
    }

    /// Change a shut off VM's settings, disks and interfaces.
    ///
    /// Settings and interfaces are committed together; disks are detached
    /// and then attached one by one, so a failing disk leaves the earlier
    /// ones in place.
    pub async fn edit(&self, id: &str, changes: EditVm, user_id: &str) -> Result<VirtualMachine> {
        let detach = {
            let mut uow = self.ctx.store.begin().await?;
            let vm = uow.vms().get(id).await?;
            require_status(id, vm.status, &[VmStatus::Available, VmStatus::Error])?;
            require_power(&vm, PowerState::ShutOff)?;

            let name = match changes.name {
                Some(name) if name.trim().is_empty() => {
                    return Err(Error::InvalidArgument("vm name must not be empty".into()));
                }
                Some(name) if name != vm.name => {
                    if uow.vms().find_by_name(&name).await?.is_some() {
                        return Err(Error::already_exists("vm", name));
                    }
                    name
                }
                _ => vm.name.clone(),
            };
            let cpu = changes.cpu.unwrap_or(vm.cpu);
            let ram_mb = changes.ram_mb.unwrap_or(vm.ram_mb);
            if cpu == 0 || ram_mb == 0 {
                return Err(Error::InvalidArgument(
                    "cpu and ram_mb must be greater than 0".into(),
                ));
            }
            let description = changes.description.unwrap_or_else(|| vm.description.clone());

            let detach = changes
                .detach_disks
                .iter()
                .map(|disk_id| {
                    vm.disks
                        .iter()
                        .find(|d| &d.id == disk_id)
                        .cloned()
                        .ok_or_else(|| Error::not_found("disk", disk_id))
                })
                .collect::<Result<Vec<_>>>()?;
            if let Some(missing) = changes
                .remove_interfaces
                .iter()
                .find(|iface| !vm.virtual_interfaces.iter().any(|i| &i.id == *iface))
            {
                return Err(Error::not_found("interface", missing));
            }
            check_disk_sources(&mut uow, &changes.attach_disks).await?;
            let first = vm
                .virtual_interfaces
                .iter()
                .map(|i| i.position + 1)
                .max()
                .unwrap_or(0);
            let added = new_interfaces(&mut uow, id, first, &changes.add_interfaces).await?;

            uow.vms().edit(id, &name, &description, cpu, ram_mb).await?;
            for iface in &changes.remove_interfaces {
                uow.vms().remove_interface(id, iface).await?;
            }
            for iface in &added {
                uow.vms().add_interface(iface).await?;
            }
            uow.commit().await?;
            detach
        };

        for disk in &detach {
            self.disks.detach(disk, user_id).await?;
        }
        if !changes.attach_disks.is_empty() {
            let vm = self.get(id).await?;
            self.disks
                .attach(&self.ctx.store, &vm, &changes.attach_disks, user_id)
                .await?;
        }

        let vm = self.get(id).await?;
        info!(
            vm_id = %id,
            disks = vm.disks.len(),
            interfaces = vm.virtual_interfaces.len(),
            "VM edited"
        );
        self.ctx
            .events
            .add_event(id, user_id, "edit_vm", "VM successfully edited.");
        Ok(vm)
    }

    pub async fn start(&self, id: &str, user_id: &str) -> Result<VirtualMachine> {
        self.begin(id, PowerState::ShutOff, VmStatus::Starting, user_id, "start_vm")
            .await?;
        self.tasks.cast(VmTask::Start {
            vm_id: id.to_string(),
        });
        self.get(id).await
    }

    pub async fn shut_off(&self, id: &str, user_id: &str) -> Result<VirtualMachine> {
        self.begin(id, PowerState::Running, VmStatus::ShuttingOff, user_id, "shut_off_vm")
            .await?;
        self.tasks.cast(VmTask::ShutOff {
            vm_id: id.to_string(),
        });
        self.get(id).await
    }

    /// Delete a shut off VM together with its snapshots and attachments.
    pub async fn delete(&self, id: &str, user_id: &str) -> Result<VirtualMachine> {
        self.begin(id, PowerState::ShutOff, VmStatus::Deleting, user_id, "delete_vm")
            .await?;
        self.tasks.cast(VmTask::Delete {
            vm_id: id.to_string(),
        });
        self.get(id).await
    }

    /// Gate on status and power state, then move to the transitional status.
    async fn begin(
        &self,
        id: &str,
        power: PowerState,
        to: VmStatus,
        user_id: &str,
        action: &str,
    ) -> Result<()> {
        let stable = [VmStatus::Available, VmStatus::Error];
        let mut uow = self.ctx.store.begin().await?;
        let vm = uow.vms().get(id).await?;
        require_status(id, vm.status, &stable)?;
        require_power(&vm, power)?;
        uow.vms().transition(id, &stable, to, None).await?;
        uow.commit().await?;

        debug!(vm_id = %id, status = %to, "VM operation accepted");
        self.ctx
            .events
            .add_event(id, user_id, action, format!("VM {to} requested."));
        Ok(())
    }
}

/// Power state as observed, with a running VM in `error` declared healthy.
fn vm_correction(vm: &VirtualMachine, state: &DomainState) -> VmPatch {
    let recovered = vm.status == VmStatus::Error && state.power_state == PowerState::Running;
    VmPatch {
        id: vm.id.clone(),
        expected_status: vm.status,
        status: if recovered {
            VmStatus::Available
        } else {
            vm.status
        },
        power_state: state.power_state,
        information: if recovered {
            String::new()
        } else {
            vm.information.clone()
        },
    }
}

/// Align a running VM's snapshot records with the hypervisor's list.
///
/// Only `running` records are touched: one missing on the hypervisor goes to
/// `error`, and the current flag follows the hypervisor's current snapshot.
fn snapshot_corrections(snapshots: &[Snapshot], state: &DomainState) -> Vec<SnapshotPatch> {
    snapshots
        .iter()
        .filter(|s| s.status == SnapshotStatus::Running)
        .filter_map(|s| {
            if !state.snapshots.contains(&s.name) {
                return Some(SnapshotPatch {
                    id: s.id.clone(),
                    expected_status: s.status,
                    status: SnapshotStatus::Error,
                    is_current: false,
                    information: format!("snapshot {} not found on the hypervisor", s.name),
                });
            }
            let is_current = state.current_snapshot.as_deref() == Some(s.name.as_str());
            (is_current != s.is_current).then(|| SnapshotPatch {
                id: s.id.clone(),
                expected_status: s.status,
                status: s.status,
                is_current,
                information: s.information.clone(),
            })
        })
        .collect()
}

#[async_trait]
impl Monitor for VmManager {
    fn name(&self) -> &'static str {
        "vm"
    }

    async fn tick(&self) -> Result<TickReport> {
        let (vms, mut snapshots) = {
            let mut uow = self.ctx.store.begin().await?;
            let vms = uow.vms().get_all().await?;
            let mut snapshots: HashMap<String, Vec<Snapshot>> = HashMap::new();
            for s in uow.snapshots().get_all().await? {
                snapshots.entry(s.vm_id.clone()).or_default().push(s);
            }
            (vms, snapshots)
        };

        let mut report = TickReport::default();
        let mut vm_patches = Vec::new();
        let mut snapshot_patches = Vec::new();
        for vm in &vms {
            if !VmStatus::MONITORED.contains(&vm.status) {
                debug!(vm_id = %vm.id, status = %vm.status, "VM not monitored in this status");
                report.skipped += 1;
                continue;
            }
            report.checked += 1;
            let state = self
                .ctx
                .executors
                .vms
                .call(
                    VmCommand::QueryState {
                        domain: domain_spec(vm),
                    },
                    self.ctx.config.call_timeout,
                )
                .await
                .and_then(|r| r.into_info());
            let state = match state {
                Ok(state) => state,
                Err(e) => {
                    warn!(vm_id = %vm.id, error = %e, "VM query failed");
                    report.failed += 1;
                    continue;
                }
            };

            vm_patches.push(vm_correction(vm, &state));
            let own = snapshots.remove(&vm.id).unwrap_or_default();
            let busy = own.iter().any(|s| s.status.is_transitional());
            if state.power_state == PowerState::Running && !busy {
                snapshot_patches.extend(snapshot_corrections(&own, &state));
            }
        }

        let mut uow = self.ctx.store.begin().await?;
        report.corrected = uow.vms().bulk_update(&vm_patches).await?
            + uow.snapshots().bulk_update(&snapshot_patches).await?;
        uow.commit().await?;
        debug!(?report, "VM monitor tick");
        Ok(report)
    }
}

struct VmWorker {
    ctx: Context,
    disks: DiskSources,
}

#[async_trait]
impl Handler<VmTask, ()> for VmWorker {
    async fn handle(&self, task: VmTask) -> std::result::Result<(), Failure> {
        let result = match task {
            VmTask::Create { vm_id, disks } => self.create(&vm_id, &disks).await,
            VmTask::Start { vm_id } => {
                self.power(&vm_id, VmStatus::Starting, "start_vm").await
            }
            VmTask::ShutOff { vm_id } => {
                self.power(&vm_id, VmStatus::ShuttingOff, "shut_off_vm")
                    .await
            }
            VmTask::Delete { vm_id } => self.delete(&vm_id).await,
        };
        result.map_err(Failure::from)
    }
}

impl VmWorker {
    async fn fail(&self, vm: &VirtualMachine, from: VmStatus, action: &str, err: Error) -> Error {
        self.ctx.report(&vm.id, &vm.user_id, action, &err);
        let message = err.to_string();
        let persisted = async {
            let mut uow = self.ctx.store.begin().await?;
            uow.vms()
                .transition(&vm.id, &[from], VmStatus::Error, Some(&message))
                .await?;
            uow.commit().await
        }
        .await;
        if let Err(e) = persisted {
            warn!(vm_id = %vm.id, error = %e, "Could not persist VM failure");
        }
        err
    }

    async fn call(&self, command: VmCommand) -> Result<DomainState> {
        self.ctx
            .executors
            .vms
            .call(command, self.ctx.config.call_timeout)
            .await?
            .into_info()
    }

    /// Persist what the hypervisor reported and settle on `available`.
    async fn settle(&self, id: &str, from: VmStatus, state: &DomainState) -> Result<()> {
        let mut uow = self.ctx.store.begin().await?;
        uow.vms().set_power_state(id, state.power_state).await?;
        uow.vms()
            .transition(id, &[from], VmStatus::Available, Some(""))
            .await?;
        uow.commit().await
    }

    async fn create(&self, id: &str, disks: &[DiskRequest]) -> Result<()> {
        let vm = {
            let mut uow = self.ctx.store.begin().await?;
            let vm = uow.vms().get(id).await?;
            uow.vms()
                .transition(id, &[VmStatus::New], VmStatus::Creating, None)
                .await?;
            uow.commit().await?;
            vm
        };

        let attached = async {
            self.disks
                .attach(&self.ctx.store, &vm, disks, &vm.user_id)
                .await?;
            let mut uow = self.ctx.store.begin().await?;
            uow.vms().get(id).await
        }
        .await;
        let vm = match attached {
            Ok(vm) => vm,
            Err(e) => return Err(self.fail(&vm, VmStatus::Creating, "create_vm", e).await),
        };

        let state = match self
            .call(VmCommand::Create {
                domain: domain_spec(&vm),
            })
            .await
        {
            Ok(state) => state,
            Err(e) => return Err(self.fail(&vm, VmStatus::Creating, "create_vm", e).await),
        };
        self.settle(id, VmStatus::Creating, &state).await?;

        info!(vm_id = %id, power_state = %state.power_state, "VM created");
        self.ctx
            .events
            .add_event(id, &vm.user_id, "create_vm", "VM successfully created.");
        Ok(())
    }

    /// Finish a start or shut off request.
    async fn power(&self, id: &str, from: VmStatus, action: &str) -> Result<()> {
        let vm = {
            let mut uow = self.ctx.store.begin().await?;
            uow.vms().get(id).await?
        };

        let domain = domain_spec(&vm);
        let command = match from {
            VmStatus::Starting => VmCommand::Start { domain },
            _ => VmCommand::ShutOff { domain },
        };
        let state = match self.call(command).await {
            Ok(state) => state,
            Err(e) => return Err(self.fail(&vm, from, action, e).await),
        };
        self.settle(id, from, &state).await?;

        info!(vm_id = %id, power_state = %state.power_state, "VM power state changed");
        self.ctx.events.add_event(
            id,
            &vm.user_id,
            action,
            format!("VM power state is {}.", state.power_state),
        );
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let vm = {
            let mut uow = self.ctx.store.begin().await?;
            uow.vms().get(id).await?
        };

        let outcome = self
            .ctx
            .executors
            .vms
            .call(
                VmCommand::Delete {
                    domain: domain_spec(&vm),
                },
                self.ctx.config.call_timeout,
            )
            .await;
        if let Err(e) = outcome {
            return Err(self.fail(&vm, VmStatus::Deleting, "delete_vm", e).await);
        }

        let mut uow = self.ctx.store.begin().await?;
        let volumes = uow.volumes().remove_attachments_for_vm(id).await?;
        let images = uow.images().remove_attachments_for_vm(id).await?;
        uow.vms().delete(id).await?;
        uow.commit().await?;

        info!(vm_id = %id, volumes, images, "VM deleted");
        self.ctx
            .events
            .add_event(id, &vm.user_id, "delete_vm", "VM successfully deleted.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(status: VmStatus) -> VirtualMachine {
        let mut vm = VirtualMachine::new("web".into(), 2, 2048, "u".into());
        vm.status = status;
        vm.information = "start failed".into();
        vm
    }

    fn state(power_state: PowerState, snapshots: &[&str], current: Option<&str>) -> DomainState {
        DomainState {
            power_state,
            snapshots: snapshots.iter().map(|s| s.to_string()).collect(),
            current_snapshot: current.map(String::from),
        }
    }

    fn snap(name: &str, current: bool) -> Snapshot {
        let mut s = Snapshot::new("vm", name.into(), String::new(), None);
        s.status = SnapshotStatus::Running;
        s.is_current = current;
        s
    }

    #[test]
    fn running_vm_in_error_recovers() {
        let patch = vm_correction(&vm(VmStatus::Error), &state(PowerState::Running, &[], None));
        assert_eq!(patch.expected_status, VmStatus::Error);
        assert_eq!(patch.status, VmStatus::Available);
        assert!(patch.information.is_empty());

        let patch = vm_correction(&vm(VmStatus::Error), &state(PowerState::ShutOff, &[], None));
        assert_eq!(patch.status, VmStatus::Error);
        assert_eq!(patch.information, "start failed");
        assert_eq!(patch.power_state, PowerState::ShutOff);
    }

    #[test]
    fn missing_snapshot_goes_to_error() {
        let snapshots = vec![snap("s1", false), snap("s2", true)];
        let patches = snapshot_corrections(&snapshots, &state(PowerState::Running, &["s1"], None));
        let missing = patches.iter().find(|p| p.id == snapshots[1].id).unwrap();
        assert_eq!(missing.status, SnapshotStatus::Error);
        assert!(!missing.is_current);
        assert_eq!(patches.len(), 1);
    }

    #[test]
    fn current_flag_follows_hypervisor() {
        let snapshots = vec![snap("s1", false), snap("s2", true)];
        let patches = snapshot_corrections(
            &snapshots,
            &state(PowerState::Running, &["s1", "s2"], Some("s1")),
        );
        assert_eq!(patches.len(), 2);
        assert!(patches.iter().any(|p| p.id == snapshots[0].id && p.is_current));
        assert!(patches.iter().any(|p| p.id == snapshots[1].id && !p.is_current));
    }

    #[test]
    fn agreeing_snapshots_need_no_patch() {
        let snapshots = vec![snap("s1", true)];
        let patches =
            snapshot_corrections(&snapshots, &state(PowerState::Running, &["s1"], Some("s1")));
        assert!(patches.is_empty());
    }

    #[test]
    fn power_state_gate() {
        let v = vm(VmStatus::Available);
        assert!(require_power(&v, PowerState::ShutOff).is_ok());
        let err = require_power(&v, PowerState::Running).unwrap_err();
        assert_eq!(err.kind(), "PowerState");
    }
}
