//! Shared harness: in-memory store, fake host drivers in the real registry
//! and polling helpers.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vorch::Config;
use vorch::executor::{
    DomainDriver, DomainSpec, DomainState, DriverError, DriverRegistry, DriverResult, Executors,
    ImageDriver, ImageInfo, ImageSpec, NetworkDriver, NetworkInfo, NetworkSpec, StorageDriver,
    StorageInfo, StorageSpec, VolumeDriver, VolumeInfo, VolumeSpec,
};
use vorch::manager::{Context, CreateStorage, CreateVm, Managers};
use vorch::model::{
    NetworkState, PowerState, Storage, StorageBackend, StorageKind, StorageStatus, VirtualMachine,
    VmStatus,
};
use vorch::store::Store;
use vorch_log::EventLogger;

pub const GIB: u64 = 1 << 30;

#[derive(Default)]
struct HostState {
    volumes: HashMap<String, VolumeInfo>,
    domains: HashMap<String, DomainState>,
    bridges: HashMap<String, NetworkState>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    calls: Vec<String>,
}

/// In-memory stand-in for every host driver.
///
/// Calls are recorded as `"<op> <id>"`. An operation fails when its name or
/// the entity id was registered with [`FakeHost::fail`], and stalls for the
/// duration given to [`FakeHost::delay`] before it touches any state.
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn fail(&self, key: &str) {
        self.state.lock().unwrap().failing.insert(key.to_string());
    }

    pub fn heal(&self, key: &str) {
        self.state.lock().unwrap().failing.remove(key);
    }

    /// Hold every `op` call for `pause` so tests can observe it in flight.
    pub fn delay(&self, op: &str, pause: Duration) {
        self.state
            .lock()
            .unwrap()
            .delays
            .insert(op.to_string(), pause);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.split(' ').next() == Some(op)).count()
    }

    /// Change a domain's power state behind the control plane's back.
    pub fn set_power(&self, vm_id: &str, power_state: PowerState) {
        if let Some(d) = self.state.lock().unwrap().domains.get_mut(vm_id) {
            d.power_state = power_state;
        }
    }

    /// Drop a snapshot on the hypervisor only.
    pub fn lose_snapshot(&self, vm_id: &str, name: &str) {
        if let Some(d) = self.state.lock().unwrap().domains.get_mut(vm_id) {
            d.snapshots.retain(|s| s != name);
            if d.current_snapshot.as_deref() == Some(name) {
                d.current_snapshot = None;
            }
        }
    }

    pub fn domain(&self, vm_id: &str) -> Option<DomainState> {
        self.state.lock().unwrap().domains.get(vm_id).cloned()
    }

    pub fn set_bridge(&self, bridge: &str, state: NetworkState) {
        self.state
            .lock()
            .unwrap()
            .bridges
            .insert(bridge.to_string(), state);
    }

    async fn enter(
        &self,
        op: &str,
        id: &str,
    ) -> DriverResult<std::sync::MutexGuard<'_, HostState>> {
        let pause = self.state.lock().unwrap().delays.get(op).copied();
        if let Some(pause) = pause {
            tokio::time::sleep(pause).await;
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{op} {id}"));
        if state.failing.contains(op) || state.failing.contains(id) {
            return Err(DriverError::Command {
                program: "fake".into(),
                code: Some(1),
                stderr: format!("{op} {id} failed"),
            });
        }
        Ok(state)
    }

    fn domain_mut<'a>(state: &'a mut HostState, id: &str) -> DriverResult<&'a mut DomainState> {
        state
            .domains
            .get_mut(id)
            .ok_or_else(|| DriverError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl StorageDriver for FakeHost {
    async fn create(&self, storage: &StorageSpec) -> DriverResult<StorageInfo> {
        let _state = self.enter("create_storage", &storage.id).await?;
        Ok(StorageInfo {
            size: 10 * GIB,
            available: 8 * GIB,
            mount_point: format!("/mnt/{}", storage.id),
        })
    }

    async fn delete(&self, storage: &StorageSpec) -> DriverResult<()> {
        let _state = self.enter("delete_storage", &storage.id).await?;
        Ok(())
    }

    async fn query_info(&self, storage: &StorageSpec) -> DriverResult<StorageInfo> {
        let _state = self.enter("query_storage", &storage.id).await?;
        Ok(StorageInfo {
            size: 10 * GIB,
            available: 7 * GIB,
            mount_point: storage.mount_point.clone().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl VolumeDriver for FakeHost {
    async fn create(&self, volume: &VolumeSpec) -> DriverResult<VolumeInfo> {
        let mut state = self.enter("create_volume", &volume.id).await?;
        let info = VolumeInfo {
            size: volume.size,
            used: 0,
            path: volume.file_path(),
        };
        state.volumes.insert(volume.id.clone(), info.clone());
        Ok(info)
    }

    async fn delete(&self, volume: &VolumeSpec) -> DriverResult<()> {
        let mut state = self.enter("delete_volume", &volume.id).await?;
        state.volumes.remove(&volume.id);
        Ok(())
    }

    async fn extend(&self, volume: &VolumeSpec, new_size: u64) -> DriverResult<VolumeInfo> {
        let mut state = self.enter("extend_volume", &volume.id).await?;
        let info = state
            .volumes
            .get_mut(&volume.id)
            .ok_or_else(|| DriverError::NotFound(volume.id.clone()))?;
        info.size = new_size;
        Ok(info.clone())
    }

    async fn query_info(&self, volume: &VolumeSpec) -> DriverResult<VolumeInfo> {
        let state = self.enter("query_volume", &volume.id).await?;
        state
            .volumes
            .get(&volume.id)
            .map(|info| VolumeInfo {
                used: info.size / 4,
                ..info.clone()
            })
            .ok_or_else(|| DriverError::NotFound(volume.id.clone()))
    }
}

#[async_trait]
impl ImageDriver for FakeHost {
    async fn upload(&self, image: &ImageSpec) -> DriverResult<ImageInfo> {
        let _state = self.enter("upload_image", &image.id).await?;
        let size = std::fs::metadata(&image.source).map(|m| m.len())?;
        Ok(ImageInfo {
            size,
            path: image.file_path(),
        })
    }

    async fn delete(&self, image: &ImageSpec) -> DriverResult<()> {
        let _state = self.enter("delete_image", &image.id).await?;
        Ok(())
    }

    async fn query_info(&self, image: &ImageSpec) -> DriverResult<ImageInfo> {
        let _state = self.enter("query_image", &image.id).await?;
        Ok(ImageInfo {
            size: 4096,
            path: image.file_path(),
        })
    }
}

#[async_trait]
impl DomainDriver for FakeHost {
    async fn create(&self, domain: &DomainSpec) -> DriverResult<DomainState> {
        let mut state = self.enter("create_domain", &domain.id).await?;
        let created = DomainState {
            power_state: PowerState::ShutOff,
            snapshots: Vec::new(),
            current_snapshot: None,
        };
        state.domains.insert(domain.id.clone(), created.clone());
        Ok(created)
    }

    async fn delete(&self, domain: &DomainSpec) -> DriverResult<()> {
        let mut state = self.enter("delete_domain", &domain.id).await?;
        state.domains.remove(&domain.id);
        Ok(())
    }

    async fn start(&self, domain: &DomainSpec) -> DriverResult<DomainState> {
        let mut state = self.enter("start_domain", &domain.id).await?;
        let d = Self::domain_mut(&mut state, &domain.id)?;
        d.power_state = PowerState::Running;
        Ok(d.clone())
    }

    async fn shut_off(&self, domain: &DomainSpec) -> DriverResult<DomainState> {
        let mut state = self.enter("shut_off_domain", &domain.id).await?;
        let d = Self::domain_mut(&mut state, &domain.id)?;
        d.power_state = PowerState::ShutOff;
        Ok(d.clone())
    }

    async fn query_state(&self, domain: &DomainSpec) -> DriverResult<DomainState> {
        let mut state = self.enter("query_domain", &domain.id).await?;
        Self::domain_mut(&mut state, &domain.id).map(|d| d.clone())
    }

    async fn create_snapshot(
        &self,
        domain: &DomainSpec,
        name: &str,
        _description: &str,
    ) -> DriverResult<DomainState> {
        let mut state = self.enter("create_snapshot", &domain.id).await?;
        let d = Self::domain_mut(&mut state, &domain.id)?;
        d.snapshots.push(name.to_string());
        d.current_snapshot = Some(name.to_string());
        Ok(d.clone())
    }

    async fn delete_snapshot(
        &self,
        domain: &DomainSpec,
        name: &str,
        _children: &[String],
    ) -> DriverResult<DomainState> {
        let mut state = self.enter("delete_snapshot", &domain.id).await?;
        let d = Self::domain_mut(&mut state, &domain.id)?;
        d.snapshots.retain(|s| s != name);
        if d.current_snapshot.as_deref() == Some(name) {
            d.current_snapshot = None;
        }
        Ok(d.clone())
    }

    async fn revert_snapshot(&self, domain: &DomainSpec, name: &str) -> DriverResult<DomainState> {
        let mut state = self.enter("revert_snapshot", &domain.id).await?;
        let d = Self::domain_mut(&mut state, &domain.id)?;
        if !d.snapshots.iter().any(|s| s == name) {
            return Err(DriverError::NotFound(name.to_string()));
        }
        d.current_snapshot = Some(name.to_string());
        Ok(d.clone())
    }
}

#[async_trait]
impl NetworkDriver for FakeHost {
    async fn create(&self, network: &NetworkSpec) -> DriverResult<NetworkInfo> {
        let mut state = self.enter("create_network", &network.id).await?;
        let link = *state
            .bridges
            .entry(network.bridge.clone())
            .or_insert(NetworkState::Off);
        Ok(NetworkInfo { state: link })
    }

    async fn delete(&self, network: &NetworkSpec) -> DriverResult<()> {
        let mut state = self.enter("delete_network", &network.id).await?;
        state.bridges.remove(&network.bridge);
        Ok(())
    }

    async fn enable(&self, network: &NetworkSpec) -> DriverResult<NetworkInfo> {
        let mut state = self.enter("enable_network", &network.id).await?;
        state.bridges.insert(network.bridge.clone(), NetworkState::On);
        Ok(NetworkInfo {
            state: NetworkState::On,
        })
    }

    async fn disable(&self, network: &NetworkSpec) -> DriverResult<NetworkInfo> {
        let mut state = self.enter("disable_network", &network.id).await?;
        state.bridges.insert(network.bridge.clone(), NetworkState::Off);
        Ok(NetworkInfo {
            state: NetworkState::Off,
        })
    }

    async fn query_state(&self, network: &NetworkSpec) -> DriverResult<NetworkInfo> {
        let state = self.enter("query_network", &network.id).await?;
        state
            .bridges
            .get(&network.bridge)
            .map(|s| NetworkInfo { state: *s })
            .ok_or_else(|| DriverError::NotFound(network.bridge.clone()))
    }
}

pub struct Harness {
    pub managers: Managers,
    pub host: Arc<FakeHost>,
    pub store: Arc<Store>,
}

pub async fn harness() -> Harness {
    harness_with(Config {
        call_timeout: Duration::from_secs(5),
        ..Config::default()
    })
    .await
}

pub async fn harness_with(config: Config) -> Harness {
    let host = Arc::new(FakeHost::default());
    let mut registry = DriverRegistry::new()
        .with_domain_driver(host.clone())
        .with_network_driver(host.clone());
    for kind in [StorageKind::LocalFs, StorageKind::Nfs] {
        registry = registry
            .with_storage_driver(kind, host.clone())
            .with_volume_driver(kind, host.clone())
            .with_image_driver(kind, host.clone());
    }
    let (executors, _workers) = Executors::spawn(Arc::new(registry));

    let store = Arc::new(Store::in_memory().await.unwrap());
    let managers = Managers::start(Context {
        store: store.clone(),
        executors,
        events: EventLogger::new_noop(),
        config,
    });
    Harness {
        managers,
        host,
        store,
    }
}

/// Poll `check` until it yields a value, panicking after five seconds.
pub async fn wait_for<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

impl Harness {
    /// Create an NFS storage and wait until it is available.
    pub async fn storage(&self, name: &str) -> Storage {
        let storage = self
            .managers
            .storages
            .create(CreateStorage {
                name: name.into(),
                backend: StorageBackend::Nfs {
                    ip: "10.0.0.5".into(),
                    path: format!("/exports/{name}"),
                },
                user_id: "admin".into(),
                description: String::new(),
            })
            .await
            .unwrap();
        let storages = &self.managers.storages;
        let id = storage.id.as_str();
        wait_for("storage to become available", || async move {
            storages
                .get(id)
                .await
                .ok()
                .filter(|s| s.status == StorageStatus::Available)
        })
        .await
    }

    /// Create a VM and wait until it is available (and shut off).
    pub async fn vm(&self, name: &str) -> VirtualMachine {
        let vm = self
            .managers
            .vms
            .create(CreateVm {
                name: name.into(),
                cpu: 2,
                ram_mb: 2048,
                user_id: "admin".into(),
                description: String::new(),
                ..Default::default()
            })
            .await
            .unwrap();
        self.settled_vm(&vm.id).await
    }

    /// Create a VM, start it and wait until it is running.
    pub async fn running_vm(&self, name: &str) -> VirtualMachine {
        let vm = self.vm(name).await;
        self.managers.vms.start(&vm.id, "admin").await.unwrap();
        let vm = self.settled_vm(&vm.id).await;
        assert_eq!(vm.power_state, PowerState::Running);
        vm
    }

    /// Wait until the VM leaves its transitional statuses.
    pub async fn settled_vm(&self, id: &str) -> VirtualMachine {
        let vms = &self.managers.vms;
        wait_for("vm to settle", || async move {
            vms.get(id)
                .await
                .ok()
                .filter(|vm| matches!(vm.status, VmStatus::Available | VmStatus::Error))
        })
        .await
    }
}
