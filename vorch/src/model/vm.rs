use serde::Serialize;
use uuid::Uuid;

use super::{Status, VolumeFormat, timestamp};

string_enum! {
    /// VM control-plane status
    pub enum VmStatus {
        New => "new",
        Creating => "creating",
        Available => "available",
        Error => "error",
        Starting => "starting",
        ShuttingOff => "shutting_off",
        Deleting => "deleting",
    }
}

impl Status for VmStatus {
    const ENTITY: &'static str = "vm";

    fn as_str(&self) -> &'static str {
        VmStatus::as_str(self)
    }

    fn allows(self, next: Self) -> bool {
        use VmStatus::*;
        matches!(
            (self, next),
            (New, Creating)
                | (Creating, Available | Error)
                | (Available | Error, Starting | ShuttingOff | Deleting)
                | (Starting | ShuttingOff, Available | Error)
                | (Deleting, Error)
        )
    }
}

impl VmStatus {
    pub const MONITORED: &'static [VmStatus] = &[VmStatus::Available, VmStatus::Error];
}

string_enum! {
    /// Hypervisor-reported power state
    pub enum PowerState {
        Running => "running",
        ShutOff => "shut_off",
        Paused => "paused",
    }
}

string_enum! {
    /// What backs a VM disk
    pub enum DiskSource {
        Volume => "volume",
        Image => "image",
    }
}

/// Volume or image plugged into a VM, with the location the backend
/// reported when it was attached.
#[derive(Debug, Clone, Serialize)]
pub struct Disk {
    pub id: String,
    pub vm_id: String,
    pub source: DiskSource,
    pub source_id: String,
    pub target: Option<String>,
    pub path: String,
    pub size: u64,
    pub format: VolumeFormat,
    pub read_only: bool,
    pub position: u32,
    pub created_at: String,
}

impl Disk {
    /// Guest device name: the requested one, or the next free `vdX`/`sdX`
    /// slot derived from the disk's position.
    pub fn device(&self) -> String {
        if let Some(target) = &self.target {
            return target.clone();
        }
        let prefix = match self.source {
            DiskSource::Volume => "vd",
            DiskSource::Image => "sd",
        };
        let letter = char::from(b'a' + (self.position % 26) as u8);
        format!("{prefix}{letter}")
    }
}

/// VM network interface plugged into a virtual network's bridge.
#[derive(Debug, Clone, Serialize)]
pub struct VirtualInterface {
    pub id: String,
    pub vm_id: String,
    pub network_id: String,
    pub bridge: String,
    pub mac: String,
    pub model: String,
    pub position: u32,
    pub created_at: String,
}

impl VirtualInterface {
    pub fn new(
        vm_id: &str,
        network_id: &str,
        bridge: &str,
        mac: Option<String>,
        model: Option<String>,
        position: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            vm_id: vm_id.to_string(),
            network_id: network_id.to_string(),
            bridge: bridge.to_string(),
            mac: mac.unwrap_or_else(random_mac),
            model: model.unwrap_or_else(|| "virtio".to_string()),
            position,
            created_at: timestamp(),
        }
    }
}

/// Locally administered address in the QEMU/KVM range.
fn random_mac() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

/// Check a `aa:bb:cc:dd:ee:ff` MAC address.
pub fn valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Virtual machine record
#[derive(Debug, Clone, Serialize)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    pub cpu: u32,
    pub ram_mb: u64,
    pub power_state: PowerState,
    pub status: VmStatus,
    pub user_id: String,
    pub description: String,
    pub information: String,
    pub disks: Vec<Disk>,
    pub virtual_interfaces: Vec<VirtualInterface>,
    pub created_at: String,
    pub updated_at: String,
}

impl VirtualMachine {
    pub fn new(name: String, cpu: u32, ram_mb: u64, user_id: String) -> Self {
        let now = timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            cpu,
            ram_mb,
            power_state: PowerState::ShutOff,
            status: VmStatus::New,
            user_id,
            description: String::new(),
            information: String::new(),
            disks: Vec::new(),
            virtual_interfaces: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Reconciler correction for a VM, applied only if the VM is still in
/// `expected_status`.
#[derive(Debug, Clone, PartialEq)]
pub struct VmPatch {
    pub id: String,
    pub expected_status: VmStatus,
    pub status: VmStatus,
    pub power_state: PowerState,
    pub information: String,
}
