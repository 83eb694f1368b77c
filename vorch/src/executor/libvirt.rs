//! Domain driver on top of `virsh`.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use super::process::{run, run_optional};
use super::{DomainDisk, DomainDriver, DomainInterface, DomainSpec, DomainState, DriverResult};
use crate::model::PowerState;

pub struct VirshDomains {
    uri: String,
    definitions: PathBuf,
}

impl VirshDomains {
    /// `definitions` is where generated domain XML is written before `define`.
    pub fn new(uri: impl Into<String>, definitions: impl Into<PathBuf>) -> Self {
        Self {
            uri: uri.into(),
            definitions: definitions.into(),
        }
    }

    async fn virsh(&self, args: &[&str]) -> DriverResult<String> {
        let mut full = vec!["-c", self.uri.as_str()];
        full.extend_from_slice(args);
        run("virsh", &full).await
    }

    async fn virsh_optional(&self, args: &[&str]) -> DriverResult<Option<String>> {
        let mut full = vec!["-c", self.uri.as_str()];
        full.extend_from_slice(args);
        run_optional("virsh", &full).await
    }

    async fn define(&self, domain: &DomainSpec) -> DriverResult<()> {
        tokio::fs::create_dir_all(&self.definitions).await?;
        let path = self.definitions.join(format!("{}.xml", domain.id));
        tokio::fs::write(&path, domain_xml(domain)).await?;
        self.virsh(&["define", &path.to_string_lossy()]).await?;
        Ok(())
    }

    async fn state(&self, domain: &DomainSpec) -> DriverResult<DomainState> {
        let name = domain.name.as_str();
        let power = self.virsh(&["domstate", name]).await?;
        let snapshots = self
            .virsh(&["snapshot-list", "--domain", name, "--name"])
            .await?;
        let current = self
            .virsh_optional(&["snapshot-current", "--domain", name, "--name"])
            .await?;
        Ok(DomainState {
            power_state: parse_domstate(&power),
            snapshots: parse_names(&snapshots),
            current_snapshot: current
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        })
    }
}

fn parse_domstate(output: &str) -> PowerState {
    match output.trim() {
        "running" | "in shutdown" => PowerState::Running,
        "paused" | "pmsuspended" => PowerState::Paused,
        _ => PowerState::ShutOff,
    }
}

fn parse_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

fn disk_xml(disk: &DomainDisk) -> String {
    let (device, bus) = if disk.cdrom {
        ("cdrom", "sata")
    } else {
        ("disk", "virtio")
    };
    let readonly = if disk.read_only || disk.cdrom {
        "<readonly/>"
    } else {
        ""
    };
    format!(
        "    <disk type='file' device='{device}'><driver name='qemu' type='{format}'/>\
         <source file='{path}'/><target dev='{dev}' bus='{bus}'/>{readonly}</disk>\n",
        format = disk.format,
        path = disk.path,
        dev = disk.device,
    )
}

fn interface_xml(iface: &DomainInterface) -> String {
    format!(
        "    <interface type='bridge'><mac address='{mac}'/><source bridge='{bridge}'/>\
         <model type='{model}'/></interface>\n",
        mac = iface.mac,
        bridge = iface.bridge,
        model = iface.model,
    )
}

fn domain_xml(domain: &DomainSpec) -> String {
    let mut devices = String::new();
    for disk in &domain.disks {
        devices.push_str(&disk_xml(disk));
    }
    for iface in &domain.interfaces {
        devices.push_str(&interface_xml(iface));
    }
    format!(
        "<domain type='kvm'>\n  <name>{name}</name>\n  <uuid>{id}</uuid>\n  \
         <memory unit='MiB'>{ram}</memory>\n  <vcpu>{cpu}</vcpu>\n  \
         <os><type arch='x86_64'>hvm</type></os>\n  \
         <devices>\n{devices}    <console type='pty'/>\n  </devices>\n</domain>\n",
        name = domain.name,
        id = domain.id,
        ram = domain.ram_mb,
        cpu = domain.cpu,
    )
}

#[async_trait]
impl DomainDriver for VirshDomains {
    async fn create(&self, domain: &DomainSpec) -> DriverResult<DomainState> {
        self.define(domain).await?;
        info!(vm_id = %domain.id, name = %domain.name, "Domain defined");
        self.state(domain).await
    }

    async fn delete(&self, domain: &DomainSpec) -> DriverResult<()> {
        let name = domain.name.as_str();
        // Not running is fine.
        self.virsh_optional(&["destroy", name]).await?;
        self.virsh(&["undefine", name, "--snapshots-metadata"]).await?;
        let _ = tokio::fs::remove_file(self.definitions.join(format!("{}.xml", domain.id))).await;
        info!(vm_id = %domain.id, name = %name, "Domain undefined");
        Ok(())
    }

    /// Redefines the domain first so edits made while it was shut off apply.
    async fn start(&self, domain: &DomainSpec) -> DriverResult<DomainState> {
        self.define(domain).await?;
        self.virsh(&["start", &domain.name]).await?;
        self.state(domain).await
    }

    async fn shut_off(&self, domain: &DomainSpec) -> DriverResult<DomainState> {
        self.virsh(&["destroy", &domain.name]).await?;
        self.state(domain).await
    }

    async fn query_state(&self, domain: &DomainSpec) -> DriverResult<DomainState> {
        self.state(domain).await
    }

    async fn create_snapshot(
        &self,
        domain: &DomainSpec,
        name: &str,
        description: &str,
    ) -> DriverResult<DomainState> {
        self.virsh(&[
            "snapshot-create-as",
            "--domain",
            &domain.name,
            "--name",
            name,
            "--description",
            description,
        ])
        .await?;
        info!(vm_id = %domain.id, snapshot = %name, "Snapshot created");
        self.state(domain).await
    }

    async fn delete_snapshot(
        &self,
        domain: &DomainSpec,
        name: &str,
        children: &[String],
    ) -> DriverResult<DomainState> {
        debug!(vm_id = %domain.id, snapshot = %name, ?children, "Deleting snapshot");
        self.virsh(&["snapshot-delete", "--domain", &domain.name, "--snapshotname", name])
            .await?;
        self.state(domain).await
    }

    async fn revert_snapshot(&self, domain: &DomainSpec, name: &str) -> DriverResult<DomainState> {
        self.virsh(&[
            "snapshot-revert",
            "--domain",
            &domain.name,
            "--snapshotname",
            name,
            "--running",
        ])
        .await?;
        info!(vm_id = %domain.id, snapshot = %name, "Snapshot reverted");
        self.state(domain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VolumeFormat;

    #[test]
    fn domstate_mapping() {
        assert_eq!(parse_domstate("running\n\n"), PowerState::Running);
        assert_eq!(parse_domstate("shut off\n"), PowerState::ShutOff);
        assert_eq!(parse_domstate("paused"), PowerState::Paused);
        assert_eq!(parse_domstate("crashed"), PowerState::ShutOff);
    }

    #[test]
    fn snapshot_names_skip_blank_lines() {
        assert_eq!(parse_names("s1\ns2\n\n"), vec!["s1", "s2"]);
        assert!(parse_names("\n").is_empty());
    }

    fn spec() -> DomainSpec {
        DomainSpec {
            id: "0b7c".into(),
            name: "web".into(),
            cpu: 2,
            ram_mb: 2048,
            disks: Vec::new(),
            interfaces: Vec::new(),
        }
    }

    #[test]
    fn xml_carries_sizing() {
        let xml = domain_xml(&spec());
        assert!(xml.contains("<name>web</name>"));
        assert!(xml.contains("<vcpu>2</vcpu>"));
        assert!(xml.contains("<memory unit='MiB'>2048</memory>"));
        assert!(!xml.contains("<disk"));
    }

    #[test]
    fn xml_lists_disks_and_interfaces() {
        let mut domain = spec();
        domain.disks = vec![
            DomainDisk {
                path: "/mnt/fast/volume-1".into(),
                format: VolumeFormat::Qcow2,
                device: "vda".into(),
                read_only: false,
                cdrom: false,
            },
            DomainDisk {
                path: "/mnt/isos/image-2.raw".into(),
                format: VolumeFormat::Raw,
                device: "sdb".into(),
                read_only: false,
                cdrom: true,
            },
        ];
        domain.interfaces = vec![DomainInterface {
            bridge: "vbr0".into(),
            mac: "52:54:00:aa:bb:cc".into(),
            model: "virtio".into(),
        }];

        let xml = domain_xml(&domain);
        assert!(xml.contains("<source file='/mnt/fast/volume-1'/><target dev='vda' bus='virtio'/></disk>"));
        assert!(xml.contains("device='cdrom'><driver name='qemu' type='raw'/>"));
        assert!(xml.contains("<target dev='sdb' bus='sata'/><readonly/>"));
        assert!(xml.contains("<mac address='52:54:00:aa:bb:cc'/><source bridge='vbr0'/>"));
    }
}
