use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{Repository, to_i64, to_u64, transition};
use crate::error::Result;
use crate::model::{
    Disk, DiskSource, PowerState, VirtualInterface, VirtualMachine, VmPatch, VmStatus, timestamp,
};

const COLUMNS: &str = "id, name, cpu, ram_mb, power_state, status, user_id, description, \
                       information, created_at, updated_at";

const DISK_COLUMNS: &str = "id, vm_id, source, source_id, target, path, size, format, \
                            read_only, position, created_at";

const INTERFACE_COLUMNS: &str = "id, vm_id, network_id, bridge, mac, model, position, created_at";

pub struct VmRepo<'a> {
    conn: &'a mut SqliteConnection,
}

impl<'a> VmRepo<'a> {
    pub(super) fn new(conn: &'a mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn find_by_name(&mut self, name: &str) -> Result<Option<VirtualMachine>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM vms WHERE name = ?"))
            .bind(name)
            .fetch_optional(&mut *self.conn)
            .await?;
        match row {
            Some(r) => Ok(Some(self.with_devices(vm_from_row(&r)?).await?)),
            None => Ok(None),
        }
    }

    pub async fn set_power_state(&mut self, id: &str, power_state: PowerState) -> Result<()> {
        sqlx::query("UPDATE vms SET power_state = ?, updated_at = ? WHERE id = ?")
            .bind(power_state.as_str())
            .bind(timestamp())
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    pub async fn edit(
        &mut self,
        id: &str,
        name: &str,
        description: &str,
        cpu: u32,
        ram_mb: u64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE vms SET name = ?, description = ?, cpu = ?, ram_mb = ?, updated_at = ? WHERE id = ?",
        )
        .bind(name)
        .bind(description)
        .bind(i64::from(cpu))
        .bind(to_i64(ram_mb))
        .bind(timestamp())
        .bind(id)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn add_disk(&mut self, disk: &Disk) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO vm_disks ({DISK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&disk.id)
        .bind(&disk.vm_id)
        .bind(disk.source.as_str())
        .bind(&disk.source_id)
        .bind(&disk.target)
        .bind(&disk.path)
        .bind(to_i64(disk.size))
        .bind(disk.format.as_str())
        .bind(disk.read_only)
        .bind(i64::from(disk.position))
        .bind(&disk.created_at)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    /// Drop the VM's disks backed by one volume or image.
    pub async fn remove_disks_of(
        &mut self,
        vm_id: &str,
        source: DiskSource,
        source_id: &str,
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM vm_disks WHERE vm_id = ? AND source = ? AND source_id = ?")
                .bind(vm_id)
                .bind(source.as_str())
                .bind(source_id)
                .execute(&mut *self.conn)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn add_interface(&mut self, iface: &VirtualInterface) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO vm_interfaces ({INTERFACE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&iface.id)
        .bind(&iface.vm_id)
        .bind(&iface.network_id)
        .bind(&iface.bridge)
        .bind(&iface.mac)
        .bind(&iface.model)
        .bind(i64::from(iface.position))
        .bind(&iface.created_at)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    pub async fn remove_interface(&mut self, vm_id: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM vm_interfaces WHERE vm_id = ? AND id = ?")
            .bind(vm_id)
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mac_in_use(&mut self, mac: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vm_interfaces WHERE mac = ?")
            .bind(mac)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(count > 0)
    }

    /// VMs with an interface on the network.
    pub async fn names_on_network(&mut self, network_id: &str) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT vms.name FROM vm_interfaces JOIN vms ON vms.id = vm_interfaces.vm_id \
             WHERE vm_interfaces.network_id = ? ORDER BY vms.name",
        )
        .bind(network_id)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(names)
    }

    async fn with_devices(&mut self, mut vm: VirtualMachine) -> Result<VirtualMachine> {
        let disks = sqlx::query(&format!(
            "SELECT {DISK_COLUMNS} FROM vm_disks WHERE vm_id = ? ORDER BY position"
        ))
        .bind(&vm.id)
        .fetch_all(&mut *self.conn)
        .await?;
        vm.disks = disks.iter().map(disk_from_row).collect::<Result<_>>()?;

        let interfaces = sqlx::query(&format!(
            "SELECT {INTERFACE_COLUMNS} FROM vm_interfaces WHERE vm_id = ? ORDER BY position"
        ))
        .bind(&vm.id)
        .fetch_all(&mut *self.conn)
        .await?;
        vm.virtual_interfaces = interfaces.iter().map(interface_from_row).collect();
        Ok(vm)
    }
}

#[async_trait]
impl Repository for VmRepo<'_> {
    type Entity = VirtualMachine;
    type Patch = VmPatch;
    type Status = VmStatus;

    async fn find(&mut self, id: &str) -> Result<Option<VirtualMachine>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM vms WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;
        match row {
            Some(r) => Ok(Some(self.with_devices(vm_from_row(&r)?).await?)),
            None => Ok(None),
        }
    }

    async fn get_all(&mut self) -> Result<Vec<VirtualMachine>> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM vms ORDER BY created_at"))
            .fetch_all(&mut *self.conn)
            .await?;

        let mut disks: HashMap<String, Vec<Disk>> = HashMap::new();
        let disk_rows = sqlx::query(&format!(
            "SELECT {DISK_COLUMNS} FROM vm_disks ORDER BY position"
        ))
        .fetch_all(&mut *self.conn)
        .await?;
        for r in &disk_rows {
            let disk = disk_from_row(r)?;
            disks.entry(disk.vm_id.clone()).or_default().push(disk);
        }

        let mut interfaces: HashMap<String, Vec<VirtualInterface>> = HashMap::new();
        let interface_rows = sqlx::query(&format!(
            "SELECT {INTERFACE_COLUMNS} FROM vm_interfaces ORDER BY position"
        ))
        .fetch_all(&mut *self.conn)
        .await?;
        for r in &interface_rows {
            let iface = interface_from_row(r);
            interfaces.entry(iface.vm_id.clone()).or_default().push(iface);
        }

        rows.iter()
            .map(|r| {
                let mut vm = vm_from_row(r)?;
                vm.disks = disks.remove(&vm.id).unwrap_or_default();
                vm.virtual_interfaces = interfaces.remove(&vm.id).unwrap_or_default();
                Ok(vm)
            })
            .collect()
    }

    async fn add(&mut self, vm: &VirtualMachine) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO vms ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&vm.id)
        .bind(&vm.name)
        .bind(vm.cpu as i64)
        .bind(to_i64(vm.ram_mb))
        .bind(vm.power_state.as_str())
        .bind(vm.status.as_str())
        .bind(&vm.user_id)
        .bind(&vm.description)
        .bind(&vm.information)
        .bind(&vm.created_at)
        .bind(&vm.updated_at)
        .execute(&mut *self.conn)
        .await?;

        for disk in &vm.disks {
            self.add_disk(disk).await?;
        }
        for iface in &vm.virtual_interfaces {
            self.add_interface(iface).await?;
        }
        Ok(())
    }

    /// Removes the VM; its snapshots, disks and interfaces go with it.
    async fn delete(&mut self, id: &str) -> Result<bool> {
        for table in ["snapshots", "vm_disks", "vm_interfaces"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE vm_id = ?"))
                .bind(id)
                .execute(&mut *self.conn)
                .await?;
        }
        let result = sqlx::query("DELETE FROM vms WHERE id = ?")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bulk_update(&mut self, patches: &[VmPatch]) -> Result<u64> {
        let now = timestamp();
        let mut applied = 0;
        for patch in patches {
            let result = sqlx::query(
                "UPDATE vms SET status = ?, power_state = ?, information = ?, updated_at = ? \
                 WHERE id = ? AND status = ?",
            )
            .bind(patch.status.as_str())
            .bind(patch.power_state.as_str())
            .bind(&patch.information)
            .bind(&now)
            .bind(&patch.id)
            .bind(patch.expected_status.as_str())
            .execute(&mut *self.conn)
            .await?;
            applied += result.rows_affected();
        }
        Ok(applied)
    }

    async fn transition(
        &mut self,
        id: &str,
        from: &[VmStatus],
        to: VmStatus,
        information: Option<&str>,
    ) -> Result<()> {
        transition(&mut *self.conn, "vms", id, from, to, information).await
    }
}

fn vm_from_row(r: &SqliteRow) -> Result<VirtualMachine> {
    Ok(VirtualMachine {
        id: r.get("id"),
        name: r.get("name"),
        cpu: u32::try_from(r.get::<i64, _>("cpu")).unwrap_or_default(),
        ram_mb: to_u64(r.get("ram_mb")),
        power_state: r.get::<String, _>("power_state").parse()?,
        status: r.get::<String, _>("status").parse()?,
        user_id: r.get("user_id"),
        description: r.get("description"),
        information: r.get("information"),
        disks: Vec::new(),
        virtual_interfaces: Vec::new(),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn disk_from_row(r: &SqliteRow) -> Result<Disk> {
    Ok(Disk {
        id: r.get("id"),
        vm_id: r.get("vm_id"),
        source: r.get::<String, _>("source").parse()?,
        source_id: r.get("source_id"),
        target: r.get("target"),
        path: r.get("path"),
        size: to_u64(r.get("size")),
        format: r.get::<String, _>("format").parse()?,
        read_only: r.get("read_only"),
        position: u32::try_from(r.get::<i64, _>("position")).unwrap_or_default(),
        created_at: r.get("created_at"),
    })
}

fn interface_from_row(r: &SqliteRow) -> VirtualInterface {
    VirtualInterface {
        id: r.get("id"),
        vm_id: r.get("vm_id"),
        network_id: r.get("network_id"),
        bridge: r.get("bridge"),
        mac: r.get("mac"),
        model: r.get("model"),
        position: u32::try_from(r.get::<i64, _>("position")).unwrap_or_default(),
        created_at: r.get("created_at"),
    }
}
