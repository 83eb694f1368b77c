mod common;

use std::io::Write;

use common::{GIB, Harness, harness, wait_for};
use vorch::manager::{
    CreateNetwork, CreateVm, CreateVolume, DiskRequest, EditVm, InterfaceRequest, UploadImage,
};
use vorch::model::{
    DiskSource, Image, ImageStatus, NetworkStatus, PowerState, VirtualNetwork, VmStatus, Volume,
    VolumeFormat, VolumeStatus,
};
use vorch::store::Repository;

async fn volume(h: &Harness, storage_id: &str, name: &str) -> Volume {
    let volume = h
        .managers
        .volumes
        .create(CreateVolume {
            name: name.into(),
            storage_id: storage_id.into(),
            format: VolumeFormat::Qcow2,
            size: GIB,
            user_id: "admin".into(),
            description: String::new(),
            read_only: false,
        })
        .await
        .unwrap();
    let volumes = &h.managers.volumes;
    let id = volume.id.as_str();
    wait_for("volume to become available", || async move {
        volumes
            .get(id)
            .await
            .ok()
            .filter(|v| v.status == VolumeStatus::Available)
    })
    .await
}

async fn image(h: &Harness, storage_id: &str, source: &tempfile::NamedTempFile) -> Image {
    let image = h
        .managers
        .images
        .upload(UploadImage {
            name: "debian".into(),
            storage_id: storage_id.into(),
            source: source.path().to_str().unwrap().into(),
            format: VolumeFormat::Raw,
            description: String::new(),
            user_id: "admin".into(),
        })
        .await
        .unwrap();
    let images = &h.managers.images;
    let id = image.id.as_str();
    wait_for("image to become available", || async move {
        images
            .get(id)
            .await
            .ok()
            .filter(|i| i.status == ImageStatus::Available)
    })
    .await
}

async fn network(h: &Harness, name: &str, bridge: &str) -> VirtualNetwork {
    let network = h
        .managers
        .networks
        .create(CreateNetwork {
            name: name.into(),
            bridge: bridge.into(),
            user_id: "admin".into(),
        })
        .await
        .unwrap();
    let networks = &h.managers.networks;
    let id = network.id.as_str();
    wait_for("network to become available", || async move {
        networks
            .get(id)
            .await
            .ok()
            .filter(|n| n.status == NetworkStatus::Available)
    })
    .await
}

fn iso() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[0u8; 2048]).unwrap();
    file.flush().unwrap();
    file
}

fn disk(source: DiskSource, source_id: &str) -> DiskRequest {
    DiskRequest {
        source,
        source_id: source_id.into(),
        target: None,
    }
}

fn nic(network_id: &str) -> InterfaceRequest {
    InterfaceRequest {
        network_id: network_id.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_plugs_in_disks_and_interfaces() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    let data = volume(&h, &storage.id, "data").await;
    let source = iso();
    let debian = image(&h, &storage.id, &source).await;
    let lan = network(&h, "lan", "vbr0").await;

    let vm = h
        .managers
        .vms
        .create(CreateVm {
            name: "web".into(),
            cpu: 2,
            ram_mb: 2048,
            user_id: "admin".into(),
            disks: vec![
                disk(DiskSource::Volume, &data.id),
                disk(DiskSource::Image, &debian.id),
            ],
            interfaces: vec![nic(&lan.id)],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(vm.virtual_interfaces.len(), 1);
    assert!(vm.disks.is_empty());

    let vm = h.settled_vm(&vm.id).await;
    assert_eq!(vm.status, VmStatus::Available);
    assert_eq!(vm.disks.len(), 2);
    let (first, second) = (&vm.disks[0], &vm.disks[1]);
    assert_eq!(first.source_id, data.id);
    assert_eq!(first.device(), "vda");
    assert_eq!(first.size, GIB);
    assert!(first.path.contains(&data.id));
    assert_eq!(second.source, DiskSource::Image);
    assert_eq!(second.device(), "sdb");
    assert!(second.read_only);

    let iface = &vm.virtual_interfaces[0];
    assert_eq!(iface.bridge, "vbr0");
    assert!(iface.mac.starts_with("52:54:00:"));

    let data = h.managers.volumes.get(&data.id).await.unwrap();
    assert_eq!(data.attachments[0].vm_id, vm.id);
    let debian = h.managers.images.get(&debian.id).await.unwrap();
    assert_eq!(debian.attachments[0].vm_id, vm.id);
    assert!(h.host.calls().contains(&format!("query_image {}", debian.id)));
}

#[tokio::test]
async fn unusable_disk_fails_the_create() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    let data = volume(&h, &storage.id, "data").await;
    let mut uow = h.store.begin().await.unwrap();
    uow.volumes()
        .transition(&data.id, &[VolumeStatus::Available], VolumeStatus::Error, Some("broken"))
        .await
        .unwrap();
    uow.commit().await.unwrap();

    let err = h
        .managers
        .vms
        .create(CreateVm {
            name: "ghost".into(),
            cpu: 1,
            ram_mb: 512,
            disks: vec![disk(DiskSource::Volume, "no-such-volume")],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NotFound");
    assert!(h.managers.vms.list().await.unwrap().is_empty());

    let vm = h
        .managers
        .vms
        .create(CreateVm {
            name: "web".into(),
            cpu: 1,
            ram_mb: 512,
            disks: vec![disk(DiskSource::Volume, &data.id)],
            ..Default::default()
        })
        .await
        .unwrap();
    let vm = h.settled_vm(&vm.id).await;
    assert_eq!(vm.status, VmStatus::Error);
    assert!(vm.information.contains(&data.id));
    assert!(vm.disks.is_empty());
    assert!(h.host.domain(&vm.id).is_none());
}

#[tokio::test]
async fn interfaces_are_checked_before_insert() {
    let h = harness().await;
    let lan = network(&h, "lan", "vbr0").await;
    let create = |interfaces: Vec<InterfaceRequest>| CreateVm {
        name: "web".into(),
        cpu: 1,
        ram_mb: 512,
        interfaces,
        ..Default::default()
    };

    let err = h
        .managers
        .vms
        .create(create(vec![nic("no-such-network")]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NotFound");

    let bad_mac = InterfaceRequest {
        mac: Some("52:54:00:zz:00:01".into()),
        ..nic(&lan.id)
    };
    let err = h.managers.vms.create(create(vec![bad_mac])).await.unwrap_err();
    assert_eq!(err.kind(), "InvalidArgument");

    let fixed = InterfaceRequest {
        mac: Some("52:54:00:00:00:01".into()),
        ..nic(&lan.id)
    };
    let err = h
        .managers
        .vms
        .create(create(vec![fixed.clone(), fixed.clone()]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "AlreadyExists");

    let vm = h.managers.vms.create(create(vec![fixed])).await.unwrap();
    assert_eq!(vm.virtual_interfaces[0].mac, "52:54:00:00:00:01");
    assert_eq!(h.managers.vms.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn edit_reconfigures_a_shut_off_vm() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    let data = volume(&h, &storage.id, "data").await;
    let source = iso();
    let debian = image(&h, &storage.id, &source).await;
    let lan = network(&h, "lan", "vbr0").await;
    let dmz = network(&h, "dmz", "vbr1").await;

    let vm = h
        .managers
        .vms
        .create(CreateVm {
            name: "web".into(),
            cpu: 1,
            ram_mb: 512,
            disks: vec![disk(DiskSource::Volume, &data.id)],
            interfaces: vec![nic(&lan.id)],
            ..Default::default()
        })
        .await
        .unwrap();
    let vm = h.settled_vm(&vm.id).await;
    assert_eq!(vm.disks.len(), 1);

    let edited = h
        .managers
        .vms
        .edit(
            &vm.id,
            EditVm {
                name: Some("web-2".into()),
                cpu: Some(4),
                ram_mb: Some(4096),
                detach_disks: vec![vm.disks[0].id.clone()],
                attach_disks: vec![DiskRequest {
                    target: Some("hdc".into()),
                    ..disk(DiskSource::Image, &debian.id)
                }],
                remove_interfaces: vec![vm.virtual_interfaces[0].id.clone()],
                add_interfaces: vec![nic(&dmz.id)],
                ..Default::default()
            },
            "admin",
        )
        .await
        .unwrap();

    assert_eq!(edited.name, "web-2");
    assert_eq!((edited.cpu, edited.ram_mb), (4, 4096));
    assert_eq!(edited.disks.len(), 1);
    assert_eq!(edited.disks[0].source_id, debian.id);
    assert_eq!(edited.disks[0].device(), "hdc");
    assert_eq!(edited.virtual_interfaces.len(), 1);
    assert_eq!(edited.virtual_interfaces[0].bridge, "vbr1");

    let data = h.managers.volumes.get(&data.id).await.unwrap();
    assert!(data.attachments.is_empty());

    // The lan network is free again, dmz is in use.
    h.managers.networks.delete(&lan.id, "admin").await.unwrap();
    let err = h.managers.networks.delete(&dmz.id, "admin").await.unwrap_err();
    assert_eq!(err.kind(), "HasDependents");
    assert!(err.to_string().contains("web-2"));
}

#[tokio::test]
async fn edit_is_refused_while_running_or_with_bad_input() {
    let h = harness().await;
    let other = h.vm("db").await;
    let vm = h.running_vm("web").await;

    let err = h
        .managers
        .vms
        .edit(
            &vm.id,
            EditVm {
                cpu: Some(8),
                ..Default::default()
            },
            "admin",
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "PowerState");

    h.managers.vms.shut_off(&vm.id, "admin").await.unwrap();
    let vm = h.settled_vm(&vm.id).await;
    assert_eq!(vm.power_state, PowerState::ShutOff);

    let rename = |name: &str| EditVm {
        name: Some(name.into()),
        ..Default::default()
    };
    let err = h.managers.vms.edit(&vm.id, rename(&other.name), "admin").await.unwrap_err();
    assert_eq!(err.kind(), "AlreadyExists");
    let err = h.managers.vms.edit(&vm.id, rename("  "), "admin").await.unwrap_err();
    assert_eq!(err.kind(), "InvalidArgument");

    let err = h
        .managers
        .vms
        .edit(
            &vm.id,
            EditVm {
                detach_disks: vec!["no-such-disk".into()],
                ..Default::default()
            },
            "admin",
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NotFound");

    let unchanged = h.managers.vms.get(&vm.id).await.unwrap();
    assert_eq!(unchanged.name, "web");
    assert_eq!(unchanged.cpu, vm.cpu);
}

#[tokio::test]
async fn detaching_a_volume_removes_the_disk() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    let data = volume(&h, &storage.id, "data").await;
    let vm = h
        .managers
        .vms
        .create(CreateVm {
            name: "web".into(),
            cpu: 1,
            ram_mb: 512,
            disks: vec![disk(DiskSource::Volume, &data.id)],
            ..Default::default()
        })
        .await
        .unwrap();
    let vm = h.settled_vm(&vm.id).await;
    assert_eq!(vm.disks.len(), 1);

    h.managers.volumes.detach(&data.id, &vm.id, "admin").await.unwrap();
    assert!(h.managers.vms.get(&vm.id).await.unwrap().disks.is_empty());
}
