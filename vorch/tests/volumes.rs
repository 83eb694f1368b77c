mod common;

use std::time::Duration;

use common::{GIB, Harness, harness, wait_for};
use vorch::manager::{CreateVolume, EditVolume, VolumeFilter};
use vorch::model::{StorageStatus, Volume, VolumeFormat, VolumeStatus};
use vorch::store::Repository;

async fn create(h: &Harness, storage_id: &str, name: &str, size: u64) -> Volume {
    h.managers
        .volumes
        .create(CreateVolume {
            name: name.into(),
            storage_id: storage_id.into(),
            format: VolumeFormat::Qcow2,
            size,
            user_id: "admin".into(),
            description: String::new(),
            read_only: false,
        })
        .await
        .unwrap()
}

async fn settled(h: &Harness, id: &str, status: VolumeStatus) -> Volume {
    let volumes = &h.managers.volumes;
    wait_for("volume status", || async move {
        volumes.get(id).await.ok().filter(|v| v.status == status)
    })
    .await
}

#[tokio::test]
async fn create_returns_new_then_becomes_available() {
    let h = harness().await;
    let storage = h.storage("fast").await;

    let volume = create(&h, &storage.id, "v1", 1024).await;
    assert_eq!(volume.status, VolumeStatus::New);

    let volume = settled(&h, &volume.id, VolumeStatus::Available).await;
    assert_eq!(volume.size, 1024);
    assert!(volume.path.as_deref().unwrap().ends_with(&volume.id));
    assert!(volume.information.is_empty());
}

#[tokio::test]
async fn duplicate_name_on_same_storage_is_rejected() {
    let h = harness().await;
    let fast = h.storage("fast").await;
    let slow = h.storage("slow").await;

    create(&h, &fast.id, "data", 1024).await;
    let err = h
        .managers
        .volumes
        .create(CreateVolume {
            name: "data".into(),
            storage_id: fast.id.clone(),
            format: VolumeFormat::Raw,
            size: 1024,
            user_id: "admin".into(),
            description: String::new(),
            read_only: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "AlreadyExists");

    // Same name on another storage is fine.
    create(&h, &slow.id, "data", 1024).await;
}

#[tokio::test]
async fn oversized_volume_ends_in_error() {
    let h = harness().await;
    let storage = h.storage("fast").await;

    let volume = create(&h, &storage.id, "huge", 9 * GIB).await;
    let volume = settled(&h, &volume.id, VolumeStatus::Error).await;
    assert!(volume.information.contains("not enough space"));
    assert_eq!(h.host.count("create_volume"), 0);
}

#[tokio::test]
async fn backend_failure_on_create_ends_in_error() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    h.host.fail("create_volume");

    let volume = create(&h, &storage.id, "v1", 1024).await;
    let volume = settled(&h, &volume.id, VolumeStatus::Error).await;
    assert!(volume.information.contains("create_volume"));
}

#[tokio::test]
async fn extend_to_smaller_or_equal_size_is_rejected_without_side_effects() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    let volume = create(&h, &storage.id, "v1", 2048).await;
    settled(&h, &volume.id, VolumeStatus::Available).await;

    for size in [1024, 2048] {
        let err = h.managers.volumes.extend(&volume.id, size, "admin").await.unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }
    let after = h.managers.volumes.get(&volume.id).await.unwrap();
    assert_eq!(after.status, VolumeStatus::Available);
    assert_eq!(after.size, 2048);
    assert_eq!(h.host.count("extend_volume"), 0);
}

#[tokio::test]
async fn extend_grows_the_volume() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    let volume = create(&h, &storage.id, "v1", 1024).await;
    settled(&h, &volume.id, VolumeStatus::Available).await;

    let pending = h.managers.volumes.extend(&volume.id, 4096, "admin").await.unwrap();
    assert_eq!(pending.status, VolumeStatus::Extending);

    let volumes = &h.managers.volumes;
    let id = volume.id.as_str();
    let volume = wait_for("extended volume", || async move {
        volumes
            .get(id)
            .await
            .ok()
            .filter(|v| v.status == VolumeStatus::Available && v.size == 4096)
    })
    .await;
    assert_eq!(volume.size, 4096);
}

#[tokio::test]
async fn extend_with_running_vm_attached_returns_to_available() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    let vm = h.running_vm("web").await;
    let volume = create(&h, &storage.id, "v1", 1024).await;
    settled(&h, &volume.id, VolumeStatus::Available).await;
    h.managers
        .volumes
        .attach(&volume.id, &vm.id, Some("vdb".into()), "admin")
        .await
        .unwrap();

    h.managers.volumes.extend(&volume.id, 2048, "admin").await.unwrap();

    let volumes = &h.managers.volumes;
    let id = volume.id.as_str();
    let volume = wait_for("extend to be refused", || async move {
        volumes
            .get(id)
            .await
            .ok()
            .filter(|v| v.status == VolumeStatus::Available && !v.information.is_empty())
    })
    .await;
    assert_eq!(volume.size, 1024);
    assert!(volume.information.contains("web"));
    assert!(volume.information.contains("running"));
    assert_eq!(h.host.count("extend_volume"), 0);
}

#[tokio::test]
async fn attached_volume_cannot_be_deleted() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    let vm = h.vm("db").await;
    let volume = create(&h, &storage.id, "v1", 1024).await;
    settled(&h, &volume.id, VolumeStatus::Available).await;

    let attached = h
        .managers
        .volumes
        .attach(&volume.id, &vm.id, None, "admin")
        .await
        .unwrap();
    assert_eq!(attached.size, 1024);
    assert_eq!(attached.format, VolumeFormat::Qcow2);

    let err = h.managers.volumes.delete(&volume.id, "admin").await.unwrap_err();
    assert_eq!(err.kind(), "HasAttachments");
    let after = h.managers.volumes.get(&volume.id).await.unwrap();
    assert_eq!(after.status, VolumeStatus::Available);
    assert_eq!(h.host.count("delete_volume"), 0);

    let err = h
        .managers
        .volumes
        .attach(&volume.id, &vm.id, None, "admin")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "AlreadyExists");

    let detached = h.managers.volumes.detach(&volume.id, &vm.id, "admin").await.unwrap();
    assert!(detached.attachments.is_empty());
    assert_eq!(detached.used, 256);
}

#[tokio::test]
async fn delete_removes_the_record() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    let volume = create(&h, &storage.id, "v1", 1024).await;
    settled(&h, &volume.id, VolumeStatus::Available).await;

    let pending = h.managers.volumes.delete(&volume.id, "admin").await.unwrap();
    assert_eq!(pending.status, VolumeStatus::Deleting);

    let volumes = &h.managers.volumes;
    let id = volume.id.as_str();
    wait_for("volume removal", || async move {
        volumes.get(id).await.err().filter(|e| e.kind() == "NotFound")
    })
    .await;
    assert_eq!(h.host.count("delete_volume"), 1);
}

#[tokio::test]
async fn failed_delete_keeps_record_in_error() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    let volume = create(&h, &storage.id, "v1", 1024).await;
    settled(&h, &volume.id, VolumeStatus::Available).await;
    h.host.fail("delete_volume");

    h.managers.volumes.delete(&volume.id, "admin").await.unwrap();
    let volume = settled(&h, &volume.id, VolumeStatus::Error).await;
    assert!(volume.information.contains("delete_volume"));

    // error -> deleting is allowed once the backend recovers.
    h.host.heal("delete_volume");
    h.managers.volumes.delete(&volume.id, "admin").await.unwrap();
    let volumes = &h.managers.volumes;
    let id = volume.id.as_str();
    wait_for("volume removal", || async move { volumes.get(id).await.err() }).await;
}

#[tokio::test]
async fn attach_failure_moves_volume_to_error() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    let vm = h.vm("db").await;
    let volume = create(&h, &storage.id, "v1", 1024).await;
    settled(&h, &volume.id, VolumeStatus::Available).await;
    h.host.fail("query_volume");

    let err = h
        .managers
        .volumes
        .attach(&volume.id, &vm.id, None, "admin")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ExecutionFailure");

    let volume = h.managers.volumes.get(&volume.id).await.unwrap();
    assert_eq!(volume.status, VolumeStatus::Error);
    assert!(volume.information.starts_with("Error while attaching volume"));
    assert!(volume.attachments.is_empty());
}

#[tokio::test]
async fn edit_and_filtered_listing() {
    let h = harness().await;
    let fast = h.storage("fast").await;
    let slow = h.storage("slow").await;
    let vm = h.vm("db").await;

    let a = create(&h, &fast.id, "a", 1024).await;
    let b = create(&h, &fast.id, "b", 1024).await;
    let c = create(&h, &slow.id, "c", 1024).await;
    for v in [&a, &b, &c] {
        settled(&h, &v.id, VolumeStatus::Available).await;
    }
    h.managers.volumes.attach(&a.id, &vm.id, None, "admin").await.unwrap();

    let on_fast = h
        .managers
        .volumes
        .list(&VolumeFilter {
            storage_id: Some(fast.id.clone()),
            free_only: false,
        })
        .await
        .unwrap();
    assert_eq!(on_fast.len(), 2);

    let free = h
        .managers
        .volumes
        .list(&VolumeFilter {
            storage_id: None,
            free_only: true,
        })
        .await
        .unwrap();
    let names: Vec<_> = free.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["b", "c"]);

    let err = h
        .managers
        .volumes
        .edit(
            &b.id,
            EditVolume {
                name: Some("a".into()),
                ..Default::default()
            },
            "admin",
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "AlreadyExists");

    let edited = h
        .managers
        .volumes
        .edit(
            &b.id,
            EditVolume {
                name: Some("b2".into()),
                read_only: Some(true),
                ..Default::default()
            },
            "admin",
        )
        .await
        .unwrap();
    assert_eq!(edited.name, "b2");
    assert!(edited.read_only);
}

fn lost_race(err: vorch::Error) -> bool {
    matches!(err.kind(), "InvalidStatus" | "StatusConflict")
}

#[tokio::test]
async fn create_on_deleting_storage_is_rejected() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    h.host.delay("delete_storage", Duration::from_millis(300));

    let pending = h.managers.storages.delete(&storage.id, "admin").await.unwrap();
    assert_eq!(pending.status, StorageStatus::Deleting);

    let err = h
        .managers
        .volumes
        .create(CreateVolume {
            name: "late".into(),
            storage_id: storage.id.clone(),
            format: VolumeFormat::Raw,
            size: 1024,
            user_id: "admin".into(),
            description: String::new(),
            read_only: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "StorageUnavailable");
    assert!(h.managers.volumes.list(&VolumeFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn volume_outliving_its_storage_record_can_be_deleted() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    let volume = create(&h, &storage.id, "orphan", 1024).await;
    settled(&h, &volume.id, VolumeStatus::Available).await;

    let mut uow = h.store.begin().await.unwrap();
    assert!(uow.storages().delete(&storage.id).await.unwrap());
    uow.commit().await.unwrap();

    h.managers.volumes.delete(&volume.id, "admin").await.unwrap();
    let volumes = &h.managers.volumes;
    let id = volume.id.as_str();
    wait_for("volume removal", || async move {
        volumes.get(id).await.err().filter(|e| e.kind() == "NotFound")
    })
    .await;
    assert_eq!(h.host.count("delete_volume"), 0);
}

#[tokio::test]
async fn concurrent_deletes_of_one_volume_admit_one() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    let volume = create(&h, &storage.id, "v1", 1024).await;
    settled(&h, &volume.id, VolumeStatus::Available).await;
    h.host.delay("delete_volume", Duration::from_millis(100));

    let volumes = &h.managers.volumes;
    let (first, second) = tokio::join!(
        volumes.delete(&volume.id, "admin"),
        volumes.delete(&volume.id, "admin"),
    );
    let (won, lost) = match (first, second) {
        (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
        other => panic!("expected exactly one delete to win, got {other:?}"),
    };
    assert_eq!(won.status, VolumeStatus::Deleting);
    assert!(lost_race(lost));

    let id = volume.id.as_str();
    wait_for("volume removal", || async move { volumes.get(id).await.err() }).await;
    assert_eq!(h.host.count("delete_volume"), 1);
}

#[tokio::test]
async fn extend_racing_delete_admits_one() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    let volume = create(&h, &storage.id, "v1", 1024).await;
    settled(&h, &volume.id, VolumeStatus::Available).await;

    let volumes = &h.managers.volumes;
    let (extended, deleted) = tokio::join!(
        volumes.extend(&volume.id, 2048, "admin"),
        volumes.delete(&volume.id, "admin"),
    );
    match (extended, deleted) {
        (Ok(v), Err(e)) => {
            assert_eq!(v.status, VolumeStatus::Extending);
            assert!(lost_race(e));
        }
        (Err(e), Ok(v)) => {
            assert_eq!(v.status, VolumeStatus::Deleting);
            assert!(lost_race(e));
        }
        other => panic!("expected exactly one operation to win, got {other:?}"),
    }
}

#[tokio::test]
async fn storage_delete_racing_volume_create_admits_one() {
    let h = harness().await;
    let storage = h.storage("fast").await;
    h.host.delay("delete_storage", Duration::from_millis(300));

    let (deleted, created) = tokio::join!(
        h.managers.storages.delete(&storage.id, "admin"),
        h.managers.volumes.create(CreateVolume {
            name: "v1".into(),
            storage_id: storage.id.clone(),
            format: VolumeFormat::Raw,
            size: 1024,
            user_id: "admin".into(),
            description: String::new(),
            read_only: false,
        }),
    );
    match (deleted, created) {
        (Ok(s), Err(e)) => {
            assert_eq!(s.status, StorageStatus::Deleting);
            assert_eq!(e.kind(), "StorageUnavailable");
        }
        (Err(e), Ok(v)) => {
            assert_eq!(v.storage_id, storage.id);
            assert_eq!(e.kind(), "HasDependents");
        }
        other => panic!("expected exactly one operation to win, got {other:?}"),
    }
}
