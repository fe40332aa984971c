//! Catalog behaviour against the fake driver and the in-memory store

use std::collections::BTreeMap;
use std::sync::Arc;
use storage_core::attributes::{AttributeRequest, AttributeValue, MEDIA};
use storage_core::*;

async fn catalog_with(fake: Arc<FakeDriver>, store: Arc<InMemoryStore>) -> CatalogOrchestrator {
    let catalog = CatalogOrchestrator::new(store, Arc::new(BuiltinDriverFactory::new(fake)));
    catalog.bootstrap().await.expect("bootstrap");
    catalog
}

async fn new_catalog() -> (CatalogOrchestrator, Arc<FakeDriver>) {
    let fake = Arc::new(FakeDriver::new());
    let catalog = catalog_with(Arc::clone(&fake), Arc::new(InMemoryStore::new())).await;
    (catalog, fake)
}

fn block_backend_config(requires_chap: bool) -> serde_json::Value {
    serde_json::json!({
        "protocol": "block",
        "requiresChap": requires_chap,
        "pools": {
            "ssd1": { "media": { "type": "strings", "offer": ["ssd"] } },
            "hdd1": { "media": { "type": "strings", "offer": ["hdd"] } }
        }
    })
}

async fn with_block_setup(catalog: &CatalogOrchestrator, requires_chap: bool) {
    catalog
        .add_backend("san1", FAKE_DRIVER_KIND, block_backend_config(requires_chap))
        .await
        .expect("add backend");
    catalog
        .add_storage_class(StorageClassConfig {
            name: "gold".to_string(),
            ..Default::default()
        })
        .await
        .expect("add storage class");
    catalog
        .add_node(Node {
            name: "n1".to_string(),
            iqn: "iqn.2000-01.x:y".to_string(),
            publication_state: NodePublicationState::Ready,
            ..Default::default()
        })
        .await
        .expect("add node");
}

fn volume_config(name: &str) -> VolumeConfig {
    VolumeConfig {
        name: name.to_string(),
        size_bytes: 1 << 20,
        storage_class: "gold".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_not_ready_before_bootstrap() {
    let catalog = CatalogOrchestrator::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(BuiltinDriverFactory::default()),
    );
    let err = catalog.list_nodes().await.expect_err("catalog is not bootstrapped");
    assert_eq!(err, OrchestratorError::NotReady);
}

#[tokio::test]
async fn test_storage_class_matches_pools_by_attribute_and_lists() {
    let (catalog, _) = new_catalog().await;
    catalog
        .add_backend("san1", FAKE_DRIVER_KIND, block_backend_config(false))
        .await
        .expect("add backend");

    let sc = catalog
        .add_storage_class(StorageClassConfig {
            name: "fast".to_string(),
            attributes: BTreeMap::from([(MEDIA.to_string(), AttributeRequest::String("ssd".to_string()))]),
            additional_pools: parse_pool_map("san1:hdd1").expect("pool map"),
            ..Default::default()
        })
        .await
        .expect("add storage class");
    assert_eq!(sc.storage["san1"].len(), 2, "ssd by attribute, hdd as additional pool");

    let excluded = catalog
        .add_storage_class(StorageClassConfig {
            name: "fast-only".to_string(),
            attributes: BTreeMap::from([(MEDIA.to_string(), AttributeRequest::String("ssd".to_string()))]),
            excluded_pools: parse_pool_map("san1:ssd1").expect("pool map"),
            ..Default::default()
        })
        .await
        .expect("add storage class");
    assert!(excluded.storage.is_empty());

    let err = catalog
        .add_storage_class(StorageClassConfig {
            name: "fast".to_string(),
            ..Default::default()
        })
        .await
        .expect_err("duplicate storage class");
    assert!(err.is_already_exists());
}

#[tokio::test]
async fn test_volume_lifecycle() {
    let (catalog, fake) = new_catalog().await;
    with_block_setup(&catalog, false).await;

    let volume = catalog.add_volume(volume_config("vol-1")).await.expect("add volume");
    assert_eq!(volume.config.protocol, Protocol::Block);
    assert_eq!(volume.state, VolumeState::Online);
    assert!(fake.has_volume("vol-1").await);

    let err = catalog.add_volume(volume_config("vol-1")).await.expect_err("duplicate");
    assert!(err.is_already_exists());

    let resized = catalog.resize_volume("vol-1", 2 << 20).await.expect("resize");
    assert_eq!(resized.config.size_bytes, 2 << 20);
    let err = catalog.resize_volume("vol-1", 1).await.expect_err("shrink");
    assert!(matches!(err, OrchestratorError::CapacityOutOfRange(_)));

    catalog.delete_volume("vol-1").await.expect("delete");
    assert!(!fake.has_volume("vol-1").await);
    assert!(catalog.get_volume("vol-1").await.expect_err("gone").is_not_found());
}

#[tokio::test]
async fn test_missing_storage_class_is_not_found() {
    let (catalog, _) = new_catalog().await;
    let err = catalog.add_volume(volume_config("vol-1")).await.expect_err("no storage class");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_chap_exists_only_for_block_backends_requiring_it() {
    let (catalog, _) = new_catalog().await;
    with_block_setup(&catalog, true).await;
    catalog.add_volume(volume_config("vol-1")).await.expect("add volume");

    let info = catalog
        .publish_volume(
            "vol-1",
            PublishRequest {
                node_name: "n1".to_string(),
                ..Default::default()
            },
        )
        .await
        .expect("publish");
    let chap = info.chap.expect("block backend requiring CHAP carries credentials");
    assert_eq!(chap, catalog.get_chap("vol-1", "n1").await.expect("get chap"));

    catalog.unpublish_volume("vol-1", "n1").await.expect("unpublish");
    catalog.unpublish_volume("vol-1", "n1").await.expect("unpublish is idempotent");

    let (plain, _) = new_catalog().await;
    with_block_setup(&plain, false).await;
    plain.add_volume(volume_config("vol-2")).await.expect("add volume");
    let info = plain
        .publish_volume(
            "vol-2",
            PublishRequest {
                node_name: "n1".to_string(),
                ..Default::default()
            },
        )
        .await
        .expect("publish");
    assert!(info.chap.is_none());
    assert!(plain.get_chap("vol-2", "n1").await.expect_err("no CHAP").is_not_found());
}

#[tokio::test]
async fn test_deleting_volume_is_visible_but_not_publishable() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = Volume {
        config: VolumeConfig {
            name: "vol-d".to_string(),
            internal_name: "vol-d".to_string(),
            protocol: Protocol::Block,
            ..Default::default()
        },
        backend_uuid: "missing".to_string(),
        pool: "p".to_string(),
        state: VolumeState::Deleting,
    };
    store
        .put(RecordKind::Volume, "vol-d", serde_json::to_value(&seeded).expect("encode"))
        .await
        .expect("seed");
    store
        .put(
            RecordKind::Node,
            "n1",
            serde_json::to_value(Node {
                name: "n1".to_string(),
                ..Default::default()
            })
            .expect("encode"),
        )
        .await
        .expect("seed");

    let fake = Arc::new(FakeDriver::new());
    let catalog = catalog_with(Arc::clone(&fake), store).await;
    let volume = catalog.get_volume("vol-d").await.expect("deleting volume is observable");
    assert_eq!(volume.state, VolumeState::Deleting);

    let err = catalog
        .publish_volume(
            "vol-d",
            PublishRequest {
                node_name: "n1".to_string(),
                ..Default::default()
            },
        )
        .await
        .expect_err("publish must be refused");
    assert!(matches!(err, OrchestratorError::VolumeDeleting(_)));
    assert_eq!(fake.publish_count(), 0);
}

#[tokio::test]
async fn test_publication_update_only_touches_not_safe_to_attach() {
    let (catalog, _) = new_catalog().await;
    with_block_setup(&catalog, false).await;
    catalog.add_volume(volume_config("vol-1")).await.expect("add volume");
    catalog
        .publish_volume(
            "vol-1",
            PublishRequest {
                node_name: "n1".to_string(),
                read_only: true,
                access_mode: AccessMode::ReadOnlyMany,
            },
        )
        .await
        .expect("publish");

    let before = catalog.get_volume_publication("vol-1", "n1").await.expect("get");
    let after = catalog
        .update_volume_publication("vol-1", "n1", Some(true))
        .await
        .expect("update");
    assert!(after.not_safe_to_attach);
    assert_eq!(after.read_only, before.read_only);
    assert_eq!(after.access_mode, before.access_mode);

    let unchanged = catalog
        .update_volume_publication("vol-1", "n1", None)
        .await
        .expect("empty update");
    assert!(unchanged.not_safe_to_attach);
}

#[tokio::test]
async fn test_force_detach_refuses_nodes_that_are_not_ready() {
    let fake = Arc::new(FakeDriver::new());
    let catalog = CatalogOrchestrator::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(BuiltinDriverFactory::new(fake)),
    )
    .with_force_detach(true);
    catalog.bootstrap().await.expect("bootstrap");
    with_block_setup(&catalog, false).await;
    catalog.add_volume(volume_config("vol-1")).await.expect("add volume");
    catalog
        .update_node_publication_state("n1", NodePublicationState::Cleanable)
        .await
        .expect("update node");

    let err = catalog
        .publish_volume(
            "vol-1",
            PublishRequest {
                node_name: "n1".to_string(),
                ..Default::default()
            },
        )
        .await
        .expect_err("cleanable node");
    assert!(matches!(err, OrchestratorError::FailedPrecondition(_)));
}

#[tokio::test]
async fn test_import_adopts_backend_size() {
    let (catalog, fake) = new_catalog().await;
    with_block_setup(&catalog, false).await;
    fake.add_unmanaged_volume("legacy_lun", 5 << 30, "ssd1").await;
    let backend = catalog.get_backend("san1").await.expect("backend");

    let volume = catalog
        .import_volume(VolumeConfig {
            name: "pvc-imported".to_string(),
            import_original_name: "legacy_lun".to_string(),
            import_backend_uuid: backend.uuid.clone(),
            import_not_managed: true,
            storage_class: "gold".to_string(),
            ..Default::default()
        })
        .await
        .expect("import");
    assert_eq!(volume.config.size_bytes, 5 << 30);
    assert_eq!(volume.config.internal_name, "legacy_lun");

    catalog.delete_volume("pvc-imported").await.expect("delete");
    assert!(fake.has_volume("legacy_lun").await, "unmanaged artifacts survive deletion");
}

#[tokio::test]
async fn test_backend_with_volumes_is_deleted_with_its_last_volume() {
    let (catalog, _) = new_catalog().await;
    with_block_setup(&catalog, false).await;
    catalog.add_volume(volume_config("vol-1")).await.expect("add volume");

    catalog.delete_backend("san1").await.expect("mark backend");
    assert_eq!(
        catalog.get_backend("san1").await.expect("still present").state,
        BackendState::Deleting
    );
    assert!(catalog.add_volume(volume_config("vol-2")).await.is_err());

    catalog.delete_volume("vol-1").await.expect("delete volume");
    assert!(catalog.get_backend("san1").await.expect_err("gone").is_not_found());
}

#[tokio::test]
async fn test_luks_passphrase_names_are_recorded() {
    let (catalog, _) = new_catalog().await;
    with_block_setup(&catalog, false).await;
    let mut config = volume_config("vol-luks");
    config.luks_encryption = true;
    catalog.add_volume(config).await.expect("add volume");

    catalog
        .update_volume_luks_passphrase_names("vol-luks", vec!["K2".to_string(), "K1".to_string()])
        .await
        .expect("update names");
    let volume = catalog.get_volume("vol-luks").await.expect("get");
    assert_eq!(volume.config.luks_passphrase_names, vec!["K2", "K1"]);
}

#[tokio::test]
async fn test_snapshots_block_volume_deletion() {
    let (catalog, _) = new_catalog().await;
    with_block_setup(&catalog, false).await;
    catalog.add_volume(volume_config("vol-1")).await.expect("add volume");
    catalog
        .create_snapshot(SnapshotConfig {
            name: "snap-1".to_string(),
            volume_name: "vol-1".to_string(),
            ..Default::default()
        })
        .await
        .expect("snapshot");

    let err = catalog.delete_volume("vol-1").await.expect_err("snapshot exists");
    assert!(matches!(err, OrchestratorError::FailedPrecondition(_)));

    let clone = catalog
        .clone_volume(VolumeConfig {
            name: "vol-clone".to_string(),
            clone_source_volume: "vol-1".to_string(),
            clone_source_snapshot: "snap-1".to_string(),
            ..Default::default()
        })
        .await
        .expect("clone from snapshot");
    assert_eq!(clone.config.size_bytes, 1 << 20);

    catalog.delete_snapshot("vol-1", "snap-1").await.expect("delete snapshot");
    catalog.delete_volume("vol-1").await.expect("delete volume");
}

#[tokio::test]
async fn test_catalog_survives_restart() {
    let store = Arc::new(InMemoryStore::new());
    let fake = Arc::new(FakeDriver::new());
    {
        let catalog = catalog_with(Arc::clone(&fake), Arc::clone(&store)).await;
        with_block_setup(&catalog, true).await;
        catalog.add_volume(volume_config("vol-1")).await.expect("add volume");
        catalog
            .publish_volume(
                "vol-1",
                PublishRequest {
                    node_name: "n1".to_string(),
                    ..Default::default()
                },
            )
            .await
            .expect("publish");
    }

    let reloaded = catalog_with(fake, store).await;
    assert_eq!(reloaded.list_volumes().await.expect("volumes").len(), 1);
    assert_eq!(reloaded.list_volume_publications().await.expect("publications").len(), 1);
    assert_eq!(reloaded.get_storage_class("gold").await.expect("sc").storage.len(), 1);
    assert!(reloaded.get_chap("vol-1", "n1").await.is_ok());
}

#[tokio::test]
async fn test_pool_offers_roundtrip_through_backend_config() {
    let (catalog, _) = new_catalog().await;
    let backend = catalog
        .add_backend("san1", FAKE_DRIVER_KIND, block_backend_config(false))
        .await
        .expect("add backend");
    let ssd = backend
        .storage_pools
        .iter()
        .find(|p| p.name == "ssd1")
        .expect("ssd pool");
    assert_eq!(ssd.attributes[MEDIA], AttributeValue::Strings(vec!["ssd".to_string()]));
}
