//! Orchestrator trait
//!
//! The orchestrator owns the catalog of backends, storage classes, volumes,
//! snapshots, publications and nodes. The CSI frontend, the REST API and the
//! Kubernetes plugin all drive it through this trait so they can be tested
//! against the in-memory catalog.

use crate::api::UpgradeVolumeRequest;
use crate::error::Result;
use crate::model::*;

/// Catalog operations.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait Orchestrator: Send + Sync {
    /// Orchestrator API version string
    fn version(&self) -> String;

    /// Fails with `NotReady` or `BootstrapInProgress` until the catalog is loaded
    fn is_ready(&self) -> Result<()>;

    // Backends
    async fn add_backend(&self, name: &str, driver_kind: &str, config: serde_json::Value) -> Result<Backend>;
    async fn get_backend(&self, name: &str) -> Result<Backend>;
    async fn get_backend_by_uuid(&self, uuid: &str) -> Result<Backend>;
    async fn list_backends(&self) -> Result<Vec<Backend>>;
    async fn update_backend_state(&self, name: &str, state: BackendState) -> Result<Backend>;
    async fn delete_backend(&self, name: &str) -> Result<()>;

    // Storage classes
    async fn add_storage_class(&self, config: StorageClassConfig) -> Result<StorageClass>;
    async fn get_storage_class(&self, name: &str) -> Result<StorageClass>;
    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>>;
    async fn delete_storage_class(&self, name: &str) -> Result<()>;

    // Volumes
    async fn add_volume(&self, config: VolumeConfig) -> Result<Volume>;
    async fn clone_volume(&self, config: VolumeConfig) -> Result<Volume>;
    async fn import_volume(&self, config: VolumeConfig) -> Result<Volume>;
    async fn get_volume(&self, name: &str) -> Result<Volume>;
    async fn get_volume_by_internal_name(&self, internal_name: &str) -> Result<Volume>;
    async fn get_volume_external(&self, internal_name: &str, backend_name: &str) -> Result<VolumeExternal>;
    async fn list_volumes(&self) -> Result<Vec<Volume>>;
    async fn resize_volume(&self, name: &str, size_bytes: u64) -> Result<Volume>;
    async fn delete_volume(&self, name: &str) -> Result<()>;
    async fn upgrade_volume(&self, request: UpgradeVolumeRequest) -> Result<Volume>;
    async fn update_volume_luks_passphrase_names(&self, name: &str, names: Vec<String>) -> Result<()>;

    // Publications
    async fn publish_volume(&self, volume: &str, request: PublishRequest) -> Result<VolumePublishInfo>;
    async fn unpublish_volume(&self, volume: &str, node: &str) -> Result<()>;
    async fn get_volume_publication(&self, volume: &str, node: &str) -> Result<VolumePublication>;
    async fn list_volume_publications(&self) -> Result<Vec<VolumePublication>>;
    async fn list_volume_publications_for_volume(&self, volume: &str) -> Result<Vec<VolumePublication>>;
    async fn list_volume_publications_for_node(&self, node: &str) -> Result<Vec<VolumePublication>>;
    async fn update_volume_publication(&self, volume: &str, node: &str, not_safe_to_attach: Option<bool>) -> Result<VolumePublication>;

    // Nodes
    async fn add_node(&self, node: Node) -> Result<Node>;
    async fn get_node(&self, name: &str) -> Result<Node>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn update_node_publication_state(&self, name: &str, state: NodePublicationState) -> Result<Node>;
    async fn delete_node(&self, name: &str) -> Result<()>;

    // Snapshots
    async fn create_snapshot(&self, config: SnapshotConfig) -> Result<Snapshot>;
    async fn get_snapshot(&self, volume: &str, snapshot: &str) -> Result<Snapshot>;
    async fn list_snapshots(&self) -> Result<Vec<Snapshot>>;
    async fn list_snapshots_for_volume(&self, volume: &str) -> Result<Vec<Snapshot>>;
    async fn delete_snapshot(&self, volume: &str, snapshot: &str) -> Result<()>;

    // CHAP
    async fn get_chap(&self, volume: &str, node: &str) -> Result<ChapCredentials>;
}
