//! Collaborator interfaces
//!
//! Backend drivers and the catalog's persistence layer live outside this
//! workspace. The catalog only sees them through these traits.

use crate::error::Result;
use crate::model::{Protocol, Snapshot, SnapshotConfig, StoragePool, VolumeConfig, VolumeExternal, VolumePublishInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What a driver reports after validating its configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackendDescription {
    /// Protocol served
    pub protocol: Protocol,
    /// Whether block publications need CHAP credentials
    pub requires_chap: bool,
    /// Pools offered
    pub pools: Vec<StoragePool>,
}

/// Vendor-specific storage driver.
#[async_trait::async_trait]
pub trait BackendDriver: Send + Sync {
    /// Driver family name
    fn kind(&self) -> &str;

    /// Validates the configuration and discovers pools
    async fn initialize(&self, backend_name: &str, config: &serde_json::Value) -> Result<BackendDescription>;

    /// Creates a volume in `pool`
    async fn create(&self, config: &VolumeConfig, pool: &str) -> Result<()>;

    /// Creates `config.internal_name` as a clone of `source_internal_name`
    async fn create_clone(&self, source_internal_name: &str, source_snapshot: Option<&str>, config: &VolumeConfig) -> Result<()>;

    /// Looks up an existing artifact by its backend name
    async fn get_volume_external(&self, internal_name: &str) -> Result<VolumeExternal>;

    /// Deletes a volume; deleting something already gone succeeds
    async fn destroy(&self, internal_name: &str) -> Result<()>;

    /// Grows a volume
    async fn resize(&self, internal_name: &str, size_bytes: u64) -> Result<()>;

    /// Makes a volume reachable from a node
    async fn publish(&self, config: &VolumeConfig, node_name: &str, node_iqn: &str) -> Result<VolumePublishInfo>;

    /// Removes node access
    async fn unpublish(&self, config: &VolumeConfig, node_name: &str) -> Result<()>;

    /// Takes a snapshot
    async fn create_snapshot(&self, config: &SnapshotConfig) -> Result<Snapshot>;

    /// Removes a snapshot
    async fn delete_snapshot(&self, config: &SnapshotConfig) -> Result<()>;
}

/// Builds drivers by family name.
pub trait DriverFactory: Send + Sync {
    /// Returns a driver for `driver_kind` or `InvalidInput` if it is unknown
    fn create(&self, driver_kind: &str) -> Result<Arc<dyn BackendDriver>>;
}

/// Catalog record families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordKind {
    /// Backends, keyed by name
    Backend,
    /// Storage classes, keyed by name
    StorageClass,
    /// Volumes, keyed by name
    Volume,
    /// Snapshots, keyed by `volume/snapshot`
    Snapshot,
    /// Publications, keyed by `volume.node`
    Publication,
    /// Nodes, keyed by name
    Node,
    /// CHAP credentials, keyed like publications
    Chap,
}

/// Durable storage for catalog records.
///
/// Records are opaque JSON documents; the catalog owns their schema.
#[async_trait::async_trait]
pub trait PersistentStore: Send + Sync {
    /// Inserts or replaces a record
    async fn put(&self, kind: RecordKind, key: &str, value: serde_json::Value) -> Result<()>;

    /// Reads a record; `None` when absent
    async fn get(&self, kind: RecordKind, key: &str) -> Result<Option<serde_json::Value>>;

    /// Removes a record; removing an absent record succeeds
    async fn delete(&self, kind: RecordKind, key: &str) -> Result<()>;

    /// All records of one kind
    async fn list(&self, kind: RecordKind) -> Result<Vec<serde_json::Value>>;
}
