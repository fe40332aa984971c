//! Catalog entities.
//!
//! Entities refer to each other by stable keys (volume name, backend UUID,
//! node name), never by pointer. All of them serialize as camelCase JSON,
//! which is the shape used on the controller REST API.

use crate::attributes::{AttributeRequest, AttributeValue};
use crate::pools::PoolMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Data path used to reach a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Protocol {
    /// Whatever the chosen backend serves
    #[default]
    Any,
    /// NFS/SMB style file share
    File,
    /// iSCSI/NVMe block device
    Block,
    /// Block device backed by a file on a share
    BlockOnFile,
}

impl Protocol {
    /// True when a backend serving `self` can host a volume asking for `wanted`.
    pub fn serves(self, wanted: Protocol) -> bool {
        match wanted {
            Protocol::Any => true,
            Protocol::BlockOnFile => self == Protocol::File,
            other => self == other,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Any => "any",
            Self::File => "file",
            Self::Block => "block",
            Self::BlockOnFile => "blockOnFile",
        };
        f.write_str(s)
    }
}

/// Volume access mode, reduced from the CSI access modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AccessMode {
    /// Mounted read-write by one node
    #[default]
    ReadWriteOnce,
    /// Mounted read-write by one pod
    ReadWriteOncePod,
    /// Mounted read-only by many nodes
    ReadOnlyMany,
    /// Mounted read-write by many nodes
    ReadWriteMany,
}

/// Whether the workload sees a filesystem or a raw block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VolumeMode {
    /// Formatted and mounted
    #[default]
    Filesystem,
    /// Raw device
    RawBlock,
}

/// Backend lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum BackendState {
    /// Serving requests
    #[default]
    Online,
    /// Temporarily unreachable
    Offline,
    /// Failed initialization
    Failed,
    /// Marked for deletion; remains until its volumes are gone
    Deleting,
}

/// Volume lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum VolumeState {
    /// Creation in flight
    Creating,
    /// Usable
    #[default]
    Online,
    /// Marked for deletion; may be observed but not published
    Deleting,
    /// Being adopted from a legacy volume
    Upgrading,
    /// Owning backend is gone
    MissingBackend,
}

/// Snapshot lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotState {
    /// Creation in flight
    Creating,
    /// Usable
    #[default]
    Online,
    /// Parent volume is gone
    MissingVolume,
}

/// Node readiness for new publications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum NodePublicationState {
    /// Registered, not yet confirmed clean
    #[default]
    Provisional,
    /// Accepts publications
    Ready,
    /// Must be cleaned before new publications
    Cleanable,
}

/// A storage pool offered by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    /// Owning backend name
    pub backend: String,
    /// Pool name
    pub name: String,
    /// Attributes offered by the pool
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// A configured storage backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    /// Stable identifier
    pub uuid: String,
    /// Unique name
    pub name: String,
    /// Driver family ("ontap-san", "gcnv", ...)
    pub driver_kind: String,
    /// Driver configuration as submitted
    #[serde(default)]
    pub config: serde_json::Value,
    /// Lifecycle state
    #[serde(default)]
    pub state: BackendState,
    /// Protocol served by the backend
    #[serde(default)]
    pub protocol: Protocol,
    /// Whether block publications require CHAP credentials
    #[serde(default)]
    pub requires_chap: bool,
    /// Pools offered
    #[serde(default)]
    pub storage_pools: Vec<StoragePool>,
}

/// User-level storage intent matched against pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassConfig {
    /// Unique name
    pub name: String,
    /// Attribute requirements
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeRequest>,
    /// Pools that are the only eligible targets when non-empty
    #[serde(default)]
    pub pools: PoolMap,
    /// Pools added regardless of attributes
    #[serde(default)]
    pub additional_pools: PoolMap,
    /// Pools never eligible
    #[serde(default)]
    pub excluded_pools: PoolMap,
}

/// A storage class with the pools it currently matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageClass {
    /// Configuration as submitted
    pub config: StorageClassConfig,
    /// Backend name -> matching pool names
    #[serde(default)]
    pub storage: PoolMap,
}

/// Everything needed to create, import or clone a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    /// Unique name (the CSI volume ID)
    pub name: String,
    /// Name of the artifact on the backend
    #[serde(default)]
    pub internal_name: String,
    /// Size in bytes
    #[serde(default)]
    pub size_bytes: u64,
    /// Data path
    #[serde(default)]
    pub protocol: Protocol,
    /// Reduced access mode
    #[serde(default)]
    pub access_mode: AccessMode,
    /// Filesystem or raw block
    #[serde(default)]
    pub volume_mode: VolumeMode,
    /// Filesystem type for block volumes
    #[serde(default)]
    pub fs_type: String,
    /// Storage class name
    #[serde(default)]
    pub storage_class: String,
    /// Namespace of the claim that requested the volume
    #[serde(default)]
    pub namespace: String,
    /// Name of the claim that requested the volume
    #[serde(default)]
    pub requested_by: String,
    /// Source volume when cloning
    #[serde(default)]
    pub clone_source_volume: String,
    /// Source snapshot when cloning
    #[serde(default)]
    pub clone_source_snapshot: String,
    /// Backend artifact adopted by import
    #[serde(default)]
    pub import_original_name: String,
    /// Backend owning the imported artifact
    #[serde(default)]
    pub import_backend_uuid: String,
    /// Adopted but never deleted from the backend
    #[serde(default)]
    pub import_not_managed: bool,
    /// Block volume wrapped in LUKS
    #[serde(default)]
    pub luks_encryption: bool,
    /// Passphrase names the controller knows may be installed
    #[serde(default)]
    pub luks_passphrase_names: Vec<String>,
    /// Topology segments the volume must be reachable from
    #[serde(default)]
    pub requisite_topologies: Vec<BTreeMap<String, String>>,
    /// Topology segments preferred for placement
    #[serde(default)]
    pub preferred_topologies: Vec<BTreeMap<String, String>>,
}

/// A provisioned volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Configuration, including the effective size
    pub config: VolumeConfig,
    /// Owning backend
    pub backend_uuid: String,
    /// Pool holding the volume
    #[serde(default)]
    pub pool: String,
    /// Lifecycle state
    #[serde(default)]
    pub state: VolumeState,
}

/// Backend view of an artifact, used by import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeExternal {
    /// Name on the backend
    pub internal_name: String,
    /// Actual size in bytes
    pub size_bytes: u64,
    /// Pool holding the artifact
    #[serde(default)]
    pub pool: String,
}

/// Request to create a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotConfig {
    /// Orchestrator API version that produced the config
    #[serde(default)]
    pub version: String,
    /// Snapshot name
    pub name: String,
    /// Name on the backend
    #[serde(default)]
    pub internal_name: String,
    /// Parent volume
    pub volume_name: String,
    /// Parent volume's backend name
    #[serde(default)]
    pub volume_internal_name: String,
}

impl SnapshotConfig {
    /// `volume/snapshot`, the snapshot's CSI ID.
    pub fn id(&self) -> String {
        snapshot_id(&self.volume_name, &self.name)
    }
}

/// Builds the CSI snapshot ID for a snapshot of a volume.
pub fn snapshot_id(volume: &str, snapshot: &str) -> String {
    format!("{volume}/{snapshot}")
}

/// Splits a CSI snapshot ID into `(volume, snapshot)`.
pub fn parse_snapshot_id(id: &str) -> Option<(&str, &str)> {
    id.split_once('/').filter(|(v, s)| !v.is_empty() && !s.is_empty())
}

/// A point-in-time copy of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Configuration
    pub config: SnapshotConfig,
    /// RFC 3339 creation time
    pub created: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Lifecycle state
    #[serde(default)]
    pub state: SnapshotState,
}

/// Record that a volume has been made available to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumePublication {
    /// Volume name
    pub volume_name: String,
    /// Node name
    pub node_name: String,
    /// Published read-only
    #[serde(default)]
    pub read_only: bool,
    /// Access mode at publish time
    #[serde(default)]
    pub access_mode: AccessMode,
    /// Node reported the attachment as unsafe (e.g. after a non-graceful shutdown)
    #[serde(default)]
    pub not_safe_to_attach: bool,
}

impl VolumePublication {
    /// Composite `(volume, node)` key.
    pub fn key(&self) -> String {
        publication_key(&self.volume_name, &self.node_name)
    }
}

/// Builds the composite publication key.
pub fn publication_key(volume: &str, node: &str) -> String {
    format!("{volume}.{node}")
}

/// Host facts reported by a node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    /// OS distribution
    #[serde(default)]
    pub os_distro: String,
    /// OS version
    #[serde(default)]
    pub os_version: String,
    /// Storage services found on the host ("iscsid", "multipathd", ...)
    #[serde(default)]
    pub services: Vec<String>,
}

/// A node agent registered with the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Node name
    pub name: String,
    /// iSCSI initiator name
    #[serde(default)]
    pub iqn: String,
    /// Node IP addresses
    #[serde(default)]
    pub ips: Vec<String>,
    /// Topology labels
    #[serde(default)]
    pub topology_labels: BTreeMap<String, String>,
    /// Host facts
    #[serde(default)]
    pub host_info: Option<HostInfo>,
    /// Publication readiness
    #[serde(default)]
    pub publication_state: NodePublicationState,
}

/// Bidirectional CHAP credentials for one `(volume, node)` pair.
///
/// `Debug` never prints the secrets.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChapCredentials {
    /// Initiator user name
    #[serde(default)]
    pub initiator_user: String,
    /// Initiator secret
    #[serde(default)]
    pub initiator_secret: String,
    /// Target user name
    #[serde(default)]
    pub target_user: String,
    /// Target secret
    #[serde(default)]
    pub target_secret: String,
}

impl fmt::Debug for ChapCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChapCredentials")
            .field("initiator_user", &self.initiator_user)
            .field("initiator_secret", &"<REDACTED>")
            .field("target_user", &self.target_user)
            .field("target_secret", &"<REDACTED>")
            .finish()
    }
}

/// Parameters of a publish request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    /// Target node
    pub node_name: String,
    /// Read-only publication
    #[serde(default)]
    pub read_only: bool,
    /// Access mode requested
    #[serde(default)]
    pub access_mode: AccessMode,
}

/// What a node needs to attach a published volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumePublishInfo {
    /// Data path
    pub protocol: Protocol,
    /// Filesystem type for block volumes
    #[serde(default)]
    pub fs_type: String,
    /// Whether the volume is LUKS encrypted
    #[serde(default)]
    pub luks_encryption: bool,
    /// iSCSI target IQN
    #[serde(default)]
    pub iscsi_target_iqn: String,
    /// Primary iSCSI portal
    #[serde(default)]
    pub iscsi_target_portal: String,
    /// Additional iSCSI portals
    #[serde(default)]
    pub iscsi_portals: Vec<String>,
    /// LUN number
    #[serde(default)]
    pub iscsi_lun: i32,
    /// CHAP credentials when the backend requires them
    #[serde(default)]
    pub chap: Option<ChapCredentials>,
    /// NFS server for file volumes
    #[serde(default)]
    pub nfs_server: String,
    /// NFS export path for file volumes
    #[serde(default)]
    pub nfs_path: String,
    /// Mount options
    #[serde(default)]
    pub mount_options: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chap_debug_redacts_secrets() {
        let chap = ChapCredentials {
            initiator_user: "user".into(),
            initiator_secret: "s3cret".into(),
            target_user: "tuser".into(),
            target_secret: "t0p".into(),
        };
        let printed = format!("{chap:?}");
        assert!(printed.contains("user"));
        assert!(!printed.contains("s3cret"));
        assert!(!printed.contains("t0p"));
    }

    #[test]
    fn snapshot_ids_split_on_first_slash() {
        assert_eq!(parse_snapshot_id("vol-1/snap-1"), Some(("vol-1", "snap-1")));
        assert_eq!(parse_snapshot_id("vol-1"), None);
        assert_eq!(parse_snapshot_id("/snap"), None);
    }

    #[test]
    fn node_serializes_camel_case() {
        let node = Node {
            name: "n1".into(),
            iqn: "iqn.2000-01.x:y".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&node).expect("node serializes");
        assert_eq!(json["publicationState"], "provisional");
        assert_eq!(json["iqn"], "iqn.2000-01.x:y");
    }
}
