//! Container orchestrator helper surface.
//!
//! The CSI frontend does not talk to Kubernetes directly. It asks a
//! [`FrontendHelper`] to turn a CSI request into a volume config, to run
//! imports and upgrades, and to answer feature questions. The Kubernetes
//! plugin and the plain-CSI helper both implement it.

use crate::api::{ImportVolumeRequest, UpgradeVolumeRequest};
use crate::error::Result;
use crate::model::{AccessMode, SnapshotConfig, Volume, VolumeConfig, VolumeMode};
use std::collections::BTreeMap;

/// CSI access modes as received on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CsiAccessMode {
    /// One node, read-write
    SingleNodeWriter,
    /// One node, read-only
    SingleNodeReaderOnly,
    /// Many nodes, read-only
    MultiNodeReaderOnly,
    /// Many nodes, one writer
    MultiNodeSingleWriter,
    /// Many nodes, many writers
    MultiNodeMultiWriter,
    /// One pod, read-write
    SingleNodeSingleWriter,
    /// Many pods on one node, read-write
    SingleNodeMultiWriter,
}

impl CsiAccessMode {
    fn multi_node(self) -> bool {
        matches!(
            self,
            Self::MultiNodeReaderOnly | Self::MultiNodeSingleWriter | Self::MultiNodeMultiWriter
        )
    }

    fn writer(self) -> bool {
        !matches!(self, Self::SingleNodeReaderOnly | Self::MultiNodeReaderOnly)
    }
}

/// OR-reduces a list of requested access modes into one volume access mode.
///
/// Any multi-node mode that can write gives `ReadWriteMany`. A multi-node
/// reader together with any writer also gives `ReadWriteMany`, since several
/// nodes may attach while one writes. Multi-node readers alone give
/// `ReadOnlyMany`. A list made only of single-pod writers gives
/// `ReadWriteOncePod`. Everything else, including an empty list, is
/// `ReadWriteOnce`.
pub fn reduce_access_modes(modes: &[CsiAccessMode]) -> AccessMode {
    let multi = modes.iter().any(|m| m.multi_node());
    let writer = modes.iter().any(|m| m.writer());

    if multi && writer {
        AccessMode::ReadWriteMany
    } else if multi {
        AccessMode::ReadOnlyMany
    } else if !modes.is_empty() && modes.iter().all(|m| *m == CsiAccessMode::SingleNodeSingleWriter) {
        AccessMode::ReadWriteOncePod
    } else {
        AccessMode::ReadWriteOnce
    }
}

/// Features gated on the container orchestrator version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feature {
    /// Online volume expansion
    ExpandVolume,
    /// CSI snapshots
    VolumeSnapshots,
    /// Raw block volumes
    BlockVolumes,
}

/// A CSI `CreateVolume` request, decoupled from the protobuf types.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VolumeRequest {
    /// Volume name chosen by the CO
    pub name: String,
    /// Requested size in bytes
    pub size_bytes: u64,
    /// Storage class parameters
    pub parameters: BTreeMap<String, String>,
    /// Requested access modes
    pub access_modes: Vec<CsiAccessMode>,
    /// Filesystem or raw block
    pub volume_mode: VolumeMode,
    /// Filesystem type from the mount capability
    pub fs_type: String,
    /// Volume to clone from
    pub clone_source_volume: String,
    /// Snapshot to clone from, `volume/snapshot`
    pub clone_source_snapshot: String,
    /// Topology segments the volume must be reachable from
    pub requisite_topologies: Vec<BTreeMap<String, String>>,
    /// Preferred topology segments
    pub preferred_topologies: Vec<BTreeMap<String, String>>,
}

/// Hooks the CSI frontend needs from the container orchestrator.
#[async_trait::async_trait]
pub trait FrontendHelper: Send + Sync {
    /// Builds the volume config for a `CreateVolume` request
    async fn get_volume_config(&self, request: &VolumeRequest) -> Result<VolumeConfig>;

    /// Builds the snapshot config for a `CreateSnapshot` request
    async fn get_snapshot_config(&self, volume_name: &str, snapshot_name: &str) -> Result<SnapshotConfig>;

    /// Adopts an existing backend artifact
    async fn import_volume(&self, request: ImportVolumeRequest) -> Result<Volume>;

    /// Adopts a legacy volume as a CSI volume
    async fn upgrade_volume(&self, request: UpgradeVolumeRequest) -> Result<Volume>;

    /// True when the orchestrator supports `feature`
    fn supports_feature(&self, feature: Feature) -> bool;

    /// Container orchestrator version
    fn version(&self) -> String;
}
