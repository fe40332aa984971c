//! Controller REST API wire types
//!
//! Shared by the REST server and the node-side client so both ends agree on
//! field names. All bodies are camelCase JSON.

use crate::model::*;
use serde::{Deserialize, Serialize};

/// `GET /version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    /// Orchestrator version
    pub server_version: String,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human readable message
    pub error: String,
}

/// `POST /backend`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddBackendRequest {
    /// Backend name
    pub name: String,
    /// Driver family
    pub driver_kind: String,
    /// Driver configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

/// `POST /backend/{b}/state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStateUpdate {
    /// New state
    pub state: BackendState,
}

/// `GET /backend/{b}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetBackendResponse {
    /// The backend
    pub backend: Backend,
}

/// `GET /backend`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListBackendsResponse {
    /// Backend names
    pub backends: Vec<String>,
}

/// `GET /storageclass/{s}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetStorageClassResponse {
    /// The storage class
    pub storage_class: StorageClass,
}

/// `GET /storageclass`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListStorageClassesResponse {
    /// Storage class names
    pub storage_classes: Vec<String>,
}

/// `GET /volume/{v}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetVolumeResponse {
    /// The volume
    pub volume: Volume,
}

/// `GET /volume`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListVolumesResponse {
    /// Volume names
    pub volumes: Vec<String>,
}

/// `POST /volume/import`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportVolumeRequest {
    /// Backend name
    pub backend: String,
    /// Artifact name on the backend
    pub internal_name: String,
    /// Adopt without taking over deletion
    #[serde(default)]
    pub no_manage: bool,
    /// Base64 encoded PVC, JSON or YAML
    pub pvc_data: String,
}

/// `POST /volume/{v}/upgrade`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeVolumeRequest {
    /// PV name of the legacy volume
    pub volume: String,
    /// Bound PVC, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<String>,
}

/// `GET /node/{n}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNodeResponse {
    /// The node
    pub node: Node,
}

/// `PUT /node/{n}` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddNodeResponse {
    /// Node name
    pub name: String,
    /// Topology labels recorded for the node
    #[serde(default)]
    pub topology_labels: std::collections::BTreeMap<String, String>,
}

/// `GET /node`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListNodesResponse {
    /// Node names
    pub nodes: Vec<String>,
}

/// `PUT /node/{n}/publication`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePublicationStateUpdate {
    /// New publication state
    pub publication_state: NodePublicationState,
}

/// `PUT /publication/{v}/{n}`
///
/// Absent fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumePublicationUpdate {
    /// New `notSafeToAttach` value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_safe_to_attach: Option<bool>,
}

/// `GET /publication/{v}/{n}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetVolumePublicationResponse {
    /// The publication
    pub volume_publication: VolumePublication,
}

/// `GET /publication`, `GET /volume/{v}/publication`, `GET /node/{n}/publication`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListVolumePublicationsResponse {
    /// Publications
    pub volume_publications: Vec<VolumePublication>,
}

/// `GET /snapshot/{v}/{s}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSnapshotResponse {
    /// The snapshot
    pub snapshot: Snapshot,
}

/// `GET /snapshot`, `GET /volume/{v}/snapshot`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListSnapshotsResponse {
    /// Snapshot IDs (`volume/snapshot`)
    pub snapshots: Vec<String>,
}

/// `GET /chap/{v}/{n}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetChapResponse {
    /// Credentials
    pub chap: ChapCredentials,
}
