//! TridentMirrorRelationship CRD
//!
//! Declares the replication state between local PVCs and their remote
//! volumes. The controller reports progress per mapping in the status.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::CrdError;

const KIND: &str = "TridentMirrorRelationship";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "trident.netapp.io",
    version = "v1",
    kind = "TridentMirrorRelationship",
    shortname = "tmr",
    namespaced,
    status = "TridentMirrorRelationshipStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct TridentMirrorRelationshipSpec {
    /// Desired mirror state
    #[serde(default)]
    pub state: MirrorState,

    /// Backend replication policy
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub replication_policy: String,

    /// Backend replication schedule
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub replication_schedule: String,

    /// Local PVC to remote volume pairs; exactly one is supported
    pub volume_mappings: Vec<VolumeMapping>,
}

/// Desired or observed mirror state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum MirrorState {
    /// Local volume is the replication destination
    #[default]
    Established,
    /// Local volume was promoted and is writable
    Promoted,
    /// Replication resumed after a promotion
    Reestablished,
}

/// One local PVC and its remote counterpart
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMapping {
    /// Local PVC name, in the resource's namespace
    #[serde(rename = "localPVCName")]
    pub local_pvc_name: String,

    /// Backend handle of the remote volume
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_volume_handle: String,

    /// Snapshot to restore on promotion
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub promoted_snapshot_handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TridentMirrorRelationshipStatus {
    /// Per-mapping conditions
    #[serde(default)]
    pub conditions: Vec<MirrorCondition>,
}

/// Observed state of one mapping
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MirrorCondition {
    /// Observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<MirrorState>,

    /// Local PVC name
    #[serde(rename = "localPVCName", default)]
    pub local_pvc_name: String,

    /// Local volume handle
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_volume_handle: String,

    /// Remote volume handle
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_volume_handle: String,

    /// Human readable detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Generation this condition describes
    #[serde(default)]
    pub observed_generation: i64,

    /// When the state last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl TridentMirrorRelationship {
    /// Check the mapping list and that a destination names its source
    pub fn validate(&self) -> Result<(), CrdError> {
        let name = self.name_any();
        if self.spec.volume_mappings.len() != 1 {
            return Err(CrdError::InvalidValue {
                kind: KIND,
                name,
                field: "volumeMappings",
                value: format!("{} entries", self.spec.volume_mappings.len()),
            });
        }
        for mapping in &self.spec.volume_mappings {
            if mapping.local_pvc_name.is_empty() {
                return Err(CrdError::MissingField {
                    kind: KIND,
                    name,
                    field: "localPVCName",
                });
            }
            if self.spec.state != MirrorState::Promoted && mapping.remote_volume_handle.is_empty() {
                return Err(CrdError::MissingField {
                    kind: KIND,
                    name,
                    field: "remoteVolumeHandle",
                });
            }
        }
        Ok(())
    }

    /// Local PVC names this relationship covers
    pub fn local_pvc_names(&self) -> impl Iterator<Item = &str> {
        self.spec.volume_mappings.iter().map(|m| m.local_pvc_name.as_str())
    }
}
