//! TridentVolumeReference CRD
//!
//! Created in a namespace to allow volumes there to clone or share a PVC
//! that lives in another namespace. Without a matching reference, a
//! cross-namespace request is refused.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::CrdError;

const KIND: &str = "TridentVolumeReference";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "trident.netapp.io",
    version = "v1",
    kind = "TridentVolumeReference",
    shortname = "tvref",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TridentVolumeReferenceSpec {
    /// Name of the referenced PVC
    #[serde(rename = "pvcName")]
    pub pvc_name: String,

    /// Namespace of the referenced PVC
    #[serde(rename = "pvcNamespace")]
    pub pvc_namespace: String,
}

/// Index key of a volume reference: `crNamespace_pvcNamespace/pvcName`
pub fn volume_reference_key(cr_namespace: &str, pvc_namespace: &str, pvc_name: &str) -> String {
    format!("{cr_namespace}_{pvc_namespace}/{pvc_name}")
}

impl TridentVolumeReference {
    /// Check both PVC coordinates are present
    pub fn validate(&self) -> Result<(), CrdError> {
        let missing = |field| CrdError::MissingField {
            kind: KIND,
            name: self.name_any(),
            field,
        };
        if self.spec.pvc_name.is_empty() {
            return Err(missing("pvcName"));
        }
        if self.spec.pvc_namespace.is_empty() {
            return Err(missing("pvcNamespace"));
        }
        Ok(())
    }

    /// Index key for this reference
    pub fn cache_key(&self) -> String {
        volume_reference_key(
            &self.namespace().unwrap_or_default(),
            &self.spec.pvc_namespace,
            &self.spec.pvc_name,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn reference(namespace: &str, pvc_namespace: &str, pvc_name: &str) -> TridentVolumeReference {
        TridentVolumeReference {
            metadata: ObjectMeta {
                name: Some("ref".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: TridentVolumeReferenceSpec {
                pvc_name: pvc_name.to_string(),
                pvc_namespace: pvc_namespace.to_string(),
            },
        }
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(reference("team-b", "team-a", "data").cache_key(), "team-b_team-a/data");
    }

    #[test]
    fn test_validate() {
        assert!(reference("team-b", "team-a", "data").validate().is_ok());
        let err = reference("team-b", "", "data").validate().expect_err("namespace missing");
        assert!(err.to_string().contains("pvcNamespace"));
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(&reference("b", "a", "data").spec).expect("serialize");
        assert_eq!(json, serde_json::json!({ "pvcName": "data", "pvcNamespace": "a" }));
    }
}
