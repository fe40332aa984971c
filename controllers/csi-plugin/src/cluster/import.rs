//! Volume import.
//!
//! The caller hands over a claim template and the name of an artifact that
//! already exists on a backend. The claim is annotated so the CSI create
//! that follows adopts the artifact instead of provisioning a new one, then
//! created in the cluster. The import finishes once the provisioner has
//! bound a volume to it.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use storage_core::api::ImportVolumeRequest;
use storage_core::{OrchestratorError, Result, Volume};
use tracing::info;

use super::index::cache_wait;
use super::{
    ANN_IMPORT_BACKEND_UUID, ANN_IMPORT_ORIGINAL_NAME, ANN_NOT_MANAGED, ANN_STORAGE_PROVISIONER, KubernetesPlugin,
    is_bound,
};
use crate::frontend::DRIVER_NAME;

/// How long the provisioner gets to bind the imported claim
pub const IMPORT_BIND_WAIT: Duration = Duration::from_secs(180);

/// Decode a base64 claim, JSON or YAML
pub fn decode_pvc(data: &str) -> Result<PersistentVolumeClaim> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| OrchestratorError::invalid(format!("PVC data is not base64: {e}")))?;
    match serde_json::from_slice(&bytes) {
        Ok(pvc) => Ok(pvc),
        Err(json) => serde_yaml::from_slice(&bytes)
            .map_err(|yaml| OrchestratorError::invalid(format!("PVC data is neither JSON ({json}) nor YAML ({yaml})"))),
    }
}

fn bound_to(pv: &PersistentVolume, namespace: &str, name: &str, uid: Option<&str>) -> bool {
    let Some(claim) = pv.spec.as_ref().and_then(|s| s.claim_ref.as_ref()) else {
        return false;
    };
    let uid_matches = match (uid, claim.uid.as_deref()) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => true,
    };
    is_bound(pv) && claim.namespace.as_deref() == Some(namespace) && claim.name.as_deref() == Some(name) && uid_matches
}

impl KubernetesPlugin {
    pub(super) async fn import(&self, request: ImportVolumeRequest) -> Result<Volume> {
        let mut pvc = decode_pvc(&request.pvc_data).map_err(|e| e.context("import"))?;
        let namespace = pvc.namespace().unwrap_or_else(|| "default".to_string());
        let name = pvc.name_any();
        let claim = format!("{namespace}/{name}");
        let stage = |what: &str| {
            let context = format!("import of PVC {claim}, {what}");
            move |e: OrchestratorError| e.context(context)
        };

        if name.is_empty() {
            return Err(OrchestratorError::invalid("import: PVC has no name"));
        }
        if pvc.spec.as_ref().and_then(|s| s.storage_class_name.as_deref()).is_none_or(str::is_empty) {
            return Err(stage("validating the PVC")(OrchestratorError::invalid("no storage class")));
        }

        match self.orchestrator.get_volume_by_internal_name(&request.internal_name).await {
            Ok(existing) => {
                return Err(stage("checking for an existing volume")(OrchestratorError::already_exists(
                    "volume",
                    existing.config.name,
                )));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(stage("checking for an existing volume")(e)),
        }

        let backend = self
            .orchestrator
            .get_backend(&request.backend)
            .await
            .map_err(stage("looking up the backend"))?;
        let external = self
            .orchestrator
            .get_volume_external(&request.internal_name, &backend.name)
            .await
            .map_err(stage("reading the volume from the backend"))?;

        pvc.metadata.namespace = Some(namespace.clone());
        pvc.metadata.uid = None;
        pvc.metadata.resource_version = None;
        pvc.status = None;
        let annotations = pvc.annotations_mut();
        annotations.insert(ANN_IMPORT_ORIGINAL_NAME.to_string(), request.internal_name.clone());
        annotations.insert(ANN_IMPORT_BACKEND_UUID.to_string(), backend.uuid.clone());
        annotations.insert(ANN_NOT_MANAGED.to_string(), request.no_manage.to_string());
        annotations.insert(ANN_STORAGE_PROVISIONER.to_string(), DRIVER_NAME.to_string());
        pvc.spec
            .get_or_insert_with(Default::default)
            .resources
            .get_or_insert_with(Default::default)
            .requests
            .get_or_insert_with(Default::default)
            .insert("storage".to_string(), Quantity(external.size_bytes.to_string()));

        let created = self.cluster.create_pvc(&pvc).await.map_err(stage("creating the PVC"))?;
        info!(pvc = %claim, internal_name = %request.internal_name, backend = %backend.name, size_bytes = external.size_bytes, "Created PVC for import");

        let uid = created.metadata.uid.clone();
        let volumes = &self.indexes.volumes;
        let pv = cache_wait("bound PV", &claim, IMPORT_BIND_WAIT, || {
            volumes.find::<PersistentVolume>(|pv| bound_to(pv, &namespace, &name, uid.as_deref()))
        })
        .await
        .map_err(stage("waiting for the PV to bind"))?;

        let volume = self
            .orchestrator
            .get_volume(&pv.name_any())
            .await
            .map_err(stage("reading the imported volume"))?;
        info!(pvc = %claim, volume = %volume.config.name, "Volume imported");
        Ok(volume)
    }
}
