//! Kubernetes reconciliation plugin
//!
//! Keeps the catalog in step with the cluster and answers the CSI
//! frontend's questions about claims, storage classes and features.
//!
//! # Modules
//!
//! - **api**: direct API server calls, behind a trait for tests
//! - **index**: copy-on-write indexes and the cache wait loop
//! - **watchers**: the six watchers and the periodic passes
//! - **import**: adopting a backend artifact through a new claim

pub mod api;
pub mod import;
pub mod index;
pub mod watchers;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crds::{TridentVolumeReference, volume_reference_key};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use semver::Version;
use storage_core::api::{ImportVolumeRequest, UpgradeVolumeRequest};
use storage_core::{
    Feature, FrontendHelper, Orchestrator, OrchestratorError, Result, SnapshotConfig, Volume, VolumeConfig,
    VolumeRequest, storage_class_config_from_parameters,
};
use tracing::{debug, info, warn};

use crate::frontend::DRIVER_NAME;
use crate::plain::{PlainCsiHelper, parse_bool, volume_config_from_request};
use api::ClusterApi;
use index::{CachedObject, Indexes, Lookup};

/// Annotation recording the backend artifact an imported claim adopts
pub const ANN_IMPORT_ORIGINAL_NAME: &str = "trident.netapp.io/importOriginalName";
/// Annotation recording the backend owning an imported artifact
pub const ANN_IMPORT_BACKEND_UUID: &str = "trident.netapp.io/importBackendUUID";
/// Annotation marking an imported artifact the catalog must never delete
pub const ANN_NOT_MANAGED: &str = "trident.netapp.io/notManaged";
/// Annotation naming the claim to clone from
pub const ANN_CLONE_FROM_PVC: &str = "trident.netapp.io/cloneFromPVC";
/// Namespace of [`ANN_CLONE_FROM_PVC`], defaulting to the claim's own
pub const ANN_CLONE_FROM_NAMESPACE: &str = "trident.netapp.io/cloneFromNamespace";
/// Provisioner annotation set on imported claims
pub const ANN_STORAGE_PROVISIONER: &str = "volume.beta.kubernetes.io/storage-provisioner";

const PVC_NAME_PARAMETER: &str = "csi.storage.k8s.io/pvc/name";
const PVC_NAMESPACE_PARAMETER: &str = "csi.storage.k8s.io/pvc/namespace";

/// Watcher resync and node reconcile period
pub const RESYNC_PERIOD: Duration = Duration::from_secs(60);
/// Legacy resize period when the cluster cannot expand volumes itself
pub const LEGACY_RESIZE_PERIOD: Duration = Duration::from_secs(180);

/// Oldest cluster version offering `feature`
pub fn minimum_version(feature: Feature) -> Version {
    match feature {
        Feature::ExpandVolume => Version::new(1, 16, 0),
        Feature::VolumeSnapshots => Version::new(1, 17, 0),
        Feature::BlockVolumes => Version::new(1, 14, 0),
    }
}

/// Parse a resource quantity such as `10Gi`, `500M` or `1.5Ti` into bytes
pub fn parse_quantity(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    let multiplier: u64 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => return None,
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier);
    }
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        reason = "resource quantities are far below 2^53"
    )]
    let bytes = (value * multiplier as f64).ceil() as u64;
    Some(bytes)
}

/// Storage requested by a claim, in bytes
pub fn requested_storage(pvc: &PersistentVolumeClaim) -> Option<u64> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .and_then(|q| parse_quantity(&q.0))
}

fn is_bound(pv: &PersistentVolume) -> bool {
    pv.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound")
}

/// [`FrontendHelper`] backed by the cluster
pub struct KubernetesPlugin {
    orchestrator: Arc<dyn Orchestrator>,
    cluster: Arc<dyn ClusterApi>,
    plain: PlainCsiHelper,
    pub(crate) indexes: Indexes,
    version: Version,
}

impl std::fmt::Debug for KubernetesPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesPlugin")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl KubernetesPlugin {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, cluster: Arc<dyn ClusterApi>, version: Version) -> Self {
        Self {
            plain: PlainCsiHelper::new(Arc::clone(&orchestrator)),
            orchestrator,
            cluster,
            indexes: Indexes::default(),
            version,
        }
    }

    /// Ask the API server for its version, then build the plugin
    pub async fn connect(orchestrator: Arc<dyn Orchestrator>, cluster: Arc<dyn ClusterApi>) -> Result<Self> {
        let version = cluster.server_version().await?;
        info!(version = %version, "Connected to Kubernetes");
        Ok(Self::new(orchestrator, cluster, version))
    }

    /// True when this object belongs in its index
    fn accepts(object: &CachedObject) -> bool {
        match object {
            CachedObject::Claim(pvc) => requested_storage(pvc).is_some(),
            _ => true,
        }
    }

    async fn on_apply(&self, object: &CachedObject) {
        match object {
            CachedObject::Claim(pvc) => {
                debug!(pvc = %pvc.name_any(), namespace = ?pvc.namespace(), "PVC added or updated");
            }
            CachedObject::Volume(pv) => debug!(pv = %pv.name_any(), "PV added or updated"),
            CachedObject::Class(sc) => self.on_storage_class(sc).await,
            CachedObject::Node(node) => debug!(node = %node.name_any(), "Node added or updated"),
            CachedObject::Mirror(tmr) => {
                if let Err(e) = tmr.validate() {
                    warn!(error = %e, "Invalid mirror relationship");
                } else {
                    let pvcs: Vec<&str> = tmr.local_pvc_names().collect();
                    debug!(relationship = %tmr.name_any(), state = ?tmr.spec.state, pvcs = ?pvcs, "Mirror relationship updated");
                }
            }
            CachedObject::Reference(tvr) => {
                if let Err(e) = tvr.validate() {
                    warn!(error = %e, "Invalid volume reference");
                } else {
                    debug!(key = %tvr.cache_key(), "Volume reference updated");
                }
            }
        }
    }

    async fn on_delete(&self, object: &CachedObject) {
        match object {
            CachedObject::Class(sc) if sc.provisioner == DRIVER_NAME => {
                let name = sc.name_any();
                match self.orchestrator.delete_storage_class(&name).await {
                    Ok(()) => info!(storage_class = %name, "Storage class removed"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!(storage_class = %name, error = %e, "Could not remove storage class"),
                }
            }
            CachedObject::Node(node) => self.on_node_deleted(&node.name_any()).await,
            _ => {}
        }
    }

    /// Add a storage class aimed at this provisioner to the catalog
    async fn ensure_storage_class(&self, sc: &StorageClass) -> Result<()> {
        let name = sc.name_any();
        let parameters = sc.parameters.clone().unwrap_or_default();
        let config = storage_class_config_from_parameters(&name, &parameters)?;
        match self.orchestrator.add_storage_class(config).await {
            Ok(added) => {
                info!(storage_class = %name, backends = added.storage.len(), "Storage class added from cluster");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn on_storage_class(&self, sc: &StorageClass) {
        if sc.provisioner != DRIVER_NAME {
            debug!(storage_class = %sc.name_any(), provisioner = %sc.provisioner, "Storage class for another provisioner");
            return;
        }
        // Failures are retried by the next resync
        if let Err(e) = self.ensure_storage_class(sc).await {
            warn!(storage_class = %sc.name_any(), error = %e, "Could not add storage class");
        }
    }

    async fn on_node_deleted(&self, name: &str) {
        match self.orchestrator.delete_node(name).await {
            Ok(()) => info!(node = %name, "Node removed from the catalog"),
            Err(e) if e.is_not_found() => debug!(node = %name, "Deleted node was not registered"),
            Err(e) => warn!(node = %name, error = %e, "Could not remove deleted node"),
        }
    }

    /// Remove catalog nodes the cluster no longer has; returns how many went
    pub async fn reconcile_nodes(&self) -> Result<usize> {
        let cluster_nodes = self.cluster.list_node_names().await?;
        let mut removed = 0;
        for node in self.orchestrator.list_nodes().await? {
            if cluster_nodes.contains(&node.name) {
                continue;
            }
            match self.orchestrator.delete_node(&node.name).await {
                Ok(()) => {
                    info!(node = %node.name, "Removed node missing from the cluster");
                    removed += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(node = %node.name, error = %e, "Could not remove stale node"),
            }
        }
        Ok(removed)
    }

    /// Periodic pass: re-offer storage classes and reconcile nodes
    pub async fn resync(&self) {
        for sc in self.indexes.classes.list::<StorageClass>() {
            self.on_storage_class(&sc).await;
        }
        if let Err(e) = self.reconcile_nodes().await {
            warn!(error = %e, "Node reconcile failed");
        }
    }

    /// Grow volumes whose bound claim asks for more than they have.
    ///
    /// Only scheduled on clusters too old to drive expansion through CSI.
    pub async fn resize_pass(&self) -> usize {
        let mut resized = 0;
        for pvc in self.indexes.claims.list::<PersistentVolumeClaim>() {
            let Some(volume_name) = pvc.spec.as_ref().and_then(|s| s.volume_name.clone()) else {
                continue;
            };
            let Some(requested) = requested_storage(&pvc) else {
                continue;
            };
            match self.orchestrator.get_volume(&volume_name).await {
                Ok(volume) if volume.config.size_bytes < requested => {
                    match self.orchestrator.resize_volume(&volume_name, requested).await {
                        Ok(_) => {
                            info!(volume = %volume_name, size_bytes = requested, "Resized volume for its claim");
                            resized += 1;
                        }
                        Err(e) => warn!(volume = %volume_name, error = %e, "Legacy resize failed"),
                    }
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(volume = %volume_name, error = %e, "Could not read volume for resize"),
            }
        }
        resized
    }

    /// A claim from the index, or straight from the API server on a miss
    async fn claim(&self, namespace: &str, name: &str) -> Result<Arc<PersistentVolumeClaim>> {
        let cached = self
            .indexes
            .claims
            .find::<PersistentVolumeClaim>(|c| c.namespace().as_deref() == Some(namespace) && c.name_any() == name);
        if let Lookup::Found(pvc) = cached {
            return Ok(pvc);
        }
        self.cluster
            .get_pvc(namespace, name)
            .await?
            .map(Arc::new)
            .ok_or_else(|| OrchestratorError::not_found("PersistentVolumeClaim", format!("{namespace}/{name}")))
    }

    /// Catalog storage class for a claim, added from the cluster if missing
    async fn storage_class_for(&self, pvc: &PersistentVolumeClaim) -> Result<String> {
        let name = pvc
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.clone())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| OrchestratorError::invalid(format!("PVC {} names no storage class", pvc.name_any())))?;

        match self.orchestrator.get_storage_class(&name).await {
            Ok(_) => return Ok(name),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        match self.indexes.classes.find::<StorageClass>(|sc| sc.name_any() == name) {
            Lookup::Found(sc) if sc.provisioner == DRIVER_NAME => {
                self.ensure_storage_class(&sc).await?;
                Ok(name)
            }
            _ => Err(OrchestratorError::not_found("storage class", name)),
        }
    }

    /// Source volume named by the clone annotations.
    ///
    /// A source in another namespace needs a volume reference in the
    /// claim's namespace pointing at it.
    async fn clone_source(&self, namespace: &str, annotations: &BTreeMap<String, String>) -> Result<Option<String>> {
        let Some(source) = annotations.get(ANN_CLONE_FROM_PVC).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let source_namespace = annotations
            .get(ANN_CLONE_FROM_NAMESPACE)
            .filter(|s| !s.is_empty())
            .map_or(namespace, String::as_str);

        if source_namespace != namespace {
            let key = volume_reference_key(namespace, source_namespace, source);
            if !matches!(
                self.indexes.references.get::<TridentVolumeReference>(&key),
                Lookup::Found(_)
            ) {
                return Err(OrchestratorError::FailedPrecondition(format!(
                    "cloning {source_namespace}/{source} into namespace {namespace} needs a TridentVolumeReference"
                )));
            }
        }

        let source_pvc = self.claim(source_namespace, source).await?;
        let volume = source_pvc
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                OrchestratorError::FailedPrecondition(format!("clone source {source_namespace}/{source} is not bound"))
            })?;
        Ok(Some(volume))
    }
}

#[async_trait::async_trait]
impl FrontendHelper for KubernetesPlugin {
    async fn get_volume_config(&self, request: &VolumeRequest) -> Result<VolumeConfig> {
        let parameters = &request.parameters;
        let (Some(name), Some(namespace)) = (
            parameters.get(PVC_NAME_PARAMETER),
            parameters.get(PVC_NAMESPACE_PARAMETER),
        ) else {
            // Provisioner runs without claim metadata
            return self.plain.get_volume_config(request).await;
        };

        let pvc = self.claim(namespace, name).await?;
        let mut config = volume_config_from_request(request)?;
        config.namespace.clone_from(namespace);
        config.requested_by.clone_from(name);
        config.storage_class = self.storage_class_for(&pvc).await?;

        let annotations = pvc.annotations();
        if let Some(original) = annotations.get(ANN_IMPORT_ORIGINAL_NAME).filter(|v| !v.is_empty()) {
            config.import_original_name.clone_from(original);
            config.import_backend_uuid = annotations
                .get(ANN_IMPORT_BACKEND_UUID)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| {
                    OrchestratorError::invalid(format!("PVC {namespace}/{name} lacks {ANN_IMPORT_BACKEND_UUID}"))
                })?;
            config.import_not_managed = parse_bool(ANN_NOT_MANAGED, annotations.get(ANN_NOT_MANAGED))?;
        }

        if config.clone_source_volume.is_empty() && config.clone_source_snapshot.is_empty() {
            if let Some(source) = self.clone_source(namespace, annotations).await? {
                config.clone_source_volume = source;
            }
        }

        debug!(volume = %config.name, pvc = %name, namespace = %namespace, storage_class = %config.storage_class, "Volume config from PVC");
        Ok(config)
    }

    async fn get_snapshot_config(&self, volume_name: &str, snapshot_name: &str) -> Result<SnapshotConfig> {
        self.plain.get_snapshot_config(volume_name, snapshot_name).await
    }

    async fn import_volume(&self, request: ImportVolumeRequest) -> Result<Volume> {
        self.import(request).await
    }

    async fn upgrade_volume(&self, mut request: UpgradeVolumeRequest) -> Result<Volume> {
        let pv = self
            .cluster
            .get_pv(&request.volume)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("PersistentVolume", &request.volume))?;
        if !is_bound(&pv) {
            return Err(OrchestratorError::FailedPrecondition(format!("PV {} is not bound", request.volume)));
        }
        if request.pvc.is_none() {
            request.pvc = pv
                .spec
                .as_ref()
                .and_then(|s| s.claim_ref.as_ref())
                .and_then(|r| r.name.clone());
        }
        self.orchestrator.upgrade_volume(request).await
    }

    fn supports_feature(&self, feature: Feature) -> bool {
        self.version >= minimum_version(feature)
    }

    fn version(&self) -> String {
        self.version.to_string()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use api::fake::FakeClusterApi;
    use storage_core::{BuiltinDriverFactory, CatalogOrchestrator, FakeDriver, InMemoryStore, StorageClassConfig};

    pub struct Fixture {
        pub plugin: Arc<KubernetesPlugin>,
        pub catalog: Arc<CatalogOrchestrator>,
        pub fake: Arc<FakeDriver>,
        pub cluster: Arc<FakeClusterApi>,
    }

    /// Plugin over a bootstrapped catalog with backend `fake1` and class `gold`
    pub async fn fixture(version: &str) -> Fixture {
        let fake = Arc::new(FakeDriver::new());
        let catalog = Arc::new(CatalogOrchestrator::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(BuiltinDriverFactory::new(Arc::clone(&fake))),
        ));
        catalog.bootstrap().await.expect("bootstrap");
        catalog
            .add_backend("fake1", "fake", serde_json::json!({ "protocol": "block" }))
            .await
            .expect("backend");
        catalog
            .add_storage_class(StorageClassConfig {
                name: "gold".to_string(),
                ..Default::default()
            })
            .await
            .expect("storage class");

        let cluster = Arc::new(FakeClusterApi::new(version));
        let plugin = KubernetesPlugin::connect(catalog.clone(), cluster.clone())
            .await
            .expect("connect");
        for index in [
            &plugin.indexes.claims,
            &plugin.indexes.volumes,
            &plugin.indexes.classes,
            &plugin.indexes.nodes,
            &plugin.indexes.mirrors,
            &plugin.indexes.references,
        ] {
            index.mark_synced();
        }
        Fixture {
            plugin: Arc::new(plugin),
            catalog,
            fake,
            cluster,
        }
    }

    pub fn claim_request(volume: &str, namespace: &str, pvc: &str) -> VolumeRequest {
        VolumeRequest {
            name: volume.to_string(),
            size_bytes: 1 << 30,
            parameters: [
                (PVC_NAME_PARAMETER.to_string(), pvc.to_string()),
                (PVC_NAMESPACE_PARAMETER.to_string(), namespace.to_string()),
            ]
            .into(),
            ..Default::default()
        }
    }
}
