//! Frontend helper for bare CSI, with no cluster to consult.
//!
//! Used by conformance runs and any CO other than Kubernetes. Everything the
//! Kubernetes plugin reads from PVCs and storage classes comes from the
//! `CreateVolume` parameters instead, and storage classes are created on the
//! fly from those parameters.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use storage_core::api::{ImportVolumeRequest, UpgradeVolumeRequest};
use storage_core::storage_class::{CSI_PARAMETER_PREFIX, FS_TYPE_PARAMETER};
use storage_core::{
    Feature, FrontendHelper, ORCHESTRATOR_VERSION, Orchestrator, OrchestratorError, Protocol, Result, SnapshotConfig,
    Volume, VolumeConfig, VolumeMode, VolumeRequest, reduce_access_modes, storage_class_config_from_parameters,
};
use tracing::{debug, info};

/// Filesystem used when the request names none
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Prefix of storage classes created from request parameters
pub const AUTO_STORAGE_CLASS_PREFIX: &str = "auto_sc_";

const CSI_FS_TYPE: &str = "csi.storage.k8s.io/fstype";
const PROTOCOL: &str = "protocol";
const LUKS_ENCRYPTION: &str = "luksEncryption";
const IMPORT_ORIGINAL_NAME: &str = "importOriginalName";
const IMPORT_BACKEND: &str = "importBackend";
const IMPORT_NOT_MANAGED: &str = "importNotManaged";

/// Keys describing the volume rather than the pools it may land in
const VOLUME_PARAMETERS: [&str; 5] = [PROTOCOL, LUKS_ENCRYPTION, IMPORT_ORIGINAL_NAME, IMPORT_BACKEND, IMPORT_NOT_MANAGED];

/// [`FrontendHelper`] for bare CSI
pub struct PlainCsiHelper {
    orchestrator: Arc<dyn Orchestrator>,
}

impl std::fmt::Debug for PlainCsiHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainCsiHelper").finish_non_exhaustive()
    }
}

fn parse_protocol(value: &str) -> Result<Protocol> {
    match value.to_ascii_lowercase().as_str() {
        "" | "any" => Ok(Protocol::Any),
        "file" => Ok(Protocol::File),
        "block" => Ok(Protocol::Block),
        "blockonfile" => Ok(Protocol::BlockOnFile),
        other => Err(OrchestratorError::invalid(format!("unknown protocol '{other}'"))),
    }
}

pub(crate) fn parse_bool(key: &str, value: Option<&String>) -> Result<bool> {
    match value {
        None => Ok(false),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| OrchestratorError::invalid(format!("parameter {key}: '{v}' is not a boolean: {e}"))),
    }
}

/// Name of the storage class standing in for a parameter set.
///
/// The name is persisted and must not change between releases.
fn auto_storage_class_name(parameters: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in parameters {
        hasher.update(key.as_bytes());
        hasher.update([0]);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    let mut name = AUTO_STORAGE_CLASS_PREFIX.to_string();
    for byte in &hasher.finalize()[..8] {
        let _ = write!(name, "{byte:02x}");
    }
    name
}

impl PlainCsiHelper {
    pub fn new(orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Find or create the storage class matching `parameters`
    async fn storage_class(&self, parameters: &BTreeMap<String, String>) -> Result<String> {
        let class_parameters: BTreeMap<String, String> = parameters
            .iter()
            .filter(|(k, _)| {
                !VOLUME_PARAMETERS.contains(&k.as_str())
                    && !k.starts_with(CSI_PARAMETER_PREFIX)
                    && !k.eq_ignore_ascii_case(FS_TYPE_PARAMETER)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let name = auto_storage_class_name(&class_parameters);

        match self.orchestrator.get_storage_class(&name).await {
            Ok(_) => return Ok(name),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let config = storage_class_config_from_parameters(&name, &class_parameters)?;
        match self.orchestrator.add_storage_class(config).await {
            Ok(_) => {
                info!(storage_class = %name, "Created storage class from volume parameters");
                Ok(name)
            }
            // Lost a race with a concurrent request for the same parameters
            Err(e) if e.is_already_exists() => Ok(name),
            Err(e) => Err(e),
        }
    }
}

/// Volume config fields that come from the request alone.
///
/// Storage class and import hints are left to the caller.
pub(crate) fn volume_config_from_request(request: &VolumeRequest) -> Result<VolumeConfig> {
    let parameters = &request.parameters;

    let mut protocol = parse_protocol(parameters.get(PROTOCOL).map_or("", String::as_str))?;
    if request.volume_mode == VolumeMode::RawBlock {
        match protocol {
            Protocol::Any => protocol = Protocol::Block,
            Protocol::File => {
                return Err(OrchestratorError::invalid("raw block volumes cannot use the file protocol"));
            }
            _ => {}
        }
    }

    let fs_type = if request.volume_mode == VolumeMode::RawBlock {
        String::new()
    } else {
        [
            parameters.get(CSI_FS_TYPE),
            parameters.get(FS_TYPE_PARAMETER),
            Some(&request.fs_type),
        ]
        .into_iter()
        .flatten()
        .find(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_FS_TYPE.to_string())
    };

    Ok(VolumeConfig {
        name: request.name.clone(),
        size_bytes: request.size_bytes,
        protocol,
        access_mode: reduce_access_modes(&request.access_modes),
        volume_mode: request.volume_mode,
        fs_type,
        clone_source_volume: request.clone_source_volume.clone(),
        clone_source_snapshot: request.clone_source_snapshot.clone(),
        luks_encryption: parse_bool(LUKS_ENCRYPTION, parameters.get(LUKS_ENCRYPTION))?,
        requisite_topologies: request.requisite_topologies.clone(),
        preferred_topologies: request.preferred_topologies.clone(),
        ..Default::default()
    })
}

#[async_trait::async_trait]
impl FrontendHelper for PlainCsiHelper {
    async fn get_volume_config(&self, request: &VolumeRequest) -> Result<VolumeConfig> {
        let parameters = &request.parameters;
        let mut config = volume_config_from_request(request)?;
        config.storage_class = self.storage_class(parameters).await?;

        if let Some(original) = parameters.get(IMPORT_ORIGINAL_NAME).filter(|v| !v.is_empty()) {
            let backend_name = parameters
                .get(IMPORT_BACKEND)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| OrchestratorError::invalid(format!("{IMPORT_ORIGINAL_NAME} requires {IMPORT_BACKEND}")))?;
            let backend = self.orchestrator.get_backend(backend_name).await?;
            debug!(volume = %request.name, original = %original, backend = %backend.name, "Import requested");
            config.import_original_name.clone_from(original);
            config.import_backend_uuid = backend.uuid;
            config.import_not_managed = parse_bool(IMPORT_NOT_MANAGED, parameters.get(IMPORT_NOT_MANAGED))?;
        }

        Ok(config)
    }

    async fn get_snapshot_config(&self, volume_name: &str, snapshot_name: &str) -> Result<SnapshotConfig> {
        Ok(SnapshotConfig {
            version: ORCHESTRATOR_VERSION.to_string(),
            name: snapshot_name.to_string(),
            volume_name: volume_name.to_string(),
            ..Default::default()
        })
    }

    async fn import_volume(&self, _request: ImportVolumeRequest) -> Result<Volume> {
        Err(OrchestratorError::Unsupported(
            "volume import needs a container orchestrator; pass importOriginalName to CreateVolume instead".to_string(),
        ))
    }

    async fn upgrade_volume(&self, _request: UpgradeVolumeRequest) -> Result<Volume> {
        Err(OrchestratorError::Unsupported("volume upgrade needs a container orchestrator".to_string()))
    }

    fn supports_feature(&self, _feature: Feature) -> bool {
        true
    }

    fn version(&self) -> String {
        "csi".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_core::{AccessMode, BuiltinDriverFactory, CatalogOrchestrator, CsiAccessMode, FakeDriver, InMemoryStore};

    async fn helper() -> (PlainCsiHelper, Arc<CatalogOrchestrator>) {
        let catalog = Arc::new(CatalogOrchestrator::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(BuiltinDriverFactory::new(Arc::new(FakeDriver::new()))),
        ));
        catalog.bootstrap().await.expect("bootstrap");
        catalog
            .add_backend("fake1", "fake", serde_json::json!({ "protocol": "block" }))
            .await
            .expect("backend");
        (PlainCsiHelper::new(catalog.clone()), catalog)
    }

    fn request(parameters: &[(&str, &str)]) -> VolumeRequest {
        VolumeRequest {
            name: "vol-1".into(),
            size_bytes: 1 << 30,
            parameters: parameters.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect(),
            access_modes: vec![CsiAccessMode::SingleNodeWriter, CsiAccessMode::MultiNodeReaderOnly],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_volume_config_defaults() {
        let (helper, _) = helper().await;
        let config = helper.get_volume_config(&request(&[])).await.expect("config");
        assert_eq!(config.fs_type, DEFAULT_FS_TYPE);
        assert_eq!(config.access_mode, AccessMode::ReadWriteMany);
        assert_eq!(config.protocol, Protocol::Any);
        assert!(config.storage_class.starts_with(AUTO_STORAGE_CLASS_PREFIX));
    }

    #[tokio::test]
    async fn test_fs_type_parameter_wins() {
        let (helper, _) = helper().await;
        let config = helper
            .get_volume_config(&request(&[("csi.storage.k8s.io/fstype", "xfs")]))
            .await
            .expect("config");
        assert_eq!(config.fs_type, "xfs");
    }

    #[test]
    fn test_auto_storage_class_name_is_stable() {
        let parameters = BTreeMap::from([
            ("media".to_string(), "ssd".to_string()),
            ("fsType".to_string(), "xfs".to_string()),
        ]);
        assert_eq!(auto_storage_class_name(&parameters), "auto_sc_f6e5e8afd8d1c8c2");

        let shifted = BTreeMap::from([
            ("media".to_string(), "ss".to_string()),
            ("fsType".to_string(), "xfs".to_string()),
        ]);
        assert_ne!(auto_storage_class_name(&shifted), auto_storage_class_name(&parameters));
    }

    #[tokio::test]
    async fn test_storage_class_is_reused_for_the_same_parameters() {
        let (helper, catalog) = helper().await;
        let first = helper
            .get_volume_config(&request(&[("media", "ssd"), ("protocol", "block")]))
            .await
            .expect("first");
        let second = helper
            .get_volume_config(&request(&[("media", "ssd"), ("luksEncryption", "true")]))
            .await
            .expect("second");
        assert_eq!(first.storage_class, second.storage_class);
        assert!(second.luks_encryption);
        assert_eq!(catalog.list_storage_classes().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_raw_block_forces_block_protocol() {
        let (helper, _) = helper().await;
        let mut raw = request(&[]);
        raw.volume_mode = VolumeMode::RawBlock;
        let config = helper.get_volume_config(&raw).await.expect("config");
        assert_eq!(config.protocol, Protocol::Block);
        assert!(config.fs_type.is_empty());

        let mut conflicting = request(&[("protocol", "file")]);
        conflicting.volume_mode = VolumeMode::RawBlock;
        assert!(helper.get_volume_config(&conflicting).await.is_err());
    }

    #[tokio::test]
    async fn test_import_hint_names_an_unknown_backend() {
        let (helper, _) = helper().await;
        let err = helper
            .get_volume_config(&request(&[("importOriginalName", "lun7"), ("importBackend", "bogus")]))
            .await
            .expect_err("bogus backend");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("bogus"));
    }

    #[tokio::test]
    async fn test_import_hint_resolves_the_backend() {
        let (helper, catalog) = helper().await;
        let backend = catalog.get_backend("fake1").await.expect("backend");
        let config = helper
            .get_volume_config(&request(&[
                ("importOriginalName", "lun7"),
                ("importBackend", "fake1"),
                ("importNotManaged", "true"),
            ]))
            .await
            .expect("config");
        assert_eq!(config.import_original_name, "lun7");
        assert_eq!(config.import_backend_uuid, backend.uuid);
        assert!(config.import_not_managed);
    }

    #[tokio::test]
    async fn test_snapshot_config_carries_the_version() {
        let (helper, _) = helper().await;
        let config = helper.get_snapshot_config("vol-1", "snap-1").await.expect("config");
        assert_eq!(config.version, ORCHESTRATOR_VERSION);
        assert_eq!(config.id(), "vol-1/snap-1");
    }
}
