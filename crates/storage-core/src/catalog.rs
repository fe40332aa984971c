//! Reference catalog
//!
//! [`CatalogOrchestrator`] implements [`Orchestrator`] over a
//! [`PersistentStore`] and a [`DriverFactory`]. All mutations take the catalog
//! write lock, so they are serialized. Reads share the lock.

use crate::api::UpgradeVolumeRequest;
use crate::error::{OrchestratorError, Result};
use crate::interfaces::{BackendDriver, DriverFactory, PersistentStore, RecordKind};
use crate::model::*;
use crate::orchestrator::Orchestrator;
use crate::pools::PoolMatcher;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Orchestrator API version reported by `/version`.
pub const ORCHESTRATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size given to volumes requested with no capacity.
pub const DEFAULT_VOLUME_SIZE_BYTES: u64 = 1 << 30;

const CHAP_SECRET_LENGTH: usize = 16;

#[derive(Default)]
struct CatalogState {
    backends: BTreeMap<String, Backend>,
    drivers: BTreeMap<String, Arc<dyn BackendDriver>>,
    storage_classes: BTreeMap<String, StorageClass>,
    volumes: BTreeMap<String, Volume>,
    snapshots: BTreeMap<String, Snapshot>,
    publications: BTreeMap<String, VolumePublication>,
    nodes: BTreeMap<String, Node>,
    chap: BTreeMap<String, ChapCredentials>,
}

impl CatalogState {
    fn backend_by_name(&self, name: &str) -> Result<&Backend> {
        self.backends
            .values()
            .find(|b| b.name == name)
            .ok_or_else(|| OrchestratorError::not_found("backend", name))
    }

    fn backend(&self, uuid: &str) -> Result<&Backend> {
        self.backends
            .get(uuid)
            .ok_or_else(|| OrchestratorError::not_found("backend", uuid))
    }

    fn driver(&self, uuid: &str) -> Result<Arc<dyn BackendDriver>> {
        self.drivers
            .get(uuid)
            .cloned()
            .ok_or_else(|| OrchestratorError::internal(format!("no driver loaded for backend {uuid}")))
    }

    fn volume(&self, name: &str) -> Result<&Volume> {
        self.volumes
            .get(name)
            .ok_or_else(|| OrchestratorError::not_found("volume", name))
    }

    fn backend_has_volumes(&self, uuid: &str) -> bool {
        self.volumes.values().any(|v| v.backend_uuid == uuid)
    }

    fn publications_for_volume(&self, volume: &str) -> Vec<VolumePublication> {
        self.publications
            .values()
            .filter(|p| p.volume_name == volume)
            .cloned()
            .collect()
    }

    /// Recomputes which pools every storage class selects.
    fn refresh_storage_class_pools(&mut self) {
        let backends: Vec<Backend> = self.backends.values().cloned().collect();
        for sc in self.storage_classes.values_mut() {
            sc.storage = matching_pools(&sc.config, &backends);
        }
    }
}

fn matching_pools(config: &StorageClassConfig, backends: &[Backend]) -> crate::pools::PoolMap {
    let mut storage = crate::pools::PoolMap::new();
    let pools = PoolMatcher::new(&config.pools);
    let additional_pools = PoolMatcher::new(&config.additional_pools);
    let excluded_pools = PoolMatcher::new(&config.excluded_pools);

    for backend in backends {
        for pool in &backend.storage_pools {
            if !pools.is_empty() && !pools.matches(&backend.name, &pool.name) {
                continue;
            }

            let attributes_ok = config.attributes.iter().all(|(name, request)| {
                pool.attributes
                    .get(name)
                    .is_some_and(|offer| offer.satisfies(request))
            });
            let additional = additional_pools.matches(&backend.name, &pool.name);
            let excluded = excluded_pools.matches(&backend.name, &pool.name);

            if (attributes_ok || additional) && !excluded {
                storage
                    .entry(backend.name.clone())
                    .or_default()
                    .insert(pool.name.clone());
            }
        }
    }

    storage
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CHAP_SECRET_LENGTH)
        .map(char::from)
        .collect()
}

fn generate_chap() -> ChapCredentials {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    ChapCredentials {
        initiator_user: format!("chap-{}", &suffix[..12]),
        initiator_secret: generate_secret(),
        target_user: format!("chap-target-{}", &suffix[12..24]),
        target_secret: generate_secret(),
    }
}

/// In-process catalog over pluggable persistence and drivers.
pub struct CatalogOrchestrator {
    store: Arc<dyn PersistentStore>,
    drivers: Arc<dyn DriverFactory>,
    state: RwLock<CatalogState>,
    bootstrap: OnceLock<std::result::Result<(), String>>,
    enable_force_detach: bool,
}

impl std::fmt::Debug for CatalogOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogOrchestrator")
            .field("bootstrapped", &self.bootstrap.get().is_some())
            .field("enable_force_detach", &self.enable_force_detach)
            .finish_non_exhaustive()
    }
}

impl CatalogOrchestrator {
    /// Creates a catalog that reports not-ready until [`Self::bootstrap`] runs.
    pub fn new(store: Arc<dyn PersistentStore>, drivers: Arc<dyn DriverFactory>) -> Self {
        Self {
            store,
            drivers,
            state: RwLock::new(CatalogState::default()),
            bootstrap: OnceLock::new(),
            enable_force_detach: false,
        }
    }

    /// Refuse publications to nodes whose publication state is not `ready`.
    #[must_use]
    pub fn with_force_detach(mut self, enabled: bool) -> Self {
        self.enable_force_detach = enabled;
        self
    }

    /// Loads every record from the store and initializes backend drivers.
    ///
    /// Backends whose driver fails to initialize are kept in the `failed`
    /// state with their last known pools.
    pub async fn bootstrap(&self) -> Result<()> {
        let outcome = self.load().await;
        let recorded = outcome.as_ref().map(|_| ()).map_err(ToString::to_string);
        let _ = self.bootstrap.set(recorded);
        match &outcome {
            Ok(()) => info!("Catalog bootstrap complete"),
            Err(e) => warn!(error = %e, "Catalog bootstrap failed"),
        }
        outcome
    }

    async fn load(&self) -> Result<()> {
        let mut state = self.state.write().await;

        for mut backend in self.load_kind::<Backend>(RecordKind::Backend).await? {
            match self.drivers.create(&backend.driver_kind) {
                Ok(driver) => {
                    match driver.initialize(&backend.name, &backend.config).await {
                        Ok(description) => {
                            backend.protocol = description.protocol;
                            backend.requires_chap = description.requires_chap;
                            backend.storage_pools = description.pools;
                        }
                        Err(e) => {
                            warn!(backend = %backend.name, error = %e, "Backend driver failed to initialize");
                            backend.state = BackendState::Failed;
                        }
                    }
                    state.drivers.insert(backend.uuid.clone(), driver);
                }
                Err(e) => {
                    warn!(backend = %backend.name, error = %e, "No driver for backend");
                    backend.state = BackendState::Failed;
                }
            }
            state.backends.insert(backend.uuid.clone(), backend);
        }

        for sc in self.load_kind::<StorageClass>(RecordKind::StorageClass).await? {
            state.storage_classes.insert(sc.config.name.clone(), sc);
        }
        for volume in self.load_kind::<Volume>(RecordKind::Volume).await? {
            if !state.backends.contains_key(&volume.backend_uuid) {
                warn!(volume = %volume.config.name, backend = %volume.backend_uuid, "Volume references a missing backend");
            }
            state.volumes.insert(volume.config.name.clone(), volume);
        }
        for snapshot in self.load_kind::<Snapshot>(RecordKind::Snapshot).await? {
            state.snapshots.insert(snapshot.config.id(), snapshot);
        }
        for publication in self.load_kind::<VolumePublication>(RecordKind::Publication).await? {
            state.publications.insert(publication.key(), publication);
        }
        for node in self.load_kind::<Node>(RecordKind::Node).await? {
            state.nodes.insert(node.name.clone(), node);
        }
        for (key, value) in self.load_chap().await? {
            state.chap.insert(key, value);
        }

        state.refresh_storage_class_pools();
        debug!(
            backends = state.backends.len(),
            volumes = state.volumes.len(),
            nodes = state.nodes.len(),
            "Catalog loaded"
        );
        Ok(())
    }

    async fn load_kind<T: DeserializeOwned>(&self, kind: RecordKind) -> Result<Vec<T>> {
        self.store
            .list(kind)
            .await?
            .into_iter()
            .map(|value| {
                serde_json::from_value(value)
                    .map_err(|e| OrchestratorError::internal(format!("corrupt {kind:?} record: {e}")))
            })
            .collect()
    }

    async fn load_chap(&self) -> Result<Vec<(String, ChapCredentials)>> {
        #[derive(serde::Deserialize)]
        struct Record {
            key: String,
            chap: ChapCredentials,
        }
        Ok(self
            .load_kind::<Record>(RecordKind::Chap)
            .await?
            .into_iter()
            .map(|r| (r.key, r.chap))
            .collect())
    }

    async fn persist<T: Serialize>(&self, kind: RecordKind, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| OrchestratorError::internal(format!("failed to encode {kind:?} record {key}: {e}")))?;
        self.store.put(kind, key, value).await
    }

    async fn persist_chap(&self, key: &str, chap: &ChapCredentials) -> Result<()> {
        self.persist(RecordKind::Chap, key, &serde_json::json!({ "key": key, "chap": chap }))
            .await
    }

    /// Places a new volume on the first pool that accepts it.
    async fn place_volume(&self, state: &CatalogState, mut config: VolumeConfig) -> Result<Volume> {
        let sc = state
            .storage_classes
            .get(&config.storage_class)
            .ok_or_else(|| OrchestratorError::not_found("storage class", &config.storage_class))?;

        let mut last_error = None;
        for (backend_name, pools) in &sc.storage {
            let Ok(backend) = state.backend_by_name(backend_name) else {
                continue;
            };
            if backend.state != BackendState::Online || !backend.protocol.serves(config.protocol) {
                continue;
            }
            if config.luks_encryption && backend.protocol != Protocol::Block {
                continue;
            }
            let driver = state.driver(&backend.uuid)?;

            for pool in pools {
                let mut attempt = config.clone();
                attempt.protocol = backend.protocol;
                match driver.create(&attempt, pool).await {
                    Ok(()) => {
                        config = attempt;
                        info!(volume = %config.name, backend = %backend.name, pool = %pool, "Volume created");
                        return Ok(Volume {
                            config,
                            backend_uuid: backend.uuid.clone(),
                            pool: pool.clone(),
                            state: VolumeState::Online,
                        });
                    }
                    Err(e) => {
                        warn!(volume = %config.name, backend = %backend.name, pool = %pool, error = %e, "Pool rejected volume");
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            OrchestratorError::ResourceExhausted(format!(
                "no available backend pool for volume {} in storage class {}",
                config.name, config.storage_class
            ))
        }))
    }

    fn check_ready(&self) -> Result<()> {
        match self.bootstrap.get() {
            None => Err(OrchestratorError::NotReady),
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => Err(OrchestratorError::BootstrapInProgress(message.clone())),
        }
    }

    fn check_publishable(volume: &Volume) -> Result<()> {
        match volume.state {
            VolumeState::Deleting => Err(OrchestratorError::VolumeDeleting(volume.config.name.clone())),
            VolumeState::Creating => Err(OrchestratorError::VolumeCreating(volume.config.name.clone())),
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Orchestrator for CatalogOrchestrator {
    fn version(&self) -> String {
        ORCHESTRATOR_VERSION.to_string()
    }

    fn is_ready(&self) -> Result<()> {
        self.check_ready()
    }

    async fn add_backend(&self, name: &str, driver_kind: &str, config: serde_json::Value) -> Result<Backend> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        if state.backend_by_name(name).is_ok() {
            return Err(OrchestratorError::already_exists("backend", name));
        }

        let driver = self.drivers.create(driver_kind)?;
        let description = driver.initialize(name, &config).await?;
        let backend = Backend {
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            driver_kind: driver_kind.to_string(),
            config,
            state: BackendState::Online,
            protocol: description.protocol,
            requires_chap: description.requires_chap,
            storage_pools: description.pools,
        };

        self.persist(RecordKind::Backend, &backend.uuid, &backend).await?;
        state.drivers.insert(backend.uuid.clone(), driver);
        state.backends.insert(backend.uuid.clone(), backend.clone());
        state.refresh_storage_class_pools();
        info!(backend = %name, uuid = %backend.uuid, pools = backend.storage_pools.len(), "Backend added");
        Ok(backend)
    }

    async fn get_backend(&self, name: &str) -> Result<Backend> {
        self.check_ready()?;
        self.state.read().await.backend_by_name(name).cloned()
    }

    async fn get_backend_by_uuid(&self, uuid: &str) -> Result<Backend> {
        self.check_ready()?;
        self.state.read().await.backend(uuid).cloned()
    }

    async fn list_backends(&self) -> Result<Vec<Backend>> {
        self.check_ready()?;
        Ok(self.state.read().await.backends.values().cloned().collect())
    }

    async fn update_backend_state(&self, name: &str, new_state: BackendState) -> Result<Backend> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        let mut backend = state.backend_by_name(name)?.clone();
        backend.state = new_state;
        self.persist(RecordKind::Backend, &backend.uuid, &backend).await?;
        state.backends.insert(backend.uuid.clone(), backend.clone());
        info!(backend = %name, state = ?new_state, "Backend state updated");
        Ok(backend)
    }

    async fn delete_backend(&self, name: &str) -> Result<()> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        let mut backend = state.backend_by_name(name)?.clone();

        if state.backend_has_volumes(&backend.uuid) {
            backend.state = BackendState::Deleting;
            self.persist(RecordKind::Backend, &backend.uuid, &backend).await?;
            state.backends.insert(backend.uuid.clone(), backend);
            info!(backend = %name, "Backend still owns volumes, marked for deletion");
            return Ok(());
        }

        self.store.delete(RecordKind::Backend, &backend.uuid).await?;
        state.backends.remove(&backend.uuid);
        state.drivers.remove(&backend.uuid);
        state.refresh_storage_class_pools();
        info!(backend = %name, "Backend deleted");
        Ok(())
    }

    async fn add_storage_class(&self, config: StorageClassConfig) -> Result<StorageClass> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        if state.storage_classes.contains_key(&config.name) {
            return Err(OrchestratorError::already_exists("storage class", &config.name));
        }

        let backends: Vec<Backend> = state.backends.values().cloned().collect();
        let sc = StorageClass {
            storage: matching_pools(&config, &backends),
            config,
        };
        self.persist(RecordKind::StorageClass, &sc.config.name, &sc).await?;
        state.storage_classes.insert(sc.config.name.clone(), sc.clone());
        info!(storage_class = %sc.config.name, backends = sc.storage.len(), "Storage class added");
        Ok(sc)
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        self.check_ready()?;
        self.state
            .read()
            .await
            .storage_classes
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("storage class", name))
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        self.check_ready()?;
        Ok(self.state.read().await.storage_classes.values().cloned().collect())
    }

    async fn delete_storage_class(&self, name: &str) -> Result<()> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        if state.storage_classes.remove(name).is_none() {
            return Err(OrchestratorError::not_found("storage class", name));
        }
        self.store.delete(RecordKind::StorageClass, name).await?;
        info!(storage_class = %name, "Storage class deleted");
        Ok(())
    }

    async fn add_volume(&self, mut config: VolumeConfig) -> Result<Volume> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        if let Some(existing) = state.volumes.get(&config.name) {
            return match existing.state {
                VolumeState::Creating => Err(OrchestratorError::VolumeCreating(config.name)),
                VolumeState::Deleting => Err(OrchestratorError::VolumeDeleting(config.name)),
                _ => Err(OrchestratorError::already_exists("volume", &config.name)),
            };
        }

        if config.internal_name.is_empty() {
            config.internal_name = config.name.clone();
        }
        if config.size_bytes == 0 {
            config.size_bytes = DEFAULT_VOLUME_SIZE_BYTES;
        }
        if config.luks_encryption && !matches!(config.protocol, Protocol::Block | Protocol::Any) {
            return Err(OrchestratorError::invalid("LUKS encryption requires a block volume"));
        }

        let volume = self.place_volume(&state, config).await?;
        self.persist(RecordKind::Volume, &volume.config.name, &volume).await?;
        state.volumes.insert(volume.config.name.clone(), volume.clone());
        Ok(volume)
    }

    async fn clone_volume(&self, mut config: VolumeConfig) -> Result<Volume> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        if state.volumes.contains_key(&config.name) {
            return Err(OrchestratorError::already_exists("volume", &config.name));
        }

        let source = state.volume(&config.clone_source_volume)?.clone();
        Self::check_publishable(&source)?;
        let source_snapshot = if config.clone_source_snapshot.is_empty() {
            None
        } else {
            let key = snapshot_id(&source.config.name, &config.clone_source_snapshot);
            let snapshot = state
                .snapshots
                .get(&key)
                .ok_or_else(|| OrchestratorError::not_found("snapshot", key))?;
            Some(snapshot.config.internal_name.clone())
        };

        if config.internal_name.is_empty() {
            config.internal_name = config.name.clone();
        }
        config.size_bytes = config.size_bytes.max(source.config.size_bytes);
        config.protocol = source.config.protocol;
        config.luks_encryption = source.config.luks_encryption;
        config.luks_passphrase_names = source.config.luks_passphrase_names.clone();

        let driver = state.driver(&source.backend_uuid)?;
        driver
            .create_clone(&source.config.internal_name, source_snapshot.as_deref(), &config)
            .await?;

        let volume = Volume {
            config,
            backend_uuid: source.backend_uuid.clone(),
            pool: source.pool.clone(),
            state: VolumeState::Online,
        };
        self.persist(RecordKind::Volume, &volume.config.name, &volume).await?;
        state.volumes.insert(volume.config.name.clone(), volume.clone());
        info!(volume = %volume.config.name, source = %source.config.name, "Volume cloned");
        Ok(volume)
    }

    async fn import_volume(&self, mut config: VolumeConfig) -> Result<Volume> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        if state.volumes.contains_key(&config.name) {
            return Err(OrchestratorError::already_exists("volume", &config.name));
        }
        if let Some(existing) = state
            .volumes
            .values()
            .find(|v| v.config.internal_name == config.import_original_name)
        {
            return Err(OrchestratorError::already_exists("volume", &existing.config.name));
        }

        let backend = state.backend(&config.import_backend_uuid)?.clone();
        let driver = state.driver(&backend.uuid)?;
        let external = driver.get_volume_external(&config.import_original_name).await?;

        config.internal_name = external.internal_name;
        config.size_bytes = external.size_bytes;
        config.protocol = backend.protocol;

        let volume = Volume {
            config,
            backend_uuid: backend.uuid.clone(),
            pool: external.pool,
            state: VolumeState::Online,
        };
        self.persist(RecordKind::Volume, &volume.config.name, &volume).await?;
        state.volumes.insert(volume.config.name.clone(), volume.clone());
        info!(
            volume = %volume.config.name,
            internal_name = %volume.config.internal_name,
            backend = %backend.name,
            managed = !volume.config.import_not_managed,
            "Volume imported"
        );
        Ok(volume)
    }

    async fn get_volume(&self, name: &str) -> Result<Volume> {
        self.check_ready()?;
        self.state.read().await.volume(name).cloned()
    }

    async fn get_volume_by_internal_name(&self, internal_name: &str) -> Result<Volume> {
        self.check_ready()?;
        self.state
            .read()
            .await
            .volumes
            .values()
            .find(|v| v.config.internal_name == internal_name)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("volume", internal_name))
    }

    async fn get_volume_external(&self, internal_name: &str, backend_name: &str) -> Result<VolumeExternal> {
        self.check_ready()?;
        let driver = {
            let state = self.state.read().await;
            let backend = state.backend_by_name(backend_name)?;
            state.driver(&backend.uuid)?
        };
        driver.get_volume_external(internal_name).await
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.check_ready()?;
        Ok(self.state.read().await.volumes.values().cloned().collect())
    }

    async fn resize_volume(&self, name: &str, size_bytes: u64) -> Result<Volume> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        let mut volume = state.volume(name)?.clone();
        Self::check_publishable(&volume)?;

        if size_bytes < volume.config.size_bytes {
            return Err(OrchestratorError::CapacityOutOfRange(format!(
                "volume {name} is {} bytes; shrinking to {size_bytes} is not supported",
                volume.config.size_bytes
            )));
        }
        if size_bytes == volume.config.size_bytes {
            return Ok(volume);
        }

        state
            .driver(&volume.backend_uuid)?
            .resize(&volume.config.internal_name, size_bytes)
            .await?;
        volume.config.size_bytes = size_bytes;
        self.persist(RecordKind::Volume, name, &volume).await?;
        state.volumes.insert(name.to_string(), volume.clone());
        info!(volume = %name, size_bytes, "Volume resized");
        Ok(volume)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        let mut volume = state.volume(name)?.clone();

        if state.snapshots.values().any(|s| s.config.volume_name == name) {
            return Err(OrchestratorError::FailedPrecondition(format!("volume {name} still has snapshots")));
        }

        volume.state = VolumeState::Deleting;
        self.persist(RecordKind::Volume, name, &volume).await?;
        state.volumes.insert(name.to_string(), volume.clone());

        if volume.config.import_not_managed {
            debug!(volume = %name, "Volume is not managed, leaving backend artifact in place");
        } else if let Ok(driver) = state.driver(&volume.backend_uuid) {
            driver.destroy(&volume.config.internal_name).await?;
        } else {
            warn!(volume = %name, backend = %volume.backend_uuid, "Backend missing, dropping volume record only");
        }

        for publication in state.publications_for_volume(name) {
            let key = publication.key();
            self.store.delete(RecordKind::Publication, &key).await?;
            self.store.delete(RecordKind::Chap, &key).await?;
            state.publications.remove(&key);
            state.chap.remove(&key);
        }
        self.store.delete(RecordKind::Volume, name).await?;
        state.volumes.remove(name);
        info!(volume = %name, "Volume deleted");

        // A backend marked for deletion goes away with its last volume.
        let orphaned = state
            .backend(&volume.backend_uuid)
            .ok()
            .filter(|b| b.state == BackendState::Deleting)
            .cloned();
        if let Some(backend) = orphaned.filter(|b| !state.backend_has_volumes(&b.uuid)) {
            self.store.delete(RecordKind::Backend, &backend.uuid).await?;
            state.backends.remove(&backend.uuid);
            state.drivers.remove(&backend.uuid);
            state.refresh_storage_class_pools();
            info!(backend = %backend.name, "Backend deleted with its last volume");
        }
        Ok(())
    }

    async fn upgrade_volume(&self, request: UpgradeVolumeRequest) -> Result<Volume> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        let mut volume = state.volume(&request.volume)?.clone();
        Self::check_publishable(&volume)?;

        if volume.state == VolumeState::Upgrading || volume.state == VolumeState::MissingBackend {
            volume.state = VolumeState::Online;
        }
        self.persist(RecordKind::Volume, &request.volume, &volume).await?;
        state.volumes.insert(request.volume.clone(), volume.clone());
        info!(volume = %request.volume, pvc = ?request.pvc, "Volume upgraded");
        Ok(volume)
    }

    async fn update_volume_luks_passphrase_names(&self, name: &str, names: Vec<String>) -> Result<()> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        let mut volume = state.volume(name)?.clone();
        volume.config.luks_passphrase_names = names;
        self.persist(RecordKind::Volume, name, &volume).await?;
        debug!(volume = %name, names = ?volume.config.luks_passphrase_names, "LUKS passphrase names updated");
        state.volumes.insert(name.to_string(), volume);
        Ok(())
    }

    async fn publish_volume(&self, volume_name: &str, request: PublishRequest) -> Result<VolumePublishInfo> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        let volume = state.volume(volume_name)?.clone();
        Self::check_publishable(&volume)?;

        let node = state
            .nodes
            .get(&request.node_name)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("node", &request.node_name))?;
        if self.enable_force_detach && node.publication_state != NodePublicationState::Ready {
            return Err(OrchestratorError::FailedPrecondition(format!(
                "node {} is not ready for publications",
                node.name
            )));
        }

        let key = publication_key(volume_name, &node.name);
        if state
            .publications
            .get(&key)
            .is_some_and(|existing| existing.read_only != request.read_only)
        {
            return Err(OrchestratorError::already_exists("volume publication", key));
        }

        if matches!(volume.config.access_mode, AccessMode::ReadWriteOnce | AccessMode::ReadWriteOncePod) {
            if let Some(other) = state
                .publications_for_volume(volume_name)
                .into_iter()
                .find(|p| p.node_name != node.name)
            {
                return Err(OrchestratorError::FailedPrecondition(format!(
                    "volume {volume_name} is already published to node {}",
                    other.node_name
                )));
            }
        }

        let backend = state.backend(&volume.backend_uuid)?.clone();
        if backend.state == BackendState::Deleting {
            return Err(OrchestratorError::FailedPrecondition(format!(
                "backend {} is being deleted",
                backend.name
            )));
        }
        let driver = state.driver(&backend.uuid)?;
        let mut info = driver.publish(&volume.config, &node.name, &node.iqn).await?;
        info.protocol = volume.config.protocol;
        info.luks_encryption = volume.config.luks_encryption;
        if info.fs_type.is_empty() {
            info.fs_type.clone_from(&volume.config.fs_type);
        }

        if volume.config.protocol == Protocol::Block && backend.requires_chap {
            let chap = match state.chap.get(&key) {
                Some(chap) => chap.clone(),
                None => {
                    let chap = generate_chap();
                    self.persist_chap(&key, &chap).await?;
                    state.chap.insert(key.clone(), chap.clone());
                    chap
                }
            };
            info.chap = Some(chap);
        }

        let publication = VolumePublication {
            volume_name: volume_name.to_string(),
            node_name: node.name.clone(),
            read_only: request.read_only,
            access_mode: request.access_mode,
            not_safe_to_attach: false,
        };
        self.persist(RecordKind::Publication, &key, &publication).await?;
        state.publications.insert(key, publication);
        info!(volume = %volume_name, node = %node.name, "Volume published");
        Ok(info)
    }

    async fn unpublish_volume(&self, volume_name: &str, node_name: &str) -> Result<()> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        let key = publication_key(volume_name, node_name);
        if !state.publications.contains_key(&key) {
            debug!(volume = %volume_name, node = %node_name, "Publication already gone");
            return Ok(());
        }

        if let Ok(volume) = state.volume(volume_name).cloned() {
            if let Ok(driver) = state.driver(&volume.backend_uuid) {
                driver.unpublish(&volume.config, node_name).await?;
            }
        }

        self.store.delete(RecordKind::Publication, &key).await?;
        self.store.delete(RecordKind::Chap, &key).await?;
        state.publications.remove(&key);
        state.chap.remove(&key);
        info!(volume = %volume_name, node = %node_name, "Volume unpublished");
        Ok(())
    }

    async fn get_volume_publication(&self, volume: &str, node: &str) -> Result<VolumePublication> {
        self.check_ready()?;
        let key = publication_key(volume, node);
        self.state
            .read()
            .await
            .publications
            .get(&key)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("volume publication", key))
    }

    async fn list_volume_publications(&self) -> Result<Vec<VolumePublication>> {
        self.check_ready()?;
        Ok(self.state.read().await.publications.values().cloned().collect())
    }

    async fn list_volume_publications_for_volume(&self, volume: &str) -> Result<Vec<VolumePublication>> {
        self.check_ready()?;
        Ok(self.state.read().await.publications_for_volume(volume))
    }

    async fn list_volume_publications_for_node(&self, node: &str) -> Result<Vec<VolumePublication>> {
        self.check_ready()?;
        Ok(self
            .state
            .read()
            .await
            .publications
            .values()
            .filter(|p| p.node_name == node)
            .cloned()
            .collect())
    }

    async fn update_volume_publication(&self, volume: &str, node: &str, not_safe_to_attach: Option<bool>) -> Result<VolumePublication> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        let key = publication_key(volume, node);
        let mut publication = state
            .publications
            .get(&key)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("volume publication", &key))?;

        let Some(value) = not_safe_to_attach else {
            return Ok(publication);
        };
        if publication.not_safe_to_attach == value {
            return Ok(publication);
        }

        publication.not_safe_to_attach = value;
        self.persist(RecordKind::Publication, &key, &publication).await?;
        state.publications.insert(key, publication.clone());
        debug!(volume = %volume, node = %node, not_safe_to_attach = value, "Publication updated");
        Ok(publication)
    }

    async fn add_node(&self, mut node: Node) -> Result<Node> {
        self.check_ready()?;
        if node.name.is_empty() {
            return Err(OrchestratorError::invalid("node name is required"));
        }
        let mut state = self.state.write().await;
        if state
            .nodes
            .get(&node.name)
            .is_some_and(|existing| existing.publication_state == NodePublicationState::Cleanable)
        {
            // Only an explicit state update clears a cleanable node.
            node.publication_state = NodePublicationState::Cleanable;
        }

        self.persist(RecordKind::Node, &node.name, &node).await?;
        state.nodes.insert(node.name.clone(), node.clone());
        info!(node = %node.name, iqn = %node.iqn, "Node registered");
        Ok(node)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.check_ready()?;
        self.state
            .read()
            .await
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("node", name))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.check_ready()?;
        Ok(self.state.read().await.nodes.values().cloned().collect())
    }

    async fn update_node_publication_state(&self, name: &str, publication_state: NodePublicationState) -> Result<Node> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        let mut node = state
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("node", name))?;
        node.publication_state = publication_state;
        self.persist(RecordKind::Node, name, &node).await?;
        state.nodes.insert(name.to_string(), node.clone());
        info!(node = %name, state = ?publication_state, "Node publication state updated");
        Ok(node)
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        if state.nodes.remove(name).is_none() {
            return Err(OrchestratorError::not_found("node", name));
        }
        self.store.delete(RecordKind::Node, name).await?;

        let remaining = state.publications.values().filter(|p| p.node_name == name).count();
        if remaining > 0 {
            warn!(node = %name, publications = remaining, "Deleted node still has volume publications");
        }
        info!(node = %name, "Node deleted");
        Ok(())
    }

    async fn create_snapshot(&self, mut config: SnapshotConfig) -> Result<Snapshot> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        let volume = state.volume(&config.volume_name)?.clone();
        Self::check_publishable(&volume)?;

        let id = config.id();
        if let Some(existing) = state.snapshots.get(&id) {
            return Ok(existing.clone());
        }

        if config.internal_name.is_empty() {
            config.internal_name = config.name.clone();
        }
        config.volume_internal_name.clone_from(&volume.config.internal_name);
        if config.version.is_empty() {
            config.version = ORCHESTRATOR_VERSION.to_string();
        }

        let snapshot = state.driver(&volume.backend_uuid)?.create_snapshot(&config).await?;
        self.persist(RecordKind::Snapshot, &id, &snapshot).await?;
        state.snapshots.insert(id, snapshot.clone());
        info!(volume = %config.volume_name, snapshot = %config.name, "Snapshot created");
        Ok(snapshot)
    }

    async fn get_snapshot(&self, volume: &str, snapshot: &str) -> Result<Snapshot> {
        self.check_ready()?;
        let id = snapshot_id(volume, snapshot);
        self.state
            .read()
            .await
            .snapshots
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("snapshot", id))
    }

    async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        self.check_ready()?;
        Ok(self.state.read().await.snapshots.values().cloned().collect())
    }

    async fn list_snapshots_for_volume(&self, volume: &str) -> Result<Vec<Snapshot>> {
        self.check_ready()?;
        Ok(self
            .state
            .read()
            .await
            .snapshots
            .values()
            .filter(|s| s.config.volume_name == volume)
            .cloned()
            .collect())
    }

    async fn delete_snapshot(&self, volume: &str, snapshot: &str) -> Result<()> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        let id = snapshot_id(volume, snapshot);
        let existing = state
            .snapshots
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("snapshot", &id))?;

        if let Ok(parent) = state.volume(volume).cloned() {
            if let Ok(driver) = state.driver(&parent.backend_uuid) {
                driver.delete_snapshot(&existing.config).await?;
            }
        }
        self.store.delete(RecordKind::Snapshot, &id).await?;
        state.snapshots.remove(&id);
        info!(volume = %volume, snapshot = %snapshot, "Snapshot deleted");
        Ok(())
    }

    async fn get_chap(&self, volume_name: &str, node_name: &str) -> Result<ChapCredentials> {
        self.check_ready()?;
        let mut state = self.state.write().await;
        let volume = state.volume(volume_name)?.clone();
        if !state.nodes.contains_key(node_name) {
            return Err(OrchestratorError::not_found("node", node_name));
        }
        let backend = state.backend(&volume.backend_uuid)?;
        if volume.config.protocol != Protocol::Block || !backend.requires_chap {
            return Err(OrchestratorError::not_found(
                "CHAP credentials",
                publication_key(volume_name, node_name),
            ));
        }

        let key = publication_key(volume_name, node_name);
        if let Some(chap) = state.chap.get(&key) {
            return Ok(chap.clone());
        }
        let chap = generate_chap();
        self.persist_chap(&key, &chap).await?;
        state.chap.insert(key, chap.clone());
        Ok(chap)
    }
}
