//! Fake backend driver
//!
//! Stores volumes in memory and never touches real storage. Backends with
//! `driverKind: "fake"` use it, which is how conformance runs and tests get a
//! working catalog without an array.
//!
//! Configuration:
//!
//! ```json
//! {
//!   "protocol": "block",
//!   "requiresChap": true,
//!   "pools": {
//!     "pool1": { "media": { "type": "strings", "offer": ["ssd"] } }
//!   }
//! }
//! ```

use crate::attributes::AttributeValue;
use crate::error::{OrchestratorError, Result};
use crate::interfaces::{BackendDescription, BackendDriver, DriverFactory};
use crate::model::*;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Driver family name served by [`FakeDriver`].
pub const FAKE_DRIVER_KIND: &str = "fake";

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FakeConfig {
    #[serde(default)]
    protocol: Option<Protocol>,
    #[serde(default)]
    requires_chap: bool,
    #[serde(default)]
    pools: BTreeMap<String, BTreeMap<String, AttributeValue>>,
}

#[derive(Debug, Clone)]
struct FakeVolume {
    size_bytes: u64,
    pool: String,
}

/// In-memory [`BackendDriver`].
#[derive(Debug, Default)]
pub struct FakeDriver {
    volumes: Mutex<BTreeMap<String, FakeVolume>>,
    snapshots: Mutex<BTreeMap<String, Snapshot>>,
    protocol: Mutex<Protocol>,
    creates: AtomicUsize,
    publishes: AtomicUsize,
}

impl FakeDriver {
    /// Empty driver
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `create` and `create_clone` calls that reached the driver
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of `publish` calls that reached the driver
    pub fn publish_count(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    /// Seeds an artifact that was not created through the catalog, for import
    pub async fn add_unmanaged_volume(&self, internal_name: &str, size_bytes: u64, pool: &str) {
        self.volumes.lock().await.insert(
            internal_name.to_string(),
            FakeVolume {
                size_bytes,
                pool: pool.to_string(),
            },
        );
    }

    /// True when the artifact exists
    pub async fn has_volume(&self, internal_name: &str) -> bool {
        self.volumes.lock().await.contains_key(internal_name)
    }
}

#[async_trait::async_trait]
impl BackendDriver for FakeDriver {
    fn kind(&self) -> &str {
        FAKE_DRIVER_KIND
    }

    async fn initialize(&self, backend_name: &str, config: &serde_json::Value) -> Result<BackendDescription> {
        let parsed: FakeConfig = if config.is_null() {
            FakeConfig::default()
        } else {
            serde_json::from_value(config.clone())
                .map_err(|e| OrchestratorError::invalid(format!("invalid fake driver config: {e}")))?
        };

        let protocol = match parsed.protocol.unwrap_or(Protocol::File) {
            Protocol::Any => Protocol::File,
            p => p,
        };
        *self.protocol.lock().await = protocol;

        let mut pools: Vec<StoragePool> = parsed
            .pools
            .into_iter()
            .map(|(name, attributes)| StoragePool {
                backend: backend_name.to_string(),
                name,
                attributes,
            })
            .collect();
        if pools.is_empty() {
            pools.push(StoragePool {
                backend: backend_name.to_string(),
                name: "pool1".to_string(),
                attributes: BTreeMap::new(),
            });
        }

        Ok(BackendDescription {
            protocol,
            requires_chap: parsed.requires_chap,
            pools,
        })
    }

    async fn create(&self, config: &VolumeConfig, pool: &str) -> Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut volumes = self.volumes.lock().await;
        if volumes.contains_key(&config.internal_name) {
            return Err(OrchestratorError::already_exists("backend volume", &config.internal_name));
        }
        volumes.insert(
            config.internal_name.clone(),
            FakeVolume {
                size_bytes: config.size_bytes,
                pool: pool.to_string(),
            },
        );
        Ok(())
    }

    async fn create_clone(&self, source_internal_name: &str, source_snapshot: Option<&str>, config: &VolumeConfig) -> Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if let Some(snapshot) = source_snapshot {
            let key = snapshot_id(source_internal_name, snapshot);
            if !self.snapshots.lock().await.contains_key(&key) {
                return Err(OrchestratorError::not_found("snapshot", key));
            }
        }

        let mut volumes = self.volumes.lock().await;
        let source = volumes
            .get(source_internal_name)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("backend volume", source_internal_name))?;
        volumes.insert(
            config.internal_name.clone(),
            FakeVolume {
                size_bytes: config.size_bytes.max(source.size_bytes),
                pool: source.pool,
            },
        );
        Ok(())
    }

    async fn get_volume_external(&self, internal_name: &str) -> Result<VolumeExternal> {
        self.volumes
            .lock()
            .await
            .get(internal_name)
            .map(|v| VolumeExternal {
                internal_name: internal_name.to_string(),
                size_bytes: v.size_bytes,
                pool: v.pool.clone(),
            })
            .ok_or_else(|| OrchestratorError::not_found("backend volume", internal_name))
    }

    async fn destroy(&self, internal_name: &str) -> Result<()> {
        self.volumes.lock().await.remove(internal_name);
        Ok(())
    }

    async fn resize(&self, internal_name: &str, size_bytes: u64) -> Result<()> {
        let mut volumes = self.volumes.lock().await;
        let volume = volumes
            .get_mut(internal_name)
            .ok_or_else(|| OrchestratorError::not_found("backend volume", internal_name))?;
        volume.size_bytes = size_bytes;
        Ok(())
    }

    async fn publish(&self, config: &VolumeConfig, _node_name: &str, _node_iqn: &str) -> Result<VolumePublishInfo> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        if !self.volumes.lock().await.contains_key(&config.internal_name) {
            return Err(OrchestratorError::not_found("backend volume", &config.internal_name));
        }

        let protocol = *self.protocol.lock().await;
        let mut info = VolumePublishInfo {
            protocol,
            fs_type: config.fs_type.clone(),
            ..Default::default()
        };
        match protocol {
            Protocol::Block => {
                info.iscsi_target_iqn = format!("iqn.1992-08.com.fake:{}", config.internal_name);
                info.iscsi_target_portal = "127.0.0.1:3260".to_string();
                info.iscsi_lun = 0;
            }
            _ => {
                info.nfs_server = "127.0.0.1".to_string();
                info.nfs_path = format!("/{}", config.internal_name);
            }
        }
        Ok(info)
    }

    async fn unpublish(&self, _config: &VolumeConfig, _node_name: &str) -> Result<()> {
        Ok(())
    }

    async fn create_snapshot(&self, config: &SnapshotConfig) -> Result<Snapshot> {
        let size_bytes = self
            .volumes
            .lock()
            .await
            .get(&config.volume_internal_name)
            .map(|v| v.size_bytes)
            .ok_or_else(|| OrchestratorError::not_found("backend volume", &config.volume_internal_name))?;

        let snapshot = Snapshot {
            config: config.clone(),
            created: chrono::Utc::now().to_rfc3339(),
            size_bytes,
            state: SnapshotState::Online,
        };
        self.snapshots
            .lock()
            .await
            .insert(snapshot_id(&config.volume_internal_name, &config.internal_name), snapshot.clone());
        Ok(snapshot)
    }

    async fn delete_snapshot(&self, config: &SnapshotConfig) -> Result<()> {
        self.snapshots
            .lock()
            .await
            .remove(&snapshot_id(&config.volume_internal_name, &config.internal_name));
        Ok(())
    }
}

/// Factory for the drivers compiled into this workspace.
///
/// Every `fake` backend shares the same [`FakeDriver`] so tests can inspect it.
#[derive(Debug, Clone, Default)]
pub struct BuiltinDriverFactory {
    fake: Arc<FakeDriver>,
}

impl BuiltinDriverFactory {
    /// Factory handing out `fake`
    pub fn new(fake: Arc<FakeDriver>) -> Self {
        Self { fake }
    }
}

impl DriverFactory for BuiltinDriverFactory {
    fn create(&self, driver_kind: &str) -> Result<Arc<dyn BackendDriver>> {
        match driver_kind {
            FAKE_DRIVER_KIND => Ok(Arc::clone(&self.fake) as Arc<dyn BackendDriver>),
            other => Err(OrchestratorError::invalid(format!("unknown storage driver: {other}"))),
        }
    }
}
