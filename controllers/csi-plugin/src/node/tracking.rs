//! Per-volume tracking records.
//!
//! One JSON file per staged volume under the tracking directory. Files are
//! written to a temporary name and renamed so a crash never leaves a
//! truncated record, and they are readable by root only since the publish
//! info may carry CHAP credentials.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use storage_core::{Protocol, VolumePublishInfo};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::host::IscsiTarget;
use crate::error::PluginError;

/// How a volume was staged on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TrackingRecord {
    pub volume_id: String,
    pub staging_path: PathBuf,
    pub publish_info: VolumePublishInfo,
    #[serde(default)]
    pub last_observed_protocol: Protocol,
    /// iSCSI target for block volumes
    #[serde(default)]
    pub iscsi: Option<IscsiTarget>,
    /// Raw LUN device
    #[serde(default)]
    pub device_path: Option<PathBuf>,
    /// Opened LUKS mapping on top of `device_path`
    #[serde(default)]
    pub luks_device: Option<PathBuf>,
    /// Raw block volume (no filesystem)
    #[serde(default)]
    pub raw_block: bool,
    #[serde(default)]
    pub luks_passphrase_names: Vec<String>,
}

/// Tracking records on disk
#[derive(Debug, Clone)]
pub struct TrackingStore {
    dir: PathBuf,
}

impl TrackingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, volume_id: &str) -> PathBuf {
        // Volume IDs never contain '/', snapshot IDs do; be safe either way.
        self.dir.join(format!("{}.json", volume_id.replace('/', "_")))
    }

    pub async fn save(&self, record: &TrackingRecord) -> Result<(), PluginError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(&record.volume_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record).map_err(|e| PluginError::Host(e.to_string()))?;

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(volume = %record.volume_id, path = %path.display(), "Tracking record saved");
        Ok(())
    }

    pub async fn load(&self, volume_id: &str) -> Result<Option<TrackingRecord>, PluginError> {
        match tokio::fs::read(self.path(volume_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PluginError::Host(format!("corrupt tracking record for {volume_id}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Removing a missing record succeeds
    pub async fn delete(&self, volume_id: &str) -> Result<(), PluginError> {
        match tokio::fs::remove_file(self.path(volume_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable record; corrupt files are skipped with a warning
    pub async fn list(&self) -> Result<Vec<TrackingRecord>, PluginError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<TrackingRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable tracking record"),
            }
        }
        records.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(volume_id: &str) -> TrackingRecord {
        TrackingRecord {
            volume_id: volume_id.to_string(),
            staging_path: PathBuf::from("/var/lib/kubelet/staging").join(volume_id),
            publish_info: VolumePublishInfo {
                protocol: Protocol::Block,
                iscsi_target_iqn: "iqn.1992-08.com.netapp:sn.1".into(),
                ..Default::default()
            },
            last_observed_protocol: Protocol::Block,
            luks_passphrase_names: vec!["K1".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TrackingStore::new(dir.path().join("tracking"));

        assert_eq!(store.load("vol-1").await.expect("load"), None);
        store.save(&record("vol-1")).await.expect("save");
        assert_eq!(store.load("vol-1").await.expect("load"), Some(record("vol-1")));

        store.delete("vol-1").await.expect("delete");
        store.delete("vol-1").await.expect("second delete");
        assert_eq!(store.load("vol-1").await.expect("load"), None);
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TrackingStore::new(dir.path());
        store.save(&record("vol-2")).await.expect("save");
        store.save(&record("vol-1")).await.expect("save");
        tokio::fs::write(dir.path().join("junk.json"), b"{not json").await.expect("write");

        let ids: Vec<String> = store.list().await.expect("list").into_iter().map(|r| r.volume_id).collect();
        assert_eq!(ids, vec!["vol-1", "vol-2"]);
    }

    #[tokio::test]
    async fn test_missing_directory_lists_nothing() {
        let store = TrackingStore::new("/nonexistent/tracking");
        assert!(store.list().await.expect("list").is_empty());
    }
}
