//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use storage_core::HostInfo;

use crate::error::PluginError;
use crate::node::host::{HostAgent, IscsiTarget, SessionHealth, VolumeStats};

#[derive(Debug, Default)]
struct FakeHostState {
    passphrases: HashMap<PathBuf, String>,
    session_health: SessionHealth,
    rotations: usize,
    logins: usize,
    logouts: usize,
    mounts: Vec<(String, PathBuf)>,
    unmounts: Vec<PathBuf>,
    resizes: usize,
}

/// In-memory [`HostAgent`] that records what the node service asked for
#[derive(Debug, Default)]
pub struct FakeHostAgent {
    state: Mutex<FakeHostState>,
}

impl FakeHostAgent {
    pub const IQN: &'static str = "iqn.2000-01.x:y";

    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeHostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The passphrase the LUKS header at `device` accepts
    pub fn install_passphrase(&self, device: impl AsRef<Path>, passphrase: &str) {
        self.state()
            .passphrases
            .insert(device.as_ref().to_path_buf(), passphrase.to_string());
    }

    pub fn set_session_health(&self, health: SessionHealth) {
        self.state().session_health = health;
    }

    pub fn rotations(&self) -> usize {
        self.state().rotations
    }

    pub fn logins(&self) -> usize {
        self.state().logins
    }

    pub fn logouts(&self) -> usize {
        self.state().logouts
    }

    pub fn resizes(&self) -> usize {
        self.state().resizes
    }

    /// `(source, target)` of every mount, bind mounts included
    pub fn mounts(&self) -> Vec<(String, PathBuf)> {
        self.state().mounts.clone()
    }

    pub fn unmounts(&self) -> Vec<PathBuf> {
        self.state().unmounts.clone()
    }

    pub fn device_for(target: &IscsiTarget) -> PathBuf {
        PathBuf::from(format!("/dev/fake/{}-lun-{}", target.target_iqn, target.lun))
    }
}

#[async_trait::async_trait]
impl HostAgent for FakeHostAgent {
    async fn initiator_iqn(&self) -> Result<String, PluginError> {
        Ok(Self::IQN.to_string())
    }

    async fn host_info(&self) -> Result<HostInfo, PluginError> {
        Ok(HostInfo {
            os_distro: "fake".into(),
            os_version: "1".into(),
            services: vec!["iscsid".into()],
        })
    }

    async fn node_ips(&self) -> Result<Vec<String>, PluginError> {
        Ok(vec!["10.0.0.10".into()])
    }

    async fn iscsi_login(&self, target: &IscsiTarget) -> Result<PathBuf, PluginError> {
        if target.portals.is_empty() {
            return Err(PluginError::invalid(format!("no portals for {}", target.target_iqn)));
        }
        self.state().logins += 1;
        Ok(Self::device_for(target))
    }

    async fn iscsi_logout(&self, _target: &IscsiTarget) -> Result<(), PluginError> {
        self.state().logouts += 1;
        Ok(())
    }

    async fn iscsi_session_health(&self, _target_iqn: &str, _portal: &str) -> Result<SessionHealth, PluginError> {
        Ok(self.state().session_health)
    }

    async fn iscsi_rescan(&self, _target: &IscsiTarget) -> Result<(), PluginError> {
        Ok(())
    }

    async fn multipath_restore(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn luks_check_passphrase(&self, device: &Path, passphrase: &str) -> Result<bool, PluginError> {
        Ok(self.state().passphrases.get(device).is_some_and(|p| p == passphrase))
    }

    async fn luks_rotate_passphrase(&self, device: &Path, previous: &str, current: &str) -> Result<(), PluginError> {
        let mut state = self.state();
        match state.passphrases.get(device) {
            Some(installed) if installed == previous => {
                state.passphrases.insert(device.to_path_buf(), current.to_string());
                state.rotations += 1;
                Ok(())
            }
            _ => Err(PluginError::Host(format!("previous passphrase does not open {}", device.display()))),
        }
    }

    async fn luks_open(&self, device: &Path, mapper_name: &str, passphrase: &str) -> Result<PathBuf, PluginError> {
        let mut state = self.state();
        let installed = state
            .passphrases
            .entry(device.to_path_buf())
            .or_insert_with(|| passphrase.to_string());
        if *installed == passphrase {
            Ok(PathBuf::from("/dev/mapper").join(mapper_name))
        } else {
            Err(PluginError::NoWorkingPassphrase)
        }
    }

    async fn luks_close(&self, _mapper_name: &str) -> Result<(), PluginError> {
        Ok(())
    }

    async fn format_if_needed(&self, _device: &Path, _fs_type: &str) -> Result<(), PluginError> {
        Ok(())
    }

    async fn mount(&self, source: &str, target: &Path, _fs_type: &str, _options: &[String]) -> Result<(), PluginError> {
        self.state().mounts.push((source.to_string(), target.to_path_buf()));
        Ok(())
    }

    async fn bind_mount(&self, source: &Path, target: &Path, _read_only: bool, _block: bool) -> Result<(), PluginError> {
        self.state()
            .mounts
            .push((source.to_string_lossy().into_owned(), target.to_path_buf()));
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), PluginError> {
        self.state().unmounts.push(target.to_path_buf());
        Ok(())
    }

    async fn volume_stats(&self, _path: &Path) -> Result<VolumeStats, PluginError> {
        Ok(VolumeStats {
            total_bytes: 1 << 30,
            used_bytes: 1 << 20,
            available_bytes: (1 << 30) - (1 << 20),
            total_inodes: 65536,
            used_inodes: 12,
            available_inodes: 65524,
        })
    }

    async fn resize_filesystem(&self, _device: &Path, _mount_path: &Path, _fs_type: &str) -> Result<(), PluginError> {
        self.state().resizes += 1;
        Ok(())
    }
}
