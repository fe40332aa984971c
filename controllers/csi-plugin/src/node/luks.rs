//! LUKS passphrase management for block volumes.
//!
//! Secrets carry at most two named passphrases, the current one and the
//! previous one. The controller's list of passphrase names for a volume must
//! always include every passphrase that might be installed on the device, so
//! both names are reported before a rotation starts and the list is narrowed
//! to the current name only after the device accepts it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use controller_client::ControllerClientTrait;
use tracing::{debug, info, warn};

use super::host::HostAgent;
use crate::error::PluginError;

pub const LUKS_PASSPHRASE_NAME: &str = "luks-passphrase-name";
pub const LUKS_PASSPHRASE: &str = "luks-passphrase";
pub const PREVIOUS_LUKS_PASSPHRASE_NAME: &str = "previous-luks-passphrase-name";
pub const PREVIOUS_LUKS_PASSPHRASE: &str = "previous-luks-passphrase";

/// Named passphrase taken from the CSI secrets
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase {
    pub name: String,
    pub value: String,
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Passphrase").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Current and previous passphrase from the CSI secrets map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuksSecrets {
    pub current: Passphrase,
    pub previous: Option<Passphrase>,
}

impl LuksSecrets {
    /// Both current fields are required; the previous pair is used only when complete
    pub fn from_secrets(secrets: &HashMap<String, String>) -> Result<Self, PluginError> {
        let get = |key: &str| secrets.get(key).cloned().unwrap_or_default();

        let current = Passphrase {
            name: get(LUKS_PASSPHRASE_NAME),
            value: get(LUKS_PASSPHRASE),
        };
        if current.value.is_empty() {
            return Err(PluginError::invalid("LUKS passphrase cannot be empty"));
        }
        if current.name.is_empty() {
            return Err(PluginError::invalid("LUKS passphrase name cannot be empty"));
        }

        let previous = Passphrase {
            name: get(PREVIOUS_LUKS_PASSPHRASE_NAME),
            value: get(PREVIOUS_LUKS_PASSPHRASE),
        };
        let previous = (!previous.name.is_empty() && !previous.value.is_empty()).then_some(previous);

        Ok(Self { current, previous })
    }
}

/// Keeps a node's LUKS devices on the current passphrase
#[derive(Clone)]
pub struct LuksPassphraseManager {
    host: Arc<dyn HostAgent>,
    controller: Arc<dyn ControllerClientTrait>,
}

impl LuksPassphraseManager {
    pub fn new(host: Arc<dyn HostAgent>, controller: Arc<dyn ControllerClientTrait>) -> Self {
        Self { host, controller }
    }

    async fn report(&self, volume_id: &str, names: &[String]) -> Result<(), PluginError> {
        self.controller
            .update_volume_luks_passphrase_names(volume_id, names)
            .await
            .map_err(PluginError::from)
    }

    /// Make sure the device at `device` opens with the current passphrase.
    ///
    /// Returns the passphrase names the controller now holds for the volume.
    pub async fn ensure_volume_passphrase(
        &self,
        volume_id: &str,
        device: &Path,
        secrets: &LuksSecrets,
        force_update: bool,
    ) -> Result<Vec<String>, PluginError> {
        let current = &secrets.current;

        if self.host.luks_check_passphrase(device, &current.value).await? {
            debug!(volume = %volume_id, passphrase = %current.name, "Current LUKS passphrase is installed");
            let names = vec![current.name.clone()];
            if force_update {
                self.report(volume_id, &names).await?;
            }
            return Ok(names);
        }

        let Some(previous) = &secrets.previous else {
            warn!(volume = %volume_id, "Current LUKS passphrase rejected and no previous passphrase given");
            return Err(PluginError::NoWorkingPassphrase);
        };
        if !self.host.luks_check_passphrase(device, &previous.value).await? {
            warn!(volume = %volume_id, "Neither LUKS passphrase opens the device");
            return Err(PluginError::NoWorkingPassphrase);
        }

        // Both names before rotating: after a crash either may be the installed one.
        let candidates = vec![current.name.clone(), previous.name.clone()];
        self.report(volume_id, &candidates).await?;

        info!(volume = %volume_id, from = %previous.name, to = %current.name, "Rotating LUKS passphrase");
        self.host
            .luks_rotate_passphrase(device, &previous.value, &current.value)
            .await?;

        if !self.host.luks_check_passphrase(device, &current.value).await? {
            warn!(volume = %volume_id, "LUKS rotation finished but the current passphrase is still rejected");
            return Ok(candidates);
        }

        let names = vec![current.name.clone()];
        self.report(volume_id, &names).await?;
        info!(volume = %volume_id, passphrase = %current.name, "LUKS passphrase rotated");
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeHostAgent;
    use controller_client::MockControllerClient;

    fn secrets(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    fn rotation_secrets() -> LuksSecrets {
        LuksSecrets::from_secrets(&secrets(&[
            (LUKS_PASSPHRASE_NAME, "K2"),
            (LUKS_PASSPHRASE, "new-pass"),
            (PREVIOUS_LUKS_PASSPHRASE_NAME, "K1"),
            (PREVIOUS_LUKS_PASSPHRASE, "old-pass"),
        ]))
        .expect("valid secrets")
    }

    fn setup(installed: &str) -> (LuksPassphraseManager, Arc<FakeHostAgent>, MockControllerClient) {
        let host = Arc::new(FakeHostAgent::new());
        host.install_passphrase("/dev/sdb", installed);
        let controller = MockControllerClient::new();
        let manager = LuksPassphraseManager::new(host.clone(), Arc::new(controller.clone()));
        (manager, host, controller)
    }

    #[tokio::test]
    async fn test_rotation_reports_both_names_first() {
        let (manager, host, controller) = setup("old-pass");
        let device = Path::new("/dev/sdb");

        let names = manager
            .ensure_volume_passphrase("vol-1", device, &rotation_secrets(), false)
            .await
            .expect("rotation succeeds");

        assert_eq!(names, vec!["K2"]);
        assert_eq!(
            controller.luks_updates(),
            vec![
                ("vol-1".to_string(), vec!["K2".to_string(), "K1".to_string()]),
                ("vol-1".to_string(), vec!["K2".to_string()]),
            ]
        );
        assert_eq!(host.rotations(), 1);
        assert!(host.luks_check_passphrase(device, "new-pass").await.expect("check"));
    }

    #[tokio::test]
    async fn test_second_call_is_a_no_op() {
        let (manager, host, controller) = setup("old-pass");
        let device = Path::new("/dev/sdb");
        manager
            .ensure_volume_passphrase("vol-1", device, &rotation_secrets(), false)
            .await
            .expect("first call");
        let updates = controller.luks_updates().len();

        manager
            .ensure_volume_passphrase("vol-1", device, &rotation_secrets(), false)
            .await
            .expect("second call");
        assert_eq!(host.rotations(), 1);
        assert_eq!(controller.luks_updates().len(), updates);
    }

    #[tokio::test]
    async fn test_force_update_reports_current_name() {
        let (manager, _, controller) = setup("new-pass");
        manager
            .ensure_volume_passphrase("vol-1", Path::new("/dev/sdb"), &rotation_secrets(), true)
            .await
            .expect("ok");
        assert_eq!(controller.luks_updates(), vec![("vol-1".to_string(), vec!["K2".to_string()])]);
    }

    #[tokio::test]
    async fn test_no_working_passphrase() {
        let (manager, host, controller) = setup("something-else");
        let err = manager
            .ensure_volume_passphrase("vol-1", Path::new("/dev/sdb"), &rotation_secrets(), false)
            .await
            .expect_err("neither passphrase works");
        assert_eq!(err.to_string(), "no working passphrase provided");
        assert!(controller.luks_updates().is_empty());
        assert_eq!(host.rotations(), 0);

        let only_current = LuksSecrets::from_secrets(&secrets(&[(LUKS_PASSPHRASE_NAME, "K2"), (LUKS_PASSPHRASE, "new-pass")]))
            .expect("valid");
        let err = manager
            .ensure_volume_passphrase("vol-1", Path::new("/dev/sdb"), &only_current, false)
            .await
            .expect_err("no previous pair");
        assert!(matches!(err, PluginError::NoWorkingPassphrase));
    }

    #[test]
    fn test_empty_current_pair_is_rejected() {
        let err = LuksSecrets::from_secrets(&secrets(&[(LUKS_PASSPHRASE_NAME, "K2")])).expect_err("no passphrase");
        assert!(err.to_string().contains("passphrase cannot be empty"));
        let err = LuksSecrets::from_secrets(&secrets(&[(LUKS_PASSPHRASE, "p")])).expect_err("no name");
        assert!(err.to_string().contains("name cannot be empty"));
    }

    #[test]
    fn test_debug_hides_passphrases() {
        let printed = format!("{:?}", rotation_secrets());
        assert!(printed.contains("K2"));
        assert!(!printed.contains("new-pass"));
        assert!(!printed.contains("old-pass"));
    }
}
