//! Host agent: the block, filesystem and iSCSI utilities on the node.
//!
//! Every command runs with a timeout. Callers must not hold a lock across
//! any of these calls.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use storage_core::{ChapCredentials, HostInfo};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::PluginError;

/// Default per-command deadline.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a LUN device to appear after login.
const DEVICE_WAIT: Duration = Duration::from_secs(20);

/// `cryptsetup` exit status for a passphrase that does not match any key slot.
const CRYPTSETUP_WRONG_PASSPHRASE: i32 = 2;

/// `umount` exit status when the target is not mounted.
const UMOUNT_NOT_MOUNTED: i32 = 32;

/// An iSCSI LUN to attach.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IscsiTarget {
    pub target_iqn: String,
    /// Primary portal first
    pub portals: Vec<String>,
    pub lun: i32,
    #[serde(default)]
    pub chap: Option<ChapCredentials>,
}

/// What the initiator database says about one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionHealth {
    /// Session is listed by the initiator
    pub listed: bool,
    /// Session state is logged in
    pub logged_in: bool,
}

impl SessionHealth {
    pub fn is_healthy(self) -> bool {
        self.listed && self.logged_in
    }
}

/// Filesystem usage of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VolumeStats {
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_bytes: i64,
    pub total_inodes: i64,
    pub used_inodes: i64,
    pub available_inodes: i64,
}

/// Host capabilities the node service needs.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait HostAgent: Send + Sync {
    async fn initiator_iqn(&self) -> Result<String, PluginError>;
    async fn host_info(&self) -> Result<HostInfo, PluginError>;
    async fn node_ips(&self) -> Result<Vec<String>, PluginError>;

    /// Log in to every portal and return the LUN's device path
    async fn iscsi_login(&self, target: &IscsiTarget) -> Result<PathBuf, PluginError>;
    async fn iscsi_logout(&self, target: &IscsiTarget) -> Result<(), PluginError>;
    async fn iscsi_session_health(&self, target_iqn: &str, portal: &str) -> Result<SessionHealth, PluginError>;
    async fn iscsi_rescan(&self, target: &IscsiTarget) -> Result<(), PluginError>;
    async fn multipath_restore(&self) -> Result<(), PluginError>;

    /// `Ok(false)` when the passphrase does not open the device
    async fn luks_check_passphrase(&self, device: &Path, passphrase: &str) -> Result<bool, PluginError>;
    async fn luks_rotate_passphrase(&self, device: &Path, previous: &str, current: &str) -> Result<(), PluginError>;
    async fn luks_open(&self, device: &Path, mapper_name: &str, passphrase: &str) -> Result<PathBuf, PluginError>;
    async fn luks_close(&self, mapper_name: &str) -> Result<(), PluginError>;

    async fn format_if_needed(&self, device: &Path, fs_type: &str) -> Result<(), PluginError>;
    async fn mount(&self, source: &str, target: &Path, fs_type: &str, options: &[String]) -> Result<(), PluginError>;
    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool, block: bool) -> Result<(), PluginError>;
    /// Unmounting a target that is not mounted succeeds
    async fn unmount(&self, target: &Path) -> Result<(), PluginError>;
    async fn volume_stats(&self, path: &Path) -> Result<VolumeStats, PluginError>;
    async fn resize_filesystem(&self, device: &Path, mount_path: &Path, fs_type: &str) -> Result<(), PluginError>;
}

/// Name of the device-mapper target for a LUKS volume
pub fn luks_mapper_name(volume_id: &str) -> String {
    format!("luks-{volume_id}")
}

/// [`HostAgent`] that shells out to the host utilities
#[derive(Debug, Clone)]
pub struct ExecHostAgent {
    timeout: Duration,
}

impl Default for ExecHostAgent {
    fn default() -> Self {
        Self { timeout: COMMAND_TIMEOUT }
    }
}

struct CommandOutput {
    status: Option<i32>,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status == Some(0)
    }
}

impl ExecHostAgent {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run a command; `stdin` is written and closed first. `sensitive` keeps
    /// the arguments out of the log.
    async fn exec(&self, program: &str, args: &[&str], stdin: Option<&str>, sensitive: bool) -> Result<CommandOutput, PluginError> {
        if sensitive {
            debug!(command = %program, "Running host command");
        } else {
            debug!(command = %program, args = ?args, "Running host command");
        }

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PluginError::Host(format!("could not run {program}: {e}")))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            drop(pipe);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| PluginError::Host(format!("{program} timed out after {}s", self.timeout.as_secs())))??;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, PluginError> {
        let output = self.exec(program, args, None, false).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(PluginError::Host(format!(
                "{program} {} failed ({:?}): {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                output.stderr.trim()
            )))
        }
    }

    async fn set_chap(&self, target: &IscsiTarget, portal: &str, chap: &ChapCredentials) -> Result<(), PluginError> {
        let settings = [
            ("node.session.auth.authmethod", "CHAP"),
            ("node.session.auth.username", chap.initiator_user.as_str()),
            ("node.session.auth.password", chap.initiator_secret.as_str()),
            ("node.session.auth.username_in", chap.target_user.as_str()),
            ("node.session.auth.password_in", chap.target_secret.as_str()),
        ];
        for (name, value) in settings {
            if value.is_empty() {
                continue;
            }
            let args: [&str; 12] = ["-m", "node", "-T", &target.target_iqn, "-p", portal, "-o", "update", "-n", name, "-v", value];
            let output = self.exec("iscsiadm", &args, None, true).await?;
            if !output.success() {
                return Err(PluginError::Host(format!("could not set {name} for {}", target.target_iqn)));
            }
        }
        Ok(())
    }

    fn device_path(target: &IscsiTarget, portal: &str) -> PathBuf {
        PathBuf::from(format!(
            "/dev/disk/by-path/ip-{portal}-iscsi-{}-lun-{}",
            target.target_iqn, target.lun
        ))
    }
}

#[async_trait::async_trait]
impl HostAgent for ExecHostAgent {
    async fn initiator_iqn(&self) -> Result<String, PluginError> {
        let contents = tokio::fs::read_to_string("/etc/iscsi/initiatorname.iscsi").await?;
        contents
            .lines()
            .filter_map(|line| line.trim().strip_prefix("InitiatorName="))
            .map(str::to_string)
            .next()
            .ok_or_else(|| PluginError::Host("no InitiatorName in /etc/iscsi/initiatorname.iscsi".into()))
    }

    async fn host_info(&self) -> Result<HostInfo, PluginError> {
        let release = tokio::fs::read_to_string("/etc/os-release").await.unwrap_or_default();
        let field = |key: &str| {
            release
                .lines()
                .filter_map(|line| line.strip_prefix(key))
                .map(|v| v.trim_matches('"').to_string())
                .next()
                .unwrap_or_default()
        };

        let mut services = Vec::new();
        for service in ["iscsid", "multipathd"] {
            let active = self.exec("systemctl", &["is-active", "--quiet", service], None, false).await;
            if active.is_ok_and(|o| o.success()) {
                services.push(service.to_string());
            }
        }

        Ok(HostInfo {
            os_distro: field("ID="),
            os_version: field("VERSION_ID="),
            services,
        })
    }

    async fn node_ips(&self) -> Result<Vec<String>, PluginError> {
        let output = self.run("hostname", &["-I"]).await?;
        Ok(output.split_whitespace().map(str::to_string).collect())
    }

    async fn iscsi_login(&self, target: &IscsiTarget) -> Result<PathBuf, PluginError> {
        let Some(primary) = target.portals.first() else {
            return Err(PluginError::invalid(format!("no portals for {}", target.target_iqn)));
        };

        for portal in &target.portals {
            self.run("iscsiadm", &["-m", "discovery", "-t", "sendtargets", "-p", portal]).await?;
            if let Some(chap) = &target.chap {
                self.set_chap(target, portal, chap).await?;
            }
            let login = self
                .exec("iscsiadm", &["-m", "node", "-T", &target.target_iqn, "-p", portal, "--login"], None, false)
                .await?;
            // 15: session already exists
            if !login.success() && login.status != Some(15) {
                warn!(portal = %portal, target = %target.target_iqn, error = %login.stderr.trim(), "iSCSI login failed");
            }
        }

        let device = Self::device_path(target, primary);
        let deadline = tokio::time::Instant::now() + DEVICE_WAIT;
        while !tokio::fs::try_exists(&device).await.unwrap_or(false) {
            if tokio::time::Instant::now() >= deadline {
                return Err(PluginError::Host(format!("device {} did not appear", device.display())));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(device)
    }

    async fn iscsi_logout(&self, target: &IscsiTarget) -> Result<(), PluginError> {
        for portal in &target.portals {
            let output = self
                .exec("iscsiadm", &["-m", "node", "-T", &target.target_iqn, "-p", portal, "--logout"], None, false)
                .await?;
            // 21: no matching session
            if !output.success() && output.status != Some(21) {
                return Err(PluginError::Host(format!("iSCSI logout from {portal} failed: {}", output.stderr.trim())));
            }
        }
        Ok(())
    }

    async fn iscsi_session_health(&self, target_iqn: &str, portal: &str) -> Result<SessionHealth, PluginError> {
        let output = self.exec("iscsiadm", &["-m", "session", "-P", "1"], None, false).await?;
        // 21: no active sessions at all
        if !output.success() {
            return Ok(SessionHealth::default());
        }

        let mut health = SessionHealth::default();
        let mut in_target = false;
        let mut in_portal = false;
        for line in output.stdout.lines().map(str::trim) {
            if let Some(name) = line.strip_prefix("Target: ") {
                in_target = name.split_whitespace().next() == Some(target_iqn);
                in_portal = false;
            } else if let Some(address) = line.strip_prefix("Current Portal: ") {
                in_portal = in_target && address.starts_with(portal);
                health.listed |= in_portal;
            } else if in_portal && line.starts_with("iSCSI Session State:") {
                health.logged_in = line.ends_with("LOGGED_IN");
            }
        }
        Ok(health)
    }

    async fn iscsi_rescan(&self, target: &IscsiTarget) -> Result<(), PluginError> {
        for portal in &target.portals {
            self.run("iscsiadm", &["-m", "node", "-T", &target.target_iqn, "-p", portal, "--rescan"])
                .await?;
        }
        Ok(())
    }

    async fn multipath_restore(&self) -> Result<(), PluginError> {
        self.run("multipath", &["-r"]).await.map(|_| ())
    }

    async fn luks_check_passphrase(&self, device: &Path, passphrase: &str) -> Result<bool, PluginError> {
        let device = device.to_string_lossy();
        let output = self
            .exec("cryptsetup", &["luksOpen", "--test-passphrase", "--key-file", "-", &device], Some(passphrase), true)
            .await?;
        match output.status {
            Some(0) => Ok(true),
            Some(CRYPTSETUP_WRONG_PASSPHRASE) => Ok(false),
            _ => Err(PluginError::Host(format!("cryptsetup could not check {device}: {}", output.stderr.trim()))),
        }
    }

    async fn luks_rotate_passphrase(&self, device: &Path, previous: &str, current: &str) -> Result<(), PluginError> {
        let device = device.to_string_lossy();
        let mut new_key = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut new_key, current.as_bytes())?;
        let new_key_path = new_key.path().to_string_lossy().into_owned();

        let output = self
            .exec("cryptsetup", &["luksChangeKey", "--key-file", "-", &device, &new_key_path], Some(previous), true)
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(PluginError::Host(format!("cryptsetup could not rotate the passphrase on {device}: {}", output.stderr.trim())))
        }
    }

    async fn luks_open(&self, device: &Path, mapper_name: &str, passphrase: &str) -> Result<PathBuf, PluginError> {
        let mapped = PathBuf::from("/dev/mapper").join(mapper_name);
        if tokio::fs::try_exists(&mapped).await.unwrap_or(false) {
            return Ok(mapped);
        }

        let source = device.to_string_lossy();
        let formatted = self.exec("cryptsetup", &["isLuks", &source], None, false).await?;
        if !formatted.success() {
            let output = self
                .exec("cryptsetup", &["luksFormat", "--batch-mode", "--type", "luks2", "--key-file", "-", &source], Some(passphrase), true)
                .await?;
            if !output.success() {
                return Err(PluginError::Host(format!("cryptsetup could not format {source}: {}", output.stderr.trim())));
            }
        }

        let output = self
            .exec("cryptsetup", &["luksOpen", "--key-file", "-", &source, mapper_name], Some(passphrase), true)
            .await?;
        match output.status {
            Some(0) => Ok(mapped),
            Some(CRYPTSETUP_WRONG_PASSPHRASE) => Err(PluginError::NoWorkingPassphrase),
            _ => Err(PluginError::Host(format!("cryptsetup could not open {source}: {}", output.stderr.trim()))),
        }
    }

    async fn luks_close(&self, mapper_name: &str) -> Result<(), PluginError> {
        let mapped = PathBuf::from("/dev/mapper").join(mapper_name);
        if !tokio::fs::try_exists(&mapped).await.unwrap_or(false) {
            return Ok(());
        }
        self.run("cryptsetup", &["luksClose", mapper_name]).await.map(|_| ())
    }

    async fn format_if_needed(&self, device: &Path, fs_type: &str) -> Result<(), PluginError> {
        let source = device.to_string_lossy();
        let existing = self.exec("blkid", &["-o", "value", "-s", "TYPE", &source], None, false).await?;
        if !existing.stdout.trim().is_empty() {
            return Ok(());
        }
        let mkfs = format!("mkfs.{fs_type}");
        let force = if fs_type == "xfs" { "-f" } else { "-F" };
        self.run(&mkfs, &[force, &source]).await.map(|_| ())
    }

    async fn mount(&self, source: &str, target: &Path, fs_type: &str, options: &[String]) -> Result<(), PluginError> {
        tokio::fs::create_dir_all(target).await?;
        let target = target.to_string_lossy();
        let options = options.join(",");
        let mut args = vec!["-t", fs_type];
        if !options.is_empty() {
            args.extend(["-o", options.as_str()]);
        }
        args.extend([source, target.as_ref()]);
        self.run("mount", &args).await.map(|_| ())
    }

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool, block: bool) -> Result<(), PluginError> {
        if block {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::OpenOptions::new().create(true).append(true).open(target).await?;
        } else {
            tokio::fs::create_dir_all(target).await?;
        }

        let source = source.to_string_lossy();
        let target = target.to_string_lossy();
        self.run("mount", &["--bind", &source, &target]).await?;
        if read_only {
            self.run("mount", &["-o", "remount,bind,ro", &target]).await?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), PluginError> {
        let path = target.to_string_lossy();
        let output = self.exec("umount", &[&path], None, false).await?;
        if output.success() || output.status == Some(UMOUNT_NOT_MOUNTED) || output.stderr.contains("not mounted") {
            return Ok(());
        }
        if !tokio::fs::try_exists(target).await.unwrap_or(false) {
            return Ok(());
        }
        Err(PluginError::Host(format!("umount {path} failed: {}", output.stderr.trim())))
    }

    async fn volume_stats(&self, path: &Path) -> Result<VolumeStats, PluginError> {
        let path = path.to_string_lossy();
        let output = self
            .run("df", &["-B1", "--output=size,used,avail,itotal,iused,iavail", &path])
            .await?;
        let values: Vec<i64> = output
            .lines()
            .nth(1)
            .unwrap_or_default()
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        match values.as_slice() {
            [total, used, available, inodes, inodes_used, inodes_free] => Ok(VolumeStats {
                total_bytes: *total,
                used_bytes: *used,
                available_bytes: *available,
                total_inodes: *inodes,
                used_inodes: *inodes_used,
                available_inodes: *inodes_free,
            }),
            _ => Err(PluginError::Host(format!("unexpected df output for {path}"))),
        }
    }

    async fn resize_filesystem(&self, device: &Path, mount_path: &Path, fs_type: &str) -> Result<(), PluginError> {
        match fs_type {
            "xfs" => self.run("xfs_growfs", &[&mount_path.to_string_lossy()]).await.map(|_| ()),
            "ext3" | "ext4" | "" => self.run("resize2fs", &[&device.to_string_lossy()]).await.map(|_| ()),
            other => Err(PluginError::invalid(format!("cannot expand a {other} filesystem"))),
        }
    }
}
