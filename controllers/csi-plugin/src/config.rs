//! Plugin configuration from the process environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::PluginError;

/// Which CSI services this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Cluster-wide controller owning the catalog
    Controller,
    /// Per-node agent
    Node,
    /// Both, for conformance testing
    AllInOne,
}

impl Role {
    /// True for roles that serve the CSI Node service
    pub fn runs_node(self) -> bool {
        matches!(self, Role::Node | Role::AllInOne)
    }

    /// True for roles that own the catalog
    pub fn runs_controller(self) -> bool {
        matches!(self, Role::Controller | Role::AllInOne)
    }
}

impl std::str::FromStr for Role {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "controller" => Ok(Role::Controller),
            "node" => Ok(Role::Node),
            "allinone" | "all-in-one" => Ok(Role::AllInOne),
            other => Err(PluginError::InvalidConfig(format!("unknown CSI_ROLE '{other}'"))),
        }
    }
}

/// Default controller REST port.
pub const DEFAULT_REST_PORT: u16 = 34571;

/// Everything the binary reads at startup.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub role: Role,
    pub endpoint: String,
    pub node_name: String,
    pub controller_host: String,
    pub controller_port: u16,
    pub rest_listen: SocketAddr,
    pub probe_listen: SocketAddr,
    pub aes_key_file: Option<PathBuf>,
    pub ca_cert_file: Option<PathBuf>,
    pub client_cert_file: Option<PathBuf>,
    pub client_key_file: Option<PathBuf>,
    pub server_cert_file: Option<PathBuf>,
    pub server_key_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
    pub self_healing_interval: Duration,
    pub stale_session_wait: Duration,
    pub enable_force_detach: bool,
    pub tracking_dir: PathBuf,
    pub kube_plugin: bool,
    pub watch_namespace: Option<String>,
    pub publication_rate: u32,
    pub publication_burst: u32,
}

impl PluginConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self, PluginError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PluginError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let path = |key: &str| get(key).map(PathBuf::from);

        let role = get("CSI_ROLE").map_or(Ok(Role::Controller), |v| v.parse())?;
        let node_name = match get("CSI_NODE_NAME") {
            Some(name) => name,
            None => hostname(),
        };
        if role.runs_node() && node_name.is_empty() {
            return Err(PluginError::InvalidConfig("CSI_NODE_NAME is required for the node role".to_string()));
        }

        Ok(Self {
            role,
            endpoint: get("CSI_ENDPOINT").unwrap_or_else(|| "unix:///plugin/csi.sock".to_string()),
            node_name,
            controller_host: get("TRIDENT_CSI_SERVICE_HOST").unwrap_or_else(|| "trident-csi".to_string()),
            controller_port: parse(&get, "TRIDENT_CSI_SERVICE_PORT", DEFAULT_REST_PORT)?,
            rest_listen: parse(&get, "REST_LISTEN_ADDRESS", SocketAddr::from(([0, 0, 0, 0], DEFAULT_REST_PORT)))?,
            probe_listen: parse(&get, "HTTP_PROBE_ADDRESS", SocketAddr::from(([0, 0, 0, 0], 17546)))?,
            aes_key_file: path("AES_KEY_FILE"),
            ca_cert_file: path("CA_CERT_FILE"),
            client_cert_file: path("CLIENT_CERT_FILE"),
            client_key_file: path("CLIENT_KEY_FILE"),
            server_cert_file: path("SERVER_CERT_FILE"),
            server_key_file: path("SERVER_KEY_FILE"),
            insecure_skip_verify: parse(&get, "TLS_INSECURE_SKIP_VERIFY", false)?,
            self_healing_interval: Duration::from_secs(parse(&get, "ISCSI_SELF_HEALING_INTERVAL_SECS", 300)?),
            stale_session_wait: Duration::from_secs(parse(&get, "ISCSI_STALE_SESSION_WAIT_SECS", 420)?),
            enable_force_detach: parse(&get, "ENABLE_FORCE_DETACH", false)?,
            tracking_dir: path("NODE_TRACKING_DIR").unwrap_or_else(|| PathBuf::from("/var/lib/trident/tracking")),
            kube_plugin: parse(&get, "KUBE_PLUGIN", true)?,
            watch_namespace: get("WATCH_NAMESPACE"),
            publication_rate: parse(&get, "RATE_LIMIT_PUBLICATIONS_RPS", 10_000)?,
            publication_burst: parse(&get, "RATE_LIMIT_PUBLICATIONS_BURST", 10_000)?,
        })
    }

    /// Controller REST client TLS settings, when any TLS material is configured
    pub fn client_tls(&self) -> Option<controller_client::TlsConfig> {
        let tls = controller_client::TlsConfig {
            ca_cert_file: self.ca_cert_file.clone(),
            client_cert_file: self.client_cert_file.clone(),
            client_key_file: self.client_key_file.clone(),
            server_name: String::new(),
            insecure_skip_verify: self.insecure_skip_verify,
        };
        tls.is_configured().then_some(tls)
    }

    /// REST listener TLS settings; client certificates are required when a CA is set
    pub fn server_tls(&self) -> Option<rest_api::ServerTlsConfig> {
        match (&self.server_cert_file, &self.server_key_file) {
            (Some(cert), Some(key)) => Some(rest_api::ServerTlsConfig {
                cert_file: cert.clone(),
                key_file: key.clone(),
                client_ca_file: self.ca_cert_file.clone(),
            }),
            _ => None,
        }
    }
}

fn parse<T, G>(get: &G, key: &str, default: T) -> Result<T, PluginError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| PluginError::InvalidConfig(format!("{key}='{raw}': {e}"))),
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .unwrap_or_default()
}
