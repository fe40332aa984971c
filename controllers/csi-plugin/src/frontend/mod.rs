//! CSI frontend
//!
//! A single [`CsiDriver`] implements the Identity, Controller and Node
//! services. Which services are served depends on the [`Role`]: the
//! controller drives the catalog directly, the node goes through the
//! controller REST client and the host agent.
//!
//! # Modules
//!
//! - **identity**, **controller**, **node**: the three gRPC services
//! - **interceptor**: request context, audit and redacted logging per call
//! - **op_cache**: deduplication of concurrent calls for the same key
//! - **publish_context**: the controller to node handoff map
//! - **endpoint**: `unix://` and `tcp://` endpoint parsing

pub mod controller;
pub mod endpoint;
pub mod identity;
pub mod interceptor;
pub mod node;
pub mod op_cache;
pub mod publish_context;

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use controller_client::ControllerClientTrait;
use csi_proto::v1;
use csi_proto::v1::controller_server::ControllerServer;
use csi_proto::v1::identity_server::IdentityServer;
use csi_proto::v1::node_server::NodeServer;
use rest_api::Readiness;
use storage_core::{FrontendHelper, Orchestrator, OrchestratorError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::Status;
use tracing::{error, info, warn};

use crate::config::Role;
use crate::crypto::ChapCipher;
use crate::error::PluginError;
use crate::node::{HostAgent, LuksPassphraseManager, SelfHealer, TrackingStore, describe_node, register_node};
use endpoint::{Endpoint, parse_endpoint};
use op_cache::OpCache;

/// Name the driver registers under
pub const DRIVER_NAME: &str = "csi.trident.netapp.io";

/// How long in-flight RPCs get to finish on shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type Outcome<T> = Result<T, Status>;

/// One cache per mutating RPC, since each caches its own response type
#[derive(Debug, Default)]
struct OpCaches {
    create_volume: OpCache<Outcome<v1::CreateVolumeResponse>>,
    delete_volume: OpCache<Outcome<v1::DeleteVolumeResponse>>,
    publish: OpCache<Outcome<v1::ControllerPublishVolumeResponse>>,
    unpublish: OpCache<Outcome<v1::ControllerUnpublishVolumeResponse>>,
    create_snapshot: OpCache<Outcome<v1::CreateSnapshotResponse>>,
    delete_snapshot: OpCache<Outcome<v1::DeleteSnapshotResponse>>,
    expand: OpCache<Outcome<v1::ControllerExpandVolumeResponse>>,
    node_stage: OpCache<Outcome<v1::NodeStageVolumeResponse>>,
    node_unstage: OpCache<Outcome<v1::NodeUnstageVolumeResponse>>,
    node_publish: OpCache<Outcome<v1::NodePublishVolumeResponse>>,
    node_unpublish: OpCache<Outcome<v1::NodeUnpublishVolumeResponse>>,
    node_expand: OpCache<Outcome<v1::NodeExpandVolumeResponse>>,
}

/// Controller-side collaborators
struct ControllerParts {
    orchestrator: Arc<dyn Orchestrator>,
    helper: Arc<dyn FrontendHelper>,
}

/// Node-side collaborators
struct NodeParts {
    controller: Arc<dyn ControllerClientTrait>,
    host: Arc<dyn HostAgent>,
    tracking: TrackingStore,
    luks: LuksPassphraseManager,
}

struct Inner {
    role: Role,
    node_name: String,
    cipher: ChapCipher,
    readiness: Readiness,
    controller: Option<ControllerParts>,
    node: Option<NodeParts>,
    topology: RwLock<BTreeMap<String, String>>,
    ops: OpCaches,
}

/// The CSI driver; cheap to clone, every clone shares state
#[derive(Clone)]
pub struct CsiDriver {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CsiDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsiDriver")
            .field("role", &self.inner.role)
            .field("node_name", &self.inner.node_name)
            .field("ready", &self.inner.readiness.is_ready())
            .finish_non_exhaustive()
    }
}

/// Builder for [`CsiDriver`]
pub struct CsiDriverBuilder {
    role: Role,
    node_name: String,
    cipher: ChapCipher,
    readiness: Readiness,
    controller: Option<ControllerParts>,
    node: Option<NodeParts>,
}

impl std::fmt::Debug for CsiDriverBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsiDriverBuilder")
            .field("role", &self.role)
            .field("node_name", &self.node_name)
            .finish_non_exhaustive()
    }
}

impl CsiDriverBuilder {
    /// CHAP cipher used for the publish context
    pub fn cipher(mut self, cipher: ChapCipher) -> Self {
        self.cipher = cipher;
        self
    }

    /// Readiness flag shared with the probe server
    pub fn readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Catalog and container orchestrator helper for the controller service
    pub fn controller(mut self, orchestrator: Arc<dyn Orchestrator>, helper: Arc<dyn FrontendHelper>) -> Self {
        self.controller = Some(ControllerParts { orchestrator, helper });
        self
    }

    /// Controller client, host agent and tracking records for the node service
    pub fn node(mut self, controller: Arc<dyn ControllerClientTrait>, host: Arc<dyn HostAgent>, tracking: TrackingStore) -> Self {
        let luks = LuksPassphraseManager::new(Arc::clone(&host), Arc::clone(&controller));
        self.node = Some(NodeParts {
            controller,
            host,
            tracking,
            luks,
        });
        self
    }

    /// Check the role has what it needs
    pub fn build(self) -> Result<CsiDriver, PluginError> {
        if self.role.runs_controller() && self.controller.is_none() {
            return Err(PluginError::InvalidConfig(format!("{:?} role needs a catalog", self.role)));
        }
        if self.role.runs_node() {
            if self.node.is_none() {
                return Err(PluginError::InvalidConfig(format!("{:?} role needs a host agent", self.role)));
            }
            if self.node_name.is_empty() {
                return Err(PluginError::InvalidConfig("node name is required".to_string()));
            }
        }

        Ok(CsiDriver {
            inner: Arc::new(Inner {
                role: self.role,
                node_name: self.node_name,
                cipher: self.cipher,
                readiness: self.readiness,
                controller: self.controller,
                node: self.node,
                topology: RwLock::new(BTreeMap::new()),
                ops: OpCaches::default(),
            }),
        })
    }
}

impl CsiDriver {
    /// Start building a driver for `role`
    pub fn builder(role: Role, node_name: impl Into<String>) -> CsiDriverBuilder {
        CsiDriverBuilder {
            role,
            node_name: node_name.into(),
            cipher: ChapCipher::cleartext(),
            readiness: Readiness::default(),
            controller: None,
            node: None,
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn node_name(&self) -> &str {
        &self.inner.node_name
    }

    pub fn readiness(&self) -> &Readiness {
        &self.inner.readiness
    }

    fn ops(&self) -> &OpCaches {
        &self.inner.ops
    }

    fn controller_parts(&self) -> Result<&ControllerParts, PluginError> {
        self.inner.controller.as_ref().ok_or_else(|| {
            OrchestratorError::Unsupported("the controller service is not running in this process".to_string()).into()
        })
    }

    fn node_parts(&self) -> Result<&NodeParts, PluginError> {
        self.inner.node.as_ref().ok_or_else(|| {
            OrchestratorError::Unsupported("the node service is not running in this process".to_string()).into()
        })
    }

    fn topology(&self) -> BTreeMap<String, String> {
        self.inner.topology.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_topology(&self, labels: BTreeMap<String, String>) {
        *self.inner.topology.write().unwrap_or_else(PoisonError::into_inner) = labels;
    }

    /// Register this node with the controller, retrying until it succeeds.
    ///
    /// The node becomes ready once registered.
    pub async fn register(&self) -> Result<(), PluginError> {
        let parts = self.node_parts()?;
        let node = describe_node(parts.host.as_ref(), &self.inner.node_name, self.topology()).await;
        let labels = register_node(Arc::clone(&parts.controller), node).await;
        self.set_topology(labels);
        self.inner.readiness.set(true);
        Ok(())
    }

    /// Start serving on `endpoint` in the background.
    ///
    /// Node roles also register with the controller and, when given a
    /// healer, start the iSCSI self-healing loop.
    pub async fn activate(&self, endpoint: &str, healer: Option<Arc<SelfHealer>>) -> Result<Activation, PluginError> {
        let endpoint = parse_endpoint(endpoint)?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let server = tokio::spawn(serve(self.clone(), endpoint, shutdown_rx.clone()));

        if self.inner.role.runs_node() {
            let driver = self.clone();
            let mut stop = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    result = driver.register() => {
                        if let Err(e) = result {
                            error!(error = %e, "Node registration failed");
                        }
                    }
                    () = stopped(&mut stop) => {}
                }
            }));

            if let Some(healer) = healer {
                tasks.push(tokio::spawn(healer.run(shutdown_rx.clone())));
            }
        } else {
            self.inner.readiness.set(true);
        }

        info!(role = ?self.inner.role, "CSI frontend activated");
        Ok(Activation { shutdown, tasks, server })
    }
}

/// Handle on a running frontend
#[derive(Debug)]
pub struct Activation {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    server: JoinHandle<Result<(), PluginError>>,
}

impl Activation {
    /// Stop the gRPC server gracefully, then the background loops
    pub async fn deactivate(self) -> Result<(), PluginError> {
        let _ = self.shutdown.send(true);

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, self.server).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(PluginError::Watch(format!("gRPC server task failed: {e}"))),
            Err(_) => {
                warn!("gRPC server did not stop within the grace period");
                Ok(())
            }
        }
    }
}

/// Resolve once `shutdown` reads true or its sender is gone.
///
/// The borrow `wait_for` returns is not `Send`; it never leaves this call.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

async fn serve(driver: CsiDriver, endpoint: Endpoint, mut shutdown: watch::Receiver<bool>) -> Result<(), PluginError> {
    let role = driver.role();
    let router = tonic::transport::Server::builder()
        .add_service(IdentityServer::new(driver.clone()))
        .add_optional_service(role.runs_controller().then(|| ControllerServer::new(driver.clone())))
        .add_optional_service(role.runs_node().then(|| NodeServer::new(driver)));
    let signal = async move { stopped(&mut shutdown).await };

    match endpoint {
        Endpoint::Unix(path) => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let listener = tokio::net::UnixListener::bind(&path)?;
            info!(endpoint = %path.display(), "CSI gRPC server listening");
            let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);
            router.serve_with_incoming_shutdown(incoming, signal).await?;
        }
        Endpoint::Tcp(address) => {
            let listener = tokio::net::TcpListener::bind(&address).await?;
            info!(endpoint = %address, "CSI gRPC server listening");
            let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
            router.serve_with_incoming_shutdown(incoming, signal).await?;
        }
    }

    info!("CSI gRPC server stopped");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeHostAgent;
    use controller_client::MockControllerClient;

    #[test]
    fn test_roles_need_their_collaborators() {
        let err = CsiDriver::builder(Role::Controller, "").build().expect_err("no catalog");
        assert!(err.to_string().contains("catalog"));

        let err = CsiDriver::builder(Role::Node, "n1").build().expect_err("no host");
        assert!(err.to_string().contains("host agent"));
    }

    #[tokio::test]
    async fn test_register_sets_readiness() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = Arc::new(MockControllerClient::new());
        let driver = test_support::node_driver(Arc::new(FakeHostAgent::new()), controller.clone(), dir.path());
        assert!(!driver.readiness().is_ready());

        driver.register().await.expect("register");
        assert!(driver.readiness().is_ready());
        let node = controller.node("n1").expect("registered");
        assert_eq!(node.iqn, FakeHostAgent::IQN);
    }

    #[tokio::test]
    async fn test_activate_and_deactivate_on_a_unix_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (catalog, _) = test_support::catalog("file").await;
        let driver = test_support::controller_driver(catalog);
        let socket = dir.path().join("csi.sock");

        let activation = driver
            .activate(&format!("unix://{}", socket.display()), None)
            .await
            .expect("activate");
        assert!(driver.readiness().is_ready());
        activation.deactivate().await.expect("deactivate");
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_stops_between_ticks() {
        let (stop, mut stop_rx) = watch::channel(false);
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = Arc::clone(&ticks);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                    () = stopped(&mut stop_rx) => break,
                }
            }
        });

        tokio::time::sleep(std::time::Duration::from_secs(90)).await;
        stop.send(true).expect("send");
        task.await.expect("task");
        assert_eq!(ticks.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_stopped() {
        let (stop, mut stop_rx) = watch::channel(false);
        drop(stop);
        stopped(&mut stop_rx).await;
    }
}
