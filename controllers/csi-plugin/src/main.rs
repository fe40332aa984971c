//! Trident CSI plugin
//!
//! One binary for every role:
//! - controller: owns the catalog, serves CSI Controller and the REST API
//!   nodes call, and reconciles the catalog with the cluster
//! - node: serves CSI Node, registers with the controller and heals iSCSI
//!   sessions
//! - allInOne: both, for conformance runs
//!
//! Configuration comes from the environment; see [`config::PluginConfig`].

mod backoff;
mod cluster;
mod config;
mod crypto;
mod error;
mod frontend;
mod node;
mod plain;
#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use anyhow::Context;
use controller_client::ControllerClient;
use rest_api::{AppState, RateLimiter, Readiness, RestServerConfig, probe_router};
use storage_core::{BuiltinDriverFactory, CatalogOrchestrator, FakeDriver, FrontendHelper, InMemoryStore, Orchestrator};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use cluster::KubernetesPlugin;
use cluster::api::KubeClusterApi;
use config::PluginConfig;
use crypto::ChapCipher;
use frontend::CsiDriver;
use node::host::COMMAND_TIMEOUT;
use node::{ExecHostAgent, HostAgent, SelfHealer, TrackingStore};
use plain::PlainCsiHelper;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    // kube and the REST listener both use rustls; pin the provider once
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = PluginConfig::from_env().context("loading configuration")?;
    info!(
        role = ?config.role,
        endpoint = %config.endpoint,
        node = %config.node_name,
        kube_plugin = config.kube_plugin,
        "Starting Trident CSI plugin"
    );

    let cipher = ChapCipher::load(config.aes_key_file.as_deref()).context("loading the CHAP key")?;
    debug!(encrypting = cipher.is_encrypting(), "CHAP cipher loaded");

    let readiness = Readiness::default();
    let (stop, stop_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let mut builder = CsiDriver::builder(config.role, config.node_name.clone())
        .cipher(cipher)
        .readiness(readiness.clone());

    if config.role.runs_controller() {
        let catalog = CatalogOrchestrator::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(BuiltinDriverFactory::new(Arc::new(FakeDriver::new()))),
        )
        .with_force_detach(config.enable_force_detach);
        catalog.bootstrap().await.context("bootstrapping the catalog")?;
        let orchestrator: Arc<dyn Orchestrator> = Arc::new(catalog);

        let helper: Arc<dyn FrontendHelper> = if config.kube_plugin {
            let client = kube::Client::try_default().await.context("connecting to Kubernetes")?;
            let cluster = Arc::new(KubeClusterApi::new(client.clone()));
            let plugin = Arc::new(
                KubernetesPlugin::connect(Arc::clone(&orchestrator), cluster)
                    .await
                    .context("reading the Kubernetes version")?,
            );
            tasks.extend(plugin.start(&client, config.watch_namespace.as_deref(), &stop_rx));
            plugin
        } else {
            Arc::new(PlainCsiHelper::new(Arc::clone(&orchestrator)))
        };

        let state = AppState::new(Arc::clone(&orchestrator)).with_helper(Arc::clone(&helper));
        let limiter = Arc::new(RateLimiter::new(config.publication_rate, config.publication_burst));
        let app = rest_api::router(state, limiter);
        let rest = RestServerConfig {
            listen: config.rest_listen,
            tls: config.server_tls(),
        };
        let mut stop_rest = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            let signal = async move { frontend::stopped(&mut stop_rest).await };
            if let Err(e) = rest_api::serve(app, rest, signal).await {
                error!(error = %e, "REST server failed");
            }
        }));

        builder = builder.controller(orchestrator, helper);
    }

    let mut healer = None;
    if config.role.runs_node() {
        let tls = config.client_tls();
        let controller = Arc::new(
            ControllerClient::new(&config.controller_host, config.controller_port, tls.as_ref())
                .context("building the controller client")?,
        );
        let host: Arc<dyn HostAgent> = Arc::new(ExecHostAgent::new(COMMAND_TIMEOUT));
        let tracking = TrackingStore::new(&config.tracking_dir);
        if config.self_healing_interval.is_zero() {
            info!("iSCSI self-healing disabled");
        } else {
            healer = Some(Arc::new(SelfHealer::new(
                Arc::clone(&host),
                tracking.clone(),
                config.self_healing_interval,
                config.stale_session_wait,
            )));
        }

        let probes = RestServerConfig {
            listen: config.probe_listen,
            tls: None,
        };
        let app = probe_router(readiness.clone());
        let mut stop_probes = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            let signal = async move { frontend::stopped(&mut stop_probes).await };
            if let Err(e) = rest_api::serve(app, probes, signal).await {
                error!(error = %e, "Probe server failed");
            }
        }));

        builder = builder.node(controller, host, tracking);
    }

    let driver = builder.build()?;
    let activation = driver.activate(&config.endpoint, healer).await?;

    shutdown_signal().await;
    info!("Shutdown requested");

    let _ = stop.send(true);
    activation.deactivate().await?;
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Trident CSI plugin stopped");
    Ok(())
}
