//! REST listener

use axum::Router;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::tls::{ServerTlsConfig, TlsError};

/// How long in-flight requests get to finish on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Listener failure
#[derive(Debug, Error)]
pub enum ServerError {
    /// TLS material could not be loaded
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Bind or accept failure
    #[error("REST server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct RestServerConfig {
    /// Address to bind
    pub listen: SocketAddr,
    /// HTTPS settings; `None` serves plain HTTP
    pub tls: Option<ServerTlsConfig>,
}

/// Serve `app` until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(app: Router, config: RestServerConfig, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    match config.tls {
        Some(tls) => {
            let rustls = RustlsConfig::from_config(Arc::new(tls.server_config()?));
            let handle = Handle::new();
            let signal = handle.clone();
            tokio::spawn(async move {
                shutdown.await;
                signal.graceful_shutdown(Some(SHUTDOWN_GRACE));
            });

            info!(
                addr = %config.listen,
                mutual_tls = tls.client_ca_file.is_some(),
                "Starting REST server (HTTPS)"
            );
            axum_server::bind_rustls(config.listen, rustls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(config.listen).await?;
            info!(addr = %config.listen, "Starting REST server (HTTP)");
            axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
        }
    }

    info!("REST server stopped");
    Ok(())
}
