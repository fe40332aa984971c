//! TLS configuration for the node to controller channel
//!
//! The controller's serving certificate is verified against the configured CA
//! and its common name is pinned: the client always connects using the pinned
//! name and resolves it to the real service address itself. Without a CA the
//! client refuses to build unless verification was explicitly disabled.

use crate::error::ClientError;
use reqwest::tls::Version;
use reqwest::{Certificate, ClientBuilder, Identity};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use tracing::warn;

/// Common name the controller's serving certificate is issued for.
pub const DEFAULT_SERVER_NAME: &str = "trident-csi";

/// TLS material and verification policy.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA bundle used to verify the controller
    pub ca_cert_file: Option<PathBuf>,
    /// Client certificate presented to the controller
    pub client_cert_file: Option<PathBuf>,
    /// Key for the client certificate
    pub client_key_file: Option<PathBuf>,
    /// Pinned server certificate common name
    pub server_name: String,
    /// Skip server verification; development only
    pub insecure_skip_verify: bool,
}

impl TlsConfig {
    /// True when any TLS setting was provided
    pub fn is_configured(&self) -> bool {
        self.ca_cert_file.is_some()
            || self.client_cert_file.is_some()
            || self.client_key_file.is_some()
            || self.insecure_skip_verify
    }

    /// Name the client puts in the URL and SNI
    pub fn pinned_name(&self) -> &str {
        if self.server_name.is_empty() {
            DEFAULT_SERVER_NAME
        } else {
            &self.server_name
        }
    }

    /// Installs verification, pinning and the client identity on `builder`.
    ///
    /// `host` and `port` are the real controller address; the pinned name is
    /// resolved to it.
    pub fn apply(&self, mut builder: ClientBuilder, host: &str, port: u16) -> Result<ClientBuilder, ClientError> {
        builder = builder.min_tls_version(Version::TLS_1_2).use_rustls_tls();

        match (&self.ca_cert_file, self.insecure_skip_verify) {
            (Some(ca_file), _) => {
                let pem = read(ca_file, "CA certificate")?;
                let ca = Certificate::from_pem(&pem)
                    .map_err(|e| ClientError::Tls(format!("invalid CA certificate {}: {e}", ca_file.display())))?;
                builder = builder.tls_built_in_root_certs(false).add_root_certificate(ca);
                builder = builder.resolve(self.pinned_name(), resolve(host, port)?);
            }
            (None, true) => {
                warn!("TLS verification of the controller is disabled");
                builder = builder.danger_accept_invalid_certs(true);
            }
            (None, false) => {
                return Err(ClientError::Tls(
                    "no CA certificate configured and verification is not disabled".to_string(),
                ));
            }
        }

        match (&self.client_cert_file, &self.client_key_file) {
            (Some(cert_file), Some(key_file)) => {
                let mut pem = read(cert_file, "client certificate")?;
                pem.push(b'\n');
                pem.extend(read(key_file, "client key")?);
                let identity = Identity::from_pem(&pem)
                    .map_err(|e| ClientError::Tls(format!("invalid client certificate or key: {e}")))?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(ClientError::Tls(
                    "client certificate and key must be configured together".to_string(),
                ));
            }
        }

        Ok(builder)
    }

    /// Host to put in request URLs
    pub fn url_host<'a>(&'a self, host: &'a str) -> &'a str {
        if self.ca_cert_file.is_some() { self.pinned_name() } else { host }
    }
}

fn read(path: &PathBuf, what: &str) -> Result<Vec<u8>, ClientError> {
    std::fs::read(path).map_err(|e| ClientError::Tls(format!("could not read {what} {}: {e}", path.display())))
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ClientError::Tls(format!("could not resolve controller address {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| ClientError::Tls(format!("controller address {host}:{port} resolved to nothing")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fails_closed_without_ca() {
        let config = TlsConfig {
            client_cert_file: Some(PathBuf::from("/nonexistent/cert.pem")),
            ..Default::default()
        };
        let err = config
            .apply(reqwest::Client::builder(), "127.0.0.1", 34571)
            .expect_err("must refuse without CA");
        assert!(matches!(err, ClientError::Tls(_)));
    }

    #[test]
    fn test_insecure_skip_verify_builds() {
        let config = TlsConfig {
            insecure_skip_verify: true,
            ..Default::default()
        };
        let builder = config
            .apply(reqwest::Client::builder(), "127.0.0.1", 34571)
            .expect("insecure mode builds");
        assert!(builder.build().is_ok());
        assert_eq!(config.url_host("10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn test_half_configured_identity_is_rejected() {
        let config = TlsConfig {
            insecure_skip_verify: true,
            client_key_file: Some(PathBuf::from("/nonexistent/key.pem")),
            ..Default::default()
        };
        assert!(config.apply(reqwest::Client::builder(), "127.0.0.1", 34571).is_err());
    }

    #[test]
    fn test_unreadable_ca_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = TlsConfig {
            ca_cert_file: Some(dir.path().join("missing.pem")),
            ..Default::default()
        };
        let err = config
            .apply(reqwest::Client::builder(), "127.0.0.1", 34571)
            .expect_err("missing CA file");
        assert!(err.to_string().contains("CA certificate"));
        assert_eq!(config.url_host("10.0.0.1"), DEFAULT_SERVER_NAME);
    }
}
