//! Server TLS
//!
//! The controller serves HTTPS with its own certificate. With a client CA
//! configured, every caller must present a certificate signed by it.

use rustls::RootCertStore;
use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// TLS setup failure
#[derive(Debug, Error)]
pub enum TlsError {
    /// A PEM file could not be read or parsed
    #[error("could not load {path}: {message}")]
    Pem {
        /// File that failed
        path: String,
        /// Parser message
        message: String,
    },

    /// Certificates parsed but rustls rejected them
    #[error("invalid TLS configuration: {0}")]
    Config(String),
}

/// Certificate files for the REST listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTlsConfig {
    /// Server certificate chain (PEM)
    pub cert_file: PathBuf,
    /// Server private key (PEM)
    pub key_file: PathBuf,
    /// CA that client certificates must chain to; `None` disables mTLS
    pub client_ca_file: Option<PathBuf>,
}

impl ServerTlsConfig {
    /// Build the rustls server configuration (TLS 1.2 and 1.3, h2 and http/1.1)
    pub fn server_config(&self) -> Result<ServerConfig, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?;

        let builder = match &self.client_ca_file {
            Some(ca_file) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca_file)? {
                    roots.add(cert).map_err(|e| TlsError::Config(e.to_string()))?;
                }
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .build()
                    .map_err(|e| TlsError::Config(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder
            .with_single_cert(load_certs(&self.cert_file)?, load_key(&self.key_file)?)
            .map_err(|e| TlsError::Config(e.to_string()))?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| pem_error(path, e))?;
    if certs.is_empty() {
        return Err(TlsError::Pem {
            path: path.display().to_string(),
            message: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| pem_error(path, e))
}

fn pem_error(path: &Path, err: rustls::pki_types::pem::Error) -> TlsError {
    TlsError::Pem {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_are_reported_by_path() {
        let config = ServerTlsConfig {
            cert_file: PathBuf::from("/nonexistent/server.crt"),
            key_file: PathBuf::from("/nonexistent/server.key"),
            client_ca_file: None,
        };
        let err = config.server_config().expect_err("files do not exist");
        assert!(err.to_string().contains("/nonexistent/server.crt"));
    }
}
