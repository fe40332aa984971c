//! Controller client errors

use storage_core::OrchestratorError;
use thiserror::Error;

/// Errors that can occur when talking to the controller REST API
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure (connect, TLS handshake, timeout)
    #[error("error communicating with the storage controller: {0}")]
    Connection(String),

    /// Controller answered with an unexpected status
    #[error("{operation} failed: status {status}: {message}")]
    Api {
        /// Operation name, e.g. "could not add node"
        operation: String,
        /// HTTP status code
        status: u16,
        /// Message from the error body, or the raw body
        message: String,
    },

    /// Response body could not be parsed
    #[error("could not parse response for {operation}: {source}")]
    Parse {
        /// Operation name
        operation: String,
        /// Underlying JSON error
        #[source]
        source: serde_json::Error,
    },

    /// Request body could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TLS material missing or invalid
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

impl ClientError {
    /// HTTP status for API errors
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for transport failures
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

impl From<ClientError> for OrchestratorError {
    fn from(e: ClientError) -> Self {
        match &e {
            ClientError::Connection(_) => Self::Connection(e.to_string()),
            ClientError::Api { status: 404, .. } => Self::NotFound {
                kind: "controller resource",
                name: e.to_string(),
            },
            ClientError::Api { status: 409, .. } => Self::AlreadyExists {
                kind: "controller resource",
                name: e.to_string(),
            },
            ClientError::Api { status: 400, .. } => Self::InvalidInput(e.to_string()),
            ClientError::Api { status: 503, .. } => Self::NotReady,
            ClientError::Api { status: 429, .. } => Self::ResourceExhausted(e.to_string()),
            _ => Self::Internal(e.to_string()),
        }
    }
}
