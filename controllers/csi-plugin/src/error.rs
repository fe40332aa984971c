//! Plugin error types.
//!
//! Domain layers return [`OrchestratorError`]; this enum adds the failures
//! that only exist inside the plugin process. The gRPC boundary converts
//! both into a [`tonic::Status`] in exactly one place.

use controller_client::ClientError;
use storage_core::OrchestratorError;
use thiserror::Error;
use tonic::{Code, Status};

use crate::crypto::CryptoError;

/// Errors that can occur in the CSI plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Catalog error, categorized
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// Controller REST client error
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// CSI endpoint without a supported scheme
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Request failed CSI validation
    #[error("{0}")]
    InvalidArgument(String),

    /// Paging token that does not match the current listing
    #[error("invalid starting token: {0}")]
    InvalidToken(String),

    /// Host command failed or timed out
    #[error("host operation failed: {0}")]
    Host(String),

    /// CHAP encryption or decryption failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Neither the current nor the previous passphrase opens the device
    #[error("no working passphrase provided")]
    NoWorkingPassphrase,

    /// Filesystem error (tracking records, key files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// gRPC server failure
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl PluginError {
    /// Shorthand for an invalid-argument error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// True when the error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Orchestrator(e) => e.is_not_found(),
            Self::Client(e) => e.status() == Some(404),
            Self::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }
}

/// gRPC code for a categorized catalog error; unmatched categories are `UNKNOWN`.
pub fn orchestrator_code(err: &OrchestratorError) -> Code {
    match err {
        OrchestratorError::NotReady => Code::Unavailable,
        OrchestratorError::BootstrapInProgress(_) => Code::FailedPrecondition,
        OrchestratorError::NotFound { .. } => Code::NotFound,
        OrchestratorError::CapacityOutOfRange(_) => Code::OutOfRange,
        OrchestratorError::AlreadyExists { .. } => Code::AlreadyExists,
        OrchestratorError::VolumeCreating(_) | OrchestratorError::VolumeDeleting(_) => Code::DeadlineExceeded,
        OrchestratorError::ResourceExhausted(_) => Code::ResourceExhausted,
        OrchestratorError::FailedPrecondition(_) => Code::FailedPrecondition,
        OrchestratorError::InvalidInput(_) => Code::InvalidArgument,
        OrchestratorError::Unsupported(_) => Code::Unimplemented,
        OrchestratorError::IncorrectLuksPassphrase(_) => Code::Internal,
        OrchestratorError::Connection(_) => Code::Unavailable,
        OrchestratorError::Internal(_) => Code::Unknown,
    }
}

impl From<PluginError> for Status {
    fn from(err: PluginError) -> Self {
        let message = err.to_string();
        let code = match err {
            PluginError::Orchestrator(e) => orchestrator_code(&e),
            PluginError::Client(e) => orchestrator_code(&OrchestratorError::from(e)),
            PluginError::InvalidArgument(_) | PluginError::InvalidEndpoint(_) => Code::InvalidArgument,
            PluginError::InvalidToken(_) => Code::Aborted,
            PluginError::NoWorkingPassphrase => Code::Internal,
            PluginError::Kube(kube::Error::Api(response)) if response.code == 404 => Code::NotFound,
            PluginError::Host(_) | PluginError::Io(_) | PluginError::Crypto(_) => Code::Internal,
            _ => Code::Unknown,
        };
        Status::new(code, message)
    }
}

impl From<PluginError> for OrchestratorError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Orchestrator(e) => e,
            PluginError::Client(e) => e.into(),
            PluginError::InvalidArgument(m) | PluginError::InvalidConfig(m) => Self::InvalidInput(m),
            PluginError::NoWorkingPassphrase => Self::IncorrectLuksPassphrase("no working passphrase provided".to_string()),
            PluginError::Kube(kube::Error::Api(response)) if response.code == 404 => {
                Self::not_found("Kubernetes object", response.message.clone())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}
