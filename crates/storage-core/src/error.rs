//! Categorized orchestrator errors.
//!
//! Domain layers return these values; the gRPC and REST boundaries map the
//! category to a status code. The enum is `Clone` so a single outcome can be
//! handed to every caller waiting on a deduplicated operation.

use thiserror::Error;

/// Errors returned by the catalog and by the interfaces around it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The orchestrator has not finished bootstrapping its catalog.
    #[error("orchestrator is not ready")]
    NotReady,

    /// Bootstrap failed or is still running.
    #[error("bootstrap in progress: {0}")]
    BootstrapInProgress(String),

    /// A named object does not exist.
    #[error("{kind} {name} was not found")]
    NotFound {
        /// Object kind ("volume", "backend", ...)
        kind: &'static str,
        /// Object name or key
        name: String,
    },

    /// An object with the same identity already exists.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Object kind
        kind: &'static str,
        /// Object name or key
        name: String,
    },

    /// Requested capacity is outside what the backend can provide.
    #[error("capacity out of range: {0}")]
    CapacityOutOfRange(String),

    /// The volume is still being created.
    #[error("volume {0} is still being created")]
    VolumeCreating(String),

    /// The volume is being deleted.
    #[error("volume {0} is being deleted")]
    VolumeDeleting(String),

    /// Backend or catalog ran out of a resource.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The catalog is not in a state that allows the operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Request failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Operation not supported in this configuration.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// No configured passphrase unlocks the LUKS device.
    #[error("incorrect LUKS passphrase: {0}")]
    IncorrectLuksPassphrase(String),

    /// Transport failure talking to a collaborator.
    #[error("connection failure: {0}")]
    Connection(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Shorthand for a not-found error.
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound { kind, name: name.into() }
    }

    /// Shorthand for an already-exists error.
    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists { kind, name: name.into() }
    }

    /// Shorthand for an invalid-input error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Shorthand for an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Adds `context` to the message without changing the category.
    #[must_use]
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        match self {
            Self::NotFound { kind, name } => Self::NotFound {
                kind,
                name: format!("{name} ({context})"),
            },
            Self::AlreadyExists { kind, name } => Self::AlreadyExists {
                kind,
                name: format!("{name} ({context})"),
            },
            Self::BootstrapInProgress(m) => Self::BootstrapInProgress(format!("{context}: {m}")),
            Self::CapacityOutOfRange(m) => Self::CapacityOutOfRange(format!("{context}: {m}")),
            Self::ResourceExhausted(m) => Self::ResourceExhausted(format!("{context}: {m}")),
            Self::FailedPrecondition(m) => Self::FailedPrecondition(format!("{context}: {m}")),
            Self::InvalidInput(m) => Self::InvalidInput(format!("{context}: {m}")),
            Self::Unsupported(m) => Self::Unsupported(format!("{context}: {m}")),
            Self::IncorrectLuksPassphrase(m) => Self::IncorrectLuksPassphrase(format!("{context}: {m}")),
            Self::Connection(m) => Self::Connection(format!("{context}: {m}")),
            Self::Internal(m) => Self::Internal(format!("{context}: {m}")),
            // These carry a volume name rather than a message
            other @ (Self::NotReady | Self::VolumeCreating(_) | Self::VolumeDeleting(_)) => other,
        }
    }

    /// True for the not-found category.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for the already-exists category.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// True when the caller is expected to retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotReady
                | Self::BootstrapInProgress(_)
                | Self::VolumeCreating(_)
                | Self::VolumeDeleting(_)
                | Self::Connection(_)
        )
    }
}

/// Result alias used throughout the catalog.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_the_object() {
        let err = OrchestratorError::not_found("backend", "bogus");
        assert_eq!(err.to_string(), "backend bogus was not found");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn in_progress_errors_are_retryable() {
        assert!(OrchestratorError::VolumeCreating("v".into()).is_retryable());
        assert!(OrchestratorError::NotReady.is_retryable());
        assert!(!OrchestratorError::invalid("x").is_retryable());
    }

    #[test]
    fn context_keeps_the_category() {
        let err = OrchestratorError::not_found("backend", "bogus").context("import of PVC ns/data");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "backend bogus (import of PVC ns/data) was not found");

        let err = OrchestratorError::invalid("bad size").context("decoding");
        assert_eq!(err, OrchestratorError::InvalidInput("decoding: bad size".into()));
        assert_eq!(OrchestratorError::NotReady.context("x"), OrchestratorError::NotReady);
    }
}
