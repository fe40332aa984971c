//! REST API errors

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use storage_core::OrchestratorError;
use storage_core::api::ErrorResponse;
use thiserror::Error;

/// Error returned by a REST handler
#[derive(Debug, Error)]
pub enum ApiError {
    /// Catalog operation failed
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// Request body could not be decoded
    #[error("invalid request body: {0}")]
    BadRequest(String),

    /// The route needs the container orchestrator helper, which is not configured
    #[error("{0} is not available without the container orchestrator helper")]
    HelperUnavailable(&'static str),

    /// Too many requests on a rate-limited route
    #[error("too many requests")]
    TooManyRequests,
}

impl ApiError {
    /// HTTP status the error is reported with
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Orchestrator(e) => orchestrator_status(e),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::HelperUnavailable(_) => StatusCode::NOT_IMPLEMENTED,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

fn orchestrator_status(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::NotFound { .. } => StatusCode::NOT_FOUND,
        OrchestratorError::AlreadyExists { .. } => StatusCode::CONFLICT,
        OrchestratorError::InvalidInput(_) | OrchestratorError::CapacityOutOfRange(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::NotReady | OrchestratorError::BootstrapInProgress(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::VolumeCreating(_)
        | OrchestratorError::VolumeDeleting(_)
        | OrchestratorError::FailedPrecondition(_) => StatusCode::CONFLICT,
        OrchestratorError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorResponse { error: self.to_string() });
        (status, body).into_response()
    }
}

/// Result type for handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (OrchestratorError::not_found("volume", "v"), StatusCode::NOT_FOUND),
            (OrchestratorError::already_exists("node", "n"), StatusCode::CONFLICT),
            (OrchestratorError::invalid("bad"), StatusCode::BAD_REQUEST),
            (OrchestratorError::NotReady, StatusCode::SERVICE_UNAVAILABLE),
            (OrchestratorError::VolumeDeleting("v".into()), StatusCode::CONFLICT),
            (OrchestratorError::ResourceExhausted("pools".into()), StatusCode::TOO_MANY_REQUESTS),
            (OrchestratorError::internal("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }
}
