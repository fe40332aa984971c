//! Health endpoints for the node plugin
//!
//! `/liveness` answers while the process runs; `/readiness` only once the
//! node has registered with the controller.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Readiness flag flipped by the node plugin
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// Mark the node ready or not
    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    /// Current readiness
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

async fn readiness(State(ready): State<Readiness>) -> StatusCode {
    if ready.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Router serving the probe endpoints
pub fn probe_router(ready: Readiness) -> Router {
    Router::new()
        .route("/liveness", get(liveness))
        .route("/readiness", get(readiness))
        .with_state(ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn status(app: &Router, path: &str) -> StatusCode {
        let request = Request::get(path).body(Body::empty()).expect("request");
        app.clone().oneshot(request).await.expect("response").status()
    }

    #[tokio::test]
    async fn test_readiness_follows_flag() {
        let ready = Readiness::default();
        let app = probe_router(ready.clone());

        assert_eq!(status(&app, "/liveness").await, StatusCode::OK);
        assert_eq!(status(&app, "/readiness").await, StatusCode::SERVICE_UNAVAILABLE);

        ready.set(true);
        assert_eq!(status(&app, "/readiness").await, StatusCode::OK);
    }
}
