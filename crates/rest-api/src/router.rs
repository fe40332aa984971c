//! Route table
//!
//! Everything lives under [`API_BASE_PATH`]; `GET /version` is also served
//! unversioned for older clients.

use axum::Router;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post, put};
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

use crate::audit::request_context;
use crate::handlers::{backend, node, publication, snapshot, storage_class, version, volume};
use crate::rate_limit::{RateLimiter, rate_limit};
use crate::state::AppState;

/// Base path of the versioned API.
pub const API_BASE_PATH: &str = "/trident/v1";

/// Longest any single request may run.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Build the controller API router.
///
/// `limiter` guards node publication updates, which every node sends during
/// its periodic reconcile.
pub fn router(state: AppState, limiter: Arc<RateLimiter>) -> Router {
    let update_publication = put(publication::update_publication)
        .layer(middleware::from_fn_with_state(limiter, rate_limit));

    let api = Router::new()
        .route("/version", get(version::get_version))
        .route("/backend", post(backend::add_backend).get(backend::list_backends))
        .route("/backend/{backend}", get(backend::get_backend).delete(backend::delete_backend))
        .route("/backend/{backend}/state", post(backend::update_backend_state))
        .route("/volume", post(volume::add_volume).get(volume::list_volumes))
        .route("/volume/import", post(volume::import_volume))
        .route("/volume/{volume}", get(volume::get_volume).delete(volume::delete_volume))
        .route("/volume/{volume}/upgrade", post(volume::upgrade_volume))
        .route("/volume/{volume}/luksPassphraseNames", put(volume::update_luks_passphrase_names))
        .route("/volume/{volume}/publication", get(volume::list_publications_for_volume))
        .route("/volume/{volume}/snapshot", get(volume::list_snapshots_for_volume))
        .route(
            "/storageclass",
            post(storage_class::add_storage_class).get(storage_class::list_storage_classes),
        )
        .route(
            "/storageclass/{name}",
            get(storage_class::get_storage_class).delete(storage_class::delete_storage_class),
        )
        .route("/node", get(node::list_nodes))
        .route(
            "/node/{node}",
            put(node::add_node).get(node::get_node).delete(node::delete_node),
        )
        .route(
            "/node/{node}/publication",
            get(node::list_publications_for_node).put(node::update_publication_state),
        )
        .route("/publication", get(publication::list_publications))
        .route(
            "/publication/{volume}/{node}",
            get(publication::get_publication).merge(update_publication),
        )
        .route("/snapshot", post(snapshot::create_snapshot).get(snapshot::list_snapshots))
        .route(
            "/snapshot/{volume}/{snapshot}",
            get(snapshot::get_snapshot).delete(snapshot::delete_snapshot),
        )
        .route("/chap/{volume}/{node}", get(publication::get_chap));

    Router::new()
        .nest(API_BASE_PATH, api)
        .route("/version", get(version::get_version))
        .layer(timeout_layer())
        .layer(middleware::from_fn(request_context))
        .with_state(state)
}

/// Requests running past [`REQUEST_TIMEOUT`] get `408 Request Timeout`
fn timeout_layer() -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, REQUEST_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test(start_paused = true)]
    async fn test_slow_requests_time_out() {
        let app = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(REQUEST_TIMEOUT * 2).await;
                    "done"
                }),
            )
            .route("/fast", get(|| async { "done" }))
            .layer(timeout_layer());

        let slow = app
            .clone()
            .oneshot(Request::get("/slow").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(slow.status(), StatusCode::REQUEST_TIMEOUT);

        let fast = app
            .oneshot(Request::get("/fast").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(fast.status(), StatusCode::OK);
    }
}
