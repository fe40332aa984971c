use axum::Json;
use axum::extract::State;
use storage_core::api::VersionResponse;

use crate::state::AppState;

/// `GET /version`
pub async fn get_version(State(state): State<AppState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        server_version: state.orchestrator.version(),
    })
}
