use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use storage_core::api::{AddBackendRequest, BackendStateUpdate, GetBackendResponse, ListBackendsResponse};
use tracing::info;

use super::JsonBody;
use crate::error::ApiResult;
use crate::state::AppState;

/// `POST /backend`
pub async fn add_backend(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<AddBackendRequest>,
) -> ApiResult<(StatusCode, Json<GetBackendResponse>)> {
    let backend = state
        .orchestrator
        .add_backend(&request.name, &request.driver_kind, request.config)
        .await?;
    info!(backend = %backend.name, driver = %backend.driver_kind, "Added backend");
    Ok((StatusCode::CREATED, Json(GetBackendResponse { backend })))
}

/// `GET /backend`
pub async fn list_backends(State(state): State<AppState>) -> ApiResult<Json<ListBackendsResponse>> {
    let backends = state.orchestrator.list_backends().await?;
    Ok(Json(ListBackendsResponse {
        backends: backends.into_iter().map(|b| b.name).collect(),
    }))
}

/// `GET /backend/{backend}`
pub async fn get_backend(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<GetBackendResponse>> {
    let backend = state.orchestrator.get_backend(&name).await?;
    Ok(Json(GetBackendResponse { backend }))
}

/// `POST /backend/{backend}/state`
pub async fn update_backend_state(
    State(state): State<AppState>,
    Path(name): Path<String>,
    JsonBody(update): JsonBody<BackendStateUpdate>,
) -> ApiResult<Json<GetBackendResponse>> {
    let backend = state.orchestrator.update_backend_state(&name, update.state).await?;
    Ok(Json(GetBackendResponse { backend }))
}

/// `DELETE /backend/{backend}`
pub async fn delete_backend(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.orchestrator.delete_backend(&name).await?;
    Ok(StatusCode::OK)
}
