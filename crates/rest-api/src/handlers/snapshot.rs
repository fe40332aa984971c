use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use storage_core::SnapshotConfig;
use storage_core::api::{GetSnapshotResponse, ListSnapshotsResponse};

use super::JsonBody;
use crate::error::ApiResult;
use crate::state::AppState;

/// `POST /snapshot`
pub async fn create_snapshot(
    State(state): State<AppState>,
    JsonBody(config): JsonBody<SnapshotConfig>,
) -> ApiResult<(StatusCode, Json<GetSnapshotResponse>)> {
    let snapshot = state.orchestrator.create_snapshot(config).await?;
    Ok((StatusCode::CREATED, Json(GetSnapshotResponse { snapshot })))
}

/// `GET /snapshot`
pub async fn list_snapshots(State(state): State<AppState>) -> ApiResult<Json<ListSnapshotsResponse>> {
    let snapshots = state.orchestrator.list_snapshots().await?;
    Ok(Json(ListSnapshotsResponse {
        snapshots: snapshots.iter().map(|s| s.config.id()).collect(),
    }))
}

/// `GET /snapshot/{volume}/{snapshot}`
pub async fn get_snapshot(
    State(state): State<AppState>,
    Path((volume, snapshot)): Path<(String, String)>,
) -> ApiResult<Json<GetSnapshotResponse>> {
    let snapshot = state.orchestrator.get_snapshot(&volume, &snapshot).await?;
    Ok(Json(GetSnapshotResponse { snapshot }))
}

/// `DELETE /snapshot/{volume}/{snapshot}`
pub async fn delete_snapshot(
    State(state): State<AppState>,
    Path((volume, snapshot)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_snapshot(&volume, &snapshot).await?;
    Ok(StatusCode::OK)
}
