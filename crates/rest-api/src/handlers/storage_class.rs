use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use storage_core::StorageClassConfig;
use storage_core::api::{GetStorageClassResponse, ListStorageClassesResponse};

use super::JsonBody;
use crate::error::ApiResult;
use crate::state::AppState;

/// `POST /storageclass`
pub async fn add_storage_class(
    State(state): State<AppState>,
    JsonBody(config): JsonBody<StorageClassConfig>,
) -> ApiResult<(StatusCode, Json<GetStorageClassResponse>)> {
    let storage_class = state.orchestrator.add_storage_class(config).await?;
    Ok((StatusCode::CREATED, Json(GetStorageClassResponse { storage_class })))
}

/// `GET /storageclass`
pub async fn list_storage_classes(State(state): State<AppState>) -> ApiResult<Json<ListStorageClassesResponse>> {
    let classes = state.orchestrator.list_storage_classes().await?;
    Ok(Json(ListStorageClassesResponse {
        storage_classes: classes.into_iter().map(|sc| sc.config.name).collect(),
    }))
}

/// `GET /storageclass/{name}`
pub async fn get_storage_class(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<GetStorageClassResponse>> {
    let storage_class = state.orchestrator.get_storage_class(&name).await?;
    Ok(Json(GetStorageClassResponse { storage_class }))
}

/// `DELETE /storageclass/{name}`
pub async fn delete_storage_class(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.orchestrator.delete_storage_class(&name).await?;
    Ok(StatusCode::OK)
}
