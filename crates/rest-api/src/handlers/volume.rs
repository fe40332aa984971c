use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use storage_core::VolumeConfig;
use storage_core::api::{
    GetVolumeResponse, ImportVolumeRequest, ListSnapshotsResponse, ListVolumePublicationsResponse, ListVolumesResponse,
    UpgradeVolumeRequest,
};
use tracing::info;

use super::JsonBody;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// `POST /volume`; a config naming a source volume is cloned
pub async fn add_volume(
    State(state): State<AppState>,
    JsonBody(config): JsonBody<VolumeConfig>,
) -> ApiResult<(StatusCode, Json<GetVolumeResponse>)> {
    let volume = if config.clone_source_volume.is_empty() {
        state.orchestrator.add_volume(config).await?
    } else {
        state.orchestrator.clone_volume(config).await?
    };
    Ok((StatusCode::CREATED, Json(GetVolumeResponse { volume })))
}

/// `GET /volume`
pub async fn list_volumes(State(state): State<AppState>) -> ApiResult<Json<ListVolumesResponse>> {
    let volumes = state.orchestrator.list_volumes().await?;
    Ok(Json(ListVolumesResponse {
        volumes: volumes.into_iter().map(|v| v.config.name).collect(),
    }))
}

/// `GET /volume/{volume}`
pub async fn get_volume(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<GetVolumeResponse>> {
    let volume = state.orchestrator.get_volume(&name).await?;
    Ok(Json(GetVolumeResponse { volume }))
}

/// `DELETE /volume/{volume}`
pub async fn delete_volume(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.orchestrator.delete_volume(&name).await?;
    Ok(StatusCode::OK)
}

/// `POST /volume/import`
///
/// Runs through the container orchestrator helper, which creates the claim
/// and waits for the volume to be bound.
pub async fn import_volume(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<ImportVolumeRequest>,
) -> ApiResult<(StatusCode, Json<GetVolumeResponse>)> {
    let helper = state.helper.as_ref().ok_or(ApiError::HelperUnavailable("volume import"))?;
    info!(backend = %request.backend, internal_name = %request.internal_name, "Importing volume");
    let volume = helper.import_volume(request).await?;
    Ok((StatusCode::CREATED, Json(GetVolumeResponse { volume })))
}

/// `POST /volume/{volume}/upgrade`
pub async fn upgrade_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
    JsonBody(mut request): JsonBody<UpgradeVolumeRequest>,
) -> ApiResult<Json<GetVolumeResponse>> {
    request.volume = name;
    let volume = match &state.helper {
        Some(helper) => helper.upgrade_volume(request).await?,
        None => state.orchestrator.upgrade_volume(request).await?,
    };
    Ok(Json(GetVolumeResponse { volume }))
}

/// `PUT /volume/{volume}/luksPassphraseNames`
pub async fn update_luks_passphrase_names(
    State(state): State<AppState>,
    Path(name): Path<String>,
    JsonBody(names): JsonBody<Vec<String>>,
) -> ApiResult<StatusCode> {
    state.orchestrator.update_volume_luks_passphrase_names(&name, names).await?;
    Ok(StatusCode::OK)
}

/// `GET /volume/{volume}/publication`
pub async fn list_publications_for_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ListVolumePublicationsResponse>> {
    let volume_publications = state.orchestrator.list_volume_publications_for_volume(&name).await?;
    Ok(Json(ListVolumePublicationsResponse { volume_publications }))
}

/// `GET /volume/{volume}/snapshot`
pub async fn list_snapshots_for_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ListSnapshotsResponse>> {
    let snapshots = state.orchestrator.list_snapshots_for_volume(&name).await?;
    Ok(Json(ListSnapshotsResponse {
        snapshots: snapshots.iter().map(|s| s.config.id()).collect(),
    }))
}
