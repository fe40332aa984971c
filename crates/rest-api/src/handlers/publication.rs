use axum::Json;
use axum::extract::{Path, State};
use storage_core::api::{
    GetChapResponse, GetVolumePublicationResponse, ListVolumePublicationsResponse, VolumePublicationUpdate,
};

use super::JsonBody;
use crate::error::ApiResult;
use crate::state::AppState;

/// `GET /publication`
pub async fn list_publications(State(state): State<AppState>) -> ApiResult<Json<ListVolumePublicationsResponse>> {
    let volume_publications = state.orchestrator.list_volume_publications().await?;
    Ok(Json(ListVolumePublicationsResponse { volume_publications }))
}

/// `GET /publication/{volume}/{node}`
pub async fn get_publication(
    State(state): State<AppState>,
    Path((volume, node)): Path<(String, String)>,
) -> ApiResult<Json<GetVolumePublicationResponse>> {
    let volume_publication = state.orchestrator.get_volume_publication(&volume, &node).await?;
    Ok(Json(GetVolumePublicationResponse { volume_publication }))
}

/// `PUT /publication/{volume}/{node}`
///
/// Only the node-reported flags change; everything else on the publication
/// is owned by the controller.
pub async fn update_publication(
    State(state): State<AppState>,
    Path((volume, node)): Path<(String, String)>,
    JsonBody(update): JsonBody<VolumePublicationUpdate>,
) -> ApiResult<Json<GetVolumePublicationResponse>> {
    let volume_publication = state
        .orchestrator
        .update_volume_publication(&volume, &node, update.not_safe_to_attach)
        .await?;
    Ok(Json(GetVolumePublicationResponse { volume_publication }))
}

/// `GET /chap/{volume}/{node}`
pub async fn get_chap(
    State(state): State<AppState>,
    Path((volume, node)): Path<(String, String)>,
) -> ApiResult<Json<GetChapResponse>> {
    let chap = state.orchestrator.get_chap(&volume, &node).await?;
    Ok(Json(GetChapResponse { chap }))
}
