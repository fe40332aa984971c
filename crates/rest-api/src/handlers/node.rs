use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use storage_core::Node;
use storage_core::api::{
    AddNodeResponse, GetNodeResponse, ListNodesResponse, ListVolumePublicationsResponse, NodePublicationStateUpdate,
};
use tracing::info;

use super::JsonBody;
use crate::error::ApiResult;
use crate::state::AppState;

/// `PUT /node/{node}`; registers or refreshes a node
pub async fn add_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
    JsonBody(mut node): JsonBody<Node>,
) -> ApiResult<Json<AddNodeResponse>> {
    node.name = name;
    let node = state.orchestrator.add_node(node).await?;
    info!(node = %node.name, state = ?node.publication_state, "Node registered");
    Ok(Json(AddNodeResponse {
        name: node.name,
        topology_labels: node.topology_labels,
    }))
}

/// `GET /node`
pub async fn list_nodes(State(state): State<AppState>) -> ApiResult<Json<ListNodesResponse>> {
    let nodes = state.orchestrator.list_nodes().await?;
    Ok(Json(ListNodesResponse {
        nodes: nodes.into_iter().map(|n| n.name).collect(),
    }))
}

/// `GET /node/{node}`
pub async fn get_node(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<GetNodeResponse>> {
    let node = state.orchestrator.get_node(&name).await?;
    Ok(Json(GetNodeResponse { node }))
}

/// `DELETE /node/{node}`
pub async fn delete_node(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.orchestrator.delete_node(&name).await?;
    Ok(StatusCode::OK)
}

/// `PUT /node/{node}/publication`
pub async fn update_publication_state(
    State(state): State<AppState>,
    Path(name): Path<String>,
    JsonBody(update): JsonBody<NodePublicationStateUpdate>,
) -> ApiResult<Json<GetNodeResponse>> {
    let node = state
        .orchestrator
        .update_node_publication_state(&name, update.publication_state)
        .await?;
    Ok(Json(GetNodeResponse { node }))
}

/// `GET /node/{node}/publication`
pub async fn list_publications_for_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ListVolumePublicationsResponse>> {
    let volume_publications = state.orchestrator.list_volume_publications_for_node(&name).await?;
    Ok(Json(ListVolumePublicationsResponse { volume_publications }))
}
