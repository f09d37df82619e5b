use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{json_body, query_params, ApiResult};
use super::AppState;
use crate::db::{execute_async, now_secs};
use crate::services::node_registry;
use crate::types::{
    HeartbeatResponse, ListNodesResponse, Node, NodeFilter, NodeStats, RegisterNodeRequest,
    RegisterNodeResponse, ResourceReport, SetNodeStatusRequest, UpdateNodeRequest,
};

/// POST /api/v1/nodes/register - Register a node or refresh its registration
pub async fn register_node(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterNodeRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<RegisterNodeResponse>)> {
    let req = json_body(payload)?;
    info!(
        "Registering node: name={}, mac={}, public_ip={}",
        req.name, req.mac_address, req.public_ip
    );

    let response = execute_async(&state.db, move |conn| {
        node_registry::register_node(conn, &req, now_secs())
    })
    .await?;

    info!(node_id = %response.node_id, created = response.created, "Node registered");
    let status = if response.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

/// POST /api/v1/nodes/:id/heartbeat - Record liveness and resource usage
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    payload: Option<Json<ResourceReport>>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let report = payload.map(|Json(r)| r).unwrap_or_default();
    debug!(node_id = %node_id, "Heartbeat");
    let status = execute_async(&state.db, move |conn| {
        node_registry::heartbeat(conn, &node_id, &report, now_secs())
    })
    .await?;
    Ok(Json(HeartbeatResponse { status }))
}

/// GET /api/v1/nodes?status=&near=lat,lon&radiusKm= - List nodes
pub async fn list_nodes(
    State(state): State<Arc<AppState>>,
    filter: Result<Query<NodeFilter>, QueryRejection>,
) -> ApiResult<Json<ListNodesResponse>> {
    let filter = query_params(filter)?;
    let window = state.settings.liveness_window_secs;
    let nodes = execute_async(&state.db, move |conn| {
        node_registry::list_nodes(conn, &filter, now_secs(), window)
    })
    .await?;
    Ok(Json(ListNodesResponse { nodes }))
}

/// GET /api/v1/nodes/stats
pub async fn node_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<NodeStats>> {
    let window = state.settings.liveness_window_secs;
    let stats = execute_async(&state.db, move |conn| {
        node_registry::node_stats(conn, now_secs(), window)
    })
    .await?;
    Ok(Json(stats))
}

/// GET /api/v1/nodes/:id
pub async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<Node>> {
    let window = state.settings.liveness_window_secs;
    let node = execute_async(&state.db, move |conn| {
        node_registry::get_node(conn, &node_id, now_secs(), window)
    })
    .await?;
    Ok(Json(node))
}

/// PUT /api/v1/nodes/:id
pub async fn update_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    payload: Result<Json<UpdateNodeRequest>, JsonRejection>,
) -> ApiResult<Json<Node>> {
    let patch = json_body(payload)?;
    let window = state.settings.liveness_window_secs;
    let node = execute_async(&state.db, move |conn| {
        node_registry::update_node(conn, &node_id, &patch, now_secs(), window)
    })
    .await?;
    info!(node_id = %node.id, "Node updated");
    Ok(Json(node))
}

/// PUT /api/v1/nodes/:id/status - Administrative status override
pub async fn set_status(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    payload: Result<Json<SetNodeStatusRequest>, JsonRejection>,
) -> ApiResult<Json<Node>> {
    let req = json_body(payload)?;
    let window = state.settings.liveness_window_secs;
    let node = execute_async(&state.db, move |conn| {
        let now = now_secs();
        node_registry::set_status(conn, &node_id, req.status, now)?;
        node_registry::get_node(conn, &node_id, now, window)
    })
    .await?;
    info!(node_id = %node.id, status = %node.status, "Node status set");
    Ok(Json(node))
}

/// DELETE /api/v1/nodes/:id
pub async fn remove_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = node_id.clone();
    execute_async(&state.db, move |conn| node_registry::remove_node(conn, &id)).await?;
    info!(node_id = %node_id, "Node removed");
    Ok(StatusCode::NO_CONTENT)
}
