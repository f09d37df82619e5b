use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::auth::CurrentUser;
use super::error::{json_body, query_params, ApiResult};
use super::github::{optional_credential, require_credential};
use super::AppState;
use crate::error::DeployError;
use crate::types::{
    CreateDeploymentRequest, CreateDeploymentResponse, DeleteDeploymentResponse, DeleteOutcome,
    Deployment, DeploymentFilter, DeploymentStats, DeploymentStatus, ListDeploymentsResponse,
    ScaleRequest, UpdateDeploymentRequest,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeQuery {
    pub node_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub node_id: Option<String>,
    pub status: Option<DeploymentStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub purge: bool,
}

/// POST /api/v1/deployments?nodeId= - Accept a deployment; it proceeds in the background
pub async fn create_deployment(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    query: Result<Query<NodeQuery>, QueryRejection>,
    headers: HeaderMap,
    payload: Result<Json<CreateDeploymentRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreateDeploymentResponse>)> {
    let node_id = query_params(query)?
        .node_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| DeployError::validation("nodeId", "query parameter is required"))?;
    let req = json_body(payload)?;
    let credential = require_credential(&state, &headers, &user).await?;

    let created = state
        .orchestrator
        .create(Some(user.id.clone()), &node_id, req, credential)
        .await?;
    info!(deployment_id = %created.id, user = %user.username, "Deployment accepted");
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/v1/deployments - The caller's deployments
pub async fn list_deployments(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<ListDeploymentsResponse>> {
    let query = query_params(query)?;
    let deployments = state
        .orchestrator
        .list(DeploymentFilter {
            user_id: Some(user.id),
            node_id: query.node_id,
            status: query.status,
        })
        .await?;
    Ok(Json(ListDeploymentsResponse { deployments }))
}

/// GET /api/v1/deployments/stats?nodeId=
pub async fn deployment_stats(
    State(state): State<Arc<AppState>>,
    query: Result<Query<NodeQuery>, QueryRejection>,
) -> ApiResult<Json<DeploymentStats>> {
    let query = query_params(query)?;
    Ok(Json(state.orchestrator.stats(query.node_id).await?))
}

/// GET /api/v1/deployments/node/:node_id
pub async fn list_by_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<ListDeploymentsResponse>> {
    let deployments = state
        .orchestrator
        .list(DeploymentFilter {
            node_id: Some(node_id),
            ..Default::default()
        })
        .await?;
    Ok(Json(ListDeploymentsResponse { deployments }))
}

/// GET /api/v1/deployments/:id
pub async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Deployment>> {
    Ok(Json(state.orchestrator.get(&id).await?))
}

/// PUT /api/v1/deployments/:id
pub async fn update_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateDeploymentRequest>, JsonRejection>,
) -> ApiResult<Json<Deployment>> {
    let patch = json_body(payload)?;
    Ok(Json(state.orchestrator.update(&id, patch).await?))
}

/// DELETE /api/v1/deployments/:id?purge=true
pub async fn delete_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    query: Result<Query<DeleteQuery>, QueryRejection>,
) -> ApiResult<(StatusCode, Json<DeleteDeploymentResponse>)> {
    let purge = query_params(query)?.purge;
    let outcome = state.orchestrator.delete(&id, purge).await?;
    let status = match outcome {
        DeleteOutcome::Deferred => StatusCode::ACCEPTED,
        DeleteOutcome::Stopped | DeleteOutcome::AlreadyStopped => StatusCode::OK,
    };
    Ok((status, Json(DeleteDeploymentResponse { id, outcome })))
}

/// POST /api/v1/deployments/:id/restart
pub async fn restart_deployment(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Deployment>> {
    let credential = optional_credential(&state, &headers, &user).await;
    Ok(Json(state.orchestrator.restart(&id, credential).await?))
}

/// POST /api/v1/deployments/:id/scale
pub async fn scale_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<ScaleRequest>, JsonRejection>,
) -> ApiResult<Json<Deployment>> {
    let req = json_body(payload)?;
    Ok(Json(state.orchestrator.scale(&id, req.replicas).await?))
}
