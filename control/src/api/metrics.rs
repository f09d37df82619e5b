use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use std::sync::Arc;

use super::error::{query_params, ApiResult};
use super::k8s::NamespaceQuery;
use super::AppState;
use crate::cluster::PodSummary;
use crate::services::collector::{ClusterMetrics, DeploymentMetrics};

/// GET /api/v1/metrics/cluster - Snapshot cached by the cluster-wide pass
pub async fn cluster_metrics(State(state): State<Arc<AppState>>) -> ApiResult<Json<ClusterMetrics>> {
    Ok(Json(state.collector.cluster_metrics().await?))
}

/// GET /api/v1/metrics/pods?namespace=
pub async fn pod_metrics(
    State(state): State<Arc<AppState>>,
    query: Result<Query<NamespaceQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<PodSummary>>> {
    let namespace = query_params(query)?
        .namespace
        .filter(|ns| !ns.trim().is_empty());
    Ok(Json(state.collector.pod_metrics(namespace).await?))
}

/// GET /api/v1/metrics/deployments/:namespace/:name
pub async fn deployment_metrics(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<DeploymentMetrics>> {
    Ok(Json(
        state
            .collector
            .deployment_metrics(&namespace, &name)
            .await?,
    ))
}
