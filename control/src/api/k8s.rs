//! Read-only cluster introspection.

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

use super::error::{query_params, ApiResult};
use super::AppState;
use crate::cluster::{
    with_timeout, ClusterError, ClusterInfoSummary, ClusterNodeSummary, EventSummary,
    NamespaceSummary, PodSummary, ServiceSummary,
};
use crate::services::collector::cluster_to_deploy;

#[derive(Debug, Default, Deserialize)]
pub struct NamespaceQuery {
    pub namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct PodLogs {
    pub namespace: String,
    pub pod: String,
    pub logs: String,
}

async fn bounded<T, F>(state: &AppState, what: &str, fut: F) -> ApiResult<T>
where
    F: Future<Output = Result<T, ClusterError>>,
{
    with_timeout(state.settings.cluster_timeout, what, fut)
        .await
        .map_err(|e| cluster_to_deploy(e).into())
}

fn namespace_of(query: Result<Query<NamespaceQuery>, QueryRejection>) -> ApiResult<Option<String>> {
    Ok(query_params(query)?
        .namespace
        .filter(|ns| !ns.trim().is_empty()))
}

/// GET /api/v1/k8s/cluster/info
pub async fn cluster_info(State(state): State<Arc<AppState>>) -> ApiResult<Json<ClusterInfoSummary>> {
    Ok(Json(
        bounded(&state, "cluster info", state.cluster.cluster_info()).await?,
    ))
}

/// GET /api/v1/k8s/namespaces
pub async fn namespaces(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<NamespaceSummary>>> {
    Ok(Json(
        bounded(&state, "list namespaces", state.cluster.namespaces()).await?,
    ))
}

/// GET /api/v1/k8s/pods?namespace=
pub async fn pods(
    State(state): State<Arc<AppState>>,
    query: Result<Query<NamespaceQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<PodSummary>>> {
    let namespace = namespace_of(query)?;
    Ok(Json(
        bounded(&state, "list pods", state.cluster.pods(namespace.as_deref())).await?,
    ))
}

/// GET /api/v1/k8s/pods/:namespace/:name/logs?tail=
pub async fn pod_logs(
    State(state): State<Arc<AppState>>,
    Path((namespace, pod)): Path<(String, String)>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> ApiResult<Json<PodLogs>> {
    let tail = query_params(query)?.tail;
    let logs = bounded(
        &state,
        "pod logs",
        state.cluster.pod_logs(&namespace, &pod, tail),
    )
    .await?;
    Ok(Json(PodLogs {
        namespace,
        pod,
        logs,
    }))
}

/// GET /api/v1/k8s/services?namespace=
pub async fn services(
    State(state): State<Arc<AppState>>,
    query: Result<Query<NamespaceQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<ServiceSummary>>> {
    let namespace = namespace_of(query)?;
    Ok(Json(
        bounded(
            &state,
            "list services",
            state.cluster.services(namespace.as_deref()),
        )
        .await?,
    ))
}

/// GET /api/v1/k8s/nodes
pub async fn nodes(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<ClusterNodeSummary>>> {
    Ok(Json(
        bounded(&state, "list nodes", state.cluster.nodes()).await?,
    ))
}

/// GET /api/v1/k8s/events?namespace=
pub async fn events(
    State(state): State<Arc<AppState>>,
    query: Result<Query<NamespaceQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<EventSummary>>> {
    let namespace = namespace_of(query)?;
    Ok(Json(
        bounded(&state, "list events", state.cluster.events(namespace.as_deref())).await?,
    ))
}

#[cfg(test)]
mod tests {
    use crate::api::tests::test_app;
    use crate::cluster::simulated::SimOp;
    use crate::cluster::ClusterError;
    use axum::http::{Method, StatusCode};

    #[tokio::test]
    async fn test_introspection_routes() {
        let app = test_app();
        let token = app.login().await;

        let (status, body) = app
            .call(Method::GET, "/api/v1/k8s/cluster/info", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "simulated");

        for path in ["namespaces", "pods", "services", "nodes", "events"] {
            let (status, body) = app
                .call(Method::GET, &format!("/api/v1/k8s/{}", path), Some(&token), None)
                .await;
            assert_eq!(status, StatusCode::OK, "{}", path);
            assert!(body.is_array(), "{}", path);
        }

        let (status, body) = app
            .call(
                Method::GET,
                "/api/v1/k8s/pods/default/ghost/logs?tail=5",
                Some(&token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_transient_cluster_error_is_503() {
        let app = test_app();
        let token = app.login().await;
        app.cluster
            .fail_next(SimOp::Snapshot, ClusterError::Transient("api busy".to_string()));
        let (status, body) = app
            .call(Method::GET, "/api/v1/metrics/cluster", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error_code"], "CLUSTER_UNAVAILABLE");
    }
}
