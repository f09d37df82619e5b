pub mod auth;
pub mod deployments;
pub mod error;
pub mod github;
pub mod k8s;
pub mod metrics;
pub mod nodes;

use axum::{
    http::{HeaderValue, StatusCode},
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::cluster::ClusterBackend;
use crate::db::DbPool;
use crate::github::{CredentialCache, RepositorySource};
use crate::services::{Collector, Orchestrator};
use crate::types::HealthResponse;

/// Knobs the handlers need beyond the services themselves.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub liveness_window_secs: i64,
    pub session_ttl_secs: i64,
    pub cluster_backend: String,
    pub cluster_timeout: Duration,
    pub cors_origins: Vec<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            liveness_window_secs: 30,
            session_ttl_secs: 86_400,
            cluster_backend: "simulated".to_string(),
            cluster_timeout: Duration::from_secs(10),
            cors_origins: Vec::new(),
        }
    }
}

pub struct AppState {
    pub db: DbPool,
    pub orchestrator: Arc<Orchestrator>,
    pub collector: Arc<Collector>,
    pub cluster: Arc<dyn ClusterBackend>,
    pub source: Arc<dyn RepositorySource>,
    pub credentials: CredentialCache,
    pub settings: ApiSettings,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    // Agent-facing and session bootstrap routes
    let public = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/nodes/register", post(nodes::register_node))
        .route("/nodes/:id/heartbeat", post(nodes::heartbeat));

    let protected = Router::new()
        .route("/auth/validate", get(auth::validate))
        .route("/auth/logout", post(auth::logout))
        // Node management
        .route("/nodes", get(nodes::list_nodes))
        .route("/nodes/stats", get(nodes::node_stats))
        .route(
            "/nodes/:id",
            get(nodes::get_node)
                .put(nodes::update_node)
                .delete(nodes::remove_node),
        )
        .route("/nodes/:id/status", put(nodes::set_status))
        // Deployments
        .route(
            "/deployments",
            post(deployments::create_deployment).get(deployments::list_deployments),
        )
        .route("/deployments/stats", get(deployments::deployment_stats))
        .route("/deployments/node/:node_id", get(deployments::list_by_node))
        .route(
            "/deployments/:id",
            get(deployments::get_deployment)
                .put(deployments::update_deployment)
                .delete(deployments::delete_deployment),
        )
        .route("/deployments/:id/restart", post(deployments::restart_deployment))
        .route("/deployments/:id/scale", post(deployments::scale_deployment))
        // GitHub
        .route("/github/repos", get(github::list_repositories))
        .route("/github/repos/:owner/:repo", get(github::get_repository))
        .route("/github/repos/:owner/:repo/branches", get(github::list_branches))
        .route("/github/search", get(github::search_repositories))
        .route("/github/token", post(github::store_token))
        // Cluster introspection
        .route("/k8s/cluster/info", get(k8s::cluster_info))
        .route("/k8s/namespaces", get(k8s::namespaces))
        .route("/k8s/pods", get(k8s::pods))
        .route("/k8s/pods/:namespace/:name/logs", get(k8s::pod_logs))
        .route("/k8s/services", get(k8s::services))
        .route("/k8s/nodes", get(k8s::nodes))
        .route("/k8s/events", get(k8s::events))
        // Metrics
        .route("/metrics/cluster", get(metrics::cluster_metrics))
        .route("/metrics/pods", get(metrics::pod_metrics))
        .route(
            "/metrics/deployments/:namespace/:name",
            get(metrics::deployment_metrics),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ));

    let cors = cors_layer(&state.settings.cors_origins);

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", public.merge(protected))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter(|o| !o.trim().is_empty())
        .filter_map(|o| match HeaderValue::from_str(o.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();
    if allowed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(allowed)
    }
}

/// GET /health - Health check endpoint
async fn health(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            cluster_backend: state.settings.cluster_backend.clone(),
        }),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cluster::SimulatedCluster;
    use crate::db::test_pool;
    use crate::github::fake::StaticSource;
    use crate::services::collector::CollectorConfig;
    use crate::services::orchestrator::tests::fast_config;
    use crate::services::ConfigBuilder;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    pub(crate) struct TestApp {
        pub _dir: tempfile::TempDir,
        pub router: Router,
        pub cluster: Arc<SimulatedCluster>,
        pub state: Arc<AppState>,
    }

    pub(crate) fn test_app() -> TestApp {
        let (dir, db) = test_pool();
        let cluster = Arc::new(SimulatedCluster::new());
        let source: Arc<dyn RepositorySource> = Arc::new(StaticSource {
            rejected_tokens: vec!["revoked".to_string()],
        });
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            cluster.clone(),
            source.clone(),
            ConfigBuilder::default(),
            fast_config(),
        ));
        let collector = Arc::new(Collector::new(
            db.clone(),
            cluster.clone(),
            orchestrator.clone(),
            CollectorConfig {
                call_timeout: Duration::from_millis(200),
                ..CollectorConfig::default()
            },
        ));
        let state = Arc::new(AppState {
            db,
            orchestrator,
            collector,
            cluster: cluster.clone(),
            source,
            credentials: CredentialCache::new(),
            settings: ApiSettings::default(),
        });
        TestApp {
            _dir: dir,
            router: create_router(state.clone()),
            cluster,
            state,
        }
    }

    impl TestApp {
        pub(crate) async fn call(
            &self,
            method: Method,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            self.call_with(method, uri, token, body, &[]).await
        }

        pub(crate) async fn call_with(
            &self,
            method: Method,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
            headers: &[(&str, &str)],
        ) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
            }
            for (name, value) in headers {
                builder = builder.header(*name, *value);
            }
            let request = match body {
                Some(body) => builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            (status, value)
        }

        /// Register a user and return a session token.
        pub(crate) async fn login(&self) -> String {
            let (status, _) = self
                .call(
                    Method::POST,
                    "/api/v1/auth/register",
                    None,
                    Some(json!({
                        "email": "ops@example.com",
                        "username": "ops",
                        "password": "hunter2hunter2",
                        "fullName": "Ops"
                    })),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);
            let (status, body) = self
                .call(
                    Method::POST,
                    "/api/v1/auth/login",
                    None,
                    Some(json!({"email": "ops@example.com", "password": "hunter2hunter2"})),
                )
                .await;
            assert_eq!(status, StatusCode::OK);
            body["token"].as_str().unwrap().to_string()
        }

        pub(crate) async fn register_node(&self, name: &str, mac: &str) -> String {
            let (status, body) = self
                .call(
                    Method::POST,
                    "/api/v1/nodes/register",
                    None,
                    Some(json!({
                        "name": name,
                        "macAddress": mac,
                        "publicIp": "10.0.0.7",
                        "capacity": {"cpuCores": 4, "memoryBytes": 8_589_934_592u64}
                    })),
                )
                .await;
            assert!(status.is_success(), "register failed: {}", body);
            body["nodeId"].as_str().unwrap().to_string()
        }
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = test_app();
        let (status, body) = app.call(Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["cluster_backend"], "simulated");
    }

    #[tokio::test]
    async fn test_protected_routes_require_bearer() {
        let app = test_app();
        let (status, body) = app.call(Method::GET, "/api/v1/nodes", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_code"], "UNAUTHORIZED");

        let (status, _) = app
            .call(Method::GET, "/api/v1/deployments", Some("bogus"), None)
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_cors_layer_accepts_bad_origins() {
        let _ = cors_layer(&["http://ok.test".to_string(), "bad\norigin".to_string()]);
        let _ = cors_layer(&[]);
    }
}
