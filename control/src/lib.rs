pub mod api;
pub mod cluster;
pub mod config;
pub mod db;
pub mod error;
pub mod github;
pub mod services;
pub mod tls;
pub mod types;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use api::{ApiSettings, AppState};
use cluster::{ClusterBackend, KubernetesCluster, SimulatedCluster};
use config::{Args, ClusterBackendKind};
use db::DbPool;
use github::{CredentialCache, GitHubClient, RepositorySource};
use services::{Collector, ConfigBuilder, Orchestrator};

/// Wire the cluster backend, repository source and services together.
pub fn build_state(args: &Args, db: DbPool) -> Result<Arc<AppState>> {
    let cluster: Arc<dyn ClusterBackend> = match args.cluster_backend {
        ClusterBackendKind::Simulated => Arc::new(SimulatedCluster::new()),
        ClusterBackendKind::Kubernetes => {
            Arc::new(KubernetesCluster::new(args.kubernetes_config())?)
        }
    };
    info!("Cluster backend: {}", cluster.name());

    let source: Arc<dyn RepositorySource> = Arc::new(GitHubClient::new(
        &args.github_api_url,
        args.orchestrator_config().cluster_timeout,
    )?);

    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        cluster.clone(),
        source.clone(),
        ConfigBuilder::new(args.builder_defaults()),
        args.orchestrator_config(),
    ));
    let collector = Arc::new(Collector::new(
        db.clone(),
        cluster.clone(),
        orchestrator.clone(),
        args.collector_config(),
    ));

    Ok(Arc::new(AppState {
        db,
        orchestrator,
        collector,
        cluster: cluster.clone(),
        source,
        credentials: CredentialCache::new(),
        settings: ApiSettings {
            liveness_window_secs: args.liveness_window_secs as i64,
            session_ttl_secs: args.session_ttl_secs,
            cluster_backend: args.cluster_backend.as_str().to_string(),
            cluster_timeout: args.orchestrator_config().cluster_timeout,
            cors_origins: args.cors_origins.clone(),
        },
    }))
}
