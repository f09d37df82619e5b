//! Reconciliation and metrics collection.
//!
//! Two loops: a cluster-wide one (snapshot cache, node usage) and a
//! per-deployment one (pod counts, usage, health signals). The collector
//! writes only observed fields; status decisions go to the orchestrator.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cluster::{with_timeout, ClusterBackend, ClusterError, ClusterSnapshot, PodSummary};
use crate::db::{execute_async, now_secs, DbPool};
use crate::error::{DeployError, DeployResult};
use crate::services::orchestrator::{HealthSignal, Orchestrator};
use crate::services::{deployment_store, node_registry};
use crate::types::{
    Deployment, DeploymentStatus, Freshness, MetricsSnapshot, Node, NodeFilter, NodeObservation,
    NodeStatus,
};

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub cluster_interval: Duration,
    pub deployment_interval: Duration,
    pub liveness_window: Duration,
    pub call_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            cluster_interval: Duration::from_secs(10),
            deployment_interval: Duration::from_secs(10),
            liveness_window: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadHealth {
    Healthy,
    Degraded,
    Unavailable,
}

pub fn classify_health(available: u32, desired: u32) -> WorkloadHealth {
    if available == 0 {
        WorkloadHealth::Unavailable
    } else if available >= desired {
        WorkloadHealth::Healthy
    } else {
        WorkloadHealth::Degraded
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetrics {
    pub freshness: Freshness,
    pub observed_at: Option<i64>,
    #[serde(flatten)]
    pub snapshot: ClusterSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentMetrics {
    pub deployment_id: Option<String>,
    pub name: String,
    pub namespace: String,
    pub status: Option<DeploymentStatus>,
    pub desired_replicas: u32,
    pub ready_replicas: u32,
    pub available_replicas: u32,
    pub health: WorkloadHealth,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub restart_count: u32,
    pub observed_at: i64,
}

pub struct Collector {
    db: DbPool,
    cluster: Arc<dyn ClusterBackend>,
    orchestrator: Arc<Orchestrator>,
    config: CollectorConfig,
    /// Consecutive zero-ready passes, reset whenever the status changes.
    streaks: Mutex<HashMap<String, (DeploymentStatus, u32)>>,
    cluster_cache: RwLock<Option<ClusterMetrics>>,
}

impl Collector {
    pub fn new(
        db: DbPool,
        cluster: Arc<dyn ClusterBackend>,
        orchestrator: Arc<Orchestrator>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            db,
            cluster,
            orchestrator,
            config,
            streaks: Mutex::new(HashMap::new()),
            cluster_cache: RwLock::new(None),
        }
    }

    fn window_secs(&self) -> i64 {
        self.config.liveness_window.as_secs() as i64
    }

    /// Cluster-wide loop: snapshot plus every node's usage.
    pub async fn run_cluster_loop(self: Arc<Self>) {
        info!(
            "Starting cluster collector (interval {:?})",
            self.config.cluster_interval
        );
        let mut ticker = tokio::time::interval(self.config.cluster_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.cluster_pass().await {
                warn!("Cluster collection pass failed: {}", e);
            }
        }
    }

    /// Per-deployment loop over everything deploying or running.
    pub async fn run_deployment_loop(self: Arc<Self>) {
        info!(
            "Starting deployment collector (interval {:?})",
            self.config.deployment_interval
        );
        let mut ticker = tokio::time::interval(self.config.deployment_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.deployment_pass().await {
                warn!("Deployment collection pass failed: {}", e);
            }
        }
    }

    pub async fn cluster_pass(&self) -> DeployResult<()> {
        self.refresh_cluster_snapshot().await;

        let window = self.window_secs();
        let nodes = execute_async(&self.db, move |conn| {
            node_registry::list_nodes(conn, &NodeFilter::default(), now_secs(), window)
        })
        .await?;
        let results = join_all(nodes.iter().map(|node| self.refresh_node_record(node))).await;
        for (node, result) in nodes.iter().zip(results) {
            if let Err(e) = result {
                warn!(node_id = %node.id, "Node refresh failed: {}", e);
            }
        }
        Ok(())
    }

    pub async fn deployment_pass(&self) -> DeployResult<()> {
        let deployments = execute_async(&self.db, |conn| {
            deployment_store::list_observed(conn).map_err(DeployError::from)
        })
        .await?;
        self.forget_unobserved(&deployments);

        let results = join_all(
            deployments
                .iter()
                .map(|d| self.refresh_deployment_record(d)),
        )
        .await;
        for (deployment, result) in deployments.iter().zip(results) {
            if let Err(e) = result {
                warn!(deployment_id = %deployment.id, "Deployment refresh failed: {}", e);
            }
        }
        Ok(())
    }

    fn forget_unobserved(&self, observed: &[Deployment]) {
        let mut streaks = self.streaks.lock().unwrap_or_else(|e| e.into_inner());
        streaks.retain(|id, _| observed.iter().any(|d| &d.id == id));
    }

    async fn refresh_cluster_snapshot(&self) {
        let result = with_timeout(self.config.call_timeout, "cluster snapshot", self.cluster.snapshot()).await;
        let mut cache = self.cluster_cache.write().await;
        match result {
            Ok(snapshot) => {
                *cache = Some(ClusterMetrics {
                    freshness: Freshness::Fresh,
                    observed_at: Some(now_secs()),
                    snapshot,
                });
            }
            Err(e) => {
                debug!("Cluster snapshot unavailable: {}", e);
                if let Some(cached) = cache.as_mut() {
                    cached.freshness = Freshness::Stale;
                }
            }
        }
    }

    /// Latest cluster snapshot; fetched on demand before the first pass.
    pub async fn cluster_metrics(&self) -> DeployResult<ClusterMetrics> {
        if let Some(cached) = self.cluster_cache.read().await.clone() {
            return Ok(cached);
        }
        self.refresh_cluster_snapshot().await;
        self.cluster_cache
            .read()
            .await
            .clone()
            .ok_or_else(|| DeployError::TransientCluster("cluster metrics not available yet".to_string()))
    }

    pub async fn pod_metrics(&self, namespace: Option<String>) -> DeployResult<Vec<PodSummary>> {
        with_timeout(
            self.config.call_timeout,
            "list pods",
            self.cluster.pods(namespace.as_deref()),
        )
        .await
        .map_err(cluster_to_deploy)
    }

    /// Live replica and usage figures for one workload.
    pub async fn deployment_metrics(&self, namespace: &str, name: &str) -> DeployResult<DeploymentMetrics> {
        let status = with_timeout(
            self.config.call_timeout,
            "workload status",
            self.cluster.workload_status(namespace, name),
        )
        .await
        .map_err(cluster_to_deploy)?;

        let (ns, n) = (namespace.to_string(), name.to_string());
        let deployment = execute_async(&self.db, move |conn| {
            deployment_store::find_by_workload(conn, &ns, &n).map_err(DeployError::from)
        })
        .await?;

        Ok(DeploymentMetrics {
            deployment_id: deployment.as_ref().map(|d| d.id.clone()),
            name: name.to_string(),
            namespace: namespace.to_string(),
            status: deployment.as_ref().map(|d| d.status),
            desired_replicas: status.desired_replicas,
            ready_replicas: status.ready_pods,
            available_replicas: status.available_replicas,
            health: classify_health(status.available_replicas, status.desired_replicas),
            cpu_percent: status.cpu_percent,
            memory_percent: status.memory_percent,
            restart_count: status.restart_count,
            observed_at: now_secs(),
        })
    }

    /// Refresh one node's observed usage.
    pub async fn refresh_node(&self, node_id: &str) -> DeployResult<NodeObservation> {
        let window = self.window_secs();
        let node_id = node_id.to_string();
        let node = execute_async(&self.db, move |conn| {
            node_registry::get_node(conn, &node_id, now_secs(), window)
        })
        .await?;
        self.refresh_node_record(&node).await
    }

    async fn refresh_node_record(&self, node: &Node) -> DeployResult<NodeObservation> {
        let observation = if node.status == NodeStatus::Offline {
            node.observed.clone().into_stale("node offline")
        } else {
            match with_timeout(
                self.config.call_timeout,
                "node usage",
                self.cluster.node_usage(&node.name),
            )
            .await
            {
                Ok(usage) => NodeObservation {
                    freshness: Freshness::Fresh,
                    cpu_percent: usage.cpu_percent,
                    memory_percent: usage.memory_percent,
                    pods_running: usage.pods_running,
                    observed_at: Some(now_secs()),
                    stale_reason: None,
                },
                Err(e) => node.observed.clone().into_stale(e.to_string()),
            }
        };

        let node_id = node.id.clone();
        let stored = observation.clone();
        execute_async(&self.db, move |conn| {
            node_registry::record_observation(conn, &node_id, &stored).map_err(DeployError::from)
        })
        .await?;
        Ok(observation)
    }

    /// Refresh one deployment's metrics snapshot and report its health.
    pub async fn refresh_deployment(&self, id: &str) -> DeployResult<MetricsSnapshot> {
        let deployment = self.orchestrator.get(id).await?;
        self.refresh_deployment_record(&deployment).await
    }

    async fn refresh_deployment_record(&self, deployment: &Deployment) -> DeployResult<MetricsSnapshot> {
        let window = self.window_secs();
        let node_id = deployment.node_id.clone();
        let node = execute_async(&self.db, move |conn| {
            node_registry::get_node(conn, &node_id, now_secs(), window)
        })
        .await;

        let node_offline = match &node {
            Ok(node) => node.status == NodeStatus::Offline,
            Err(DeployError::NotFound(_)) => true,
            Err(_) => false,
        };

        // Telemetry from a silent node cannot be trusted; status is left alone
        if node_offline {
            let snapshot = deployment.metrics.clone().into_stale("node offline");
            self.store_metrics(&deployment.id, &snapshot).await?;
            return Ok(snapshot);
        }

        let observed = with_timeout(
            self.config.call_timeout,
            "workload status",
            self.cluster
                .workload_status(&deployment.namespace, &deployment.name),
        )
        .await;

        let (snapshot, signal) = match observed {
            Ok(status) => {
                let passes = self.track(deployment, status.ready_pods);
                let snapshot = MetricsSnapshot {
                    freshness: Freshness::Fresh,
                    desired_pods: Some(status.desired_replicas),
                    active_pods: Some(status.active_pods),
                    ready_pods: Some(status.ready_pods),
                    cpu_percent: status.cpu_percent,
                    memory_percent: status.memory_percent,
                    restart_count: Some(status.restart_count),
                    observed_at: Some(now_secs()),
                    stale_reason: None,
                };
                let signal = HealthSignal {
                    ready_pods: status.ready_pods,
                    desired_replicas: status.desired_replicas,
                    unhealthy_passes: passes,
                };
                (snapshot, Some(signal))
            }
            Err(ClusterError::NotFound(msg)) => {
                // A vanished workload has zero ready pods; its replica target is not drift
                let passes = self.track(deployment, 0);
                let signal = HealthSignal {
                    ready_pods: 0,
                    desired_replicas: deployment.configuration.replicas,
                    unhealthy_passes: passes,
                };
                (
                    deployment.metrics.clone().into_stale(format!("workload not found: {}", msg)),
                    Some(signal),
                )
            }
            Err(e) => (deployment.metrics.clone().into_stale(e.to_string()), None),
        };

        self.store_metrics(&deployment.id, &snapshot).await?;
        if let Some(signal) = signal {
            self.orchestrator
                .on_health_signal(&deployment.id, signal)
                .await?;
        }
        Ok(snapshot)
    }

    /// Update the zero-ready streak for a deployment and return it.
    fn track(&self, deployment: &Deployment, ready_pods: u32) -> u32 {
        let mut streaks = self.streaks.lock().unwrap_or_else(|e| e.into_inner());
        let entry = streaks
            .entry(deployment.id.clone())
            .or_insert((deployment.status, 0));
        if entry.0 != deployment.status {
            *entry = (deployment.status, 0);
        }
        if ready_pods == 0 {
            entry.1 += 1;
        } else {
            entry.1 = 0;
        }
        entry.1
    }

    async fn store_metrics(&self, id: &str, snapshot: &MetricsSnapshot) -> DeployResult<()> {
        let id = id.to_string();
        let snapshot = snapshot.clone();
        execute_async(&self.db, move |conn| {
            deployment_store::record_metrics(conn, &id, &snapshot, now_secs())
                .map_err(DeployError::from)
        })
        .await
    }
}

pub fn cluster_to_deploy(err: ClusterError) -> DeployError {
    match err {
        ClusterError::Transient(msg) => DeployError::TransientCluster(msg),
        ClusterError::NotFound(msg) => DeployError::NotFound(msg),
        ClusterError::Failed(msg) | ClusterError::Fatal(msg) => DeployError::FatalCluster(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::simulated::SimOp;
    use crate::services::orchestrator::tests::{demo_request, harness, wait_idle, Harness};
    use crate::types::Credential;

    fn collector(h: &Harness) -> Collector {
        Collector::new(
            h.db.clone(),
            h.cluster.clone(),
            h.orchestrator.clone(),
            CollectorConfig {
                call_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
    }

    async fn deployed(h: &Harness) -> String {
        let created = h
            .orchestrator
            .create(None, &h.node_id, demo_request(2), Credential::new("t"))
            .await
            .unwrap();
        wait_idle(&h.orchestrator, &created.id).await;
        created.id
    }

    #[test]
    fn test_health_classification() {
        assert_eq!(classify_health(2, 2), WorkloadHealth::Healthy);
        assert_eq!(classify_health(1, 2), WorkloadHealth::Degraded);
        assert_eq!(classify_health(0, 2), WorkloadHealth::Unavailable);
    }

    #[tokio::test]
    async fn test_pass_moves_deploying_to_running_with_metrics() {
        let h = harness();
        let id = deployed(&h).await;
        let c = collector(&h);

        let snapshot = c.refresh_deployment(&id).await.unwrap();
        assert_eq!(snapshot.freshness, Freshness::Fresh);
        assert_eq!(snapshot.ready_pods, Some(2));

        let d = h.orchestrator.get(&id).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Running);
        assert!(!d.metrics.is_empty());
        assert!(d.last_health_check_at.is_some());
    }

    #[tokio::test]
    async fn test_unhealthy_running_fails_after_threshold() {
        let h = harness();
        let id = deployed(&h).await;
        let c = collector(&h);
        c.refresh_deployment(&id).await.unwrap();

        h.cluster.set_healthy("node-deployer-apps", "demo", false);
        for _ in 0..2 {
            c.refresh_deployment(&id).await.unwrap();
            assert_eq!(
                h.orchestrator.get(&id).await.unwrap().status,
                DeploymentStatus::Running
            );
        }
        c.refresh_deployment(&id).await.unwrap();
        assert_eq!(
            h.orchestrator.get(&id).await.unwrap().status,
            DeploymentStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_silent_node_marks_metrics_stale_without_status_change() {
        let h = harness();
        let id = deployed(&h).await;
        let c = collector(&h);
        c.refresh_deployment(&id).await.unwrap();

        let conn = h.db.get().unwrap();
        conn.execute(
            "UPDATE nodes SET last_seen_at = ?1 WHERE id = ?2",
            rusqlite::params![now_secs() - 600, h.node_id],
        )
        .unwrap();

        let snapshot = c.refresh_deployment(&id).await.unwrap();
        assert_eq!(snapshot.freshness, Freshness::Stale);
        assert_eq!(snapshot.ready_pods, Some(2));
        assert_eq!(snapshot.stale_reason.as_deref(), Some("node offline"));

        let d = h.orchestrator.get(&id).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Running);
        assert_eq!(d.metrics.freshness, Freshness::Stale);

        let node = c.refresh_node(&h.node_id).await.unwrap();
        assert_eq!(node.stale_reason.as_deref(), Some("node offline"));
    }

    #[tokio::test]
    async fn test_failed_telemetry_is_stale_not_zero() {
        let h = harness();
        let id = deployed(&h).await;
        let c = collector(&h);

        h.cluster
            .fail_next(SimOp::Status, ClusterError::Transient("metrics lag".to_string()));
        let snapshot = c.refresh_deployment(&id).await.unwrap();
        assert_eq!(snapshot.ready_pods, None);
        assert_eq!(snapshot.freshness, Freshness::Unknown);
        assert!(snapshot.stale_reason.is_some());
        assert_eq!(
            h.orchestrator.get(&id).await.unwrap().status,
            DeploymentStatus::Deploying
        );
    }

    #[tokio::test]
    async fn test_cluster_pass_caches_snapshot_and_node_usage() {
        let h = harness();
        deployed(&h).await;
        let c = collector(&h);

        c.cluster_pass().await.unwrap();
        let metrics = c.cluster_metrics().await.unwrap();
        assert_eq!(metrics.freshness, Freshness::Fresh);

        let conn = h.db.get().unwrap();
        let node = node_registry::get_node(&conn, &h.node_id, now_secs(), 30).unwrap();
        assert_eq!(node.observed.freshness, Freshness::Fresh);

        h.cluster
            .fail_next(SimOp::Snapshot, ClusterError::Transient("down".to_string()));
        c.cluster_pass().await.unwrap();
        assert_eq!(c.cluster_metrics().await.unwrap().freshness, Freshness::Stale);
    }

    #[tokio::test]
    async fn test_deployment_metrics_health() {
        let h = harness();
        let id = deployed(&h).await;
        let c = collector(&h);

        let m = c.deployment_metrics("node-deployer-apps", "demo").await.unwrap();
        assert_eq!(m.deployment_id.as_deref(), Some(id.as_str()));
        assert_eq!(m.health, WorkloadHealth::Healthy);

        assert!(matches!(
            c.deployment_metrics("node-deployer-apps", "nope").await,
            Err(DeployError::NotFound(_))
        ));
    }
}
