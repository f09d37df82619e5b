//! In-memory cluster used by `--cluster-backend simulated` and by tests.
//!
//! Workloads become ready as soon as they are applied. Faults, latency,
//! unhealthy workloads and replica drift can be injected.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use super::{
    BuildRequest, ClusterBackend, ClusterError, ClusterInfoSummary, ClusterNodeSummary,
    ClusterSnapshot, EventSummary, NamespaceSummary, NodeUsage, PodSummary, ServiceSummary,
    WorkloadManifest, WorkloadStatus,
};
use crate::types::WorkloadInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Build,
    Apply,
    Scale,
    Restart,
    Teardown,
    Status,
    NodeUsage,
    Snapshot,
}

type Key = (String, String);

#[derive(Debug, Clone)]
struct SimWorkload {
    manifest: WorkloadManifest,
    /// Replica target on the cluster object; may drift from the manifest.
    replicas: u32,
    restarts: u32,
}

#[derive(Default)]
struct SimState {
    workloads: HashMap<Key, SimWorkload>,
    namespaces: BTreeSet<String>,
    faults: HashMap<SimOp, VecDeque<ClusterError>>,
    unhealthy: HashSet<Key>,
    calls: HashMap<SimOp, u32>,
    images: Vec<String>,
    latency: Option<Duration>,
}

#[derive(Default)]
pub struct SimulatedCluster {
    state: Mutex<SimState>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        // A panicking test thread must not wedge every other caller
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an error for the next call of `op`.
    pub fn fail_next(&self, op: SimOp, err: ClusterError) {
        self.fail_times(op, err, 1);
    }

    pub fn fail_times(&self, op: SimOp, err: ClusterError, times: usize) {
        let mut state = self.lock();
        let queue = state.faults.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(err.clone());
        }
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// An unhealthy workload reports zero ready pods.
    pub fn set_healthy(&self, namespace: &str, name: &str, healthy: bool) {
        let mut state = self.lock();
        if healthy {
            state.unhealthy.remove(&key(namespace, name));
        } else {
            state.unhealthy.insert(key(namespace, name));
        }
    }

    /// Change the replica target behind the control plane's back.
    pub fn set_cluster_replicas(&self, namespace: &str, name: &str, replicas: u32) {
        if let Some(w) = self.lock().workloads.get_mut(&key(namespace, name)) {
            w.replicas = replicas;
        }
    }

    pub fn calls(&self, op: SimOp) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn has_workload(&self, namespace: &str, name: &str) -> bool {
        self.lock().workloads.contains_key(&key(namespace, name))
    }

    pub fn replicas(&self, namespace: &str, name: &str) -> Option<u32> {
        self.lock()
            .workloads
            .get(&key(namespace, name))
            .map(|w| w.replicas)
    }

    pub fn manifest(&self, namespace: &str, name: &str) -> Option<WorkloadManifest> {
        self.lock()
            .workloads
            .get(&key(namespace, name))
            .map(|w| w.manifest.clone())
    }

    pub fn built_images(&self) -> Vec<String> {
        self.lock().images.clone()
    }

    /// Count the call, apply latency, and surface a queued fault if any.
    async fn enter(&self, op: SimOp) -> Result<(), ClusterError> {
        let latency = {
            let mut state = self.lock();
            *state.calls.entry(op).or_default() += 1;
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let fault = self.lock().faults.get_mut(&op).and_then(|q| q.pop_front());
        match fault {
            Some(err) => {
                debug!(?op, error = %err, "Injected cluster fault");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn pods_of(state: &SimState, k: &Key, w: &SimWorkload) -> Vec<PodSummary> {
        let ready = !state.unhealthy.contains(k);
        (0..w.replicas)
            .map(|i| PodSummary {
                name: format!("{}-{}", w.manifest.name, i),
                namespace: w.manifest.namespace.clone(),
                phase: "Running".to_string(),
                ready,
                restarts: w.restarts,
                node_name: Some(w.manifest.node_name.clone()),
                pod_ip: Some(format!("10.244.0.{}", i + 10)),
                cpu_millis: Some(50),
                memory_bytes: Some(64 << 20),
                created_at: None,
            })
            .collect()
    }
}

#[async_trait]
impl ClusterBackend for SimulatedCluster {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn build_image(&self, req: &BuildRequest) -> Result<String, ClusterError> {
        self.enter(SimOp::Build).await?;
        let mut state = self.lock();
        state.images.push(req.image.clone());
        Ok(req.image.clone())
    }

    async fn apply(&self, manifest: &WorkloadManifest) -> Result<WorkloadInfo, ClusterError> {
        self.enter(SimOp::Apply).await?;
        let mut state = self.lock();
        state.namespaces.insert(manifest.namespace.clone());
        let k = key(&manifest.namespace, &manifest.name);
        let restarts = state.workloads.get(&k).map(|w| w.restarts).unwrap_or(0);
        state.workloads.insert(
            k,
            SimWorkload {
                manifest: manifest.clone(),
                replicas: manifest.spec.replicas,
                restarts,
            },
        );
        Ok(manifest.workload_info())
    }

    async fn scale(&self, namespace: &str, name: &str, replicas: u32) -> Result<(), ClusterError> {
        self.enter(SimOp::Scale).await?;
        let mut state = self.lock();
        let w = state
            .workloads
            .get_mut(&key(namespace, name))
            .ok_or_else(|| ClusterError::NotFound(format!("deployment {}/{}", namespace, name)))?;
        w.replicas = replicas;
        w.manifest.spec.replicas = replicas;
        Ok(())
    }

    async fn rolling_restart(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.enter(SimOp::Restart).await?;
        let mut state = self.lock();
        let w = state
            .workloads
            .get_mut(&key(namespace, name))
            .ok_or_else(|| ClusterError::NotFound(format!("deployment {}/{}", namespace, name)))?;
        w.restarts += 1;
        Ok(())
    }

    async fn teardown(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.enter(SimOp::Teardown).await?;
        let mut state = self.lock();
        let k = key(namespace, name);
        state.workloads.remove(&k);
        state.unhealthy.remove(&k);
        Ok(())
    }

    async fn workload_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WorkloadStatus, ClusterError> {
        self.enter(SimOp::Status).await?;
        let state = self.lock();
        let k = key(namespace, name);
        let w = state
            .workloads
            .get(&k)
            .ok_or_else(|| ClusterError::NotFound(format!("deployment {}/{}", namespace, name)))?;
        let ready = if state.unhealthy.contains(&k) {
            0
        } else {
            w.replicas
        };
        Ok(WorkloadStatus {
            desired_replicas: w.replicas,
            active_pods: w.replicas,
            ready_pods: ready,
            available_replicas: ready,
            restart_count: w.restarts,
            cpu_percent: Some(10.0),
            memory_percent: Some(12.5),
        })
    }

    async fn node_usage(&self, node_name: &str) -> Result<NodeUsage, ClusterError> {
        self.enter(SimOp::NodeUsage).await?;
        let state = self.lock();
        let pods: u32 = state
            .workloads
            .values()
            .filter(|w| w.manifest.node_name == node_name)
            .map(|w| w.replicas)
            .sum();
        Ok(NodeUsage {
            cpu_percent: Some(5.0 + 2.5 * pods as f64),
            memory_percent: Some(10.0 + 4.0 * pods as f64),
            pods_running: Some(pods),
        })
    }

    async fn snapshot(&self) -> Result<ClusterSnapshot, ClusterError> {
        self.enter(SimOp::Snapshot).await?;
        let state = self.lock();
        let nodes: BTreeSet<&str> = state
            .workloads
            .values()
            .map(|w| w.manifest.node_name.as_str())
            .collect();
        let pods: u32 = state.workloads.values().map(|w| w.replicas).sum();
        Ok(ClusterSnapshot {
            node_count: nodes.len() as u32,
            ready_nodes: nodes.len() as u32,
            namespace_count: state.namespaces.len() as u32,
            pods_running: pods,
            used_cpu_millis: Some(pods as u64 * 50),
            used_memory_bytes: Some(pods as u64 * (64 << 20)),
            ..Default::default()
        })
    }

    async fn cluster_info(&self) -> Result<ClusterInfoSummary, ClusterError> {
        Ok(ClusterInfoSummary {
            backend: self.name().to_string(),
            server_version: Some("simulated".to_string()),
            platform: None,
            api_url: None,
        })
    }

    async fn namespaces(&self) -> Result<Vec<NamespaceSummary>, ClusterError> {
        Ok(self
            .lock()
            .namespaces
            .iter()
            .map(|ns| NamespaceSummary {
                name: ns.clone(),
                phase: Some("Active".to_string()),
                created_at: None,
            })
            .collect())
    }

    async fn pods(&self, namespace: Option<&str>) -> Result<Vec<PodSummary>, ClusterError> {
        let state = self.lock();
        let sorted: BTreeMap<&Key, &SimWorkload> = state.workloads.iter().collect();
        Ok(sorted
            .into_iter()
            .filter(|(k, _)| namespace.map_or(true, |ns| k.0 == ns))
            .flat_map(|(k, w)| Self::pods_of(&state, k, w))
            .collect())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        tail_lines: Option<u32>,
    ) -> Result<String, ClusterError> {
        let exists = self.pods(Some(namespace)).await?.iter().any(|p| p.name == pod);
        if !exists {
            return Err(ClusterError::NotFound(format!("pod {}/{}", namespace, pod)));
        }
        let lines: Vec<String> = (1..=tail_lines.unwrap_or(3).min(100))
            .map(|i| format!("[simulated] {} log line {}", pod, i))
            .collect();
        Ok(lines.join("\n"))
    }

    async fn services(&self, namespace: Option<&str>) -> Result<Vec<ServiceSummary>, ClusterError> {
        let state = self.lock();
        let mut services: Vec<ServiceSummary> = state
            .workloads
            .values()
            .filter(|w| namespace.map_or(true, |ns| w.manifest.namespace == ns))
            .map(|w| ServiceSummary {
                name: w.manifest.service_name(),
                namespace: w.manifest.namespace.clone(),
                service_type: "ClusterIP".to_string(),
                cluster_ip: None,
                ports: vec![w.manifest.spec.service_port],
            })
            .collect();
        services.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(services)
    }

    async fn nodes(&self) -> Result<Vec<ClusterNodeSummary>, ClusterError> {
        let state = self.lock();
        let names: BTreeSet<&str> = state
            .workloads
            .values()
            .map(|w| w.manifest.node_name.as_str())
            .collect();
        Ok(names
            .into_iter()
            .map(|name| ClusterNodeSummary {
                name: name.to_string(),
                ready: true,
                kubelet_version: None,
                internal_ip: None,
                cpu_millis: None,
                memory_bytes: None,
            })
            .collect())
    }

    async fn events(&self, _namespace: Option<&str>) -> Result<Vec<EventSummary>, ClusterError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::deployment_store::tests::sample_spec;

    fn manifest(name: &str) -> WorkloadManifest {
        WorkloadManifest {
            deployment_id: format!("{}-id", name),
            name: name.to_string(),
            namespace: "apps".to_string(),
            context_path: format!("/{}", name),
            repository_full_name: "acme/demo".to_string(),
            node_name: "worker-1".to_string(),
            image: "acme/demo:latest".to_string(),
            ingress_host: "localhost".to_string(),
            spec: sample_spec(),
        }
    }

    #[tokio::test]
    async fn test_apply_then_status() {
        let sim = SimulatedCluster::new();
        sim.apply(&manifest("demo")).await.unwrap();

        let status = sim.workload_status("apps", "demo").await.unwrap();
        assert_eq!(status.desired_replicas, 2);
        assert_eq!(status.ready_pods, 2);

        sim.set_healthy("apps", "demo", false);
        assert_eq!(sim.workload_status("apps", "demo").await.unwrap().ready_pods, 0);
        assert_eq!(sim.pods(Some("apps")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let sim = SimulatedCluster::new();
        sim.fail_next(SimOp::Apply, ClusterError::Transient("blip".into()));

        assert!(matches!(
            sim.apply(&manifest("demo")).await,
            Err(ClusterError::Transient(_))
        ));
        assert!(sim.apply(&manifest("demo")).await.is_ok());
        assert_eq!(sim.calls(SimOp::Apply), 2);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let sim = SimulatedCluster::new();
        sim.apply(&manifest("demo")).await.unwrap();
        sim.teardown("apps", "demo").await.unwrap();
        sim.teardown("apps", "demo").await.unwrap();
        assert!(!sim.has_workload("apps", "demo"));
        assert!(matches!(
            sim.workload_status("apps", "demo").await,
            Err(ClusterError::NotFound(_))
        ));
    }
}
