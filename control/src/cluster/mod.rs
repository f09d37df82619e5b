//! Seam between the control plane and the container cluster.
//!
//! The orchestrator and collector only talk to a [`ClusterBackend`]; the
//! Kubernetes adapter drives the API server through `kube`, the simulated
//! one keeps workloads in memory for development and tests.

pub mod kubernetes;
pub mod manifest;
pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::types::{Credential, WorkloadInfo};

pub use kubernetes::KubernetesCluster;
pub use manifest::WorkloadManifest;
pub use simulated::SimulatedCluster;

/// Failure classes every backend reports.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// Infrastructure hiccup; retry without counting against the operation.
    #[error("transient cluster error: {0}")]
    Transient(String),

    /// The operation failed but may succeed on a later attempt.
    #[error("cluster operation failed: {0}")]
    Failed(String),

    /// Retrying cannot help (malformed manifest, forbidden, ...).
    #[error("fatal cluster error: {0}")]
    Fatal(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ClusterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Transient(_))
    }
}

/// Run a cluster call with a deadline; an elapsed deadline is a transient failure.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, ClusterError>
where
    F: Future<Output = Result<T, ClusterError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClusterError::Transient(format!(
            "{} timed out after {:?}",
            what, limit
        ))),
    }
}

/// Everything an image build needs. Holds the credential only for the call.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub namespace: String,
    pub workload_name: String,
    pub repository_full_name: String,
    pub clone_url: Option<String>,
    pub branch: String,
    pub commit_sha: Option<String>,
    pub dockerfile: String,
    pub context: String,
    pub image: String,
    pub build_args: BTreeMap<String, String>,
    pub credential: Option<Credential>,
}

/// Replica and usage figures for one workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    /// Replica target currently set on the cluster object.
    pub desired_replicas: u32,
    pub active_pods: u32,
    pub ready_pods: u32,
    pub available_replicas: u32,
    pub restart_count: u32,
    /// Percent of the summed pod limits, when a metrics API answered.
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUsage {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub pods_running: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub node_count: u32,
    pub ready_nodes: u32,
    pub namespace_count: u32,
    pub pods_running: u32,
    pub pods_pending: u32,
    pub pods_failed: u32,
    pub pods_succeeded: u32,
    pub total_cpu_millis: u64,
    pub total_memory_bytes: u64,
    pub used_cpu_millis: Option<u64>,
    pub used_memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfoSummary {
    pub backend: String,
    pub server_version: Option<String>,
    pub platform: Option<String>,
    pub api_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSummary {
    pub name: String,
    pub phase: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSummary {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub ready: bool,
    pub restarts: u32,
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
    pub cpu_millis: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub name: String,
    pub namespace: String,
    pub service_type: String,
    pub cluster_ip: Option<String>,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNodeSummary {
    pub name: String,
    pub ready: bool,
    pub kubelet_version: Option<String>,
    pub internal_ip: Option<String>,
    pub cpu_millis: Option<u64>,
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub namespace: String,
    pub object: String,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub event_type: Option<String>,
    pub count: u32,
    pub last_seen: Option<String>,
}

#[async_trait]
pub trait ClusterBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build and push the image described by `req`; returns the pushed reference.
    async fn build_image(&self, req: &BuildRequest) -> Result<String, ClusterError>;

    /// Create or update every object of the workload.
    async fn apply(&self, manifest: &WorkloadManifest) -> Result<WorkloadInfo, ClusterError>;

    async fn scale(&self, namespace: &str, name: &str, replicas: u32) -> Result<(), ClusterError>;

    async fn rolling_restart(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Remove every object of the workload. Missing objects are not an error.
    async fn teardown(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn workload_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WorkloadStatus, ClusterError>;

    async fn node_usage(&self, node_name: &str) -> Result<NodeUsage, ClusterError>;

    async fn snapshot(&self) -> Result<ClusterSnapshot, ClusterError>;

    async fn cluster_info(&self) -> Result<ClusterInfoSummary, ClusterError>;

    async fn namespaces(&self) -> Result<Vec<NamespaceSummary>, ClusterError>;

    async fn pods(&self, namespace: Option<&str>) -> Result<Vec<PodSummary>, ClusterError>;

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        tail_lines: Option<u32>,
    ) -> Result<String, ClusterError>;

    async fn services(&self, namespace: Option<&str>) -> Result<Vec<ServiceSummary>, ClusterError>;

    async fn nodes(&self) -> Result<Vec<ClusterNodeSummary>, ClusterError>;

    async fn events(&self, namespace: Option<&str>) -> Result<Vec<EventSummary>, ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_elapsed_deadline_is_transient() {
        let res: Result<(), ClusterError> = with_timeout(Duration::from_millis(10), "apply", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(ClusterError::Transient(_))));
    }
}
