//! Kubernetes adapter on the `kube` client.
//!
//! Workload objects are written with server-side apply so re-applying a
//! deployment is idempotent. Images are built in-cluster by a kaniko Job.

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Namespace, Node, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::manifest::{
    build_job, config_map_name, ingress_name, namespace_object, restart_patch, scale_patch,
    service_name, FIELD_MANAGER,
};
use super::{
    BuildRequest, ClusterBackend, ClusterError, ClusterInfoSummary, ClusterNodeSummary,
    ClusterSnapshot, EventSummary, NamespaceSummary, NodeUsage, PodSummary, ServiceSummary,
    WorkloadManifest, WorkloadStatus,
};
use crate::services::quantity::parse_quantity;
use crate::types::WorkloadInfo;

#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub accept_invalid_certs: bool,
    pub request_timeout: Duration,
    pub builder_image: String,
    pub build_timeout: Duration,
    pub build_poll_interval: Duration,
}

pub struct KubernetesCluster {
    client: Client,
    api_url: String,
    builder_image: String,
    build_timeout: Duration,
    build_poll_interval: Duration,
}

/// Map an API status code onto the failure classes.
pub fn classify_status(code: u16, message: &str) -> ClusterError {
    let msg = format!("{}: {}", code, message);
    match code {
        404 => ClusterError::NotFound(msg),
        409 | 429 | 500 | 502 | 503 | 504 => ClusterError::Transient(msg),
        400 | 401 | 403 | 422 => ClusterError::Fatal(msg),
        _ => ClusterError::Failed(msg),
    }
}

/// Map a client error onto the failure classes.
pub fn classify(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(resp) => classify_status(resp.code, &resp.message),
        kube::Error::HyperError(e) => ClusterError::Transient(e.to_string()),
        kube::Error::Service(e) => ClusterError::Transient(e.to_string()),
        kube::Error::Auth(e) => ClusterError::Fatal(e.to_string()),
        other => ClusterError::Failed(other.to_string()),
    }
}

fn millis_of(q: &Quantity) -> Option<u64> {
    parse_quantity(&q.0)
        .ok()
        .map(|q| q.ceil_millis().max(0) as u64)
}

fn bytes_of(q: &Quantity) -> Option<u64> {
    parse_quantity(&q.0)
        .ok()
        .map(|q| q.ceil_units().max(0) as u64)
}

/// Usage figures from metrics.k8s.io arrive untyped.
fn usage_of(v: &Value, key: &str) -> Option<Quantity> {
    v.get("usage")?
        .get(key)?
        .as_str()
        .map(|s| Quantity(s.to_string()))
}

fn percent(used: u64, total: u64) -> Option<f64> {
    if total == 0 {
        None
    } else {
        Some((used as f64 / total as f64 * 1000.0).round() / 10.0)
    }
}

fn count(v: Option<i32>) -> u32 {
    v.unwrap_or(0).max(0) as u32
}

fn pod_summary(pod: &Pod) -> PodSummary {
    let status = pod.status.as_ref();
    let statuses = status
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or(&[]);
    PodSummary {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        phase: status
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        ready: !statuses.is_empty() && statuses.iter().all(|s| s.ready),
        restarts: statuses.iter().map(|s| s.restart_count.max(0) as u32).sum(),
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        pod_ip: status.and_then(|s| s.pod_ip.clone()),
        cpu_millis: None,
        memory_bytes: None,
        created_at: pod
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0.to_rfc3339()),
    }
}

fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn allocatable(node: &Node, key: &str) -> Option<Quantity> {
    node.status
        .as_ref()?
        .allocatable
        .as_ref()?
        .get(key)
        .cloned()
}

fn pod_metrics() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics"),
        "pods",
    )
}

fn node_metrics() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "NodeMetrics"),
        "nodes",
    )
}

impl KubernetesCluster {
    pub fn new(config: KubernetesConfig) -> anyhow::Result<Self> {
        let cluster_url: axum::http::Uri = config
            .api_url
            .parse()
            .context("Invalid Kubernetes API URL")?;

        // kube and reqwest may each enable a rustls crypto backend
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut kube_config = kube::Config::new(cluster_url);
        kube_config.accept_invalid_certs = config.accept_invalid_certs;
        kube_config.connect_timeout = Some(config.request_timeout);
        kube_config.read_timeout = Some(config.request_timeout);
        kube_config.auth_info.token = config.token.map(SecretString::from);
        let client =
            Client::try_from(kube_config).context("Failed to build Kubernetes client")?;

        Ok(Self {
            client,
            api_url: config.api_url,
            builder_image: config.builder_image,
            build_timeout: config.build_timeout,
            build_poll_interval: config.build_poll_interval,
        })
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn namespaced_or_all<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Server-side apply of one object under our field manager.
    async fn apply_object<K>(
        &self,
        api: &Api<K>,
        name: &str,
        object: &K,
    ) -> Result<(), ClusterError>
    where
        K: Clone + DeserializeOwned + Serialize + Debug,
    {
        debug!("Kubernetes apply {}", name);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(object))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        self.apply_object(&api, namespace, &namespace_object(namespace))
            .await
    }

    async fn merge_patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), ClusterError> {
        let api: Api<Deployment> = self.namespaced(namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Delete that treats an already-missing object as success.
    async fn delete_object<K>(&self, api: &Api<K>, name: &str) -> Result<(), ClusterError>
    where
        K: Clone + DeserializeOwned + Debug,
    {
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => match classify(e) {
                ClusterError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn wait_for_job(&self, jobs: &Api<Job>, job_name: &str) -> Result<(), ClusterError> {
        let deadline = tokio::time::Instant::now() + self.build_timeout;
        loop {
            let job = jobs.get(job_name).await.map_err(classify)?;
            let status = job.status.unwrap_or_default();
            if count(status.succeeded) > 0 {
                return Ok(());
            }
            if count(status.failed) > 0 {
                return Err(ClusterError::Failed(format!("image build job {} failed", job_name)));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClusterError::Transient(format!(
                    "image build job {} did not finish within {:?}",
                    job_name, self.build_timeout
                )));
            }
            tokio::time::sleep(self.build_poll_interval).await;
        }
    }

    /// Summed pod usage for a label selector, from metrics.k8s.io.
    async fn pod_usage(&self, namespace: &str, selector: &str) -> Option<(u64, u64)> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &pod_metrics());
        let list = match api.list(&ListParams::default().labels(selector)).await {
            Ok(list) => list,
            Err(e) => {
                debug!("Pod metrics unavailable for {}: {}", selector, e);
                return None;
            }
        };
        let mut cpu = 0;
        let mut mem = 0;
        for pod in &list.items {
            let containers = pod.data.get("containers").and_then(Value::as_array);
            for c in containers.into_iter().flatten() {
                cpu += usage_of(c, "cpu").as_ref().and_then(millis_of).unwrap_or(0);
                mem += usage_of(c, "memory").as_ref().and_then(bytes_of).unwrap_or(0);
            }
        }
        Some((cpu, mem))
    }
}

#[async_trait]
impl ClusterBackend for KubernetesCluster {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn build_image(&self, req: &BuildRequest) -> Result<String, ClusterError> {
        let short = Uuid::new_v4().simple().to_string();
        let job_name = format!("{}-build-{}", req.workload_name, &short[..8]);

        self.ensure_namespace(&req.namespace).await?;

        let jobs: Api<Job> = self.namespaced(&req.namespace);
        let job = build_job(req, &job_name, &self.builder_image);
        jobs.create(&PostParams::default(), &job)
            .await
            .map_err(classify)?;
        info!(job = %job_name, image = %req.image, "Started image build");

        let result = self.wait_for_job(&jobs, &job_name).await;

        // The job spec carries the credential; never leave it behind
        if let Err(e) = self.delete_object(&jobs, &job_name).await {
            warn!(job = %job_name, "Failed to delete build job: {}", e);
        }

        result.map(|_| req.image.clone())
    }

    async fn apply(&self, manifest: &WorkloadManifest) -> Result<WorkloadInfo, ClusterError> {
        let ns = &manifest.namespace;
        self.ensure_namespace(ns).await?;

        let config_maps: Api<ConfigMap> = self.namespaced(ns);
        match (manifest.config_map_name(), manifest.config_map_object()) {
            (Some(name), Some(cm)) => self.apply_object(&config_maps, &name, &cm).await?,
            _ => {
                self.delete_object(&config_maps, &config_map_name(&manifest.name))
                    .await?
            }
        }

        let deployments: Api<Deployment> = self.namespaced(ns);
        self.apply_object(&deployments, &manifest.name, &manifest.deployment_object())
            .await?;
        let services: Api<Service> = self.namespaced(ns);
        self.apply_object(&services, &manifest.service_name(), &manifest.service_object())
            .await?;
        let ingresses: Api<Ingress> = self.namespaced(ns);
        self.apply_object(&ingresses, &manifest.ingress_name(), &manifest.ingress_object())
            .await?;

        Ok(manifest.workload_info())
    }

    async fn scale(&self, namespace: &str, name: &str, replicas: u32) -> Result<(), ClusterError> {
        self.merge_patch(namespace, name, &scale_patch(replicas)).await
    }

    async fn rolling_restart(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| ClusterError::Failed(e.to_string()))?;
        self.merge_patch(namespace, name, &restart_patch(&now)).await
    }

    async fn teardown(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let ingresses: Api<Ingress> = self.namespaced(namespace);
        self.delete_object(&ingresses, &ingress_name(name)).await?;
        let services: Api<Service> = self.namespaced(namespace);
        self.delete_object(&services, &service_name(name)).await?;
        let deployments: Api<Deployment> = self.namespaced(namespace);
        self.delete_object(&deployments, name).await?;
        let config_maps: Api<ConfigMap> = self.namespaced(namespace);
        self.delete_object(&config_maps, &config_map_name(name)).await
    }

    async fn workload_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WorkloadStatus, ClusterError> {
        let deployments: Api<Deployment> = self.namespaced(namespace);
        let deployment = deployments.get(name).await.map_err(classify)?;
        let selector = format!("app={}", name);
        let pods: Api<Pod> = self.namespaced(namespace);
        let pods = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(classify)?;

        let summaries: Vec<PodSummary> = pods.items.iter().map(pod_summary).collect();
        let active: Vec<&PodSummary> = summaries
            .iter()
            .filter(|p| p.phase == "Running" || p.phase == "Pending")
            .collect();

        let spec = deployment.spec.as_ref();
        let limits = spec
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.resources.as_ref())
            .and_then(|r| r.limits.as_ref());
        let cpu_limit = limits.and_then(|l| l.get("cpu")).and_then(millis_of);
        let mem_limit = limits.and_then(|l| l.get("memory")).and_then(bytes_of);
        let running = active.iter().filter(|p| p.phase == "Running").count() as u64;

        let (cpu_percent, memory_percent) = match self.pod_usage(namespace, &selector).await {
            Some((cpu, mem)) if running > 0 => (
                cpu_limit.and_then(|l| percent(cpu, l * running)),
                mem_limit.and_then(|l| percent(mem, l * running)),
            ),
            _ => (None, None),
        };

        let status = deployment.status.unwrap_or_default();
        Ok(WorkloadStatus {
            desired_replicas: count(spec.and_then(|s| s.replicas)),
            active_pods: active.len() as u32,
            ready_pods: count(status.ready_replicas),
            available_replicas: count(status.available_replicas),
            restart_count: summaries.iter().map(|p| p.restarts).sum(),
            cpu_percent,
            memory_percent,
        })
    }

    async fn node_usage(&self, node_name: &str) -> Result<NodeUsage, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes.get(node_name).await.map_err(classify)?;
        let pods: Api<Pod> = Api::all(self.client.clone());
        let running = pods
            .list(&ListParams::default().fields(&format!(
                "spec.nodeName={},status.phase=Running",
                node_name
            )))
            .await
            .map_err(classify)?;

        let alloc_cpu = allocatable(&node, "cpu").as_ref().and_then(millis_of);
        let alloc_mem = allocatable(&node, "memory").as_ref().and_then(bytes_of);
        let metrics: Api<DynamicObject> = Api::all_with(self.client.clone(), &node_metrics());
        let usage = metrics.get(node_name).await.ok();

        let used_cpu = usage
            .as_ref()
            .and_then(|u| usage_of(&u.data, "cpu"))
            .as_ref()
            .and_then(millis_of);
        let used_mem = usage
            .as_ref()
            .and_then(|u| usage_of(&u.data, "memory"))
            .as_ref()
            .and_then(bytes_of);

        Ok(NodeUsage {
            cpu_percent: used_cpu.zip(alloc_cpu).and_then(|(u, t)| percent(u, t)),
            memory_percent: used_mem.zip(alloc_mem).and_then(|(u, t)| percent(u, t)),
            pods_running: Some(running.items.len() as u32),
        })
    }

    async fn snapshot(&self) -> Result<ClusterSnapshot, ClusterError> {
        let lp = ListParams::default();
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&lp)
            .await
            .map_err(classify)?;
        let pods = Api::<Pod>::all(self.client.clone())
            .list(&lp)
            .await
            .map_err(classify)?;
        let namespaces = Api::<Namespace>::all(self.client.clone())
            .list(&lp)
            .await
            .map_err(classify)?;

        let mut snapshot = ClusterSnapshot {
            node_count: nodes.items.len() as u32,
            namespace_count: namespaces.items.len() as u32,
            ..Default::default()
        };
        for node in &nodes.items {
            if node_ready(node) {
                snapshot.ready_nodes += 1;
            }
            snapshot.total_cpu_millis += allocatable(node, "cpu")
                .as_ref()
                .and_then(millis_of)
                .unwrap_or(0);
            snapshot.total_memory_bytes += allocatable(node, "memory")
                .as_ref()
                .and_then(bytes_of)
                .unwrap_or(0);
        }
        for pod in &pods.items {
            match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                Some("Running") => snapshot.pods_running += 1,
                Some("Pending") => snapshot.pods_pending += 1,
                Some("Failed") => snapshot.pods_failed += 1,
                Some("Succeeded") => snapshot.pods_succeeded += 1,
                _ => {}
            }
        }

        let metrics: Api<DynamicObject> = Api::all_with(self.client.clone(), &node_metrics());
        if let Ok(usage) = metrics.list(&lp).await {
            let mut cpu = 0;
            let mut mem = 0;
            for n in &usage.items {
                cpu += usage_of(&n.data, "cpu").as_ref().and_then(millis_of).unwrap_or(0);
                mem += usage_of(&n.data, "memory").as_ref().and_then(bytes_of).unwrap_or(0);
            }
            snapshot.used_cpu_millis = Some(cpu);
            snapshot.used_memory_bytes = Some(mem);
        }
        Ok(snapshot)
    }

    async fn cluster_info(&self) -> Result<ClusterInfoSummary, ClusterError> {
        let version = self.client.apiserver_version().await.map_err(classify)?;
        Ok(ClusterInfoSummary {
            backend: self.name().to_string(),
            server_version: Some(version.git_version),
            platform: Some(version.platform),
            api_url: Some(self.api_url.clone()),
        })
    }

    async fn namespaces(&self) -> Result<Vec<NamespaceSummary>, ClusterError> {
        let list = Api::<Namespace>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(classify)?;
        Ok(list
            .items
            .into_iter()
            .map(|ns| NamespaceSummary {
                name: ns.metadata.name.unwrap_or_default(),
                phase: ns.status.and_then(|s| s.phase),
                created_at: ns.metadata.creation_timestamp.map(|t| t.0.to_rfc3339()),
            })
            .collect())
    }

    async fn pods(&self, namespace: Option<&str>) -> Result<Vec<PodSummary>, ClusterError> {
        let list = self
            .namespaced_or_all::<Pod>(namespace)
            .list(&ListParams::default())
            .await
            .map_err(classify)?;
        Ok(list.items.iter().map(pod_summary).collect())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        tail_lines: Option<u32>,
    ) -> Result<String, ClusterError> {
        let pods: Api<Pod> = self.namespaced(namespace);
        let params = LogParams {
            tail_lines: tail_lines.map(i64::from),
            ..Default::default()
        };
        pods.logs(pod, &params).await.map_err(classify)
    }

    async fn services(&self, namespace: Option<&str>) -> Result<Vec<ServiceSummary>, ClusterError> {
        let list = self
            .namespaced_or_all::<Service>(namespace)
            .list(&ListParams::default())
            .await
            .map_err(classify)?;
        Ok(list
            .items
            .into_iter()
            .map(|svc| {
                let spec = svc.spec.unwrap_or_default();
                ServiceSummary {
                    name: svc.metadata.name.unwrap_or_default(),
                    namespace: svc.metadata.namespace.unwrap_or_default(),
                    service_type: spec.type_.unwrap_or_else(|| "ClusterIP".to_string()),
                    cluster_ip: spec.cluster_ip,
                    ports: spec
                        .ports
                        .unwrap_or_default()
                        .iter()
                        .filter_map(|p| u16::try_from(p.port).ok())
                        .collect(),
                }
            })
            .collect())
    }

    async fn nodes(&self) -> Result<Vec<ClusterNodeSummary>, ClusterError> {
        let list = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(classify)?;
        Ok(list
            .items
            .iter()
            .map(|node| {
                let status = node.status.as_ref();
                ClusterNodeSummary {
                    name: node.metadata.name.clone().unwrap_or_default(),
                    ready: node_ready(node),
                    kubelet_version: status
                        .and_then(|s| s.node_info.as_ref())
                        .map(|i| i.kubelet_version.clone()),
                    internal_ip: status
                        .and_then(|s| s.addresses.as_ref())
                        .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
                        .map(|a| a.address.clone()),
                    cpu_millis: allocatable(node, "cpu").as_ref().and_then(millis_of),
                    memory_bytes: allocatable(node, "memory").as_ref().and_then(bytes_of),
                }
            })
            .collect())
    }

    async fn events(&self, namespace: Option<&str>) -> Result<Vec<EventSummary>, ClusterError> {
        let list = self
            .namespaced_or_all::<Event>(namespace)
            .list(&ListParams::default())
            .await
            .map_err(classify)?;
        Ok(list
            .items
            .into_iter()
            .map(|ev| EventSummary {
                namespace: ev.metadata.namespace.unwrap_or_default(),
                object: format!(
                    "{}/{}",
                    ev.involved_object.kind.unwrap_or_default(),
                    ev.involved_object.name.unwrap_or_default()
                ),
                reason: ev.reason,
                message: ev.message,
                event_type: ev.type_,
                count: count(ev.count),
                last_seen: ev.last_timestamp.map(|t| t.0.to_rfc3339()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::deployment_store::tests::sample_spec;
    use kube::core::ErrorResponse;
    use serde_json::json;
    use wiremock::{
        matchers::{header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    const APPLY_PATCH: &str = "application/apply-patch+yaml";

    fn cluster(server: &MockServer) -> KubernetesCluster {
        KubernetesCluster::new(KubernetesConfig {
            api_url: server.uri(),
            token: Some("test-token".to_string()),
            accept_invalid_certs: false,
            request_timeout: Duration::from_secs(5),
            builder_image: "gcr.io/kaniko-project/executor:latest".to_string(),
            build_timeout: Duration::from_secs(5),
            build_poll_interval: Duration::from_millis(10),
        })
        .unwrap()
    }

    fn manifest() -> WorkloadManifest {
        WorkloadManifest {
            deployment_id: "d1".to_string(),
            name: "demo".to_string(),
            namespace: "apps".to_string(),
            context_path: "/demo".to_string(),
            repository_full_name: "acme/demo".to_string(),
            node_name: "worker-1".to_string(),
            image: "acme/demo:latest".to_string(),
            ingress_host: "localhost".to_string(),
            spec: sample_spec(),
        }
    }

    fn api_error(code: u16, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    fn status_body(code: u16, message: &str) -> Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": "Invalid",
            "code": code
        })
    }

    fn echo_apply() -> impl wiremock::Respond {
        |req: &wiremock::Request| {
            ResponseTemplate::new(200).set_body_bytes(req.body.clone())
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(503, ""), ClusterError::Transient(_)));
        assert!(matches!(classify_status(404, ""), ClusterError::NotFound(_)));
        assert!(matches!(classify_status(418, ""), ClusterError::Failed(_)));
        assert!(matches!(
            classify(api_error(422, "bad spec")),
            ClusterError::Fatal(m) if m.contains("bad spec")
        ));
        assert!(matches!(classify(api_error(409, "conflict")), ClusterError::Transient(_)));
        assert!(matches!(classify(api_error(403, "forbidden")), ClusterError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_apply_uses_server_side_apply() {
        let server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(header("content-type", APPLY_PATCH))
            .and(header("authorization", "Bearer test-token"))
            .and(query_param("fieldManager", FIELD_MANAGER))
            .and(query_param("force", "true"))
            .respond_with(echo_apply())
            .expect(4)
            .mount(&server)
            .await;
        // No environment: any stale ConfigMap is removed
        Mock::given(method("DELETE"))
            .and(path("/api/v1/namespaces/apps/configmaps/demo-config"))
            .respond_with(ResponseTemplate::new(404).set_body_json(status_body(404, "not found")))
            .expect(1)
            .mount(&server)
            .await;

        let info = cluster(&server).apply(&manifest()).await.unwrap();
        assert_eq!(info.deployment_name.as_deref(), Some("demo"));
        assert_eq!(info.service_name.as_deref(), Some("demo-service"));
    }

    #[tokio::test]
    async fn test_apply_rejected_manifest_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(status_body(422, "spec.replicas invalid")),
            )
            .mount(&server)
            .await;

        let err = cluster(&server).apply(&manifest()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Fatal(m) if m.contains("spec.replicas invalid")));
    }

    #[tokio::test]
    async fn test_workload_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/apps/v1/namespaces/apps/deployments/demo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": { "name": "demo", "namespace": "apps" },
                "spec": {
                    "replicas": 2,
                    "selector": { "matchLabels": { "app": "demo" } },
                    "template": { "spec": { "containers": [{
                        "name": "demo",
                        "resources": { "limits": { "cpu": "500m", "memory": "512Mi" } }
                    }] } }
                },
                "status": { "readyReplicas": 1, "availableReplicas": 1 }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/apps/pods"))
            .and(query_param("labelSelector", "app=demo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "v1",
                "kind": "PodList",
                "metadata": {},
                "items": [
                    { "metadata": { "name": "demo-a" }, "status": { "phase": "Running",
                      "containerStatuses": [{ "name": "demo", "image": "demo", "imageID": "",
                        "ready": true, "restartCount": 2 }] } },
                    { "metadata": { "name": "demo-b" }, "status": { "phase": "Pending" } }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/apis/metrics.k8s.io/v1beta1/namespaces/apps/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "metrics.k8s.io/v1beta1",
                "kind": "PodMetricsList",
                "metadata": {},
                "items": [{
                    "metadata": { "name": "demo-a", "namespace": "apps" },
                    "containers": [{ "name": "demo", "usage": { "cpu": "250m", "memory": "128Mi" } }]
                }]
            })))
            .mount(&server)
            .await;

        let status = cluster(&server).workload_status("apps", "demo").await.unwrap();
        assert_eq!(status.desired_replicas, 2);
        assert_eq!(status.ready_pods, 1);
        assert_eq!(status.active_pods, 2);
        assert_eq!(status.restart_count, 2);
        assert_eq!(status.cpu_percent, Some(50.0));
        assert_eq!(status.memory_percent, Some(25.0));
    }

    #[tokio::test]
    async fn test_missing_metrics_api_leaves_usage_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/apps/v1/namespaces/apps/deployments/demo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": { "name": "demo" },
                "spec": {
                    "replicas": 1,
                    "selector": {},
                    "template": { "spec": { "containers": [] } }
                },
                "status": { "readyReplicas": 1 }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/apps/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "v1", "kind": "PodList", "metadata": {}, "items": []
            })))
            .mount(&server)
            .await;

        let status = cluster(&server).workload_status("apps", "demo").await.unwrap();
        assert_eq!(status.cpu_percent, None);
        assert_eq!(status.memory_percent, None);
    }

    #[tokio::test]
    async fn test_teardown_tolerates_missing_objects() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404).set_body_json(status_body(404, "not found")))
            .expect(4)
            .mount(&server)
            .await;

        cluster(&server).teardown("apps", "demo").await.unwrap();
    }

    #[tokio::test]
    async fn test_build_image_runs_job_and_removes_it() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/v1/namespaces/apps"))
            .respond_with(echo_apply())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/apis/batch/v1/namespaces/apps/jobs"))
            .respond_with(echo_apply())
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(wiremock::matchers::path_regex(r"^/apis/batch/v1/namespaces/apps/jobs/demo-build-"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "batch/v1",
                "kind": "Job",
                "metadata": { "name": "demo-build" },
                "status": { "succeeded": 1 }
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(wiremock::matchers::path_regex(r"^/apis/batch/v1/namespaces/apps/jobs/demo-build-"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "v1", "kind": "Status", "metadata": {}, "status": "Success"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let req = BuildRequest {
            namespace: "apps".to_string(),
            workload_name: "demo".to_string(),
            repository_full_name: "acme/demo".to_string(),
            clone_url: None,
            branch: "main".to_string(),
            commit_sha: None,
            dockerfile: "Dockerfile".to_string(),
            context: ".".to_string(),
            image: "registry.local/acme/demo:latest".to_string(),
            build_args: Default::default(),
            credential: None,
        };
        let image = cluster(&server).build_image(&req).await.unwrap();
        assert_eq!(image, "registry.local/acme/demo:latest");
    }

    #[tokio::test]
    async fn test_pod_logs_tail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/apps/pods/demo-a/log"))
            .and(query_param("tailLines", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_string("line 1\nline 2"))
            .mount(&server)
            .await;

        let logs = cluster(&server)
            .pod_logs("apps", "demo-a", Some(50))
            .await
            .unwrap();
        assert_eq!(logs, "line 1\nline 2");
    }
}
