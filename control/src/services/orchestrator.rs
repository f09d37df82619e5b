//! Deployment state machine.
//!
//! Owns `Deployment.status`. Create and restart return immediately and drive
//! the deployment from a spawned task; scale, update and delete run inline.
//! At most one operation is in flight per deployment id.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cluster::{with_timeout, BuildRequest, ClusterBackend, ClusterError, WorkloadManifest};
use crate::db::{execute_async, now_secs, DbPool};
use crate::error::{DeployError, DeployResult};
use crate::github::RepositorySource;
use crate::services::config_builder::ConfigBuilder;
use crate::services::deployment_store::{self, NewDeployment};
use crate::services::node_registry;
use crate::types::{
    CreateDeploymentRequest, CreateDeploymentResponse, Credential, DeleteOutcome, Deployment,
    DeploymentFilter, DeploymentStats, DeploymentStatus, Node, NodeStatus, UpdateDeploymentRequest,
};

use DeploymentStatus::*;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Failed attempts before a build or apply gives up.
    pub attempt_ceiling: u32,
    /// Transient errors tolerated within one attempt.
    pub transient_ceiling: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub cluster_timeout: Duration,
    pub build_timeout: Duration,
    pub liveness_window: Duration,
    /// Consecutive zero-ready passes before a running deployment fails.
    pub unhealthy_threshold: u32,
    /// Zero-ready passes a deploying workload gets before it fails.
    pub deploy_health_budget: u32,
    pub ingress_host: String,
    pub image_registry: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            attempt_ceiling: 5,
            transient_ceiling: 8,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            cluster_timeout: Duration::from_secs(10),
            build_timeout: Duration::from_secs(600),
            liveness_window: Duration::from_secs(30),
            unhealthy_threshold: 3,
            deploy_health_budget: 30,
            ingress_host: "localhost".to_string(),
            image_registry: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Restart,
    Scale,
    Update,
    Delete,
    Reconcile,
}

struct InFlight {
    kind: OperationKind,
    /// Set by a delete that arrived during a create or restart; holds `purge`.
    deferred_delete: Option<bool>,
}

/// What the collector observed for one deployment on one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSignal {
    pub ready_pods: u32,
    /// Replica target currently set on the cluster.
    pub desired_replicas: u32,
    /// Consecutive passes with zero ready pods in the current status.
    pub unhealthy_passes: u32,
}

/// Why a driven step gave up.
#[derive(Debug)]
enum StepFailure {
    Fatal(String),
    Exhausted(String),
}

impl StepFailure {
    fn reason(&self) -> &str {
        match self {
            StepFailure::Fatal(r) | StepFailure::Exhausted(r) => r,
        }
    }
}

enum DrivePlan {
    Create { credential: Option<Credential> },
    RollingRestart,
    Rebuild { credential: Option<Credential> },
}

/// Releases an in-flight slot on drop.
struct Claim<'a> {
    orchestrator: &'a Orchestrator,
    id: String,
    armed: bool,
}

impl<'a> Claim<'a> {
    fn adopt(orchestrator: &'a Orchestrator, id: &str) -> Self {
        Self {
            orchestrator,
            id: id.to_string(),
            armed: true,
        }
    }

    /// Keep the slot held for a spawned task that will adopt it.
    fn hand_off(mut self) {
        self.armed = false;
    }

    /// Release the slot, unless a delete was deferred onto it: then the slot
    /// becomes a delete and its `purge` flag is returned.
    fn settle(&mut self) -> Option<bool> {
        let mut in_flight = self.orchestrator.in_flight();
        let deferred = in_flight.get_mut(&self.id).and_then(|op| {
            op.deferred_delete.take().map(|purge| {
                op.kind = OperationKind::Delete;
                purge
            })
        });
        if deferred.is_none() {
            in_flight.remove(&self.id);
            self.armed = false;
        }
        deferred
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.orchestrator.in_flight().remove(&self.id);
        }
    }
}

pub struct Orchestrator {
    db: DbPool,
    cluster: Arc<dyn ClusterBackend>,
    source: Arc<dyn RepositorySource>,
    builder: ConfigBuilder,
    config: OrchestratorConfig,
    operations: Mutex<HashMap<String, InFlight>>,
}

impl Orchestrator {
    pub fn new(
        db: DbPool,
        cluster: Arc<dyn ClusterBackend>,
        source: Arc<dyn RepositorySource>,
        builder: ConfigBuilder,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            db,
            cluster,
            source,
            builder,
            config,
            operations: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.operations.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(&self, id: &str, kind: OperationKind) -> DeployResult<Claim<'_>> {
        let mut in_flight = self.in_flight();
        if let Some(op) = in_flight.get(id) {
            return Err(DeployError::Conflict(format!(
                "operation already in progress on deployment {} ({:?})",
                id, op.kind
            )));
        }
        in_flight.insert(
            id.to_string(),
            InFlight {
                kind,
                deferred_delete: None,
            },
        );
        Ok(Claim::adopt(self, id))
    }

    pub fn is_busy(&self, id: &str) -> bool {
        self.in_flight().contains_key(id)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.config
            .backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.config.backoff_cap)
    }

    fn image_for(&self, deployment: &Deployment) -> String {
        let image = deployment.configuration.build.image_ref();
        match self.config.image_registry.as_deref() {
            Some(registry) if !registry.is_empty() => {
                format!("{}/{}", registry.trim_end_matches('/'), image)
            }
            _ => image,
        }
    }

    // ---------------------------------------------------------------------
    // Store access
    // ---------------------------------------------------------------------

    pub async fn get(&self, id: &str) -> DeployResult<Deployment> {
        let id = id.to_string();
        execute_async(&self.db, move |conn| deployment_store::get_deployment(conn, &id)).await
    }

    pub async fn list(&self, filter: DeploymentFilter) -> DeployResult<Vec<Deployment>> {
        execute_async(&self.db, move |conn| {
            deployment_store::list_deployments(conn, &filter).map_err(DeployError::from)
        })
        .await
    }

    pub async fn stats(&self, node_id: Option<String>) -> DeployResult<DeploymentStats> {
        execute_async(&self.db, move |conn| {
            deployment_store::deployment_stats(conn, node_id.as_deref()).map_err(DeployError::from)
        })
        .await
    }

    async fn node(&self, node_id: &str) -> DeployResult<Node> {
        let node_id = node_id.to_string();
        let window = self.config.liveness_window.as_secs() as i64;
        execute_async(&self.db, move |conn| {
            node_registry::get_node(conn, &node_id, now_secs(), window)
        })
        .await
    }

    async fn transition(
        &self,
        id: &str,
        from: &'static [DeploymentStatus],
        to: DeploymentStatus,
        reason: Option<String>,
    ) -> DeployResult<bool> {
        let id = id.to_string();
        execute_async(&self.db, move |conn| {
            deployment_store::transition(conn, &id, from, to, reason.as_deref(), now_secs())
                .map_err(DeployError::from)
        })
        .await
    }

    async fn fail(&self, id: &str, reason: &str) -> DeployResult<()> {
        error!(deployment_id = %id, reason, "Deployment failed");
        self.transition(
            id,
            &[Pending, Deploying, Running],
            Failed,
            Some(reason.to_string()),
        )
        .await?;
        Ok(())
    }

    async fn save_workload(&self, id: &str, workload: crate::types::WorkloadInfo) -> DeployResult<()> {
        let id = id.to_string();
        execute_async(&self.db, move |conn| {
            deployment_store::save_workload(conn, &id, &workload, now_secs()).map_err(DeployError::from)
        })
        .await
    }

    async fn save_configuration(&self, id: &str, spec: crate::types::DeploymentSpec) -> DeployResult<()> {
        let id = id.to_string();
        execute_async(&self.db, move |conn| {
            deployment_store::save_configuration(conn, &id, &spec, now_secs())
                .map_err(DeployError::from)
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Retry policy
    // ---------------------------------------------------------------------

    /// Retry `op` on transient errors only. Returns the last error once the
    /// transient ceiling is reached, or the first non-transient one.
    async fn retry_transient<T, F, Fut>(
        &self,
        what: &str,
        limit: Duration,
        op: &mut F,
    ) -> Result<T, ClusterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let mut transient = 0;
        loop {
            match with_timeout(limit, what, op()).await {
                Err(ClusterError::Transient(msg)) if transient < self.config.transient_ceiling => {
                    transient += 1;
                    debug!(what, transient, "Transient cluster error, retrying: {}", msg);
                    tokio::time::sleep(self.backoff(transient)).await;
                }
                other => return other,
            }
        }
    }

    /// Wait while the target node is not online. Gives up once the node has
    /// been silent for a full liveness window, counted from its last
    /// heartbeat, or has sat in a non-online state for that long.
    async fn await_node(&self, node_id: &str) -> Result<Node, StepFailure> {
        let window = self.config.liveness_window;
        let mut unavailable_since: Option<Instant> = None;
        let mut waits = 0;
        loop {
            match self.node(node_id).await {
                Ok(node) if node.status == NodeStatus::Online => return Ok(node),
                Ok(node) => {
                    let since = *unavailable_since.get_or_insert_with(Instant::now);
                    let silent = Duration::from_secs(
                        now_secs().saturating_sub(node.last_seen_at).max(0) as u64,
                    );
                    if silent >= window || since.elapsed() >= window {
                        return Err(StepFailure::Fatal(format!(
                            "node unavailable: {} is {}",
                            node.name, node.status
                        )));
                    }
                    waits += 1;
                    debug!(node_id, status = %node.status, "Target node unavailable, waiting");
                    tokio::time::sleep(self.backoff(waits)).await;
                }
                Err(DeployError::NotFound(_)) => {
                    return Err(StepFailure::Fatal(format!(
                        "node unavailable: {} is no longer registered",
                        node_id
                    )))
                }
                Err(e) => return Err(StepFailure::Exhausted(e.to_string())),
            }
        }
    }

    /// Run one driven step under the full retry policy.
    async fn run_step<T, F, Fut>(
        &self,
        id: &str,
        node_id: &str,
        what: &str,
        limit: Duration,
        mut op: F,
    ) -> Result<T, StepFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let mut attempt = 1;
        loop {
            self.await_node(node_id).await?;
            match self.retry_transient(what, limit, &mut op).await {
                Ok(value) => return Ok(value),
                Err(ClusterError::Fatal(msg)) => {
                    return Err(StepFailure::Fatal(format!("{}: {}", what, msg)))
                }
                Err(e) if attempt >= self.config.attempt_ceiling => {
                    return Err(StepFailure::Exhausted(format!(
                        "{} failed after {} attempts: {}",
                        what, attempt, e
                    )))
                }
                Err(e) => {
                    warn!(deployment_id = %id, attempt, "{} failed, retrying: {}", what, e);
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------------

    /// Validate, resolve the repository and record the deployment in
    /// `pending`; the rest happens in the background.
    pub async fn create(
        self: &Arc<Self>,
        user_id: Option<String>,
        node_id: &str,
        req: CreateDeploymentRequest,
        credential: Credential,
    ) -> DeployResult<CreateDeploymentResponse> {
        let canonical = self.builder.build(&req)?;
        let node = self.node(node_id).await?;

        let (ns, name, path) = (
            canonical.namespace.clone(),
            canonical.name.clone(),
            canonical.context_path.clone(),
        );
        let conflict = execute_async(&self.db, move |conn| {
            deployment_store::find_live_conflict(conn, &ns, &name, &path, None)
                .map_err(DeployError::from)
        })
        .await?;
        if let Some(msg) = conflict {
            return Err(DeployError::Conflict(msg));
        }

        let resolved = self
            .source
            .resolve(&canonical.repository, &credential)
            .await?;

        let mut spec = canonical.spec.clone();
        let dockerfile_given = req
            .configuration
            .build_config
            .as_ref()
            .and_then(|b| b.dockerfile.as_ref())
            .is_some();
        if let (false, Some(found)) = (dockerfile_given, resolved.dockerfile) {
            spec.build.dockerfile = found;
        }

        let id = Uuid::new_v4().to_string();
        let claim = self.claim(&id, OperationKind::Create)?;

        let insert_id = id.clone();
        let node_id = node.id.clone();
        let repository = resolved.repository;
        execute_async(&self.db, move |conn| {
            deployment_store::insert_deployment(
                conn,
                &NewDeployment {
                    id: &insert_id,
                    user_id: user_id.as_deref(),
                    node_id: &node_id,
                    name: &canonical.name,
                    namespace: &canonical.namespace,
                    context_path: &canonical.context_path,
                    repository: &repository,
                    configuration: &spec,
                },
                now_secs(),
            )
        })
        .await?;

        info!(deployment_id = %id, node = %node.name, "Deployment created");

        claim.hand_off();
        self.spawn_drive(
            id.clone(),
            DrivePlan::Create {
                credential: Some(credential),
            },
        );

        Ok(CreateDeploymentResponse {
            id,
            status: Pending,
        })
    }

    /// Re-enter `deploying`: a rolling restart when running, a rebuild when failed.
    pub async fn restart(
        self: &Arc<Self>,
        id: &str,
        credential: Option<Credential>,
    ) -> DeployResult<Deployment> {
        let claim = self.claim(id, OperationKind::Restart)?;
        let deployment = self.get(id).await?;

        let plan = match deployment.status {
            Running => DrivePlan::RollingRestart,
            Failed => DrivePlan::Rebuild { credential },
            other => {
                return Err(DeployError::InvalidState(format!(
                    "cannot restart a deployment in status {}",
                    other
                )))
            }
        };

        let from: &'static [DeploymentStatus] = match deployment.status {
            Running => &[Running],
            _ => &[Failed],
        };
        if !self.transition(id, from, Deploying, None).await? {
            return Err(DeployError::Conflict(format!(
                "deployment {} changed status concurrently",
                id
            )));
        }

        info!(deployment_id = %id, from = %deployment.status, "Restarting deployment");
        claim.hand_off();
        self.spawn_drive(id.to_string(), plan);
        self.get(id).await
    }

    /// Change the replica count of a running deployment.
    pub async fn scale(&self, id: &str, replicas: i64) -> DeployResult<Deployment> {
        if replicas < 1 {
            return Err(DeployError::validation("replicas", "must be at least 1"));
        }
        let _claim = self.claim(id, OperationKind::Scale)?;
        let deployment = self.get(id).await?;
        if deployment.status != Running {
            return Err(DeployError::InvalidState(format!(
                "can only scale a running deployment (status is {})",
                deployment.status
            )));
        }

        let patch = UpdateDeploymentRequest {
            replicas: Some(replicas),
            ..Default::default()
        };
        let canonical = self.builder.apply_update(&deployment.canonical(), &patch)?;
        let target = canonical.spec.replicas;
        self.save_configuration(id, canonical.spec).await?;

        let (ns, name) = (deployment.namespace.as_str(), deployment.name.as_str());
        let result = self
            .retry_transient("scale", self.config.cluster_timeout, &mut || {
                self.cluster.scale(ns, name, target)
            })
            .await;
        self.settle_inline(id, "scale", result).await?;

        info!(deployment_id = %id, replicas = target, "Deployment scaled");
        self.get(id).await
    }

    /// Edit replicas, environment, health check or resources. A running
    /// deployment is re-applied; a failed one keeps the change for the next restart.
    pub async fn update(&self, id: &str, patch: UpdateDeploymentRequest) -> DeployResult<Deployment> {
        let _claim = self.claim(id, OperationKind::Update)?;
        let deployment = self.get(id).await?;
        if deployment.status == Stopped {
            return Err(DeployError::InvalidState(
                "cannot update a stopped deployment".to_string(),
            ));
        }

        let canonical = self.builder.apply_update(&deployment.canonical(), &patch)?;
        self.save_configuration(id, canonical.spec.clone()).await?;

        if deployment.status == Running {
            let node = self.node(&deployment.node_id).await?;
            let image = deployment
                .workload
                .image
                .clone()
                .unwrap_or_else(|| self.image_for(&deployment));
            let mut updated = deployment.clone();
            updated.configuration = canonical.spec;
            let manifest = WorkloadManifest::for_deployment(
                &updated,
                &node.name,
                &image,
                &self.config.ingress_host,
            );
            let result = self
                .retry_transient("apply", self.config.cluster_timeout, &mut || {
                    self.cluster.apply(&manifest)
                })
                .await;
            if let Some(workload) = self.settle_inline(id, "apply", result).await? {
                self.save_workload(id, workload).await?;
            }
        }

        info!(deployment_id = %id, "Deployment updated");
        self.get(id).await
    }

    /// Outcome handling for inline cluster calls on a running deployment:
    /// exhausted transient retries are left to drift reconciliation, anything
    /// else fails the deployment.
    async fn settle_inline<T>(
        &self,
        id: &str,
        what: &str,
        result: Result<T, ClusterError>,
    ) -> DeployResult<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(ClusterError::Transient(msg)) => {
                warn!(deployment_id = %id, "{} still pending after transient errors: {}", what, msg);
                Ok(None)
            }
            Err(e) => {
                let reason = format!("{}: {}", what, e);
                self.fail(id, &reason).await?;
                Err(DeployError::FatalCluster(reason))
            }
        }
    }

    /// Tear down and mark stopped. Deleting a stopped deployment is a no-op.
    /// A delete during create or restart is deferred until that finishes.
    pub async fn delete(&self, id: &str, purge: bool) -> DeployResult<DeleteOutcome> {
        {
            let mut in_flight = self.in_flight();
            if let Some(op) = in_flight.get_mut(id) {
                return match op.kind {
                    OperationKind::Create | OperationKind::Restart => {
                        let purge = purge || op.deferred_delete.unwrap_or(false);
                        op.deferred_delete = Some(purge);
                        info!(deployment_id = %id, "Delete deferred until the running operation finishes");
                        Ok(DeleteOutcome::Deferred)
                    }
                    kind => Err(DeployError::Conflict(format!(
                        "operation already in progress on deployment {} ({:?})",
                        id, kind
                    ))),
                };
            }
        }

        let _claim = self.claim(id, OperationKind::Delete)?;
        let deployment = self.get(id).await?;
        if deployment.status == Stopped {
            if purge {
                self.purge(id).await?;
            }
            return Ok(DeleteOutcome::AlreadyStopped);
        }

        self.teardown_and_stop(&deployment, purge).await?;
        Ok(DeleteOutcome::Stopped)
    }

    async fn purge(&self, id: &str) -> DeployResult<()> {
        let id = id.to_string();
        execute_async(&self.db, move |conn| {
            deployment_store::purge_deployment(conn, &id).map_err(DeployError::from)
        })
        .await
    }

    async fn teardown_and_stop(&self, deployment: &Deployment, purge: bool) -> DeployResult<()> {
        let (ns, name) = (deployment.namespace.as_str(), deployment.name.as_str());
        let result = self
            .retry_transient("teardown", self.config.cluster_timeout, &mut || {
                self.cluster.teardown(ns, name)
            })
            .await;
        match result {
            Ok(()) | Err(ClusterError::NotFound(_)) => {}
            Err(ClusterError::Transient(msg)) => return Err(DeployError::TransientCluster(msg)),
            Err(e) => return Err(DeployError::FatalCluster(e.to_string())),
        }

        self.transition(
            &deployment.id,
            &[Pending, Deploying, Running, Failed],
            Stopped,
            Some("deleted".to_string()),
        )
        .await?;
        if purge {
            self.purge(&deployment.id).await?;
        }
        info!(deployment_id = %deployment.id, purge, "Deployment stopped");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Background drive
    // ---------------------------------------------------------------------

    fn spawn_drive(self: &Arc<Self>, id: String, plan: DrivePlan) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.drive(id, plan).await });
    }

    async fn drive(self: Arc<Self>, id: String, plan: DrivePlan) {
        let mut claim = Claim::adopt(&self, &id);

        let result = match plan {
            DrivePlan::Create { credential } => self.run_create(&id, credential).await,
            DrivePlan::RollingRestart => self.run_rolling_restart(&id).await,
            DrivePlan::Rebuild { credential } => self.build_and_apply(&id, credential).await,
        };
        if let Err(e) = result {
            error!(deployment_id = %id, "Deployment drive aborted: {}", e);
        }

        if let Some(purge) = claim.settle() {
            info!(deployment_id = %id, "Running deferred delete");
            match self.get(&id).await {
                Ok(deployment) if deployment.status != Stopped => {
                    if let Err(e) = self.teardown_and_stop(&deployment, purge).await {
                        error!(deployment_id = %id, "Deferred delete failed: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => error!(deployment_id = %id, "Deferred delete failed: {}", e),
            }
            claim.settle();
        }
    }

    async fn run_create(&self, id: &str, credential: Option<Credential>) -> DeployResult<()> {
        if !self.transition(id, &[Pending], Deploying, None).await? {
            return Ok(());
        }
        info!(deployment_id = %id, "Deploying");
        self.build_and_apply(id, credential).await
    }

    async fn build_and_apply(&self, id: &str, credential: Option<Credential>) -> DeployResult<()> {
        let deployment = self.get(id).await?;
        let spec = &deployment.configuration;

        let request = BuildRequest {
            namespace: deployment.namespace.clone(),
            workload_name: deployment.name.clone(),
            repository_full_name: deployment.repository.full_name.clone(),
            clone_url: deployment.repository.clone_url.clone(),
            branch: deployment.repository.branch.clone(),
            commit_sha: deployment.repository.commit_sha.clone(),
            dockerfile: spec.build.dockerfile.clone(),
            context: spec.build.context.clone(),
            image: self.image_for(&deployment),
            build_args: spec.build.build_args.clone(),
            credential,
        };

        let image = match self
            .run_step(id, &deployment.node_id, "image build", self.config.build_timeout, || {
                self.cluster.build_image(&request)
            })
            .await
        {
            Ok(image) => image,
            Err(failure) => return self.fail(id, failure.reason()).await,
        };
        debug!(deployment_id = %id, %image, "Image built");

        let node = match self.await_node(&deployment.node_id).await {
            Ok(node) => node,
            Err(failure) => return self.fail(id, failure.reason()).await,
        };
        let manifest =
            WorkloadManifest::for_deployment(&deployment, &node.name, &image, &self.config.ingress_host);

        match self
            .run_step(id, &deployment.node_id, "apply", self.config.cluster_timeout, || {
                self.cluster.apply(&manifest)
            })
            .await
        {
            Ok(workload) => {
                self.save_workload(id, workload).await?;
                info!(deployment_id = %id, "Workload applied, waiting for ready pods");
                Ok(())
            }
            Err(failure) => self.fail(id, failure.reason()).await,
        }
    }

    async fn run_rolling_restart(&self, id: &str) -> DeployResult<()> {
        let deployment = self.get(id).await?;
        let (ns, name) = (deployment.namespace.as_str(), deployment.name.as_str());
        match self
            .run_step(id, &deployment.node_id, "rolling restart", self.config.cluster_timeout, || {
                self.cluster.rolling_restart(ns, name)
            })
            .await
        {
            Ok(()) => {
                info!(deployment_id = %id, "Rolling restart issued");
                Ok(())
            }
            Err(failure) => self.fail(id, failure.reason()).await,
        }
    }

    // ---------------------------------------------------------------------
    // Signals from the collector
    // ---------------------------------------------------------------------

    /// Decide status changes from an observed pass. Ignored while an
    /// operation is in flight for the deployment.
    pub async fn on_health_signal(&self, id: &str, signal: HealthSignal) -> DeployResult<()> {
        if self.is_busy(id) {
            return Ok(());
        }
        let deployment = self.get(id).await?;

        match deployment.status {
            Deploying if signal.ready_pods > 0 => {
                if self.transition(id, &[Deploying], Running, None).await? {
                    info!(deployment_id = %id, ready = signal.ready_pods, "Deployment running");
                }
            }
            Deploying if signal.unhealthy_passes >= self.config.deploy_health_budget => {
                let reason = format!(
                    "health checks did not pass within {} reconciliation passes",
                    signal.unhealthy_passes
                );
                error!(deployment_id = %id, "{}", reason);
                self.transition(id, &[Deploying], Failed, Some(reason)).await?;
            }
            Running if signal.unhealthy_passes >= self.config.unhealthy_threshold => {
                let reason = format!(
                    "no ready pods for {} consecutive reconciliation passes",
                    signal.unhealthy_passes
                );
                error!(deployment_id = %id, "{}", reason);
                self.transition(id, &[Running], Failed, Some(reason)).await?;
            }
            Running if signal.desired_replicas != deployment.configuration.replicas => {
                self.reconcile_replicas(&deployment, signal.desired_replicas)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn reconcile_replicas(&self, deployment: &Deployment, observed: u32) -> DeployResult<()> {
        let Ok(_claim) = self.claim(&deployment.id, OperationKind::Reconcile) else {
            return Ok(());
        };
        let target = deployment.configuration.replicas;
        warn!(
            deployment_id = %deployment.id,
            observed,
            target,
            "Replica drift detected, re-applying stored count"
        );
        let (ns, name) = (deployment.namespace.as_str(), deployment.name.as_str());
        let result = self
            .retry_transient("scale", self.config.cluster_timeout, &mut || {
                self.cluster.scale(ns, name, target)
            })
            .await;
        self.settle_inline(&deployment.id, "drift reconciliation", result)
            .await?;
        Ok(())
    }

    /// Deployments left `pending` by a previous process cannot be driven
    /// again: their credential is gone.
    pub async fn recover_interrupted(&self) -> DeployResult<usize> {
        let pending = self
            .list(DeploymentFilter {
                status: Some(Pending),
                ..Default::default()
            })
            .await?;
        let mut count = 0;
        for deployment in pending {
            if self.is_busy(&deployment.id) {
                continue;
            }
            if self
                .transition(
                    &deployment.id,
                    &[Pending],
                    Failed,
                    Some("interrupted by a control plane restart".to_string()),
                )
                .await?
            {
                count += 1;
            }
        }
        if count > 0 {
            warn!("Marked {} interrupted deployment(s) failed", count);
        }
        Ok(count)
    }
}
