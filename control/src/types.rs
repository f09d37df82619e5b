use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Node Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Maintenance,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Maintenance => "maintenance",
            NodeStatus::Error => "error",
        }
    }

    /// Statuses set by an operator; the liveness sweep never overrides these.
    pub fn is_administrative(&self) -> bool {
        matches!(self, NodeStatus::Maintenance | NodeStatus::Error)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(NodeStatus::Online),
            "offline" => Ok(NodeStatus::Offline),
            "maintenance" => Ok(NodeStatus::Maintenance),
            "error" => Ok(NodeStatus::Error),
            other => Err(format!("unknown node status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCapacity {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    #[serde(default = "default_pods_capacity")]
    pub pods_capacity: u32,
    /// Total bytes across the node's local disks.
    #[serde(default)]
    pub disk_bytes: u64,
}

fn default_pods_capacity() -> u32 {
    110
}

/// Resource usage as reported by the node agent's heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReport {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub pods_running: Option<u32>,
    pub disk_used_bytes: Option<u64>,
    pub disk_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterInfo {
    pub cluster_name: String,
    pub kube_version: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeMetadata {
    pub os_type: Option<String>,
    pub architecture: Option<String>,
    pub hostname: Option<String>,
    pub kernel_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

/// Where a node physically sits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

const EARTH_RADIUS_KM: f64 = 6371.0088;

impl NodeLocation {
    /// Great-circle distance in kilometres (haversine).
    pub fn distance_km(&self, latitude: f64, longitude: f64) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
    }

    pub fn coordinates_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    pub name: String,
    pub mac_address: String,
    pub public_ip: String,
    pub private_ip: Option<String>,
    pub capacity: NodeCapacity,
    #[serde(default)]
    pub cluster_info: ClusterInfo,
    #[serde(default)]
    pub metadata: NodeMetadata,
    #[serde(default)]
    pub location: Option<NodeLocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeResponse {
    pub node_id: String,
    pub status: NodeStatus,
    /// False when an existing registration of the same hardware was refreshed.
    pub created: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNodeRequest {
    pub name: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub capacity: Option<NodeCapacity>,
    pub cluster_info: Option<ClusterInfo>,
    pub location: Option<NodeLocation>,
    /// Replaces the node's tag set.
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetNodeStatusRequest {
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub name: String,
    pub mac_address: String,
    pub public_ip: String,
    pub private_ip: Option<String>,
    pub status: NodeStatus,
    pub capacity: NodeCapacity,
    pub resources: ResourceReport,
    pub observed: NodeObservation,
    pub cluster_info: ClusterInfo,
    pub metadata: NodeMetadata,
    pub location: Option<NodeLocation>,
    pub registered_at: i64,
    pub updated_at: i64,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFilter {
    pub status: Option<NodeStatus>,
    /// `lat,lon` centre of a radius search; requires `radiusKm`.
    pub near: Option<String>,
    pub radius_km: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub total: u32,
    pub by_status: BTreeMap<String, u32>,
    pub total_cpu_cores: u64,
    pub total_memory_bytes: u64,
    pub total_pods_capacity: u64,
    pub total_disk_bytes: u64,
}

// ============================================================================
// Observed Metrics
// ============================================================================

/// Whether an observed snapshot reflects current telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Never observed.
    #[default]
    Unknown,
    Fresh,
    /// Last refresh failed or the source went silent; values are the last known ones.
    Stale,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSnapshot {
    pub freshness: Freshness,
    pub desired_pods: Option<u32>,
    pub active_pods: Option<u32>,
    pub ready_pods: Option<u32>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub restart_count: Option<u32>,
    pub observed_at: Option<i64>,
    pub stale_reason: Option<String>,
}

impl MetricsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.observed_at.is_none()
    }

    /// Keep the last known values but flag them as stale.
    pub fn into_stale(mut self, reason: impl Into<String>) -> Self {
        if self.observed_at.is_some() {
            self.freshness = Freshness::Stale;
        }
        self.stale_reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeObservation {
    pub freshness: Freshness,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub pods_running: Option<u32>,
    pub observed_at: Option<i64>,
    pub stale_reason: Option<String>,
}

impl NodeObservation {
    pub fn into_stale(mut self, reason: impl Into<String>) -> Self {
        if self.observed_at.is_some() {
            self.freshness = Freshness::Stale;
        }
        self.stale_reason = Some(reason.into());
        self
    }
}

// ============================================================================
// Deployment Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Running,
    Failed,
    Stopped,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Stopped => "stopped",
        }
    }

    /// Transitions the state machine allows.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Deploying)
                | (Pending, Failed)
                | (Pending, Stopped)
                | (Deploying, Running)
                | (Deploying, Failed)
                | (Deploying, Stopped)
                | (Running, Failed)
                | (Running, Stopped)
                | (Running, Deploying)
                | (Failed, Stopped)
                | (Failed, Deploying)
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeploymentStatus::Pending),
            "deploying" => Ok(DeploymentStatus::Deploying),
            "running" => Ok(DeploymentStatus::Running),
            "failed" => Ok(DeploymentStatus::Failed),
            "stopped" => Ok(DeploymentStatus::Stopped),
            other => Err(format!("unknown deployment status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub branch: String,
    pub commit_sha: Option<String>,
    pub clone_url: Option<String>,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImagePullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl ImagePullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImagePullPolicy::Always => "Always",
            ImagePullPolicy::IfNotPresent => "IfNotPresent",
            ImagePullPolicy::Never => "Never",
        }
    }
}

impl FromStr for ImagePullPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Always" => Ok(ImagePullPolicy::Always),
            "IfNotPresent" => Ok(ImagePullPolicy::IfNotPresent),
            "Never" => Ok(ImagePullPolicy::Never),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    Never,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "Always",
            RestartPolicy::OnFailure => "OnFailure",
            RestartPolicy::Never => "Never",
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Always" => Ok(RestartPolicy::Always),
            "OnFailure" => Ok(RestartPolicy::OnFailure),
            "Never" => Ok(RestartPolicy::Never),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub enabled: bool,
    pub path: String,
    pub port: u16,
    pub initial_delay_seconds: u32,
    pub period_seconds: u32,
    pub timeout_seconds: u32,
    pub success_threshold: u32,
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildDescriptor {
    pub dockerfile: String,
    pub context: String,
    pub image_name: String,
    pub image_tag: String,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
}

impl BuildDescriptor {
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image_name, self.image_tag)
    }
}

/// Validated, defaulted workload specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub replicas: u32,
    pub container_port: u16,
    pub service_port: u16,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub image_pull_policy: ImagePullPolicy,
    pub restart_policy: RestartPolicy,
    pub environment_vars: BTreeMap<String, String>,
    pub health_check: HealthCheck,
    pub build: BuildDescriptor,
}

/// Repository coordinates as supplied by the caller, before resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryCoordinates {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub branch: String,
}

/// Output of the configuration builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalDeployment {
    pub name: String,
    pub namespace: String,
    pub context_path: String,
    pub repository: RepositoryCoordinates,
    pub spec: DeploymentSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHealthCheck {
    pub enabled: Option<bool>,
    pub path: Option<String>,
    pub port: Option<i64>,
    pub initial_delay_seconds: Option<i64>,
    pub period_seconds: Option<i64>,
    pub timeout_seconds: Option<i64>,
    pub success_threshold: Option<i64>,
    pub failure_threshold: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBuildConfig {
    pub dockerfile: Option<String>,
    pub build_context: Option<String>,
    pub image_name: Option<String>,
    pub image_tag: Option<String>,
    pub build_args: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfiguration {
    pub replicas: Option<i64>,
    pub container_port: Option<i64>,
    pub service_port: Option<i64>,
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
    pub image_pull_policy: Option<String>,
    pub restart_policy: Option<String>,
    pub environment_vars: Option<BTreeMap<String, String>>,
    pub health_check: Option<RawHealthCheck>,
    pub build_config: Option<RawBuildConfig>,
}

/// Deployment creation request body, as sent by clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeploymentRequest {
    pub name: Option<String>,
    pub context_path: Option<String>,
    pub namespace: Option<String>,
    #[serde(default)]
    pub github_repo: RepositoryCoordinates,
    #[serde(default)]
    pub configuration: RawConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDeploymentRequest {
    pub replicas: Option<i64>,
    pub environment_vars: Option<BTreeMap<String, String>>,
    pub health_check: Option<RawHealthCheck>,
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleRequest {
    pub replicas: i64,
}

/// Names and addresses of the cluster objects backing a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkloadInfo {
    pub deployment_name: Option<String>,
    pub service_name: Option<String>,
    pub ingress_name: Option<String>,
    pub config_map_name: Option<String>,
    pub image: Option<String>,
    pub url: Option<String>,
    pub internal_url: Option<String>,
    pub pod_selector: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub user_id: Option<String>,
    pub node_id: String,
    pub name: String,
    pub namespace: String,
    pub context_path: String,
    pub status: DeploymentStatus,
    pub status_reason: Option<String>,
    pub repository: RepositoryRef,
    pub configuration: DeploymentSpec,
    pub workload: WorkloadInfo,
    pub metrics: MetricsSnapshot,
    pub created_at: i64,
    pub updated_at: i64,
    pub deployed_at: Option<i64>,
    pub last_health_check_at: Option<i64>,
}

impl Deployment {
    pub fn canonical(&self) -> CanonicalDeployment {
        CanonicalDeployment {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            context_path: self.context_path.clone(),
            repository: RepositoryCoordinates {
                owner: self.repository.owner.clone(),
                name: self.repository.name.clone(),
                branch: self.repository.branch.clone(),
            },
            spec: self.configuration.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentFilter {
    pub user_id: Option<String>,
    pub node_id: Option<String>,
    pub status: Option<DeploymentStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeploymentResponse {
    pub id: String,
    pub status: DeploymentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeleteOutcome {
    /// Cluster resources removed and the deployment marked stopped (or purged).
    Stopped,
    /// Already stopped; nothing to do.
    AlreadyStopped,
    /// An in-flight create/restart owns the deployment; teardown runs when it finishes.
    Deferred,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStats {
    pub total: u32,
    pub by_status: BTreeMap<String, u32>,
}

// ============================================================================
// Credentials
// ============================================================================

/// Short-lived GitHub token. Deliberately not `Serialize`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

// ============================================================================
// Auth Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUserRequest {
    pub email: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub full_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    pub full_name: String,
    pub created_at: i64,
    pub last_login_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: i64,
    pub user: User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateSessionResponse {
    pub valid: bool,
    pub user: User,
}

// ============================================================================
// API Envelopes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListNodesResponse {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDeploymentsResponse {
    pub deployments: Vec<Deployment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteDeploymentResponse {
    pub id: String,
    pub outcome: DeleteOutcome,
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub cluster_backend: String,
}
