use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::kubernetes::KubernetesConfig;
use crate::services::collector::CollectorConfig;
use crate::services::config_builder::BuilderDefaults;
use crate::services::OrchestratorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClusterBackendKind {
    /// In-process cluster for development and tests
    Simulated,
    Kubernetes,
}

impl ClusterBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterBackendKind::Simulated => "simulated",
            ClusterBackendKind::Kubernetes => "kubernetes",
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "deployer-control")]
#[command(about = "Node deployer control plane", long_about = None)]
pub struct Args {
    /// Bind address for HTTP server
    #[arg(long, env = "DEPLOYER_BIND", default_value = "0.0.0.0:8080")]
    pub bind: String,

    /// Database file path
    #[arg(long, env = "DEPLOYER_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Log level (RUST_LOG overrides when set)
    #[arg(long, env = "DEPLOYER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// TLS certificate (PEM); serves HTTPS together with --tls-key
    #[arg(long, env = "DEPLOYER_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "DEPLOYER_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Allowed CORS origins, comma separated; any origin when empty
    #[arg(long, env = "DEPLOYER_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Seconds without a heartbeat before a node is offline
    #[arg(long, env = "DEPLOYER_LIVENESS_WINDOW_SECS", default_value_t = 30)]
    pub liveness_window_secs: u64,

    #[arg(long, env = "DEPLOYER_SWEEP_INTERVAL_SECS", default_value_t = 10)]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "DEPLOYER_CLUSTER_INTERVAL_SECS", default_value_t = 10)]
    pub cluster_interval_secs: u64,

    #[arg(long, env = "DEPLOYER_DEPLOYMENT_INTERVAL_SECS", default_value_t = 10)]
    pub deployment_interval_secs: u64,

    /// Consecutive zero-ready passes before a running deployment fails
    #[arg(long, env = "DEPLOYER_UNHEALTHY_THRESHOLD", default_value_t = 3)]
    pub unhealthy_threshold: u32,

    /// Zero-ready passes a deploying workload gets before it fails
    #[arg(long, env = "DEPLOYER_DEPLOY_HEALTH_BUDGET", default_value_t = 30)]
    pub deploy_health_budget: u32,

    #[arg(long, env = "DEPLOYER_ATTEMPT_CEILING", default_value_t = 5)]
    pub attempt_ceiling: u32,

    #[arg(long, env = "DEPLOYER_TRANSIENT_CEILING", default_value_t = 8)]
    pub transient_ceiling: u32,

    #[arg(long, env = "DEPLOYER_BACKOFF_BASE_MS", default_value_t = 500)]
    pub backoff_base_ms: u64,

    #[arg(long, env = "DEPLOYER_BACKOFF_CAP_MS", default_value_t = 30_000)]
    pub backoff_cap_ms: u64,

    #[arg(long, env = "DEPLOYER_CLUSTER_TIMEOUT_SECS", default_value_t = 10)]
    pub cluster_timeout_secs: u64,

    #[arg(long, env = "DEPLOYER_BUILD_TIMEOUT_SECS", default_value_t = 600)]
    pub build_timeout_secs: u64,

    #[arg(long, env = "DEPLOYER_SESSION_TTL_SECS", default_value_t = 86_400)]
    pub session_ttl_secs: i64,

    #[arg(long, env = "DEPLOYER_CLUSTER_BACKEND", value_enum, default_value_t = ClusterBackendKind::Simulated)]
    pub cluster_backend: ClusterBackendKind,

    #[arg(long, env = "DEPLOYER_K8S_API_URL", default_value = "https://kubernetes.default.svc")]
    pub k8s_api_url: String,

    /// Bearer token for the Kubernetes API
    #[arg(long, env = "DEPLOYER_K8S_TOKEN", hide_env_values = true)]
    pub k8s_token: Option<String>,

    #[arg(long, env = "DEPLOYER_K8S_INSECURE", default_value_t = false)]
    pub k8s_insecure: bool,

    /// Host deployments are exposed on
    #[arg(long, env = "DEPLOYER_INGRESS_HOST", default_value = "localhost")]
    pub ingress_host: String,

    #[arg(long, env = "DEPLOYER_BUILDER_IMAGE", default_value = "gcr.io/kaniko-project/executor:latest")]
    pub builder_image: String,

    /// Registry prefix for built images
    #[arg(long, env = "DEPLOYER_IMAGE_REGISTRY")]
    pub image_registry: Option<String>,

    #[arg(long, env = "DEPLOYER_GITHUB_API_URL", default_value = "https://api.github.com")]
    pub github_api_url: String,

    #[arg(long, env = "DEPLOYER_DEFAULT_NAMESPACE", default_value = "node-deployer-apps")]
    pub default_namespace: String,

    #[arg(long, env = "DEPLOYER_DEFAULT_REPLICAS", default_value_t = 2)]
    pub default_replicas: u32,

    #[arg(long, env = "DEPLOYER_DEFAULT_CPU_REQUEST", default_value = "250m")]
    pub default_cpu_request: String,

    #[arg(long, env = "DEPLOYER_DEFAULT_CPU_LIMIT", default_value = "500m")]
    pub default_cpu_limit: String,

    #[arg(long, env = "DEPLOYER_DEFAULT_MEMORY_REQUEST", default_value = "256Mi")]
    pub default_memory_request: String,

    #[arg(long, env = "DEPLOYER_DEFAULT_MEMORY_LIMIT", default_value = "512Mi")]
    pub default_memory_limit: String,
}

impl Args {
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn builder_defaults(&self) -> BuilderDefaults {
        BuilderDefaults {
            namespace: self.default_namespace.clone(),
            replicas: self.default_replicas,
            cpu_request: self.default_cpu_request.clone(),
            cpu_limit: self.default_cpu_limit.clone(),
            memory_request: self.default_memory_request.clone(),
            memory_limit: self.default_memory_limit.clone(),
            ..BuilderDefaults::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            attempt_ceiling: self.attempt_ceiling.max(1),
            transient_ceiling: self.transient_ceiling,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            cluster_timeout: Duration::from_secs(self.cluster_timeout_secs),
            build_timeout: Duration::from_secs(self.build_timeout_secs),
            liveness_window: self.liveness_window(),
            unhealthy_threshold: self.unhealthy_threshold.max(1),
            deploy_health_budget: self.deploy_health_budget.max(1),
            ingress_host: self.ingress_host.clone(),
            image_registry: self.image_registry.clone().filter(|r| !r.is_empty()),
        }
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            cluster_interval: Duration::from_secs(self.cluster_interval_secs.max(1)),
            deployment_interval: Duration::from_secs(self.deployment_interval_secs.max(1)),
            liveness_window: self.liveness_window(),
            call_timeout: Duration::from_secs(self.cluster_timeout_secs),
        }
    }

    pub fn kubernetes_config(&self) -> KubernetesConfig {
        KubernetesConfig {
            api_url: self.k8s_api_url.clone(),
            token: self.k8s_token.clone(),
            accept_invalid_certs: self.k8s_insecure,
            request_timeout: Duration::from_secs(self.cluster_timeout_secs),
            builder_image: self.builder_image.clone(),
            build_timeout: Duration::from_secs(self.build_timeout_secs),
            build_poll_interval: Duration::from_secs(2),
        }
    }
}
