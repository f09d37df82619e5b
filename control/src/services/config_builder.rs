//! Validation and normalisation of deployment requests.
//!
//! `ConfigBuilder::build` is pure: it never touches the store or the cluster.
//! Every violated constraint is collected before returning.

use crate::error::{DeployError, DeployResult, FieldViolation};
use crate::services::quantity::{parse_quantity, Quantity};
use crate::types::{
    BuildDescriptor, CanonicalDeployment, CreateDeploymentRequest, DeploymentSpec, HealthCheck,
    ImagePullPolicy, RawBuildConfig, RawConfiguration, RawHealthCheck, RepositoryCoordinates,
    RestartPolicy, UpdateDeploymentRequest,
};

pub const MAX_NAME_LEN: usize = 63;

/// Values substituted for omitted optional fields.
#[derive(Debug, Clone)]
pub struct BuilderDefaults {
    pub namespace: String,
    pub replicas: u32,
    pub container_port: u16,
    pub service_port: u16,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

impl Default for BuilderDefaults {
    fn default() -> Self {
        Self {
            namespace: "node-deployer-apps".to_string(),
            replicas: 2,
            container_port: 8080,
            service_port: 80,
            cpu_request: "250m".to_string(),
            cpu_limit: "500m".to_string(),
            memory_request: "256Mi".to_string(),
            memory_limit: "512Mi".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    defaults: BuilderDefaults,
}

/// Accumulates violations while fields are normalised.
#[derive(Default)]
struct Violations(Vec<FieldViolation>);

impl Violations {
    fn push(&mut self, field: &str, message: impl Into<String>) {
        self.0.push(FieldViolation::new(field, message));
    }

    fn finish<T>(self, value: T) -> DeployResult<T> {
        if self.0.is_empty() {
            Ok(value)
        } else {
            Err(DeployError::Validation(self.0))
        }
    }
}

/// True for `^[a-z0-9]([-a-z0-9]*[a-z0-9])?$` up to 63 characters.
pub fn is_workload_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LEN {
        return false;
    }
    let ok = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    ok(&bytes[0])
        && ok(&bytes[bytes.len() - 1])
        && bytes.iter().all(|b| ok(b) || *b == b'-')
}

/// Derive a workload name from free text (a repository name, usually).
pub fn sanitize_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            'A'..='Z' => out.push(c.to_ascii_lowercase()),
            'a'..='z' | '0'..='9' | '-' => out.push(c),
            '_' | ' ' | '.' => out.push('-'),
            _ => {}
        }
    }
    let mut collapsed = String::with_capacity(out.len());
    for c in out.chars() {
        if c == '-' && collapsed.ends_with('-') {
            continue;
        }
        collapsed.push(c);
    }
    let trimmed = collapsed.trim_matches('-');
    let mut name: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    while name.ends_with('-') {
        name.pop();
    }
    name
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn normalize_context_path(raw: &str) -> Option<String> {
    let path = raw.trim();
    if !path.starts_with('/') || path.chars().any(|c| c.is_whitespace()) {
        return None;
    }
    let mut normalized = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && normalized.ends_with('/') {
            continue;
        }
        normalized.push(c);
    }
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    Some(normalized)
}

fn port(v: &mut Violations, field: &str, raw: Option<i64>, default: u16) -> u16 {
    match raw {
        None => default,
        Some(p) if (1..=65535).contains(&p) => p as u16,
        Some(p) => {
            v.push(field, format!("must be between 1 and 65535, got {}", p));
            default
        }
    }
}

fn positive(v: &mut Violations, field: &str, raw: Option<i64>, default: u32) -> u32 {
    match raw {
        None => default,
        Some(n) if n >= 1 && n <= u32::MAX as i64 => n as u32,
        Some(n) => {
            v.push(field, format!("must be a positive integer, got {}", n));
            default
        }
    }
}

fn non_negative(v: &mut Violations, field: &str, raw: Option<i64>, default: u32) -> u32 {
    match raw {
        None => default,
        Some(n) if n >= 0 && n <= u32::MAX as i64 => n as u32,
        Some(n) => {
            v.push(field, format!("must not be negative, got {}", n));
            default
        }
    }
}

fn quantity(
    v: &mut Violations,
    field: &str,
    raw: Option<&String>,
    default: &str,
) -> (String, Option<Quantity>) {
    let value = raw
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| default.to_string());
    match parse_quantity(&value) {
        Ok(q) if q.is_zero() => {
            v.push(field, "must be greater than zero");
            (value, None)
        }
        Ok(q) => (value, Some(q)),
        Err(e) => {
            v.push(field, e.to_string());
            (value, None)
        }
    }
}

fn non_empty(v: &mut Violations, field: &str, raw: Option<&String>, default: String) -> String {
    match raw {
        None => default,
        Some(s) if s.trim().is_empty() => {
            v.push(field, "must not be empty");
            default
        }
        Some(s) => s.trim().to_string(),
    }
}

impl ConfigBuilder {
    pub fn new(defaults: BuilderDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &BuilderDefaults {
        &self.defaults
    }

    pub fn build(&self, req: &CreateDeploymentRequest) -> DeployResult<CanonicalDeployment> {
        let mut v = Violations::default();
        let d = &self.defaults;
        let cfg = &req.configuration;

        let repository = RepositoryCoordinates {
            owner: req.github_repo.owner.trim().to_string(),
            name: req.github_repo.name.trim().to_string(),
            branch: req.github_repo.branch.trim().to_string(),
        };
        if repository.owner.is_empty() {
            v.push("githubRepo.owner", "is required");
        }
        if repository.name.is_empty() {
            v.push("githubRepo.name", "is required");
        }

        let name = match req.name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => sanitize_name(&repository.name),
        };
        if name.is_empty() {
            v.push("name", "is required when it cannot be derived from the repository");
        } else if !is_workload_name(&name) {
            v.push(
                "name",
                "must be at most 63 lowercase alphanumerics or '-', starting and ending alphanumeric",
            );
        }

        let namespace = match req.namespace.as_deref().map(str::trim) {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ => d.namespace.clone(),
        };
        if !is_workload_name(&namespace) {
            v.push("namespace", "must be a valid namespace name");
        }

        let context_path = match req.context_path.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => match normalize_context_path(p) {
                Some(p) => p,
                None => {
                    v.push("contextPath", "must be a path starting with '/'");
                    p.to_string()
                }
            },
            Some(_) => {
                v.push("contextPath", "must not be empty");
                String::new()
            }
            None => format!("/{}", name),
        };

        let spec = self.build_spec(&mut v, cfg, &repository);

        v.finish(CanonicalDeployment {
            name,
            namespace,
            context_path,
            repository,
            spec,
        })
    }

    fn build_spec(
        &self,
        v: &mut Violations,
        cfg: &RawConfiguration,
        repository: &RepositoryCoordinates,
    ) -> DeploymentSpec {
        let d = &self.defaults;

        let replicas = positive(v, "replicas", cfg.replicas, d.replicas);
        let container_port = port(v, "containerPort", cfg.container_port, d.container_port);
        let service_port = port(v, "servicePort", cfg.service_port, d.service_port);

        let (cpu_request, cpu_req_q) =
            quantity(v, "cpuRequest", cfg.cpu_request.as_ref(), &d.cpu_request);
        let (cpu_limit, cpu_lim_q) = quantity(v, "cpuLimit", cfg.cpu_limit.as_ref(), &d.cpu_limit);
        if let (Some(req), Some(lim)) = (cpu_req_q, cpu_lim_q) {
            if req > lim {
                v.push("cpuRequest", "must not exceed cpuLimit");
            }
        }

        let (memory_request, mem_req_q) = quantity(
            v,
            "memoryRequest",
            cfg.memory_request.as_ref(),
            &d.memory_request,
        );
        let (memory_limit, mem_lim_q) =
            quantity(v, "memoryLimit", cfg.memory_limit.as_ref(), &d.memory_limit);
        if let (Some(req), Some(lim)) = (mem_req_q, mem_lim_q) {
            if req > lim {
                v.push("memoryRequest", "must not exceed memoryLimit");
            }
        }

        let image_pull_policy = match cfg.image_pull_policy.as_deref() {
            None => ImagePullPolicy::IfNotPresent,
            Some(p) => p.parse().unwrap_or_else(|_| {
                v.push(
                    "imagePullPolicy",
                    "must be one of Always, IfNotPresent, Never",
                );
                ImagePullPolicy::IfNotPresent
            }),
        };
        let restart_policy = match cfg.restart_policy.as_deref() {
            None => RestartPolicy::Always,
            Some(p) => p.parse().unwrap_or_else(|_| {
                v.push("restartPolicy", "must be one of Always, OnFailure, Never");
                RestartPolicy::Always
            }),
        };

        let environment_vars = cfg.environment_vars.clone().unwrap_or_default();
        for key in environment_vars.keys() {
            if !is_env_name(key) {
                v.push(
                    &format!("environmentVars.{}", key),
                    "must be a valid environment variable name",
                );
            }
        }

        let health_check = self.health_check(v, cfg.health_check.as_ref(), container_port);
        let build = self.build_descriptor(v, cfg.build_config.as_ref(), repository);

        DeploymentSpec {
            replicas,
            container_port,
            service_port,
            cpu_request,
            cpu_limit,
            memory_request,
            memory_limit,
            image_pull_policy,
            restart_policy,
            environment_vars,
            health_check,
            build,
        }
    }

    fn health_check(
        &self,
        v: &mut Violations,
        raw: Option<&RawHealthCheck>,
        container_port: u16,
    ) -> HealthCheck {
        let empty = RawHealthCheck::default();
        let raw = raw.unwrap_or(&empty);

        let path = match raw.path.as_deref().map(str::trim) {
            None => "/health".to_string(),
            Some(p) if p.starts_with('/') => p.to_string(),
            Some(p) => {
                v.push("healthCheck.path", "must start with '/'");
                p.to_string()
            }
        };

        HealthCheck {
            enabled: raw.enabled.unwrap_or(true),
            path,
            port: port(v, "healthCheck.port", raw.port, container_port),
            initial_delay_seconds: non_negative(
                v,
                "healthCheck.initialDelaySeconds",
                raw.initial_delay_seconds,
                30,
            ),
            period_seconds: positive(v, "healthCheck.periodSeconds", raw.period_seconds, 10),
            timeout_seconds: positive(v, "healthCheck.timeoutSeconds", raw.timeout_seconds, 5),
            success_threshold: positive(
                v,
                "healthCheck.successThreshold",
                raw.success_threshold,
                1,
            ),
            failure_threshold: positive(
                v,
                "healthCheck.failureThreshold",
                raw.failure_threshold,
                3,
            ),
        }
    }

    fn build_descriptor(
        &self,
        v: &mut Violations,
        raw: Option<&RawBuildConfig>,
        repository: &RepositoryCoordinates,
    ) -> BuildDescriptor {
        let empty = RawBuildConfig::default();
        let raw = raw.unwrap_or(&empty);

        let default_image = format!("{}/{}", repository.owner, repository.name).to_lowercase();
        BuildDescriptor {
            dockerfile: non_empty(
                v,
                "buildConfig.dockerfile",
                raw.dockerfile.as_ref(),
                "Dockerfile".to_string(),
            ),
            context: non_empty(
                v,
                "buildConfig.buildContext",
                raw.build_context.as_ref(),
                ".".to_string(),
            ),
            image_name: non_empty(v, "buildConfig.imageName", raw.image_name.as_ref(), default_image),
            image_tag: non_empty(
                v,
                "buildConfig.imageTag",
                raw.image_tag.as_ref(),
                "latest".to_string(),
            ),
            build_args: raw.build_args.clone().unwrap_or_default(),
        }
    }

    /// Merge an update into an existing canonical deployment and re-validate it.
    pub fn apply_update(
        &self,
        current: &CanonicalDeployment,
        patch: &UpdateDeploymentRequest,
    ) -> DeployResult<CanonicalDeployment> {
        let mut req = to_request(current);
        let cfg = &mut req.configuration;
        if patch.replicas.is_some() {
            cfg.replicas = patch.replicas;
        }
        if let Some(env) = &patch.environment_vars {
            cfg.environment_vars = Some(env.clone());
        }
        if let Some(hc) = &patch.health_check {
            let mut merged = cfg.health_check.clone().unwrap_or_default();
            merge_health_check(&mut merged, hc);
            cfg.health_check = Some(merged);
        }
        for (slot, value) in [
            (&mut cfg.cpu_request, &patch.cpu_request),
            (&mut cfg.cpu_limit, &patch.cpu_limit),
            (&mut cfg.memory_request, &patch.memory_request),
            (&mut cfg.memory_limit, &patch.memory_limit),
        ] {
            if value.is_some() {
                *slot = value.clone();
            }
        }
        self.build(&req)
    }
}

fn merge_health_check(into: &mut RawHealthCheck, patch: &RawHealthCheck) {
    if patch.enabled.is_some() {
        into.enabled = patch.enabled;
    }
    if patch.path.is_some() {
        into.path = patch.path.clone();
    }
    if patch.port.is_some() {
        into.port = patch.port;
    }
    if patch.initial_delay_seconds.is_some() {
        into.initial_delay_seconds = patch.initial_delay_seconds;
    }
    if patch.period_seconds.is_some() {
        into.period_seconds = patch.period_seconds;
    }
    if patch.timeout_seconds.is_some() {
        into.timeout_seconds = patch.timeout_seconds;
    }
    if patch.success_threshold.is_some() {
        into.success_threshold = patch.success_threshold;
    }
    if patch.failure_threshold.is_some() {
        into.failure_threshold = patch.failure_threshold;
    }
}

/// Express a canonical deployment as a fully-populated request.
pub fn to_request(canonical: &CanonicalDeployment) -> CreateDeploymentRequest {
    let spec = &canonical.spec;
    let hc = &spec.health_check;
    CreateDeploymentRequest {
        name: Some(canonical.name.clone()),
        context_path: Some(canonical.context_path.clone()),
        namespace: Some(canonical.namespace.clone()),
        github_repo: canonical.repository.clone(),
        configuration: RawConfiguration {
            replicas: Some(spec.replicas as i64),
            container_port: Some(spec.container_port as i64),
            service_port: Some(spec.service_port as i64),
            cpu_request: Some(spec.cpu_request.clone()),
            cpu_limit: Some(spec.cpu_limit.clone()),
            memory_request: Some(spec.memory_request.clone()),
            memory_limit: Some(spec.memory_limit.clone()),
            image_pull_policy: Some(spec.image_pull_policy.as_str().to_string()),
            restart_policy: Some(spec.restart_policy.as_str().to_string()),
            environment_vars: Some(spec.environment_vars.clone()),
            health_check: Some(RawHealthCheck {
                enabled: Some(hc.enabled),
                path: Some(hc.path.clone()),
                port: Some(hc.port as i64),
                initial_delay_seconds: Some(hc.initial_delay_seconds as i64),
                period_seconds: Some(hc.period_seconds as i64),
                timeout_seconds: Some(hc.timeout_seconds as i64),
                success_threshold: Some(hc.success_threshold as i64),
                failure_threshold: Some(hc.failure_threshold as i64),
            }),
            build_config: Some(RawBuildConfig {
                dockerfile: Some(spec.build.dockerfile.clone()),
                build_context: Some(spec.build.context.clone()),
                image_name: Some(spec.build.image_name.clone()),
                image_tag: Some(spec.build.image_tag.clone()),
                build_args: Some(spec.build.build_args.clone()),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn demo_request() -> CreateDeploymentRequest {
        CreateDeploymentRequest {
            name: Some("demo".to_string()),
            github_repo: RepositoryCoordinates {
                owner: "acme".to_string(),
                name: "Demo_App".to_string(),
                branch: "main".to_string(),
            },
            configuration: RawConfiguration {
                replicas: Some(2),
                container_port: Some(8080),
                memory_limit: Some("512Mi".to_string()),
                cpu_limit: Some("500m".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn violated_fields(err: DeployError) -> Vec<String> {
        match err {
            DeployError::Validation(v) => v.into_iter().map(|f| f.field).collect(),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_defaults_applied() {
        let builder = ConfigBuilder::default();
        let c = builder.build(&demo_request()).unwrap();

        assert_eq!(c.name, "demo");
        assert_eq!(c.namespace, "node-deployer-apps");
        assert_eq!(c.context_path, "/demo");
        assert_eq!(c.spec.service_port, 80);
        assert_eq!(c.spec.memory_request, "256Mi");
        assert_eq!(c.spec.cpu_request, "250m");
        assert_eq!(c.spec.image_pull_policy, ImagePullPolicy::IfNotPresent);
        assert_eq!(c.spec.restart_policy, RestartPolicy::Always);
        assert_eq!(c.spec.health_check.port, 8080);
        assert_eq!(c.spec.health_check.failure_threshold, 3);
        assert_eq!(c.spec.build.image_name, "acme/demo_app");
        assert_eq!(c.spec.build.image_tag, "latest");
        assert_eq!(c.spec.build.context, ".");
    }

    #[test]
    fn test_name_derived_from_repository() {
        let mut req = demo_request();
        req.name = None;
        let c = ConfigBuilder::default().build(&req).unwrap();
        assert_eq!(c.name, "demo-app");
        assert_eq!(c.context_path, "/demo-app");
    }

    #[test]
    fn test_zero_replicas_names_field() {
        let mut req = demo_request();
        req.configuration.replicas = Some(0);
        let fields = violated_fields(ConfigBuilder::default().build(&req).unwrap_err());
        assert_eq!(fields, vec!["replicas".to_string()]);
    }

    #[test]
    fn test_every_violation_reported() {
        let mut req = demo_request();
        req.name = Some("Bad_Name".to_string());
        req.context_path = Some("no-slash".to_string());
        req.configuration.replicas = Some(-1);
        req.configuration.container_port = Some(70000);
        req.configuration.memory_limit = Some("lots".to_string());
        req.configuration.cpu_request = Some("2".to_string());
        req.configuration.image_pull_policy = Some("Sometimes".to_string());
        req.configuration.health_check = Some(RawHealthCheck {
            failure_threshold: Some(0),
            ..Default::default()
        });
        req.configuration.environment_vars =
            Some(BTreeMap::from([("1BAD".to_string(), "x".to_string())]));

        let fields = violated_fields(ConfigBuilder::default().build(&req).unwrap_err());
        for expected in [
            "name",
            "contextPath",
            "replicas",
            "containerPort",
            "memoryLimit",
            "cpuRequest",
            "imagePullPolicy",
            "healthCheck.failureThreshold",
            "environmentVars.1BAD",
        ] {
            assert!(
                fields.iter().any(|f| f == expected),
                "missing violation for {}: {:?}",
                expected,
                fields
            );
        }
    }

    #[test]
    fn test_validation_is_idempotent() {
        let builder = ConfigBuilder::default();
        let mut req = demo_request();
        req.context_path = Some("//demo//api/".to_string());
        req.configuration.environment_vars =
            Some(BTreeMap::from([("PORT".to_string(), "8080".to_string())]));

        let first = builder.build(&req).unwrap();
        assert_eq!(first.context_path, "/demo/api");
        let second = builder.build(&to_request(&first)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_update_revalidates() {
        let builder = ConfigBuilder::default();
        let current = builder.build(&demo_request()).unwrap();

        let patched = builder
            .apply_update(
                &current,
                &UpdateDeploymentRequest {
                    replicas: Some(4),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(patched.spec.replicas, 4);
        assert_eq!(patched.spec.container_port, 8080);

        let err = builder
            .apply_update(
                &current,
                &UpdateDeploymentRequest {
                    memory_request: Some("1Gi".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(violated_fields(err), vec!["memoryRequest".to_string()]);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("My Cool_App.v2"), "my-cool-app-v2");
        assert_eq!(sanitize_name("--x--"), "x");
        assert_eq!(sanitize_name("ünï"), "n");
        assert_eq!(sanitize_name(&"a".repeat(80)).len(), MAX_NAME_LEN);
        assert!(is_workload_name("a-1"));
        assert!(!is_workload_name("-a"));
        assert!(!is_workload_name("A"));
    }
}
