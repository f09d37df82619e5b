//! Rendering of a deployment into typed Kubernetes objects.

use k8s_openapi::api::apps::v1 as apps;
use k8s_openapi::api::batch::v1 as batch;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::networking::v1 as networking;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::BuildRequest;
use crate::types::{Deployment, DeploymentSpec, WorkloadInfo};

pub const MANAGED_BY: &str = "node-deployer";
pub const FIELD_MANAGER: &str = "node-deployer";

/// The desired cluster state of one deployment, backend-independent.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadManifest {
    pub deployment_id: String,
    pub name: String,
    pub namespace: String,
    pub context_path: String,
    pub repository_full_name: String,
    /// Cluster node name the pods are pinned to.
    pub node_name: String,
    pub image: String,
    pub ingress_host: String,
    pub spec: DeploymentSpec,
}

fn string_map<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn config_map_name(workload: &str) -> String {
    format!("{}-config", workload)
}

pub fn service_name(workload: &str) -> String {
    format!("{}-service", workload)
}

pub fn ingress_name(workload: &str) -> String {
    format!("{}-ingress", workload)
}

pub fn namespace_object(namespace: &str) -> corev1::Namespace {
    corev1::Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            labels: Some(string_map([("managed-by", MANAGED_BY)])),
            ..Default::default()
        },
        ..Default::default()
    }
}

impl WorkloadManifest {
    pub fn for_deployment(
        deployment: &Deployment,
        node_name: &str,
        image: &str,
        ingress_host: &str,
    ) -> Self {
        Self {
            deployment_id: deployment.id.clone(),
            name: deployment.name.clone(),
            namespace: deployment.namespace.clone(),
            context_path: deployment.context_path.clone(),
            repository_full_name: deployment.repository.full_name.clone(),
            node_name: node_name.to_string(),
            image: image.to_string(),
            ingress_host: ingress_host.to_string(),
            spec: deployment.configuration.clone(),
        }
    }

    pub fn config_map_name(&self) -> Option<String> {
        if self.spec.environment_vars.is_empty() {
            None
        } else {
            Some(config_map_name(&self.name))
        }
    }

    pub fn service_name(&self) -> String {
        service_name(&self.name)
    }

    pub fn ingress_name(&self) -> String {
        ingress_name(&self.name)
    }

    /// Names and addresses recorded on the deployment once applied.
    pub fn workload_info(&self) -> WorkloadInfo {
        WorkloadInfo {
            deployment_name: Some(self.name.clone()),
            service_name: Some(self.service_name()),
            ingress_name: Some(self.ingress_name()),
            config_map_name: self.config_map_name(),
            image: Some(self.image.clone()),
            url: Some(format!("http://{}{}", self.ingress_host, self.context_path)),
            internal_url: Some(format!(
                "http://{}.{}.svc.cluster.local:{}",
                self.service_name(),
                self.namespace,
                self.spec.service_port
            )),
            pod_selector: Some(format!("app={}", self.name)),
        }
    }

    fn selector(&self) -> BTreeMap<String, String> {
        string_map([("app", self.name.as_str())])
    }

    fn labels(&self) -> BTreeMap<String, String> {
        string_map([
            ("app", self.name.as_str()),
            ("managed-by", MANAGED_BY),
            ("deployment-id", self.deployment_id.as_str()),
        ])
    }

    fn metadata(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            ..Default::default()
        }
    }

    pub fn config_map_object(&self) -> Option<corev1::ConfigMap> {
        let name = self.config_map_name()?;
        Some(corev1::ConfigMap {
            metadata: self.metadata(name),
            data: Some(self.spec.environment_vars.clone()),
            ..Default::default()
        })
    }

    fn health_check(&self, initial_delay: u32, success_threshold: u32) -> corev1::Probe {
        let hc = &self.spec.health_check;
        corev1::Probe {
            http_get: Some(corev1::HTTPGetAction {
                path: Some(hc.path.clone()),
                port: IntOrString::Int(i32::from(hc.port)),
                ..Default::default()
            }),
            initial_delay_seconds: Some(initial_delay as i32),
            period_seconds: Some(hc.period_seconds as i32),
            timeout_seconds: Some(hc.timeout_seconds as i32),
            success_threshold: Some(success_threshold as i32),
            failure_threshold: Some(hc.failure_threshold as i32),
            ..Default::default()
        }
    }

    fn container(&self) -> corev1::Container {
        let spec = &self.spec;
        let quantities = |cpu: &str, memory: &str| {
            BTreeMap::from([
                ("cpu".to_string(), Quantity(cpu.to_string())),
                ("memory".to_string(), Quantity(memory.to_string())),
            ])
        };
        let hc = &spec.health_check;

        corev1::Container {
            name: self.name.clone(),
            image: Some(self.image.clone()),
            image_pull_policy: Some(spec.image_pull_policy.as_str().to_string()),
            ports: Some(vec![corev1::ContainerPort {
                container_port: i32::from(spec.container_port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            resources: Some(corev1::ResourceRequirements {
                requests: Some(quantities(&spec.cpu_request, &spec.memory_request)),
                limits: Some(quantities(&spec.cpu_limit, &spec.memory_limit)),
                ..Default::default()
            }),
            env_from: self.config_map_name().map(|name| {
                vec![corev1::EnvFromSource {
                    config_map_ref: Some(corev1::ConfigMapEnvSource {
                        name,
                        ..Default::default()
                    }),
                    ..Default::default()
                }]
            }),
            // Liveness requires successThreshold 1
            liveness_probe: hc
                .enabled
                .then(|| self.health_check(hc.initial_delay_seconds, 1)),
            readiness_probe: hc.enabled.then(|| {
                self.health_check(hc.initial_delay_seconds.min(5), hc.success_threshold)
            }),
            ..Default::default()
        }
    }

    pub fn deployment_object(&self) -> apps::Deployment {
        let mut labels = self.labels();
        labels.insert(
            "repo".to_string(),
            self.repository_full_name.replace('/', "."),
        );

        apps::Deployment {
            metadata: ObjectMeta {
                labels: Some(labels),
                ..self.metadata(self.name.clone())
            },
            spec: Some(apps::DeploymentSpec {
                replicas: Some(self.spec.replicas as i32),
                selector: LabelSelector {
                    match_labels: Some(self.selector()),
                    ..Default::default()
                },
                template: corev1::PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.selector()),
                        ..Default::default()
                    }),
                    spec: Some(corev1::PodSpec {
                        node_selector: Some(string_map([(
                            "kubernetes.io/hostname",
                            self.node_name.as_str(),
                        )])),
                        restart_policy: Some(self.spec.restart_policy.as_str().to_string()),
                        containers: vec![self.container()],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn service_object(&self) -> corev1::Service {
        corev1::Service {
            metadata: self.metadata(self.service_name()),
            spec: Some(corev1::ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.selector()),
                ports: Some(vec![corev1::ServicePort {
                    protocol: Some("TCP".to_string()),
                    port: i32::from(self.spec.service_port),
                    target_port: Some(IntOrString::Int(i32::from(self.spec.container_port))),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn ingress_object(&self) -> networking::Ingress {
        let mut metadata = self.metadata(self.ingress_name());
        metadata.annotations = Some(string_map([(
            "nginx.ingress.kubernetes.io/rewrite-target",
            "/",
        )]));

        networking::Ingress {
            metadata,
            spec: Some(networking::IngressSpec {
                rules: Some(vec![networking::IngressRule {
                    host: Some(self.ingress_host.clone()),
                    http: Some(networking::HTTPIngressRuleValue {
                        paths: vec![networking::HTTPIngressPath {
                            path: Some(self.context_path.clone()),
                            path_type: "Prefix".to_string(),
                            backend: networking::IngressBackend {
                                service: Some(networking::IngressServiceBackend {
                                    name: self.service_name(),
                                    port: Some(networking::ServiceBackendPort {
                                        number: Some(i32::from(self.spec.service_port)),
                                        ..Default::default()
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// One-shot kaniko Job that builds `req.image` from the repository.
pub fn build_job(req: &BuildRequest, job_name: &str, builder_image: &str) -> batch::Job {
    let mut context = format!(
        "git://github.com/{}.git#refs/heads/{}",
        req.repository_full_name, req.branch
    );
    if let Some(sha) = &req.commit_sha {
        context.push('#');
        context.push_str(sha);
    }
    let mut args = vec![
        format!("--context={}", context),
        format!("--dockerfile={}", req.dockerfile),
        format!("--destination={}", req.image),
    ];
    if req.context != "." {
        args.push(format!("--context-sub-path={}", req.context));
    }
    for (k, v) in &req.build_args {
        args.push(format!("--build-arg={}={}", k, v));
    }

    let env = req.credential.as_ref().map(|cred| {
        vec![corev1::EnvVar {
            name: "GIT_TOKEN".to_string(),
            value: Some(cred.expose().to_string()),
            ..Default::default()
        }]
    });

    batch::Job {
        metadata: ObjectMeta {
            name: Some(job_name.to_string()),
            namespace: Some(req.namespace.clone()),
            labels: Some(string_map([
                ("app", req.workload_name.as_str()),
                ("managed-by", MANAGED_BY),
                ("role", "image-build"),
            ])),
            ..Default::default()
        },
        spec: Some(batch::JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(300),
            template: corev1::PodTemplateSpec {
                metadata: None,
                spec: Some(corev1::PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![corev1::Container {
                        name: "kaniko".to_string(),
                        image: Some(builder_image.to_string()),
                        args: Some(args),
                        env,
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Body of a merge patch that sets the replica target.
pub fn scale_patch(replicas: u32) -> Value {
    json!({ "spec": { "replicas": replicas } })
}

/// Body of a merge patch that rolls every pod of a deployment.
pub fn restart_patch(restarted_at: &str) -> Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": { "kubectl.kubernetes.io/restartedAt": restarted_at },
                },
            },
        },
    })
}
