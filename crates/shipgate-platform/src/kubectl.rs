//! Kubernetes via `kubectl`.
//!
//! Workloads are Deployments. Blue-green switches patch the Service selector
//! between `{service}-blue` and `{service}-green`; canary weight is the
//! `canary-weight` annotation on an ingress-nginx canary Ingress named
//! `{service}-canary`. All reads use `-o json`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use shipgate_core::{Color, ImageRef};
use shipgate_rollout::{
    PlatformError, PlatformResult, SurgePolicy, TrafficRouter, WorkloadPlatform, WorkloadStatus,
};

use crate::runner::{CommandRunner, display_command, parse_json};

const CANARY_ANNOTATION: &str = "nginx.ingress.kubernetes.io/canary";
const CANARY_WEIGHT_ANNOTATION: &str = "nginx.ingress.kubernetes.io/canary-weight";

/// Shared `kubectl` invocation settings.
#[derive(Clone)]
pub struct Kubectl {
    runner: Arc<dyn CommandRunner>,
    namespace: String,
    context: Option<String>,
}

impl Kubectl {
    pub fn new(runner: Arc<dyn CommandRunner>, namespace: impl Into<String>) -> Self {
        Self {
            runner,
            namespace: namespace.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn run(&self, args: &[&str]) -> PlatformResult<String> {
        let mut full = Vec::with_capacity(args.len() + 4);
        if let Some(context) = &self.context {
            full.push("--context".to_string());
            full.push(context.clone());
        }
        full.push("--namespace".to_string());
        full.push(self.namespace.clone());
        full.extend(args.iter().map(|a| a.to_string()));
        self.runner.run("kubectl", &full, None).await
    }

    /// `get <resource> <name> -o json`, `None` when it does not exist.
    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        resource: &str,
        name: &str,
    ) -> PlatformResult<Option<T>> {
        let args = ["get", resource, name, "--ignore-not-found", "-o", "json"];
        let stdout = self.run(&args).await?;
        if stdout.trim().is_empty() {
            return Ok(None);
        }
        let command = display_command("kubectl", &args.map(String::from));
        parse_json(&command, &stdout).map(Some)
    }
}

#[derive(Debug, Deserialize)]
struct Deployment {
    #[serde(default)]
    metadata: Metadata,
    spec: DeploymentSpec,
    #[serde(default)]
    status: DeploymentStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Metadata {
    generation: u64,
    annotations: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct DeploymentSpec {
    #[serde(default)]
    replicas: u32,
    template: PodTemplate,
}

#[derive(Debug, Deserialize)]
struct PodTemplate {
    spec: PodSpec,
}

#[derive(Debug, Deserialize)]
struct PodSpec {
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    image: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DeploymentStatus {
    observed_generation: u64,
    ready_replicas: u32,
    updated_replicas: u32,
}

impl Deployment {
    fn workload_status(&self) -> WorkloadStatus {
        // The controller has not seen the latest spec yet: nothing is updated.
        let observed = self.status.observed_generation >= self.metadata.generation;
        WorkloadStatus {
            image: self
                .spec
                .template
                .spec
                .containers
                .first()
                .map(|c| c.image.clone())
                .unwrap_or_default(),
            replicas: self.spec.replicas,
            ready_replicas: self.status.ready_replicas,
            updated_replicas: if observed {
                self.status.updated_replicas
            } else {
                0
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct Service {
    spec: ServiceSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceSpec {
    selector: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Ingress {
    #[serde(default)]
    metadata: Metadata,
}

/// Deployments in one namespace.
#[derive(Clone)]
pub struct KubectlPlatform {
    kubectl: Kubectl,
}

impl KubectlPlatform {
    pub fn new(kubectl: Kubectl) -> Self {
        Self { kubectl }
    }
}

#[async_trait]
impl WorkloadPlatform for KubectlPlatform {
    async fn set_image(
        &self,
        workload: &str,
        image: &ImageRef,
        replicas: u32,
        surge: SurgePolicy,
    ) -> PlatformResult<()> {
        let image = image.to_string();
        let existing: Option<Deployment> = self.kubectl.get("deployment", workload).await?;

        match existing {
            None => {
                info!(namespace = %self.kubectl.namespace(), %workload, %image, "creating deployment");
                let image_arg = format!("--image={image}");
                let replicas_arg = format!("--replicas={replicas}");
                self.kubectl
                    .run(&["create", "deployment", workload, &image_arg, &replicas_arg])
                    .await?;
            }
            Some(deployment) => {
                let current = deployment.workload_status();
                if current.image != image {
                    let target = format!("deployment/{workload}");
                    let set = format!("*={image}");
                    self.kubectl.run(&["set", "image", &target, &set]).await?;
                } else {
                    debug!(%workload, %image, "image already set");
                }
                if current.replicas != replicas {
                    self.scale(workload, replicas).await?;
                }
            }
        }

        let patch = json!({
            "spec": {
                "strategy": {
                    "type": "RollingUpdate",
                    "rollingUpdate": {
                        "maxSurge": surge.max_surge,
                        "maxUnavailable": surge.max_unavailable,
                    }
                }
            }
        })
        .to_string();
        self.kubectl
            .run(&["patch", "deployment", workload, "--type", "merge", "-p", &patch])
            .await?;
        Ok(())
    }

    async fn status(&self, workload: &str) -> PlatformResult<Option<WorkloadStatus>> {
        let deployment: Option<Deployment> = self.kubectl.get("deployment", workload).await?;
        Ok(deployment.map(|d| d.workload_status()))
    }

    async fn scale(&self, workload: &str, replicas: u32) -> PlatformResult<()> {
        if self.status(workload).await?.is_none() {
            debug!(%workload, "no deployment to scale");
            return Ok(());
        }
        let target = format!("deployment/{workload}");
        let replicas_arg = format!("--replicas={replicas}");
        self.kubectl.run(&["scale", &target, &replicas_arg]).await?;
        info!(%workload, replicas, "scaled");
        Ok(())
    }
}

/// Service selector and canary Ingress router.
#[derive(Clone)]
pub struct KubectlRouter {
    kubectl: Kubectl,
}

impl KubectlRouter {
    pub fn new(kubectl: Kubectl) -> Self {
        Self { kubectl }
    }

    fn canary_ingress(service: &str) -> String {
        format!("{service}-canary")
    }
}

/// Color named by a selector `app={service}-{color}`.
fn selector_color(service: &str, selector: &HashMap<String, String>) -> Option<Color> {
    let app = selector.get("app")?;
    let suffix = app.strip_prefix(service)?.strip_prefix('-')?;
    suffix.parse().ok()
}

#[async_trait]
impl TrafficRouter for KubectlRouter {
    async fn active_color(&self, service: &str) -> PlatformResult<Option<Color>> {
        let svc: Option<Service> = self.kubectl.get("service", service).await?;
        Ok(svc.and_then(|s| selector_color(service, &s.spec.selector)))
    }

    async fn set_active_color(&self, service: &str, color: Color) -> PlatformResult<()> {
        if self.kubectl.get::<Service>("service", service).await?.is_none() {
            return Err(PlatformError::NotFound(format!("service {service}")));
        }
        let patch = json!({
            "spec": { "selector": { "app": format!("{service}-{color}") } }
        })
        .to_string();
        // A single merge patch: the selector flips atomically.
        self.kubectl
            .run(&["patch", "service", service, "--type", "merge", "-p", &patch])
            .await?;
        Ok(())
    }

    async fn canary_weight(&self, service: &str) -> PlatformResult<u8> {
        let ingress: Option<Ingress> = self
            .kubectl
            .get("ingress", &Self::canary_ingress(service))
            .await?;
        let Some(ingress) = ingress else {
            return Ok(0);
        };
        let annotations = &ingress.metadata.annotations;
        if annotations.get(CANARY_ANNOTATION).map(String::as_str) != Some("true") {
            return Ok(0);
        }
        match annotations.get(CANARY_WEIGHT_ANNOTATION) {
            Some(raw) => raw.trim().parse().map_err(|_| PlatformError::Parse {
                command: format!("kubectl get ingress {}", Self::canary_ingress(service)),
                reason: format!("bad canary weight {raw:?}"),
            }),
            None => Ok(0),
        }
    }

    async fn set_canary_weight(&self, service: &str, weight: u8) -> PlatformResult<()> {
        let ingress = Self::canary_ingress(service);
        if self.kubectl.get::<Ingress>("ingress", &ingress).await?.is_none() {
            return Err(PlatformError::NotFound(format!("canary ingress {ingress}")));
        }
        let enabled = format!("{CANARY_ANNOTATION}=true");
        let weight_arg = format!("{CANARY_WEIGHT_ANNOTATION}={}", weight.min(100));
        self.kubectl
            .run(&["annotate", "ingress", &ingress, &enabled, &weight_arg, "--overwrite"])
            .await?;
        Ok(())
    }
}
