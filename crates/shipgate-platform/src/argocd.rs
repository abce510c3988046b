//! Argo CD reconciler via the `argocd` CLI.
//!
//! The desired revision is either a Helm parameter (when an image parameter
//! name is configured) or a kustomize image override. Sync and health come
//! from `argocd app get -o json`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use shipgate_core::ImageRef;
use shipgate_core::config::GitopsConfig;
use shipgate_rollout::{
    PlatformError, PlatformResult, Reconciler, ReconcilerHealth, SyncHealth, SyncStatus,
};

use crate::runner::{CommandRunner, display_command, parse_json};

#[derive(Debug, Deserialize)]
struct Application {
    #[serde(default)]
    spec: AppSpec,
    #[serde(default)]
    status: AppStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AppSpec {
    source: Option<AppSource>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AppSource {
    helm: Option<HelmSource>,
    kustomize: Option<KustomizeSource>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HelmSource {
    parameters: Vec<HelmParameter>,
}

#[derive(Debug, Deserialize)]
struct HelmParameter {
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KustomizeSource {
    images: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AppStatus {
    sync: StatusField,
    health: StatusField,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatusField {
    status: String,
    revision: Option<String>,
}

fn sync_status(raw: &str) -> SyncStatus {
    match raw {
        "Synced" => SyncStatus::Synced,
        "OutOfSync" => SyncStatus::OutOfSync,
        _ => SyncStatus::Unknown,
    }
}

fn health_status(raw: &str) -> ReconcilerHealth {
    match raw {
        "Healthy" => ReconcilerHealth::Healthy,
        "Progressing" => ReconcilerHealth::Progressing,
        "Degraded" => ReconcilerHealth::Degraded,
        "Suspended" => ReconcilerHealth::Suspended,
        "Missing" => ReconcilerHealth::Missing,
        _ => ReconcilerHealth::Unknown,
    }
}

/// Kustomize image entries are `name=newName:tag` or a plain reference.
fn kustomize_image(entry: &str) -> Option<ImageRef> {
    let reference = entry.split_once('=').map_or(entry, |(_, new)| new);
    ImageRef::parse(reference).ok()
}

pub struct ArgocdReconciler {
    runner: Arc<dyn CommandRunner>,
    server: Option<String>,
    grpc_web: bool,
    image_parameter: Option<String>,
}

impl ArgocdReconciler {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &GitopsConfig) -> Self {
        Self {
            runner,
            server: config.server.clone(),
            grpc_web: config.grpc_web,
            image_parameter: config.image_parameter.clone(),
        }
    }

    fn args(&self, tail: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = tail.iter().map(|a| a.to_string()).collect();
        if let Some(server) = &self.server {
            args.push("--server".to_string());
            args.push(server.clone());
        }
        if self.grpc_web {
            args.push("--grpc-web".to_string());
        }
        args
    }

    async fn app(&self, app: &str) -> PlatformResult<Application> {
        let args = self.args(&["app", "get", app, "-o", "json"]);
        let stdout = self.runner.run("argocd", &args, None).await?;
        parse_json(&display_command("argocd", &args), &stdout)
    }
}

#[async_trait]
impl Reconciler for ArgocdReconciler {
    async fn desired_revision(&self, app: &str) -> PlatformResult<Option<ImageRef>> {
        let application = self.app(app).await?;
        let Some(source) = application.spec.source else {
            return Ok(None);
        };
        let image = match &self.image_parameter {
            Some(name) => source
                .helm
                .and_then(|h| h.parameters.into_iter().find(|p| &p.name == name))
                .and_then(|p| ImageRef::parse(&p.value).ok()),
            None => source
                .kustomize
                .and_then(|k| k.images.first().and_then(|e| kustomize_image(e))),
        };
        Ok(image)
    }

    async fn set_desired_revision(&self, app: &str, image: &ImageRef) -> PlatformResult<()> {
        let set = match &self.image_parameter {
            Some(name) => self.args(&["app", "set", app, "-p", &format!("{name}={image}")]),
            None => self.args(&["app", "set", app, "--kustomize-image", &image.to_string()]),
        };
        self.runner.run("argocd", &set, None).await?;
        info!(%app, %image, "desired revision written");

        // Start reconciling now rather than waiting for the next refresh.
        let sync = self.args(&["app", "sync", app, "--async"]);
        match self.runner.run("argocd", &sync, None).await {
            Ok(_) => Ok(()),
            // Auto-sync already picked it up.
            Err(PlatformError::Command { stderr, .. })
                if stderr.contains("another operation is already in progress") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn sync_health(&self, app: &str) -> PlatformResult<SyncHealth> {
        let application = self.app(app).await?;
        Ok(SyncHealth {
            sync: sync_status(&application.status.sync.status),
            health: health_status(&application.status.health.status),
            revision: application.status.sync.revision,
        })
    }
}
