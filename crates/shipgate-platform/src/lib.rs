//! shipgate-platform: command-backed collaborators.
//!
//! Adapters that drive `kubectl`, `docker compose` and `argocd` through a
//! [`CommandRunner`] and parse their `-o json` output into the typed results
//! the executors expect.

pub mod argocd;
pub mod compose;
pub mod kubectl;
pub mod runner;

use std::sync::Arc;

use shipgate_core::ShipgateConfig;
use shipgate_core::config::PlatformKind;
use shipgate_rollout::{Collaborators, ExecutorSettings, Reconciler, TrafficRouter, WorkloadPlatform};

pub use argocd::ArgocdReconciler;
pub use compose::{ComposePlatform, FileRouter};
pub use kubectl::{Kubectl, KubectlPlatform, KubectlRouter};
pub use runner::{CommandRunner, ProcessRunner};

/// Default route file name inside the compose directory.
pub const ROUTE_FILE: &str = "shipgate.routes.json";

/// Wire up the collaborators configured for `environment`.
pub fn collaborators(
    config: &ShipgateConfig,
    environment: &str,
    runner: Arc<dyn CommandRunner>,
) -> Collaborators {
    let env = config.environment(environment);
    let (platform, router): (Arc<dyn WorkloadPlatform>, Arc<dyn TrafficRouter>) =
        match config.platform.kind {
            PlatformKind::Kubectl => {
                let namespace = env
                    .namespace
                    .clone()
                    .or_else(|| config.platform.namespace.clone())
                    .unwrap_or_else(|| environment.to_string());
                let kubectl = Kubectl::new(Arc::clone(&runner), namespace)
                    .with_context(config.platform.context.clone());
                (
                    Arc::new(KubectlPlatform::new(kubectl.clone())),
                    Arc::new(KubectlRouter::new(kubectl)),
                )
            }
            PlatformKind::Compose => {
                let dir = config.platform.compose_dir.clone();
                let routes = config
                    .platform
                    .route_file
                    .clone()
                    .unwrap_or_else(|| dir.join(ROUTE_FILE));
                (
                    Arc::new(ComposePlatform::new(Arc::clone(&runner), dir)),
                    Arc::new(FileRouter::new(routes)),
                )
            }
        };
    let reconciler: Arc<dyn Reconciler> = Arc::new(ArgocdReconciler::new(runner, &config.gitops));

    Collaborators {
        platform,
        router,
        reconciler: Some(reconciler),
        settings: ExecutorSettings::from_config(config).with_gitops_app(env.gitops_app),
    }
}
