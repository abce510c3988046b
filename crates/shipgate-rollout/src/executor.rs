//! Strategy executor contract and construction.
//!
//! An executor is built per promotion, already bound to the request and to
//! the revision it would restore. The controller only calls `apply`,
//! `advance`, and `revert`, and reads back switch metadata.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use shipgate_core::config::{CanaryConfig, ShipgateConfig};
use shipgate_core::{BackoffPolicy, Color, DeploymentRequest, StrategyKind};
use shipgate_health::{GatePolicy, HealthCheckResult};
use shipgate_state::{RevisionRecord, SwitchSnapshot};

use crate::blue_green::BlueGreenExecutor;
use crate::canary::CanaryExecutor;
use crate::gitops::GitopsExecutor;
use crate::platform::{PlatformError, Reconciler, SurgePolicy, TrafficRouter, WorkloadPlatform};
use crate::rolling::RollingExecutor;

/// Traffic state an executor reports; stored on the revision record.
pub type SwitchMetadata = SwitchSnapshot;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("reconciler reported {0}")]
    Reconciler(String),

    #[error("{0}")]
    Unsupported(String),
}

/// What happens after a gate stage passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Another gate stage is needed at the new traffic state.
    Continue(SwitchMetadata),
    /// The revision is fully live.
    Done(SwitchMetadata),
}

#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Put the new revision in place. Idempotent.
    async fn apply(&self) -> Result<SwitchMetadata, ExecutorError>;

    /// Move traffic one step further after a passing gate stage.
    async fn advance(&self) -> Result<Step, ExecutorError>;

    /// Restore the revision that was serving before `apply`. Idempotent.
    async fn revert(&self) -> Result<SwitchMetadata, ExecutorError>;

    /// Health signal that comes from the executor itself rather than HTTP
    /// probes. `None` means no reading this tick.
    async fn observe(&self) -> Option<Vec<HealthCheckResult>> {
        None
    }

    /// Whether [`observe`](Self::observe) produces readings.
    fn provides_signal(&self) -> bool {
        false
    }

    /// Gate thresholds for this strategy.
    fn gate_policy(&self, base: &GatePolicy) -> GatePolicy {
        base.clone()
    }

    /// Color substituted into `{color}` health endpoint placeholders.
    fn probe_color(&self) -> Option<Color> {
        None
    }
}

/// Strategy tuning shared by all executors.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub surge: SurgePolicy,
    /// Pacing for readiness and sync waits.
    pub readiness: BackoffPolicy,
    pub canary: CanaryConfig,
    pub grace_period: Duration,
    /// Reconciler application name; defaults to `{workload}-{environment}`.
    pub gitops_app: Option<String>,
}

impl ExecutorSettings {
    pub fn from_config(config: &ShipgateConfig) -> Self {
        Self {
            surge: SurgePolicy::default(),
            readiness: BackoffPolicy::default(),
            canary: config.canary.clone(),
            grace_period: config.blue_green.grace_period,
            gitops_app: None,
        }
    }

    pub fn with_gitops_app(mut self, app: Option<String>) -> Self {
        self.gitops_app = app;
        self
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&ShipgateConfig::default())
    }
}

/// The collaborators executors are built from.
#[derive(Clone)]
pub struct Collaborators {
    pub platform: Arc<dyn WorkloadPlatform>,
    pub router: Arc<dyn TrafficRouter>,
    pub reconciler: Option<Arc<dyn Reconciler>>,
    pub settings: ExecutorSettings,
}

impl Collaborators {
    /// Build the executor for `request`. `restore` is the revision a revert
    /// goes back to.
    pub fn executor_for(
        &self,
        request: &DeploymentRequest,
        restore: Option<&RevisionRecord>,
    ) -> Result<Box<dyn StrategyExecutor>, ExecutorError> {
        let restore_image = restore.map(|r| r.image.clone());
        let executor: Box<dyn StrategyExecutor> = match request.strategy {
            StrategyKind::Rolling => Box::new(RollingExecutor::new(
                Arc::clone(&self.platform),
                request.clone(),
                restore_image,
                self.settings.surge,
                self.settings.readiness.clone(),
            )),
            StrategyKind::BlueGreen => Box::new(BlueGreenExecutor::new(
                Arc::clone(&self.platform),
                Arc::clone(&self.router),
                request.clone(),
                self.settings.readiness.clone(),
                self.settings.grace_period,
                restore
                    .filter(|r| r.strategy == StrategyKind::BlueGreen)
                    .and_then(|r| r.switch.retire_idle_after),
            )),
            StrategyKind::Canary => Box::new(CanaryExecutor::new(
                Arc::clone(&self.platform),
                Arc::clone(&self.router),
                request.clone(),
                restore_image,
                &self.settings,
            )),
            StrategyKind::GitopsSync => {
                let Some(reconciler) = &self.reconciler else {
                    return Err(ExecutorError::Unsupported(
                        "gitops-sync needs a reconciler; configure [gitops]".to_string(),
                    ));
                };
                let app = self
                    .settings
                    .gitops_app
                    .clone()
                    .unwrap_or_else(|| format!("{}-{}", request.workload, request.environment));
                Box::new(GitopsExecutor::new(
                    Arc::clone(reconciler),
                    app,
                    request.image.clone(),
                    restore_image,
                    self.settings.readiness.clone(),
                ))
            }
        };
        Ok(executor)
    }
}
