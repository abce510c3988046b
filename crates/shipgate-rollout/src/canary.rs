//! Canary executor.
//!
//! The new revision runs as `{workload}-canary` next to the stable workload.
//! Weight starts at `initial_weight` and grows by `step` after each passing
//! gate stage. Full weight is gated like every other step; only after that
//! stage passes is the stable workload moved to the new image and the canary
//! retired. Any failed stage drops the weight straight to 0.
//!
//! The weight only ever increases within a promotion. An aborted ramp is not
//! resumable: a later request starts again from `initial_weight`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};

use shipgate_core::config::CanaryConfig;
use shipgate_core::{BackoffPolicy, DeploymentRequest, ImageRef, StrategyKind};
use shipgate_health::GatePolicy;

use crate::executor::{ExecutorError, ExecutorSettings, Step, StrategyExecutor, SwitchMetadata};
use crate::platform::{SurgePolicy, TrafficRouter, WorkloadPlatform, wait_ready};

const FULL: u8 = 100;

#[derive(Debug, Clone, Copy, Default)]
struct Ramp {
    weight: u8,
    promoted: bool,
}

/// Weighted traffic ramp from a `{workload}-canary` copy to the stable
/// workload.
pub struct CanaryExecutor {
    platform: Arc<dyn WorkloadPlatform>,
    router: Arc<dyn TrafficRouter>,
    request: DeploymentRequest,
    /// Stable image to restore if the ramp fails after promotion.
    restore: Option<ImageRef>,
    /// Initial weight and step.
    config: CanaryConfig,
    surge: SurgePolicy,
    readiness: BackoffPolicy,
    ramp: Mutex<Ramp>,
}

impl CanaryExecutor {
    /// Ramp settings come from `settings.canary`.
    pub fn new(
        platform: Arc<dyn WorkloadPlatform>,
        router: Arc<dyn TrafficRouter>,
        request: DeploymentRequest,
        restore: Option<ImageRef>,
        settings: &ExecutorSettings,
    ) -> Self {
        Self {
            platform,
            router,
            request,
            restore,
            config: settings.canary.clone(),
            surge: settings.surge,
            readiness: settings.readiness.clone(),
            ramp: Mutex::new(Ramp::default()),
        }
    }

    fn ramp(&self) -> Ramp {
        *self.ramp.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_ramp(&self, ramp: Ramp) {
        *self.ramp.lock().unwrap_or_else(|p| p.into_inner()) = ramp;
    }

    fn canary_workload(&self) -> String {
        format!("{}-canary", self.request.workload)
    }

    /// Canary replicas proportional to the initial weight, at least one.
    fn canary_replicas(&self) -> u32 {
        let scaled = (self.request.replicas * u32::from(self.config.initial_weight)).div_ceil(100);
        scaled.max(1)
    }

    fn weighted(weight: u8) -> SwitchMetadata {
        SwitchMetadata {
            canary_weight: Some(weight),
            ..SwitchMetadata::default()
        }
    }

    async fn set_weight(&self, weight: u8) -> Result<(), ExecutorError> {
        self.router
            .set_canary_weight(&self.request.workload, weight)
            .await?;
        info!(service = %self.request.workload, weight, "canary weight set");
        Ok(())
    }

    /// Move the stable workload to the new image and retire the canary.
    /// Runs with all traffic already on the canary.
    async fn promote_stable(&self) -> Result<(), ExecutorError> {
        let workload = &self.request.workload;
        self.platform
            .set_image(workload, &self.request.image, self.request.replicas, self.surge)
            .await?;
        wait_ready(
            self.platform.as_ref(),
            workload,
            &self.request.image,
            self.request.replicas,
            &self.readiness,
        )
        .await?;
        self.set_weight(0).await?;
        self.platform.scale(&self.canary_workload(), 0).await?;
        Ok(())
    }
}

#[async_trait]
impl StrategyExecutor for CanaryExecutor {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Canary
    }

    async fn apply(&self) -> Result<SwitchMetadata, ExecutorError> {
        let canary = self.canary_workload();
        let replicas = self.canary_replicas();
        info!(%canary, image = %self.request.image, replicas, "starting canary");
        self.platform
            .set_image(&canary, &self.request.image, replicas, self.surge)
            .await?;
        wait_ready(
            self.platform.as_ref(),
            &canary,
            &self.request.image,
            replicas,
            &self.readiness,
        )
        .await?;

        let ramp = self.ramp();
        let weight = ramp.weight.max(self.config.initial_weight);
        self.set_weight(weight).await?;
        self.set_ramp(Ramp { weight, ..ramp });
        Ok(Self::weighted(weight))
    }

    async fn advance(&self) -> Result<Step, ExecutorError> {
        let ramp = self.ramp();
        if ramp.promoted {
            return Ok(Step::Done(Self::weighted(FULL)));
        }

        if ramp.weight < FULL {
            let next = ramp.weight.saturating_add(self.config.step).min(FULL);
            self.set_weight(next).await?;
            self.set_ramp(Ramp { weight: next, ..ramp });
            return Ok(Step::Continue(Self::weighted(next)));
        }

        // The full-weight stage has passed.
        self.promote_stable().await?;
        self.set_ramp(Ramp {
            weight: FULL,
            promoted: true,
        });
        info!(service = %self.request.workload, image = %self.request.image, "canary promoted");
        Ok(Step::Done(Self::weighted(FULL)))
    }

    async fn revert(&self) -> Result<SwitchMetadata, ExecutorError> {
        // Traffic off the new revision first, before anything else can fail.
        self.set_weight(0).await?;

        let ramp = self.ramp();
        if ramp.promoted {
            match &self.restore {
                Some(image) => {
                    let workload = &self.request.workload;
                    self.platform
                        .set_image(workload, image, self.request.replicas, self.surge)
                        .await?;
                    wait_ready(
                        self.platform.as_ref(),
                        workload,
                        image,
                        self.request.replicas,
                        &self.readiness,
                    )
                    .await?;
                }
                None => warn!(
                    service = %self.request.workload,
                    "canary already promoted and no previous image to restore"
                ),
            }
        }
        self.platform.scale(&self.canary_workload(), 0).await?;
        self.set_ramp(Ramp::default());
        Ok(Self::weighted(0))
    }

    /// A single unhealthy read aborts the ramp.
    fn gate_policy(&self, base: &GatePolicy) -> GatePolicy {
        base.clone().with_failure_threshold(1)
    }
}
