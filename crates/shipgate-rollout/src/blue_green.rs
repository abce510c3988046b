//! Blue-green executor.
//!
//! The new revision goes into the idle color (`{workload}-{color}`). The
//! first passing gate stage verifies that color directly, then `advance`
//! flips the service selector and a second stage verifies live traffic.
//! Revert is a selector flip back; nothing is redeployed. The old color is
//! left running and may be retired once `retire_idle_after` has passed.
//! Deploying into a color whose grace period is still open is allowed, but
//! gives up the instant re-flip to the revision it was holding.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use shipgate_core::{BackoffPolicy, Color, DeploymentRequest, StrategyKind};
use shipgate_state::epoch_secs;

use crate::executor::{ExecutorError, Step, StrategyExecutor, SwitchMetadata};
use crate::platform::{SurgePolicy, TrafficRouter, WorkloadPlatform, wait_ready};

#[derive(Debug, Clone, Copy, Default)]
struct Switch {
    /// Selector before this promotion; `Some(None)` on a first deploy.
    original: Option<Option<Color>>,
    target: Option<Color>,
    flipped: bool,
}

/// Two full copies of the workload behind one selector.
pub struct BlueGreenExecutor {
    platform: Arc<dyn WorkloadPlatform>,
    router: Arc<dyn TrafficRouter>,
    request: DeploymentRequest,
    readiness: BackoffPolicy,
    /// How long the color taken out of service stays up after a switch.
    grace_period: Duration,
    /// Grace deadline of the idle color left by the serving revision.
    idle_retire_after: Option<u64>,
    switch: Mutex<Switch>,
}

impl BlueGreenExecutor {
    pub fn new(
        platform: Arc<dyn WorkloadPlatform>,
        router: Arc<dyn TrafficRouter>,
        request: DeploymentRequest,
        readiness: BackoffPolicy,
        grace_period: Duration,
        idle_retire_after: Option<u64>,
    ) -> Self {
        Self {
            platform,
            router,
            request,
            readiness,
            grace_period,
            idle_retire_after,
            switch: Mutex::new(Switch::default()),
        }
    }

    fn state(&self) -> Switch {
        *self.switch.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut Switch)) {
        f(&mut self.switch.lock().unwrap_or_else(|p| p.into_inner()));
    }

    fn color_workload(&self, color: Color) -> String {
        format!("{}-{}", self.request.workload, color)
    }

    /// The idle color is still inside the grace period of the last switch.
    fn idle_grace_open(&self, now: u64) -> bool {
        self.idle_retire_after.is_some_and(|until| now < until)
    }

    fn metadata(&self, active: Option<Color>) -> SwitchMetadata {
        SwitchMetadata {
            active_color: active,
            canary_weight: None,
            retire_idle_after: Some(epoch_secs() + self.grace_period.as_secs()),
        }
    }
}

#[async_trait]
impl StrategyExecutor for BlueGreenExecutor {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BlueGreen
    }

    async fn apply(&self) -> Result<SwitchMetadata, ExecutorError> {
        let service = &self.request.workload;
        let state = self.state();
        let (original, target) = match (state.original, state.target) {
            (Some(original), Some(target)) => (original, target),
            _ => {
                let original = self.router.active_color(service).await?;
                let target = original.map(Color::other).unwrap_or(Color::Blue);
                if original.is_some() && self.idle_grace_open(epoch_secs()) {
                    warn!(
                        %service,
                        color = %target,
                        retire_idle_after = self.idle_retire_after,
                        "redeploying into a color inside its grace period; \
                         instant re-flip to the previous revision is lost"
                    );
                }
                self.update(|s| {
                    s.original = Some(original);
                    s.target = Some(target);
                });
                (original, target)
            }
        };

        let workload = self.color_workload(target);
        info!(
            %service,
            color = %target,
            %workload,
            image = %self.request.image,
            "deploying into idle color"
        );
        self.platform
            .set_image(
                &workload,
                &self.request.image,
                self.request.replicas,
                SurgePolicy::default(),
            )
            .await?;
        // The color's own readiness; traffic gating happens in the controller.
        wait_ready(
            self.platform.as_ref(),
            &workload,
            &self.request.image,
            self.request.replicas,
            &self.readiness,
        )
        .await?;

        Ok(SwitchMetadata {
            active_color: original,
            ..SwitchMetadata::default()
        })
    }

    async fn advance(&self) -> Result<Step, ExecutorError> {
        let state = self.state();
        let Some(target) = state.target else {
            return Err(ExecutorError::Unsupported(
                "blue-green advance before apply".to_string(),
            ));
        };
        if state.flipped {
            return Ok(Step::Done(self.metadata(Some(target))));
        }

        let service = &self.request.workload;
        self.router.set_active_color(service, target).await?;
        self.update(|s| s.flipped = true);
        info!(%service, color = %target, "traffic switched");
        Ok(Step::Continue(self.metadata(Some(target))))
    }

    async fn revert(&self) -> Result<SwitchMetadata, ExecutorError> {
        let service = &self.request.workload;
        let state = self.state();
        let original = match state.original {
            Some(original) => original,
            // Never applied: whatever the selector says is still the original.
            None => self.router.active_color(service).await?,
        };

        match original {
            Some(color) => {
                if self.router.active_color(service).await? != Some(color) {
                    self.router.set_active_color(service, color).await?;
                    info!(%service, %color, "traffic switched back");
                }
            }
            None => {
                if let Some(target) = state.target {
                    warn!(
                        %service,
                        color = %target,
                        "no previous color to restore; scaling new color to zero"
                    );
                    self.platform.scale(&self.color_workload(target), 0).await?;
                }
            }
        }
        self.update(|s| s.flipped = false);

        Ok(SwitchMetadata {
            active_color: original,
            ..SwitchMetadata::default()
        })
    }

    fn probe_color(&self) -> Option<Color> {
        self.state().target
    }
}
