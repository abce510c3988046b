//! Rolling executor: replace the image in place under a surge policy.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use shipgate_core::{BackoffPolicy, DeploymentRequest, ImageRef, StrategyKind};

use crate::executor::{ExecutorError, Step, StrategyExecutor, SwitchMetadata};
use crate::platform::{SurgePolicy, WorkloadPlatform, wait_ready};

/// In-place image update of a single workload.
pub struct RollingExecutor {
    platform: Arc<dyn WorkloadPlatform>,
    request: DeploymentRequest,
    /// Image re-applied on revert; `None` scales the workload to zero.
    restore: Option<ImageRef>,
    surge: SurgePolicy,
    readiness: BackoffPolicy,
}

impl RollingExecutor {
    pub fn new(
        platform: Arc<dyn WorkloadPlatform>,
        request: DeploymentRequest,
        restore: Option<ImageRef>,
        surge: SurgePolicy,
        readiness: BackoffPolicy,
    ) -> Self {
        Self {
            platform,
            request,
            restore,
            surge,
            readiness,
        }
    }

    async fn roll_to(&self, image: &ImageRef) -> Result<(), ExecutorError> {
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
        Ok(())
    }
}

#[async_trait]
impl StrategyExecutor for RollingExecutor {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Rolling
    }

    async fn apply(&self) -> Result<SwitchMetadata, ExecutorError> {
        info!(
            workload = %self.request.workload,
            image = %self.request.image,
            max_surge = self.surge.max_surge,
            max_unavailable = self.surge.max_unavailable,
            "rolling update"
        );
        self.roll_to(&self.request.image).await?;
        Ok(SwitchMetadata::default())
    }

    async fn advance(&self) -> Result<Step, ExecutorError> {
        Ok(Step::Done(SwitchMetadata::default()))
    }

    async fn revert(&self) -> Result<SwitchMetadata, ExecutorError> {
        match &self.restore {
            Some(image) => {
                info!(workload = %self.request.workload, %image, "rolling back in place");
                self.roll_to(image).await?;
            }
            None => {
                warn!(
                    workload = %self.request.workload,
                    "no previous revision; scaling workload to zero"
                );
                self.platform.scale(&self.request.workload, 0).await?;
            }
        }
        Ok(SwitchMetadata::default())
    }
}
