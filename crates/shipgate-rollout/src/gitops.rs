//! GitOps-sync executor.
//!
//! Writes the desired revision to the reconciler and waits for it to report
//! `Synced`. During gating the reconciler's own health report is the signal.
//! Revert writes the previous revision back.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use shipgate_core::{BackoffPolicy, ImageRef, StrategyKind};
use shipgate_health::{Classification, HealthCheckResult};

use crate::executor::{ExecutorError, Step, StrategyExecutor, SwitchMetadata};
use crate::platform::{PlatformError, ReconcilerHealth, Reconciler, SyncStatus};

/// Hands the revision to an external reconciler and gates on its own
/// sync and health report.
pub struct GitopsExecutor {
    reconciler: Arc<dyn Reconciler>,
    /// Reconciler application name.
    app: String,
    image: ImageRef,
    /// Written back on revert.
    restore: Option<ImageRef>,
    /// Pacing for waits on the reconciler.
    sync_poll: BackoffPolicy,
    /// Desired revision found in the source before our first write.
    found: Mutex<Option<Option<ImageRef>>>,
}

impl GitopsExecutor {
    /// With `restore` unset, revert writes back whatever the source held
    /// before the first write.
    pub fn new(
        reconciler: Arc<dyn Reconciler>,
        app: String,
        image: ImageRef,
        restore: Option<ImageRef>,
        sync_poll: BackoffPolicy,
    ) -> Self {
        Self {
            reconciler,
            app,
            image,
            restore,
            sync_poll,
            found: Mutex::new(None),
        }
    }

    fn found(&self) -> Option<Option<ImageRef>> {
        self.found.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Write `image` and wait until the reconciler reports it synced.
    async fn sync_to(&self, image: &ImageRef) -> Result<(), ExecutorError> {
        self.reconciler.set_desired_revision(&self.app, image).await?;
        let mut delays = self.sync_poll.delays();
        loop {
            let report = self.reconciler.sync_health(&self.app).await?;
            debug!(app = %self.app, sync = ?report.sync, health = ?report.health, "reconciler status");
            if report.sync == SyncStatus::Synced {
                return Ok(());
            }
            match delays.next() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(PlatformError::Timeout(format!("{} to sync {image}", self.app)).into());
                }
            }
        }
    }
}

/// Map a reconciler report onto a gate reading. `None` while progressing.
fn classify_report(sync: SyncStatus, health: ReconcilerHealth) -> Option<Classification> {
    match (sync, health) {
        (_, ReconcilerHealth::Progressing) => None,
        (SyncStatus::Synced, ReconcilerHealth::Healthy) => Some(Classification::Healthy),
        (_, ReconcilerHealth::Unknown) | (SyncStatus::Unknown, _) => {
            Some(Classification::UnknownTimeout)
        }
        // Drifted out of sync, degraded, suspended, or missing.
        _ => Some(Classification::Unhealthy),
    }
}

#[async_trait]
impl StrategyExecutor for GitopsExecutor {
    fn kind(&self) -> StrategyKind {
        StrategyKind::GitopsSync
    }

    async fn apply(&self) -> Result<SwitchMetadata, ExecutorError> {
        if self.found().is_none() {
            let current = self.reconciler.desired_revision(&self.app).await?;
            *self.found.lock().unwrap_or_else(|p| p.into_inner()) = Some(current);
        }
        info!(app = %self.app, image = %self.image, "writing desired revision");
        self.sync_to(&self.image).await?;
        Ok(SwitchMetadata::default())
    }

    async fn advance(&self) -> Result<Step, ExecutorError> {
        Ok(Step::Done(SwitchMetadata::default()))
    }

    async fn revert(&self) -> Result<SwitchMetadata, ExecutorError> {
        let target = self.restore.clone().or_else(|| self.found().flatten());
        match target {
            Some(image) => {
                info!(app = %self.app, %image, "writing back previous revision");
                self.sync_to(&image).await?;
            }
            None => warn!(app = %self.app, "no previous revision to write back"),
        }
        Ok(SwitchMetadata::default())
    }

    async fn observe(&self) -> Option<Vec<HealthCheckResult>> {
        let endpoint = format!("reconciler:{}", self.app);
        let classification = match self.reconciler.sync_health(&self.app).await {
            Ok(report) => classify_report(report.sync, report.health)?,
            Err(e) => {
                warn!(app = %self.app, error = %e, "reconciler status unavailable");
                Classification::UnknownTimeout
            }
        };
        Some(vec![HealthCheckResult::synthetic(endpoint, classification)])
    }

    fn provides_signal(&self) -> bool {
        true
    }
}
