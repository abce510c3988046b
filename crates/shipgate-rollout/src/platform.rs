//! Collaborator interfaces the executors drive.
//!
//! Executors never shell out themselves. They talk to a workload platform
//! (kubectl, docker compose), a traffic router (service selector, weighted
//! route), and for GitOps a reconciler. Every call returns a typed result.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use shipgate_core::{BackoffPolicy, Color, ImageRef};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {code:?}: {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unexpected output from `{command}`: {reason}")]
    Parse { command: String, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("{0}")]
    Unsupported(String),
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// In-place replacement bounds for a rolling update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurgePolicy {
    /// Extra replicas allowed above the desired count.
    pub max_surge: u32,
    /// Replicas allowed to be unavailable during the update.
    pub max_unavailable: u32,
}

impl Default for SurgePolicy {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 0,
        }
    }
}

/// Observed state of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    /// Image the workload template currently runs.
    pub image: String,
    pub replicas: u32,
    pub ready_replicas: u32,
    pub updated_replicas: u32,
}

impl WorkloadStatus {
    /// Fully rolled out to `image` with at least `replicas` ready.
    pub fn is_ready(&self, image: &ImageRef, replicas: u32) -> bool {
        self.image == image.to_string()
            && self.ready_replicas >= replicas
            && self.updated_replicas >= replicas
    }
}

/// Runs workloads.
#[async_trait]
pub trait WorkloadPlatform: Send + Sync {
    /// Create or update `workload` to run `image` with `replicas`.
    /// Must be idempotent.
    async fn set_image(
        &self,
        workload: &str,
        image: &ImageRef,
        replicas: u32,
        surge: SurgePolicy,
    ) -> PlatformResult<()>;

    /// `None` when the workload does not exist.
    async fn status(&self, workload: &str) -> PlatformResult<Option<WorkloadStatus>>;

    async fn scale(&self, workload: &str, replicas: u32) -> PlatformResult<()>;
}

/// Routes live traffic for a service.
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    /// Color the service selector points at, `None` before the first
    /// blue-green deploy.
    async fn active_color(&self, service: &str) -> PlatformResult<Option<Color>>;

    /// Atomic selector swap.
    async fn set_active_color(&self, service: &str, color: Color) -> PlatformResult<()>;

    /// Percentage of traffic routed to `{service}-canary`.
    async fn canary_weight(&self, service: &str) -> PlatformResult<u8>;

    async fn set_canary_weight(&self, service: &str, weight: u8) -> PlatformResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Synced,
    OutOfSync,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcilerHealth {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    Missing,
    Unknown,
}

/// What the reconciler says about an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHealth {
    pub sync: SyncStatus,
    pub health: ReconcilerHealth,
    /// Revision the reconciler last synced, if it reports one.
    pub revision: Option<String>,
}

/// External declarative reconciler (ArgoCD or similar). A black box: we
/// write the desired revision and read back its sync and health.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn desired_revision(&self, app: &str) -> PlatformResult<Option<ImageRef>>;

    async fn set_desired_revision(&self, app: &str, image: &ImageRef) -> PlatformResult<()>;

    async fn sync_health(&self, app: &str) -> PlatformResult<SyncHealth>;
}

/// Poll `workload` until it runs `image` with `replicas` ready.
///
/// Bounded by `backoff.max_attempts` if set; callers also wrap this in
/// their own timeout.
pub async fn wait_ready(
    platform: &dyn WorkloadPlatform,
    workload: &str,
    image: &ImageRef,
    replicas: u32,
    backoff: &BackoffPolicy,
) -> PlatformResult<WorkloadStatus> {
    let mut delays = backoff.delays();
    loop {
        if let Some(status) = platform.status(workload).await? {
            if status.is_ready(image, replicas) {
                return Ok(status);
            }
            debug!(
                %workload,
                ready = status.ready_replicas,
                updated = status.updated_replicas,
                want = replicas,
                "waiting for workload readiness"
            );
        }
        match delays.next() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => return Err(PlatformError::Timeout(format!("{workload} to become ready"))),
        }
    }
}
