//! Persisted domain types: revision history and deployment locks.
//!
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

use shipgate_core::{Color, ImageRef, StrategyKind};

/// Monotonic per-environment revision number, starting at 1.
pub type RevisionId = u64;

// ── Revisions ──────────────────────────────────────────────────────

/// Terminal outcome of one promotion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// The attempt was reverted and the prior revision restored, or an
    /// operator rollback completed.
    RolledBack,
    /// The revert itself failed; the environment needs an operator.
    Failed,
}

/// What started the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Deploy,
    /// `shipgate rollback`: promote the previous revision on purpose.
    Rollback,
}

/// Phase in which a failed attempt went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Apply,
    HealthGate,
    Rollback,
}

impl std::fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FailurePhase::Apply => "apply",
            FailurePhase::HealthGate => "health-gate",
            FailurePhase::Rollback => "rollback",
        })
    }
}

/// The revision a revert put back into service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredRevision {
    pub revision: RevisionId,
    pub image: ImageRef,
}

/// Traffic state reported by the executor at commit time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary_weight: Option<u8>,
    /// Epoch seconds after which the idle blue-green color may be retired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retire_idle_after: Option<u64>,
}

/// Aggregate health-gate decision stored alongside the record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSummary {
    /// Gate stages run (one per canary step, one otherwise).
    pub stages: u32,
    pub polls: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One entry per attempted promotion. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub environment: String,
    /// Assigned by the store on append.
    pub revision: RevisionId,
    pub image: ImageRef,
    pub strategy: StrategyKind,
    #[serde(default)]
    pub trigger: Trigger,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<FailurePhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored: Option<RestoredRevision>,
    #[serde(default)]
    pub switch: SwitchSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateSummary>,
    pub owner: String,
    /// Unix timestamp (seconds) when the attempt started.
    pub started_at: u64,
    /// Unix timestamp (seconds) of the terminal transition.
    pub finished_at: u64,
}

impl RevisionRecord {
    pub fn table_key(&self) -> String {
        revision_key(&self.environment, self.revision)
    }

    /// Whether this record put its image into service.
    ///
    /// Successful deploys do; so does a completed operator rollback, which is
    /// the explicit entry documenting a regression to an older image.
    pub fn is_serving(&self) -> bool {
        match self.outcome {
            Outcome::Succeeded => true,
            Outcome::RolledBack => {
                self.trigger == Trigger::Rollback && self.failed_phase.is_none()
            }
            Outcome::Failed => false,
        }
    }
}

pub(crate) fn revision_key(environment: &str, revision: RevisionId) -> String {
    format!("{environment}:{revision:020}")
}

/// Key range `[{env}:, {env};)` covering exactly one environment.
pub(crate) fn revision_range(environment: &str) -> (String, String) {
    (format!("{environment}:"), format!("{environment};"))
}

// ── Locks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// A promotion is running and heartbeating.
    Held,
    /// A rollback failed; only an operator may clear it.
    ManualIntervention,
}

/// Per-environment exclusive token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentLock {
    pub environment: String,
    pub owner: String,
    pub acquired_at: u64,
    pub heartbeat_at: u64,
    pub ttl_secs: u64,
    pub state: LockState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DeploymentLock {
    pub fn table_key(&self) -> &str {
        &self.environment
    }

    /// A held lock whose owner stopped heartbeating for a full TTL.
    /// Manual-intervention locks never go stale.
    pub fn is_stale(&self, now: u64) -> bool {
        self.state == LockState::Held && now.saturating_sub(self.heartbeat_at) >= self.ttl_secs
    }

    pub fn expires_at(&self) -> u64 {
        self.heartbeat_at.saturating_add(self.ttl_secs)
    }
}

/// How a lock was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(DeploymentLock),
    /// An abandoned lock was taken over.
    Reclaimed {
        lock: DeploymentLock,
        previous: DeploymentLock,
    },
}

impl AcquireOutcome {
    pub fn lock(&self) -> &DeploymentLock {
        match self {
            AcquireOutcome::Acquired(lock) => lock,
            AcquireOutcome::Reclaimed { lock, .. } => lock,
        }
    }
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
