//! Promotion controller: drives one promotion to a terminal state.
//!
//! `Idle → LockAcquired → Deploying → HealthGating → Promoting | RollingBack
//! → Terminal`. Apply failures, gate failures, gate timeouts and aborts are
//! all absorbed and turned into a rollback. Only a failed rollback escapes
//! as an error, and it leaves the lock pinned for an operator.
//!
//! The gate window bounds the whole `HealthGating` phase, across however
//! many stages the strategy runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use shipgate_core::config::{ShipgateConfig, TimeoutsConfig};
use shipgate_core::{Color, DeploymentRequest, HealthEndpoint, StrategyKind, format_duration};
use shipgate_health::{
    EndpointSource, GateOutcome, GatePolicy, GateReport, GateSource, HealthCheckResult, Prober,
    run_gate_until, wait_for_abort,
};
use shipgate_state::{
    AcquireOutcome, DeploymentLock, FailurePhase, GateSummary, Outcome, RestoredRevision,
    RevisionRecord, StateError, StateStore, SwitchSnapshot, Trigger, epoch_secs,
};

use crate::executor::{Collaborators, ExecutorError, Step, StrategyExecutor, SwitchMetadata};

/// Phase of the promotion state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    LockAcquired,
    Deploying,
    HealthGating,
    Promoting,
    RollingBack,
    Terminal,
}

impl Phase {
    /// Legal edges of the state machine.
    pub fn can_transition(self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Idle, LockAcquired)
                | (LockAcquired, Deploying)
                | (Deploying, HealthGating)
                | (Deploying, RollingBack)
                | (HealthGating, Promoting)
                | (HealthGating, RollingBack)
                | (Promoting, Terminal)
                | (Promoting, RollingBack)
                | (RollingBack, Terminal)
        )
    }
}

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("environment {environment} is locked by {owner} since {since}{}", manual_note(.manual))]
    LockHeld {
        environment: String,
        owner: String,
        since: u64,
        manual: bool,
    },

    #[error("apply failed: {0}")]
    ApplyError(String),

    #[error("health gate timed out: {0}")]
    HealthGateTimeout(String),

    #[error("rollback failed after {phase} failure: {reason}; lock held for manual intervention")]
    RollbackFailed {
        record: Box<RevisionRecord>,
        /// Phase in which the promotion first failed.
        phase: FailurePhase,
        reason: String,
    },

    #[error("no earlier revision to roll back to in {0}")]
    NothingToRollBack(String),

    #[error("{workload} is inside its grace period until {until}; pass --force to retire it now")]
    GracePeriodOpen { workload: String, until: u64 },

    #[error("retiring idle color failed: {0}")]
    Retire(String),

    #[error("cannot start promotion: {0}")]
    Executor(#[from] ExecutorError),

    #[error("invalid phase transition {from:?} -> {to:?}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error(transparent)]
    State(StateError),
}

fn manual_note(manual: &bool) -> &'static str {
    if *manual {
        " (manual intervention required; run `shipgate unlock --force`)"
    } else {
        ""
    }
}

impl From<StateError> for PromotionError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::LockHeld {
                environment,
                owner,
                since,
                manual,
            } => PromotionError::LockHeld {
                environment,
                owner,
                since,
                manual,
            },
            other => PromotionError::State(other),
        }
    }
}

/// Timeouts, gate thresholds and lock TTL.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub gate: GatePolicy,
    pub lock_ttl: Duration,
    pub timeouts: TimeoutsConfig,
}

impl ControllerSettings {
    pub fn from_config(config: &ShipgateConfig) -> Self {
        Self {
            gate: GatePolicy::from_config(&config.gate),
            lock_ttl: config.lock.ttl,
            timeouts: config.timeouts.clone(),
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.lock_ttl / 3).max(Duration::from_secs(1))
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&ShipgateConfig::default())
    }
}

/// Terminal result of a promotion that did not need an operator.
#[derive(Debug, Clone)]
pub struct PromotionReport {
    pub record: RevisionRecord,
    /// Phases visited, in order.
    pub phases: Vec<Phase>,
    /// Abandoned lock taken over at the start, if any.
    pub reclaimed: Option<DeploymentLock>,
}

impl PromotionReport {
    /// The requested revision is now serving.
    pub fn succeeded(&self) -> bool {
        self.record.is_serving()
    }
}

/// The blue-green color a promotion left running for instant re-flip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdleColor {
    /// Platform workload backing the color, `{workload}-{color}`.
    pub workload: String,
    pub color: Color,
    /// Epoch seconds after which it may be retired. `None` means at once.
    pub retire_after: Option<u64>,
}

impl IdleColor {
    /// The idle color behind `record`, if it was a blue-green switch.
    pub fn of(record: &RevisionRecord, workload: &str) -> Option<Self> {
        if record.strategy != StrategyKind::BlueGreen {
            return None;
        }
        let color = record.switch.active_color?.other();
        Some(Self {
            workload: format!("{workload}-{color}"),
            color,
            retire_after: record.switch.retire_idle_after,
        })
    }

    pub fn grace_open(&self, now: u64) -> bool {
        self.retire_after.is_some_and(|until| now < until)
    }
}

/// Validated phase tracking for one promotion.
struct PhaseMachine {
    environment: String,
    phase: Phase,
    visited: Vec<Phase>,
}

impl PhaseMachine {
    fn new(environment: &str) -> Self {
        Self {
            environment: environment.to_string(),
            phase: Phase::Idle,
            visited: vec![Phase::Idle],
        }
    }

    fn enter(&mut self, to: Phase) -> Result<(), PromotionError> {
        if !self.phase.can_transition(to) {
            return Err(PromotionError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        info!(environment = %self.environment, from = ?self.phase, to = ?to, "phase transition");
        self.phase = to;
        self.visited.push(to);
        Ok(())
    }
}

/// Why a promotion is being rolled back.
struct Failure {
    phase: FailurePhase,
    reason: String,
}

impl Failure {
    fn apply(err: PromotionError) -> Self {
        Self {
            phase: FailurePhase::Apply,
            reason: err.to_string(),
        }
    }

    fn gate(reason: String) -> Self {
        Self {
            phase: FailurePhase::HealthGate,
            reason,
        }
    }
}

/// What to write once the heartbeat has stopped.
enum Settlement {
    Release(RevisionRecord),
    Pin {
        record: RevisionRecord,
        phase: FailurePhase,
        reason: String,
    },
}

/// Gate readings: executor signal (if any) followed by HTTP endpoints.
struct StageSource<'a> {
    executor: &'a dyn StrategyExecutor,
    endpoints: EndpointSource,
}

impl StageSource<'_> {
    fn is_vacuous(&self) -> bool {
        !self.executor.provides_signal() && self.endpoints.is_empty()
    }
}

#[async_trait]
impl GateSource for StageSource<'_> {
    async fn read(&self) -> Option<Vec<HealthCheckResult>> {
        let mut results = Vec::new();
        if self.executor.provides_signal() {
            results.extend(self.executor.observe().await?);
        }
        if !self.endpoints.is_empty() {
            results.extend(self.endpoints.read().await?);
        }
        Some(results)
    }
}

static OWNER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Unique per promotion, so a crashed run's lock is never mistaken for ours.
fn new_owner_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!(
        "shipgate-{}-{:x}-{}",
        std::process::id(),
        nanos,
        OWNER_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Renew the lock every `every` until told to stop.
async fn heartbeat(
    store: StateStore,
    environment: String,
    owner: String,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = wait_for_abort(&mut stop) => break,
            _ = tokio::time::sleep(every) => {}
        }
        match store.heartbeat_lock(&environment, &owner, epoch_secs()) {
            Ok(()) => debug!(%environment, %owner, "lock heartbeat"),
            Err(e) => {
                warn!(%environment, %owner, error = %e, "lock heartbeat failed");
                break;
            }
        }
    }
}

/// Drives promotions for any number of environments.
///
/// Every operation that touches the platform holds the environment's
/// [`DeploymentLock`] for its whole duration.
pub struct PromotionController {
    store: StateStore,
    collaborators: Collaborators,
    prober: Arc<dyn Prober>,
    settings: ControllerSettings,
}

impl PromotionController {
    pub fn new(
        store: StateStore,
        collaborators: Collaborators,
        prober: Arc<dyn Prober>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            collaborators,
            prober,
            settings,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Image an operator rollback would promote: `previous()`. Also returns
    /// the currently serving record.
    pub fn rollback_target(
        &self,
        environment: &str,
    ) -> Result<(RevisionRecord, RevisionRecord), PromotionError> {
        let current = self.store.current(environment)?;
        let previous = self.store.previous(environment)?;
        match (current, previous) {
            (Some(current), Some(previous)) => Ok((current, previous)),
            _ => Err(PromotionError::NothingToRollBack(environment.to_string())),
        }
    }

    /// Run one promotion to a terminal state.
    ///
    /// `Ok` covers both success and a completed rollback; check
    /// [`PromotionReport::succeeded`]. Raising `abort` before the promotion
    /// reaches `RollingBack` forces a rollback.
    pub async fn promote(
        &self,
        request: DeploymentRequest,
        trigger: Trigger,
        mut abort: watch::Receiver<bool>,
    ) -> Result<PromotionReport, PromotionError> {
        let environment = request.environment.clone();
        let owner = new_owner_id();
        let started_at = epoch_secs();
        let mut fsm = PhaseMachine::new(&environment);

        let acquired = self.store.acquire_lock(
            &environment,
            &owner,
            self.settings.lock_ttl.as_secs(),
            started_at,
        )?;
        let reclaimed = match acquired {
            AcquireOutcome::Acquired(_) => None,
            AcquireOutcome::Reclaimed { previous, .. } => Some(previous),
        };
        fsm.enter(Phase::LockAcquired)?;
        info!(
            %environment,
            %owner,
            image = %request.image,
            strategy = %request.strategy,
            ?trigger,
            "promotion started"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let beat = tokio::spawn(heartbeat(
            self.store.clone(),
            environment.clone(),
            owner.clone(),
            self.settings.heartbeat_interval(),
            stop_rx,
        ));

        let run = self
            .run_locked(&request, trigger, &owner, started_at, &mut fsm, &mut abort)
            .await;

        let _ = stop_tx.send(true);
        if let Err(e) = beat.await {
            warn!(%environment, error = %e, "heartbeat task ended abnormally");
        }

        let settlement = match run {
            Ok(settlement) => settlement,
            Err(e) => {
                // Nothing was deployed; free the environment.
                if let Err(release) = self.store.release_lock(&environment, &owner) {
                    warn!(%environment, error = %release, "failed to release lock");
                }
                return Err(e);
            }
        };

        match settlement {
            Settlement::Release(record) => {
                let appended = self.store.append_revision(record);
                if let Err(e) = self.store.release_lock(&environment, &owner) {
                    warn!(%environment, error = %e, "failed to release lock");
                }
                let record = appended?;
                fsm.enter(Phase::Terminal)?;
                info!(
                    %environment,
                    revision = record.revision,
                    outcome = ?record.outcome,
                    image = %record.image,
                    "promotion finished"
                );
                Ok(PromotionReport {
                    record,
                    phases: fsm.visited,
                    reclaimed,
                })
            }
            Settlement::Pin {
                record,
                phase,
                reason,
            } => {
                let appended = self.store.append_revision(record.clone());
                if let Err(e) = self
                    .store
                    .mark_lock_manual(&environment, &owner, &reason, epoch_secs())
                {
                    // Not pinned, but the outcome is still a failed rollback.
                    error!(%environment, error = %e, "failed to mark lock for manual intervention");
                }
                let record = match appended {
                    Ok(record) => record,
                    Err(e) => {
                        error!(%environment, error = %e, "failed to record the failed rollback");
                        record
                    }
                };
                fsm.enter(Phase::Terminal)?;
                error!(
                    %environment,
                    revision = record.revision,
                    failed_phase = %phase,
                    %reason,
                    "rollback failed; lock held for manual intervention"
                );
                Err(PromotionError::RollbackFailed {
                    record: Box::new(record),
                    phase,
                    reason,
                })
            }
        }
    }

    async fn run_locked(
        &self,
        request: &DeploymentRequest,
        trigger: Trigger,
        owner: &str,
        started_at: u64,
        fsm: &mut PhaseMachine,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<Settlement, PromotionError> {
        let environment = &request.environment;
        // What a revert goes back to.
        let restore = self.store.current(environment)?;
        let rollback_target = match trigger {
            Trigger::Rollback => self
                .store
                .previous(environment)?
                .filter(|r| r.image == request.image),
            Trigger::Deploy => None,
        };
        let executor = self.collaborators.executor_for(request, restore.as_ref())?;
        let (apply_timeout, revert_timeout) = self.settings.timeouts.for_strategy(request.strategy);

        let record = |outcome: Outcome, switch: SwitchSnapshot, gate: Option<GateSummary>| {
            RevisionRecord {
                environment: environment.clone(),
                revision: 0,
                image: request.image.clone(),
                strategy: request.strategy,
                trigger,
                outcome,
                failed_phase: None,
                reason: None,
                restored: None,
                switch,
                gate,
                owner: owner.to_string(),
                started_at,
                finished_at: epoch_secs(),
            }
        };

        // Deploying
        fsm.enter(Phase::Deploying)?;
        let applied = tokio::select! {
            biased;
            _ = wait_for_abort(abort) => Err(PromotionError::ApplyError("aborted during deploy".into())),
            result = tokio::time::timeout(apply_timeout, executor.apply()) => match result {
                Ok(Ok(meta)) => Ok(meta),
                Ok(Err(e)) => Err(PromotionError::ApplyError(e.to_string())),
                Err(_) => Err(PromotionError::ApplyError(format!(
                    "timed out after {}",
                    format_duration(apply_timeout)
                ))),
            },
        };

        let (failure, summary) = match applied {
            Err(err) => {
                warn!(%environment, error = %err, "apply failed; rolling back");
                (Failure::apply(err), None)
            }
            Ok(meta) => {
                debug!(%environment, ?meta, "apply complete");
                fsm.enter(Phase::HealthGating)?;
                let (gated, summary) = self.gate(request, executor.as_ref(), abort).await;
                match gated {
                    Ok(meta) => {
                        fsm.enter(Phase::Promoting)?;
                        if !*abort.borrow() {
                            return Ok(Settlement::Release(match trigger {
                                Trigger::Deploy => record(Outcome::Succeeded, meta, Some(summary)),
                                // The explicit entry documenting a regression.
                                Trigger::Rollback => {
                                    let mut regressed = record(Outcome::RolledBack, meta, Some(summary));
                                    regressed.restored = rollback_target.map(|r| RestoredRevision {
                                        revision: r.revision,
                                        image: r.image,
                                    });
                                    regressed
                                }
                            }));
                        }
                        (Failure::gate("aborted while promoting".into()), Some(summary))
                    }
                    Err(failure) => (failure, Some(summary)),
                }
            }
        };

        // RollingBack: not abortable.
        fsm.enter(Phase::RollingBack)?;
        warn!(
            %environment,
            failed_phase = %failure.phase,
            reason = %failure.reason,
            "rolling back"
        );
        let reverted = match tokio::time::timeout(revert_timeout, executor.revert()).await {
            Ok(Ok(meta)) => Ok(meta),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("revert timed out after {}", format_duration(revert_timeout))),
        };

        match reverted {
            Ok(meta) => {
                let mut rolled_back = record(Outcome::RolledBack, meta, summary);
                rolled_back.failed_phase = Some(failure.phase);
                rolled_back.reason = Some(failure.reason);
                rolled_back.restored = restore.map(|r| RestoredRevision {
                    revision: r.revision,
                    image: r.image,
                });
                info!(%environment, "rollback complete");
                Ok(Settlement::Release(rolled_back))
            }
            Err(revert_error) => {
                let reason = format!("{}; revert failed: {revert_error}", failure.reason);
                let mut failed = record(Outcome::Failed, SwitchMetadata::default(), summary);
                failed.failed_phase = Some(FailurePhase::Rollback);
                failed.reason = Some(reason.clone());
                Ok(Settlement::Pin {
                    record: failed,
                    phase: failure.phase,
                    reason,
                })
            }
        }
    }

    /// Scale down the idle blue-green color of the serving revision.
    ///
    /// Refuses while the color is inside its grace period unless `force`
    /// is set. Returns `None` when the serving revision has no idle color.
    /// `workload` defaults to the serving image's name.
    pub async fn retire_idle(
        &self,
        environment: &str,
        workload: Option<&str>,
        force: bool,
    ) -> Result<Option<IdleColor>, PromotionError> {
        let owner = new_owner_id();
        self.store.acquire_lock(
            environment,
            &owner,
            self.settings.lock_ttl.as_secs(),
            epoch_secs(),
        )?;
        let result = self.retire_locked(environment, workload, force).await;
        if let Err(e) = self.store.release_lock(environment, &owner) {
            warn!(%environment, error = %e, "failed to release lock");
        }
        result
    }

    async fn retire_locked(
        &self,
        environment: &str,
        workload: Option<&str>,
        force: bool,
    ) -> Result<Option<IdleColor>, PromotionError> {
        let Some(current) = self.store.current(environment)? else {
            return Ok(None);
        };
        let workload = workload.unwrap_or(current.image.name());
        let Some(idle) = IdleColor::of(&current, workload) else {
            debug!(%environment, strategy = %current.strategy, "no idle color to retire");
            return Ok(None);
        };

        let now = epoch_secs();
        if idle.grace_open(now) {
            let until = idle.retire_after.unwrap_or(now);
            if !force {
                return Err(PromotionError::GracePeriodOpen {
                    workload: idle.workload,
                    until,
                });
            }
            warn!(%environment, workload = %idle.workload, until, "retiring idle color inside its grace period");
        }

        let (timeout, _) = self.settings.timeouts.for_strategy(StrategyKind::BlueGreen);
        match tokio::time::timeout(timeout, self.collaborators.platform.scale(&idle.workload, 0)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(PromotionError::Retire(e.to_string())),
            Err(_) => {
                return Err(PromotionError::Retire(format!(
                    "scaling {} timed out after {}",
                    idle.workload,
                    format_duration(timeout)
                )));
            }
        }
        info!(%environment, workload = %idle.workload, color = %idle.color, "idle color retired");
        Ok(Some(idle))
    }

    /// Run gate stages until the executor reports the revision fully live.
    async fn gate(
        &self,
        request: &DeploymentRequest,
        executor: &dyn StrategyExecutor,
        abort: &mut watch::Receiver<bool>,
    ) -> (Result<SwitchMetadata, Failure>, GateSummary) {
        let environment = &request.environment;
        let policy = executor.gate_policy(&self.settings.gate);
        let color = executor.probe_color().map(|c| c.as_str());
        let endpoints: Vec<HealthEndpoint> = request
            .health
            .iter()
            .map(|e| e.resolve_color(color))
            .collect();
        let source = StageSource {
            executor,
            endpoints: EndpointSource::new(
                Arc::clone(&self.prober),
                endpoints,
                policy.probe_timeout,
            ),
        };
        // Advancing moves traffic or rolls workloads, so it gets the apply budget.
        let (advance_timeout, _) = self.settings.timeouts.for_strategy(request.strategy);
        // One window for the whole phase, however many stages it takes.
        let deadline = tokio::time::Instant::now() + policy.window;

        let mut summary = GateSummary::default();
        loop {
            let report = if source.is_vacuous() {
                warn!(%environment, "no health endpoints configured; gate passes without probing");
                GateReport::vacuous()
            } else {
                run_gate_until(&policy, &source, abort, deadline).await
            };
            summary.stages += 1;
            summary.polls += report.polls;
            summary.consecutive_successes = report.consecutive_successes;
            summary.consecutive_failures = report.consecutive_failures;
            summary.reason = report.reason.clone();

            match report.outcome {
                GateOutcome::Passed => {
                    summary.passed = true;
                }
                GateOutcome::Failed => {
                    summary.passed = false;
                    let reason = report.reason.unwrap_or_else(|| "health gate failed".into());
                    return (Err(Failure::gate(reason)), summary);
                }
                GateOutcome::TimedOut => {
                    summary.passed = false;
                    let err = PromotionError::HealthGateTimeout(
                        report.reason.unwrap_or_else(|| "window elapsed".into()),
                    );
                    return (Err(Failure::gate(err.to_string())), summary);
                }
                GateOutcome::Aborted => {
                    summary.passed = false;
                    return (Err(Failure::gate("aborted during health gate".into())), summary);
                }
            }

            let step = tokio::select! {
                biased;
                _ = wait_for_abort(abort) => {
                    summary.passed = false;
                    return (Err(Failure::gate("aborted during health gate".into())), summary);
                }
                step = tokio::time::timeout(advance_timeout, executor.advance()) => step,
            };
            match step {
                Ok(Ok(Step::Continue(meta))) => {
                    info!(
                        %environment,
                        stage = summary.stages,
                        weight = ?meta.canary_weight,
                        color = ?meta.active_color,
                        "gate stage passed; advancing"
                    );
                }
                Ok(Ok(Step::Done(meta))) => return (Ok(meta), summary),
                Ok(Err(e)) => {
                    summary.passed = false;
                    return (Err(Failure::apply(PromotionError::ApplyError(e.to_string()))), summary);
                }
                Err(_) => {
                    summary.passed = false;
                    let err = PromotionError::ApplyError(format!(
                        "advance timed out after {}",
                        format_duration(advance_timeout)
                    ));
                    return (Err(Failure::apply(err)), summary);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipgate_core::{Color, ImageRef, StrategyKind};
    use shipgate_health::Classification::{Healthy, Unhealthy};
    use shipgate_state::LockState;

    use crate::executor::ExecutorSettings;
    use crate::platform::{ReconcilerHealth, SyncStatus};
    use crate::testing::{FakePlatform, FakeReconciler, FakeRouter, ScriptedProber};

    const HEALTH_URL: &str = "http://api.prod.internal/healthz";

    fn request(image: &str, strategy: StrategyKind) -> DeploymentRequest {
        DeploymentRequest::new("prod", ImageRef::parse(image).unwrap(), strategy, 3).unwrap()
    }

    fn seed_record(image: &str, strategy: StrategyKind) -> RevisionRecord {
        RevisionRecord {
            environment: "prod".into(),
            revision: 0,
            image: ImageRef::parse(image).unwrap(),
            strategy,
            trigger: Trigger::Deploy,
            outcome: Outcome::Succeeded,
            failed_phase: None,
            reason: None,
            restored: None,
            switch: SwitchSnapshot::default(),
            gate: None,
            owner: "seed".into(),
            started_at: 1,
            finished_at: 2,
        }
    }

    fn seed(store: &StateStore, image: &str, strategy: StrategyKind) -> RevisionRecord {
        store.append_revision(seed_record(image, strategy)).unwrap()
    }

    struct Harness {
        store: StateStore,
        platform: Arc<FakePlatform>,
        router: Arc<FakeRouter>,
        reconciler: Arc<FakeReconciler>,
        prober: Arc<ScriptedProber>,
    }

    impl Harness {
        fn new(platform: FakePlatform, router: FakeRouter, prober: ScriptedProber) -> Self {
            Self {
                store: StateStore::open_in_memory().unwrap(),
                platform: Arc::new(platform),
                router: Arc::new(router),
                reconciler: Arc::new(FakeReconciler::new()),
                prober: Arc::new(prober),
            }
        }

        fn controller(&self) -> PromotionController {
            self.controller_with(ControllerSettings::default())
        }

        fn controller_with(&self, settings: ControllerSettings) -> PromotionController {
            let collaborators = Collaborators {
                platform: self.platform.clone(),
                router: self.router.clone(),
                reconciler: Some(self.reconciler.clone()),
                settings: ExecutorSettings::default(),
            };
            PromotionController::new(
                self.store.clone(),
                collaborators,
                self.prober.clone(),
                settings,
            )
        }
    }

    fn seed_blue_green(store: &StateStore, active: Color, retire_after: u64) -> RevisionRecord {
        store
            .append_revision(RevisionRecord {
                switch: SwitchSnapshot {
                    active_color: Some(active),
                    canary_weight: None,
                    retire_idle_after: Some(retire_after),
                },
                ..seed_record("api:v1", StrategyKind::BlueGreen)
            })
            .unwrap()
    }

    fn no_abort() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[test]
    fn phase_edges() {
        use Phase::*;
        assert!(Idle.can_transition(LockAcquired));
        assert!(Deploying.can_transition(RollingBack));
        assert!(HealthGating.can_transition(Promoting));
        assert!(!Idle.can_transition(Deploying));
        assert!(!RollingBack.can_transition(Promoting));
        assert!(!Terminal.can_transition(Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_success_commits_and_releases_lock() {
        let h = Harness::new(
            FakePlatform::new().with_workload("api", "api:v1", 3),
            FakeRouter::new(),
            ScriptedProber::new().healthy(HEALTH_URL),
        );
        seed(&h.store, "api:v1", StrategyKind::Rolling);
        let req = request("api:v2", StrategyKind::Rolling)
            .with_health(vec![HealthEndpoint::new(HEALTH_URL)]);
        let (_tx, abort) = no_abort();

        let started = tokio::time::Instant::now();
        let report = h.controller().promote(req, Trigger::Deploy, abort).await.unwrap();

        assert!(report.succeeded());
        assert_eq!(report.record.outcome, Outcome::Succeeded);
        assert_eq!(report.record.revision, 2);
        let gate = report.record.gate.clone().unwrap();
        assert_eq!(gate.polls, 3);
        assert!(gate.passed);
        // Three reads, ten seconds apart.
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert_eq!(
            report.phases,
            vec![
                Phase::Idle,
                Phase::LockAcquired,
                Phase::Deploying,
                Phase::HealthGating,
                Phase::Promoting,
                Phase::Terminal
            ]
        );

        assert_eq!(h.store.current("prod").unwrap().unwrap().image.tag(), Some("v2"));
        assert!(h.store.get_lock("prod").unwrap().is_none());
        assert_eq!(h.platform.image_of("api").as_deref(), Some("api:v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn blue_green_unhealthy_new_color_flips_back() {
        let h = Harness::new(
            FakePlatform::new().with_workload("api-blue", "api:v1", 3),
            FakeRouter::new().with_active("api", Color::Blue),
            ScriptedProber::new().script(
                "http://api-green.prod.internal/healthz",
                [Healthy, Healthy, Healthy, Unhealthy, Unhealthy, Unhealthy],
            ),
        );
        let v1 = seed(&h.store, "api:v1", StrategyKind::BlueGreen);
        let req = request("api:v2", StrategyKind::BlueGreen).with_health(vec![HealthEndpoint::new(
            "http://api-{color}.prod.internal/healthz",
        )]);
        let (_tx, abort) = no_abort();

        let report = h.controller().promote(req, Trigger::Deploy, abort).await.unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.record.outcome, Outcome::RolledBack);
        assert_eq!(report.record.failed_phase, Some(FailurePhase::HealthGate));
        assert_eq!(
            report.record.restored,
            Some(RestoredRevision {
                revision: v1.revision,
                image: v1.image.clone()
            })
        );
        assert_eq!(report.record.switch.active_color, Some(Color::Blue));
        assert_eq!(report.record.gate.as_ref().unwrap().stages, 2);

        // Flipped to green after the first stage, then straight back.
        assert_eq!(h.router.color_history(), vec![Color::Green, Color::Blue]);
        assert_eq!(h.router.active("api"), Some(Color::Blue));
        assert_eq!(h.store.current("prod").unwrap().unwrap().image.tag(), Some("v1"));
        assert!(h.store.get_lock("prod").unwrap().is_none());
        assert!(
            h.prober
                .probes()
                .iter()
                .all(|url| url == "http://api-green.prod.internal/healthz")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn canary_abort_mid_ramp_drops_weight_to_zero() {
        let h = Harness::new(
            FakePlatform::new().with_workload("api", "api:v1", 3),
            FakeRouter::new(),
            ScriptedProber::new().script(
                HEALTH_URL,
                [Healthy, Healthy, Healthy, Healthy, Healthy, Healthy, Unhealthy],
            ),
        );
        seed(&h.store, "api:v1", StrategyKind::Canary);
        let req = request("api:v2", StrategyKind::Canary)
            .with_health(vec![HealthEndpoint::new(HEALTH_URL)]);
        let (_tx, abort) = no_abort();

        let report = h.controller().promote(req, Trigger::Deploy, abort).await.unwrap();

        assert_eq!(report.record.outcome, Outcome::RolledBack);
        assert_eq!(report.record.failed_phase, Some(FailurePhase::HealthGate));
        assert_eq!(report.record.switch.canary_weight, Some(0));
        // Monotonic up to 30, then straight to 0 on the first bad read.
        assert_eq!(h.router.weight_history(), vec![10, 20, 30, 0]);
        assert_eq!(h.platform.image_of("api").as_deref(), Some("api:v1"));
        assert_eq!(h.platform.workload("api-canary").unwrap().replicas, 0);
        assert_eq!(report.record.gate.as_ref().unwrap().stages, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn canary_gates_full_weight_before_promoting() {
        let h = Harness::new(
            FakePlatform::new().with_workload("api", "api:v1", 3),
            FakeRouter::new(),
            ScriptedProber::new().healthy(HEALTH_URL),
        );
        seed(&h.store, "api:v1", StrategyKind::Canary);
        let req = request("api:v2", StrategyKind::Canary)
            .with_health(vec![HealthEndpoint::new(HEALTH_URL)]);
        let (_tx, abort) = no_abort();

        let started = tokio::time::Instant::now();
        let report = h.controller().promote(req, Trigger::Deploy, abort).await.unwrap();

        assert!(report.succeeded());
        // One stage per weight, 100 included.
        let gate = report.record.gate.clone().unwrap();
        assert_eq!(gate.stages, 10);
        assert_eq!(gate.polls, 30);
        assert_eq!(started.elapsed(), Duration::from_secs(200));
        assert_eq!(
            h.router.weight_history(),
            vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 0]
        );
        assert_eq!(h.platform.image_of("api").as_deref(), Some("api:v2"));
        assert_eq!(h.platform.workload("api-canary").unwrap().replicas, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_window_spans_every_canary_stage() {
        let h = Harness::new(
            FakePlatform::new().with_workload("api", "api:v1", 3),
            FakeRouter::new(),
            ScriptedProber::new().healthy(HEALTH_URL),
        );
        seed(&h.store, "api:v1", StrategyKind::Canary);
        let req = request("api:v2", StrategyKind::Canary)
            .with_health(vec![HealthEndpoint::new(HEALTH_URL)]);
        let mut settings = ControllerSettings::default();
        settings.gate.window = Duration::from_secs(60);
        let (_tx, abort) = no_abort();

        let started = tokio::time::Instant::now();
        let report = h
            .controller_with(settings)
            .promote(req, Trigger::Deploy, abort)
            .await
            .unwrap();

        // Two 20s stages pass; the third runs out of the shared window.
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert_eq!(report.record.outcome, Outcome::RolledBack);
        assert_eq!(report.record.failed_phase, Some(FailurePhase::HealthGate));
        assert!(report.record.reason.as_deref().unwrap().contains("timed out"));
        assert_eq!(report.record.gate.as_ref().unwrap().stages, 3);
        assert_eq!(h.router.weight_history(), vec![10, 20, 30, 0]);
        assert_eq!(h.platform.image_of("api").as_deref(), Some("api:v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_lock_is_reclaimed() {
        let h = Harness::new(
            FakePlatform::new(),
            FakeRouter::new(),
            ScriptedProber::new().healthy(HEALTH_URL),
        );
        // Acquired 40 minutes ago with a 30 minute TTL, never renewed.
        h.store
            .acquire_lock("prod", "crashed-controller", 30 * 60, epoch_secs() - 40 * 60)
            .unwrap();
        let req = request("api:v2", StrategyKind::Rolling)
            .with_health(vec![HealthEndpoint::new(HEALTH_URL)]);
        let (_tx, abort) = no_abort();

        let report = h.controller().promote(req, Trigger::Deploy, abort).await.unwrap();

        assert!(report.succeeded());
        assert_eq!(report.reclaimed.unwrap().owner, "crashed-controller");
        assert!(h.store.get_lock("prod").unwrap().is_none());
    }

    #[tokio::test]
    async fn held_lock_rejects_promotion_without_side_effects() {
        let h = Harness::new(FakePlatform::new(), FakeRouter::new(), ScriptedProber::new());
        h.store.acquire_lock("prod", "other", 30 * 60, epoch_secs()).unwrap();
        let (_tx, abort) = no_abort();

        let err = h
            .controller()
            .promote(request("api:v2", StrategyKind::Rolling), Trigger::Deploy, abort)
            .await
            .unwrap_err();

        match err {
            PromotionError::LockHeld { owner, manual, .. } => {
                assert_eq!(owner, "other");
                assert!(!manual);
            }
            other => panic!("expected LockHeld, got {other:?}"),
        }
        assert!(h.platform.calls().is_empty());
        assert!(h.store.list_revisions("prod").unwrap().is_empty());
        assert_eq!(h.store.get_lock("prod").unwrap().unwrap().owner, "other");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_promotions_are_mutually_exclusive() {
        let h = Harness::new(
            FakePlatform::new(),
            FakeRouter::new(),
            ScriptedProber::new().healthy(HEALTH_URL),
        );
        let ctl = h.controller();
        let health = vec![HealthEndpoint::new(HEALTH_URL)];
        let (_tx, abort) = no_abort();

        let (a, b) = tokio::join!(
            ctl.promote(
                request("api:v2", StrategyKind::Rolling).with_health(health.clone()),
                Trigger::Deploy,
                abort.clone()
            ),
            ctl.promote(
                request("api:v3", StrategyKind::Rolling).with_health(health.clone()),
                Trigger::Deploy,
                abort.clone()
            ),
        );

        let oks = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(oks, 1);
        assert!(matches!(
            a.err().or(b.err()),
            Some(PromotionError::LockHeld { .. })
        ));
        assert_eq!(h.store.list_revisions("prod").unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_failure_rolls_back_without_gating() {
        let h = Harness::new(
            FakePlatform::new(),
            FakeRouter::new(),
            ScriptedProber::new().healthy(HEALTH_URL),
        );
        h.platform.fail_set_image("api");
        let req = request("api:v2", StrategyKind::Rolling)
            .with_health(vec![HealthEndpoint::new(HEALTH_URL)]);
        let (_tx, abort) = no_abort();

        let report = h.controller().promote(req, Trigger::Deploy, abort).await.unwrap();

        assert_eq!(report.record.outcome, Outcome::RolledBack);
        assert_eq!(report.record.failed_phase, Some(FailurePhase::Apply));
        assert!(report.record.gate.is_none());
        assert!(h.prober.probes().is_empty());
        assert_eq!(
            report.phases,
            vec![
                Phase::Idle,
                Phase::LockAcquired,
                Phase::Deploying,
                Phase::RollingBack,
                Phase::Terminal
            ]
        );
        assert!(h.store.get_lock("prod").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn apply_timeout_counts_as_failure() {
        let h = Harness::new(FakePlatform::new(), FakeRouter::new(), ScriptedProber::new());
        h.platform.hang_set_image("api");
        let (_tx, abort) = no_abort();

        let started = tokio::time::Instant::now();
        let report = h
            .controller()
            .promote(request("api:v2", StrategyKind::Rolling), Trigger::Deploy, abort)
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(10 * 60));
        assert_eq!(report.record.failed_phase, Some(FailurePhase::Apply));
        assert!(report.record.reason.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_revert_pins_lock_for_operator() {
        let h = Harness::new(
            FakePlatform::new().with_workload("api", "api:v1", 3),
            FakeRouter::new(),
            ScriptedProber::new().healthy(HEALTH_URL),
        );
        seed(&h.store, "api:v1", StrategyKind::Canary);
        // Weight changes fail, so both apply and revert fail.
        h.router.fail_switches();
        let req = request("api:v2", StrategyKind::Canary)
            .with_health(vec![HealthEndpoint::new(HEALTH_URL)]);
        let (_tx, abort) = no_abort();
        let ctl = h.controller();

        let err = ctl.promote(req.clone(), Trigger::Deploy, abort.clone()).await.unwrap_err();
        match err {
            PromotionError::RollbackFailed { record, phase, .. } => {
                assert_eq!(phase, FailurePhase::Apply);
                assert_eq!(record.outcome, Outcome::Failed);
                assert_eq!(record.failed_phase, Some(FailurePhase::Rollback));
            }
            other => panic!("expected RollbackFailed, got {other:?}"),
        }

        let lock = h.store.get_lock("prod").unwrap().unwrap();
        assert_eq!(lock.state, LockState::ManualIntervention);
        assert!(lock.reason.is_some());
        assert_eq!(h.store.current("prod").unwrap().unwrap().image.tag(), Some("v1"));

        // Nothing proceeds until an operator clears it.
        let blocked = ctl.promote(req, Trigger::Deploy, abort).await.unwrap_err();
        assert!(matches!(blocked, PromotionError::LockHeld { manual: true, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_during_gate_rolls_back() {
        let h = Harness::new(
            FakePlatform::new().with_workload("api", "api:v1", 3),
            FakeRouter::new(),
            ScriptedProber::new().healthy(HEALTH_URL),
        );
        seed(&h.store, "api:v1", StrategyKind::Rolling);
        let req = request("api:v2", StrategyKind::Rolling)
            .with_health(vec![HealthEndpoint::new(HEALTH_URL)]);
        let (tx, abort) = no_abort();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            let _ = tx.send(true);
        });

        let report = h.controller().promote(req, Trigger::Deploy, abort).await.unwrap();

        assert_eq!(report.record.outcome, Outcome::RolledBack);
        assert_eq!(report.record.failed_phase, Some(FailurePhase::HealthGate));
        assert!(report.record.reason.as_deref().unwrap().contains("aborted"));
        assert_eq!(h.platform.image_of("api").as_deref(), Some("api:v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_during_deploy_rolls_back() {
        let h = Harness::new(
            FakePlatform::new(),
            FakeRouter::new(),
            ScriptedProber::new().healthy(HEALTH_URL),
        );
        h.platform.hang_set_image("api");
        let req = request("api:v2", StrategyKind::Rolling)
            .with_health(vec![HealthEndpoint::new(HEALTH_URL)]);
        let (tx, abort) = no_abort();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let _ = tx.send(true);
        });

        let started = tokio::time::Instant::now();
        let report = h.controller().promote(req, Trigger::Deploy, abort).await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(report.record.outcome, Outcome::RolledBack);
        assert_eq!(report.record.failed_phase, Some(FailurePhase::Apply));
        assert!(report.record.reason.as_deref().unwrap().contains("aborted"));
        assert_eq!(
            report.phases,
            vec![
                Phase::Idle,
                Phase::LockAcquired,
                Phase::Deploying,
                Phase::RollingBack,
                Phase::Terminal
            ]
        );
        assert!(h.prober.probes().is_empty());
        assert!(h.store.get_lock("prod").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_revert_is_reported_even_if_lock_was_taken_away() {
        let h = Harness::new(
            FakePlatform::new().with_workload("api", "api:v1", 3),
            FakeRouter::new(),
            ScriptedProber::new().healthy(HEALTH_URL),
        );
        seed(&h.store, "api:v1", StrategyKind::Canary);
        h.platform.hang_set_image("api-canary");
        h.router.fail_switches();
        let req = request("api:v2", StrategyKind::Canary)
            .with_health(vec![HealthEndpoint::new(HEALTH_URL)]);
        let (tx, abort) = no_abort();
        let store = h.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            // An operator clears the lock mid-promotion, then interrupts it.
            store.force_release("prod").unwrap();
            let _ = tx.send(true);
        });

        let err = h.controller().promote(req, Trigger::Deploy, abort).await.unwrap_err();

        match err {
            PromotionError::RollbackFailed { record, phase, .. } => {
                assert_eq!(phase, FailurePhase::Apply);
                assert_eq!(record.outcome, Outcome::Failed);
            }
            other => panic!("expected RollbackFailed, got {other:?}"),
        }
        assert!(h.store.get_lock("prod").unwrap().is_none());
        let latest = h.store.history("prod", 1).unwrap();
        assert_eq!(latest[0].outcome, Outcome::Failed);
    }

    #[tokio::test]
    async fn retire_idle_respects_grace_period() {
        let h = Harness::new(
            FakePlatform::new()
                .with_workload("api-blue", "api:v0", 3)
                .with_workload("api-green", "api:v1", 3),
            FakeRouter::new().with_active("api", Color::Green),
            ScriptedProber::new(),
        );
        seed_blue_green(&h.store, Color::Green, epoch_secs() + 900);
        let ctl = h.controller();

        let err = ctl.retire_idle("prod", None, false).await.unwrap_err();
        match err {
            PromotionError::GracePeriodOpen { workload, .. } => assert_eq!(workload, "api-blue"),
            other => panic!("expected GracePeriodOpen, got {other:?}"),
        }
        assert_eq!(h.platform.workload("api-blue").unwrap().replicas, 3);
        assert!(h.store.get_lock("prod").unwrap().is_none());

        let idle = ctl.retire_idle("prod", None, true).await.unwrap().unwrap();
        assert_eq!(idle.color, Color::Blue);
        assert_eq!(h.platform.workload("api-blue").unwrap().replicas, 0);
        assert_eq!(h.platform.workload("api-green").unwrap().replicas, 3);
        assert!(h.store.get_lock("prod").unwrap().is_none());
    }

    #[tokio::test]
    async fn retire_idle_after_grace_period_needs_no_force() {
        let h = Harness::new(
            FakePlatform::new().with_workload("web-blue", "api:v0", 3),
            FakeRouter::new(),
            ScriptedProber::new(),
        );
        seed_blue_green(&h.store, Color::Green, epoch_secs() - 1);

        let idle = h
            .controller()
            .retire_idle("prod", Some("web"), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(idle.workload, "web-blue");
        assert_eq!(h.platform.calls(), vec!["scale web-blue 0"]);
    }

    #[tokio::test]
    async fn retire_idle_without_blue_green_does_nothing() {
        let h = Harness::new(FakePlatform::new(), FakeRouter::new(), ScriptedProber::new());
        let ctl = h.controller();
        assert_eq!(ctl.retire_idle("prod", None, false).await.unwrap(), None);

        seed(&h.store, "api:v1", StrategyKind::Rolling);
        assert_eq!(ctl.retire_idle("prod", None, false).await.unwrap(), None);
        assert!(h.platform.calls().is_empty());

        // Busy environments are left alone.
        h.store.acquire_lock("prod", "other", 30 * 60, epoch_secs()).unwrap();
        assert!(matches!(
            ctl.retire_idle("prod", None, false).await,
            Err(PromotionError::LockHeld { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn operator_rollback_records_regression() {
        let h = Harness::new(
            FakePlatform::new().with_workload("api", "api:v2", 3),
            FakeRouter::new(),
            ScriptedProber::new(),
        );
        let v1 = seed(&h.store, "api:v1", StrategyKind::Rolling);
        seed(&h.store, "api:v2", StrategyKind::Rolling);
        let ctl = h.controller();

        let (current, target) = ctl.rollback_target("prod").unwrap();
        assert_eq!(current.image.tag(), Some("v2"));
        assert_eq!(target.image, v1.image);

        let req = request(&target.image.to_string(), target.strategy);
        let (_tx, abort) = no_abort();
        let report = ctl.promote(req, Trigger::Rollback, abort).await.unwrap();

        assert!(report.succeeded());
        assert_eq!(report.record.outcome, Outcome::RolledBack);
        assert_eq!(report.record.trigger, Trigger::Rollback);
        assert_eq!(report.record.failed_phase, None);
        assert_eq!(report.record.restored.as_ref().unwrap().revision, v1.revision);
        assert_eq!(h.store.current("prod").unwrap().unwrap().revision, 3);
        assert_eq!(h.store.previous("prod").unwrap().unwrap().image.tag(), Some("v2"));
        assert_eq!(h.platform.image_of("api").as_deref(), Some("api:v1"));
    }

    #[test]
    fn rollback_needs_history() {
        let h = Harness::new(FakePlatform::new(), FakeRouter::new(), ScriptedProber::new());
        seed(&h.store, "api:v1", StrategyKind::Rolling);
        assert!(matches!(
            h.controller().rollback_target("prod"),
            Err(PromotionError::NothingToRollBack(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn gitops_promotion_uses_reconciler_health() {
        let h = Harness::new(FakePlatform::new(), FakeRouter::new(), ScriptedProber::new());
        seed(&h.store, "api:v1", StrategyKind::GitopsSync);
        let (_tx, abort) = no_abort();

        let report = h
            .controller()
            .promote(request("api:v2", StrategyKind::GitopsSync), Trigger::Deploy, abort)
            .await
            .unwrap();

        assert!(report.succeeded());
        assert_eq!(report.record.gate.as_ref().unwrap().polls, 3);
        assert_eq!(h.reconciler.desired("api-prod").as_deref(), Some("api:v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn gitops_degraded_writes_back_previous_revision() {
        let h = Harness::new(FakePlatform::new(), FakeRouter::new(), ScriptedProber::new());
        seed(&h.store, "api:v1", StrategyKind::GitopsSync);
        h.reconciler.script([
            (SyncStatus::Synced, ReconcilerHealth::Healthy),
            (SyncStatus::Synced, ReconcilerHealth::Degraded),
        ]);
        let (_tx, abort) = no_abort();

        let report = h
            .controller()
            .promote(request("api:v2", StrategyKind::GitopsSync), Trigger::Deploy, abort)
            .await
            .unwrap();

        assert_eq!(report.record.outcome, Outcome::RolledBack);
        assert_eq!(h.reconciler.desired("api-prod").as_deref(), Some("api:v1"));
        assert_eq!(h.reconciler.writes(), vec!["api:v2", "api:v1"]);
    }
}
