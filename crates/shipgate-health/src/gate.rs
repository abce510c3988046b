//! Consecutive-poll health gate.
//!
//! A gate stage polls its [`GateSource`] at a fixed interval until one of:
//! enough consecutive all-healthy polls (passed), enough consecutive
//! unhealthy polls (failed), the window elapses (timed out), or the abort
//! signal fires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use shipgate_core::config::GateConfig;
use shipgate_core::{BackoffPolicy, HealthEndpoint, format_duration};

use crate::checker::{Classification, HealthCheckResult, Prober};

/// Thresholds and pacing for one gate stage.
#[derive(Debug, Clone, PartialEq)]
pub struct GatePolicy {
    pub success_threshold: u32,
    pub failure_threshold: u32,
    /// Upper bound on the whole gating phase, shared by every stage of a
    /// promotion.
    pub window: Duration,
    pub poll: BackoffPolicy,
    pub probe_timeout: Duration,
}

impl GatePolicy {
    pub fn from_config(config: &GateConfig) -> Self {
        Self {
            success_threshold: config.success_threshold.max(1),
            failure_threshold: config.failure_threshold.max(1),
            window: config.window,
            poll: BackoffPolicy::fixed(config.interval),
            probe_timeout: config.probe_timeout,
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self::from_config(&GateConfig::default())
    }
}

/// Result of feeding one poll into a [`HealthGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Pending,
    Passed,
    Failed,
}

/// AND across endpoints. `UnknownTimeout` is unhealthy, and a poll with no
/// results at all is never health.
pub fn aggregate(results: &[HealthCheckResult]) -> Classification {
    if !results.is_empty() && results.iter().all(|r| r.classification.is_healthy()) {
        Classification::Healthy
    } else {
        Classification::Unhealthy
    }
}

/// Tracks consecutive aggregate poll results for one stage.
#[derive(Debug)]
pub struct HealthGate {
    success_threshold: u32,
    failure_threshold: u32,
    consecutive_successes: u32,
    consecutive_failures: u32,
    polls: u32,
}

impl HealthGate {
    pub fn new(success_threshold: u32, failure_threshold: u32) -> Self {
        Self {
            success_threshold: success_threshold.max(1),
            failure_threshold: failure_threshold.max(1),
            consecutive_successes: 0,
            consecutive_failures: 0,
            polls: 0,
        }
    }

    pub fn from_policy(policy: &GatePolicy) -> Self {
        Self::new(policy.success_threshold, policy.failure_threshold)
    }

    /// Record one poll (all endpoints) and return the verdict so far.
    pub fn record(&mut self, results: &[HealthCheckResult]) -> GateVerdict {
        self.polls += 1;
        match aggregate(results) {
            Classification::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.success_threshold {
                    return GateVerdict::Passed;
                }
            }
            Classification::Unhealthy | Classification::UnknownTimeout => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    return GateVerdict::Failed;
                }
            }
        }
        GateVerdict::Pending
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    fn report(&self, outcome: GateOutcome, reason: Option<String>, elapsed: Duration) -> GateReport {
        GateReport {
            outcome,
            polls: self.polls,
            consecutive_successes: self.consecutive_successes,
            consecutive_failures: self.consecutive_failures,
            reason,
            elapsed,
        }
    }
}

/// How a gate stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Passed,
    Failed,
    TimedOut,
    Aborted,
}

/// Aggregate decision of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReport {
    pub outcome: GateOutcome,
    pub polls: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub reason: Option<String>,
    pub elapsed: Duration,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        self.outcome == GateOutcome::Passed
    }

    /// Report for a stage that had nothing to poll.
    pub fn vacuous() -> Self {
        Self {
            outcome: GateOutcome::Passed,
            polls: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            reason: Some("no health signal configured".to_string()),
            elapsed: Duration::ZERO,
        }
    }
}

/// A source of readings for one gate poll.
#[async_trait]
pub trait GateSource: Send + Sync {
    /// One poll. `None` means no reading is available yet (for example a
    /// reconciler that is still progressing); it counts neither way.
    async fn read(&self) -> Option<Vec<HealthCheckResult>>;
}

/// Probes every endpoint concurrently on each read.
#[derive(Clone)]
pub struct EndpointSource {
    prober: Arc<dyn Prober>,
    endpoints: Vec<HealthEndpoint>,
    timeout: Duration,
}

impl EndpointSource {
    pub fn new(prober: Arc<dyn Prober>, endpoints: Vec<HealthEndpoint>, timeout: Duration) -> Self {
        Self {
            prober,
            endpoints,
            timeout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[async_trait]
impl GateSource for EndpointSource {
    async fn read(&self) -> Option<Vec<HealthCheckResult>> {
        let mut set = JoinSet::new();
        for (index, endpoint) in self.endpoints.iter().cloned().enumerate() {
            let prober = Arc::clone(&self.prober);
            let timeout = self.timeout;
            set.spawn(async move { (index, prober.probe(&endpoint, timeout).await) });
        }

        let mut slots: Vec<Option<HealthCheckResult>> = vec![None; self.endpoints.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => warn!(error = %e, "health probe task failed"),
            }
        }

        // A probe that never reported is treated as a timeout.
        let results = slots
            .into_iter()
            .zip(&self.endpoints)
            .map(|(slot, endpoint)| {
                slot.unwrap_or_else(|| {
                    HealthCheckResult::synthetic(&endpoint.url, Classification::UnknownTimeout)
                })
            })
            .collect();
        Some(results)
    }
}

/// Resolves once the abort signal is raised. If the sender is gone the
/// signal can never fire, so this stays pending.
pub async fn wait_for_abort(abort: &mut watch::Receiver<bool>) {
    if abort.wait_for(|aborted| *aborted).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Run one gate stage to a decision within `policy.window`.
pub async fn run_gate(
    policy: &GatePolicy,
    source: &dyn GateSource,
    abort: &mut watch::Receiver<bool>,
) -> GateReport {
    run_gate_until(policy, source, abort, Instant::now() + policy.window).await
}

/// Run one gate stage against a deadline that may be shared with earlier
/// stages. A deadline already in the past times out without polling.
pub async fn run_gate_until(
    policy: &GatePolicy,
    source: &dyn GateSource,
    abort: &mut watch::Receiver<bool>,
    deadline: Instant,
) -> GateReport {
    let started = Instant::now();
    let mut gate = HealthGate::from_policy(policy);
    let mut delays = policy.poll.delays();

    loop {
        if Instant::now() >= deadline {
            let reason = format!(
                "health gate window of {} elapsed without {} consecutive healthy polls",
                format_duration(policy.window),
                policy.success_threshold
            );
            warn!(polls = gate.polls(), "{reason}");
            return gate.report(GateOutcome::TimedOut, Some(reason), started.elapsed());
        }

        let reading = tokio::select! {
            biased;
            _ = wait_for_abort(abort) => {
                info!(polls = gate.polls(), "health gate aborted");
                return gate.report(GateOutcome::Aborted, Some("aborted".into()), started.elapsed());
            }
            read = tokio::time::timeout_at(deadline, source.read()) => match read {
                Ok(reading) => reading,
                // Loop back to the deadline check.
                Err(_) => continue,
            },
        };

        match reading {
            Some(results) => {
                let verdict = gate.record(&results);
                debug!(
                    poll = gate.polls(),
                    successes = gate.consecutive_successes(),
                    failures = gate.consecutive_failures(),
                    ?verdict,
                    "health gate poll"
                );
                match verdict {
                    GateVerdict::Passed => {
                        return gate.report(GateOutcome::Passed, None, started.elapsed());
                    }
                    GateVerdict::Failed => {
                        let reason = describe_failure(&results, gate.consecutive_failures());
                        warn!(polls = gate.polls(), %reason, "health gate failed");
                        return gate.report(GateOutcome::Failed, Some(reason), started.elapsed());
                    }
                    GateVerdict::Pending => {}
                }
            }
            None => debug!(poll = gate.polls(), "health gate: no reading yet"),
        }

        let Some(delay) = delays.next() else {
            let reason = "health gate poll attempts exhausted".to_string();
            return gate.report(GateOutcome::TimedOut, Some(reason), started.elapsed());
        };
        let wake = (Instant::now() + delay).min(deadline);
        tokio::select! {
            biased;
            _ = wait_for_abort(abort) => {
                info!(polls = gate.polls(), "health gate aborted");
                return gate.report(GateOutcome::Aborted, Some("aborted".into()), started.elapsed());
            }
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}

fn describe_failure(results: &[HealthCheckResult], consecutive: u32) -> String {
    let failing: Vec<String> = results
        .iter()
        .filter(|r| !r.classification.is_healthy())
        .map(|r| match (r.classification, r.status_code) {
            (Classification::UnknownTimeout, _) => format!("{} timed out", r.endpoint),
            (_, Some(code)) => format!("{} returned {code} in {:?}", r.endpoint, r.latency),
            (_, None) => format!("{} unreachable", r.endpoint),
        })
        .collect();
    if failing.is_empty() {
        format!("{consecutive} consecutive unhealthy polls (no readings)")
    } else {
        format!("{consecutive} consecutive unhealthy polls: {}", failing.join(", "))
    }
}
