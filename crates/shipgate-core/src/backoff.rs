//! Retry/poll pacing shared by the health gate and executor readiness waits.
//!
//! One policy object replaces ad hoc "sleep N, try M times" loops: the gate
//! uses a fixed policy (constant interval), readiness waits use an
//! exponential one capped at `max_interval`. Every wait is also bounded by a
//! caller-supplied deadline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_str;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(with = "serde_str")]
    pub initial_interval: Duration,
    #[serde(with = "serde_str")]
    pub max_interval: Duration,
    /// 1.0 means a fixed interval.
    pub multiplier: f64,
    /// Stop after this many attempts. `None` means only the deadline bounds it.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    /// Constant interval, no attempt cap.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            max_attempts: None,
        }
    }

    /// Doubling interval from `initial` up to `max`.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial_interval: initial,
            max_interval: max.max(initial),
            multiplier: 2.0,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay to wait before attempt `attempt` (0-based; attempt 0 waits
    /// `initial_interval`). Returns `None` once `max_attempts` is reached.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let scaled = self.initial_interval.as_secs_f64() * factor;
        let capped = scaled.min(self.max_interval.as_secs_f64());
        Some(Duration::from_secs_f64(capped))
    }

    /// Iterator over successive delays.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0u32..).map_while(move |attempt| self.delay(attempt))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(30))
    }
}
