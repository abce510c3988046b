//! shipgate-health: health probing and gating for promotions.
//!
//! Provides the HTTP health prober, per-result classification, and the
//! consecutive-poll gate that decides whether a new revision may be
//! promoted.
//!
//! # Architecture
//!
//! ```text
//! run_gate() / run_gate_until()
//!   ├── GateSource::read() every poll interval (BackoffPolicy)
//!   │   └── EndpointSource: one Prober::probe() per endpoint, multiplexed
//!   ├── HealthGate (consecutive successes / failures, AND across endpoints)
//!   └── bounded by the gate window (or a deadline shared across stages)
//!       and the abort signal
//! ```
//!
//! # Fail-closed
//!
//! `UnknownTimeout` counts exactly like `Unhealthy`. A poll passes only when
//! every endpoint reported `Healthy`.

pub mod checker;
pub mod gate;

pub use checker::{Classification, HealthCheckResult, HttpProber, Prober, classify};
pub use gate::{
    EndpointSource, GateOutcome, GatePolicy, GateReport, GateSource, HealthGate, GateVerdict,
    aggregate, run_gate, run_gate_until, wait_for_abort,
};
