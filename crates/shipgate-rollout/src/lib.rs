//! shipgate rollout: strategy executors and the promotion controller.
//!
//! A promotion takes the environment lock, applies the new revision with one
//! of four strategies, gates it on health, and either commits it or reverts.
//!
//! # Components
//!
//! - **`platform`**: traits over the workload platform, traffic router and
//!   GitOps reconciler
//! - **`executor`**: the `StrategyExecutor` seam and strategy selection
//! - **`rolling`**, **`blue_green`**, **`canary`**, **`gitops`**: executors
//! - **`controller`**: the promotion state machine

pub mod blue_green;
pub mod canary;
pub mod controller;
pub mod executor;
pub mod gitops;
pub mod platform;
pub mod rolling;

#[cfg(test)]
pub mod testing;

pub use controller::{
    ControllerSettings, IdleColor, Phase, PromotionController, PromotionError, PromotionReport,
};
pub use executor::{
    Collaborators, ExecutorError, ExecutorSettings, Step, StrategyExecutor, SwitchMetadata,
};
pub use platform::{
    PlatformError, PlatformResult, Reconciler, ReconcilerHealth, SurgePolicy, SyncHealth,
    SyncStatus, TrafficRouter, WorkloadPlatform, WorkloadStatus,
};
