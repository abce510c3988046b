//! shipgate-core: shared vocabulary for the promotion controller.
//!
//! Holds the immutable [`DeploymentRequest`], image references, the
//! [`BackoffPolicy`] used for every poll/retry loop, and the
//! `shipgate.toml` configuration model.

pub mod backoff;
pub mod config;
pub mod duration;
pub mod image;
pub mod types;

pub use backoff::BackoffPolicy;
pub use config::{ConfigError, ShipgateConfig};
pub use duration::{format_duration, parse_duration};
pub use image::{ImageRef, ImageRefError, ImageVersion};
pub use types::*;
