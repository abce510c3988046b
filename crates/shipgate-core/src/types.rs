//! Request types shared by the controller, executors, and CLI.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::serde_opt_str;
use crate::image::ImageRef;

/// Revision-switch mechanism for a promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    Rolling,
    BlueGreen,
    Canary,
    GitopsSync,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Rolling => "rolling",
            StrategyKind::BlueGreen => "blue-green",
            StrategyKind::Canary => "canary",
            StrategyKind::GitopsSync => "gitops-sync",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "rolling" => Ok(StrategyKind::Rolling),
            "blue-green" | "bluegreen" => Ok(StrategyKind::BlueGreen),
            "canary" => Ok(StrategyKind::Canary),
            "gitops-sync" | "gitopssync" | "gitops" => Ok(StrategyKind::GitopsSync),
            other => Err(RequestError::UnknownStrategy(other.to_string())),
        }
    }
}

/// One of the two blue-green environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Blue,
    Green,
}

impl Color {
    pub fn other(self) -> Self {
        match self {
            Color::Blue => Color::Green,
            Color::Green => Color::Blue,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Blue => "blue",
            Color::Green => "green",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "blue" => Ok(Color::Blue),
            "green" => Ok(Color::Green),
            other => Err(format!("unknown color: {other}")),
        }
    }
}

/// A health/readiness endpoint checked by the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthEndpoint {
    /// `http://host:port/path`. May contain `{color}` for blue-green.
    pub url: String,
    /// Exact status to expect. `None` accepts any 2xx.
    #[serde(default)]
    pub expected_status: Option<u16>,
    /// Latency ceiling; a slower 2xx is unhealthy.
    #[serde(default, with = "serde_opt_str", skip_serializing_if = "Option::is_none")]
    pub max_latency: Option<Duration>,
}

impl HealthEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expected_status: None,
            max_latency: None,
        }
    }

    /// Substitute the `{color}` placeholder.
    pub fn resolve_color(&self, color: Option<&str>) -> Self {
        match color {
            Some(color) if self.url.contains("{color}") => Self {
                url: self.url.replace("{color}", color),
                ..self.clone()
            },
            _ => self.clone(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("invalid environment name {0:?}: use lowercase letters, digits, '-' (max 63)")]
    InvalidEnvironment(String),
    #[error("unknown strategy: {0} (expected rolling, blue-green, canary, gitops-sync)")]
    UnknownStrategy(String),
    #[error("replica count must be at least 1")]
    ZeroReplicas,
    #[error("invalid workload name {0:?}")]
    InvalidWorkload(String),
}

/// Immutable input to a promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub environment: String,
    /// Workload (deployment/service) name; defaults to the image name.
    pub workload: String,
    pub image: ImageRef,
    pub strategy: StrategyKind,
    pub replicas: u32,
    #[serde(default)]
    pub health: Vec<HealthEndpoint>,
}

impl DeploymentRequest {
    pub fn new(
        environment: &str,
        image: ImageRef,
        strategy: StrategyKind,
        replicas: u32,
    ) -> Result<Self, RequestError> {
        if !is_valid_name(environment) {
            return Err(RequestError::InvalidEnvironment(environment.into()));
        }
        if replicas == 0 {
            return Err(RequestError::ZeroReplicas);
        }
        Ok(Self {
            environment: environment.to_string(),
            workload: image.name().to_string(),
            image,
            strategy,
            replicas,
            health: Vec::new(),
        })
    }

    pub fn with_workload(mut self, workload: &str) -> Result<Self, RequestError> {
        if !is_valid_name(workload) {
            return Err(RequestError::InvalidWorkload(workload.into()));
        }
        self.workload = workload.to_string();
        Ok(self)
    }

    pub fn with_health(mut self, endpoints: Vec<HealthEndpoint>) -> Self {
        self.health = endpoints;
        self
    }
}

/// DNS-label style: what kubectl and compose both accept as a name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}
