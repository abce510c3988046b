//! shipgate.toml configuration parser.
//!
//! Precedence, lowest to highest: built-in defaults, the config file,
//! `SHIPGATE_*` environment variables, then CLI flags (applied by the CLI).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::duration::{parse_duration, serde_opt_str, serde_str};
use crate::types::{HealthEndpoint, StrategyKind};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "shipgate.toml";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: String, value: String },
    #[error("{0} must be at least 1")]
    ZeroThreshold(&'static str),
    #[error("canary weights must be 1..=100 (initial={initial}, step={step})")]
    CanaryWeights { initial: u8, step: u8 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipgateConfig {
    pub defaults: DefaultsConfig,
    pub gate: GateConfig,
    pub lock: LockConfig,
    pub timeouts: TimeoutsConfig,
    pub canary: CanaryConfig,
    pub blue_green: BlueGreenConfig,
    pub platform: PlatformConfig,
    pub gitops: GitopsConfig,
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Environment used when the CLI is not given one.
    pub environment: Option<String>,
    pub strategy: StrategyKind,
    pub replicas: u32,
    pub data_dir: PathBuf,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            environment: None,
            strategy: StrategyKind::Rolling,
            replicas: 1,
            data_dir: PathBuf::from(".shipgate"),
        }
    }
}

/// Health gate thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Consecutive all-healthy polls required to pass.
    pub success_threshold: u32,
    /// Consecutive unhealthy polls that fail the gate.
    pub failure_threshold: u32,
    /// Overall bound on one gate stage.
    #[serde(with = "serde_str")]
    pub window: Duration,
    /// Fixed poll interval.
    #[serde(with = "serde_str")]
    pub interval: Duration,
    #[serde(with = "serde_str")]
    pub probe_timeout: Duration,
    /// Latency ceiling for endpoints without their own `max_latency`.
    #[serde(with = "serde_str")]
    pub latency_ceiling: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            success_threshold: 3,
            failure_threshold: 3,
            window: Duration::from_secs(5 * 60),
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            latency_ceiling: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    #[serde(with = "serde_str")]
    pub ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyTimeouts {
    #[serde(with = "serde_opt_str", skip_serializing_if = "Option::is_none")]
    pub apply: Option<Duration>,
    #[serde(with = "serde_opt_str", skip_serializing_if = "Option::is_none")]
    pub revert: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    #[serde(with = "serde_str")]
    pub apply: Duration,
    #[serde(with = "serde_str")]
    pub revert: Duration,
    pub rolling: StrategyTimeouts,
    pub blue_green: StrategyTimeouts,
    pub canary: StrategyTimeouts,
    pub gitops_sync: StrategyTimeouts,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            apply: Duration::from_secs(10 * 60),
            revert: Duration::from_secs(3 * 60),
            rolling: StrategyTimeouts::default(),
            blue_green: StrategyTimeouts::default(),
            canary: StrategyTimeouts::default(),
            gitops_sync: StrategyTimeouts::default(),
        }
    }
}

impl TimeoutsConfig {
    /// (apply, revert) timeouts for a strategy, falling back to the globals.
    pub fn for_strategy(&self, kind: StrategyKind) -> (Duration, Duration) {
        let specific = match kind {
            StrategyKind::Rolling => &self.rolling,
            StrategyKind::BlueGreen => &self.blue_green,
            StrategyKind::Canary => &self.canary,
            StrategyKind::GitopsSync => &self.gitops_sync,
        };
        (
            specific.apply.unwrap_or(self.apply),
            specific.revert.unwrap_or(self.revert),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    /// Traffic percentage routed to the canary right after apply.
    pub initial_weight: u8,
    /// Percentage added after each passing gate stage.
    pub step: u8,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            initial_weight: 10,
            step: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueGreenConfig {
    /// How long the old color stays up for an instant re-flip.
    #[serde(with = "serde_str")]
    pub grace_period: Duration,
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    #[default]
    Kubectl,
    Compose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub kind: PlatformKind,
    /// Kubernetes namespace; defaults to the environment name.
    pub namespace: Option<String>,
    /// kubectl context.
    pub context: Option<String>,
    /// Directory holding the compose project.
    pub compose_dir: PathBuf,
    /// File the compose router writes upstream selection into.
    pub route_file: Option<PathBuf>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            kind: PlatformKind::Kubectl,
            namespace: None,
            context: None,
            compose_dir: PathBuf::from("."),
            route_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GitopsConfig {
    /// argocd API server (`--server`).
    pub server: Option<String>,
    pub grpc_web: bool,
    /// Image parameter name set on the Argo application.
    pub image_parameter: Option<String>,
}

/// Per-environment overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub workload: Option<String>,
    pub strategy: Option<StrategyKind>,
    pub replicas: Option<u32>,
    pub namespace: Option<String>,
    /// Argo application name; defaults to `{workload}-{environment}`.
    pub gitops_app: Option<String>,
    pub health: Vec<HealthEndpoint>,
}

impl ShipgateConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ShipgateConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from an explicit path, or `./shipgate.toml` if present, then
    /// apply `SHIPGATE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        debug!(?path, "configuration loaded");
        Ok(config)
    }

    /// Apply `SHIPGATE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(env) = lookup("SHIPGATE_ENV") {
            self.defaults.environment = Some(env);
        }
        if let Some(raw) = lookup("SHIPGATE_STRATEGY") {
            self.defaults.strategy = raw.parse().map_err(|_| invalid("SHIPGATE_STRATEGY", &raw))?;
        }
        if let Some(raw) = lookup("SHIPGATE_DATA_DIR") {
            self.defaults.data_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("SHIPGATE_GATE_SUCCESSES") {
            self.gate.success_threshold = parse_count("SHIPGATE_GATE_SUCCESSES", &raw)?;
        }
        if let Some(raw) = lookup("SHIPGATE_GATE_FAILURES") {
            self.gate.failure_threshold = parse_count("SHIPGATE_GATE_FAILURES", &raw)?;
        }
        if let Some(raw) = lookup("SHIPGATE_GATE_WINDOW") {
            self.gate.window = parse_duration(&raw).ok_or_else(|| invalid("SHIPGATE_GATE_WINDOW", &raw))?;
        }
        if let Some(raw) = lookup("SHIPGATE_GATE_INTERVAL") {
            self.gate.interval =
                parse_duration(&raw).ok_or_else(|| invalid("SHIPGATE_GATE_INTERVAL", &raw))?;
        }
        if let Some(raw) = lookup("SHIPGATE_LOCK_TTL") {
            self.lock.ttl = parse_duration(&raw).ok_or_else(|| invalid("SHIPGATE_LOCK_TTL", &raw))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gate.success_threshold == 0 {
            return Err(ConfigError::ZeroThreshold("gate.success_threshold"));
        }
        if self.gate.failure_threshold == 0 {
            return Err(ConfigError::ZeroThreshold("gate.failure_threshold"));
        }
        let CanaryConfig { initial_weight, step } = self.canary;
        if !(1..=100).contains(&initial_weight) || !(1..=100).contains(&step) {
            return Err(ConfigError::CanaryWeights {
                initial: initial_weight,
                step,
            });
        }
        Ok(())
    }

    /// Overrides for one environment (empty if not configured).
    pub fn environment(&self, name: &str) -> EnvironmentConfig {
        self.environments.get(name).cloned().unwrap_or_default()
    }
}

fn invalid(var: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
    }
}

fn parse_count(var: &str, raw: &str) -> Result<u32, ConfigError> {
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| invalid(var, raw))
}
