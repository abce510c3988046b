//! Subcommand implementations and the context they share.

pub mod deploy;
pub mod retire;
pub mod status;
pub mod unlock;

use std::path::PathBuf;

use anyhow::{Context as _, bail};
use serde::Serialize;

use shipgate_core::{ShipgateConfig, is_valid_name};
use shipgate_state::{RevisionRecord, StateStore, epoch_secs};

/// Loaded configuration plus resolved paths.
pub struct Context {
    pub config: ShipgateConfig,
    pub data_dir: PathBuf,
}

impl Context {
    /// `--config`, then `$SHIPGATE_CONFIG`, then `./shipgate.toml`.
    /// `--data-dir` beats `$SHIPGATE_DATA_DIR` beats `[defaults].data_dir`.
    pub fn load(config: Option<PathBuf>, data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = config.or_else(|| std::env::var_os("SHIPGATE_CONFIG").map(PathBuf::from));
        let config = ShipgateConfig::load(path.as_deref()).context("loading configuration")?;
        let data_dir = data_dir.unwrap_or_else(|| config.defaults.data_dir.clone());
        Ok(Self { config, data_dir })
    }

    /// The environment argument, or the configured default.
    pub fn environment(&self, arg: Option<String>) -> anyhow::Result<String> {
        let Some(environment) = arg.or_else(|| self.config.defaults.environment.clone()) else {
            bail!("no environment given; pass one or set SHIPGATE_ENV");
        };
        if !is_valid_name(&environment) {
            bail!("invalid environment name {environment:?}");
        }
        Ok(environment)
    }

    pub fn store_path(&self, environment: &str) -> PathBuf {
        self.data_dir.join(format!("{environment}.redb"))
    }

    /// Open the environment's database. A concurrent promotion holding it
    /// surfaces as `StateError::Busy`.
    pub fn open_store(&self, environment: &str) -> anyhow::Result<StateStore> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating data dir {}", self.data_dir.display()))?;
        let path = self.store_path(environment);
        StateStore::open(&path).with_context(|| format!("opening state for {environment}"))
    }
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One-line summary of a record.
pub fn describe(record: &RevisionRecord) -> String {
    let mut line = format!(
        "#{} {} {} {:?}",
        record.revision, record.image, record.strategy, record.outcome
    );
    if let Some(phase) = record.failed_phase {
        line.push_str(&format!(" (failed in {phase})"));
    }
    line
}

/// Human readable "N minutes ago".
pub fn ago(epoch: u64) -> String {
    format!("{} ago", span(epoch_secs().saturating_sub(epoch)))
}

/// Human readable "in N minutes".
pub fn within(epoch: u64) -> String {
    format!("in {}", span(epoch.saturating_sub(epoch_secs())))
}

fn span(secs: u64) -> String {
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}
