use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

mod commands;
mod exit;
mod logging;

use exit::{Exit, classify};

#[derive(Parser)]
#[command(
    name = "shipgate",
    about = "shipgate: gated deployment promotion with automatic rollback",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to shipgate.toml (default: $SHIPGATE_CONFIG, then ./shipgate.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding per-environment state databases
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Log format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Promote an image into an environment.
    ///
    /// Exits 0 when promoted, 1 when it failed and was rolled back, 2 when
    /// the rollback failed, 3 when the environment is locked.
    Deploy {
        /// Target environment (default: $SHIPGATE_ENV or [defaults].environment)
        environment: Option<String>,
        /// Image reference, e.g. registry.local/api:v2
        #[arg(short, long)]
        image: String,
        /// rolling, blue-green, canary or gitops-sync
        #[arg(short, long)]
        strategy: Option<String>,
        #[arg(short, long)]
        replicas: Option<u32>,
        /// Workload name (default: image name)
        #[arg(short, long)]
        workload: Option<String>,
        /// Health endpoint URL; repeatable. Replaces configured endpoints.
        #[arg(long = "health")]
        health: Vec<String>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
    /// Promote the previous revision again, gated like a deploy.
    Rollback {
        environment: Option<String>,
        /// Strategy override (default: the current revision's strategy)
        #[arg(short, long)]
        strategy: Option<String>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
    /// Show the current and previous revision and the lock.
    Status {
        environment: Option<String>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
    /// List revisions, newest first.
    History {
        environment: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
    /// Scale down the idle blue-green color once its grace period is over.
    Retire {
        environment: Option<String>,
        /// Retire even inside the grace period.
        #[arg(long)]
        force: bool,
    },
    /// Clear an environment lock, including one held for manual intervention.
    Unlock {
        environment: Option<String>,
        /// Required: confirms the environment has been inspected.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(cli.log_format);

    let exit = match dispatch(cli).await {
        Ok(exit) => exit,
        Err(e) => {
            eprintln!("error: {e:#}");
            classify(&e)
        }
    };
    debug!(code = exit as u8, "exiting");
    exit.into()
}

async fn dispatch(cli: Cli) -> anyhow::Result<Exit> {
    let ctx = commands::Context::load(cli.config, cli.data_dir)?;
    match cli.command {
        Commands::Deploy {
            environment,
            image,
            strategy,
            replicas,
            workload,
            health,
            output,
        } => {
            let args = commands::deploy::DeployArgs {
                image,
                strategy,
                replicas,
                workload,
                health,
            };
            commands::deploy::deploy(&ctx, environment, args, output).await
        }
        Commands::Rollback {
            environment,
            strategy,
            output,
        } => commands::deploy::rollback(&ctx, environment, strategy, output).await,
        Commands::Status {
            environment,
            output,
        } => commands::status::status(&ctx, environment, output),
        Commands::History {
            environment,
            limit,
            output,
        } => commands::status::history(&ctx, environment, limit, output),
        Commands::Retire { environment, force } => {
            commands::retire::retire(&ctx, environment, force).await
        }
        Commands::Unlock { environment, force } => {
            commands::unlock::unlock(&ctx, environment, force)
        }
    }
}
