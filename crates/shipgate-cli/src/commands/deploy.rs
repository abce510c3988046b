//! `shipgate deploy` and `shipgate rollback`.

use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::watch;
use tracing::{info, warn};

use shipgate_core::{DeploymentRequest, HealthEndpoint, ImageRef, StrategyKind};
use shipgate_health::{HttpProber, Prober};
use shipgate_platform::{CommandRunner, ProcessRunner};
use shipgate_rollout::{ControllerSettings, PromotionController, PromotionError};
use shipgate_state::{RevisionRecord, Trigger};

use super::{Context, describe, print_json};
use crate::OutputFormat;
use crate::exit::Exit;

pub struct DeployArgs {
    pub image: String,
    pub strategy: Option<String>,
    pub replicas: Option<u32>,
    pub workload: Option<String>,
    pub health: Vec<String>,
}

pub async fn deploy(
    ctx: &Context,
    environment: Option<String>,
    args: DeployArgs,
    output: OutputFormat,
) -> anyhow::Result<Exit> {
    let environment = ctx.environment(environment)?;
    let env = ctx.config.environment(&environment);

    let image = ImageRef::parse(&args.image)
        .with_context(|| format!("invalid image reference {:?}", args.image))?;
    let strategy = match args.strategy {
        Some(raw) => raw.parse::<StrategyKind>()?,
        None => env.strategy.unwrap_or(ctx.config.defaults.strategy),
    };
    let replicas = args
        .replicas
        .or(env.replicas)
        .unwrap_or(ctx.config.defaults.replicas);
    let health = if args.health.is_empty() {
        env.health.clone()
    } else {
        args.health.into_iter().map(HealthEndpoint::new).collect()
    };

    let mut request =
        DeploymentRequest::new(&environment, image, strategy, replicas)?.with_health(health);
    if let Some(workload) = args.workload.as_deref().or(env.workload.as_deref()) {
        request = request.with_workload(workload)?;
    }
    if request.health.is_empty() && strategy != StrategyKind::GitopsSync {
        warn!(%environment, "no health endpoints configured; the gate will not probe");
    }

    let controller = controller(ctx, &environment)?;
    promote(&controller, request, Trigger::Deploy, output).await
}

pub async fn rollback(
    ctx: &Context,
    environment: Option<String>,
    strategy: Option<String>,
    output: OutputFormat,
) -> anyhow::Result<Exit> {
    let environment = ctx.environment(environment)?;
    let env = ctx.config.environment(&environment);
    let strategy = strategy.map(|raw| raw.parse::<StrategyKind>()).transpose()?;

    let controller = controller(ctx, &environment)?;
    let (current, target) = controller.rollback_target(&environment)?;
    let strategy = strategy.unwrap_or(current.strategy);
    let replicas = env.replicas.unwrap_or(ctx.config.defaults.replicas);

    let mut request = DeploymentRequest::new(&environment, target.image.clone(), strategy, replicas)?
        .with_health(env.health.clone());
    if let Some(workload) = env.workload.as_deref() {
        request = request.with_workload(workload)?;
    }
    info!(
        %environment,
        from = %current.image,
        to = %target.image,
        target_revision = target.revision,
        %strategy,
        "operator rollback"
    );
    promote(&controller, request, Trigger::Rollback, output).await
}

pub(crate) fn controller(ctx: &Context, environment: &str) -> anyhow::Result<PromotionController> {
    let store = ctx.open_store(environment)?;
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
    let collaborators = shipgate_platform::collaborators(&ctx.config, environment, runner);
    let prober: Arc<dyn Prober> = Arc::new(HttpProber::new(ctx.config.gate.latency_ceiling));
    Ok(PromotionController::new(
        store,
        collaborators,
        prober,
        ControllerSettings::from_config(&ctx.config),
    ))
}

/// Run a promotion with Ctrl-C wired to the abort signal.
async fn promote(
    controller: &PromotionController,
    request: DeploymentRequest,
    trigger: Trigger,
    output: OutputFormat,
) -> anyhow::Result<Exit> {
    let environment = request.environment.clone();
    let (abort_tx, abort_rx) = watch::channel(false);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; aborting promotion");
            let _ = abort_tx.send(true);
        }
    });

    let result = controller.promote(request, trigger, abort_rx).await;
    interrupt.abort();

    match result {
        Ok(report) => {
            if let Some(previous) = &report.reclaimed {
                eprintln!("note: reclaimed a stale lock held by {}", previous.owner);
            }
            print_record(&report.record, output)?;
            Ok(if report.succeeded() {
                Exit::Success
            } else {
                Exit::RolledBack
            })
        }
        Err(PromotionError::RollbackFailed {
            record,
            phase,
            reason,
        }) => {
            print_record(&record, output)?;
            eprintln!(
                "rollback failed after {phase} failure: {reason}\n\
                 {environment} is locked for manual intervention; inspect it, then run \
                 `shipgate unlock {environment} --force`"
            );
            Ok(Exit::RollbackFailed)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_record(record: &RevisionRecord, output: OutputFormat) -> anyhow::Result<()> {
    match output {
        OutputFormat::Json => print_json(record)?,
        OutputFormat::Text => {
            println!("{}: {}", record.environment, describe(record));
            if let Some(reason) = &record.reason {
                println!("  reason:   {reason}");
            }
            if let Some(restored) = &record.restored {
                println!("  restored: #{} {}", restored.revision, restored.image);
            }
            if let Some(color) = record.switch.active_color {
                println!("  active:   {color}");
            }
            if let Some(weight) = record.switch.canary_weight {
                println!("  canary:   {weight}%");
            }
            if let Some(gate) = &record.gate {
                println!(
                    "  gate:     {} ({} polls over {} stage(s))",
                    if gate.passed { "passed" } else { "failed" },
                    gate.polls,
                    gate.stages
                );
            }
        }
    }
    Ok(())
}
