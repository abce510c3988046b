//! `shipgate status` and `shipgate history`.

use serde::Serialize;

use shipgate_rollout::IdleColor;
use shipgate_state::{DeploymentLock, LockState, RevisionRecord, epoch_secs};

use super::{Context, ago, describe, print_json, within};
use crate::OutputFormat;
use crate::exit::Exit;

#[derive(Debug, Serialize)]
struct StatusView {
    environment: String,
    current: Option<RevisionRecord>,
    previous: Option<RevisionRecord>,
    /// Blue-green color still running for instant re-flip.
    idle: Option<IdleColor>,
    lock: Option<DeploymentLock>,
}

pub fn status(ctx: &Context, environment: Option<String>, output: OutputFormat) -> anyhow::Result<Exit> {
    let environment = ctx.environment(environment)?;
    let store = ctx.open_store(&environment)?;
    let current = store.current(&environment)?;
    let workload = ctx.config.environment(&environment).workload;
    let idle = current.as_ref().and_then(|record| {
        IdleColor::of(record, workload.as_deref().unwrap_or(record.image.name()))
    });
    let view = StatusView {
        current,
        previous: store.previous(&environment)?,
        idle,
        lock: store.get_lock(&environment)?,
        environment,
    };

    match output {
        OutputFormat::Json => print_json(&view)?,
        OutputFormat::Text => {
            println!("environment: {}", view.environment);
            println!("current:     {}", revision_line(view.current.as_ref()));
            println!("previous:    {}", revision_line(view.previous.as_ref()));
            if let Some(idle) = &view.idle {
                println!("idle:        {}", idle_line(idle, epoch_secs()));
            }
            println!("lock:        {}", lock_line(view.lock.as_ref()));
        }
    }
    Ok(Exit::Success)
}

pub fn history(
    ctx: &Context,
    environment: Option<String>,
    limit: usize,
    output: OutputFormat,
) -> anyhow::Result<Exit> {
    let environment = ctx.environment(environment)?;
    let store = ctx.open_store(&environment)?;
    let records = store.history(&environment, limit)?;

    match output {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Text if records.is_empty() => println!("no revisions in {environment}"),
        OutputFormat::Text => {
            for record in &records {
                let mut line = format!("{}  {}", describe(record), ago(record.finished_at));
                if let Some(reason) = &record.reason {
                    line.push_str(&format!("  {reason}"));
                }
                println!("{line}");
            }
        }
    }
    Ok(Exit::Success)
}

fn revision_line(record: Option<&RevisionRecord>) -> String {
    match record {
        Some(r) => format!("{}  {}", describe(r), ago(r.finished_at)),
        None => "none".to_string(),
    }
}

fn idle_line(idle: &IdleColor, now: u64) -> String {
    match idle.retire_after {
        Some(until) if idle.grace_open(now) => format!(
            "{} ({}) kept for re-flip; retire {}",
            idle.workload,
            idle.color,
            within(until)
        ),
        _ => format!(
            "{} ({}) past its grace period; `shipgate retire` scales it down",
            idle.workload, idle.color
        ),
    }
}

fn lock_line(lock: Option<&DeploymentLock>) -> String {
    let Some(lock) = lock else {
        return "free".to_string();
    };
    match lock.state {
        LockState::ManualIntervention => format!(
            "MANUAL INTERVENTION (owner {}, {}): {}",
            lock.owner,
            ago(lock.heartbeat_at),
            lock.reason.as_deref().unwrap_or("rollback failed")
        ),
        LockState::Held if lock.is_stale(epoch_secs()) => format!(
            "stale, held by {} (last heartbeat {}); the next promotion reclaims it",
            lock.owner,
            ago(lock.heartbeat_at)
        ),
        LockState::Held => format!(
            "held by {} since {} (last heartbeat {})",
            lock.owner,
            ago(lock.acquired_at),
            ago(lock.heartbeat_at)
        ),
    }
}
