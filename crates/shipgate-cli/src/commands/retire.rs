//! `shipgate retire`: scale down the blue-green color left idle by the last
//! switch.

use super::Context;
use crate::exit::Exit;

pub async fn retire(ctx: &Context, environment: Option<String>, force: bool) -> anyhow::Result<Exit> {
    let environment = ctx.environment(environment)?;
    let env = ctx.config.environment(&environment);
    let controller = super::deploy::controller(ctx, &environment)?;

    match controller
        .retire_idle(&environment, env.workload.as_deref(), force)
        .await?
    {
        Some(idle) => println!("retired {} ({}) in {environment}", idle.workload, idle.color),
        None => println!("nothing to retire in {environment}"),
    }
    Ok(Exit::Success)
}
