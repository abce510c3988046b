use anyhow::bail;
use tracing::warn;

use super::Context;
use crate::exit::Exit;

/// `shipgate unlock <env> --force`
pub fn unlock(ctx: &Context, environment: Option<String>, force: bool) -> anyhow::Result<Exit> {
    let environment = ctx.environment(environment)?;
    if !force {
        bail!("refusing to clear the lock on {environment} without --force");
    }
    let store = ctx.open_store(&environment)?;
    match store.force_release(&environment)? {
        Some(lock) => {
            warn!(%environment, owner = %lock.owner, state = ?lock.state, "lock cleared by operator");
            println!(
                "released lock on {environment} held by {} ({:?})",
                lock.owner, lock.state
            );
        }
        None => println!("{environment} is not locked"),
    }
    Ok(Exit::Success)
}
