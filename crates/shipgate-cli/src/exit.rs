//! Process exit codes.

use std::process::ExitCode;

use shipgate_rollout::PromotionError;
use shipgate_state::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Promotion or rollback succeeded.
    Success = 0,
    /// Promotion failed; the previous revision was restored.
    RolledBack = 1,
    /// The rollback itself failed; the lock is held for an operator.
    RollbackFailed = 2,
    /// Not started: another promotion holds the environment.
    Locked = 3,
    /// Configuration, usage or state error.
    Usage = 4,
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        ExitCode::from(exit as u8)
    }
}

/// Walk the error chain for something more specific than a usage error.
pub fn classify(err: &anyhow::Error) -> Exit {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<PromotionError>() {
            return match e {
                PromotionError::LockHeld { .. } => Exit::Locked,
                PromotionError::RollbackFailed { .. } => Exit::RollbackFailed,
                _ => Exit::Usage,
            };
        }
        if let Some(e) = cause.downcast_ref::<StateError>() {
            return match e {
                StateError::Busy(_) | StateError::LockHeld { .. } => Exit::Locked,
                _ => Exit::Usage,
            };
        }
    }
    Exit::Usage
}
