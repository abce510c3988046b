//! Error types for the shipgate state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    /// Another process has the environment's database open.
    #[error("state store busy: {0} is open in another process")]
    Busy(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("environment {environment} is locked by {owner} since {since}{}", manual_suffix(.manual))]
    LockHeld {
        environment: String,
        owner: String,
        since: u64,
        manual: bool,
    },

    #[error("lock for {environment} is not held by {owner}")]
    LockNotOwned { environment: String, owner: String },

    #[error("revision {revision} already exists for {environment}")]
    RevisionExists { environment: String, revision: u64 },
}

fn manual_suffix(manual: &bool) -> &'static str {
    if *manual {
        " (manual intervention required)"
    } else {
        ""
    }
}
