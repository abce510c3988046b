//! shipgate-state: revision store and deployment lock for shipgate.
//!
//! Backed by [redb](https://docs.rs/redb). Each environment gets its own
//! database file, so the on-disk layout doubles as an OS-level guard: a
//! second process opening the same environment fails with
//! [`StateError::Busy`].
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Revision keys are `{env}:{revision:020}` so a range scan returns one
//! environment's history in revision order. Lock keys are the bare
//! environment name.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared with the lock heartbeat task.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
