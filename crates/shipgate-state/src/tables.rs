//! redb table definitions for the shipgate state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Append-only revision history keyed by `{environment}:{revision:020}`.
/// Zero-padding keeps lexical key order equal to revision order.
pub const REVISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("revisions");

/// Deployment locks keyed by `{environment}`.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
