//! StateStore: redb-backed revision history and deployment locks.
//!
//! Revisions are append-only: the store assigns the next revision number
//! inside the same write transaction that inserts the record, and refuses
//! to overwrite an existing key. Lock acquisition is a compare-and-set in a
//! single write transaction; redb serializes writers, so two acquirers can
//! never both observe the key as free.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => StateError::Busy(path.display().to_string()),
            other => StateError::Open(other.to_string()),
        })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(REVISIONS).map_err(map_err!(Table))?;
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Revisions ──────────────────────────────────────────────────

    /// Append a terminal record, assigning it the next revision number.
    ///
    /// The `revision` field of the input is ignored.
    pub fn append_revision(&self, mut record: RevisionRecord) -> StateResult<RevisionRecord> {
        let (lo, hi) = revision_range(&record.environment);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REVISIONS).map_err(map_err!(Table))?;
            let last = match table
                .range(lo.as_str()..hi.as_str())
                .map_err(map_err!(Read))?
                .next_back()
            {
                Some(entry) => {
                    let (_, value) = entry.map_err(map_err!(Read))?;
                    let last: RevisionRecord =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    last.revision
                }
                None => 0,
            };
            record.revision = last + 1;

            let key = record.table_key();
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            let existed = table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?
                .is_some();
            if existed {
                // Dropping the transaction without commit discards the insert.
                return Err(StateError::RevisionExists {
                    environment: record.environment.clone(),
                    revision: record.revision,
                });
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            environment = %record.environment,
            revision = record.revision,
            outcome = ?record.outcome,
            "revision appended"
        );
        Ok(record)
    }

    /// All records for an environment, oldest first.
    pub fn list_revisions(&self, environment: &str) -> StateResult<Vec<RevisionRecord>> {
        let (lo, hi) = revision_range(environment);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REVISIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(lo.as_str()..hi.as_str()).map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: RevisionRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Most recent records first, at most `limit`.
    pub fn history(&self, environment: &str, limit: usize) -> StateResult<Vec<RevisionRecord>> {
        let mut all = self.list_revisions(environment)?;
        all.reverse();
        all.truncate(limit);
        Ok(all)
    }

    pub fn get_revision(
        &self,
        environment: &str,
        revision: RevisionId,
    ) -> StateResult<Option<RevisionRecord>> {
        let key = revision_key(environment, revision);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REVISIONS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: RevisionRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// The revision currently serving: the latest serving record.
    pub fn current(&self, environment: &str) -> StateResult<Option<RevisionRecord>> {
        Ok(self
            .list_revisions(environment)?
            .into_iter()
            .rev()
            .find(RevisionRecord::is_serving))
    }

    /// Rollback target: the serving record before `current()` that runs a
    /// different image.
    pub fn previous(&self, environment: &str) -> StateResult<Option<RevisionRecord>> {
        let records = self.list_revisions(environment)?;
        let mut serving = records.into_iter().rev().filter(RevisionRecord::is_serving);
        let Some(current) = serving.next() else {
            return Ok(None);
        };
        Ok(serving.find(|r| r.image != current.image))
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Compare-and-set acquisition of the environment lock.
    ///
    /// Succeeds when no lock exists, when `owner` already holds it, or when
    /// the existing lock is stale (reclaimed). Fails with
    /// [`StateError::LockHeld`] otherwise.
    pub fn acquire_lock(
        &self,
        environment: &str,
        owner: &str,
        ttl_secs: u64,
        now: u64,
    ) -> StateResult<AcquireOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let existing: Option<DeploymentLock> = match table
                .get(environment)
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };

            let lock = DeploymentLock {
                environment: environment.to_string(),
                owner: owner.to_string(),
                acquired_at: now,
                heartbeat_at: now,
                ttl_secs,
                state: LockState::Held,
                reason: None,
            };

            outcome = match existing {
                None => AcquireOutcome::Acquired(lock),
                Some(prev) if prev.owner == owner && prev.state == LockState::Held => {
                    AcquireOutcome::Acquired(DeploymentLock {
                        acquired_at: prev.acquired_at,
                        ..lock
                    })
                }
                Some(prev) if prev.is_stale(now) => AcquireOutcome::Reclaimed {
                    lock,
                    previous: prev,
                },
                Some(prev) => {
                    return Err(StateError::LockHeld {
                        environment: environment.to_string(),
                        owner: prev.owner,
                        since: prev.acquired_at,
                        manual: prev.state == LockState::ManualIntervention,
                    });
                }
            };

            let value = serde_json::to_vec(outcome.lock()).map_err(map_err!(Serialize))?;
            table
                .insert(environment, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        match &outcome {
            AcquireOutcome::Acquired(_) => {
                debug!(%environment, %owner, "deployment lock acquired");
            }
            AcquireOutcome::Reclaimed { previous, .. } => {
                warn!(
                    event = "StaleLockReclaimed",
                    %environment,
                    %owner,
                    previous_owner = %previous.owner,
                    last_heartbeat = previous.heartbeat_at,
                    idle_secs = now.saturating_sub(previous.heartbeat_at),
                    "reclaimed stale deployment lock"
                );
            }
        }
        Ok(outcome)
    }

    /// Renew the heartbeat of a lock held by `owner`.
    pub fn heartbeat_lock(&self, environment: &str, owner: &str, now: u64) -> StateResult<()> {
        self.update_owned_lock(environment, owner, |lock| {
            lock.heartbeat_at = now;
        })
    }

    /// Release a held lock. Returns false if there was nothing to release.
    ///
    /// A lock in manual intervention is never released here.
    pub fn release_lock(&self, environment: &str, owner: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let existing: Option<DeploymentLock> = match table
                .get(environment)
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            released = match existing {
                Some(lock) if lock.owner == owner && lock.state == LockState::Held => {
                    table.remove(environment).map_err(map_err!(Write))?;
                    true
                }
                Some(lock) if lock.owner != owner => {
                    return Err(StateError::LockNotOwned {
                        environment: environment.to_string(),
                        owner: owner.to_string(),
                    });
                }
                _ => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if released {
            debug!(%environment, %owner, "deployment lock released");
        }
        Ok(released)
    }

    /// Pin the lock for operator inspection after a failed rollback.
    pub fn mark_lock_manual(
        &self,
        environment: &str,
        owner: &str,
        reason: &str,
        now: u64,
    ) -> StateResult<()> {
        self.update_owned_lock(environment, owner, |lock| {
            lock.state = LockState::ManualIntervention;
            lock.reason = Some(reason.to_string());
            lock.heartbeat_at = now;
        })
    }

    pub fn get_lock(&self, environment: &str) -> StateResult<Option<DeploymentLock>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
        match table.get(environment).map_err(map_err!(Read))? {
            Some(guard) => {
                let lock: DeploymentLock =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(lock))
            }
            None => Ok(None),
        }
    }

    /// Remove any lock, regardless of owner or state. Operator use only.
    pub fn force_release(&self, environment: &str) -> StateResult<Option<DeploymentLock>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed: Option<DeploymentLock>;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            removed = match table.remove(environment).map_err(map_err!(Write))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if let Some(lock) = &removed {
            info!(%environment, owner = %lock.owner, state = ?lock.state, "deployment lock force-released");
        }
        Ok(removed)
    }

    fn update_owned_lock<F>(&self, environment: &str, owner: &str, update: F) -> StateResult<()>
    where
        F: FnOnce(&mut DeploymentLock),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let existing: Option<DeploymentLock> = match table
                .get(environment)
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let mut lock = match existing {
                Some(lock) if lock.owner == owner => lock,
                _ => {
                    return Err(StateError::LockNotOwned {
                        environment: environment.to_string(),
                        owner: owner.to_string(),
                    });
                }
            };
            update(&mut lock);
            let value = serde_json::to_vec(&lock).map_err(map_err!(Serialize))?;
            table
                .insert(environment, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipgate_core::{ImageRef, StrategyKind};

    const TTL: u64 = 30 * 60;

    fn attempt(env: &str, image: &str, outcome: Outcome) -> RevisionRecord {
        RevisionRecord {
            environment: env.to_string(),
            revision: 0,
            image: ImageRef::parse(image).unwrap(),
            strategy: StrategyKind::Rolling,
            trigger: Trigger::Deploy,
            outcome,
            failed_phase: match outcome {
                Outcome::Succeeded => None,
                Outcome::RolledBack => Some(FailurePhase::HealthGate),
                Outcome::Failed => Some(FailurePhase::Rollback),
            },
            reason: None,
            restored: None,
            switch: SwitchSnapshot::default(),
            gate: None,
            owner: "test".to_string(),
            started_at: 1000,
            finished_at: 1060,
        }
    }

    // ── Revisions ──────────────────────────────────────────────────

    #[test]
    fn append_assigns_monotonic_revisions_per_environment() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.append_revision(attempt("prod", "api:v1", Outcome::Succeeded)).unwrap();
        let b = store.append_revision(attempt("prod", "api:v2", Outcome::Succeeded)).unwrap();
        let c = store.append_revision(attempt("staging", "api:v2", Outcome::Succeeded)).unwrap();

        assert_eq!(a.revision, 1);
        assert_eq!(b.revision, 2);
        assert_eq!(c.revision, 1);
        assert_eq!(store.list_revisions("prod").unwrap().len(), 2);
        assert_eq!(store.get_revision("prod", 2).unwrap(), Some(b));
    }

    #[test]
    fn revisions_order_past_nine() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 1..=12 {
            store
                .append_revision(attempt("prod", &format!("api:v{i}"), Outcome::Succeeded))
                .unwrap();
        }
        let ids: Vec<_> = store.list_revisions("prod").unwrap().iter().map(|r| r.revision).collect();
        assert_eq!(ids, (1..=12).collect::<Vec<_>>());
        assert_eq!(store.current("prod").unwrap().unwrap().image.tag(), Some("v12"));
    }

    #[test]
    fn current_skips_rolled_back_attempts() {
        let store = StateStore::open_in_memory().unwrap();
        store.append_revision(attempt("prod", "api:v1", Outcome::Succeeded)).unwrap();
        store.append_revision(attempt("prod", "api:v2", Outcome::Succeeded)).unwrap();
        store.append_revision(attempt("prod", "api:v3", Outcome::RolledBack)).unwrap();

        let current = store.current("prod").unwrap().unwrap();
        assert_eq!(current.image.tag(), Some("v2"));
        assert_eq!(current.revision, 2);

        let previous = store.previous("prod").unwrap().unwrap();
        assert_eq!(previous.image.tag(), Some("v1"));

        // History is kept intact.
        assert_eq!(store.list_revisions("prod").unwrap().len(), 3);
    }

    #[test]
    fn operator_rollback_becomes_current() {
        let store = StateStore::open_in_memory().unwrap();
        store.append_revision(attempt("prod", "api:v1", Outcome::Succeeded)).unwrap();
        store.append_revision(attempt("prod", "api:v2", Outcome::Succeeded)).unwrap();

        let mut rollback = attempt("prod", "api:v1", Outcome::RolledBack);
        rollback.trigger = Trigger::Rollback;
        rollback.failed_phase = None;
        let rollback = store.append_revision(rollback).unwrap();

        let current = store.current("prod").unwrap().unwrap();
        assert_eq!(current.revision, rollback.revision);
        assert_eq!(current.image.tag(), Some("v1"));
        assert_eq!(store.previous("prod").unwrap().unwrap().image.tag(), Some("v2"));
    }

    #[test]
    fn previous_skips_same_image_redeploys() {
        let store = StateStore::open_in_memory().unwrap();
        store.append_revision(attempt("prod", "api:v1", Outcome::Succeeded)).unwrap();
        store.append_revision(attempt("prod", "api:v2", Outcome::Succeeded)).unwrap();
        store.append_revision(attempt("prod", "api:v2", Outcome::Succeeded)).unwrap();

        assert_eq!(store.previous("prod").unwrap().unwrap().image.tag(), Some("v1"));
    }

    #[test]
    fn empty_environment_has_no_current() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.current("prod").unwrap().is_none());
        assert!(store.previous("prod").unwrap().is_none());
        assert!(store.history("prod", 10).unwrap().is_empty());

        store.append_revision(attempt("prod", "api:v1", Outcome::Failed)).unwrap();
        assert!(store.current("prod").unwrap().is_none());
    }

    #[test]
    fn history_is_newest_first_and_limited() {
        let store = StateStore::open_in_memory().unwrap();
        for tag in ["v1", "v2", "v3"] {
            store
                .append_revision(attempt("prod", &format!("api:{tag}"), Outcome::Succeeded))
                .unwrap();
        }
        let history = store.history("prod", 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].revision, 3);
        assert_eq!(history[1].revision, 2);
    }

    // ── Locks ──────────────────────────────────────────────────────

    #[test]
    fn lock_excludes_second_owner() {
        let store = StateStore::open_in_memory().unwrap();
        let outcome = store.acquire_lock("prod", "ctl-a", TTL, 1000).unwrap();
        assert!(matches!(outcome, AcquireOutcome::Acquired(_)));

        let err = store.acquire_lock("prod", "ctl-b", TTL, 1010).unwrap_err();
        match err {
            StateError::LockHeld { owner, since, manual, .. } => {
                assert_eq!(owner, "ctl-a");
                assert_eq!(since, 1000);
                assert!(!manual);
            }
            other => panic!("expected LockHeld, got {other:?}"),
        }

        // Other environments are independent.
        store.acquire_lock("staging", "ctl-b", TTL, 1010).unwrap();
    }

    #[test]
    fn lock_reacquire_by_same_owner_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        store.acquire_lock("prod", "ctl-a", TTL, 1000).unwrap();
        let again = store.acquire_lock("prod", "ctl-a", TTL, 1100).unwrap();
        assert_eq!(again.lock().acquired_at, 1000);
        assert_eq!(again.lock().heartbeat_at, 1100);
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let store = StateStore::open_in_memory().unwrap();
        let now = 100_000;
        // Acquired 40 minutes ago with a 30 minute TTL and no heartbeat since.
        store.acquire_lock("prod", "crashed", TTL, now - 40 * 60).unwrap();

        let outcome = store.acquire_lock("prod", "fresh", TTL, now).unwrap();
        match outcome {
            AcquireOutcome::Reclaimed { lock, previous } => {
                assert_eq!(lock.owner, "fresh");
                assert_eq!(previous.owner, "crashed");
            }
            other => panic!("expected Reclaimed, got {other:?}"),
        }
        assert_eq!(store.get_lock("prod").unwrap().unwrap().owner, "fresh");
    }

    #[test]
    fn heartbeat_keeps_lock_fresh() {
        let store = StateStore::open_in_memory().unwrap();
        store.acquire_lock("prod", "ctl-a", TTL, 1000).unwrap();
        store.heartbeat_lock("prod", "ctl-a", 1000 + TTL - 10).unwrap();

        assert!(store.acquire_lock("prod", "ctl-b", TTL, 1000 + TTL + 5).is_err());
        assert!(matches!(
            store.heartbeat_lock("prod", "ctl-b", 1000),
            Err(StateError::LockNotOwned { .. })
        ));
    }

    #[test]
    fn release_frees_lock_for_next_owner() {
        let store = StateStore::open_in_memory().unwrap();
        store.acquire_lock("prod", "ctl-a", TTL, 1000).unwrap();
        assert!(matches!(
            store.release_lock("prod", "ctl-b"),
            Err(StateError::LockNotOwned { .. })
        ));
        assert!(store.release_lock("prod", "ctl-a").unwrap());
        assert!(!store.release_lock("prod", "ctl-a").unwrap());
        assert!(store.get_lock("prod").unwrap().is_none());
        store.acquire_lock("prod", "ctl-b", TTL, 1001).unwrap();
    }

    #[test]
    fn manual_intervention_lock_is_never_reclaimed() {
        let store = StateStore::open_in_memory().unwrap();
        store.acquire_lock("prod", "ctl-a", TTL, 1000).unwrap();
        store
            .mark_lock_manual("prod", "ctl-a", "revert failed", 1050)
            .unwrap();

        // Even the owner cannot release it, and it never goes stale.
        assert!(!store.release_lock("prod", "ctl-a").unwrap());
        let err = store.acquire_lock("prod", "ctl-b", TTL, 1_000_000).unwrap_err();
        assert!(matches!(err, StateError::LockHeld { manual: true, .. }));

        let removed = store.force_release("prod").unwrap().unwrap();
        assert_eq!(removed.state, LockState::ManualIntervention);
        assert_eq!(removed.reason.as_deref(), Some("revert failed"));
        store.acquire_lock("prod", "ctl-b", TTL, 1_000_001).unwrap();
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("prod.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.append_revision(attempt("prod", "api:v1", Outcome::Succeeded)).unwrap();
            store.acquire_lock("prod", "ctl-a", TTL, 1000).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.current("prod").unwrap().unwrap().image.tag(), Some("v1"));
        assert_eq!(store.get_lock("prod").unwrap().unwrap().owner, "ctl-a");
        let next = store.append_revision(attempt("prod", "api:v2", Outcome::Succeeded)).unwrap();
        assert_eq!(next.revision, 2);
    }

    #[test]
    fn second_open_of_same_file_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("prod.redb");
        let _first = StateStore::open(&db_path).unwrap();
        assert!(matches!(StateStore::open(&db_path), Err(StateError::Busy(_))));
    }
}
