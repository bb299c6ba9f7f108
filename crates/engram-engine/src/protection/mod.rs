//! Protection layer: every tier mutation runs a backup-validate-commit
//! cycle with rollback on failure.
//!
//! ```text
//! Idle ──▶ BackingUp ──▶ Validating ──▶ Committing ──▶ Idle
//!                             │              │
//!                             └──────┬───────┘
//!                                    ▼
//!                               RollingBack ──▶ Idle
//! ```
//!
//! The working copy is an IMMEDIATE SQLite transaction: committed state is
//! never touched until the commit step, and readers keep observing the
//! last committed state throughout. The backup taken before the
//! transaction opens goes into a fixed-capacity ring and is what rollback
//! is verified against. If rollback verification or restore fails the
//! guard halts all further writes to its store until `clear_halt()`.

mod snapshot;

pub use snapshot::{SnapshotRing, TableSpec, TierSnapshot};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, error, warn};

use engram_core::config::ProtectionConfig;
use engram_core::Database;

use crate::error::{EngineError, EngineResult};

/// Protection cycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    BackingUp,
    Validating,
    Committing,
    RollingBack,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::BackingUp => "backing_up",
            Self::Validating => "validating",
            Self::Committing => "committing",
            Self::RollingBack => "rolling_back",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Store-side hooks the guard drives through the cycle.
pub trait TierOps {
    /// Tables owned by this tier, parents before children.
    fn tables(&self) -> &'static [TableSpec];

    /// Structural invariant checks, run against the in-transaction state.
    fn validate(&self, txn: &Transaction) -> EngineResult<()>;

    /// Rewrite the tier's full-text tokens. Runs inside the committing
    /// transaction; this is the only point the token index is updated.
    fn reindex(&self, txn: &Transaction) -> EngineResult<()>;

    /// Snapshot the tier's committed state.
    fn snapshot(&self, conn: &Connection) -> EngineResult<TierSnapshot> {
        TierSnapshot::capture(conn, self.tables())
    }

    /// Restore the tier from a snapshot.
    fn restore(&self, conn: &mut Connection, snapshot: &TierSnapshot) -> EngineResult<()> {
        snapshot.restore(conn)
    }
}

/// Serializes and protects every mutation of one tier store.
pub struct ProtectionGuard {
    tier: &'static str,
    ring: Mutex<SnapshotRing>,
    phase: Mutex<Phase>,
    halted: AtomicBool,
    max_snapshot_bytes: Option<usize>,
}

impl ProtectionGuard {
    pub fn new(tier: &'static str, config: &ProtectionConfig) -> Self {
        Self {
            tier,
            ring: Mutex::new(SnapshotRing::new(config.backup_retention)),
            phase: Mutex::new(Phase::Idle),
            halted: AtomicBool::new(false),
            max_snapshot_bytes: config.max_snapshot_bytes,
        }
    }

    /// Current cycle phase.
    pub fn phase(&self) -> Phase {
        self.phase.lock().map(|p| *p).unwrap_or(Phase::Idle)
    }

    /// Whether a rollback failure has halted this store's writes.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Manually clear a write halt after intervention.
    pub fn clear_halt(&self) {
        if self.halted.swap(false, Ordering::SeqCst) {
            warn!(tier = self.tier, "write halt cleared manually");
        }
    }

    /// Number of backups currently retained.
    pub fn backup_count(&self) -> usize {
        self.ring.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Fingerprint of the most recent backup, if any.
    pub fn latest_backup_fingerprint(&self) -> Option<String> {
        self.ring
            .lock()
            .ok()
            .and_then(|r| r.latest().map(|s| s.fingerprint().to_string()))
    }

    /// Run one protected mutation.
    ///
    /// `op` applies the mutation against the open transaction and returns
    /// its result; it must not commit or roll back itself.
    pub fn mutate<T>(
        &self,
        db: &Database,
        ops: &dyn TierOps,
        op: impl FnOnce(&Transaction) -> EngineResult<T>,
    ) -> EngineResult<T> {
        if self.is_halted() {
            return Err(EngineError::WritesHalted { tier: self.tier });
        }

        let mut conn = db.lock().map_err(EngineError::Core)?;

        self.set_phase(Phase::BackingUp);
        let backup = match ops.snapshot(&conn) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.set_phase(Phase::Idle);
                return Err(EngineError::BackupFailure {
                    reason: e.to_string(),
                });
            }
        };
        if let Some(max) = self.max_snapshot_bytes {
            if backup.size_bytes() > max {
                self.set_phase(Phase::Idle);
                return Err(EngineError::BackupFailure {
                    reason: format!(
                        "snapshot of {} bytes exceeds limit of {} bytes",
                        backup.size_bytes(),
                        max
                    ),
                });
            }
        }
        if let Ok(mut ring) = self.ring.lock() {
            ring.push(backup.clone());
        }

        match self.apply(&mut conn, ops, op) {
            Ok(value) => {
                debug!(tier = self.tier, "mutation committed");
                self.set_phase(Phase::Idle);
                Ok(value)
            }
            Err(err) => {
                self.set_phase(Phase::RollingBack);
                warn!(tier = self.tier, error = %err, "mutation failed, rolling back");
                if let Err(rollback_err) = self.verify_rollback(&mut conn, ops, &backup) {
                    self.halted.store(true, Ordering::SeqCst);
                    self.set_phase(Phase::Idle);
                    error!(
                        tier = self.tier,
                        error = %rollback_err,
                        "rollback failed, store is in an unknown state and writes are halted"
                    );
                    return Err(rollback_err);
                }
                self.set_phase(Phase::Idle);
                Err(err)
            }
        }
    }

    fn apply<T>(
        &self,
        conn: &mut Connection,
        ops: &dyn TierOps,
        op: impl FnOnce(&Transaction) -> EngineResult<T>,
    ) -> EngineResult<T> {
        // Dropping the transaction on any early return rolls it back.
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = op(&txn)?;
        self.set_phase(Phase::Validating);
        ops.validate(&txn)?;
        self.set_phase(Phase::Committing);
        ops.reindex(&txn)?;
        txn.commit()?;
        Ok(value)
    }

    /// Confirm the store matches the pre-mutation backup, restoring from
    /// it if the transaction rollback left any difference behind.
    fn verify_rollback(
        &self,
        conn: &mut Connection,
        ops: &dyn TierOps,
        backup: &TierSnapshot,
    ) -> EngineResult<()> {
        let current = ops.snapshot(conn).map_err(|e| EngineError::RollbackFailure {
            tier: self.tier,
            reason: format!("could not snapshot store after rollback: {e}"),
        })?;
        if current.fingerprint() == backup.fingerprint() {
            return Ok(());
        }

        warn!(tier = self.tier, "store differs from backup after rollback, restoring");
        ops.restore(conn, backup)
            .map_err(|e| EngineError::RollbackFailure {
                tier: self.tier,
                reason: format!("restore from backup failed: {e}"),
            })?;

        let restored = ops.snapshot(conn).map_err(|e| EngineError::RollbackFailure {
            tier: self.tier,
            reason: format!("could not snapshot store after restore: {e}"),
        })?;
        if restored.fingerprint() != backup.fingerprint() {
            return Err(EngineError::RollbackFailure {
                tier: self.tier,
                reason: "store still differs from backup after restore".into(),
            });
        }
        Ok(())
    }

    fn set_phase(&self, phase: Phase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvariantViolation;
    use rusqlite::params;

    /// Minimal tier over the conversations table.
    struct TestTier {
        fail_validation: bool,
    }

    const TEST_TABLES: &[TableSpec] = &[TableSpec {
        name: "conversations",
        order_by: "id",
    }];

    impl TierOps for TestTier {
        fn tables(&self) -> &'static [TableSpec] {
            TEST_TABLES
        }

        fn validate(&self, _txn: &Transaction) -> EngineResult<()> {
            if self.fail_validation {
                return Err(InvariantViolation::ActiveCountExceeded { count: 99, max: 1 }.into());
            }
            Ok(())
        }

        fn reindex(&self, _txn: &Transaction) -> EngineResult<()> {
            Ok(())
        }
    }

    /// Tier whose snapshots lie and whose restore fails, to force the
    /// rollback-failure path.
    struct BrokenTier {
        captures: std::sync::atomic::AtomicUsize,
    }

    impl TierOps for BrokenTier {
        fn tables(&self) -> &'static [TableSpec] {
            TEST_TABLES
        }

        fn validate(&self, _txn: &Transaction) -> EngineResult<()> {
            Err(InvariantViolation::ActiveCountExceeded { count: 99, max: 1 }.into())
        }

        fn reindex(&self, _txn: &Transaction) -> EngineResult<()> {
            Ok(())
        }

        fn snapshot(&self, conn: &Connection) -> EngineResult<TierSnapshot> {
            let n = self.captures.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                // The backup: capture honestly.
                TierSnapshot::capture(conn, TEST_TABLES)
            } else {
                // Post-rollback verification: report a different store.
                conn.execute(
                    "INSERT INTO conversations (id, topic, status, queue_position, message_count, created_at, updated_at)
                     VALUES (?1, 'phantom', 'active', 1, 0, 0, 0)",
                    params![format!("phantom-{n}")],
                )?;
                TierSnapshot::capture(conn, TEST_TABLES)
            }
        }

        fn restore(&self, _conn: &mut Connection, _snapshot: &TierSnapshot) -> EngineResult<()> {
            Err(EngineError::BackupFailure {
                reason: "restore is broken".into(),
            })
        }
    }

    fn insert_conversation(txn: &Transaction, id: &str, position: u32) -> EngineResult<()> {
        txn.execute(
            "INSERT INTO conversations (id, topic, status, queue_position, message_count, created_at, updated_at)
             VALUES (?1, 'topic', 'active', ?2, 0, 0, 0)",
            params![id, position],
        )?;
        Ok(())
    }

    #[test]
    fn test_successful_mutation_commits() {
        let db = Database::open_in_memory().unwrap();
        let guard = ProtectionGuard::new("test", &ProtectionConfig::default());
        let tier = TestTier {
            fail_validation: false,
        };

        guard
            .mutate(&db, &tier, |txn| insert_conversation(txn, "c-1", 1))
            .unwrap();

        assert_eq!(guard.phase(), Phase::Idle);
        assert_eq!(guard.backup_count(), 1);

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_validation_failure_leaves_store_identical() {
        let db = Database::open_in_memory().unwrap();
        let guard = ProtectionGuard::new("test", &ProtectionConfig::default());

        let ok_tier = TestTier {
            fail_validation: false,
        };
        guard
            .mutate(&db, &ok_tier, |txn| insert_conversation(txn, "c-1", 1))
            .unwrap();

        let before = {
            let conn = db.lock().unwrap();
            TierSnapshot::capture(&conn, TEST_TABLES).unwrap()
        };

        let bad_tier = TestTier {
            fail_validation: true,
        };
        let err = guard
            .mutate(&db, &bad_tier, |txn| insert_conversation(txn, "c-2", 2))
            .unwrap_err();
        assert!(err.is_validation());

        let after = {
            let conn = db.lock().unwrap();
            TierSnapshot::capture(&conn, TEST_TABLES).unwrap()
        };
        assert_eq!(before.fingerprint(), after.fingerprint());
        assert_eq!(guard.phase(), Phase::Idle);
        assert!(!guard.is_halted());
    }

    #[test]
    fn test_op_failure_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let guard = ProtectionGuard::new("test", &ProtectionConfig::default());
        let tier = TestTier {
            fail_validation: false,
        };

        let err = guard
            .mutate(&db, &tier, |txn| {
                insert_conversation(txn, "c-1", 1)?;
                Err::<(), _>(EngineError::not_found("Conversation", "missing"))
            })
            .unwrap_err();
        assert!(err.is_not_found());

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_backup_ring_retention() {
        let db = Database::open_in_memory().unwrap();
        let config = ProtectionConfig {
            backup_retention: 10,
            max_snapshot_bytes: None,
        };
        let guard = ProtectionGuard::new("test", &config);
        let tier = TestTier {
            fail_validation: false,
        };

        for i in 0..15u32 {
            guard
                .mutate(&db, &tier, |txn| {
                    insert_conversation(txn, &format!("c-{i}"), i + 1)
                })
                .unwrap();
        }
        assert_eq!(guard.backup_count(), 10);
    }

    #[test]
    fn test_oversized_snapshot_fails_closed() {
        let db = Database::open_in_memory().unwrap();
        let config = ProtectionConfig {
            backup_retention: 10,
            max_snapshot_bytes: Some(1),
        };
        let guard = ProtectionGuard::new("test", &config);
        let tier = TestTier {
            fail_validation: false,
        };

        let err = guard
            .mutate(&db, &tier, |txn| insert_conversation(txn, "c-1", 1))
            .unwrap_err();
        assert!(matches!(err, EngineError::BackupFailure { .. }));

        // Nothing was applied.
        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(guard.backup_count(), 0);
    }

    #[test]
    fn test_rollback_failure_halts_writes() {
        let db = Database::open_in_memory().unwrap();
        let guard = ProtectionGuard::new("test", &ProtectionConfig::default());
        let tier = BrokenTier {
            captures: std::sync::atomic::AtomicUsize::new(0),
        };

        let err = guard
            .mutate(&db, &tier, |txn| insert_conversation(txn, "c-1", 1))
            .unwrap_err();
        assert!(err.is_rollback_failure());
        assert!(guard.is_halted());

        // Further writes are rejected until the halt is cleared.
        let ok_tier = TestTier {
            fail_validation: false,
        };
        let err = guard
            .mutate(&db, &ok_tier, |txn| insert_conversation(txn, "c-2", 1))
            .unwrap_err();
        assert!(matches!(err, EngineError::WritesHalted { .. }));

        guard.clear_halt();
        assert!(!guard.is_halted());
        guard
            .mutate(&db, &ok_tier, |txn| insert_conversation(txn, "c-3", 1))
            .unwrap();
    }
}
