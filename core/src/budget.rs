//! SQLite-backed hierarchical budget ledger.
//!
//! DB location: `{threads_dir}/budget_ledger.db`. Every write path runs
//! under `BEGIN IMMEDIATE` so concurrent reservations against the same
//! parent serialize at the transaction level.
//!
//! Remaining budget for a thread:
//! `max_spend - actual_spend - Σ(reserved_spend of active children)`.

use std::path::Path;
use std::path::PathBuf;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use crate::error::Result;
use crate::error::RyeErr;

const DB_FILE: &str = "budget_ledger.db";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetRow {
    pub thread_id: String,
    pub parent_thread_id: Option<String>,
    pub reserved_spend: f64,
    pub actual_spend: f64,
    pub max_spend: Option<f64>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpawnCheck {
    pub affordable: bool,
    pub remaining: f64,
    pub requested: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeSpend {
    pub total_actual: f64,
    pub total_reserved: f64,
    pub thread_count: u64,
    pub active_count: u64,
}

pub struct BudgetLedger {
    db_path: PathBuf,
}

fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

impl BudgetLedger {
    pub fn new(threads_dir: &Path) -> Result<Self> {
        let ledger = Self {
            db_path: threads_dir.join(DB_FILE),
        };
        ledger.ensure_schema()?;
        Ok(ledger)
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(conn)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS budget_ledger (
                 thread_id        TEXT PRIMARY KEY,
                 parent_thread_id TEXT,
                 reserved_spend   REAL NOT NULL DEFAULT 0.0,
                 actual_spend     REAL NOT NULL DEFAULT 0.0,
                 max_spend        REAL,
                 status           TEXT NOT NULL DEFAULT 'active',
                 created_at       TEXT NOT NULL,
                 updated_at       TEXT NOT NULL,
                 FOREIGN KEY (parent_thread_id)
                     REFERENCES budget_ledger(thread_id) ON DELETE RESTRICT
             );
             CREATE INDEX IF NOT EXISTS idx_budget_parent
                 ON budget_ledger(parent_thread_id);
             CREATE INDEX IF NOT EXISTS idx_budget_status
                 ON budget_ledger(status);",
        )?;
        Ok(())
    }

    /// Register a thread's budget. Called before the runner starts. A new
    /// root registration first clears terminal rows left by previous runs.
    pub fn register(
        &self,
        thread_id: &str,
        max_spend: Option<f64>,
        parent_thread_id: Option<&str>,
    ) -> Result<()> {
        let now = now_iso();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if parent_thread_id.is_none() {
            tx.execute(
                "DELETE FROM budget_ledger WHERE status IN ('completed', 'error', 'cancelled')",
                [],
            )?;
        }
        // A root's reservation is its whole pool, so actual-spend reporting
        // holds to the same invariant as children: actual <= reserved.
        tx.execute(
            "INSERT OR IGNORE INTO budget_ledger
                 (thread_id, parent_thread_id, reserved_spend, max_spend, status, created_at, updated_at)
             VALUES (?1, ?2, CASE WHEN ?2 IS NULL THEN COALESCE(?3, 0) ELSE 0 END, ?3, 'active', ?4, ?4)",
            params![thread_id, parent_thread_id, max_spend, now],
        )?;
        tx.commit()?;
        debug!(thread_id, parent = ?parent_thread_id, "budget registered");
        Ok(())
    }

    fn remaining_locked(tx: &rusqlite::Transaction<'_>, thread_id: &str) -> Result<Option<f64>> {
        let remaining: Option<Option<f64>> = tx
            .query_row(
                "SELECT
                     COALESCE(bl.max_spend, 0) - bl.actual_spend
                     - COALESCE((
                         SELECT SUM(c.reserved_spend)
                         FROM budget_ledger c
                         WHERE c.parent_thread_id = bl.thread_id
                           AND c.status = 'active'
                     ), 0) AS remaining
                 FROM budget_ledger bl
                 WHERE bl.thread_id = ?1",
                params![thread_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(remaining.map(|r| r.unwrap_or(0.0)))
    }

    /// Atomically reserve budget from a parent for a child.
    ///
    /// Fails with `BudgetNotRegistered` when the parent has no row and
    /// `InsufficientBudget` when the parent's remaining pool cannot cover
    /// the amount. On success the child row is upserted with the
    /// reservation.
    pub fn reserve(
        &self,
        child_thread_id: &str,
        amount: f64,
        parent_thread_id: &str,
        child_max_spend: Option<f64>,
    ) -> Result<()> {
        let now = now_iso();
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::DatabaseBusy =>
                {
                    RyeErr::BudgetLedgerLocked("reserve".to_string())
                }
                other => other.into(),
            })?;

        let remaining = Self::remaining_locked(&tx, parent_thread_id)?
            .ok_or_else(|| RyeErr::BudgetNotRegistered(parent_thread_id.to_string()))?;
        if remaining < amount {
            return Err(RyeErr::InsufficientBudget {
                parent_thread_id: parent_thread_id.to_string(),
                remaining,
                requested: amount,
            });
        }

        tx.execute(
            "INSERT INTO budget_ledger
                 (thread_id, parent_thread_id, reserved_spend, max_spend,
                  status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)
             ON CONFLICT(thread_id) DO UPDATE SET
                 reserved_spend = excluded.reserved_spend,
                 max_spend = excluded.max_spend,
                 status = 'active',
                 updated_at = excluded.updated_at",
            params![
                child_thread_id,
                parent_thread_id,
                amount,
                child_max_spend.unwrap_or(amount),
                now
            ],
        )?;
        tx.commit()?;
        debug!(child_thread_id, parent_thread_id, amount, "budget reserved");
        Ok(())
    }

    /// Record exact spend. More than the reservation is an overspend.
    pub fn report_actual(&self, thread_id: &str, amount: f64) -> Result<()> {
        let now = now_iso();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let reserved: Option<f64> = tx
            .query_row(
                "SELECT reserved_spend FROM budget_ledger WHERE thread_id = ?1",
                params![thread_id],
                |row| row.get(0),
            )
            .optional()?;
        let reserved = reserved.ok_or_else(|| RyeErr::BudgetNotRegistered(thread_id.to_string()))?;
        if amount > reserved {
            return Err(RyeErr::BudgetOverspend {
                thread_id: thread_id.to_string(),
                reserved,
                actual: amount,
            });
        }
        tx.execute(
            "UPDATE budget_ledger SET actual_spend = ?1, updated_at = ?2 WHERE thread_id = ?3",
            params![amount, now, thread_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Cumulative variant of [`report_actual`].
    pub fn increment_actual(&self, thread_id: &str, delta: f64) -> Result<()> {
        let now = now_iso();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row: Option<(f64, f64)> = tx
            .query_row(
                "SELECT actual_spend, reserved_spend FROM budget_ledger WHERE thread_id = ?1",
                params![thread_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (actual, reserved) =
            row.ok_or_else(|| RyeErr::BudgetNotRegistered(thread_id.to_string()))?;
        let new_actual = actual + delta;
        if new_actual > reserved {
            return Err(RyeErr::BudgetOverspend {
                thread_id: thread_id.to_string(),
                reserved,
                actual: new_actual,
            });
        }
        tx.execute(
            "UPDATE budget_ledger SET actual_spend = ?1, updated_at = ?2 WHERE thread_id = ?3",
            params![new_actual, now, thread_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Release the reservation on completion: `reserved_spend` collapses to
    /// `actual_spend`, returning the unused remainder to the parent's pool.
    pub fn release(&self, thread_id: &str, final_status: &str) -> Result<()> {
        let now = now_iso();
        let conn = self.connect()?;
        conn.execute(
            "UPDATE budget_ledger SET
                 reserved_spend = actual_spend,
                 status = ?1,
                 updated_at = ?2
             WHERE thread_id = ?3",
            params![final_status, now, thread_id],
        )?;
        debug!(thread_id, final_status, "budget released");
        Ok(())
    }

    pub fn get_remaining(&self, thread_id: &str) -> Result<f64> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        Self::remaining_locked(&tx, thread_id)?
            .ok_or_else(|| RyeErr::BudgetNotRegistered(thread_id.to_string()))
    }

    /// Pre-flight affordability check. No mutation.
    pub fn can_spawn(&self, parent_thread_id: &str, requested: f64) -> Result<SpawnCheck> {
        let remaining = self.get_remaining(parent_thread_id)?;
        Ok(SpawnCheck {
            affordable: remaining >= requested,
            remaining,
            requested,
        })
    }

    /// Add a child's actual spend to its parent's accumulator.
    pub fn cascade_spend(&self, parent_thread_id: &str, amount: f64) -> Result<()> {
        let now = now_iso();
        let conn = self.connect()?;
        conn.execute(
            "UPDATE budget_ledger
             SET actual_spend = actual_spend + ?1, updated_at = ?2
             WHERE thread_id = ?3 AND status = 'active'",
            params![amount, now, parent_thread_id],
        )?;
        Ok(())
    }

    /// Totals across the subtree rooted at `thread_id`, via recursive CTE.
    pub fn get_tree_spend(&self, thread_id: &str) -> Result<TreeSpend> {
        let conn = self.connect()?;
        let row = conn.query_row(
            "WITH RECURSIVE subtree AS (
                 SELECT thread_id, actual_spend, reserved_spend, status
                 FROM budget_ledger WHERE thread_id = ?1
                 UNION ALL
                 SELECT bl.thread_id, bl.actual_spend, bl.reserved_spend, bl.status
                 FROM budget_ledger bl
                 JOIN subtree s ON bl.parent_thread_id = s.thread_id
             )
             SELECT
                 COALESCE(SUM(actual_spend), 0),
                 COALESCE(SUM(reserved_spend), 0),
                 COUNT(*),
                 COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0)
             FROM subtree",
            params![thread_id],
            |row| {
                Ok(TreeSpend {
                    total_actual: row.get(0)?,
                    total_reserved: row.get(1)?,
                    thread_count: row.get(2)?,
                    active_count: row.get(3)?,
                })
            },
        )?;
        Ok(row)
    }

    pub fn get_status(&self, thread_id: &str) -> Result<Option<BudgetRow>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT thread_id, parent_thread_id, reserved_spend, actual_spend,
                        max_spend, status, created_at, updated_at
                 FROM budget_ledger WHERE thread_id = ?1",
                params![thread_id],
                |row| {
                    Ok(BudgetRow {
                        thread_id: row.get(0)?,
                        parent_thread_id: row.get(1)?,
                        reserved_spend: row.get(2)?,
                        actual_spend: row.get(3)?,
                        max_spend: row.get(4)?,
                        status: row.get(5)?,
                        created_at: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn ledger() -> (tempfile::TempDir, BudgetLedger) {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = BudgetLedger::new(tmp.path()).unwrap();
        (tmp, ledger)
    }

    #[test]
    fn remaining_accounts_for_active_children() {
        let (_tmp, ledger) = ledger();
        ledger.register("root", Some(1.0), None).unwrap();
        ledger.reserve("c1", 0.3, "root", None).unwrap();
        ledger.reserve("c2", 0.2, "root", None).unwrap();
        assert!((ledger.get_remaining("root").unwrap() - 0.5).abs() < 1e-9);

        // Releasing a child returns its whole reservation to the pool;
        // cascade_spend then charges the parent for what was spent.
        ledger.report_actual("c1", 0.1).unwrap();
        ledger.release("c1", "completed").unwrap();
        ledger.cascade_spend("root", 0.1).unwrap();
        assert!((ledger.get_remaining("root").unwrap() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn insufficient_budget_fails() {
        let (_tmp, ledger) = ledger();
        ledger.register("root", Some(1.0), None).unwrap();
        ledger.reserve("c1", 0.6, "root", None).unwrap();
        let err = ledger.reserve("c2", 0.6, "root", None).unwrap_err();
        match err {
            RyeErr::InsufficientBudget {
                remaining,
                requested,
                ..
            } => {
                assert!((remaining - 0.4).abs() < 1e-9);
                assert!((requested - 0.6).abs() < 1e-9);
            }
            other => panic!("expected InsufficientBudget, got {other}"),
        }
    }

    #[test]
    fn unregistered_parent_fails() {
        let (_tmp, ledger) = ledger();
        let err = ledger.reserve("c", 0.1, "ghost", None).unwrap_err();
        assert!(matches!(err, RyeErr::BudgetNotRegistered(_)));
    }

    #[test]
    fn overspend_is_rejected() {
        let (_tmp, ledger) = ledger();
        ledger.register("root", Some(1.0), None).unwrap();
        ledger.reserve("c1", 0.5, "root", None).unwrap();
        ledger.report_actual("c1", 0.4).unwrap();
        assert!(matches!(
            ledger.report_actual("c1", 0.6),
            Err(RyeErr::BudgetOverspend { .. })
        ));
        ledger.increment_actual("c1", 0.05).unwrap();
        assert!(matches!(
            ledger.increment_actual("c1", 0.2),
            Err(RyeErr::BudgetOverspend { .. })
        ));
    }

    #[test]
    fn root_registration_clears_terminal_rows() {
        let (_tmp, ledger) = ledger();
        ledger.register("old-root", Some(1.0), None).unwrap();
        ledger.release("old-root", "completed").unwrap();
        ledger.register("new-root", Some(2.0), None).unwrap();
        assert!(ledger.get_status("old-root").unwrap().is_none());
        assert!(ledger.get_status("new-root").unwrap().is_some());
    }

    #[test]
    fn tree_spend_walks_subtree() {
        let (_tmp, ledger) = ledger();
        ledger.register("root", Some(10.0), None).unwrap();
        ledger.reserve("a", 2.0, "root", None).unwrap();
        ledger.reserve("a1", 1.0, "a", None).unwrap();
        ledger.report_actual("a", 1.5).unwrap();
        ledger.report_actual("a1", 0.5).unwrap();

        let tree = ledger.get_tree_spend("root").unwrap();
        assert_eq!(tree.thread_count, 3);
        assert_eq!(tree.active_count, 3);
        assert!((tree.total_actual - 2.0).abs() < 1e-9);
    }

    #[test]
    fn can_spawn_is_read_only() {
        let (_tmp, ledger) = ledger();
        ledger.register("root", Some(1.0), None).unwrap();
        let check = ledger.can_spawn("root", 0.8).unwrap();
        assert!(check.affordable);
        let again = ledger.can_spawn("root", 0.8).unwrap();
        assert!(again.affordable, "pre-flight must not reserve");
    }

    /// Property: concurrent reservations never oversubscribe the parent.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reserves_serialize() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().to_path_buf();
        BudgetLedger::new(&path)
            .unwrap()
            .register("root", Some(1.0), None)
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let path = path.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let ledger = BudgetLedger::new(&path).unwrap();
                ledger.reserve(&format!("c{i}"), 0.6, "root", None)
            }));
        }
        let mut successes = 0;
        let mut insufficient = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => successes += 1,
                Err(RyeErr::InsufficientBudget { .. }) => insufficient += 1,
                Err(RyeErr::BudgetLedgerLocked(_)) => insufficient += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(successes, 1, "exactly one 0.6 reservation fits in 1.0");
        assert_eq!(successes + insufficient, 4);
    }
}
