//! SQLite-backed thread registry: lifecycle index, parentage walks, and
//! continuation chains.
//!
//! DB location: `{threads_dir}/registry.db`. Column migrations are
//! idempotent on schema creation so older databases upgrade in place.

use std::path::Path;
use std::path::PathBuf;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use crate::error::Result;
use rye_protocol::Cost;
use rye_protocol::ThreadStatus;

const DB_FILE: &str = "registry.db";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryRow {
    pub thread_id: String,
    pub directive: String,
    pub parent_id: Option<String>,
    pub status: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub completed_at: Option<String>,
    pub result: Option<String>,
    pub turns: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub spend: f64,
    pub spawn_count: u64,
    pub pid: Option<u32>,
    pub model: Option<String>,
    pub continuation_of: Option<String>,
    pub continuation_thread_id: Option<String>,
    pub chain_root_id: Option<String>,
}

fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

pub struct ThreadRegistry {
    db_path: PathBuf,
}

impl ThreadRegistry {
    pub fn new(threads_dir: &Path) -> Result<Self> {
        let registry = Self {
            db_path: threads_dir.join(DB_FILE),
        };
        registry.ensure_schema()?;
        Ok(registry)
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS threads (
                 thread_id TEXT PRIMARY KEY,
                 directive TEXT NOT NULL,
                 parent_id TEXT,
                 status TEXT DEFAULT 'created',
                 created_at TEXT,
                 updated_at TEXT,
                 completed_at TEXT,
                 result TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_threads_parent ON threads(parent_id);
             CREATE INDEX IF NOT EXISTS idx_threads_status ON threads(status);",
        )?;

        // Idempotent column migrations.
        let mut existing = std::collections::HashSet::new();
        {
            let mut stmt = conn.prepare("PRAGMA table_info(threads)")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(1)?;
                existing.insert(name);
            }
        }
        let migrations: [(&str, &str); 10] = [
            ("turns", "INTEGER DEFAULT 0"),
            ("input_tokens", "INTEGER DEFAULT 0"),
            ("output_tokens", "INTEGER DEFAULT 0"),
            ("spend", "REAL DEFAULT 0.0"),
            ("spawn_count", "INTEGER DEFAULT 0"),
            ("pid", "INTEGER"),
            ("model", "TEXT"),
            ("continuation_of", "TEXT"),
            ("continuation_thread_id", "TEXT"),
            ("chain_root_id", "TEXT"),
        ];
        for (name, column_type) in migrations {
            if !existing.contains(name) {
                conn.execute_batch(&format!("ALTER TABLE threads ADD COLUMN {name} {column_type}"))?;
            }
        }
        Ok(())
    }

    pub fn register(
        &self,
        thread_id: &str,
        directive: &str,
        parent_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<()> {
        let now = now_iso();
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO threads (thread_id, directive, parent_id, status, created_at, updated_at, pid, model)
             VALUES (?1, ?2, ?3, 'created', ?4, ?4, ?5, ?6)",
            params![thread_id, directive, parent_id, now, std::process::id(), model],
        )?;
        debug!(thread_id, directive, "thread registered");
        Ok(())
    }

    pub fn update_status(&self, thread_id: &str, status: ThreadStatus) -> Result<()> {
        let now = now_iso();
        let conn = self.connect()?;
        if status.is_terminal() {
            conn.execute(
                "UPDATE threads SET status = ?1, updated_at = ?2, completed_at = ?2 WHERE thread_id = ?3",
                params![status.to_string(), now, thread_id],
            )?;
        } else {
            conn.execute(
                "UPDATE threads SET status = ?1, updated_at = ?2 WHERE thread_id = ?3",
                params![status.to_string(), now, thread_id],
            )?;
        }
        Ok(())
    }

    pub fn get_status(&self, thread_id: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        let status = conn
            .query_row(
                "SELECT status FROM threads WHERE thread_id = ?1",
                params![thread_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status)
    }

    /// Snapshot the cost columns. Called after every turn.
    pub fn update_cost_snapshot(&self, thread_id: &str, cost: &Cost) -> Result<()> {
        let now = now_iso();
        let conn = self.connect()?;
        conn.execute(
            "UPDATE threads SET
                 turns = ?1, input_tokens = ?2, output_tokens = ?3,
                 spend = ?4, updated_at = ?5
             WHERE thread_id = ?6",
            params![
                cost.turns,
                cost.input_tokens,
                cost.output_tokens,
                cost.spend,
                now,
                thread_id
            ],
        )?;
        Ok(())
    }

    pub fn increment_spawn_count(&self, thread_id: &str) -> Result<()> {
        let now = now_iso();
        let conn = self.connect()?;
        conn.execute(
            "UPDATE threads SET spawn_count = spawn_count + 1, updated_at = ?1 WHERE thread_id = ?2",
            params![now, thread_id],
        )?;
        Ok(())
    }

    pub fn set_result(&self, thread_id: &str, result: &serde_json::Value) -> Result<()> {
        let now = now_iso();
        let conn = self.connect()?;
        conn.execute(
            "UPDATE threads SET result = ?1, updated_at = ?2 WHERE thread_id = ?3",
            params![result.to_string(), now, thread_id],
        )?;
        Ok(())
    }

    /// Back-pointer: mark a thread as continued by its successor.
    pub fn set_continuation(&self, thread_id: &str, continuation_thread_id: &str) -> Result<()> {
        let now = now_iso();
        let conn = self.connect()?;
        conn.execute(
            "UPDATE threads SET
                 continuation_thread_id = ?1,
                 status = 'continued',
                 updated_at = ?2
             WHERE thread_id = ?3",
            params![continuation_thread_id, now, thread_id],
        )?;
        Ok(())
    }

    /// Forward-pointer metadata on the continuation thread.
    pub fn set_chain_info(
        &self,
        thread_id: &str,
        chain_root_id: &str,
        continuation_of: &str,
    ) -> Result<()> {
        let now = now_iso();
        let conn = self.connect()?;
        conn.execute(
            "UPDATE threads SET
                 chain_root_id = ?1,
                 continuation_of = ?2,
                 updated_at = ?3
             WHERE thread_id = ?4",
            params![chain_root_id, continuation_of, now, thread_id],
        )?;
        Ok(())
    }

    pub fn get_thread(&self, thread_id: &str) -> Result<Option<RegistryRow>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                &format!("{SELECT_ROW} WHERE thread_id = ?1"),
                params![thread_id],
                row_to_registry,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_active(&self) -> Result<Vec<RegistryRow>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_ROW}
             WHERE status NOT IN ('completed', 'error', 'cancelled', 'continued')
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt
            .query_map([], row_to_registry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_children(&self, parent_id: &str) -> Result<Vec<RegistryRow>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_ROW} WHERE parent_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![parent_id], row_to_registry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The full continuation chain containing `thread_id`: walk backward to
    /// the root, then forward to the terminal thread. Cycle-guarded.
    pub fn get_chain(&self, thread_id: &str) -> Result<Vec<RegistryRow>> {
        let mut root_id = thread_id.to_string();
        let mut visited = std::collections::HashSet::new();
        while visited.insert(root_id.clone()) {
            let Some(thread) = self.get_thread(&root_id)? else {
                break;
            };
            match thread.continuation_of {
                Some(prev) => root_id = prev,
                None => break,
            }
        }

        let mut chain = Vec::new();
        let mut current = Some(root_id);
        visited.clear();
        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                break;
            }
            let Some(thread) = self.get_thread(&id)? else {
                break;
            };
            current = thread.continuation_thread_id.clone();
            chain.push(thread);
        }
        Ok(chain)
    }
}

const SELECT_ROW: &str = "SELECT thread_id, directive, parent_id, status, created_at, updated_at,
        completed_at, result, turns, input_tokens, output_tokens, spend,
        spawn_count, pid, model, continuation_of, continuation_thread_id,
        chain_root_id
 FROM threads";

fn row_to_registry(row: &Row<'_>) -> rusqlite::Result<RegistryRow> {
    Ok(RegistryRow {
        thread_id: row.get(0)?,
        directive: row.get(1)?,
        parent_id: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        completed_at: row.get(6)?,
        result: row.get(7)?,
        turns: row.get::<_, Option<u64>>(8)?.unwrap_or(0),
        input_tokens: row.get::<_, Option<u64>>(9)?.unwrap_or(0),
        output_tokens: row.get::<_, Option<u64>>(10)?.unwrap_or(0),
        spend: row.get::<_, Option<f64>>(11)?.unwrap_or(0.0),
        spawn_count: row.get::<_, Option<u64>>(12)?.unwrap_or(0),
        pid: row.get(13)?,
        model: row.get(14)?,
        continuation_of: row.get(15)?,
        continuation_thread_id: row.get(16)?,
        chain_root_id: row.get(17)?,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> (tempfile::TempDir, ThreadRegistry) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = ThreadRegistry::new(tmp.path()).unwrap();
        (tmp, registry)
    }

    #[test]
    fn register_and_lifecycle() {
        let (_tmp, registry) = registry();
        registry.register("t-1", "deploy", None, Some("fast")).unwrap();
        assert_eq!(registry.get_status("t-1").unwrap().as_deref(), Some("created"));

        registry.update_status("t-1", ThreadStatus::Running).unwrap();
        assert_eq!(registry.get_status("t-1").unwrap().as_deref(), Some("running"));

        registry.update_status("t-1", ThreadStatus::Completed).unwrap();
        let row = registry.get_thread("t-1").unwrap().unwrap();
        assert!(row.completed_at.is_some());
        assert_eq!(row.pid, Some(std::process::id()));
    }

    #[test]
    fn schema_creation_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        ThreadRegistry::new(tmp.path()).unwrap();
        // Re-opening runs the migrations again on an existing table.
        ThreadRegistry::new(tmp.path()).unwrap();
    }

    #[test]
    fn cost_snapshot_updates_columns() {
        let (_tmp, registry) = registry();
        registry.register("t-1", "deploy", None, None).unwrap();
        let mut cost = Cost::default();
        cost.record_turn(100, 50, 0.02);
        registry.update_cost_snapshot("t-1", &cost).unwrap();
        let row = registry.get_thread("t-1").unwrap().unwrap();
        assert_eq!(row.turns, 1);
        assert_eq!(row.input_tokens, 100);
        assert!((row.spend - 0.02).abs() < 1e-9);
    }

    #[test]
    fn active_listing_excludes_terminal() {
        let (_tmp, registry) = registry();
        registry.register("a", "d", None, None).unwrap();
        registry.register("b", "d", None, None).unwrap();
        registry.update_status("b", ThreadStatus::Error).unwrap();
        let active = registry.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].thread_id, "a");
    }

    #[test]
    fn children_are_ordered() {
        let (_tmp, registry) = registry();
        registry.register("parent", "d", None, None).unwrap();
        registry.register("c1", "d", Some("parent"), None).unwrap();
        registry.register("c2", "d", Some("parent"), None).unwrap();
        let children = registry.list_children("parent").unwrap();
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn chain_walk_from_any_member() {
        let (_tmp, registry) = registry();
        registry.register("t1", "chat", None, None).unwrap();
        registry.register("t2", "chat", None, None).unwrap();
        registry.register("t3", "chat", None, None).unwrap();

        registry.set_continuation("t1", "t2").unwrap();
        registry.set_chain_info("t2", "t1", "t1").unwrap();
        registry.set_continuation("t2", "t3").unwrap();
        registry.set_chain_info("t3", "t1", "t2").unwrap();

        for member in ["t1", "t2", "t3"] {
            let chain = registry.get_chain(member).unwrap();
            let ids: Vec<&str> = chain.iter().map(|t| t.thread_id.as_str()).collect();
            assert_eq!(ids, vec!["t1", "t2", "t3"], "walk from {member}");
        }
        assert_eq!(registry.get_status("t1").unwrap().as_deref(), Some("continued"));
    }
}
