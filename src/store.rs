//! Run store: append-only run log plus the global coverage frontier
//!
//! Backed by SQLite. The controller holds the sole write-capable handle;
//! scoring reads through a separate read-only handle so a run can never
//! see its own edges. Edge inserts are idempotent on the composite key.

use crate::target::BugSignature;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Readers and the writer share the file; short queries wait out lock
/// contention instead of surfacing SQLITE_BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// `(file, from_line, to_line)` coverage edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoveredEdge {
    pub file: String,
    pub from_line: i64,
    pub to_line: i64,
}

/// One executed mutation, as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub iteration: u64,
    pub seed_id: String,
    pub seed_text: String,
    pub mutated_input: String,
    pub status: String,
    pub bug_signature: Option<BugSignature>,
    pub interesting_score: f64,
    pub target: String,
    pub created_at: String,
}

/// Per-seed aggregates feeding the power scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SeedAggregate {
    pub fuzz_count: u64,
    pub avg_interesting_score: f64,
    pub bug_count: u64,
}

/// UTC ISO-8601 timestamp for `created_at`.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct RunStore {
    conn: Connection,
}

impl RunStore {
    /// Open (creating if needed) with the write-capable schema applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Read-only handle for scoring; fails if the database does not exist.
    pub fn open_read_only(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                iteration INTEGER NOT NULL,
                seed_id TEXT NOT NULL,
                seed_text TEXT NOT NULL,
                mutated_input TEXT NOT NULL,
                status TEXT NOT NULL,
                bug_type TEXT,
                exception TEXT,
                message TEXT,
                file TEXT,
                line INTEGER,
                interesting_score REAL NOT NULL,
                target TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_target_input
                ON runs (target, mutated_input);
            CREATE INDEX IF NOT EXISTS idx_runs_target_seed
                ON runs (target, seed_id);
            CREATE TABLE IF NOT EXISTS seen_branches (
                file TEXT NOT NULL,
                from_line INTEGER NOT NULL,
                to_line INTEGER NOT NULL,
                PRIMARY KEY (file, from_line, to_line)
            );",
        )?;
        Ok(())
    }

    /// Append one run row. No deduplication.
    pub fn insert_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        let sig = record.bug_signature.as_ref();
        self.conn.execute(
            "INSERT INTO runs (iteration, seed_id, seed_text, mutated_input, status,
                               bug_type, exception, message, file, line,
                               interesting_score, target, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.iteration as i64,
                record.seed_id,
                record.seed_text,
                record.mutated_input,
                record.status,
                sig.and_then(|s| s.kind.clone()),
                sig.and_then(|s| s.exception.clone()),
                sig.and_then(|s| s.message.clone()),
                sig.and_then(|s| s.file.clone()),
                sig.and_then(|s| s.line),
                record.interesting_score,
                record.target,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn input_already_run(&self, mutated_input: &str, target: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE target = ?1 AND mutated_input = ?2",
            params![target, mutated_input],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn run_count(&self, target: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE target = ?1",
            params![target],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Per-seed fuzz counts, mean scores, and bug counts for one target.
    /// Bug counts cover {bug, crash, timeout}.
    pub fn aggregate_seed_stats(
        &self,
        target: &str,
    ) -> Result<HashMap<String, SeedAggregate>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT seed_id,
                    COUNT(*),
                    AVG(interesting_score),
                    SUM(CASE WHEN status IN ('bug', 'crash', 'timeout') THEN 1 ELSE 0 END)
             FROM runs WHERE target = ?1 GROUP BY seed_id",
        )?;
        let rows = stmt.query_map(params![target], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut out = HashMap::new();
        for row in rows {
            let (seed_id, fuzz_count, avg, bug_count) = row?;
            out.insert(
                seed_id,
                SeedAggregate {
                    fuzz_count: fuzz_count.max(0) as u64,
                    avg_interesting_score: avg.unwrap_or(0.0),
                    bug_count: bug_count.max(0) as u64,
                },
            );
        }
        Ok(out)
    }

    /// Idempotent insert; returns how many edges were actually new.
    pub fn insert_covered_edges(&self, edges: &HashSet<CoveredEdge>) -> Result<usize, StoreError> {
        if edges.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO seen_branches (file, from_line, to_line)
                 VALUES (?1, ?2, ?3)",
            )?;
            for edge in edges {
                inserted += stmt.execute(params![edge.file, edge.from_line, edge.to_line])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// How many of the given edges are already on the frontier.
    pub fn count_seen_edges(&self, edges: &HashSet<CoveredEdge>) -> Result<usize, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT COUNT(*) FROM seen_branches
             WHERE file = ?1 AND from_line = ?2 AND to_line = ?3",
        )?;
        let mut seen = 0usize;
        for edge in edges {
            let count: i64 =
                stmt.query_row(params![edge.file, edge.from_line, edge.to_line], |row| {
                    row.get(0)
                })?;
            if count > 0 {
                seen += 1;
            }
        }
        Ok(seen)
    }

    pub fn list_seen_edges(&self) -> Result<HashSet<CoveredEdge>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT file, from_line, to_line FROM seen_branches")?;
        let rows = stmt.query_map([], |row| {
            Ok(CoveredEdge {
                file: row.get(0)?,
                from_line: row.get(1)?,
                to_line: row.get(2)?,
            })
        })?;
        let mut out = HashSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    /// Count prior failure rows with the same exception/file/line identity.
    /// Missing exception/file match the empty string; a NULL line matches
    /// only NULL.
    pub fn count_matching_bugs(
        &self,
        target: &str,
        exception: &str,
        file: &str,
        line: Option<i64>,
    ) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM runs
             WHERE target = ?1 AND status IN ('bug', 'crash', 'timeout', 'error')
               AND COALESCE(exception, '') = COALESCE(?2, '')
               AND COALESCE(file, '') = COALESCE(?3, '')
               AND ((line IS NOT NULL AND line = ?4) OR (line IS NULL AND ?4 IS NULL))",
            params![target, exception, file, line],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Full run rows for one target, iteration order. Used by tests and the
    /// end-of-campaign summary.
    pub fn list_runs(&self, target: &str) -> Result<Vec<RunRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT iteration, seed_id, seed_text, mutated_input, status,
                    bug_type, exception, message, file, line,
                    interesting_score, target, created_at
             FROM runs WHERE target = ?1 ORDER BY iteration, id",
        )?;
        let rows = stmt.query_map(params![target], |row| {
            let kind: Option<String> = row.get(5)?;
            let exception: Option<String> = row.get(6)?;
            let message: Option<String> = row.get(7)?;
            let file: Option<String> = row.get(8)?;
            let line: Option<i64> = row.get(9)?;
            let has_signature =
                kind.is_some() || exception.is_some() || message.is_some() || file.is_some() || line.is_some();
            Ok(RunRecord {
                iteration: row.get::<_, i64>(0)?.max(0) as u64,
                seed_id: row.get(1)?,
                seed_text: row.get(2)?,
                mutated_input: row.get(3)?,
                status: row.get(4)?,
                bug_signature: has_signature.then_some(BugSignature {
                    kind,
                    exception,
                    message,
                    file,
                    line,
                }),
                interesting_score: row.get(10)?,
                target: row.get(11)?,
                created_at: row.get(12)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
