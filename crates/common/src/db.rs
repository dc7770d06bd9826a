//! SQLite persistence for SelfHeal state
//!
//! All durable records (projects, test runs, healing events, screenshots)
//! live here. Counter updates and healing-event writes for a run commit in
//! a single transaction so no partial state is ever observable.

use crate::{
    CandidateSummary, Error, HealingEvent, HealingStatus, Project, ReasonCode, Result, RunCounters,
    RunStatus, RunTrigger, Screenshot, TestRun,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Outcome of an insert that tolerates duplicate delivery
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// The event was written and counters were updated
    Inserted(HealingEvent),
    /// A record for this (run, test) already existed; returned unchanged
    Existing(HealingEvent),
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // WAL for concurrent readers alongside the single writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                api_key TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_projects_name ON projects(name);

            CREATE TABLE IF NOT EXISTS test_runs (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                branch TEXT NOT NULL,
                trigger TEXT NOT NULL,
                commit_sha TEXT,
                total INTEGER NOT NULL DEFAULT 0,
                passed INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                healed INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_test_runs_project ON test_runs(project_id, created_at);

            CREATE TABLE IF NOT EXISTS healing_events (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES test_runs(id) ON DELETE CASCADE,
                test_name TEXT NOT NULL,
                test_file TEXT,
                original_selector TEXT NOT NULL,
                error_message TEXT,
                snapshot_digest TEXT,
                confidence REAL NOT NULL,
                healed_selector TEXT,
                status TEXT NOT NULL,
                reason TEXT NOT NULL,
                candidates TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            -- At most one healing event per (run, test): the uniqueness
            -- constraint is the backstop under concurrent duplicate delivery.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_events_run_test
                ON healing_events(run_id, test_name);
            CREATE INDEX IF NOT EXISTS idx_events_run ON healing_events(run_id);

            -- One recorded outcome per (run, test); pass reports dedupe here.
            CREATE TABLE IF NOT EXISTS reported_tests (
                run_id TEXT NOT NULL REFERENCES test_runs(id) ON DELETE CASCADE,
                test_name TEXT NOT NULL,
                outcome TEXT NOT NULL,
                PRIMARY KEY (run_id, test_name)
            );

            CREATE TABLE IF NOT EXISTS screenshots (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES test_runs(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                blob_digest TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_screenshots_run ON screenshots(run_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Projects
    // ========================================================================

    pub fn insert_project(&self, project: &Project) -> Result<()> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO projects (id, name, api_key, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![project.id, project.name, project.api_key, project.created_at],
        )?;
        if inserted == 0 {
            return Err(Error::AlreadyExists {
                kind: "project".to_string(),
                id: project.name.clone(),
            });
        }
        debug!("Created project {} ({})", project.name, project.id);
        Ok(())
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, api_key, created_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        api_key: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, api_key, created_at FROM projects ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Project {
                id: row.get(0)?,
                name: row.get(1)?,
                api_key: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delete a project; runs, events, and screenshots cascade
    pub fn delete_project(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ========================================================================
    // Test runs
    // ========================================================================

    pub fn insert_run(&self, run: &TestRun) -> Result<()> {
        let trigger = enum_str(&run.trigger)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO test_runs (id, project_id, status, branch, trigger, commit_sha,
                 total, passed, failed, healed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run.id,
                run.project_id,
                run.status.to_string(),
                run.branch,
                trigger,
                run.commit_sha,
                run.counters.total,
                run.counters.passed,
                run.counters.failed,
                run.counters.healed,
                run.created_at,
                run.updated_at,
            ],
        )?;
        debug!("Created test run {} for project {}", run.id, run.project_id);
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<TestRun>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, project_id, status, branch, trigger, commit_sha,
                        total, passed, failed, healed, created_at, updated_at
                 FROM test_runs WHERE id = ?1",
                params![id],
                run_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// List a project's runs, most recent first
    pub fn list_runs(&self, project_id: &str, limit: u32) -> Result<Vec<TestRun>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, status, branch, trigger, commit_sha,
                    total, passed, failed, healed, created_at, updated_at
             FROM test_runs WHERE project_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_id, limit], run_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Compare-and-swap status update: only succeeds while the run is in
    /// one of the expected states. Returns the updated run, or RunNotActive.
    pub fn transition_run(
        &self,
        id: &str,
        from: &[RunStatus],
        to: RunStatus,
    ) -> Result<TestRun> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        let placeholders: Vec<String> = from.iter().map(|s| format!("'{}'", s)).collect();
        let sql = format!(
            "UPDATE test_runs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status IN ({})",
            placeholders.join(", ")
        );
        let changed = conn.execute(&sql, params![to.to_string(), now, id])?;
        drop(conn);

        if changed == 0 {
            let status = self
                .get_run(id)?
                .map(|r| r.status.to_string())
                .unwrap_or_else(|| "missing".to_string());
            return Err(Error::RunNotActive {
                id: id.to_string(),
                status,
            });
        }
        self.get_run(id)?.ok_or_else(|| Error::NotFound {
            kind: "test_run".to_string(),
            id: id.to_string(),
        })
    }

    // ========================================================================
    // Healing events + atomic counter updates
    // ========================================================================

    /// Record a passing test: bump total/passed. Duplicate reports for the
    /// same (run, test) are no-ops.
    pub fn record_pass(&self, run_id: &str, test_name: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let fresh = tx.execute(
            "INSERT OR IGNORE INTO reported_tests (run_id, test_name, outcome)
             VALUES (?1, ?2, 'passed')",
            params![run_id, test_name],
        )?;
        if fresh > 0 {
            // Counters only move while the run is active; a zero-row update
            // means the run went terminal under us, so roll everything back.
            let changed = tx.execute(
                "UPDATE test_runs SET total = total + 1, passed = passed + 1, updated_at = ?2
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![run_id, chrono::Utc::now().timestamp()],
            )?;
            if changed == 0 {
                return Err(run_not_active(&tx, run_id)?);
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Record a failing test and its healing decision atomically: the event
    /// row, the reported-test row, and the counter bumps commit together.
    ///
    /// If an event for this (run, test) already exists the write is skipped
    /// entirely and the existing record is returned, so duplicate delivery
    /// never double-counts.
    pub fn record_failure(&self, event: &HealingEvent) -> Result<InsertOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = query_event(
            &tx,
            "SELECT id, run_id, test_name, test_file, original_selector, error_message,
                    snapshot_digest, confidence, healed_selector, status, reason, candidates,
                    created_at, updated_at
             FROM healing_events WHERE run_id = ?1 AND test_name = ?2",
            params![event.run_id, event.test_name],
        )?;
        if let Some(existing) = existing {
            tx.commit()?;
            debug!(
                "Duplicate failure report for ({}, {}), returning recorded decision",
                event.run_id, event.test_name
            );
            return Ok(InsertOutcome::Existing(existing));
        }

        tx.execute(
            "INSERT INTO healing_events
                 (id, run_id, test_name, test_file, original_selector, error_message,
                  snapshot_digest, confidence, healed_selector, status, reason, candidates,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                event.id,
                event.run_id,
                event.test_name,
                event.test_file,
                event.original_selector,
                event.error_message,
                event.snapshot_digest,
                event.confidence,
                event.healed_selector,
                event.status.to_string(),
                event.reason.to_string(),
                serde_json::to_string(&event.candidates)?,
                event.created_at,
                event.updated_at,
            ],
        )?;
        let fresh = tx.execute(
            "INSERT OR IGNORE INTO reported_tests (run_id, test_name, outcome)
             VALUES (?1, ?2, 'failed')",
            params![event.run_id, event.test_name],
        )?;

        let healed = if event.status.is_healed() { 1 } else { 0 };
        let now = chrono::Utc::now().timestamp();
        let changed = if fresh > 0 {
            tx.execute(
                "UPDATE test_runs
                 SET total = total + 1, failed = failed + 1, healed = healed + ?2,
                     updated_at = ?3
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![event.run_id, healed, now],
            )?
        } else {
            // The test already passed in this run; the failure supersedes
            // the pass and total stays at one outcome per (run, test).
            tx.execute(
                "UPDATE reported_tests SET outcome = 'failed'
                 WHERE run_id = ?1 AND test_name = ?2",
                params![event.run_id, event.test_name],
            )?;
            tx.execute(
                "UPDATE test_runs
                 SET passed = passed - 1, failed = failed + 1, healed = healed + ?2,
                     updated_at = ?3
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![event.run_id, healed, now],
            )?
        };
        if changed == 0 {
            // Run went terminal between the caller's check and this commit;
            // rolling back discards the event row too.
            return Err(run_not_active(&tx, &event.run_id)?);
        }

        tx.commit()?;
        Ok(InsertOutcome::Inserted(event.clone()))
    }

    /// Resolve a NeedsReview event into HealedManual or Ignored. The status
    /// change and the healed-counter bump commit together so
    /// `healed == count(healed events)` holds at every point in time.
    pub fn resolve_event(
        &self,
        event_id: &str,
        next: HealingStatus,
        healed_selector: Option<&str>,
    ) -> Result<HealingEvent> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let event = query_event(
            &tx,
            "SELECT id, run_id, test_name, test_file, original_selector, error_message,
                    snapshot_digest, confidence, healed_selector, status, reason, candidates,
                    created_at, updated_at
             FROM healing_events WHERE id = ?1",
            params![event_id],
        )?
        .ok_or_else(|| Error::NotFound {
            kind: "healing_event".to_string(),
            id: event_id.to_string(),
        })?;

        let next = event.status.transition_to(next)?;
        let now = chrono::Utc::now().timestamp();

        tx.execute(
            "UPDATE healing_events
             SET status = ?2, healed_selector = ?3, reason = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                event_id,
                next.to_string(),
                healed_selector.or(event.healed_selector.as_deref()),
                ReasonCode::ManualResolution.to_string(),
                now,
            ],
        )?;

        if next.is_healed() {
            tx.execute(
                "UPDATE test_runs SET healed = healed + 1, updated_at = ?2 WHERE id = ?1",
                params![event.run_id, now],
            )?;
        }

        tx.commit()?;
        drop(conn);

        self.get_event(event_id)?.ok_or_else(|| Error::NotFound {
            kind: "healing_event".to_string(),
            id: event_id.to_string(),
        })
    }

    pub fn get_event(&self, id: &str) -> Result<Option<HealingEvent>> {
        let conn = self.conn.lock();
        query_event(
            &conn,
            "SELECT id, run_id, test_name, test_file, original_selector, error_message,
                    snapshot_digest, confidence, healed_selector, status, reason, candidates,
                    created_at, updated_at
             FROM healing_events WHERE id = ?1",
            params![id],
        )
    }

    pub fn get_event_for_test(&self, run_id: &str, test_name: &str) -> Result<Option<HealingEvent>> {
        let conn = self.conn.lock();
        query_event(
            &conn,
            "SELECT id, run_id, test_name, test_file, original_selector, error_message,
                    snapshot_digest, confidence, healed_selector, status, reason, candidates,
                    created_at, updated_at
             FROM healing_events WHERE run_id = ?1 AND test_name = ?2",
            params![run_id, test_name],
        )
    }

    pub fn list_events(&self, run_id: &str) -> Result<Vec<HealingEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, test_name, test_file, original_selector, error_message,
                    snapshot_digest, confidence, healed_selector, status, reason, candidates,
                    created_at, updated_at
             FROM healing_events WHERE run_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], event_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Events for one test across a project's most recent runs, newest run
    /// first. Feeds selector history and the fragility analyzer.
    pub fn list_test_history(
        &self,
        project_id: &str,
        test_name: &str,
        window_runs: u32,
    ) -> Result<Vec<HealingEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.run_id, e.test_name, e.test_file, e.original_selector,
                    e.error_message, e.snapshot_digest, e.confidence, e.healed_selector,
                    e.status, e.reason, e.candidates, e.created_at, e.updated_at
             FROM healing_events e
             JOIN test_runs r ON r.id = e.run_id
             WHERE r.project_id = ?1 AND e.test_name = ?2
               AND r.id IN (SELECT id FROM test_runs WHERE project_id = ?1
                            ORDER BY created_at DESC, id DESC LIMIT ?3)
             ORDER BY r.created_at DESC, r.id DESC",
        )?;
        let rows = stmt.query_map(params![project_id, test_name, window_runs], event_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// All events across a project's most recent runs, newest run first
    pub fn list_project_events(
        &self,
        project_id: &str,
        window_runs: u32,
    ) -> Result<Vec<HealingEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.run_id, e.test_name, e.test_file, e.original_selector,
                    e.error_message, e.snapshot_digest, e.confidence, e.healed_selector,
                    e.status, e.reason, e.candidates, e.created_at, e.updated_at
             FROM healing_events e
             JOIN test_runs r ON r.id = e.run_id
             WHERE r.project_id = ?1
               AND r.id IN (SELECT id FROM test_runs WHERE project_id = ?1
                            ORDER BY created_at DESC, id DESC LIMIT ?2)
             ORDER BY r.created_at DESC, r.id DESC",
        )?;
        let rows = stmt.query_map(params![project_id, window_runs], event_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ========================================================================
    // Screenshots
    // ========================================================================

    pub fn insert_screenshot(&self, shot: &Screenshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO screenshots (id, run_id, name, blob_digest, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![shot.id, shot.run_id, shot.name, shot.blob_digest, shot.created_at],
        )?;
        Ok(())
    }

    pub fn list_screenshots(&self, run_id: &str) -> Result<Vec<Screenshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, name, blob_digest, created_at
             FROM screenshots WHERE run_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(Screenshot {
                id: row.get(0)?,
                run_id: row.get(1)?,
                name: row.get(2)?,
                blob_digest: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<TestRun> {
    let status: String = row.get(2)?;
    let trigger: String = row.get(4)?;
    Ok(TestRun {
        id: row.get(0)?,
        project_id: row.get(1)?,
        status: parse_json_enum(&status).unwrap_or(RunStatus::Failed),
        branch: row.get(3)?,
        trigger: parse_json_enum(&trigger).unwrap_or(RunTrigger::Ci),
        commit_sha: row.get(5)?,
        counters: RunCounters {
            total: row.get(6)?,
            passed: row.get(7)?,
            failed: row.get(8)?,
            healed: row.get(9)?,
        },
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<HealingEvent> {
    let status: String = row.get(9)?;
    let reason: String = row.get(10)?;
    let candidates: String = row.get(11)?;
    Ok(HealingEvent {
        id: row.get(0)?,
        run_id: row.get(1)?,
        test_name: row.get(2)?,
        test_file: row.get(3)?,
        original_selector: row.get(4)?,
        error_message: row.get(5)?,
        snapshot_digest: row.get(6)?,
        confidence: row.get(7)?,
        healed_selector: row.get(8)?,
        status: parse_json_enum(&status).unwrap_or(HealingStatus::Pending),
        reason: parse_json_enum(&reason).unwrap_or(ReasonCode::LowConfidence),
        candidates: serde_json::from_str::<Vec<CandidateSummary>>(&candidates)
            .unwrap_or_default(),
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

/// Enums are stored as their snake_case serde names; wrap in quotes to
/// round-trip through serde_json.
fn parse_json_enum<T: serde::de::DeserializeOwned>(s: &str) -> Option<T> {
    serde_json::from_str(&format!("\"{}\"", s)).ok()
}

fn enum_str<T: serde::Serialize>(v: &T) -> Result<String> {
    Ok(serde_json::to_string(v)?.trim_matches('"').to_string())
}

fn query_event(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Option<HealingEvent>> {
    Ok(conn.query_row(sql, args, event_from_row).optional()?)
}

/// Build the RunNotActive error for a run whose counters refused to move
fn run_not_active(conn: &Connection, run_id: &str) -> Result<Error> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM test_runs WHERE id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(Error::RunNotActive {
        id: run_id.to_string(),
        status: status.unwrap_or_else(|| "missing".to_string()),
    })
}
