use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use pipewright_common::{
    Artifact, ErrorKind, EventType, Persona, Run, RunConfig, RunEvent, RunState, RunStatus,
    Severity, Step, StepOutcome, StepStatus, new_run_id,
};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::json;

use crate::errors::StoreError;
use crate::util::truncate;

/// Async-safe handle to the run store.
///
/// Wraps `RunStore` behind `Arc<Mutex>` and runs every access on tokio's
/// blocking pool via `spawn_blocking`, so SQLite I/O never stalls the
/// orchestrator's async tasks.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<RunStore>>,
}

impl StoreHandle {
    pub fn new(store: RunStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure against the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&RunStore) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::TaskPanicked(e.to_string()))?
    }

    /// Acquire the store synchronously. For CLI read paths and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, RunStore>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

/// Durable record of runs, steps, artifacts and the event timeline.
///
/// Every multi-row write happens in one transaction, and every status change
/// appends its matching event inside that same transaction.
pub struct RunStore {
    conn: Connection,
}

impl RunStore {
    /// Open (or create) the store at `path` and run migrations.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Corrupt {
                table: "runs",
                message: format!("cannot create {}: {}", parent.display(), e),
            })?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// In-memory store (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                target_path TEXT NOT NULL,
                config_json TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                sequence INTEGER NOT NULL,
                persona TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'running',
                input_json TEXT NOT NULL,
                output_json TEXT,
                error_text TEXT,
                error_kind TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                UNIQUE(run_id, sequence)
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                persona TEXT NOT NULL,
                name TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(run_id, persona, name)
            );

            CREATE TABLE IF NOT EXISTS run_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                event_type TEXT NOT NULL,
                severity TEXT NOT NULL DEFAULT 'info',
                message TEXT NOT NULL,
                payload_json TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id, sequence);
            CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run_id);
            CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id, id);
            ",
        )?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Validate `config` and insert a `pending` run for it.
    pub fn create_run(&self, config: &RunConfig) -> Result<Run, StoreError> {
        let problems = config.problems();
        if !problems.is_empty() {
            return Err(StoreError::Validation(problems));
        }

        let now = Utc::now();
        let run_id = new_run_id(now);
        let config_json = serde_json::to_string(config)?;
        self.conn.execute(
            "INSERT INTO runs (run_id, target_path, config_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                config.target_path.to_string_lossy(),
                config_json,
                RunStatus::Pending.as_str(),
                ts(now)
            ],
        )?;

        Ok(Run {
            run_id,
            target_path: config.target_path.clone(),
            config: config.clone(),
            status: RunStatus::Pending,
            created_at: now,
            completed_at: None,
        })
    }

    /// `pending → running`, appending `start` in the same transaction.
    pub fn start_run(&self, run_id: &str) -> Result<Run, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let current = run_status(&tx, run_id)?;
        check_run_transition(run_id, current, RunStatus::Running)?;

        tx.execute(
            "UPDATE runs SET status = ?1 WHERE run_id = ?2",
            params![RunStatus::Running.as_str(), run_id],
        )?;
        let target: String = tx.query_row(
            "SELECT target_path FROM runs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        insert_event(
            &tx,
            run_id,
            EventType::Start,
            Severity::Info,
            "Run started",
            Some(&json!({ "target_path": target })),
        )?;
        tx.commit()?;

        self.require_run(run_id)
    }

    /// Move a run to a terminal status and append the matching terminal event.
    ///
    /// Allowed: `running → {succeeded, failed, rolled_back}` and
    /// `failed → rolled_back`.
    pub fn complete_run(
        &self,
        run_id: &str,
        status: RunStatus,
        detail: Option<&str>,
    ) -> Result<Run, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let current = run_status(&tx, run_id)?;
        if !status.is_terminal() {
            return Err(invalid_run_transition(run_id, current, status));
        }
        check_run_transition(run_id, current, status)?;

        let now = Utc::now();
        tx.execute(
            "UPDATE runs SET status = ?1, completed_at = ?2 WHERE run_id = ?3",
            params![status.as_str(), ts(now), run_id],
        )?;

        let (event_type, severity, headline) = match status {
            RunStatus::Succeeded => (EventType::Completed, Severity::Info, "Run succeeded"),
            RunStatus::Failed => (EventType::Failed, Severity::Warning, "Run failed"),
            _ => (EventType::RolledBack, Severity::Warning, "Run rolled back"),
        };
        let message = match detail {
            Some(detail) => format!("{}: {}", headline, truncate(detail, 500)),
            None => headline.to_string(),
        };
        insert_event(
            &tx,
            run_id,
            event_type,
            severity,
            &message,
            Some(&json!({ "from": current.as_str(), "to": status.as_str() })),
        )?;
        tx.commit()?;

        self.require_run(run_id)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, target_path, config_json, status, created_at, completed_at
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                RunRow::from_row,
            )
            .optional()?;
        row.map(RunRow::into_run).transpose()
    }

    fn require_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.get_run(run_id)?.ok_or_else(|| StoreError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, target_path, config_json, status, created_at, completed_at
             FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], RunRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    pub fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<Run>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, target_path, config_json, status, created_at, completed_at
             FROM runs WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![status.as_str()], RunRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    // ── Steps ─────────────────────────────────────────────────────────

    /// Insert a `running` step at `max(sequence) + 1` and append `step_started`.
    /// The run must be `running`.
    pub fn record_step(
        &self,
        run_id: &str,
        persona: Persona,
        attempt: u32,
        input_payload: &serde_json::Value,
    ) -> Result<Step, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let current = run_status(&tx, run_id)?;
        if current != RunStatus::Running {
            return Err(StoreError::InvalidTransition {
                entity: "run",
                id: run_id.to_string(),
                from: current.as_str().to_string(),
                to: "record_step".to_string(),
            });
        }

        let sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM steps WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        let now = Utc::now();
        tx.execute(
            "INSERT INTO steps (run_id, sequence, persona, attempt, status, input_json, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                sequence,
                persona.as_str(),
                attempt,
                StepStatus::Running.as_str(),
                serde_json::to_string(input_payload)?,
                ts(now)
            ],
        )?;
        let step_id = tx.last_insert_rowid();
        insert_event(
            &tx,
            run_id,
            EventType::StepStarted,
            Severity::Info,
            &format!("{} step started (attempt {})", persona, attempt),
            Some(&json!({
                "step_id": step_id,
                "sequence": sequence,
                "persona": persona,
                "attempt": attempt,
            })),
        )?;
        tx.commit()?;

        self.require_step(step_id)
    }

    /// Terminal transition for a step. A second call fails and leaves the
    /// stored outcome untouched.
    pub fn finish_step(&self, step_id: i64, outcome: &StepOutcome) -> Result<Step, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        write_step_outcome(&tx, step_id, outcome)?;
        tx.commit()?;

        self.require_step(step_id)
    }

    /// `finish_step` and `save_artifact` in one transaction, so a succeeded
    /// step never exists without its artifact.
    pub fn finish_step_with_artifact(
        &self,
        step_id: i64,
        outcome: &StepOutcome,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<(Step, Artifact), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let (run_id, persona) = write_step_outcome(&tx, step_id, outcome)?;
        let artifact = insert_artifact(&tx, &run_id, persona, name, payload)?;
        tx.commit()?;

        Ok((self.require_step(step_id)?, artifact))
    }

    pub fn get_step(&self, step_id: i64) -> Result<Option<Step>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", STEP_SELECT),
                params![step_id],
                StepRow::from_row,
            )
            .optional()?;
        row.map(StepRow::into_step).transpose()
    }

    fn require_step(&self, step_id: i64) -> Result<Step, StoreError> {
        self.get_step(step_id)?
            .ok_or(StoreError::StepNotFound { step_id })
    }

    pub fn list_steps(&self, run_id: &str) -> Result<Vec<Step>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE run_id = ?1 ORDER BY sequence ASC", STEP_SELECT))?;
        let rows = stmt
            .query_map(params![run_id], StepRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(StepRow::into_step).collect()
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    /// Write-once on `(run_id, persona, name)`.
    pub fn save_artifact(
        &self,
        run_id: &str,
        persona: Persona,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<Artifact, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        run_status(&tx, run_id)?;
        let artifact = insert_artifact(&tx, run_id, persona, name, payload)?;
        tx.commit()?;
        Ok(artifact)
    }

    pub fn list_artifacts(&self, run_id: &str) -> Result<Vec<Artifact>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, persona, name, payload_json, created_at
             FROM artifacts WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(ArtifactRow {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    persona: row.get(2)?,
                    name: row.get(3)?,
                    payload_json: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ArtifactRow::into_artifact).collect()
    }

    // ── Events ────────────────────────────────────────────────────────

    /// Append to the timeline. Succeeds iff the run exists.
    pub fn append_event(
        &self,
        run_id: &str,
        event_type: EventType,
        severity: Severity,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<RunEvent, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        run_status(&tx, run_id)?;
        let event = insert_event(&tx, run_id, event_type, severity, message, payload)?;
        tx.commit()?;
        Ok(event)
    }

    pub fn list_events(&self, run_id: &str) -> Result<Vec<RunEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, event_type, severity, message, payload_json, created_at
             FROM run_events WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(EventRow {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    event_type: row.get(2)?,
                    severity: row.get(3)?,
                    message: row.get(4)?,
                    payload_json: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Run plus ordered steps, artifacts and events.
    pub fn load_run_state(&self, run_id: &str) -> Result<RunState, StoreError> {
        let run = self.require_run(run_id)?;
        Ok(RunState {
            steps: self.list_steps(run_id)?,
            artifacts: self.list_artifacts(run_id)?,
            events: self.list_events(run_id)?,
            run,
        })
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

const STEP_SELECT: &str = "SELECT id, run_id, sequence, persona, attempt, status, input_json, \
     output_json, error_text, error_kind, started_at, completed_at FROM steps";

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(table: &'static str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            message: format!("bad timestamp '{}': {}", value, e),
        })
}

fn parse_column<T: FromStr<Err = String>>(table: &'static str, value: &str) -> Result<T, StoreError> {
    T::from_str(value).map_err(|message| StoreError::Corrupt { table, message })
}

fn parse_json<T: serde::de::DeserializeOwned>(
    table: &'static str,
    value: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(value).map_err(|e| StoreError::Corrupt {
        table,
        message: format!("bad JSON payload: {}", e),
    })
}

fn run_status(conn: &Connection, run_id: &str) -> Result<RunStatus, StoreError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM runs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;
    match status {
        Some(s) => parse_column("runs", &s),
        None => Err(StoreError::RunNotFound {
            run_id: run_id.to_string(),
        }),
    }
}

fn invalid_run_transition(run_id: &str, from: RunStatus, to: RunStatus) -> StoreError {
    StoreError::InvalidTransition {
        entity: "run",
        id: run_id.to_string(),
        from: from.as_str().to_string(),
        to: to.as_str().to_string(),
    }
}

fn check_run_transition(run_id: &str, from: RunStatus, to: RunStatus) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(invalid_run_transition(run_id, from, to))
    }
}

/// Write a terminal step outcome and its event. Returns the step's run and persona.
fn write_step_outcome(
    conn: &Connection,
    step_id: i64,
    outcome: &StepOutcome,
) -> Result<(String, Persona), StoreError> {
    let (run_id, persona, attempt, status): (String, String, u32, String) = conn
        .query_row(
            "SELECT run_id, persona, attempt, status FROM steps WHERE id = ?1",
            params![step_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?
        .ok_or(StoreError::StepNotFound { step_id })?;
    let persona = parse_column::<Persona>("steps", &persona)?;
    let current = parse_column::<StepStatus>("steps", &status)?;
    let next = outcome.status();
    if current.is_terminal() {
        return Err(StoreError::InvalidTransition {
            entity: "step",
            id: step_id.to_string(),
            from: current.as_str().to_string(),
            to: next.as_str().to_string(),
        });
    }

    let now = ts(Utc::now());
    match outcome {
        StepOutcome::Succeeded {
            output,
            tool_call_ids,
        } => {
            conn.execute(
                "UPDATE steps SET status = ?1, output_json = ?2, completed_at = ?3 WHERE id = ?4",
                params![next.as_str(), serde_json::to_string(output)?, now, step_id],
            )?;
            insert_event(
                conn,
                &run_id,
                EventType::StepCompleted,
                Severity::Info,
                &format!("{} step succeeded (attempt {})", persona, attempt),
                Some(&json!({
                    "step_id": step_id,
                    "persona": persona,
                    "attempt": attempt,
                    "tool_call_ids": tool_call_ids,
                })),
            )?;
        }
        StepOutcome::Failed { kind, message } => {
            conn.execute(
                "UPDATE steps SET status = ?1, error_text = ?2, error_kind = ?3, completed_at = ?4
                 WHERE id = ?5",
                params![next.as_str(), message, kind.as_str(), now, step_id],
            )?;
            insert_event(
                conn,
                &run_id,
                EventType::StepFailed,
                Severity::Warning,
                &format!(
                    "{} step failed (attempt {}, {}): {}",
                    persona,
                    attempt,
                    kind,
                    truncate(message, 300)
                ),
                Some(&json!({
                    "step_id": step_id,
                    "persona": persona,
                    "attempt": attempt,
                    "error_kind": kind,
                })),
            )?;
        }
    }
    Ok((run_id, persona))
}

fn insert_artifact(
    conn: &Connection,
    run_id: &str,
    persona: Persona,
    name: &str,
    payload: &serde_json::Value,
) -> Result<Artifact, StoreError> {
    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM artifacts WHERE run_id = ?1 AND persona = ?2 AND name = ?3",
        params![run_id, persona.as_str(), name],
        |row| row.get(0),
    )?;
    if exists > 0 {
        return Err(StoreError::DuplicateArtifact {
            run_id: run_id.to_string(),
            persona,
            name: name.to_string(),
        });
    }

    let now = Utc::now();
    conn.execute(
        "INSERT INTO artifacts (run_id, persona, name, payload_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            run_id,
            persona.as_str(),
            name,
            serde_json::to_string(payload)?,
            ts(now)
        ],
    )?;
    Ok(Artifact {
        id: conn.last_insert_rowid(),
        run_id: run_id.to_string(),
        persona,
        name: name.to_string(),
        payload: payload.clone(),
        created_at: now,
    })
}

fn insert_event(
    conn: &Connection,
    run_id: &str,
    event_type: EventType,
    severity: Severity,
    message: &str,
    payload: Option<&serde_json::Value>,
) -> Result<RunEvent, StoreError> {
    let now = Utc::now();
    let payload_json = payload.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO run_events (run_id, event_type, severity, message, payload_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            run_id,
            event_type.as_str(),
            severity.as_str(),
            message,
            payload_json,
            ts(now)
        ],
    )?;
    Ok(RunEvent {
        id: conn.last_insert_rowid(),
        run_id: run_id.to_string(),
        event_type,
        severity,
        message: message.to_string(),
        payload: payload.cloned(),
        created_at: now,
    })
}

/// Intermediate row struct for runs.
struct RunRow {
    run_id: String,
    target_path: String,
    config_json: String,
    status: String,
    created_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            target_path: row.get(1)?,
            config_json: row.get(2)?,
            status: row.get(3)?,
            created_at: row.get(4)?,
            completed_at: row.get(5)?,
        })
    }

    fn into_run(self) -> Result<Run, StoreError> {
        Ok(Run {
            status: parse_column("runs", &self.status)?,
            config: parse_json("runs", &self.config_json)?,
            created_at: parse_ts("runs", &self.created_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(|v| parse_ts("runs", v))
                .transpose()?,
            target_path: PathBuf::from(self.target_path),
            run_id: self.run_id,
        })
    }
}

/// Intermediate row struct for steps.
struct StepRow {
    id: i64,
    run_id: String,
    sequence: i64,
    persona: String,
    attempt: u32,
    status: String,
    input_json: String,
    output_json: Option<String>,
    error_text: Option<String>,
    error_kind: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            sequence: row.get(2)?,
            persona: row.get(3)?,
            attempt: row.get(4)?,
            status: row.get(5)?,
            input_json: row.get(6)?,
            output_json: row.get(7)?,
            error_text: row.get(8)?,
            error_kind: row.get(9)?,
            started_at: row.get(10)?,
            completed_at: row.get(11)?,
        })
    }

    fn into_step(self) -> Result<Step, StoreError> {
        Ok(Step {
            id: self.id,
            run_id: self.run_id,
            sequence: self.sequence,
            persona: parse_column("steps", &self.persona)?,
            attempt: self.attempt,
            status: parse_column("steps", &self.status)?,
            input_payload: parse_json("steps", &self.input_json)?,
            output_payload: self
                .output_json
                .as_deref()
                .map(|v| parse_json("steps", v))
                .transpose()?,
            error_text: self.error_text,
            error_kind: self
                .error_kind
                .as_deref()
                .map(|v| parse_column::<ErrorKind>("steps", v))
                .transpose()?,
            started_at: parse_ts("steps", &self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(|v| parse_ts("steps", v))
                .transpose()?,
        })
    }
}

/// Intermediate row struct for artifacts.
struct ArtifactRow {
    id: i64,
    run_id: String,
    persona: String,
    name: String,
    payload_json: String,
    created_at: String,
}

impl ArtifactRow {
    fn into_artifact(self) -> Result<Artifact, StoreError> {
        Ok(Artifact {
            id: self.id,
            run_id: self.run_id,
            persona: parse_column("artifacts", &self.persona)?,
            name: self.name,
            payload: parse_json("artifacts", &self.payload_json)?,
            created_at: parse_ts("artifacts", &self.created_at)?,
        })
    }
}

/// Intermediate row struct for run_events.
struct EventRow {
    id: i64,
    run_id: String,
    event_type: String,
    severity: String,
    message: String,
    payload_json: Option<String>,
    created_at: String,
}

impl EventRow {
    fn into_event(self) -> Result<RunEvent, StoreError> {
        Ok(RunEvent {
            id: self.id,
            run_id: self.run_id,
            event_type: parse_column("run_events", &self.event_type)?,
            severity: parse_column("run_events", &self.severity)?,
            message: self.message,
            payload: self
                .payload_json
                .as_deref()
                .map(|v| parse_json("run_events", v))
                .transpose()?,
            created_at: parse_ts("run_events", &self.created_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
