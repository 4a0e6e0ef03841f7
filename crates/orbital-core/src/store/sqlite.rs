//! SQLite-backed [`Store`] implementation.
//!
//! Runs against an embedded, WAL-mode `sqlx::SqlitePool`. SQLite has no
//! `SELECT ... FOR UPDATE SKIP LOCKED`, so job claiming here uses a single
//! writer transaction that selects-then-deletes queued rows — acceptable
//! because the engine is single-process, not a shared multi-node cluster
//! (see DESIGN.md).

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

use super::{
    ClaimedJob, JobRecord, PauseKind, PauseRecord, RunRecord, RunStatus, ScheduleRecord,
    StateEntry, StepStateRecord, StepStatus, Store, StoreError, WorkflowRecord,
};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// An embedded SQLite-backed store. `path` is a filesystem path to the
/// database file (`:memory:` is valid but not shared across connections;
/// prefer [`InMemoryStore`](super::InMemoryStore) for tests).
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `path`, creating the file and running migrations if needed.
    /// Enables WAL journaling for concurrent readers alongside the single writer.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                error TEXT,
                last_output TEXT
            );

            CREATE TABLE IF NOT EXISTS step_states (
                run_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                status TEXT NOT NULL,
                output TEXT,
                error TEXT,
                started_at TEXT,
                completed_at TEXT,
                next_retry_at TEXT,
                PRIMARY KEY (run_id, step_id)
            );

            CREATE TABLE IF NOT EXISTS pauses (
                token TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                event_name TEXT,
                created_at TEXT NOT NULL,
                expires_at TEXT
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                enqueued_at TEXT NOT NULL,
                deadline TEXT,
                background INTEGER NOT NULL,
                claimed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS schedules (
                trigger_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                cron TEXT NOT NULL,
                next_fire_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS state_kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                PRIMARY KEY (namespace, key)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_ts(&s))
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self, record))]
    async fn put_workflow(&self, record: WorkflowRecord) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO workflows (id, json, created_at) VALUES (?, ?, ?)")
            .bind(&record.id)
            .bind(record.json.to_string())
            .bind(record.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<WorkflowRecord, StoreError> {
        let row = sqlx::query("SELECT id, json, created_at FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))?;
        Ok(WorkflowRecord {
            id: row.get("id"),
            json: serde_json::from_str(row.get::<String, _>("json").as_str())?,
            created_at: parse_ts(row.get::<String, _>("created_at").as_str()),
        })
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let rows = sqlx::query("SELECT id, json, created_at FROM workflows")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(WorkflowRecord {
                    id: row.get("id"),
                    json: serde_json::from_str(row.get::<String, _>("json").as_str())?,
                    created_at: parse_ts(row.get::<String, _>("created_at").as_str()),
                })
            })
            .collect()
    }

    #[instrument(skip(self, payload))]
    async fn create_run(&self, workflow_id: &str, payload: Value) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO runs (id, workflow_id, status, payload, started_at, completed_at, error, last_output)
             VALUES (?, ?, ?, ?, ?, NULL, NULL, NULL)",
        )
        .bind(id.to_string())
        .bind(workflow_id)
        .bind(RunStatus::Pending.to_string())
        .bind(payload.to_string())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<RunRecord, StoreError> {
        let row = sqlx::query(
            "SELECT id, workflow_id, status, payload, started_at, completed_at, error, last_output
             FROM runs WHERE id = ?",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::RunNotFound(run_id))?;
        row_to_run(row)
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        ts: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let completed_at = status.is_terminal().then(|| ts.to_rfc3339());
        sqlx::query(
            "UPDATE runs SET status = ?, completed_at = COALESCE(?, completed_at), error = COALESCE(?, error)
             WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(completed_at)
        .bind(error)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_run_last_output(&self, run_id: Uuid, output: Value) -> Result<(), StoreError> {
        sqlx::query("UPDATE runs SET last_output = ? WHERE id = ?")
            .bind(output.to_string())
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_pending_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, status, payload, started_at, completed_at, error, last_output
             FROM runs WHERE status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_run).collect()
    }

    async fn count_active_runs(&self, workflow_id: &str) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) as n FROM runs WHERE workflow_id = ? AND status IN ('running', 'paused')",
        )
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as u32)
    }

    #[instrument(skip(self, state))]
    async fn upsert_step_state(
        &self,
        state: StepStateRecord,
        expected_status: Option<StepStatus>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(expected) = expected_status {
            let current = sqlx::query("SELECT status FROM step_states WHERE run_id = ? AND step_id = ?")
                .bind(state.run_id.to_string())
                .bind(&state.step_id)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(row) = current {
                let actual: String = row.get("status");
                if actual != expected.to_string() {
                    return Err(StoreError::ConcurrencyConflict {
                        run_id: state.run_id,
                        step_id: state.step_id,
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }
        }

        sqlx::query(
            "INSERT INTO step_states (run_id, step_id, attempt, status, output, error, started_at, completed_at, next_retry_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(run_id, step_id) DO UPDATE SET
                attempt = excluded.attempt, status = excluded.status, output = excluded.output,
                error = excluded.error, started_at = excluded.started_at,
                completed_at = excluded.completed_at, next_retry_at = excluded.next_retry_at",
        )
        .bind(state.run_id.to_string())
        .bind(&state.step_id)
        .bind(state.attempt as i64)
        .bind(state.status.to_string())
        .bind(state.output.map(|v| v.to_string()))
        .bind(state.error)
        .bind(state.started_at.map(|t| t.to_rfc3339()))
        .bind(state.completed_at.map(|t| t.to_rfc3339()))
        .bind(state.next_retry_at.map(|t| t.to_rfc3339()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_step_state(&self, run_id: Uuid, step_id: &str) -> Result<StepStateRecord, StoreError> {
        let row = sqlx::query(
            "SELECT run_id, step_id, attempt, status, output, error, started_at, completed_at, next_retry_at
             FROM step_states WHERE run_id = ? AND step_id = ?",
        )
        .bind(run_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::StepStateNotFound {
            run_id,
            step_id: step_id.to_string(),
        })?;
        row_to_step_state(row)
    }

    async fn list_step_states(&self, run_id: Uuid) -> Result<Vec<StepStateRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT run_id, step_id, attempt, status, output, error, started_at, completed_at, next_retry_at
             FROM step_states WHERE run_id = ?",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_step_state).collect()
    }

    async fn create_pause(&self, pause: PauseRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pauses (token, run_id, step_id, kind, event_name, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(pause.token.to_string())
        .bind(pause.run_id.to_string())
        .bind(&pause.step_id)
        .bind(pause_kind_str(pause.kind))
        .bind(pause.event_name)
        .bind(pause.created_at.to_rfc3339())
        .bind(pause.expires_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_pause(&self, token: Uuid) -> Result<PauseRecord, StoreError> {
        let row = sqlx::query(
            "SELECT token, run_id, step_id, kind, event_name, created_at, expires_at FROM pauses WHERE token = ?",
        )
        .bind(token.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::PauseNotFound(token))?;
        row_to_pause(row)
    }

    async fn find_pauses_by_event(&self, event_name: &str) -> Result<Vec<PauseRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT token, run_id, step_id, kind, event_name, created_at, expires_at FROM pauses WHERE event_name = ?",
        )
        .bind(event_name)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_pause).collect()
    }

    async fn find_pause_by_run(&self, run_id: Uuid) -> Result<Option<PauseRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT token, run_id, step_id, kind, event_name, created_at, expires_at FROM pauses WHERE run_id = ?",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_pause).transpose()
    }

    async fn delete_pause(&self, token: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pauses WHERE token = ?")
            .bind(token.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn enqueue_job(&self, job: JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO jobs (id, run_id, workflow_id, step_id, attempt, enqueued_at, deadline, background, claimed)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(job.id.to_string())
        .bind(job.run_id.to_string())
        .bind(&job.workflow_id)
        .bind(&job.step_id)
        .bind(job.attempt as i64)
        .bind(job.enqueued_at.to_rfc3339())
        .bind(job.deadline.map(|t| t.to_rfc3339()))
        .bind(job.background as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Single-writer-transaction claim: the SQLite analogue of `SELECT ... FOR
    /// UPDATE SKIP LOCKED`, since SQLite serializes writers anyway.
    async fn claim_job(&self, _worker_id: &str, max_jobs: u32) -> Result<Vec<ClaimedJob>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT id, run_id, workflow_id, step_id, attempt, enqueued_at, deadline, background
             FROM jobs WHERE claimed = 0 ORDER BY enqueued_at ASC LIMIT ?",
        )
        .bind(max_jobs as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        let now = Utc::now();
        for row in rows {
            let id: String = row.get("id");
            sqlx::query("UPDATE jobs SET claimed = 1 WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            claimed.push(ClaimedJob {
                job: row_to_job(row)?,
                claimed_at: now,
            });
        }
        tx.commit().await?;
        Ok(claimed)
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, _error: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn put_schedule(&self, schedule: ScheduleRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO schedules (trigger_id, workflow_id, cron, next_fire_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&schedule.trigger_id)
        .bind(&schedule.workflow_id)
        .bind(&schedule.cron)
        .bind(schedule.next_fire_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>, StoreError> {
        let rows = sqlx::query("SELECT trigger_id, workflow_id, cron, next_fire_at FROM schedules WHERE next_fire_at <= ?")
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| ScheduleRecord {
                trigger_id: row.get("trigger_id"),
                workflow_id: row.get("workflow_id"),
                cron: row.get("cron"),
                next_fire_at: parse_ts(row.get::<String, _>("next_fire_at").as_str()),
            })
            .collect())
    }

    async fn update_schedule_next_fire(
        &self,
        trigger_id: &str,
        next_fire_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE schedules SET next_fire_at = ? WHERE trigger_id = ?")
            .bind(next_fire_at.to_rfc3339())
            .bind(trigger_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn kv_get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT value, expires_at FROM state_kv WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let expires_at: Option<String> = row.get("expires_at");
                if let Some(exp) = opt_ts(expires_at) {
                    if exp < Utc::now() {
                        return Ok(None);
                    }
                }
                Ok(Some(serde_json::from_str(row.get::<String, _>("value").as_str())?))
            }
        }
    }

    async fn kv_set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let expires_at = ttl
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| (now + d).to_rfc3339());
        sqlx::query(
            "INSERT INTO state_kv (namespace, key, value, created_at, expires_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(namespace)
        .bind(key)
        .bind(value.to_string())
        .bind(now.to_rfc3339())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn kv_delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM state_kv WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn kv_incr(&self, namespace: &str, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT value, expires_at FROM state_kv WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

        let now = Utc::now();
        let current = match row {
            Some(row) => {
                let expires_at: Option<String> = row.get("expires_at");
                if opt_ts(expires_at).map(|e| e < now).unwrap_or(false) {
                    0
                } else {
                    let raw: String = row.get("value");
                    let v: Value = serde_json::from_str(&raw)?;
                    v.as_i64().ok_or_else(|| StoreError::TypeMismatch {
                        namespace: namespace.to_string(),
                        key: key.to_string(),
                    })?
                }
            }
            None => 0,
        };
        let updated = current + delta;

        sqlx::query(
            "INSERT INTO state_kv (namespace, key, value, created_at, expires_at) VALUES (?, ?, ?, ?, NULL)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, expires_at = NULL",
        )
        .bind(namespace)
        .bind(key)
        .bind(Value::from(updated).to_string())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn kv_scan(&self, namespace: &str, prefix: &str) -> Result<Vec<StateEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT namespace, key, value, created_at, expires_at FROM state_kv
             WHERE namespace = ? AND key LIKE ? || '%'",
        )
        .bind(namespace)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        let now = Utc::now();
        rows.into_iter()
            .filter(|row| {
                let expires_at: Option<String> = row.get("expires_at");
                !opt_ts(expires_at).map(|e| e < now).unwrap_or(false)
            })
            .map(|row| {
                Ok(StateEntry {
                    namespace: row.get("namespace"),
                    key: row.get("key"),
                    value: serde_json::from_str(row.get::<String, _>("value").as_str())?,
                    created_at: parse_ts(row.get::<String, _>("created_at").as_str()),
                    expires_at: opt_ts(row.get("expires_at")),
                })
            })
            .collect()
    }

    async fn kv_reap_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM state_kv WHERE expires_at IS NOT NULL AND expires_at < ?")
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn pause_kind_str(kind: PauseKind) -> &'static str {
    match kind {
        PauseKind::Human => "human",
        PauseKind::Event => "event",
        PauseKind::Sleep => "sleep",
    }
}

fn parse_run_status(s: &str) -> RunStatus {
    match s {
        "pending" => RunStatus::Pending,
        "running" => RunStatus::Running,
        "paused" => RunStatus::Paused,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        _ => RunStatus::Cancelled,
    }
}

fn parse_step_status(s: &str) -> StepStatus {
    match s {
        "pending" => StepStatus::Pending,
        "ready" => StepStatus::Ready,
        "running" => StepStatus::Running,
        "succeeded" => StepStatus::Succeeded,
        "failed" => StepStatus::Failed,
        "skipped" => StepStatus::Skipped,
        "paused" => StepStatus::Paused,
        _ => StepStatus::Cancelled,
    }
}

fn parse_pause_kind(s: &str) -> PauseKind {
    match s {
        "human" => PauseKind::Human,
        "event" => PauseKind::Event,
        _ => PauseKind::Sleep,
    }
}

fn row_to_run(row: sqlx::sqlite::SqliteRow) -> Result<RunRecord, StoreError> {
    let payload: String = row.get("payload");
    let last_output: Option<String> = row.get("last_output");
    Ok(RunRecord {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str()).map_err(|e| StoreError::Database(e.to_string()))?,
        workflow_id: row.get("workflow_id"),
        status: parse_run_status(row.get::<String, _>("status").as_str()),
        payload: serde_json::from_str(&payload)?,
        started_at: parse_ts(row.get::<String, _>("started_at").as_str()),
        completed_at: opt_ts(row.get("completed_at")),
        error: row.get("error"),
        last_output: last_output.map(|s| serde_json::from_str(&s)).transpose()?,
    })
}

fn row_to_step_state(row: sqlx::sqlite::SqliteRow) -> Result<StepStateRecord, StoreError> {
    let output: Option<String> = row.get("output");
    Ok(StepStateRecord {
        run_id: Uuid::parse_str(row.get::<String, _>("run_id").as_str()).map_err(|e| StoreError::Database(e.to_string()))?,
        step_id: row.get("step_id"),
        attempt: row.get::<i64, _>("attempt") as u32,
        status: parse_step_status(row.get::<String, _>("status").as_str()),
        output: output.map(|s| serde_json::from_str(&s)).transpose()?,
        error: row.get("error"),
        started_at: opt_ts(row.get("started_at")),
        completed_at: opt_ts(row.get("completed_at")),
        next_retry_at: opt_ts(row.get("next_retry_at")),
    })
}

fn row_to_pause(row: sqlx::sqlite::SqliteRow) -> Result<PauseRecord, StoreError> {
    Ok(PauseRecord {
        token: Uuid::parse_str(row.get::<String, _>("token").as_str()).map_err(|e| StoreError::Database(e.to_string()))?,
        run_id: Uuid::parse_str(row.get::<String, _>("run_id").as_str()).map_err(|e| StoreError::Database(e.to_string()))?,
        step_id: row.get("step_id"),
        kind: parse_pause_kind(row.get::<String, _>("kind").as_str()),
        created_at: parse_ts(row.get::<String, _>("created_at").as_str()),
        expires_at: opt_ts(row.get("expires_at")),
        event_name: row.get("event_name"),
    })
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<JobRecord, StoreError> {
    Ok(JobRecord {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str()).map_err(|e| StoreError::Database(e.to_string()))?,
        run_id: Uuid::parse_str(row.get::<String, _>("run_id").as_str()).map_err(|e| StoreError::Database(e.to_string()))?,
        workflow_id: row.get("workflow_id"),
        step_id: row.get("step_id"),
        attempt: row.get::<i64, _>("attempt") as u32,
        enqueued_at: parse_ts(row.get::<String, _>("enqueued_at").as_str()),
        deadline: opt_ts(row.get("deadline")),
        background: row.get::<i64, _>("background") != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn temp_store() -> SqliteStore {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("orbital-test-{}.sqlite3", Uuid::now_v7()));
        SqliteStore::connect(path.to_str().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn migrate_and_round_trip_workflow() {
        let store = temp_store().await;
        store
            .put_workflow(WorkflowRecord {
                id: "w1".into(),
                json: json!({"id": "w1"}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let fetched = store.get_workflow("w1").await.unwrap();
        assert_eq!(fetched.id, "w1");
    }

    #[tokio::test]
    async fn run_status_transition_persists() {
        let store = temp_store().await;
        store
            .put_workflow(WorkflowRecord {
                id: "w1".into(),
                json: json!({}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let run_id = store.create_run("w1", json!({})).await.unwrap();
        store
            .update_run_status(run_id, RunStatus::Completed, Utc::now(), None)
            .await
            .unwrap();
        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn kv_roundtrip_and_incr() {
        let store = temp_store().await;
        store.kv_set("global", "k", json!("v"), None).await.unwrap();
        assert_eq!(store.kv_get("global", "k").await.unwrap(), Some(json!("v")));
        assert_eq!(store.kv_incr("global", "counter", 3).await.unwrap(), 3);
        assert_eq!(store.kv_incr("global", "counter", 2).await.unwrap(), 5);
    }
}
