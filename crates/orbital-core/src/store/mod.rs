//! Durable persistence: workflows, runs, step states, pauses, and the state KV table.
//!
//! Two implementations share the [`Store`] trait: [`InMemoryStore`] (used in
//! unit tests and as a zero-dependency default) and [`SqliteStore`] (an
//! embedded, WAL-mode `sqlx::SqlitePool`-backed implementation for
//! process-durable deployments).

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by any [`Store`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("step state not found: run={run_id} step={step_id}")]
    StepStateNotFound { run_id: Uuid, step_id: String },

    #[error("pause not found: {0}")]
    PauseNotFound(Uuid),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("concurrency conflict updating step state: run={run_id} step={step_id} expected status {expected}, found {actual}")]
    ConcurrencyConflict {
        run_id: Uuid,
        step_id: String,
        expected: String,
        actual: String,
    },

    #[error("type mismatch: key {namespace}:{key} is not numeric")]
    TypeMismatch { namespace: String, key: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Status of a [`crate::runstate::Run`], persisted in the `runs` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Status of a single step within a run, persisted in `step_states`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Paused,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A registered workflow definition, stored as its raw JSON plus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub json: Value,
    pub created_at: DateTime<Utc>,
}

/// A run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub workflow_id: String,
    pub status: RunStatus,
    pub payload: Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub last_output: Option<Value>,
}

/// A step-state row, keyed by `(run_id, step_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStateRecord {
    pub run_id: Uuid,
    pub step_id: String,
    pub attempt: u32,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl StepStateRecord {
    pub fn pending(run_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            attempt: 0,
            status: StepStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
            next_retry_at: None,
        }
    }
}

/// Kind of external event a [`PauseRecord`] awaits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseKind {
    Human,
    Event,
    Sleep,
}

/// A durable pause, created while a step awaits an external resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseRecord {
    pub token: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub kind: PauseKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub event_name: Option<String>,
}

/// A dispatcher job row: one attempt at executing a ready step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub workflow_id: String,
    pub step_id: String,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub background: bool,
}

/// A job claimed by a dispatcher worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: JobRecord,
    pub claimed_at: DateTime<Utc>,
}

/// Outcome of a scheduled cron trigger's next fire computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub trigger_id: String,
    pub workflow_id: String,
    pub cron: String,
    pub next_fire_at: DateTime<Utc>,
}

/// A raw `state_kv` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub namespace: String,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Durable persistence contract. All multi-row operations are transactional;
/// single-row writes are atomic compare-and-set where noted.
#[async_trait]
pub trait Store: Send + Sync {
    // -- workflows --
    async fn put_workflow(&self, record: WorkflowRecord) -> Result<(), StoreError>;
    async fn get_workflow(&self, id: &str) -> Result<WorkflowRecord, StoreError>;
    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError>;

    // -- runs --
    async fn create_run(&self, workflow_id: &str, payload: Value) -> Result<Uuid, StoreError>;
    async fn get_run(&self, run_id: Uuid) -> Result<RunRecord, StoreError>;
    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        ts: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), StoreError>;
    async fn set_run_last_output(&self, run_id: Uuid, output: Value) -> Result<(), StoreError>;
    async fn list_pending_runs(&self) -> Result<Vec<RunRecord>, StoreError>;
    async fn count_active_runs(&self, workflow_id: &str) -> Result<u32, StoreError>;

    // -- step states --
    /// Transactional compare-and-set: succeeds only if the stored status
    /// equals `expected_status` (when given) — an optimistic-concurrency
    /// append pattern.
    async fn upsert_step_state(
        &self,
        state: StepStateRecord,
        expected_status: Option<StepStatus>,
    ) -> Result<(), StoreError>;
    async fn get_step_state(&self, run_id: Uuid, step_id: &str) -> Result<StepStateRecord, StoreError>;
    async fn list_step_states(&self, run_id: Uuid) -> Result<Vec<StepStateRecord>, StoreError>;

    // -- pauses --
    async fn create_pause(&self, pause: PauseRecord) -> Result<(), StoreError>;
    async fn get_pause(&self, token: Uuid) -> Result<PauseRecord, StoreError>;
    async fn find_pauses_by_event(&self, event_name: &str) -> Result<Vec<PauseRecord>, StoreError>;
    async fn find_pause_by_run(&self, run_id: Uuid) -> Result<Option<PauseRecord>, StoreError>;
    async fn delete_pause(&self, token: Uuid) -> Result<(), StoreError>;

    // -- jobs (dispatcher queue) --
    async fn enqueue_job(&self, job: JobRecord) -> Result<(), StoreError>;
    async fn claim_job(&self, worker_id: &str, max_jobs: u32) -> Result<Vec<ClaimedJob>, StoreError>;
    async fn complete_job(&self, job_id: Uuid) -> Result<(), StoreError>;
    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<(), StoreError>;

    // -- schedules (cron) --
    async fn put_schedule(&self, schedule: ScheduleRecord) -> Result<(), StoreError>;
    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>, StoreError>;
    async fn update_schedule_next_fire(
        &self,
        trigger_id: &str,
        next_fire_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // -- state kv --
    async fn kv_get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError>;
    async fn kv_set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Option<std::time::Duration>,
    ) -> Result<(), StoreError>;
    async fn kv_delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
    /// Atomic read-modify-write; returns the new value.
    async fn kv_incr(&self, namespace: &str, key: &str, delta: i64) -> Result<i64, StoreError>;
    async fn kv_scan(&self, namespace: &str, prefix: &str) -> Result<Vec<StateEntry>, StoreError>;
    /// Deletes all entries with `expires_at < now`; returns count removed.
    async fn kv_reap_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}
