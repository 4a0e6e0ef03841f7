//! In-memory [`Store`] implementation, guarded by `parking_lot` locks.
//!
//! One lock per logical table rather than a single global lock, so
//! unrelated tables don't contend. Used by unit tests and as the
//! zero-dependency default engine backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::{
    ClaimedJob, JobRecord, PauseRecord, RunRecord, RunStatus, ScheduleRecord, StateEntry,
    StepStateRecord, StepStatus, Store, StoreError, WorkflowRecord,
};

struct KvCell {
    value: Value,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    workflows: RwLock<HashMap<String, WorkflowRecord>>,
    runs: RwLock<HashMap<Uuid, RunRecord>>,
    step_states: RwLock<HashMap<(Uuid, String), StepStateRecord>>,
    pauses: RwLock<HashMap<Uuid, PauseRecord>>,
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
    job_queue: RwLock<Vec<Uuid>>,
    schedules: RwLock<HashMap<String, ScheduleRecord>>,
    kv: RwLock<HashMap<(String, String), KvCell>>,
    job_seq: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_expired(entry: &KvCell, now: DateTime<Utc>) -> bool {
    matches!(entry.expires_at, Some(exp) if exp < now)
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_workflow(&self, record: WorkflowRecord) -> Result<(), StoreError> {
        self.workflows.write().insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<WorkflowRecord, StoreError> {
        self.workflows
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        Ok(self.workflows.read().values().cloned().collect())
    }

    async fn create_run(&self, workflow_id: &str, payload: Value) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        let record = RunRecord {
            id,
            workflow_id: workflow_id.to_string(),
            status: RunStatus::Pending,
            payload,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            last_output: None,
        };
        self.runs.write().insert(id, record);
        Ok(id)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<RunRecord, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        ts: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        run.status = status;
        if status.is_terminal() {
            run.completed_at = Some(ts);
        }
        if error.is_some() {
            run.error = error;
        }
        Ok(())
    }

    async fn set_run_last_output(&self, run_id: Uuid, output: Value) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        run.last_output = Some(output);
        Ok(())
    }

    async fn list_pending_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        Ok(self
            .runs
            .read()
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn count_active_runs(&self, workflow_id: &str) -> Result<u32, StoreError> {
        Ok(self
            .runs
            .read()
            .values()
            .filter(|r| {
                r.workflow_id == workflow_id
                    && matches!(r.status, RunStatus::Running | RunStatus::Paused)
            })
            .count() as u32)
    }

    async fn upsert_step_state(
        &self,
        state: StepStateRecord,
        expected_status: Option<StepStatus>,
    ) -> Result<(), StoreError> {
        let mut states = self.step_states.write();
        let key = (state.run_id, state.step_id.clone());
        if let Some(expected) = expected_status {
            if let Some(current) = states.get(&key) {
                if current.status != expected {
                    return Err(StoreError::ConcurrencyConflict {
                        run_id: state.run_id,
                        step_id: state.step_id,
                        expected: expected.to_string(),
                        actual: current.status.to_string(),
                    });
                }
            }
        }
        states.insert(key, state);
        Ok(())
    }

    async fn get_step_state(&self, run_id: Uuid, step_id: &str) -> Result<StepStateRecord, StoreError> {
        self.step_states
            .read()
            .get(&(run_id, step_id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::StepStateNotFound {
                run_id,
                step_id: step_id.to_string(),
            })
    }

    async fn list_step_states(&self, run_id: Uuid) -> Result<Vec<StepStateRecord>, StoreError> {
        Ok(self
            .step_states
            .read()
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn create_pause(&self, pause: PauseRecord) -> Result<(), StoreError> {
        self.pauses.write().insert(pause.token, pause);
        Ok(())
    }

    async fn get_pause(&self, token: Uuid) -> Result<PauseRecord, StoreError> {
        self.pauses
            .read()
            .get(&token)
            .cloned()
            .ok_or(StoreError::PauseNotFound(token))
    }

    async fn find_pauses_by_event(&self, event_name: &str) -> Result<Vec<PauseRecord>, StoreError> {
        Ok(self
            .pauses
            .read()
            .values()
            .filter(|p| p.event_name.as_deref() == Some(event_name))
            .cloned()
            .collect())
    }

    async fn find_pause_by_run(&self, run_id: Uuid) -> Result<Option<PauseRecord>, StoreError> {
        Ok(self
            .pauses
            .read()
            .values()
            .find(|p| p.run_id == run_id)
            .cloned())
    }

    async fn delete_pause(&self, token: Uuid) -> Result<(), StoreError> {
        self.pauses.write().remove(&token);
        Ok(())
    }

    async fn enqueue_job(&self, job: JobRecord) -> Result<(), StoreError> {
        let id = job.id;
        self.jobs.write().insert(id, job);
        self.job_queue.write().push(id);
        self.job_seq.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn claim_job(&self, _worker_id: &str, max_jobs: u32) -> Result<Vec<ClaimedJob>, StoreError> {
        let mut queue = self.job_queue.write();
        let jobs = self.jobs.read();
        let mut claimed = Vec::new();
        let take = (max_jobs as usize).min(queue.len());
        let drained: Vec<Uuid> = queue.drain(0..take).collect();
        drop(queue);
        for id in drained {
            if let Some(job) = jobs.get(&id) {
                claimed.push(ClaimedJob {
                    job: job.clone(),
                    claimed_at: Utc::now(),
                });
            }
        }
        Ok(claimed)
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.jobs
            .write()
            .remove(&job_id)
            .map(|_| ())
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn fail_job(&self, job_id: Uuid, _error: &str) -> Result<(), StoreError> {
        self.jobs
            .write()
            .remove(&job_id)
            .map(|_| ())
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn put_schedule(&self, schedule: ScheduleRecord) -> Result<(), StoreError> {
        self.schedules
            .write()
            .insert(schedule.trigger_id.clone(), schedule);
        Ok(())
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>, StoreError> {
        Ok(self
            .schedules
            .read()
            .values()
            .filter(|s| s.next_fire_at <= now)
            .cloned()
            .collect())
    }

    async fn update_schedule_next_fire(
        &self,
        trigger_id: &str,
        next_fire_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(s) = self.schedules.write().get_mut(trigger_id) {
            s.next_fire_at = next_fire_at;
        }
        Ok(())
    }

    async fn kv_get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let kv = self.kv.read();
        let entry = kv.get(&(namespace.to_string(), key.to_string()));
        match entry {
            Some(cell) if !is_expired(cell, Utc::now()) => Ok(Some(cell.value.clone())),
            _ => Ok(None),
        }
    }

    async fn kv_set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Option<std::time::Duration>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let expires_at = ttl.and_then(|d| chrono::Duration::from_std(d).ok()).map(|d| now + d);
        self.kv.write().insert(
            (namespace.to_string(), key.to_string()),
            KvCell {
                value,
                created_at: now,
                expires_at,
            },
        );
        Ok(())
    }

    async fn kv_delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.kv.write().remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn kv_incr(&self, namespace: &str, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut kv = self.kv.write();
        let now = Utc::now();
        let map_key = (namespace.to_string(), key.to_string());
        let current = match kv.get(&map_key) {
            Some(cell) if !is_expired(cell, now) => cell
                .value
                .as_i64()
                .ok_or_else(|| StoreError::TypeMismatch {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                })?,
            _ => 0,
        };
        let updated = current + delta;
        kv.insert(
            map_key,
            KvCell {
                value: Value::from(updated),
                created_at: now,
                expires_at: None,
            },
        );
        Ok(updated)
    }

    async fn kv_scan(&self, namespace: &str, prefix: &str) -> Result<Vec<StateEntry>, StoreError> {
        let now = Utc::now();
        Ok(self
            .kv
            .read()
            .iter()
            .filter(|((ns, k), cell)| ns == namespace && k.starts_with(prefix) && !is_expired(cell, now))
            .map(|((ns, k), cell)| StateEntry {
                namespace: ns.clone(),
                key: k.clone(),
                value: cell.value.clone(),
                created_at: cell.created_at,
                expires_at: cell.expires_at,
            })
            .collect())
    }

    async fn kv_reap_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut kv = self.kv.write();
        let before = kv.len();
        kv.retain(|_, cell| !is_expired(cell, now));
        Ok((before - kv.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_and_fetch_run() {
        let store = InMemoryStore::new();
        store
            .put_workflow(WorkflowRecord {
                id: "w1".into(),
                json: json!({"id": "w1", "steps": []}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let run_id = store.create_run("w1", json!({"x": 1})).await.unwrap();
        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.workflow_id, "w1");
        assert_eq!(run.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn step_state_cas_rejects_stale_expected() {
        let store = InMemoryStore::new();
        let run_id = Uuid::now_v7();
        let mut state = StepStateRecord::pending(run_id, "a");
        store.upsert_step_state(state.clone(), None).await.unwrap();

        state.status = StepStatus::Running;
        let err = store
            .upsert_step_state(state, Some(StepStatus::Succeeded))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn kv_ttl_expiry() {
        let store = InMemoryStore::new();
        store
            .kv_set("global", "k", json!(1), Some(std::time::Duration::from_millis(0)))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(store.kv_get("global", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn kv_incr_is_atomic_read_modify_write() {
        let store = InMemoryStore::new();
        assert_eq!(store.kv_incr("global", "counter", 1).await.unwrap(), 1);
        assert_eq!(store.kv_incr("global", "counter", 4).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn kv_incr_type_mismatch() {
        let store = InMemoryStore::new();
        store.kv_set("global", "s", json!("not a number"), None).await.unwrap();
        let err = store.kv_incr("global", "s", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn job_queue_fifo() {
        let store = InMemoryStore::new();
        let run_id = Uuid::now_v7();
        for step in ["a", "b"] {
            store
                .enqueue_job(JobRecord {
                    id: Uuid::now_v7(),
                    run_id,
                    workflow_id: "w1".into(),
                    step_id: step.into(),
                    attempt: 1,
                    enqueued_at: Utc::now(),
                    deadline: None,
                    background: false,
                })
                .await
                .unwrap();
        }
        let claimed = store.claim_job("worker-1", 10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].job.step_id, "a");
        assert_eq!(claimed[1].job.step_id, "b");
    }
}
