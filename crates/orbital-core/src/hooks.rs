//! Fires a run's `onSuccess`/`onFailure` hook exactly once, at its terminal
//! transition. A hook exception is logged and swallowed: it can never flip
//! a run's terminal status.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::store::{RunRecord, RunStatus, Store, StepStateRecord, StoreError};

/// Per-step summary included in a hook's final snapshot.
#[derive(Debug, Clone)]
pub struct StepSummary {
    pub step_id: String,
    pub status: String,
    pub attempt: u32,
    pub error: Option<String>,
}

impl From<StepStateRecord> for StepSummary {
    fn from(state: StepStateRecord) -> Self {
        Self {
            step_id: state.step_id,
            status: state.status.to_string(),
            attempt: state.attempt,
            error: state.error,
        }
    }
}

/// The final context snapshot handed to a lifecycle hook.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration: chrono::Duration,
    pub steps: Vec<StepSummary>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// Host-implemented lifecycle callback, analogous to [`crate::step::StepInvoker`]
/// but for run-level terminal transitions.
#[async_trait]
pub trait HookInvoker: Send + Sync {
    async fn on_success(&self, ctx: &HookContext);
    async fn on_failure(&self, ctx: &HookContext);
}

/// A `HookInvoker` that does nothing, used when a host registers no hooks.
pub struct NoopHooks;

#[async_trait]
impl HookInvoker for NoopHooks {
    async fn on_success(&self, _ctx: &HookContext) {}
    async fn on_failure(&self, _ctx: &HookContext) {}
}

/// Watches runs for their first terminal transition and fires the
/// corresponding hook exactly once.
pub struct HookRunner {
    store: Arc<dyn Store>,
    invoker: Arc<dyn HookInvoker>,
    fired: Mutex<HashSet<Uuid>>,
}

impl HookRunner {
    pub fn new(store: Arc<dyn Store>, invoker: Arc<dyn HookInvoker>) -> Self {
        Self { store, invoker, fired: Mutex::new(HashSet::new()) }
    }

    /// Call after any operation that may have moved `run_id` into a terminal
    /// status. A no-op if the run is still non-terminal or has already fired.
    pub async fn notify(&self, run_id: Uuid) -> Result<(), StoreError> {
        let run = self.store.get_run(run_id).await?;
        if !run.status.is_terminal() {
            return Ok(());
        }
        {
            let mut fired = self.fired.lock();
            if !fired.insert(run_id) {
                return Ok(());
            }
        }

        let ctx = self.build_context(&run).await?;
        match run.status {
            RunStatus::Completed => self.invoker.on_success(&ctx).await,
            RunStatus::Failed | RunStatus::Cancelled => self.invoker.on_failure(&ctx).await,
            RunStatus::Pending | RunStatus::Running | RunStatus::Paused => unreachable!(),
        }
        Ok(())
    }

    async fn build_context(&self, run: &RunRecord) -> Result<HookContext, StoreError> {
        let states = self.store.list_step_states(run.id).await?;
        let completed_at = run.completed_at.unwrap_or_else(Utc::now);
        Ok(HookContext {
            run_id: run.id,
            workflow_id: run.workflow_id.clone(),
            status: run.status,
            started_at: run.started_at,
            completed_at,
            duration: completed_at - run.started_at,
            steps: states.into_iter().map(StepSummary::from).collect(),
            output: run.last_output.clone(),
            error: run.error.clone(),
        })
    }

    /// Drops bookkeeping for runs that no longer exist (e.g. purged), so the
    /// fired-set doesn't grow without bound across a long-lived process.
    pub fn forget(&self, run_id: Uuid) {
        self.fired.lock().remove(&run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHooks {
        successes: AtomicUsize,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl HookInvoker for CountingHooks {
        async fn on_success(&self, _ctx: &HookContext) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_failure(&self, _ctx: &HookContext) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn fires_on_success_exactly_once() {
        let store = Arc::new(InMemoryStore::new());
        let hooks = Arc::new(CountingHooks { successes: AtomicUsize::new(0), failures: AtomicUsize::new(0) });
        let runner = HookRunner::new(store.clone(), hooks.clone());

        let run_id = store.create_run("w1", json!({})).await.unwrap();
        store
            .update_run_status(run_id, RunStatus::Completed, Utc::now(), None)
            .await
            .unwrap();

        runner.notify(run_id).await.unwrap();
        runner.notify(run_id).await.unwrap();
        runner.notify(run_id).await.unwrap();

        assert_eq!(hooks.successes.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_terminal_run_does_not_fire() {
        let store = Arc::new(InMemoryStore::new());
        let hooks = Arc::new(CountingHooks { successes: AtomicUsize::new(0), failures: AtomicUsize::new(0) });
        let runner = HookRunner::new(store.clone(), hooks.clone());

        let run_id = store.create_run("w1", json!({})).await.unwrap();
        runner.notify(run_id).await.unwrap();

        assert_eq!(hooks.successes.load(Ordering::SeqCst), 0);
        assert_eq!(hooks.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_and_cancellation_both_fire_on_failure() {
        let store = Arc::new(InMemoryStore::new());
        let hooks = Arc::new(CountingHooks { successes: AtomicUsize::new(0), failures: AtomicUsize::new(0) });
        let runner = HookRunner::new(store.clone(), hooks.clone());

        let run_id = store.create_run("w1", json!({})).await.unwrap();
        store
            .update_run_status(run_id, RunStatus::Failed, Utc::now(), Some("boom".into()))
            .await
            .unwrap();
        runner.notify(run_id).await.unwrap();

        let run_id2 = store.create_run("w1", json!({})).await.unwrap();
        store
            .update_run_status(run_id2, RunStatus::Cancelled, Utc::now(), None)
            .await
            .unwrap();
        runner.notify(run_id2).await.unwrap();

        assert_eq!(hooks.failures.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.successes.load(Ordering::SeqCst), 0);
    }
}
