//! The process-wide ingress facade: the single entry point a host
//! application calls into. Owns the shared [`WorkflowRegistry`], [`Store`],
//! [`Clock`], [`Dispatcher`], [`TriggerRegistry`], and [`HookRunner`], and
//! drives a background tick loop that claims ready jobs, drains clock
//! wake-ups, and fires due cron schedules.
//!
//! A `tokio::sync::watch` bool signals the background task to stop, and
//! `stop()` waits up to a grace period before giving up on a graceful join.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use cron::Schedule as CronSchedule;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::definition::WorkflowDef;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::EngineError;
use crate::hooks::{HookInvoker, HookRunner, NoopHooks};
use crate::registry::WorkflowRegistry;
use crate::statekv::StateKv;
use crate::step::StepInvoker;
use crate::store::{RunRecord, RunStatus, StepStateRecord, StepStatus, Store};
use crate::trigger::TriggerRegistry;

/// Tuning knobs for the background tick loop; everything step/retry-level
/// lives on [`DispatcherConfig`] instead.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval: StdDuration,
    pub shutdown_grace: StdDuration,
    pub dispatcher: DispatcherConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: StdDuration::from_millis(200),
            shutdown_grace: StdDuration::from_secs(5),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

/// A run plus its per-step states, returned by [`Engine::inspect`].
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub run: RunRecord,
    pub steps: Vec<StepStateRecord>,
}

/// The engine's running state: `Stopped` until `start()`, `Running` while the
/// tick loop is alive, never reused once stopped.
struct Handle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Process-wide facade over the workflow runtime.
pub struct Engine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    workflows: Arc<WorkflowRegistry>,
    dispatcher: Arc<Dispatcher>,
    triggers: Arc<TriggerRegistry>,
    hooks: Arc<HookRunner>,
    state_kv: StateKv,
    config: EngineConfig,
    accepting_triggers: AtomicBool,
    active_runs: Arc<SyncMutex<std::collections::HashSet<Uuid>>>,
    handle: AsyncMutex<Option<Handle>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        invoker: Arc<dyn StepInvoker>,
        hooks: Arc<dyn HookInvoker>,
        config: EngineConfig,
    ) -> Self {
        let workflows = Arc::new(WorkflowRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            clock.clone(),
            invoker,
            workflows.clone(),
            config.dispatcher.clone(),
        ));
        let triggers = Arc::new(TriggerRegistry::new(store.clone(), clock.clone(), workflows.clone()));
        let hook_runner = Arc::new(HookRunner::new(store.clone(), hooks));
        let state_kv = StateKv::new(store.clone());

        Self {
            store,
            clock,
            workflows,
            dispatcher,
            triggers,
            hooks: hook_runner,
            state_kv,
            config,
            accepting_triggers: AtomicBool::new(true),
            active_runs: Arc::new(SyncMutex::new(std::collections::HashSet::new())),
            handle: AsyncMutex::new(None),
        }
    }

    /// Convenience constructor matching [`HookInvoker`]-less hosts.
    pub fn without_hooks(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        invoker: Arc<dyn StepInvoker>,
        config: EngineConfig,
    ) -> Self {
        Self::new(store, clock, invoker, Arc::new(NoopHooks), config)
    }

    pub fn state(&self) -> &StateKv {
        &self.state_kv
    }

    /// `Register`: validates and stores `def`, making it runnable.
    #[instrument(skip(self, def_json))]
    pub async fn register(&self, def_json: &Value) -> Result<Arc<WorkflowDef>, EngineError> {
        let def = WorkflowDef::from_json(def_json)?;
        self.store
            .put_workflow(crate::store::WorkflowRecord {
                id: def.id.clone(),
                json: def_json.clone(),
                created_at: def.created_at,
            })
            .await?;
        let def = self.workflows.insert(def);
        self.triggers.register_workflow_triggers(&def).await?;
        Ok(def)
    }

    /// `Start`: begins accepting triggers and spawns the background tick loop.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }
        self.accepting_triggers.store(true, AtomicOrdering::SeqCst);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let dispatcher = self.dispatcher.clone();
        let triggers = self.triggers.clone();
        let store = self.store.clone();
        let clock = self.clock.clone();
        let hooks = self.hooks.clone();
        let active_runs = self.active_runs.clone();
        let interval = self.config.tick_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = tick_once(&dispatcher, &triggers, &store, &clock, &hooks, &active_runs).await {
                            warn!(error = %err, "engine tick failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *handle = Some(Handle { shutdown_tx, task });
        info!("engine started");
        Ok(())
    }

    /// `Stop`: stops accepting new triggers, signals the tick loop to halt,
    /// waits up to `shutdown_grace` for it to drain in-flight work, then
    /// returns. Exceeding the grace period aborts the task outright.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.accepting_triggers.store(false, AtomicOrdering::SeqCst);
        let mut guard = self.handle.lock().await;
        let Some(handle) = guard.take() else {
            return Ok(());
        };
        let _ = handle.shutdown_tx.send(true);
        match tokio::time::timeout(self.config.shutdown_grace, handle.task).await {
            Ok(Ok(())) => {}
            Ok(Err(join_err)) => warn!(error = %join_err, "engine tick task panicked"),
            Err(_) => warn!("engine shutdown grace period elapsed; tick task abandoned"),
        }
        info!("engine stopped");
        Ok(())
    }

    /// `Trigger` (webhook variant): routes `HandleWebhook` and tracks the
    /// resulting run for hook notification.
    pub async fn trigger_webhook(
        &self,
        path: &str,
        method: &str,
        headers: &HashMap<String, String>,
        body: Value,
    ) -> Result<Uuid, EngineError> {
        self.require_accepting()?;
        let run_id = self.triggers.handle_webhook(path, method, headers, body).await?;
        self.track(run_id);
        Ok(run_id)
    }

    /// `Trigger` (manual variant).
    pub async fn trigger_manual(&self, workflow_id: &str, payload: Value) -> Result<Uuid, EngineError> {
        self.require_accepting()?;
        let run_id = self.triggers.handle_manual(workflow_id, payload).await?;
        self.track(run_id);
        Ok(run_id)
    }

    /// `PublishEvent`.
    pub async fn publish_event(&self, name: &str, payload: Value) -> Result<Vec<Uuid>, EngineError> {
        self.require_accepting()?;
        let resumed = self.triggers.publish_event(name, payload).await?;
        for run_id in &resumed {
            self.track(*run_id);
        }
        Ok(resumed)
    }

    /// `Resume`.
    pub async fn resume(&self, token: Uuid, payload: Value) -> Result<Uuid, EngineError> {
        self.require_accepting()?;
        let run_id = self.triggers.resume(token, payload).await?;
        self.track(run_id);
        Ok(run_id)
    }

    /// `Inspect`: returns the run plus every step's current state.
    pub async fn inspect(&self, run_id: Uuid) -> Result<RunSnapshot, EngineError> {
        let run = self.store.get_run(run_id).await?;
        let steps = self.store.list_step_states(run_id).await?;
        Ok(RunSnapshot { run, steps })
    }

    /// `CancelRun`: marks the run (and every non-terminal step in it)
    /// cancelled, deletes any outstanding pause, and fires `onFailure`.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }

        for state in self.store.list_step_states(run_id).await? {
            if state.status.is_terminal() {
                continue;
            }
            let mut next = state.clone();
            next.status = StepStatus::Cancelled;
            next.completed_at = Some(self.clock.now());
            self.store.upsert_step_state(next, Some(state.status)).await?;
        }

        if let Some(pause) = self.store.find_pause_by_run(run_id).await? {
            self.store.delete_pause(pause.token).await?;
        }

        self.store
            .update_run_status(run_id, RunStatus::Cancelled, self.clock.now(), Some("cancelled by operator".into()))
            .await?;
        self.hooks.notify(run_id).await?;
        self.forget(run_id);
        Ok(())
    }

    fn require_accepting(&self) -> Result<(), EngineError> {
        if self.accepting_triggers.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Cancelled)
        }
    }

    fn track(&self, run_id: Uuid) {
        self.active_runs.lock().insert(run_id);
    }

    fn forget(&self, run_id: Uuid) {
        self.active_runs.lock().remove(&run_id);
        self.hooks.forget(run_id);
    }

}

/// One iteration of the background loop: run dispatcher jobs, drain clock
/// wake-ups, fire due cron schedules, and notify hooks for any run that just
/// went terminal.
async fn tick_once(
    dispatcher: &Arc<Dispatcher>,
    triggers: &Arc<TriggerRegistry>,
    store: &Arc<dyn Store>,
    clock: &Arc<dyn Clock>,
    hooks: &Arc<HookRunner>,
    active_runs: &Arc<SyncMutex<std::collections::HashSet<Uuid>>>,
) -> Result<(), EngineError> {
    dispatcher.tick().await?;
    dispatcher.drain_wakeups().await?;
    dispatcher.promote_queued_runs().await?;

    let due = store.list_due_schedules(clock.now()).await?;
    for schedule in due {
        let run_id = triggers.handle_cron_fire(&schedule.trigger_id).await?;
        active_runs.lock().insert(run_id);

        let next_fire_at = CronSchedule::from_str(&schedule.cron)
            .ok()
            .and_then(|s| s.after(&clock.now()).next())
            .unwrap_or_else(|| clock.now() + chrono::Duration::minutes(1));
        store
            .update_schedule_next_fire(&schedule.trigger_id, next_fire_at)
            .await?;
    }

    let candidates: Vec<Uuid> = active_runs.lock().iter().copied().collect();
    for run_id in candidates {
        hooks.notify(run_id).await?;
        if let Ok(run) = store.get_run(run_id).await {
            if run.status.is_terminal() {
                active_runs.lock().remove(&run_id);
                hooks.forget(run_id);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::step::{StepContext, StepError, StepOutcome};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoInvoker;

    #[async_trait]
    impl StepInvoker for EchoInvoker {
        async fn invoke(&self, _ctx: &StepContext, input: &Value) -> Result<StepOutcome, StepError> {
            Ok(StepOutcome::Succeeded(input.clone()))
        }
        async fn evaluate_condition(&self, _ctx: &StepContext, expr: &Value) -> Result<bool, StepError> {
            Ok(expr.as_bool().unwrap_or(false))
        }
        async fn resolve_items(&self, _ctx: &StepContext, source: &Value) -> Result<Vec<Value>, StepError> {
            Ok(source.as_array().cloned().unwrap_or_default())
        }
    }

    fn engine() -> Engine {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        Engine::without_hooks(store, clock, Arc::new(EchoInvoker), EngineConfig::default())
    }

    #[tokio::test]
    async fn register_then_trigger_manual_creates_a_run() {
        let engine = engine();
        engine
            .register(&json!({
                "id": "w1",
                "steps": [{"id": "a", "type": "action"}],
                "triggers": [],
            }))
            .await
            .unwrap();

        let run_id = engine.trigger_manual("w1", json!({"x": 1})).await.unwrap();
        let snapshot = engine.inspect(run_id).await.unwrap();
        assert_eq!(snapshot.run.workflow_id, "w1");
    }

    #[tokio::test]
    async fn cancel_run_marks_non_terminal_steps_cancelled() {
        let engine = engine();
        engine
            .register(&json!({
                "id": "w1",
                "steps": [
                    {"id": "a", "type": "control", "kind": "sleep", "extra": {"durationMs": 60000}},
                ],
                "triggers": [],
            }))
            .await
            .unwrap();
        let run_id = engine.trigger_manual("w1", json!({})).await.unwrap();

        engine.cancel_run(run_id).await.unwrap();
        let snapshot = engine.inspect(run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Cancelled);
        assert!(snapshot.steps.iter().all(|s| s.status == StepStatus::Cancelled));
    }

    #[tokio::test]
    async fn stop_rejects_new_triggers() {
        let engine = engine();
        engine
            .register(&json!({"id": "w1", "steps": [{"id": "a", "type": "action"}], "triggers": []}))
            .await
            .unwrap();
        engine.start().await.unwrap();
        engine.stop().await.unwrap();

        let err = engine.trigger_manual("w1", json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }
}
