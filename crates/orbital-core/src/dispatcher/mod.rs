//! Bounded worker pool that claims ready jobs from the [`Store`] queue and
//! executes them, applying retry, timeout, circuit-breaker, and result-cache
//! policy around each invocation.
//!
//! A semaphore bounds in-flight concurrency, a poll loop claims a batch of
//! jobs at a time, and failures feed back through
//! [`RetryPolicy`]/[`CircuitBreaker`] rather than being retried
//! unconditionally.

mod backpressure;

pub use backpressure::{Backpressure, BackpressureError};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{Clock, WakeupPayload};
use crate::controlflow::{ControlFlowError, ControlFlowRunner};
use crate::definition::{BackoffStrategy, ControlKind, RetryDef, WorkflowDef};
use crate::registry::WorkflowRegistry;
use crate::reliability::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
use crate::runstate::RunStateMachine;
use crate::step::{StepContext, StepInvoker, StepOutcome};
use crate::store::{JobRecord, Store, StoreError};

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    ControlFlow(#[from] ControlFlowError),

    #[error("workflow definition not registered: {0}")]
    UnknownWorkflow(String),
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_id: String,
    pub max_concurrency: u32,
    pub poll_batch_size: u32,
    pub default_retry: RetryPolicy,
    pub default_breaker: CircuitBreakerConfig,
    /// Applied to any step that doesn't declare its own `options.timeoutMs`.
    pub default_timeout: StdDuration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            max_concurrency: 16,
            poll_batch_size: 8,
            default_retry: RetryPolicy::exponential()
                .with_max_attempts(3)
                .with_initial_interval(StdDuration::from_millis(200)),
            default_breaker: CircuitBreakerConfig::default(),
            default_timeout: StdDuration::from_secs(30),
        }
    }
}

/// Claims and executes ready jobs against a registered set of workflow
/// definitions, applying per-step reliability policy.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    invoker: Arc<dyn StepInvoker>,
    control_flow: ControlFlowRunner,
    run_state: RunStateMachine,
    config: DispatcherConfig,
    workflows: Arc<WorkflowRegistry>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    backpressure: Backpressure,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        invoker: Arc<dyn StepInvoker>,
        workflows: Arc<WorkflowRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        let backpressure = Backpressure::new(config.max_concurrency);
        Self {
            control_flow: ControlFlowRunner::new(store.clone(), clock.clone()),
            run_state: RunStateMachine::new(store.clone()),
            store,
            clock,
            invoker,
            config,
            workflows,
            breakers: Mutex::new(HashMap::new()),
            backpressure,
        }
    }

    fn workflow(&self, id: &str) -> Result<Arc<WorkflowDef>, DispatcherError> {
        self.workflows
            .get(id)
            .ok_or_else(|| DispatcherError::UnknownWorkflow(id.to_string()))
    }

    fn breaker_for(&self, step_key: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(step_key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.default_breaker.clone())))
            .clone()
    }

    /// Claims up to `poll_batch_size` ready jobs and runs each to completion
    /// (or to its next retry/pause point), honoring the concurrency bound.
    pub async fn tick(&self) -> Result<u32, DispatcherError> {
        let permits = self.backpressure.available();
        if permits == 0 {
            return Ok(0);
        }
        let claim_size = permits.min(self.config.poll_batch_size);
        let claimed = self.store.claim_job(&self.config.worker_id, claim_size).await?;
        let mut ran = 0;
        for claimed_job in claimed {
            let _permit = self.backpressure.acquire();
            self.run_job(claimed_job.job).await?;
            ran += 1;
        }
        Ok(ran)
    }

    /// Promotes queued runs of every registered concurrency-capped workflow,
    /// freeing up headroom a just-completed run may have opened.
    pub async fn promote_queued_runs(&self) -> Result<(), DispatcherError> {
        for def in self.workflows.list() {
            self.run_state.promote_queued(&def).await?;
        }
        Ok(())
    }

    /// Drains wake-ups due on the clock: retry jobs get re-enqueued, sleeps
    /// and timeouts resolve their pending step via the run state machine.
    pub async fn drain_wakeups(&self) -> Result<(), DispatcherError> {
        for wakeup in self.clock.poll_due() {
            match wakeup {
                WakeupPayload::RetryJob { run_id, step_id, attempt } => {
                    let run = self.store.get_run(run_id).await?;
                    self.store
                        .enqueue_job(JobRecord {
                            id: Uuid::now_v7(),
                            run_id,
                            workflow_id: run.workflow_id,
                            step_id,
                            attempt,
                            enqueued_at: self.clock.now(),
                            deadline: None,
                            background: false,
                        })
                        .await?;
                }
                WakeupPayload::SleepElapsed { run_id, step_id } => {
                    let run = self.store.get_run(run_id).await?;
                    let def = self.workflow(&run.workflow_id)?;
                    self.run_state
                        .report_outcome(&def, run_id, &step_id, None, StepOutcome::Succeeded(Value::Null))
                        .await?;
                }
                WakeupPayload::Timeout { run_id, step_id } => {
                    // A `waitForEvent` pause that expired without a matching
                    // publish: §4.3 requires the step to fail with
                    // `ErrStepTimeout`, not silently succeed with no payload.
                    let run = self.store.get_run(run_id).await?;
                    let def = self.workflow(&run.workflow_id)?;
                    self.run_state
                        .report_outcome(
                            &def,
                            run_id,
                            &step_id,
                            None,
                            StepOutcome::Failed {
                                message: "ErrStepTimeout: waitForEvent timed out".to_string(),
                                retryable: false,
                            },
                        )
                        .await?;
                }
                WakeupPayload::PauseExpired { token } => {
                    if let Ok(pause) = self.store.get_pause(token).await {
                        let run = self.store.get_run(pause.run_id).await?;
                        let def = self.workflow(&run.workflow_id)?;
                        self.store.delete_pause(token).await?;
                        self.run_state
                            .report_outcome(
                                &def,
                                pause.run_id,
                                &pause.step_id,
                                None,
                                StepOutcome::Failed {
                                    message: "human approval window expired".to_string(),
                                    retryable: false,
                                },
                            )
                            .await?;
                    }
                }
                WakeupPayload::CronFire { trigger_id } => {
                    warn!(trigger_id, "cron fire observed by dispatcher tick; trigger registry should own this");
                }
            }
        }
        Ok(())
    }

    async fn run_job(&self, job: JobRecord) -> Result<(), DispatcherError> {
        let def = self.workflow(&job.workflow_id)?;
        let Some(step) = def.step(&job.step_id).cloned() else {
            return Err(DispatcherError::UnknownWorkflow(job.workflow_id.clone()));
        };

        let run = self.store.get_run(job.run_id).await?;
        let prior_outputs = self.prior_outputs(job.run_id).await?;
        let ctx = StepContext {
            workflow_id: def.id.clone(),
            run_id: job.run_id,
            step_id: job.step_id.clone(),
            attempt: job.attempt,
            run_input: run.payload.clone(),
            prior_outputs,
            scheduled_at: job.enqueued_at,
        };

        self.mark_started(job.run_id, &job.step_id, job.attempt).await?;

        let breaker_key = format!("{}:{}", def.id, job.step_id);
        let breaker = self.breaker_for(&breaker_key);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                self.schedule_retry(&def, &job, "circuit breaker open").await?;
                return Ok(());
            }
        };

        let cache_key = step
            .options
            .cache_key
            .as_ref()
            .map(|key| format!("dispatcher-cache:{}:{}", def.id, key));

        if let Some(key) = &cache_key {
            if let Some(cached) = self.store.kv_get("global", key).await? {
                permit.success();
                self.run_state
                    .report_outcome(&def, job.run_id, &job.step_id, Some(job.attempt), StepOutcome::Succeeded(cached))
                    .await?;
                self.store.complete_job(job.id).await?;
                return Ok(());
            }
        }

        let timeout = step
            .options
            .timeout_ms
            .map(StdDuration::from_millis)
            .unwrap_or(self.config.default_timeout);

        // `if`/`elseIf` steps are pseudo-steps whose "output" is the branch
        // condition; the interpreter reads it as a bool in `runstate`, so
        // they go through `evaluate_condition` instead of `invoke`.
        let is_condition = matches!(step.kind, Some(ControlKind::If) | Some(ControlKind::ElseIf));

        let outcome = if is_condition {
            let expr = step.extra.clone().unwrap_or(Value::Null);
            match tokio::time::timeout(timeout, self.invoker.evaluate_condition(&ctx, &expr)).await {
                Ok(Ok(result)) => StepOutcome::Succeeded(Value::Bool(result)),
                Ok(Err(err)) => StepOutcome::Failed {
                    message: err.to_string(),
                    retryable: true,
                },
                Err(_) => StepOutcome::Failed {
                    message: format!("condition evaluation exceeded timeout of {timeout:?}"),
                    retryable: false,
                },
            }
        } else if let Some(handled) = self
            .control_flow
            .handle(&def, job.run_id, &job.step_id, &ctx, self.invoker.as_ref())
            .await?
        {
            handled
        } else {
            match tokio::time::timeout(timeout, self.invoker.invoke(&ctx, &run.payload)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => StepOutcome::Failed {
                    message: err.to_string(),
                    retryable: true,
                },
                Err(_) => StepOutcome::Failed {
                    message: format!("step exceeded timeout of {timeout:?}"),
                    retryable: false,
                },
            }
        };

        match &outcome {
            StepOutcome::Succeeded(output) => {
                permit.success();
                if let (Some(key), Some(ttl_ms)) = (&cache_key, step.options.cache_ttl_ms) {
                    self.store
                        .kv_set(
                            "global",
                            key,
                            output.clone(),
                            Some(StdDuration::from_millis(ttl_ms)),
                        )
                        .await?;
                }
                self.run_state
                    .report_outcome(&def, job.run_id, &job.step_id, Some(job.attempt), outcome.clone())
                    .await?;
                self.store.complete_job(job.id).await?;
            }
            StepOutcome::Failed { retryable, .. } => {
                permit.failure();
                if *retryable && self.retries_remaining(&step, job.attempt) {
                    self.schedule_retry(&def, &job, "step failed").await?;
                } else {
                    self.run_state
                        .report_outcome(&def, job.run_id, &job.step_id, Some(job.attempt), outcome.clone())
                        .await?;
                }
                self.store.fail_job(job.id, "step failed").await?;
            }
            StepOutcome::Pending { .. } => {
                permit.success();
                self.run_state
                    .report_outcome(&def, job.run_id, &job.step_id, Some(job.attempt), outcome.clone())
                    .await?;
                self.store.complete_job(job.id).await?;
            }
        }

        info!(workflow = %def.id, run = %job.run_id, step = %job.step_id, "job processed");
        Ok(())
    }

    fn retries_remaining(&self, step: &crate::definition::StepDef, attempt: u32) -> bool {
        let policy = step
            .options
            .retry
            .as_ref()
            .map(retry_policy_from_def)
            .unwrap_or_else(|| self.config.default_retry.clone());
        policy.has_attempts_remaining(attempt)
    }

    async fn schedule_retry(&self, def: &WorkflowDef, job: &JobRecord, reason: &str) -> Result<(), DispatcherError> {
        let step = def.step(&job.step_id);
        let policy = step
            .and_then(|s| s.options.retry.as_ref())
            .map(retry_policy_from_def)
            .unwrap_or_else(|| self.config.default_retry.clone());
        let delay = policy.delay_for_attempt(job.attempt);
        let next_attempt = job.attempt + 1;
        warn!(workflow = %def.id, step = %job.step_id, reason, "scheduling retry");
        self.clock.schedule(
            self.clock.now() + ChronoDuration::from_std(delay).unwrap_or_default(),
            WakeupPayload::RetryJob {
                run_id: job.run_id,
                step_id: job.step_id.clone(),
                attempt: next_attempt,
            },
        );
        Ok(())
    }

    /// Stamps the wall-clock time the first attempt actually began running
    /// (for the dependency-ordering checks a host may run over `step_states`)
    /// and bumps the persisted attempt counter to match this job. A no-op
    /// write when neither has changed, so a retried step's `started_at`
    /// always reflects its first attempt rather than its latest one.
    async fn mark_started(&self, run_id: Uuid, step_id: &str, attempt: u32) -> Result<(), DispatcherError> {
        let mut state = self.store.get_step_state(run_id, step_id).await?;
        let status = state.status;
        let mut changed = false;
        if state.started_at.is_none() {
            state.started_at = Some(chrono::Utc::now());
            changed = true;
        }
        if state.attempt < attempt {
            state.attempt = attempt;
            changed = true;
        }
        if changed {
            self.store.upsert_step_state(state, Some(status)).await?;
        }
        Ok(())
    }

    async fn prior_outputs(&self, run_id: Uuid) -> Result<HashMap<String, Value>, DispatcherError> {
        let states = self.store.list_step_states(run_id).await?;
        Ok(states
            .into_iter()
            .filter_map(|s| s.output.map(|o| (s.step_id, o)))
            .collect())
    }
}

/// Builds the reliability-module [`RetryPolicy`] a step's wire-format
/// [`RetryDef`] describes.
fn retry_policy_from_def(def: &RetryDef) -> RetryPolicy {
    let delay = StdDuration::from_millis(def.delay_ms);
    match def.strategy {
        BackoffStrategy::Fixed => RetryPolicy::fixed(delay, def.attempts),
        BackoffStrategy::Exponential => {
            let mut policy = RetryPolicy::exponential()
                .with_max_attempts(def.attempts)
                .with_initial_interval(delay);
            if let Some(max_backoff_ms) = def.max_backoff_ms {
                policy = policy.with_max_interval(StdDuration::from_millis(max_backoff_ms));
            }
            if def.jitter == Some(false) {
                policy = policy.with_jitter(0.0);
            }
            policy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::step::StepError;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoInvoker;

    #[async_trait]
    impl StepInvoker for EchoInvoker {
        async fn invoke(&self, ctx: &StepContext, _input: &Value) -> Result<StepOutcome, StepError> {
            Ok(StepOutcome::Succeeded(json!({ "step": ctx.step_id })))
        }
        async fn evaluate_condition(&self, _ctx: &StepContext, expr: &Value) -> Result<bool, StepError> {
            Ok(expr.as_bool().unwrap_or(false))
        }
        async fn resolve_items(&self, _ctx: &StepContext, source: &Value) -> Result<Vec<Value>, StepError> {
            Ok(source.as_array().cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn tick_executes_ready_job_and_advances_run() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let workflows = Arc::new(WorkflowRegistry::new());
        let def = WorkflowDef::from_json(&json!({
            "id": "w1",
            "steps": [{"id": "a", "type": "action"}],
            "triggers": [],
        }))
        .unwrap();
        workflows.insert(def.clone());
        let dispatcher = Dispatcher::new(
            store.clone(),
            clock,
            Arc::new(EchoInvoker),
            workflows,
            DispatcherConfig::default(),
        );

        let run_state = RunStateMachine::new(store.clone());
        let run = run_state.start_run(&def, json!({})).await.unwrap();

        let ran = dispatcher.tick().await.unwrap();
        assert_eq!(ran, 1);

        let run = store.get_run(run.id).await.unwrap();
        assert_eq!(run.status, crate::store::RunStatus::Completed);
    }

    #[tokio::test]
    async fn wait_for_event_timeout_fails_the_step() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let workflows = Arc::new(WorkflowRegistry::new());
        let def = WorkflowDef::from_json(&json!({
            "id": "w1",
            "steps": [{
                "id": "a", "type": "control", "kind": "waitForEvent",
                "extra": {"eventName": "approved", "timeoutMs": 1000}
            }],
            "triggers": [],
        }))
        .unwrap();
        workflows.insert(def.clone());
        let dispatcher = Dispatcher::new(
            store.clone(),
            clock.clone(),
            Arc::new(EchoInvoker),
            workflows,
            DispatcherConfig::default(),
        );

        let run_state = RunStateMachine::new(store.clone());
        let run = run_state.start_run(&def, json!({})).await.unwrap();
        dispatcher.tick().await.unwrap();

        let a = store.get_step_state(run.id, "a").await.unwrap();
        assert_eq!(a.status, crate::store::StepStatus::Running);

        clock.advance(ChronoDuration::milliseconds(1000));
        dispatcher.drain_wakeups().await.unwrap();

        let a = store.get_step_state(run.id, "a").await.unwrap();
        assert_eq!(a.status, crate::store::StepStatus::Failed);
        assert!(a.error.as_deref().unwrap_or_default().contains("ErrStepTimeout"));
        let run = store.get_run(run.id).await.unwrap();
        assert_eq!(run.status, crate::store::RunStatus::Failed);
    }
}
