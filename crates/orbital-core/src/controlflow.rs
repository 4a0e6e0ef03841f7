//! Interprets the control-kind steps that aren't plain graph structure:
//! `sleep`, `waitForEvent`, `human`, `forEach`, `batch`, and `cancel`.
//!
//! `if`/`elseIf`/`else`/`endIf` and `parallel`/`race` are pure graph shape
//! and are handled entirely by [`crate::runstate`] walking the typed
//! [`crate::definition::Graph`]. `subflow` steps are executed like ordinary
//! actions - the host's [`crate::step::StepInvoker`] is expected to trigger
//! the child run and surface its completion, so there is nothing
//! control-flow-specific to intercept here.
//!
//! Everything in this module is driven by a step's `extra` object, since the
//! base wire schema has no typed fields for these kinds (see the `extra`
//! conventions noted in the workflow definition's doc comments).

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::clock::{Clock, WakeupPayload};
use crate::definition::{ControlKind, WorkflowDef};
use crate::step::{StepContext, StepError, StepInvoker, StepOutcome};
use crate::store::{PauseKind, PauseRecord, RunStatus, Store, StoreError};

#[derive(Debug, Error)]
pub enum ControlFlowError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("step {0} is missing required `extra.{1}`")]
    MissingExtra(String, &'static str),
}

/// Executes the non-graph-shape control kinds against the store and clock.
pub struct ControlFlowRunner {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl ControlFlowRunner {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Returns `Some` when `step_id` names a control kind this module
    /// handles; `None` means the caller should invoke it as a plain action
    /// (including `subflow`, which an invoker executes like any other step).
    pub async fn handle(
        &self,
        def: &WorkflowDef,
        run_id: Uuid,
        step_id: &str,
        ctx: &StepContext,
        invoker: &dyn StepInvoker,
    ) -> Result<Option<StepOutcome>, ControlFlowError> {
        let Some(step) = def.step(step_id) else {
            return Ok(None);
        };
        let Some(kind) = step.kind else {
            return Ok(None);
        };
        let extra = step.extra.clone().unwrap_or(Value::Null);

        match kind {
            ControlKind::Sleep => Ok(Some(self.sleep(run_id, step_id, &extra).await?)),
            ControlKind::WaitForEvent => Ok(Some(self.wait_for_event(run_id, step_id, &extra).await?)),
            ControlKind::Human => Ok(Some(self.human(run_id, step_id, &extra).await?)),
            ControlKind::ForEach | ControlKind::Batch => {
                Ok(Some(self.resolve_collection(ctx, &extra, invoker, kind).await?))
            }
            ControlKind::Cancel => Ok(Some(self.cancel(run_id).await?)),
            ControlKind::If
            | ControlKind::ElseIf
            | ControlKind::Else
            | ControlKind::EndIf
            | ControlKind::Parallel
            | ControlKind::Race
            | ControlKind::Subflow => Ok(None),
        }
    }

    async fn sleep(&self, run_id: Uuid, step_id: &str, extra: &Value) -> Result<StepOutcome, ControlFlowError> {
        let duration_ms = extra
            .get("durationMs")
            .and_then(Value::as_i64)
            .ok_or_else(|| ControlFlowError::MissingExtra(step_id.to_string(), "durationMs"))?;

        let token = Uuid::now_v7();
        let wake_at = self.clock.now() + ChronoDuration::milliseconds(duration_ms);
        self.store
            .create_pause(PauseRecord {
                token,
                run_id,
                step_id: step_id.to_string(),
                kind: PauseKind::Sleep,
                created_at: self.clock.now(),
                expires_at: Some(wake_at),
                event_name: None,
            })
            .await?;
        self.clock.schedule(
            wake_at,
            WakeupPayload::SleepElapsed {
                run_id,
                step_id: step_id.to_string(),
            },
        );
        Ok(StepOutcome::Pending { token: token.to_string() })
    }

    async fn wait_for_event(
        &self,
        run_id: Uuid,
        step_id: &str,
        extra: &Value,
    ) -> Result<StepOutcome, ControlFlowError> {
        let event_name = extra
            .get("eventName")
            .and_then(Value::as_str)
            .ok_or_else(|| ControlFlowError::MissingExtra(step_id.to_string(), "eventName"))?
            .to_string();
        let timeout_ms = extra.get("timeoutMs").and_then(Value::as_i64);

        let token = Uuid::now_v7();
        let expires_at = timeout_ms.map(|ms| self.clock.now() + ChronoDuration::milliseconds(ms));
        self.store
            .create_pause(PauseRecord {
                token,
                run_id,
                step_id: step_id.to_string(),
                kind: PauseKind::Event,
                created_at: self.clock.now(),
                expires_at,
                event_name: Some(event_name),
            })
            .await?;
        if let Some(at) = expires_at {
            self.clock.schedule(
                at,
                WakeupPayload::Timeout {
                    run_id,
                    step_id: step_id.to_string(),
                },
            );
        }
        Ok(StepOutcome::Pending { token: token.to_string() })
    }

    async fn human(&self, run_id: Uuid, step_id: &str, extra: &Value) -> Result<StepOutcome, ControlFlowError> {
        let timeout_ms = extra.get("timeoutMs").and_then(Value::as_i64);
        let token = Uuid::now_v7();
        let expires_at = timeout_ms.map(|ms| self.clock.now() + ChronoDuration::milliseconds(ms));
        self.store
            .create_pause(PauseRecord {
                token,
                run_id,
                step_id: step_id.to_string(),
                kind: PauseKind::Human,
                created_at: self.clock.now(),
                expires_at,
                event_name: None,
            })
            .await?;
        if let Some(at) = expires_at {
            self.clock.schedule(
                at,
                WakeupPayload::PauseExpired { token },
            );
        }
        self.store
            .update_run_status(run_id, RunStatus::Paused, self.clock.now(), None)
            .await?;
        Ok(StepOutcome::Pending { token: token.to_string() })
    }

    /// `forEach`/`batch` resolve their item list through the invoker and
    /// complete immediately; iterating the resolved items against the
    /// `extra.childStepIds` convention is the host's responsibility, the
    /// same way `subflow` delegates child-run orchestration to the invoker.
    ///
    /// `batch` additionally chunks the resolved items into `⌈N/size⌉`
    /// sequential groups per `extra.size` (§4.4); the children within a
    /// chunk are understood to run in parallel by the host, the chunk
    /// boundaries themselves are sequential. `forEach` is the degenerate
    /// case of a single chunk holding every item.
    async fn resolve_collection(
        &self,
        ctx: &StepContext,
        extra: &Value,
        invoker: &dyn StepInvoker,
        kind: ControlKind,
    ) -> Result<StepOutcome, ControlFlowError> {
        let source = extra.get("source").cloned().unwrap_or(Value::Null);
        let items = invoker.resolve_items(ctx, &source).await?;
        let total_items = items.len();

        let batches = (kind == ControlKind::Batch).then(|| {
            let size = extra
                .get("size")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .filter(|&n| n > 0)
                .unwrap_or(total_items.max(1));
            Value::Array(items.chunks(size).map(|chunk| Value::Array(chunk.to_vec())).collect())
        });

        let mut output = serde_json::json!({
            "results": items,
            "totalItems": total_items,
        });
        if let Some(batches) = batches {
            output["batches"] = batches;
        }
        Ok(StepOutcome::Succeeded(output))
    }

    async fn cancel(&self, run_id: Uuid) -> Result<StepOutcome, ControlFlowError> {
        self.store
            .update_run_status(run_id, RunStatus::Cancelled, self.clock.now(), None)
            .await?;
        Ok(StepOutcome::Succeeded(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::definition::WorkflowDef;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    struct NullInvoker;

    #[async_trait]
    impl StepInvoker for NullInvoker {
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

    fn ctx(run_id: Uuid) -> StepContext {
        StepContext {
            workflow_id: "w1".into(),
            run_id,
            step_id: "s1".into(),
            attempt: 1,
            run_input: json!({}),
            prior_outputs: HashMap::new(),
            scheduled_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn sleep_creates_pause_and_clock_wakeup() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let runner = ControlFlowRunner::new(store.clone(), clock.clone());
        let def = WorkflowDef::from_json(&json!({
            "id": "w1",
            "steps": [{"id": "s1", "type": "control", "kind": "sleep", "extra": {"durationMs": 1000}}],
            "triggers": [],
        }))
        .unwrap();

        let run_id = Uuid::now_v7();
        let outcome = runner
            .handle(&def, run_id, "s1", &ctx(run_id), &NullInvoker)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Pending { .. }));

        let due = clock.advance(ChronoDuration::milliseconds(1000));
        assert_eq!(due.len(), 1);
        assert!(matches!(&due[0], WakeupPayload::SleepElapsed { step_id, .. } if step_id == "s1"));
    }

    #[tokio::test]
    async fn for_each_resolves_items_and_succeeds() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let runner = ControlFlowRunner::new(store, clock);
        let def = WorkflowDef::from_json(&json!({
            "id": "w1",
            "steps": [{"id": "s1", "type": "control", "kind": "forEach", "extra": {"source": [1, 2, 3]}}],
            "triggers": [],
        }))
        .unwrap();

        let run_id = Uuid::now_v7();
        let outcome = runner
            .handle(&def, run_id, "s1", &ctx(run_id), &NullInvoker)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::Succeeded(v) if v == json!({"results": [1, 2, 3], "totalItems": 3})
        ));
    }

    #[tokio::test]
    async fn batch_chunks_items_by_size() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let runner = ControlFlowRunner::new(store, clock);
        let def = WorkflowDef::from_json(&json!({
            "id": "w1",
            "steps": [{"id": "s1", "type": "control", "kind": "batch", "extra": {"source": [1, 2, 3, 4, 5], "size": 2}}],
            "triggers": [],
        }))
        .unwrap();

        let run_id = Uuid::now_v7();
        let outcome = runner
            .handle(&def, run_id, "s1", &ctx(run_id), &NullInvoker)
            .await
            .unwrap()
            .unwrap();
        let StepOutcome::Succeeded(v) = outcome else {
            panic!("expected Succeeded outcome");
        };
        assert_eq!(v["totalItems"], json!(5));
        assert_eq!(v["results"], json!([1, 2, 3, 4, 5]));
        assert_eq!(v["batches"], json!([[1, 2], [3, 4], [5]]));
    }

    #[tokio::test]
    async fn cancel_marks_run_cancelled() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let runner = ControlFlowRunner::new(store.clone(), clock);
        let def = WorkflowDef::from_json(&json!({
            "id": "w1",
            "steps": [{"id": "s1", "type": "control", "kind": "cancel"}],
            "triggers": [],
        }))
        .unwrap();

        let run_id = store.create_run("w1", json!({})).await.unwrap();
        runner
            .handle(&def, run_id, "s1", &ctx(run_id), &NullInvoker)
            .await
            .unwrap();
        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }
}
