//! Converts external stimuli - webhook hits, cron fires, manual calls,
//! published events - into [`RunStateMachine`] operations.
//!
//! Webhook and event registrations are read-mostly and live in memory behind
//! a [`parking_lot::RwLock`]; schedules are durable (`Store::put_schedule`)
//! since a cron fire must survive a process restart between ticks.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use cron::Schedule as CronSchedule;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::definition::{TriggerDef, WorkflowDef};
use crate::registry::WorkflowRegistry;
use crate::runstate::RunStateMachine;
use crate::store::{PauseKind, RunStatus, ScheduleRecord, Store, StoreError};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const IDEMPOTENCY_TTL: StdDuration = StdDuration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no trigger matches the request")]
    NoMatch,

    #[error("missing required header {0}")]
    MissingHeader(String),

    #[error("pause expired")]
    PauseExpired,

    #[error("pause {0} already resumed")]
    AlreadyResumed(Uuid),

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WebhookKey {
    path: String,
    method: String,
}

/// One registered webhook route.
struct WebhookRoute {
    workflow_id: String,
    required_headers: HashMap<String, String>,
}

/// Maps webhook routes, event names, and cron schedules to workflows, and
/// turns a matching stimulus into a new or resumed run.
pub struct TriggerRegistry {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    workflows: Arc<WorkflowRegistry>,
    webhooks: RwLock<HashMap<WebhookKey, WebhookRoute>>,
    events: RwLock<HashMap<String, Vec<String>>>,
}

impl TriggerRegistry {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, workflows: Arc<WorkflowRegistry>) -> Self {
        Self {
            store,
            clock,
            workflows,
            webhooks: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
        }
    }

    /// Indexes every trigger declared on `def`. Idempotent: re-registering a
    /// workflow replaces its prior routes rather than duplicating them.
    pub async fn register_workflow_triggers(&self, def: &WorkflowDef) -> Result<(), TriggerError> {
        self.webhooks
            .write()
            .retain(|_, route| route.workflow_id != def.id);
        self.events
            .write()
            .values_mut()
            .for_each(|ids| ids.retain(|id| id != &def.id));

        for (index, trigger) in def.triggers.iter().enumerate() {
            match trigger {
                TriggerDef::Webhook { path, method, required_headers } => {
                    self.webhooks.write().insert(
                        WebhookKey { path: path.clone(), method: method.to_uppercase() },
                        WebhookRoute {
                            workflow_id: def.id.clone(),
                            required_headers: required_headers.clone(),
                        },
                    );
                }
                TriggerDef::Event { name } => {
                    self.events.write().entry(name.clone()).or_default().push(def.id.clone());
                }
                TriggerDef::Schedule { cron } => {
                    let schedule = CronSchedule::from_str(cron)
                        .map_err(|e| TriggerError::InvalidCron(e.to_string()))?;
                    let now = self.clock.now();
                    let next_fire_at = schedule
                        .after(&now)
                        .next()
                        .ok_or_else(|| TriggerError::InvalidCron(format!("{cron} never fires")))?;
                    self.store
                        .put_schedule(ScheduleRecord {
                            trigger_id: schedule_trigger_id(&def.id, index),
                            workflow_id: def.id.clone(),
                            cron: cron.clone(),
                            next_fire_at,
                        })
                        .await?;
                }
                TriggerDef::Manual => {}
            }
        }
        Ok(())
    }

    /// `HandleWebhook`: finds the matching route, validates required headers,
    /// and creates a run from `body`. Honors the `Idempotency-Key` header:
    /// a duplicate key within 24h returns the original run id instead of
    /// creating a new run.
    pub async fn handle_webhook(
        &self,
        path: &str,
        method: &str,
        headers: &HashMap<String, String>,
        body: Value,
    ) -> Result<Uuid, TriggerError> {
        let key = WebhookKey { path: path.to_string(), method: method.to_uppercase() };
        let workflow_id = {
            let routes = self.webhooks.read();
            let route = routes.get(&key).ok_or(TriggerError::NoMatch)?;
            for (header, _expected) in &route.required_headers {
                if !headers.contains_key(header.as_str()) {
                    return Err(TriggerError::MissingHeader(header.clone()));
                }
            }
            route.workflow_id.clone()
        };

        if let Some(idempotency_key) = headers.get(IDEMPOTENCY_HEADER) {
            let kv_key = format!("{workflow_id}:{path}:{idempotency_key}");
            if let Some(existing) = self.store.kv_get("idempotency", &kv_key).await? {
                if let Some(run_id) = existing.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                    return Ok(run_id);
                }
            }
            let run_id = self.create_run(&workflow_id, body).await?;
            self.store
                .kv_set(
                    "idempotency",
                    &kv_key,
                    Value::String(run_id.to_string()),
                    Some(IDEMPOTENCY_TTL),
                )
                .await?;
            return Ok(run_id);
        }

        self.create_run(&workflow_id, body).await
    }

    /// `HandleCronFire`: looks up the workflow behind `trigger_id` and starts
    /// a run with an empty payload. Callers drive this from the due-schedule
    /// list returned by `Store::list_due_schedules`, then advance the
    /// schedule's `next_fire_at` themselves.
    pub async fn handle_cron_fire(&self, trigger_id: &str) -> Result<Uuid, TriggerError> {
        let workflow_id = workflow_id_from_trigger_id(trigger_id).ok_or(TriggerError::NoMatch)?;
        self.create_run(workflow_id, Value::Null).await
    }

    /// `HandleManual`.
    pub async fn handle_manual(&self, workflow_id: &str, payload: Value) -> Result<Uuid, TriggerError> {
        self.create_run(workflow_id, payload).await
    }

    /// `PublishEvent`: resumes every pause registered against `name` with
    /// `payload`, returning the resumed run ids.
    pub async fn publish_event(&self, name: &str, payload: Value) -> Result<Vec<Uuid>, TriggerError> {
        let pauses = self.store.find_pauses_by_event(name).await?;
        let mut resumed = Vec::with_capacity(pauses.len());
        for pause in pauses {
            self.store.delete_pause(pause.token).await?;
            self.resume_run(pause.run_id, &pause.step_id, payload.clone()).await?;
            resumed.push(pause.run_id);
        }
        Ok(resumed)
    }

    /// `Resume`: looks up the pause by `token`, fails with `PauseExpired` if
    /// it has timed out, otherwise deletes it and drives the run forward.
    pub async fn resume(&self, token: Uuid, payload: Value) -> Result<Uuid, TriggerError> {
        let pause = match self.store.get_pause(token).await {
            Ok(pause) => pause,
            Err(StoreError::PauseNotFound(_)) => return Err(TriggerError::AlreadyResumed(token)),
            Err(err) => return Err(err.into()),
        };
        if let Some(expires_at) = pause.expires_at {
            if self.clock.now() > expires_at {
                return Err(TriggerError::PauseExpired);
            }
        }
        self.store.delete_pause(token).await?;
        self.resume_run(pause.run_id, &pause.step_id, payload).await?;
        Ok(pause.run_id)
    }

    async fn create_run(&self, workflow_id: &str, payload: Value) -> Result<Uuid, TriggerError> {
        let def = self
            .workflows
            .get(workflow_id)
            .ok_or_else(|| TriggerError::NoMatch)?;
        let run_state = RunStateMachine::new(self.store.clone());
        let run = run_state.start_run(&def, payload).await?;
        Ok(run.id)
    }

    async fn resume_run(&self, run_id: Uuid, step_id: &str, payload: Value) -> Result<(), TriggerError> {
        let run = self.store.get_run(run_id).await?;
        let def = self
            .workflows
            .get(&run.workflow_id)
            .ok_or(TriggerError::NoMatch)?;
        if run.status == RunStatus::Paused {
            self.store
                .update_run_status(run_id, RunStatus::Running, self.clock.now(), None)
                .await?;
        }
        let run_state = RunStateMachine::new(self.store.clone());
        run_state
            .report_outcome(
                &def,
                run_id,
                step_id,
                None,
                crate::step::StepOutcome::Succeeded(payload),
            )
            .await?;
        Ok(())
    }
}

fn schedule_trigger_id(workflow_id: &str, index: usize) -> String {
    format!("{workflow_id}::schedule::{index}")
}

fn workflow_id_from_trigger_id(trigger_id: &str) -> Option<&str> {
    trigger_id.split("::schedule::").next()
}

/// Distinguishes a human pause from a sleep/event one, for callers that need
/// to know whether a given `PauseKind` blocks the whole run (`Human`) or just
/// the one step (`Sleep`, `Event`).
pub fn blocks_run(kind: PauseKind) -> bool {
    matches!(kind, PauseKind::Human)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn manual_def(id: &str) -> WorkflowDef {
        WorkflowDef::from_json(&json!({
            "id": id,
            "steps": [{"id": "a", "type": "action"}],
            "triggers": [{"manual": {}}],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn handle_manual_starts_a_run() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let workflows = Arc::new(WorkflowRegistry::new());
        let def = manual_def("w1");
        workflows.insert(def.clone());

        let registry = TriggerRegistry::new(store.clone(), clock, workflows);
        let run_id = registry.handle_manual("w1", json!({"a": 1})).await.unwrap();
        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.workflow_id, "w1");
    }

    #[tokio::test]
    async fn handle_manual_unknown_workflow_is_no_match() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let workflows = Arc::new(WorkflowRegistry::new());
        let registry = TriggerRegistry::new(store, clock, workflows);

        let err = registry.handle_manual("missing", json!({})).await.unwrap_err();
        assert!(matches!(err, TriggerError::NoMatch));
    }

    #[tokio::test]
    async fn webhook_requires_registered_headers() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let workflows = Arc::new(WorkflowRegistry::new());
        let def = WorkflowDef::from_json(&json!({
            "id": "w1",
            "steps": [{"id": "a", "type": "action"}],
            "triggers": [{"webhook": {"path": "/hooks/w1", "method": "POST", "requiredHeaders": {"X-Secret": "*"}}}],
        }))
        .unwrap();
        workflows.insert(def.clone());

        let registry = TriggerRegistry::new(store, clock, workflows);
        registry.register_workflow_triggers(&def).await.unwrap();

        let err = registry
            .handle_webhook("/hooks/w1", "POST", &HashMap::new(), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::MissingHeader(h) if h == "X-Secret"));

        let mut headers = HashMap::new();
        headers.insert("X-Secret".to_string(), "anything".to_string());
        let run_id = registry
            .handle_webhook("/hooks/w1", "POST", &headers, json!({"hello": "world"}))
            .await
            .unwrap();
        assert!(!run_id.is_nil());
    }

    #[tokio::test]
    async fn webhook_idempotency_key_returns_same_run() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let workflows = Arc::new(WorkflowRegistry::new());
        let def = WorkflowDef::from_json(&json!({
            "id": "w1",
            "steps": [{"id": "a", "type": "action"}],
            "triggers": [{"webhook": {"path": "/hooks/w1", "method": "POST"}}],
        }))
        .unwrap();
        workflows.insert(def.clone());

        let registry = TriggerRegistry::new(store, clock, workflows);
        registry.register_workflow_triggers(&def).await.unwrap();

        let mut headers = HashMap::new();
        headers.insert(IDEMPOTENCY_HEADER.to_string(), "abc-123".to_string());
        let run_id_1 = registry
            .handle_webhook("/hooks/w1", "POST", &headers, json!({"n": 1}))
            .await
            .unwrap();
        let run_id_2 = registry
            .handle_webhook("/hooks/w1", "POST", &headers, json!({"n": 2}))
            .await
            .unwrap();
        assert_eq!(run_id_1, run_id_2);
    }

    #[tokio::test]
    async fn publish_event_resumes_waiting_run() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let workflows = Arc::new(WorkflowRegistry::new());
        let def = WorkflowDef::from_json(&json!({
            "id": "w1",
            "steps": [{"id": "s1", "type": "control", "kind": "waitForEvent", "extra": {"eventName": "approved"}}],
            "triggers": [],
        }))
        .unwrap();
        workflows.insert(def.clone());

        let run_state = RunStateMachine::new(store.clone());
        let run = run_state.start_run(&def, json!({})).await.unwrap();

        let control_flow = crate::controlflow::ControlFlowRunner::new(store.clone(), clock.clone());
        let ctx = crate::step::StepContext {
            workflow_id: "w1".into(),
            run_id: run.id,
            step_id: "s1".into(),
            attempt: 1,
            run_input: json!({}),
            prior_outputs: HashMap::new(),
            scheduled_at: chrono::Utc::now(),
        };
        struct NullInvoker;
        #[async_trait::async_trait]
        impl crate::step::StepInvoker for NullInvoker {
            async fn invoke(&self, _ctx: &crate::step::StepContext, input: &Value) -> Result<crate::step::StepOutcome, crate::step::StepError> {
                Ok(crate::step::StepOutcome::Succeeded(input.clone()))
            }
            async fn evaluate_condition(&self, _ctx: &crate::step::StepContext, expr: &Value) -> Result<bool, crate::step::StepError> {
                Ok(expr.as_bool().unwrap_or(false))
            }
            async fn resolve_items(&self, _ctx: &crate::step::StepContext, source: &Value) -> Result<Vec<Value>, crate::step::StepError> {
                Ok(source.as_array().cloned().unwrap_or_default())
            }
        }
        let outcome = control_flow
            .handle(&def, run.id, "s1", &ctx, &NullInvoker)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, crate::step::StepOutcome::Pending { .. }));
        store
            .upsert_step_state(
                crate::store::StepStateRecord {
                    run_id: run.id,
                    step_id: "s1".into(),
                    attempt: 1,
                    status: crate::store::StepStatus::Running,
                    output: None,
                    error: None,
                    started_at: Some(chrono::Utc::now()),
                    completed_at: None,
                    next_retry_at: None,
                },
                None,
            )
            .await
            .unwrap();

        let registry = TriggerRegistry::new(store.clone(), clock, workflows);
        let resumed = registry.publish_event("approved", json!({"ok": true})).await.unwrap();
        assert_eq!(resumed, vec![run.id]);

        let state = store.get_step_state(run.id, "s1").await.unwrap();
        assert_eq!(state.status, crate::store::StepStatus::Succeeded);
    }
}
