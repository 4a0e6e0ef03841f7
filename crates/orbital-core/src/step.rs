//! The boundary between the engine and user code: [`StepInvoker`] is the
//! trait a host application implements to actually run an action step,
//! evaluate a branch condition, or resolve the item list for a `forEach`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Everything a running step needs to know about its run and its own attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub step_id: String,
    pub attempt: u32,
    /// The triggering payload that started the run.
    pub run_input: Value,
    /// Outputs of steps that ran before this one, keyed by step id.
    pub prior_outputs: HashMap<String, Value>,
    pub scheduled_at: DateTime<Utc>,
}

/// The result of invoking an action step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The step finished; its output feeds `prior_outputs` for later steps.
    Succeeded(Value),
    /// The step failed; the dispatcher decides whether to retry based on
    /// the step's [`crate::reliability::RetryPolicy`] and `retryable`.
    Failed { message: String, retryable: bool },
    /// The step is long-running and reports completion asynchronously via
    /// `Engine::report_outcome` using a correlation token it returns here.
    Pending { token: String },
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("step invocation failed: {0}")]
    Invocation(String),

    #[error("condition evaluation failed: {0}")]
    Condition(String),

    #[error("item resolution failed: {0}")]
    ItemResolution(String),
}

/// Host-implemented hook for running the actual work behind a step.
///
/// A single `StepInvoker` is shared across all workflows; it dispatches on
/// `step_id`/`workflow_id` (or an `extra` discriminator in the definition)
/// to find the right handler.
#[async_trait]
pub trait StepInvoker: Send + Sync {
    /// Executes an action step.
    async fn invoke(&self, ctx: &StepContext, input: &Value) -> Result<StepOutcome, StepError>;

    /// Evaluates the boolean condition guarding an `if`/`elseIf` branch.
    async fn evaluate_condition(&self, ctx: &StepContext, expr: &Value) -> Result<bool, StepError>;

    /// Resolves the item list a `forEach`/`batch` step iterates over.
    async fn resolve_items(&self, ctx: &StepContext, source: &Value) -> Result<Vec<Value>, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn ctx() -> StepContext {
        StepContext {
            workflow_id: "w1".into(),
            run_id: Uuid::now_v7(),
            step_id: "s1".into(),
            attempt: 1,
            run_input: serde_json::json!({}),
            prior_outputs: HashMap::new(),
            scheduled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn invoke_echoes_input() {
        let invoker = EchoInvoker;
        let outcome = invoker.invoke(&ctx(), &serde_json::json!({"a": 1})).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Succeeded(v) if v == serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn evaluate_condition_reads_bool() {
        let invoker = EchoInvoker;
        assert!(invoker.evaluate_condition(&ctx(), &serde_json::json!(true)).await.unwrap());
        assert!(!invoker.evaluate_condition(&ctx(), &serde_json::json!(false)).await.unwrap());
    }
}
