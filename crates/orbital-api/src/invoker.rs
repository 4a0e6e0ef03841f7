//! HTTP-callback [`StepInvoker`]: the engine has no user code to link in
//! directly, so action/condition/item-resolution calls go out over HTTP to a
//! handler service the operator points at via `ORBITAL_INVOKER_URL`. Mirrors
//! the CLI's `reqwest`-based client wrapper, just on the invocation side of
//! the wire instead of the admin side.

use std::collections::HashMap;

use async_trait::async_trait;
use orbital_core::{StepContext, StepError, StepInvoker, StepOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    workflow_id: &'a str,
    run_id: String,
    step_id: &'a str,
    attempt: u32,
    run_input: &'a Value,
    prior_outputs: &'a HashMap<String, Value>,
    input: &'a Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum InvokeResponse {
    Ok {
        output: Value,
    },
    Err {
        error: String,
        #[serde(default = "default_retryable")]
        retryable: bool,
    },
    Paused {
        token: String,
    },
}

fn default_retryable() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ConditionResponse {
    result: bool,
}

#[derive(Debug, Deserialize)]
struct ItemsResponse {
    items: Vec<Value>,
}

/// Routes step execution to `{base_url}/steps/invoke|condition|items`.
pub struct HttpStepInvoker {
    base_url: String,
    http: reqwest::Client,
}

impl HttpStepInvoker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl StepInvoker for HttpStepInvoker {
    async fn invoke(&self, ctx: &StepContext, input: &Value) -> Result<StepOutcome, StepError> {
        let req = InvokeRequest {
            workflow_id: &ctx.workflow_id,
            run_id: ctx.run_id.to_string(),
            step_id: &ctx.step_id,
            attempt: ctx.attempt,
            run_input: &ctx.run_input,
            prior_outputs: &ctx.prior_outputs,
            input,
        };

        let response = self
            .http
            .post(self.url("/steps/invoke"))
            .json(&req)
            .send()
            .await
            .map_err(|e| StepError::Invocation(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StepError::Invocation(format!("handler returned {status}: {body}")));
        }

        let parsed: InvokeResponse = response
            .json()
            .await
            .map_err(|e| StepError::Invocation(format!("malformed handler response: {e}")))?;

        Ok(match parsed {
            InvokeResponse::Ok { output } => StepOutcome::Succeeded(output),
            InvokeResponse::Err { error, retryable } => StepOutcome::Failed {
                message: error,
                retryable,
            },
            InvokeResponse::Paused { token } => StepOutcome::Pending { token },
        })
    }

    async fn evaluate_condition(&self, ctx: &StepContext, expr: &Value) -> Result<bool, StepError> {
        let req = InvokeRequest {
            workflow_id: &ctx.workflow_id,
            run_id: ctx.run_id.to_string(),
            step_id: &ctx.step_id,
            attempt: ctx.attempt,
            run_input: &ctx.run_input,
            prior_outputs: &ctx.prior_outputs,
            input: expr,
        };

        let response = self
            .http
            .post(self.url("/steps/condition"))
            .json(&req)
            .send()
            .await
            .map_err(|e| StepError::Condition(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(StepError::Condition(format!("handler returned {status}")));
        }

        let parsed: ConditionResponse = response
            .json()
            .await
            .map_err(|e| StepError::Condition(format!("malformed handler response: {e}")))?;
        Ok(parsed.result)
    }

    async fn resolve_items(&self, ctx: &StepContext, source: &Value) -> Result<Vec<Value>, StepError> {
        let req = InvokeRequest {
            workflow_id: &ctx.workflow_id,
            run_id: ctx.run_id.to_string(),
            step_id: &ctx.step_id,
            attempt: ctx.attempt,
            run_input: &ctx.run_input,
            prior_outputs: &ctx.prior_outputs,
            input: source,
        };

        let response = self
            .http
            .post(self.url("/steps/items"))
            .json(&req)
            .send()
            .await
            .map_err(|e| StepError::ItemResolution(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(StepError::ItemResolution(format!("handler returned {status}")));
        }

        let parsed: ItemsResponse = response
            .json()
            .await
            .map_err(|e| StepError::ItemResolution(format!("malformed handler response: {e}")))?;
        Ok(parsed.items)
    }
}
