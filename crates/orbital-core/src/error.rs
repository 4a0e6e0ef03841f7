//! Stable, process-wide error kinds. Every public operation on
//! [`crate::engine::Engine`] returns one of these rather than leaking the
//! internal per-module error types, so callers can match on `kind()` without
//! reaching into `orbital_core::{store, definition, dispatcher}`.

use thiserror::Error;
use uuid::Uuid;

use crate::controlflow::ControlFlowError;
use crate::definition::DefinitionError;
use crate::dispatcher::DispatcherError;
use crate::store::StoreError;
use crate::trigger::TriggerError;

/// Tagged error kind, stable across internal refactors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("step timed out")]
    StepTimeout,

    #[error("retries exhausted: {0}")]
    RetryExhausted(String),

    #[error("circuit breaker open")]
    BreakerOpen,

    #[error("pause expired or already resumed")]
    PauseExpired,

    #[error("run cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

impl EngineError {
    /// Stable kind tag for callers that want to `match` rather than parse
    /// the display message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ErrValidation",
            Self::NotFound(_) => "ErrNotFound",
            Self::StepTimeout => "ErrStepTimeout",
            Self::RetryExhausted(_) => "ErrRetryExhausted",
            Self::BreakerOpen => "ErrBreakerOpen",
            Self::PauseExpired => "ErrPauseExpired",
            Self::Cancelled => "ErrCancelled",
            Self::Store(_) => "ErrStore",
            Self::TypeMismatch(_) => "ErrTypeMismatch",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WorkflowNotFound(id) => EngineError::NotFound(format!("workflow {id}")),
            StoreError::RunNotFound(id) => EngineError::NotFound(format!("run {id}")),
            StoreError::StepStateNotFound { run_id, step_id } => {
                EngineError::NotFound(format!("step {step_id} of run {run_id}"))
            }
            StoreError::PauseNotFound(token) => EngineError::NotFound(format!("pause {token}")),
            StoreError::JobNotFound(id) => EngineError::NotFound(format!("job {id}")),
            StoreError::TypeMismatch { namespace, key } => {
                EngineError::TypeMismatch(format!("{namespace}:{key}"))
            }
            other => EngineError::Store(other.to_string()),
        }
    }
}

impl From<DefinitionError> for EngineError {
    fn from(err: DefinitionError) -> Self {
        EngineError::Validation(err.to_string())
    }
}

impl From<DispatcherError> for EngineError {
    fn from(err: DispatcherError) -> Self {
        match err {
            DispatcherError::Store(e) => e.into(),
            DispatcherError::ControlFlow(e) => e.into(),
            DispatcherError::UnknownWorkflow(id) => {
                EngineError::NotFound(format!("workflow {id}"))
            }
        }
    }
}

impl From<ControlFlowError> for EngineError {
    fn from(err: ControlFlowError) -> Self {
        match err {
            ControlFlowError::Store(e) => e.into(),
            ControlFlowError::Step(e) => EngineError::Validation(e.to_string()),
            ControlFlowError::MissingExtra(step, field) => {
                EngineError::Validation(format!("step {step} missing extra.{field}"))
            }
        }
    }
}

impl From<TriggerError> for EngineError {
    fn from(err: TriggerError) -> Self {
        match err {
            TriggerError::Store(e) => e.into(),
            TriggerError::NoMatch => EngineError::NotFound("no matching trigger".to_string()),
            TriggerError::MissingHeader(h) => {
                EngineError::Validation(format!("missing required header {h}"))
            }
            TriggerError::PauseExpired => EngineError::PauseExpired,
            TriggerError::AlreadyResumed(token) => {
                EngineError::NotFound(format!("pause {token}"))
            }
            TriggerError::InvalidCron(expr) => {
                EngineError::Validation(format!("invalid cron expression: {expr}"))
            }
        }
    }
}

/// Helper so call sites can build a `NotFound` for an explicit `run_id` without a `StoreError` in hand.
pub fn run_not_found(run_id: Uuid) -> EngineError {
    EngineError::NotFound(format!("run {run_id}"))
}
