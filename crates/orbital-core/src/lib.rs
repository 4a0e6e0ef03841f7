//! # Orbital
//!
//! A durable workflow orchestration engine: developers describe a workflow
//! as a directed graph of steps with triggers (webhook, cron, manual,
//! event), and the engine executes each invocation (a *run*) to completion
//! with at-least-once step execution, persistent state, retries, timeouts,
//! conditional branching, parallel fan-out, human-in-the-loop pauses, and
//! lifecycle hooks.
//!
//! ## Features
//!
//! - **Typed workflow graphs**: a flat declared step list is parsed once at
//!   registration time into a nested control-flow tree, so the run state
//!   machine never re-derives block structure at run time.
//! - **Durable by default**: an embedded SQLite (WAL mode) store persists
//!   runs, step states, pauses, and the dispatcher's job queue; an in-memory
//!   store serves tests and zero-dependency embedding.
//! - **Reliability policy**: per-step retries with exponential backoff,
//!   circuit breakers, and cooperative timeout enforcement around every
//!   invocation.
//! - **Trigger registry**: webhook, cron, manual, and event triggers all
//!   resolve to the same `RunStateMachine` operations, with idempotency on
//!   webhook replay.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                               │
//! │  (process-wide facade: register, trigger, inspect, resume)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!            ┌─────────────────┼─────────────────┐
//!            ▼                 ▼                 ▼
//! ┌───────────────────┐ ┌──────────────┐ ┌──────────────────┐
//! │  TriggerRegistry   │ │ RunStateMachine│ │    HookRunner    │
//! │ (webhook/cron/etc.)│ │ (readiness walk)│ │ (onSuccess/Fail) │
//! └───────────────────┘ └──────────────┘ └──────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                             │
//! │  (claims ready jobs, applies retry/timeout/breaker policy)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Store                               │
//! │        (SQLite/in-memory: workflows, runs, steps, kv)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use orbital_core::prelude::*;
//!
//! let store = Arc::new(SqliteStore::connect("orbital.db").await?);
//! let clock = Arc::new(SystemClock::new());
//! let engine = Engine::without_hooks(store, clock, my_invoker, EngineConfig::default());
//!
//! engine.register(&workflow_json).await?;
//! engine.start().await?;
//! let run_id = engine.trigger_manual("my-workflow", serde_json::json!({})).await?;
//! ```

pub mod clock;
pub mod controlflow;
pub mod definition;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod registry;
pub mod reliability;
pub mod runstate;
pub mod statekv;
pub mod step;
pub mod store;
pub mod trigger;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::clock::{Clock, SystemClock, TestClock, WakeupPayload};
    pub use crate::controlflow::{ControlFlowError, ControlFlowRunner};
    pub use crate::definition::{StepDef, TriggerDef, WorkflowDef};
    pub use crate::dispatcher::{Dispatcher, DispatcherConfig, DispatcherError};
    pub use crate::engine::{Engine, EngineConfig, RunSnapshot};
    pub use crate::error::EngineError;
    pub use crate::hooks::{HookContext, HookInvoker, HookRunner, NoopHooks};
    pub use crate::registry::WorkflowRegistry;
    pub use crate::reliability::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
    pub use crate::runstate::RunStateMachine;
    pub use crate::statekv::StateKv;
    pub use crate::step::{StepContext, StepError, StepInvoker, StepOutcome};
    pub use crate::store::{
        InMemoryStore, PauseKind, PauseRecord, RunRecord, RunStatus, SqliteStore, StepStateRecord,
        StepStatus, Store, StoreError,
    };
    pub use crate::trigger::{TriggerError, TriggerRegistry};
}

// Re-export key types at crate root.
pub use clock::{Clock, SystemClock, TestClock, WakeupPayload};
pub use controlflow::{ControlFlowError, ControlFlowRunner};
pub use definition::{StepDef, TriggerDef, WorkflowDef};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherError};
pub use engine::{Engine, EngineConfig, RunSnapshot};
pub use error::EngineError;
pub use hooks::{HookContext, HookInvoker, HookRunner, NoopHooks};
pub use registry::WorkflowRegistry;
pub use reliability::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
pub use runstate::RunStateMachine;
pub use statekv::StateKv;
pub use step::{StepContext, StepError, StepInvoker, StepOutcome};
pub use store::{
    InMemoryStore, PauseKind, PauseRecord, RunRecord, RunStatus, SqliteStore, StepStateRecord,
    StepStatus, Store, StoreError,
};
pub use trigger::{TriggerError, TriggerRegistry};
