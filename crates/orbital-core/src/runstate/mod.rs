//! The run state machine: turns a [`WorkflowDef`]'s typed [`Graph`] plus the
//! current set of persisted [`StepStateRecord`]s into "what's ready to run
//! next", and folds step outcomes back into the persisted run.
//!
//! This is the piece the control-flow interpreter note in the design docs
//! calls for: the graph is built once at registration (see [`crate::definition`]),
//! so this module only ever walks a typed tree, never the flat step list.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::definition::{Node, WorkflowDef};
use crate::store::{
    JobRecord, RunRecord, RunStatus, Store, StepStateRecord, StepStatus, StoreError,
};
use crate::step::StepOutcome;

pub use crate::store::{RunRecord as Run, StepStateRecord as StepState};

/// Outcome of walking the graph against the current step states.
#[derive(Debug, Clone, PartialEq)]
enum NodeResult {
    /// Nothing in this node is finished; zero or more steps were newly
    /// marked ready and pushed into the caller's ready list.
    Running,
    Done(Option<Value>),
    Failed(String),
}

/// Drives a single run forward: computes the ready frontier of a graph and
/// applies step outcomes, re-deriving readiness after each one.
pub struct RunStateMachine {
    store: Arc<dyn Store>,
}

impl RunStateMachine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Creates a new run and, if `def.concurrency` still has headroom, starts
    /// it immediately; otherwise the run is left `pending` (queued) for
    /// [`RunStateMachine::promote_queued`] to pick up once a sibling run of
    /// the same workflow finishes.
    pub async fn start_run(&self, def: &WorkflowDef, payload: Value) -> Result<RunRecord, StoreError> {
        let run_id = self.store.create_run(&def.id, payload).await?;
        if self.has_capacity(def).await? {
            self.store
                .update_run_status(run_id, RunStatus::Running, Utc::now(), None)
                .await?;
            self.advance(def, run_id).await?;
        }
        self.store.get_run(run_id).await
    }

    async fn has_capacity(&self, def: &WorkflowDef) -> Result<bool, StoreError> {
        match def.concurrency {
            Some(limit) => Ok(self.store.count_active_runs(&def.id).await? < limit),
            None => Ok(true),
        }
    }

    /// Promotes as many `pending` (queued-over-concurrency-cap) runs of `def`
    /// to `running` as current capacity allows, oldest first. A no-op for
    /// workflows without a declared `concurrency` limit.
    pub async fn promote_queued(&self, def: &WorkflowDef) -> Result<(), StoreError> {
        let Some(limit) = def.concurrency else {
            return Ok(());
        };
        let mut active = self.store.count_active_runs(&def.id).await?;
        if active >= limit {
            return Ok(());
        }
        let mut queued: Vec<RunRecord> = self
            .store
            .list_pending_runs()
            .await?
            .into_iter()
            .filter(|r| r.workflow_id == def.id && r.status == RunStatus::Pending)
            .collect();
        queued.sort_by_key(|r| r.started_at);

        for run in queued {
            if active >= limit {
                break;
            }
            self.store
                .update_run_status(run.id, RunStatus::Running, Utc::now(), None)
                .await?;
            self.advance(def, run.id).await?;
            active += 1;
        }
        Ok(())
    }

    /// Applies a reported step outcome, then recomputes readiness.
    ///
    /// `attempt`, when given, must match the step's currently-recorded
    /// attempt or the outcome is dropped: a stale worker reporting an
    /// outcome for an attempt that has since been retried (or whose step
    /// has moved on) must not clobber newer state. Callers that resolve a
    /// pause by token (sleep/event/human) rather than by job attempt pass
    /// `None`, relying on the terminal-state check below instead — a pause
    /// token is deleted on first resolution, so at most one caller ever
    /// reaches this method for a given pause.
    pub async fn report_outcome(
        &self,
        def: &WorkflowDef,
        run_id: Uuid,
        step_id: &str,
        attempt: Option<u32>,
        outcome: StepOutcome,
    ) -> Result<(), StoreError> {
        let current = match self.store.get_step_state(run_id, step_id).await {
            Ok(state) => state,
            Err(StoreError::StepStateNotFound { .. }) => StepStateRecord::pending(run_id, step_id),
            Err(err) => return Err(err),
        };

        // Already-terminal steps never transition again: a race loser
        // already marked `cancelled`, or a `waitForEvent` step already
        // resolved by a publish, must not be overwritten by a late-arriving
        // duplicate outcome (§4.1, §4.2).
        if current.status.is_terminal() {
            return Ok(());
        }
        if let Some(attempt) = attempt {
            if current.attempt != attempt {
                return Ok(());
            }
        }

        let mut next = current.clone();
        next.completed_at = Some(Utc::now());
        match outcome {
            StepOutcome::Succeeded(output) => {
                next.status = StepStatus::Succeeded;
                next.output = Some(output);
                next.error = None;
            }
            StepOutcome::Failed { message, retryable } => {
                if retryable {
                    // Caller (dispatcher) is responsible for re-enqueuing the
                    // retry job; the state machine just records the failure
                    // cause and leaves the step `Running` so it isn't treated
                    // as a terminal failure until retries are exhausted.
                    next.status = StepStatus::Running;
                    next.error = Some(message);
                    self.store
                        .upsert_step_state(next, Some(current.status))
                        .await?;
                    return Ok(());
                }
                next.status = StepStatus::Failed;
                next.error = Some(message);
            }
            StepOutcome::Pending { token } => {
                next.status = StepStatus::Running;
                next.output = Some(Value::String(token));
                next.completed_at = None;
            }
        }

        self.store
            .upsert_step_state(next, Some(current.status))
            .await?;
        self.advance(def, run_id).await
    }

    /// Walks the graph, enqueues newly-ready steps, and updates run status
    /// when the whole graph has finished (successfully or not).
    pub async fn advance(&self, def: &WorkflowDef, run_id: Uuid) -> Result<(), StoreError> {
        let states = self.load_states(run_id).await?;
        let mut walk = Walk {
            states: &states,
            def,
            ready: Vec::new(),
            skip: Vec::new(),
            cancel: Vec::new(),
        };
        let result = evaluate_block(&def.graph.body, &mut walk);
        let Walk { ready, skip, cancel, .. } = walk;

        for step_id in ready {
            if states.contains_key(&step_id) {
                continue;
            }
            let background = def
                .step(&step_id)
                .and_then(|s| s.options.background)
                .unwrap_or(false);
            let state = StepStateRecord::pending(run_id, &step_id);
            self.store.upsert_step_state(state, None).await?;
            self.store
                .enqueue_job(JobRecord {
                    id: Uuid::now_v7(),
                    run_id,
                    workflow_id: def.id.clone(),
                    step_id,
                    attempt: 1,
                    enqueued_at: Utc::now(),
                    deadline: None,
                    background,
                })
                .await?;
        }

        self.terminalize(run_id, &states, skip, StepStatus::Skipped).await?;
        self.terminalize(run_id, &states, cancel, StepStatus::Cancelled).await?;

        match result {
            NodeResult::Running => {}
            NodeResult::Done(output) => {
                if let Some(output) = output.clone() {
                    self.store.set_run_last_output(run_id, output).await?;
                }
                self.store
                    .update_run_status(run_id, RunStatus::Completed, Utc::now(), None)
                    .await?;
            }
            NodeResult::Failed(message) => {
                self.store
                    .update_run_status(run_id, RunStatus::Failed, Utc::now(), Some(message))
                    .await?;
            }
        }

        Ok(())
    }

    async fn load_states(&self, run_id: Uuid) -> Result<HashMap<String, StepStateRecord>, StoreError> {
        let list = self.store.list_step_states(run_id).await?;
        Ok(list.into_iter().map(|s| (s.step_id.clone(), s)).collect())
    }

    /// Forces every (non-terminal) step in `step_ids` to `status`, whether it
    /// never ran at all (`skip`'s untaken branches) or was already `ready`/
    /// `running` when it lost (`cancel`'s race losers).
    async fn terminalize(
        &self,
        run_id: Uuid,
        states: &HashMap<String, StepStateRecord>,
        step_ids: Vec<String>,
        status: StepStatus,
    ) -> Result<(), StoreError> {
        for step_id in step_ids {
            match states.get(&step_id) {
                Some(existing) if existing.status.is_terminal() => continue,
                Some(existing) => {
                    let mut next = existing.clone();
                    next.status = status;
                    next.completed_at = Some(Utc::now());
                    self.store.upsert_step_state(next, Some(existing.status)).await?;
                }
                None => {
                    let mut state = StepStateRecord::pending(run_id, &step_id);
                    state.status = status;
                    state.completed_at = Some(Utc::now());
                    self.store.upsert_step_state(state, None).await?;
                }
            }
        }
        Ok(())
    }
}

/// Threaded through one readiness walk: the step states it reads, the
/// definition it consults for per-step options (background flag), and the
/// three step-id buckets the walk accumulates as it goes.
struct Walk<'a> {
    states: &'a HashMap<String, StepStateRecord>,
    def: &'a WorkflowDef,
    ready: Vec<String>,
    /// Steps in a branch that was not taken (the other side of an `if`) or
    /// that followed a step that failed — never executed, terminal `skipped`.
    skip: Vec<String>,
    /// Steps in a `race` group that lost to a sibling that already succeeded.
    cancel: Vec<String>,
}

fn lookup(walk: &Walk<'_>, step_id: &str) -> NodeResult {
    match walk.states.get(step_id) {
        None => NodeResult::Running,
        Some(state) => match state.status {
            StepStatus::Succeeded => NodeResult::Done(state.output.clone()),
            StepStatus::Skipped => NodeResult::Done(None),
            StepStatus::Failed => {
                NodeResult::Failed(state.error.clone().unwrap_or_else(|| "step failed".into()))
            }
            StepStatus::Cancelled => NodeResult::Failed("step cancelled".into()),
            StepStatus::Running => {
                // A `background: true` step never blocks the enclosing block;
                // its real terminal status is still recorded independently.
                let background = walk
                    .def
                    .step(step_id)
                    .and_then(|s| s.options.background)
                    .unwrap_or(false);
                if background {
                    NodeResult::Done(None)
                } else {
                    NodeResult::Running
                }
            }
            _ => NodeResult::Running,
        },
    }
}

/// Collects every leaf step id reachable under `nodes`, including nested
/// branches, so an unreached subtree can be marked `skipped`/`cancelled` in
/// one pass instead of re-walking per leaf.
fn collect_step_ids(nodes: &[Node], out: &mut Vec<String>) {
    for node in nodes {
        match node {
            Node::Action(id)
            | Node::ForEach(id)
            | Node::Batch(id)
            | Node::Sleep(id)
            | Node::WaitForEvent(id)
            | Node::Human(id)
            | Node::Cancel(id)
            | Node::Subflow(id) => out.push(id.clone()),
            Node::If { branches, else_body } => {
                for branch in branches {
                    out.push(branch.condition_step_id.clone());
                    collect_step_ids(&branch.body, out);
                }
                if let Some(body) = else_body {
                    collect_step_ids(body, out);
                }
            }
            Node::Parallel { branches, .. } | Node::Race { branches, .. } => {
                for branch in branches {
                    collect_step_ids(branch, out);
                }
            }
        }
    }
}

/// Evaluates a sequential block: each node must reach `Done` before the
/// next one is considered ready. A node that fails skips every remaining
/// sibling in the block rather than leaving them without a step state.
fn evaluate_block(body: &[Node], walk: &mut Walk<'_>) -> NodeResult {
    let mut last_output = None;
    for (idx, node) in body.iter().enumerate() {
        match evaluate_node(node, walk) {
            NodeResult::Running => return NodeResult::Running,
            NodeResult::Failed(msg) => {
                collect_step_ids(&body[idx + 1..], &mut walk.skip);
                return NodeResult::Failed(msg);
            }
            NodeResult::Done(output) => last_output = output,
        }
    }
    NodeResult::Done(last_output)
}

fn evaluate_node(node: &Node, walk: &mut Walk<'_>) -> NodeResult {
    match node {
        Node::Action(id)
        | Node::ForEach(id)
        | Node::Batch(id)
        | Node::Sleep(id)
        | Node::WaitForEvent(id)
        | Node::Human(id)
        | Node::Cancel(id)
        | Node::Subflow(id) => {
            let result = lookup(walk, id);
            if result == NodeResult::Running {
                walk.ready.push(id.clone());
            }
            result
        }
        Node::If { branches, else_body } => {
            for (bi, branch) in branches.iter().enumerate() {
                match lookup(walk, &branch.condition_step_id) {
                    NodeResult::Running => {
                        walk.ready.push(branch.condition_step_id.clone());
                        return NodeResult::Running;
                    }
                    NodeResult::Failed(msg) => return NodeResult::Failed(msg),
                    NodeResult::Done(output) => {
                        let matched = output.as_ref().and_then(Value::as_bool).unwrap_or(false);
                        if matched {
                            // Every later branch and the else body were never
                            // entered; their steps are `skipped`, not absent.
                            for later in &branches[bi + 1..] {
                                collect_step_ids(&later.body, &mut walk.skip);
                            }
                            if let Some(body) = else_body {
                                collect_step_ids(body, &mut walk.skip);
                            }
                            return evaluate_block(&branch.body, walk);
                        }
                        collect_step_ids(&branch.body, &mut walk.skip);
                    }
                }
            }
            match else_body {
                Some(body) => evaluate_block(body, walk),
                None => NodeResult::Done(None),
            }
        }
        Node::Parallel { branches, .. } => {
            let mut all_done = true;
            let mut last_output = None;
            for branch in branches {
                match evaluate_block(branch, walk) {
                    NodeResult::Running => all_done = false,
                    NodeResult::Failed(msg) => return NodeResult::Failed(msg),
                    NodeResult::Done(output) => last_output = output.or(last_output),
                }
            }
            if all_done {
                NodeResult::Done(last_output)
            } else {
                NodeResult::Running
            }
        }
        Node::Race { branches, .. } => {
            let mut any_running = false;
            let mut failures = 0usize;
            for (bi, branch) in branches.iter().enumerate() {
                match evaluate_block(branch, walk) {
                    NodeResult::Done(output) => {
                        // First sibling to finish wins; the rest are
                        // cancelled outright, no retries attempted.
                        for (oi, other) in branches.iter().enumerate() {
                            if oi != bi {
                                collect_step_ids(other, &mut walk.cancel);
                            }
                        }
                        return NodeResult::Done(output);
                    }
                    NodeResult::Running => any_running = true,
                    NodeResult::Failed(_) => failures += 1,
                }
            }
            if failures == branches.len() {
                NodeResult::Failed("all race branches failed".into())
            } else if any_running {
                NodeResult::Running
            } else {
                NodeResult::Done(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowDef;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn def(steps: Value) -> WorkflowDef {
        WorkflowDef::from_json(&json!({"id": "w1", "steps": steps, "triggers": []})).unwrap()
    }

    async fn succeed(store: &InMemoryStore, run_id: Uuid, step_id: &str, output: Value) {
        let mut state = store.get_step_state(run_id, step_id).await.unwrap();
        state.status = StepStatus::Succeeded;
        state.output = Some(output);
        store.upsert_step_state(state, None).await.unwrap();
    }

    async fn exists(store: &InMemoryStore, run_id: Uuid, step_id: &str) -> bool {
        store.get_step_state(run_id, step_id).await.is_ok()
    }

    #[tokio::test]
    async fn linear_success_completes_run() {
        let store = Arc::new(InMemoryStore::new());
        let machine = RunStateMachine::new(store.clone());
        let def = def(json!([
            {"id": "a", "type": "action"},
            {"id": "b", "type": "action"},
        ]));

        let run = machine.start_run(&def, json!({})).await.unwrap();
        assert!(exists(&store, run.id, "a").await);
        assert!(!exists(&store, run.id, "b").await);

        succeed(&store, run.id, "a", json!(1)).await;
        machine.advance(&def, run.id).await.unwrap();
        assert!(exists(&store, run.id, "b").await);

        succeed(&store, run.id, "b", json!(2)).await;
        machine.advance(&def, run.id).await.unwrap();
        let run = store.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.last_output, Some(json!(2)));
    }

    #[tokio::test]
    async fn conditional_branch_skips_else() {
        let store = Arc::new(InMemoryStore::new());
        let machine = RunStateMachine::new(store.clone());
        let def = def(json!([
            {"id": "if1", "type": "control", "kind": "if"},
            {"id": "x", "type": "action"},
            {"id": "else1", "type": "control", "kind": "else"},
            {"id": "y", "type": "action"},
            {"id": "endif1", "type": "control", "kind": "endIf"},
        ]));

        let run = machine.start_run(&def, json!({})).await.unwrap();
        succeed(&store, run.id, "if1", json!(true)).await;
        machine.advance(&def, run.id).await.unwrap();

        assert!(exists(&store, run.id, "x").await);
        let y = store.get_step_state(run.id, "y").await.unwrap();
        assert_eq!(y.status, StepStatus::Skipped);

        succeed(&store, run.id, "x", json!("done")).await;
        machine.advance(&def, run.id).await.unwrap();
        let run = store.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn parallel_fan_in_waits_for_all_branches() {
        let store = Arc::new(InMemoryStore::new());
        let machine = RunStateMachine::new(store.clone());
        let def = def(json!([
            {"id": "p1", "type": "control", "kind": "parallel", "parallelGroupId": "g", "parallelStepCount": 2},
            {"id": "p2", "type": "control", "kind": "parallel", "parallelGroupId": "g", "parallelStepCount": 2},
        ]));

        let run = machine.start_run(&def, json!({})).await.unwrap();
        assert!(exists(&store, run.id, "p1").await);
        assert!(exists(&store, run.id, "p2").await);

        succeed(&store, run.id, "p1", json!("a")).await;
        machine.advance(&def, run.id).await.unwrap();
        let run_mid = store.get_run(run.id).await.unwrap();
        assert_eq!(run_mid.status, RunStatus::Running);

        succeed(&store, run.id, "p2", json!("b")).await;
        machine.advance(&def, run.id).await.unwrap();
        let run = store.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn failure_short_circuits_parallel_group() {
        let store = Arc::new(InMemoryStore::new());
        let machine = RunStateMachine::new(store.clone());
        let def = def(json!([
            {"id": "p1", "type": "control", "kind": "parallel", "parallelGroupId": "g", "parallelStepCount": 2},
            {"id": "p2", "type": "control", "kind": "parallel", "parallelGroupId": "g", "parallelStepCount": 2},
        ]));

        let run = machine.start_run(&def, json!({})).await.unwrap();
        let mut state = store.get_step_state(run.id, "p1").await.unwrap();
        state.status = StepStatus::Failed;
        state.error = Some("boom".into());
        store.upsert_step_state(state, None).await.unwrap();

        machine.advance(&def, run.id).await.unwrap();
        let run = store.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn failed_step_skips_remaining_siblings() {
        let store = Arc::new(InMemoryStore::new());
        let machine = RunStateMachine::new(store.clone());
        let def = def(json!([
            {"id": "a", "type": "action"},
            {"id": "b", "type": "action"},
            {"id": "c", "type": "action"},
        ]));

        let run = machine.start_run(&def, json!({})).await.unwrap();
        let mut state = store.get_step_state(run.id, "a").await.unwrap();
        state.status = StepStatus::Failed;
        state.error = Some("boom".into());
        store.upsert_step_state(state, None).await.unwrap();

        machine.advance(&def, run.id).await.unwrap();
        let b = store.get_step_state(run.id, "b").await.unwrap();
        let c = store.get_step_state(run.id, "c").await.unwrap();
        assert_eq!(b.status, StepStatus::Skipped);
        assert_eq!(c.status, StepStatus::Skipped);
        let run = store.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn race_winner_cancels_remaining_siblings() {
        let store = Arc::new(InMemoryStore::new());
        let machine = RunStateMachine::new(store.clone());
        let def = def(json!([
            {"id": "r1", "type": "control", "kind": "race", "parallelGroupId": "g", "parallelStepCount": 2},
            {"id": "r2", "type": "control", "kind": "race", "parallelGroupId": "g", "parallelStepCount": 2},
        ]));

        let run = machine.start_run(&def, json!({})).await.unwrap();
        assert!(exists(&store, run.id, "r1").await);
        assert!(exists(&store, run.id, "r2").await);

        succeed(&store, run.id, "r1", json!("winner")).await;
        machine.advance(&def, run.id).await.unwrap();

        let r2 = store.get_step_state(run.id, "r2").await.unwrap();
        assert_eq!(r2.status, StepStatus::Cancelled);
        let run = store.get_run(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.last_output, Some(json!("winner")));
    }

    #[tokio::test]
    async fn concurrency_cap_queues_runs_beyond_the_limit() {
        let store = Arc::new(InMemoryStore::new());
        let machine = RunStateMachine::new(store.clone());
        let def = WorkflowDef::from_json(&json!({
            "id": "w1",
            "concurrency": 1,
            "steps": [{"id": "a", "type": "action"}],
            "triggers": [],
        }))
        .unwrap();

        let run1 = machine.start_run(&def, json!({"n": 1})).await.unwrap();
        assert_eq!(run1.status, RunStatus::Running);
        assert!(exists(&store, run1.id, "a").await);

        let run2 = machine.start_run(&def, json!({"n": 2})).await.unwrap();
        assert_eq!(run2.status, RunStatus::Pending);
        assert!(!exists(&store, run2.id, "a").await);

        succeed(&store, run1.id, "a", json!("done")).await;
        machine.advance(&def, run1.id).await.unwrap();
        let run1 = store.get_run(run1.id).await.unwrap();
        assert_eq!(run1.status, RunStatus::Completed);

        machine.promote_queued(&def).await.unwrap();
        let run2 = store.get_run(run2.id).await.unwrap();
        assert_eq!(run2.status, RunStatus::Running);
        assert!(exists(&store, run2.id, "a").await);
    }

    #[tokio::test]
    async fn report_outcome_ignores_already_terminal_step() {
        let store = Arc::new(InMemoryStore::new());
        let machine = RunStateMachine::new(store.clone());
        let def = def(json!([{"id": "a", "type": "action"}]));

        let run = machine.start_run(&def, json!({})).await.unwrap();
        machine
            .report_outcome(&def, run.id, "a", None, StepOutcome::Succeeded(json!("first")))
            .await
            .unwrap();
        let a = store.get_step_state(run.id, "a").await.unwrap();
        assert_eq!(a.status, StepStatus::Succeeded);
        assert_eq!(a.output, Some(json!("first")));

        // A duplicate/late outcome for an already-terminal step (e.g. a
        // `waitForEvent` timeout firing after the event already resolved
        // it) must not clobber the recorded result.
        machine
            .report_outcome(&def, run.id, "a", None, StepOutcome::Succeeded(json!("late")))
            .await
            .unwrap();
        let a = store.get_step_state(run.id, "a").await.unwrap();
        assert_eq!(a.status, StepStatus::Succeeded);
        assert_eq!(a.output, Some(json!("first")));
    }

    #[tokio::test]
    async fn report_outcome_ignores_stale_attempt() {
        let store = Arc::new(InMemoryStore::new());
        let machine = RunStateMachine::new(store.clone());
        let def = def(json!([{"id": "a", "type": "action"}]));

        let run = machine.start_run(&def, json!({})).await.unwrap();
        let mut state = store.get_step_state(run.id, "a").await.unwrap();
        state.attempt = 2;
        store.upsert_step_state(state, None).await.unwrap();

        // A worker reporting for attempt 1, after the step has already
        // moved on to attempt 2 via retry, must be dropped.
        machine
            .report_outcome(&def, run.id, "a", Some(1), StepOutcome::Succeeded(json!("stale")))
            .await
            .unwrap();
        let a = store.get_step_state(run.id, "a").await.unwrap();
        assert_eq!(a.status, StepStatus::Pending);
        assert_ne!(a.output, Some(json!("stale")));

        machine
            .report_outcome(&def, run.id, "a", Some(2), StepOutcome::Succeeded(json!("current")))
            .await
            .unwrap();
        let a = store.get_step_state(run.id, "a").await.unwrap();
        assert_eq!(a.status, StepStatus::Succeeded);
        assert_eq!(a.output, Some(json!("current")));
    }
}
