//! In-memory typed workflow definition, parsed and validated from the
//! ingress JSON schema of the wire contract.
//!
//! Validation happens once, at `register()` time: step id uniqueness,
//! `parallelGroupId` sibling counts, and `if`/`elseIf`/`else`/`endIf` nesting
//! balance. A malformed definition never reaches the run state machine. The
//! same pass also binds the flat step stream into a typed [`Graph`] so
//! `RunStateMachine` never has to re-derive block structure at run time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("workflow id must be non-empty")]
    EmptyId,

    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),

    #[error("step {0} has kind {1:?} which requires control type")]
    KindRequiresControl(String, ControlKind),

    #[error("parallelGroupId {group} declares {declared} siblings but {found} steps reference it")]
    ParallelGroupMismatch {
        group: String,
        declared: u32,
        found: u32,
    },

    #[error("unmatched `endIf` at step {0}")]
    UnmatchedEndIf(String),

    #[error("unmatched `if` block starting at step {0} (missing endIf)")]
    UnmatchedIf(String),

    #[error("`{0}` at step {1} must appear between `if` and `endIf`")]
    DanglingBranch(&'static str, String),

    #[error("invalid JSON for workflow definition: {0}")]
    Json(#[from] serde_json::Error),
}

/// Step payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Action,
    Control,
}

/// Control-step sub-kind, only meaningful when `type = "control"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlKind {
    If,
    ElseIf,
    Else,
    EndIf,
    Parallel,
    Race,
    ForEach,
    Batch,
    Sleep,
    WaitForEvent,
    Human,
    Cancel,
    Subflow,
}

/// Backoff strategy for a step's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

/// Wire-format retry policy attached to a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDef {
    pub attempts: u32,
    pub strategy: BackoffStrategy,
    #[serde(rename = "delayMs")]
    pub delay_ms: u64,
    #[serde(rename = "maxBackoffMs", default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub jitter: Option<bool>,
}

/// Per-step execution options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOptions {
    #[serde(rename = "timeoutMs", default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryDef>,
    #[serde(rename = "cacheKey", default)]
    pub cache_key: Option<String>,
    #[serde(rename = "cacheTtlMs", default)]
    pub cache_ttl_ms: Option<u64>,
    #[serde(default)]
    pub background: Option<bool>,
}

/// One node in the workflow's step graph, in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub kind: Option<ControlKind>,
    #[serde(flatten)]
    pub options: StepOptions,
    #[serde(rename = "parallelGroupId", default)]
    pub parallel_group_id: Option<String>,
    #[serde(rename = "parallelStepCount", default)]
    pub parallel_step_count: Option<u32>,
    #[serde(default)]
    pub extra: Option<Value>,
    /// Position in the declared step list; set by the parser, not the wire format.
    #[serde(skip)]
    pub index: usize,
}

impl StepDef {
    pub fn is_control(&self, kind: ControlKind) -> bool {
        self.step_type == StepType::Control && self.kind == Some(kind)
    }
}

/// Tagged-union trigger declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerDef {
    Webhook {
        path: String,
        method: String,
        #[serde(rename = "requiredHeaders", default)]
        required_headers: HashMap<String, String>,
    },
    Schedule {
        cron: String,
    },
    Manual,
    Event {
        name: String,
    },
}

/// Raw wire document, deserialized before validation produces a [`WorkflowDef`].
#[derive(Debug, Deserialize)]
struct WireWorkflow {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    concurrency: Option<u32>,
    steps: Vec<WireStep>,
    #[serde(default)]
    triggers: Vec<WireTrigger>,
}

#[derive(Debug, Deserialize)]
struct WireStep {
    id: String,
    #[serde(rename = "type")]
    step_type: StepType,
    #[serde(default)]
    kind: Option<ControlKind>,
    #[serde(rename = "timeoutMs", default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    retry: Option<RetryDef>,
    #[serde(rename = "cacheKey", default)]
    cache_key: Option<String>,
    #[serde(rename = "cacheTtlMs", default)]
    cache_ttl_ms: Option<u64>,
    #[serde(rename = "parallelGroupId", default)]
    parallel_group_id: Option<String>,
    #[serde(rename = "parallelStepCount", default)]
    parallel_step_count: Option<u32>,
    #[serde(default)]
    background: Option<bool>,
    #[serde(default)]
    extra: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTriggerWrapper {
    webhook: Option<WireWebhookTrigger>,
    schedule: Option<WireScheduleTrigger>,
    manual: Option<serde_json::Map<String, Value>>,
    event: Option<WireEventTrigger>,
}

#[derive(Debug, Deserialize)]
struct WireWebhookTrigger {
    path: String,
    method: String,
    #[serde(rename = "requiredHeaders", default)]
    required_headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct WireScheduleTrigger {
    cron: String,
}

#[derive(Debug, Deserialize)]
struct WireEventTrigger {
    name: String,
}

type WireTrigger = WireTriggerWrapper;

impl From<WireTriggerWrapper> for TriggerDef {
    fn from(w: WireTriggerWrapper) -> Self {
        if let Some(webhook) = w.webhook {
            TriggerDef::Webhook {
                path: webhook.path,
                method: webhook.method,
                required_headers: webhook.required_headers,
            }
        } else if let Some(schedule) = w.schedule {
            TriggerDef::Schedule { cron: schedule.cron }
        } else if let Some(event) = w.event {
            TriggerDef::Event { name: event.name }
        } else {
            TriggerDef::Manual
        }
    }
}

/// A fully validated, in-memory workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowDef {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub concurrency: Option<u32>,
    pub steps: Vec<StepDef>,
    pub triggers: Vec<TriggerDef>,
    pub created_at: DateTime<Utc>,
    pub graph: Graph,
}

impl WorkflowDef {
    pub fn from_json(json: &Value) -> Result<Self, DefinitionError> {
        let wire: WireWorkflow = serde_json::from_value(json.clone())?;
        if wire.id.trim().is_empty() {
            return Err(DefinitionError::EmptyId);
        }

        let mut steps = Vec::with_capacity(wire.steps.len());
        let mut seen = std::collections::HashSet::new();
        for (index, s) in wire.steps.into_iter().enumerate() {
            if !seen.insert(s.id.clone()) {
                return Err(DefinitionError::DuplicateStepId(s.id));
            }
            steps.push(StepDef {
                id: s.id,
                step_type: s.step_type,
                kind: s.kind,
                options: StepOptions {
                    timeout_ms: s.timeout_ms,
                    retry: s.retry,
                    cache_key: s.cache_key,
                    cache_ttl_ms: s.cache_ttl_ms,
                    background: s.background,
                },
                parallel_group_id: s.parallel_group_id,
                parallel_step_count: s.parallel_step_count,
                extra: s.extra,
                index,
            });
        }

        validate_parallel_groups(&steps)?;
        let graph = Graph::build(&steps)?;

        let triggers = wire.triggers.into_iter().map(TriggerDef::from).collect();

        Ok(Self {
            id: wire.id,
            name: wire.name,
            description: wire.description,
            concurrency: wire.concurrency,
            steps,
            triggers,
            created_at: Utc::now(),
            graph,
        })
    }

    pub fn step(&self, id: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.id == id)
    }
}

fn validate_parallel_groups(steps: &[StepDef]) -> Result<(), DefinitionError> {
    let mut declared: HashMap<String, u32> = HashMap::new();
    let mut counts: HashMap<String, u32> = HashMap::new();
    for step in steps {
        if let Some(group) = &step.parallel_group_id {
            *counts.entry(group.clone()).or_insert(0) += 1;
            if let Some(n) = step.parallel_step_count {
                declared.insert(group.clone(), n);
            }
        }
    }
    for (group, found) in &counts {
        if let Some(&expected) = declared.get(group) {
            if expected != *found {
                return Err(DefinitionError::ParallelGroupMismatch {
                    group: group.clone(),
                    declared: expected,
                    found: *found,
                });
            }
        }
    }
    Ok(())
}

/// One node of the typed control-flow tree bound at registration time.
#[derive(Debug, Clone)]
pub enum Node {
    Action(String),
    If {
        /// First entry is the `if` branch, remainder are `elseIf`s, in order.
        branches: Vec<Branch>,
        else_body: Option<Vec<Node>>,
    },
    Parallel {
        group_id: String,
        branches: Vec<Vec<Node>>,
    },
    Race {
        group_id: String,
        branches: Vec<Vec<Node>>,
    },
    ForEach(String),
    Batch(String),
    Sleep(String),
    WaitForEvent(String),
    Human(String),
    Cancel(String),
    Subflow(String),
}

/// One branch of an `if`/`elseIf` chain: the condition pseudo-step id and its body.
#[derive(Debug, Clone)]
pub struct Branch {
    pub condition_step_id: String,
    pub body: Vec<Node>,
}

/// The typed control-flow tree `RunStateMachine` walks for readiness decisions.
#[derive(Debug, Clone)]
pub struct Graph {
    pub body: Vec<Node>,
}

impl Graph {
    /// Binds the flat, declaration-ordered step stream into a nested tree,
    /// balancing `if`/`elseIf`/`else`/`endIf` and grouping `parallel`/`race`
    /// siblings that share a `parallelGroupId`.
    fn build(steps: &[StepDef]) -> Result<Self, DefinitionError> {
        let mut pos = 0;
        let body = parse_block(steps, &mut pos, false)?;
        if pos != steps.len() {
            // An `endIf` consumed at top level with no matching `if`.
            return Err(DefinitionError::UnmatchedEndIf(steps[pos].id.clone()));
        }
        Ok(Graph { body })
    }
}

/// Parses one block (a run of steps) starting at `*pos`, stopping at a
/// matching `endIf`/`else`/`elseIf` when `stop_at_branch` is set (i.e. we are
/// inside an `if` chain), or at end-of-input otherwise.
fn parse_block(
    steps: &[StepDef],
    pos: &mut usize,
    stop_at_branch: bool,
) -> Result<Vec<Node>, DefinitionError> {
    let mut nodes = Vec::new();

    while *pos < steps.len() {
        let step = &steps[*pos];

        if stop_at_branch
            && (step.is_control(ControlKind::ElseIf)
                || step.is_control(ControlKind::Else)
                || step.is_control(ControlKind::EndIf))
        {
            break;
        }

        if step.step_type != StepType::Control {
            nodes.push(Node::Action(step.id.clone()));
            *pos += 1;
            continue;
        }

        match step.kind {
            Some(ControlKind::If) => {
                let if_step_id = step.id.clone();
                *pos += 1;
                let mut branches = vec![Branch {
                    condition_step_id: if_step_id,
                    body: parse_block(steps, pos, true)?,
                }];
                let mut else_body = None;

                loop {
                    if *pos >= steps.len() {
                        return Err(DefinitionError::UnmatchedIf(branches[0].condition_step_id.clone()));
                    }
                    let marker = &steps[*pos];
                    if marker.is_control(ControlKind::ElseIf) {
                        let cond_id = marker.id.clone();
                        *pos += 1;
                        branches.push(Branch {
                            condition_step_id: cond_id,
                            body: parse_block(steps, pos, true)?,
                        });
                    } else if marker.is_control(ControlKind::Else) {
                        *pos += 1;
                        else_body = Some(parse_block(steps, pos, true)?);
                    } else if marker.is_control(ControlKind::EndIf) {
                        *pos += 1;
                        break;
                    } else {
                        return Err(DefinitionError::UnmatchedIf(branches[0].condition_step_id.clone()));
                    }
                }

                nodes.push(Node::If { branches, else_body });
            }
            Some(ControlKind::ElseIf) => {
                return Err(DefinitionError::DanglingBranch("elseIf", step.id.clone()));
            }
            Some(ControlKind::Else) => {
                return Err(DefinitionError::DanglingBranch("else", step.id.clone()));
            }
            Some(ControlKind::EndIf) => {
                return Err(DefinitionError::UnmatchedEndIf(step.id.clone()));
            }
            Some(ControlKind::Parallel) | Some(ControlKind::Race) => {
                let is_race = step.kind == Some(ControlKind::Race);
                let group_id = step
                    .parallel_group_id
                    .clone()
                    .unwrap_or_else(|| step.id.clone());
                let mut branches = Vec::new();
                while *pos < steps.len() {
                    let sibling = &steps[*pos];
                    let matches_group = sibling.parallel_group_id.as_deref() == Some(group_id.as_str())
                        && sibling.kind == step.kind;
                    if !matches_group {
                        break;
                    }
                    branches.push(vec![Node::Action(sibling.id.clone())]);
                    *pos += 1;
                }
                nodes.push(if is_race {
                    Node::Race { group_id, branches }
                } else {
                    Node::Parallel { group_id, branches }
                });
            }
            Some(ControlKind::ForEach) => {
                nodes.push(Node::ForEach(step.id.clone()));
                *pos += 1;
            }
            Some(ControlKind::Batch) => {
                nodes.push(Node::Batch(step.id.clone()));
                *pos += 1;
            }
            Some(ControlKind::Sleep) => {
                nodes.push(Node::Sleep(step.id.clone()));
                *pos += 1;
            }
            Some(ControlKind::WaitForEvent) => {
                nodes.push(Node::WaitForEvent(step.id.clone()));
                *pos += 1;
            }
            Some(ControlKind::Human) => {
                nodes.push(Node::Human(step.id.clone()));
                *pos += 1;
            }
            Some(ControlKind::Cancel) => {
                nodes.push(Node::Cancel(step.id.clone()));
                *pos += 1;
            }
            Some(ControlKind::Subflow) => {
                nodes.push(Node::Subflow(step.id.clone()));
                *pos += 1;
            }
            None => {
                return Err(DefinitionError::KindRequiresControl(
                    step.id.clone(),
                    ControlKind::If,
                ));
            }
        }
    }

    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wf(steps: Value, triggers: Value) -> Result<WorkflowDef, DefinitionError> {
        WorkflowDef::from_json(&json!({
            "id": "w1",
            "steps": steps,
            "triggers": triggers,
        }))
    }

    #[test]
    fn linear_three_steps() {
        let def = wf(
            json!([
                {"id": "a", "type": "action"},
                {"id": "b", "type": "action"},
                {"id": "c", "type": "action"},
            ]),
            json!([{"manual": {}}]),
        )
        .unwrap();
        assert_eq!(def.graph.body.len(), 3);
        assert!(matches!(def.triggers[0], TriggerDef::Manual));
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let err = wf(
            json!([
                {"id": "a", "type": "action"},
                {"id": "a", "type": "action"},
            ]),
            json!([]),
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateStepId(_)));
    }

    #[test]
    fn if_else_end_if_binds_into_tree() {
        let def = wf(
            json!([
                {"id": "if1", "type": "control", "kind": "if"},
                {"id": "x", "type": "action"},
                {"id": "else1", "type": "control", "kind": "else"},
                {"id": "y", "type": "action"},
                {"id": "endif1", "type": "control", "kind": "endIf"},
                {"id": "z", "type": "action"},
            ]),
            json!([]),
        )
        .unwrap();

        assert_eq!(def.graph.body.len(), 2);
        match &def.graph.body[0] {
            Node::If { branches, else_body } => {
                assert_eq!(branches.len(), 1);
                assert_eq!(branches[0].condition_step_id, "if1");
                assert!(matches!(&branches[0].body[0], Node::Action(id) if id == "x"));
                let else_body = else_body.as_ref().unwrap();
                assert!(matches!(&else_body[0], Node::Action(id) if id == "y"));
            }
            other => panic!("expected If node, got {other:?}"),
        }
        assert!(matches!(&def.graph.body[1], Node::Action(id) if id == "z"));
    }

    #[test]
    fn unmatched_if_is_rejected() {
        let err = wf(
            json!([{"id": "if1", "type": "control", "kind": "if"}]),
            json!([]),
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::UnmatchedIf(_)));
    }

    #[test]
    fn unmatched_end_if_is_rejected() {
        let err = wf(
            json!([{"id": "endif1", "type": "control", "kind": "endIf"}]),
            json!([]),
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::UnmatchedEndIf(_)));
    }

    #[test]
    fn parallel_group_sibling_count_must_match() {
        let err = wf(
            json!([
                {"id": "p1", "type": "control", "kind": "parallel", "parallelGroupId": "g1", "parallelStepCount": 3},
                {"id": "p2", "type": "control", "kind": "parallel", "parallelGroupId": "g1", "parallelStepCount": 3},
            ]),
            json!([]),
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::ParallelGroupMismatch { .. }));
    }

    #[test]
    fn parallel_group_groups_siblings_into_one_node() {
        let def = wf(
            json!([
                {"id": "p1", "type": "control", "kind": "parallel", "parallelGroupId": "g1", "parallelStepCount": 3},
                {"id": "p2", "type": "control", "kind": "parallel", "parallelGroupId": "g1", "parallelStepCount": 3},
                {"id": "p3", "type": "control", "kind": "parallel", "parallelGroupId": "g1", "parallelStepCount": 3},
                {"id": "q", "type": "action"},
            ]),
            json!([]),
        )
        .unwrap();
        assert_eq!(def.graph.body.len(), 2);
        match &def.graph.body[0] {
            Node::Parallel { branches, .. } => assert_eq!(branches.len(), 3),
            other => panic!("expected Parallel node, got {other:?}"),
        }
    }

    #[test]
    fn webhook_trigger_parses_required_headers() {
        let def = wf(
            json!([{"id": "a", "type": "action"}]),
            json!([{"webhook": {"path": "/hooks/a", "method": "POST", "requiredHeaders": {"X-Sig": "abc"}}}]),
        )
        .unwrap();
        match &def.triggers[0] {
            TriggerDef::Webhook { path, method, required_headers } => {
                assert_eq!(path, "/hooks/a");
                assert_eq!(method, "POST");
                assert_eq!(required_headers.get("X-Sig").unwrap(), "abc");
            }
            other => panic!("expected Webhook trigger, got {other:?}"),
        }
    }
}
