//! The single in-memory table of registered [`WorkflowDef`]s, shared by the
//! [`crate::dispatcher::Dispatcher`], [`crate::trigger::TriggerRegistry`],
//! and [`crate::engine::Engine`] so there is exactly one place a workflow id
//! resolves to a typed definition.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::definition::WorkflowDef;

#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<WorkflowDef>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, def: WorkflowDef) -> Arc<WorkflowDef> {
        let def = Arc::new(def);
        self.workflows.write().insert(def.id.clone(), def.clone());
        def
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkflowDef>> {
        self.workflows.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<WorkflowDef>> {
        self.workflows.write().remove(id)
    }

    pub fn list(&self) -> Vec<Arc<WorkflowDef>> {
        self.workflows.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_then_get_round_trips() {
        let registry = WorkflowRegistry::new();
        let def = WorkflowDef::from_json(&json!({
            "id": "w1",
            "steps": [{"id": "a", "type": "action"}],
            "triggers": [],
        }))
        .unwrap();
        registry.insert(def);
        assert!(registry.get("w1").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.list().len(), 1);
    }
}
