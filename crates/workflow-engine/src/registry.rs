//! Lookup of workflows by id.

use std::collections::HashMap;
use std::sync::Arc;

use crate::workflow::Workflow;

/// Workflows known to an orchestrator, keyed by [`Workflow::id`].
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a workflow, replacing and returning any previous one with the same id.
    pub fn register(&mut self, workflow: Arc<dyn Workflow>) -> Option<Arc<dyn Workflow>> {
        self.workflows.insert(workflow.id().to_string(), workflow)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, workflow: Arc<dyn Workflow>) -> Self {
        self.register(workflow);
        self
    }

    pub fn get(&self, workflow_id: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(workflow_id).cloned()
    }

    pub fn contains(&self, workflow_id: &str) -> bool {
        self.workflows.contains_key(workflow_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .finish()
    }
}
