//! Definition lookup.
//!
//! The engine resolves task references through a [`DefinitionSource`];
//! where definitions come from (a cluster resource store, files, an
//! API) is the caller's concern. Resolution happens once per
//! execution, before planning, and the resolved definitions are held
//! for the execution's lifetime.

use crate::workflow::{WorkflowDefinition, WorkflowTask};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// Look up a reusable task by name within a namespace.
    async fn lookup_task(&self, name: &str, namespace: &str) -> Option<Arc<WorkflowTask>>;

    /// Look up a workflow definition by name within a namespace.
    async fn lookup_workflow(&self, name: &str, namespace: &str)
    -> Option<Arc<WorkflowDefinition>>;
}

/// In-memory definition store. The CLI loads YAML files into one of
/// these; embedders can register definitions programmatically.
#[derive(Default)]
pub struct InMemoryRegistry {
    tasks: RwLock<HashMap<(String, String), Arc<WorkflowTask>>>,
    workflows: RwLock<HashMap<(String, String), Arc<WorkflowDefinition>>>,
}

impl InMemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_task(&self, task: WorkflowTask) {
        let key = (task.namespace.clone(), task.name.clone());
        self.tasks.write().insert(key, Arc::new(task));
    }

    pub fn register_workflow(&self, workflow: WorkflowDefinition) {
        let key = (workflow.namespace.clone(), workflow.name.clone());
        self.workflows.write().insert(key, Arc::new(workflow));
    }
}

#[async_trait]
impl DefinitionSource for InMemoryRegistry {
    async fn lookup_task(&self, name: &str, namespace: &str) -> Option<Arc<WorkflowTask>> {
        self.tasks
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    async fn lookup_workflow(
        &self,
        name: &str,
        namespace: &str,
    ) -> Option<Arc<WorkflowDefinition>> {
        self.workflows
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}
