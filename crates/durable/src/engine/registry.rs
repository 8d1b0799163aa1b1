//! Workflow registry
//!
//! Maps workflow ids to their validated definitions. Definitions are
//! immutable once registered and shared with every running transaction.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::workflow::WorkflowDefinition;

/// Registry of workflow definitions
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
        }
    }

    /// Register a workflow definition
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register(order_workflow()?)?;
    /// ```
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), RegistryError> {
        let id = definition.id().to_string();
        if self.definitions.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        self.definitions.insert(id, Arc::new(definition));
        Ok(())
    }

    /// Look up a workflow definition
    pub fn get(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>, RegistryError> {
        self.definitions
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownWorkflow(workflow_id.to_string()))
    }

    /// Check if a workflow is registered
    pub fn contains(&self, workflow_id: &str) -> bool {
        self.definitions.contains_key(workflow_id)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Get all registered workflow ids
    pub fn workflow_ids(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_ids", &self.definitions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Workflow not registered
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// A workflow with this id is already registered
    #[error("workflow already registered: {0}")]
    AlreadyRegistered(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::handler_fn;
    use crate::workflow::{StepDefinition, WorkflowBuilder};
    use serde_json::Value;

    fn definition(id: &str) -> WorkflowDefinition {
        WorkflowBuilder::new(id)
            .step(StepDefinition::new(
                "a",
                handler_fn(|_| async { Ok(Value::Null) }),
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = WorkflowRegistry::new();
        registry.register(definition("orders")).unwrap();

        assert!(registry.contains("orders"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.get("orders").unwrap().id(), "orders");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_workflow() {
        let registry = WorkflowRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(
            registry.get("unknown").unwrap_err(),
            RegistryError::UnknownWorkflow("unknown".to_string())
        );
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = WorkflowRegistry::new();
        registry.register(definition("orders")).unwrap();

        let err = registry.register(definition("orders")).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("orders".to_string()));
    }

    #[test]
    fn test_registry_debug() {
        let mut registry = WorkflowRegistry::new();
        registry.register(definition("orders")).unwrap();

        let debug_str = format!("{:?}", registry);
        assert!(debug_str.contains("orders"));

        let ids: Vec<_> = registry.workflow_ids().collect();
        assert_eq!(ids, vec!["orders"]);
    }
}
