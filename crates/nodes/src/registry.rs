//! Handler lookup keyed by node `type`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{builtin, NodeHandler};

/// Resolves a node type to the handler that executes it.
///
/// Shared read-mostly across every run, hence `Send + Sync`.
pub trait HandlerRegistry: Send + Sync {
    fn resolve(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>>;
}

/// Maps `node_type` strings to shared `NodeHandler` implementations.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(builtin::PASSTHROUGH, Arc::new(builtin::PassthroughNode));
        registry.register(builtin::SET, Arc::new(builtin::SetNode));
        registry.register(builtin::DELAY, Arc::new(builtin::DelayNode));
        registry.register(builtin::FAIL, Arc::new(builtin::FailNode));
        registry
    }

    /// Register (or replace) the handler for `node_type`.
    pub fn register(&mut self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type.into(), handler);
    }

    pub fn with(mut self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) -> Self {
        self.register(node_type, handler);
        self
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Registered node types, sorted.
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl HandlerRegistry for NodeRegistry {
    fn resolve(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }
}
