//! Tag to handler lookup used to replay persisted tasks.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::task::TaskHandler;

/// Maps a task tag to the handler that runs it.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its tag. A later registration for the same
    /// tag replaces the earlier one.
    pub fn register(&mut self, handler: impl TaskHandler + 'static) {
        self.register_arc(Arc::new(handler));
    }

    /// Register an already shared handler.
    pub fn register_arc(&mut self, handler: Arc<dyn TaskHandler>) {
        let tag = handler.tag();
        if self.handlers.insert(tag, handler).is_some() {
            warn!(tag, "Replacing previously registered task handler");
        }
    }

    /// Look up the handler for a tag.
    pub fn get(&self, tag: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(tag).cloned()
    }

    /// Returns true if a handler is registered for the tag.
    pub fn contains(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// All registered tags.
    pub fn tags(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}
