use std::collections::HashMap;

use parking_lot::RwLock;

use parley_core::tools::{SourceId, ToolMetadata};

struct ToolEntry {
    metadata: ToolMetadata,
    source: SourceId,
}

/// Registry of available tools and the handler that owns each one.
///
/// Safe to mutate while a turn is in flight. Every read takes the lock once,
/// so `list()` never observes a half-applied registration.
pub struct ToolRegistry {
    // Registration order; names are unique.
    tools: RwLock<Vec<ToolEntry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(Vec::new()),
        }
    }

    /// Register a tool. Re-registering a name replaces its metadata and
    /// source but keeps its original position in `list()`.
    pub fn register(&self, metadata: ToolMetadata, source: SourceId) {
        let mut tools = self.tools.write();
        if let Some(entry) = tools.iter_mut().find(|e| e.metadata.name == metadata.name) {
            tracing::debug!(tool = %metadata.name, %source, "tool re-registered");
            entry.metadata = metadata;
            entry.source = source;
        } else {
            tracing::debug!(tool = %metadata.name, %source, "tool registered");
            tools.push(ToolEntry { metadata, source });
        }
    }

    /// Unregister a tool by name.
    pub fn unregister(&self, name: &str) -> bool {
        let mut tools = self.tools.write();
        let before = tools.len();
        tools.retain(|e| e.metadata.name != name);
        tools.len() != before
    }

    /// Source that owns `name`, if registered.
    pub fn resolve(&self, name: &str) -> Option<SourceId> {
        self.tools
            .read()
            .iter()
            .find(|e| e.metadata.name == name)
            .map(|e| e.source.clone())
    }

    /// Tool definitions in registration order.
    pub fn list(&self) -> Vec<ToolMetadata> {
        self.tools.read().iter().map(|e| e.metadata.clone()).collect()
    }

    /// Name to source mapping.
    pub fn sources(&self) -> HashMap<String, SourceId> {
        self.tools
            .read()
            .iter()
            .map(|e| (e.metadata.name.clone(), e.source.clone()))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().iter().any(|e| e.metadata.name == name)
    }

    /// Total tool count.
    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
