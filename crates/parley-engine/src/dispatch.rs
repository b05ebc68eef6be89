use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use parley_core::tools::{SourceId, ToolError, ToolExecutor, ToolHandler, ToolInvocation};

/// Routes invocations to in-process handlers keyed by source.
#[derive(Default)]
pub struct LocalToolExecutor {
    handlers: RwLock<HashMap<SourceId, Arc<dyn ToolHandler>>>,
}

impl LocalToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` as the owner of every tool registered under
    /// `source`. Replaces any previous handler for that source.
    pub fn add_handler(&self, source: SourceId, handler: Arc<dyn ToolHandler>) {
        self.handlers.write().insert(source, handler);
    }

    pub fn remove_handler(&self, source: &SourceId) -> bool {
        self.handlers.write().remove(source).is_some()
    }

    fn handler(&self, source: &SourceId) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.read().get(source).cloned()
    }
}

#[async_trait]
impl ToolExecutor for LocalToolExecutor {
    async fn invoke(&self, invocation: &ToolInvocation) -> Result<String, ToolError> {
        let handler = self
            .handler(&invocation.source)
            .ok_or_else(|| ToolError::HandlerNotFound(invocation.source.clone()))?;
        tracing::debug!(tool = %invocation.name, source = %invocation.source, call_id = %invocation.call_id, "invoking local handler");
        handler
            .call(&invocation.name, invocation.arguments.clone())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ids::ToolCallId;

    struct Upper;

    #[async_trait]
    impl ToolHandler for Upper {
        async fn call(&self, name: &str, arguments: serde_json::Value) -> Result<String, ToolError> {
            let text = arguments["text"]
                .as_str()
                .ok_or_else(|| ToolError::InvalidArguments("missing text".into()))?;
            Ok(format!("{name}:{}", text.to_uppercase()))
        }
    }

    fn invocation(source: &str, args: serde_json::Value) -> ToolInvocation {
        ToolInvocation {
            source: SourceId::new(source),
            name: "upper".into(),
            arguments: args,
            call_id: ToolCallId::new(),
        }
    }

    #[tokio::test]
    async fn routes_to_handler() {
        let executor = LocalToolExecutor::new();
        executor.add_handler(SourceId::new("text"), Arc::new(Upper));
        let out = executor
            .invoke(&invocation("text", serde_json::json!({"text": "hi"})))
            .await
            .unwrap();
        assert_eq!(out, "upper:HI");
    }

    #[tokio::test]
    async fn missing_handler() {
        let executor = LocalToolExecutor::new();
        let err = executor
            .invoke(&invocation("nowhere", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::HandlerNotFound(s) if s.as_str() == "nowhere"));
    }

    #[tokio::test]
    async fn handler_error_propagates() {
        let executor = LocalToolExecutor::new();
        executor.add_handler(SourceId::new("text"), Arc::new(Upper));
        assert!(executor.remove_handler(&SourceId::new("text")));
        executor.add_handler(SourceId::new("text"), Arc::new(Upper));
        let err = executor
            .invoke(&invocation("text", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
