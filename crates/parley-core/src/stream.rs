use std::pin::Pin;

use futures::Stream;

use crate::errors::BackendError;
use crate::ids::ToolCallId;

/// Events emitted by a model backend for one streaming request, in arrival
/// order. Deltas carry only the new fragment; the turn driver owns
/// accumulation.
#[derive(Clone, Debug)]
pub enum ResponseEvent {
    TextDelta { delta: String },
    /// End of the primary text. `text` is the backend's view of the full
    /// message and is only used when no deltas were streamed.
    TextDone { text: String },

    ReasoningDelta { delta: String },
    ReasoningDone { text: String },

    ToolCall(ToolCallEvent),

    /// The connection failed mid-stream.
    Error { error: BackendError },
}

#[derive(Clone, Debug)]
pub struct ToolCallEvent {
    pub call_id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
    pub response_id: Option<String>,
}

pub type ResponseStream = Pin<Box<dyn Stream<Item = ResponseEvent> + Send>>;

impl ResponseEvent {
    pub fn text_delta(delta: impl Into<String>) -> Self {
        Self::TextDelta { delta: delta.into() }
    }

    pub fn text_done(text: impl Into<String>) -> Self {
        Self::TextDone { text: text.into() }
    }

    pub fn reasoning_delta(delta: impl Into<String>) -> Self {
        Self::ReasoningDelta { delta: delta.into() }
    }

    pub fn reasoning_done(text: impl Into<String>) -> Self {
        Self::ReasoningDone { text: text.into() }
    }

    pub fn tool_call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self::ToolCall(ToolCallEvent {
            call_id: ToolCallId::new(),
            name: name.into(),
            arguments,
            response_id: None,
        })
    }

    pub fn is_delta(&self) -> bool {
        matches!(self, Self::TextDelta { .. } | Self::ReasoningDelta { .. })
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::TextDone { .. } => "text_done",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::ReasoningDone { .. } => "reasoning_done",
            Self::ToolCall(_) => "tool_call",
            Self::Error { .. } => "error",
        }
    }
}
