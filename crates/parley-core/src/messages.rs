use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// One entry of the conversation context.
///
/// Tool variants keep their arguments and output as serialized strings so the
/// log replays byte-for-byte into the next request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    UserText { content: String },
    AssistantText { content: String },
    ToolCallRequest(ToolCallRecord),
    ToolCallOutput(ToolOutputRecord),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: ToolCallId,
    pub name: String,
    /// JSON-encoded arguments as issued by the model.
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutputRecord {
    pub call_id: ToolCallId,
    pub name: String,
    pub output: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::UserText { content: text.into() }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::AssistantText { content: text.into() }
    }

    pub fn tool_call(
        call_id: ToolCallId,
        name: impl Into<String>,
        arguments: impl Into<String>,
        response_id: Option<String>,
    ) -> Self {
        Self::ToolCallRequest(ToolCallRecord {
            call_id,
            name: name.into(),
            arguments: arguments.into(),
            response_id,
        })
    }

    pub fn tool_output(
        call_id: ToolCallId,
        name: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::ToolCallOutput(ToolOutputRecord {
            call_id,
            name: name.into(),
            output: output.into(),
        })
    }

    pub fn role(&self) -> Role {
        match self {
            Self::UserText { .. } => Role::User,
            Self::AssistantText { .. } | Self::ToolCallRequest(_) => Role::Assistant,
            Self::ToolCallOutput(_) => Role::Tool,
        }
    }

    /// Textual content; `None` for pure tool-call records.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::UserText { content } | Self::AssistantText { content } => Some(content.as_str()),
            Self::ToolCallOutput(out) => Some(out.output.as_str()),
            Self::ToolCallRequest(_) => None,
        }
    }

    pub fn call_id(&self) -> Option<&ToolCallId> {
        match self {
            Self::ToolCallRequest(rec) => Some(&rec.call_id),
            Self::ToolCallOutput(rec) => Some(&rec.call_id),
            _ => None,
        }
    }

    pub fn is_assistant_text(&self) -> bool {
        matches!(self, Self::AssistantText { .. })
    }
}
