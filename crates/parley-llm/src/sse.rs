use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use parley_core::errors::BackendError;
use parley_core::ids::ToolCallId;
use parley_core::stream::{ResponseEvent, ToolCallEvent};

/// State machine for parsing OpenAI-style `chat.completion.chunk` streams.
pub struct ChatStreamParser {
    response_id: Option<String>,
    text: String,
    text_open: bool,
    reasoning: String,
    reasoning_open: bool,
    // Keyed by the `index` the server assigns to each parallel call.
    tool_calls: BTreeMap<usize, ToolBlock>,
    finished: bool,
}

#[derive(Default)]
struct ToolBlock {
    id: String,
    name: String,
    arguments_json: String,
}

impl Default for ChatStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatStreamParser {
    pub fn new() -> Self {
        Self {
            response_id: None,
            text: String::new(),
            text_open: false,
            reasoning: String::new(),
            reasoning_open: false,
            tool_calls: BTreeMap::new(),
            finished: false,
        }
    }

    /// Parse the payload of one `data:` line.
    pub fn parse_data(&mut self, data: &str) -> Vec<ResponseEvent> {
        let data = data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        if data == "[DONE]" {
            return self.finish();
        }

        let chunk = match serde_json::from_str::<ChunkPayload>(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparseable stream chunk");
                return Vec::new();
            }
        };

        if let Some(err) = chunk.error {
            self.finished = true;
            return vec![ResponseEvent::Error {
                error: classify_error(&err),
            }];
        }

        if self.response_id.is_none() {
            self.response_id = chunk.id;
        }

        let mut events = Vec::new();
        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(delta) = choice.delta {
            if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
                self.reasoning_open = true;
                self.reasoning.push_str(&reasoning);
                events.push(ResponseEvent::ReasoningDelta { delta: reasoning });
            }

            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                if self.reasoning_open {
                    events.push(self.close_reasoning());
                }
                self.text_open = true;
                self.text.push_str(&content);
                events.push(ResponseEvent::TextDelta { delta: content });
            }

            for call in delta.tool_calls {
                let block = self.tool_calls.entry(call.index).or_default();
                if let Some(id) = call.id {
                    block.id = id;
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        block.name.push_str(&name);
                    }
                    if let Some(args) = function.arguments {
                        block.arguments_json.push_str(&args);
                    }
                }
            }
        }

        if choice.finish_reason.is_some() {
            events.extend(self.finish());
        }

        events
    }

    /// Close every open block. Idempotent; called on `finish_reason`,
    /// `[DONE]`, and when the byte stream ends.
    pub fn finish(&mut self) -> Vec<ResponseEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();
        if self.reasoning_open {
            events.push(self.close_reasoning());
        }
        if self.text_open {
            self.text_open = false;
            events.push(ResponseEvent::TextDone {
                text: std::mem::take(&mut self.text),
            });
        }
        for (_, block) in std::mem::take(&mut self.tool_calls) {
            let call_id = if block.id.is_empty() {
                ToolCallId::new()
            } else {
                ToolCallId::from_raw(block.id)
            };
            events.push(ResponseEvent::ToolCall(ToolCallEvent {
                call_id,
                name: block.name,
                arguments: parse_arguments(&block.arguments_json),
                response_id: self.response_id.clone(),
            }));
        }
        events
    }

    fn close_reasoning(&mut self) -> ResponseEvent {
        self.reasoning_open = false;
        ResponseEvent::ReasoningDone {
            text: std::mem::take(&mut self.reasoning),
        }
    }
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn classify_error(err: &ErrorPayload) -> BackendError {
    let kind = err
        .code
        .as_deref()
        .or(err.error_type.as_deref())
        .unwrap_or_default();
    match kind {
        "rate_limit_exceeded" | "rate_limit_error" => BackendError::Throttled { retry_after: None },
        "invalid_api_key" | "authentication_error" => {
            BackendError::Unauthorized(err.message.clone())
        }
        "invalid_request_error" | "context_length_exceeded" => {
            BackendError::Rejected(err.message.clone())
        }
        _ => BackendError::Upstream {
            status: 500,
            body: err.message.clone(),
        },
    }
}

/// Extract the `data:` payloads from raw SSE text. Multi-line data fields
/// are joined with `\n`; comments and other fields are ignored.
pub fn parse_sse_data(raw: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut current: Option<String> = None;

    for line in raw.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            match current.as_mut() {
                Some(buf) => {
                    buf.push('\n');
                    buf.push_str(data);
                }
                None => current = Some(data.to_string()),
            }
        } else if line.is_empty() {
            if let Some(buf) = current.take() {
                payloads.push(buf);
            }
        }
    }

    // Handle trailing event without blank line
    if let Some(buf) = current {
        payloads.push(buf);
    }

    payloads
}

// --- Deserialization types for chat completion chunks ---

#[derive(Deserialize)]
struct ChunkPayload {
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChoicePayload>,
    error: Option<ErrorPayload>,
}

#[derive(Deserialize)]
struct ChoicePayload {
    delta: Option<DeltaPayload>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct DeltaPayload {
    content: Option<String>,
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
}
