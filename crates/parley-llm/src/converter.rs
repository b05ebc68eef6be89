use serde_json::{json, Value};

use parley_core::backend::ModelRequest;
use parley_core::messages::{Message, ToolCallRecord, ToolOutputRecord};
use parley_core::tools::ToolMetadata;

/// Convert a [`ModelRequest`] into a `/chat/completions` request body.
pub fn build_request_body(request: &ModelRequest, model: &str) -> Value {
    let mut body = json!({
        "model": model,
        "stream": request.streaming,
    });

    if let Some(temp) = request.parameters.temperature {
        body["temperature"] = json!(temp);
    }
    if let Some(max) = request.parameters.max_tokens {
        body["max_tokens"] = json!(max);
    }

    body["messages"] = json!(convert_messages(
        request.instructions.as_deref(),
        &request.messages
    ));

    if !request.tools.is_empty() {
        body["tools"] = json!(request.tools.iter().map(convert_tool).collect::<Vec<_>>());
    }

    body
}

fn convert_messages(instructions: Option<&str>, messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len() + 1);

    if let Some(instructions) = instructions.filter(|s| !s.is_empty()) {
        out.push(json!({"role": "system", "content": instructions}));
    }

    for msg in messages {
        match msg {
            Message::UserText { content } => out.push(json!({"role": "user", "content": content})),
            Message::AssistantText { content } => {
                out.push(json!({"role": "assistant", "content": content}));
            }
            Message::ToolCallRequest(rec) => attach_tool_call(&mut out, rec),
            Message::ToolCallOutput(rec) => out.push(convert_tool_output(rec)),
        }
    }

    out
}

/// The wire format carries tool calls on an assistant message. A call that
/// directly follows assistant text (or another call) joins that message.
fn attach_tool_call(out: &mut Vec<Value>, rec: &ToolCallRecord) {
    let call = json!({
        "id": rec.call_id.as_str(),
        "type": "function",
        "function": {"name": rec.name, "arguments": rec.arguments},
    });

    if let Some(last) = out.last_mut() {
        if last["role"] == "assistant" {
            match last.get_mut("tool_calls").and_then(Value::as_array_mut) {
                Some(calls) => calls.push(call),
                None => last["tool_calls"] = json!([call]),
            }
            return;
        }
    }

    out.push(json!({"role": "assistant", "content": null, "tool_calls": [call]}));
}

fn convert_tool_output(rec: &ToolOutputRecord) -> Value {
    json!({
        "role": "tool",
        "tool_call_id": rec.call_id.as_str(),
        "content": rec.output,
    })
}

fn convert_tool(tool: &ToolMetadata) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters_schema(),
        },
    })
}
