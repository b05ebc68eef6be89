use std::time::Duration;

use futures::StreamExt;
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use parley_core::backend::{GenerationParams, ModelBackend, ModelRequest};
use parley_core::errors::BackendError;
use parley_core::ids::RequestId;
use parley_core::messages::Message;
use parley_core::stream::ResponseEvent;
use parley_core::tools::ToolMetadata;
use parley_llm::{OpenAiBackend, OpenAiConfig};

fn backend(server: &MockServer) -> OpenAiBackend {
    let config = OpenAiConfig::new(format!("{}/v1", server.uri()), "gpt-test")
        .with_api_key(SecretString::from("sk-test"));
    OpenAiBackend::new(config).unwrap()
}

fn request(text: &str) -> ModelRequest {
    ModelRequest {
        id: RequestId::new(),
        messages: vec![Message::user_text(text)],
        streaming: true,
        tools: vec![ToolMetadata::new("clock", "Current time")],
        parameters: GenerationParams::default(),
        instructions: Some("Be brief.".into()),
    }
}

fn sse_body(chunks: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

#[tokio::test]
async fn streams_text_deltas() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-test",
            "stream": true,
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "hello"}
            ]
        })))
        .respond_with(sse_response(sse_body(&[
            json!({"id": "c1", "choices": [{"delta": {"role": "assistant", "content": "Hi"}, "finish_reason": null}]}),
            json!({"id": "c1", "choices": [{"delta": {"content": " there."}, "finish_reason": null}]}),
            json!({"id": "c1", "choices": [{"delta": {}, "finish_reason": "stop"}]}),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server);
    let events: Vec<_> = backend.submit(request("hello")).await.unwrap().collect().await;

    let deltas: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ResponseEvent::TextDelta { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, ["Hi", " there."]);
    assert!(matches!(events.last(), Some(ResponseEvent::TextDone { text }) if text == "Hi there."));
    assert_eq!(backend.in_flight(), 0);
}

#[tokio::test]
async fn streams_tool_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "tools": [{"type": "function", "function": {"name": "clock"}}]
        })))
        .respond_with(sse_response(sse_body(&[
            json!({"id": "c2", "choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_1", "type": "function", "function": {"name": "clock", "arguments": ""}}]}, "finish_reason": null}]}),
            json!({"id": "c2", "choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"tz\":\"UTC\"}"}}]}, "finish_reason": null}]}),
            json!({"id": "c2", "choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
        ])))
        .mount(&server)
        .await;

    let events: Vec<_> = backend(&server)
        .submit(request("what time is it"))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 1);
    let ResponseEvent::ToolCall(call) = &events[0] else {
        panic!("expected tool call, got {events:?}");
    };
    assert_eq!(call.call_id.as_str(), "call_1");
    assert_eq!(call.name, "clock");
    assert_eq!(call.arguments, json!({"tz": "UTC"}));
    assert_eq!(call.response_id.as_deref(), Some("c2"));
}

#[tokio::test]
async fn rejected_key_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let backend = backend(&server);
    match backend.submit(request("hello")).await {
        Err(BackendError::Unauthorized(body)) => assert_eq!(body, "invalid api key"),
        Err(other) => panic!("expected Unauthorized, got: {other:?}"),
        Ok(_) => panic!("expected error"),
    }
    assert_eq!(backend.in_flight(), 0);
}

#[tokio::test]
async fn server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = match backend(&server).submit(request("hello")).await {
        Err(e) => e,
        Ok(_) => panic!("expected error"),
    };
    assert!(matches!(err, BackendError::Upstream { status: 503, .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn abort_before_response_returns_aborted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse_response(sse_body(&[])).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let backend = std::sync::Arc::new(backend(&server));
    let req = request("hello");
    let id = req.id.clone();

    let submit = {
        let backend = backend.clone();
        tokio::spawn(async move { backend.submit(req).await.map(|_| ()) })
    };

    // Wait until the request is registered as in flight.
    for _ in 0..100 {
        if backend.in_flight() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    backend.abort(&id).await;

    let result = submit.await.unwrap();
    assert!(matches!(result, Err(BackendError::Aborted)), "got: {result:?}");
    assert_eq!(backend.in_flight(), 0);
}

#[tokio::test]
async fn error_chunk_mid_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse_response(sse_body(&[
            json!({"id": "c3", "choices": [{"delta": {"content": "Par"}, "finish_reason": null}]}),
            json!({"error": {"message": "upstream died", "type": "server_error"}}),
        ])))
        .mount(&server)
        .await;

    let events: Vec<_> = backend(&server)
        .submit(request("hello"))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], ResponseEvent::TextDelta { .. }));
    assert!(matches!(
        &events[1],
        ResponseEvent::Error { error: BackendError::Upstream { body, .. } } if body == "upstream died"
    ));
}
