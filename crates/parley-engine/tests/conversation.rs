use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};

use parley_core::enrich::{EnrichError, InputEnricher};
use parley_core::errors::BackendError;
use parley_core::ids::TurnId;
use parley_core::messages::Message;
use parley_core::sink::{Channel, ResponseSink, SinkChunk, SpeechUnit, UtteranceConsumer};
use parley_core::stream::ResponseEvent;
use parley_core::tools::{SourceId, ToolError, ToolHandler, ToolMetadata};
use parley_engine::{
    Conversation, ConversationBuilder, ConversationError, ConversationEvent, FlushReport, LocalToolExecutor,
};
use parley_llm::mock::{MockBackend, MockResponse};

const WAIT: Duration = Duration::from_secs(5);

/// Records every chunk and lets tests wait for a chunk count.
struct RecordingSink {
    chunks: Mutex<Vec<SinkChunk>>,
    count: watch::Sender<usize>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            chunks: Mutex::new(Vec::new()),
            count: watch::channel(0).0,
        })
    }

    fn chunks(&self) -> Vec<SinkChunk> {
        self.chunks.lock().clone()
    }

    async fn wait_for(&self, n: usize) {
        let mut rx = self.count.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|c| *c >= n))
            .await
            .expect("timed out waiting for chunks")
            .expect("sink dropped");
    }
}

#[async_trait]
impl ResponseSink for RecordingSink {
    async fn push(&self, chunk: SinkChunk) {
        let len = {
            let mut chunks = self.chunks.lock();
            chunks.push(chunk);
            chunks.len()
        };
        self.count.send_replace(len);
    }
}

#[derive(Default)]
struct Speaker {
    units: Mutex<Vec<SpeechUnit>>,
}

#[async_trait]
impl UtteranceConsumer for Speaker {
    async fn speak(&self, unit: SpeechUnit) {
        self.units.lock().push(unit);
    }
}

struct Clock;

#[async_trait]
impl ToolHandler for Clock {
    async fn call(&self, name: &str, arguments: Value) -> Result<String, ToolError> {
        match name {
            "clock" => Ok(format!("12:00 in {}", arguments["zone"].as_str().unwrap_or("UTC"))),
            _ => Err(ToolError::ExecutionFailed(format!("clock cannot run {name}"))),
        }
    }
}

/// Never finishes on its own; only cancellation ends the call.
struct Stall;

#[async_trait]
impl ToolHandler for Stall {
    async fn call(&self, _name: &str, _arguments: Value) -> Result<String, ToolError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok("too late".into())
    }
}

fn start(backend: Arc<MockBackend>, sink: Arc<RecordingSink>) -> Conversation {
    Conversation::builder(backend, sink).start()
}

async fn next_terminal(rx: &mut broadcast::Receiver<ConversationEvent>) -> ConversationEvent {
    loop {
        let event = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if event.is_terminal() {
            return event;
        }
    }
}

fn drain(rx: &mut broadcast::Receiver<ConversationEvent>) -> Vec<&'static str> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.event_type());
    }
    kinds
}

#[tokio::test]
async fn text_turn_is_spoken_and_recorded() {
    let backend = Arc::new(MockBackend::new(vec![MockResponse::stream_deltas(&[
        "Hello, wor",
        "ld. Bye",
    ])]));
    let speaker = Arc::new(Speaker::default());
    let conversation = ConversationBuilder::with_consumer(backend, speaker.clone()).start();
    let mut events = conversation.subscribe();

    conversation.enqueue("hi").unwrap();
    let event = next_terminal(&mut events).await;
    assert_eq!(event.event_type(), "turn_completed");
    assert_eq!(event.turn_id(), Some(TurnId::new(1)));

    let units: Vec<_> = speaker
        .units
        .lock()
        .iter()
        .map(|u| (u.text.clone(), u.end_of_segment))
        .collect();
    assert_eq!(
        units,
        [
            ("Hello,".to_string(), false),
            (" world.".to_string(), false),
            (" Bye".to_string(), true),
        ]
    );
    assert_eq!(
        conversation.history(),
        [Message::user_text("hi"), Message::assistant_text("Hello, world. Bye")]
    );
}

#[tokio::test]
async fn tool_loop_orders_context() {
    let backend = Arc::new(MockBackend::new(vec![
        MockResponse::tool_call("clock", json!({"zone": "CET"})),
        MockResponse::stream_text("It is noon."),
    ]));
    let executor = Arc::new(LocalToolExecutor::new());
    executor.add_handler(SourceId::new("builtin"), Arc::new(Clock));
    let conversation = Conversation::builder(backend.clone(), RecordingSink::new())
        .executor(executor)
        .start();
    conversation.register_tool(ToolMetadata::new("clock", "Current time"), SourceId::new("builtin"));
    let mut events = conversation.subscribe();

    conversation.enqueue("what time is it?").unwrap();
    assert_eq!(next_terminal(&mut events).await.event_type(), "turn_completed");

    let history = conversation.history();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0], Message::user_text("what time is it?"));
    assert!(matches!(history[1], Message::ToolCallRequest(ref call) if call.name == "clock"));
    assert_eq!(history[2].content(), Some("12:00 in CET"));
    assert_eq!(history[3], Message::assistant_text("It is noon."));
    assert_eq!(history[1].call_id(), history[2].call_id());
    assert_eq!(backend.call_count(), 2);
    assert_eq!(
        conversation.tool_sources().get("clock"),
        Some(&SourceId::new("builtin"))
    );
}

#[tokio::test]
async fn failed_turn_does_not_stop_consumer() {
    let backend = Arc::new(MockBackend::new(vec![
        MockResponse::tool_call("missing", json!({})),
        MockResponse::Error(BackendError::Throttled { retry_after: None }),
        MockResponse::stream_text("Back again."),
    ]));
    let conversation = start(backend, RecordingSink::new());
    let mut events = conversation.subscribe();

    for text in ["one", "two", "three"] {
        conversation.enqueue(text).unwrap();
    }

    let ConversationEvent::TurnFailed { kind, message, retryable, .. } = next_terminal(&mut events).await else {
        panic!("first turn should fail");
    };
    assert_eq!(kind, "tool_resolution");
    assert!(message.contains("missing"));
    assert!(!retryable);

    let ConversationEvent::TurnFailed { kind, retryable, .. } = next_terminal(&mut events).await else {
        panic!("second turn should fail");
    };
    assert_eq!(kind, "submission");
    assert!(retryable, "throttling is worth re-enqueueing");

    assert_eq!(next_terminal(&mut events).await.event_type(), "turn_completed");
    // The rejected submission left nothing behind.
    let history = conversation.history();
    assert_eq!(
        history.iter().filter(|m| **m == Message::user_text("two")).count(),
        0
    );
    assert_eq!(history.last(), Some(&Message::assistant_text("Back again.")));
}

#[tokio::test]
async fn flush_mid_stream_emits_one_final_chunk() {
    let backend = Arc::new(MockBackend::new(vec![MockResponse::Hang(vec![
        parley_core::stream::ResponseEvent::text_delta("Hello, "),
        parley_core::stream::ResponseEvent::text_delta("wor"),
    ])]));
    let sink = RecordingSink::new();
    let conversation = start(backend.clone(), sink.clone());
    let mut events = conversation.subscribe();

    conversation.enqueue("a").unwrap();
    sink.wait_for(2).await;
    conversation.enqueue("b").unwrap();

    let report = conversation.flush().await;
    assert_eq!(report, FlushReport { drained: 1, cancelled: true });

    let chunks = sink.chunks();
    assert_eq!(chunks.len(), 3);
    let finals: Vec<_> = chunks.iter().filter(|c| c.is_final).collect();
    assert_eq!(finals.len(), 1);
    assert!(chunks[2].is_final);
    assert_eq!(chunks[2].text, "Hello, wor");
    assert!(chunks.iter().all(|c| c.turn_id == TurnId::new(1)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.chunks().len(), 3, "no output after flush");

    assert_eq!(backend.aborted().len(), 1);
    assert_eq!(backend.call_count(), 1, "drained input never reached the backend");
    assert!(conversation.is_idle());
    assert_eq!(drain(&mut events), ["turn_started", "turn_cancelled", "queue_flushed"]);

    // Partial text stays in context.
    assert_eq!(
        conversation.history(),
        [Message::user_text("a"), Message::assistant_text("Hello, wor")]
    );
}

#[tokio::test]
async fn flush_during_tool_call_cancels_turn() {
    let backend = Arc::new(MockBackend::new(vec![
        MockResponse::Stream(vec![
            ResponseEvent::text_delta("Let me check."),
            ResponseEvent::tool_call("lookup", json!({})),
        ]),
        MockResponse::stream_text("never sent"),
    ]));
    let executor = Arc::new(LocalToolExecutor::new());
    executor.add_handler(SourceId::new("remote"), Arc::new(Stall));
    let sink = RecordingSink::new();
    let conversation = Conversation::builder(backend.clone(), sink.clone())
        .executor(executor)
        .start();
    conversation.register_tool(ToolMetadata::new("lookup", "Slow lookup"), SourceId::new("remote"));
    let mut events = conversation.subscribe();

    conversation.enqueue("check").unwrap();
    loop {
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if event.event_type() == "tool_invoked" {
            break;
        }
    }

    let report = conversation.flush().await;
    assert_eq!(report, FlushReport { drained: 0, cancelled: true });

    // The text block was closed when the tool call arrived; cancelling adds
    // no second final chunk.
    let chunks: Vec<_> = sink.chunks().into_iter().map(|c| (c.text, c.is_final)).collect();
    assert_eq!(
        chunks,
        [("Let me check.".to_string(), false), ("Let me check.".to_string(), true)]
    );
    assert_eq!(drain(&mut events), ["turn_cancelled", "queue_flushed"]);
    assert_eq!(backend.call_count(), 1);
    assert_eq!(backend.aborted().len(), 1);

    // No tool call or output was recorded for the abandoned invocation.
    assert_eq!(
        conversation.history(),
        [Message::user_text("check"), Message::assistant_text("Let me check.")]
    );
}

#[tokio::test]
async fn enricher_output_is_what_history_keeps() {
    struct Memory;

    #[async_trait]
    impl InputEnricher for Memory {
        async fn enrich(&self, _turn_id: TurnId, input: &str) -> Result<String, EnrichError> {
            Ok(format!("(user likes tea) {input}"))
        }
    }

    let backend = Arc::new(MockBackend::new(vec![MockResponse::stream_text("Tea it is.")]));
    let conversation = Conversation::builder(backend.clone(), RecordingSink::new())
        .enricher(Arc::new(Memory))
        .start();
    let mut events = conversation.subscribe();

    conversation.enqueue("what should I drink?").unwrap();
    assert_eq!(next_terminal(&mut events).await.event_type(), "turn_completed");

    let enriched = Message::user_text("(user likes tea) what should I drink?");
    assert_eq!(backend.requests()[0].messages, vec![enriched.clone()]);
    assert_eq!(conversation.history()[0], enriched);
}

#[tokio::test]
async fn flush_when_idle_is_a_noop() {
    let backend = Arc::new(MockBackend::new(vec![]));
    let sink = RecordingSink::new();
    let conversation = start(backend.clone(), sink.clone());
    let mut events = conversation.subscribe();

    assert_eq!(conversation.flush().await, FlushReport::default());
    assert_eq!(conversation.flush().await, FlushReport::default());

    assert!(drain(&mut events).is_empty());
    assert!(sink.chunks().is_empty());
    assert!(backend.aborted().is_empty());
    assert!(conversation.history().is_empty());
}

#[tokio::test]
async fn inputs_run_in_order_without_preemption() {
    let interval = Duration::from_millis(5);
    let backend = Arc::new(MockBackend::new(vec![
        MockResponse::paced_deltas(&["First ", "answer."], interval),
        MockResponse::paced_deltas(&["Second ", "answer."], interval),
    ]));
    let sink = RecordingSink::new();
    let conversation = start(backend.clone(), sink.clone());
    let mut events = conversation.subscribe();

    conversation.enqueue("one").unwrap();
    conversation.enqueue("two").unwrap();

    for expected in [1, 2] {
        let event = next_terminal(&mut events).await;
        assert_eq!(event.event_type(), "turn_completed");
        assert_eq!(event.turn_id(), Some(TurnId::new(expected)));
    }

    // Turn one finished before turn two sent anything.
    let chunks = sink.chunks();
    let last_of_first = chunks.iter().rposition(|c| c.turn_id == TurnId::new(1)).unwrap();
    let first_of_second = chunks.iter().position(|c| c.turn_id == TurnId::new(2)).unwrap();
    assert!(chunks[last_of_first].is_final);
    assert!(last_of_first < first_of_second);

    let requests = backend.requests();
    assert_eq!(
        requests[1].messages,
        [
            Message::user_text("one"),
            Message::assistant_text("First answer."),
            Message::user_text("two"),
        ]
    );
}

#[tokio::test]
async fn registration_during_turn_is_consistent() {
    let backend = Arc::new(MockBackend::new(vec![
        MockResponse::paced_deltas(&["a ", "b ", "c ", "d ", "e."], Duration::from_millis(5)),
        MockResponse::stream_text("Done."),
    ]));
    let conversation = Arc::new(start(backend.clone(), RecordingSink::new()));
    let mut events = conversation.subscribe();
    conversation.enqueue("go").unwrap();

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let conversation = Arc::clone(&conversation);
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                conversation.register_tool(
                    ToolMetadata::new(format!("tool_{worker}_{i}"), "generated"),
                    SourceId::new(format!("worker-{worker}")),
                );
                let listed = conversation.tools();
                let mut names: Vec<_> = listed.iter().map(|t| t.name.as_str()).collect();
                names.sort_unstable();
                names.dedup();
                assert_eq!(names.len(), listed.len(), "duplicate names in list()");
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(next_terminal(&mut events).await.event_type(), "turn_completed");
    assert_eq!(conversation.tools().len(), 200);

    conversation.enqueue("again").unwrap();
    assert_eq!(next_terminal(&mut events).await.event_type(), "turn_completed");
    assert_eq!(backend.requests()[1].tools.len(), 200);
}

#[tokio::test]
async fn panic_in_turn_is_reported_and_survived() {
    struct FragileSink;

    #[async_trait]
    impl ResponseSink for FragileSink {
        async fn push(&self, chunk: SinkChunk) {
            if chunk.turn_id == TurnId::new(1) && chunk.channel == Channel::Primary {
                panic!("sink exploded");
            }
        }
    }

    let backend = Arc::new(MockBackend::new(vec![
        MockResponse::stream_text("boom"),
        MockResponse::stream_text("fine"),
    ]));
    let conversation = Conversation::builder(backend, Arc::new(FragileSink)).start();
    let mut events = conversation.subscribe();

    conversation.enqueue("first").unwrap();
    conversation.enqueue("second").unwrap();

    let ConversationEvent::TurnFailed { kind, message, retryable, .. } = next_terminal(&mut events).await else {
        panic!("panicking turn should be reported as failed");
    };
    assert_eq!(kind, "panicked");
    assert!(!retryable);
    assert!(message.contains("sink exploded"));
    assert_eq!(next_terminal(&mut events).await.event_type(), "turn_completed");
}

#[tokio::test]
async fn shutdown_returns_context_and_closes_queue() {
    let backend = Arc::new(MockBackend::new(vec![MockResponse::stream_text("Hi there.")]));
    let conversation = start(backend, RecordingSink::new());
    let mut events = conversation.subscribe();

    conversation.enqueue("hello").unwrap();
    next_terminal(&mut events).await;

    let context = conversation.shutdown().await;
    assert_eq!(
        context,
        [Message::user_text("hello"), Message::assistant_text("Hi there.")]
    );
    assert!(matches!(
        conversation.enqueue("late"),
        Err(ConversationError::QueueClosed)
    ));
}

#[tokio::test]
async fn shutdown_cancels_in_flight_turn() {
    let backend = Arc::new(MockBackend::new(vec![MockResponse::Hang(vec![
        parley_core::stream::ResponseEvent::text_delta("Partial"),
    ])]));
    let sink = RecordingSink::new();
    let conversation = start(backend.clone(), sink.clone());

    conversation.enqueue("hi").unwrap();
    sink.wait_for(1).await;

    let context = conversation.shutdown().await;
    assert_eq!(context.last(), Some(&Message::assistant_text("Partial")));
    assert!(sink.chunks().last().unwrap().is_final);
    assert_eq!(backend.aborted().len(), 1);
}
