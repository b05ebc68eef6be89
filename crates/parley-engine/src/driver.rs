use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

use parley_core::backend::{GenerationParams, ModelBackend, ModelRequest};
use parley_core::enrich::InputEnricher;
use parley_core::errors::BackendError;
use parley_core::ids::{ConversationId, RequestId, TurnId};
use parley_core::messages::Message;
use parley_core::sink::{Channel, ResponseSink, SinkChunk};
use parley_core::stream::{ResponseEvent, ResponseStream, ToolCallEvent};
use parley_core::tools::{ToolError, ToolExecutor, ToolInvocation};

use crate::context::ContextStore;
use crate::error::TurnError;
use crate::events::{self, ConversationEvent};
use crate::queue::Admission;
use crate::registry::ToolRegistry;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_TOOL_ROUNDS: u32 = 16;

/// Configuration for the turn driver.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub parameters: GenerationParams,
    /// System prompt sent with every request. Never stored in context.
    pub instructions: Option<String>,
    /// Deadline for one backend request, excluding time spent in tools.
    pub request_timeout: Option<Duration>,
    pub tool_timeout: Duration,
    /// Re-submissions allowed after tool calls within one turn.
    pub max_tool_rounds: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            parameters: GenerationParams::default(),
            instructions: None,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Sending,
    Streaming,
    ToolDispatch,
    Done,
    Cancelled,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug)]
pub enum TurnOutcome {
    Done,
    Cancelled,
    Failed(TurnError),
}

impl TurnOutcome {
    pub fn state(&self) -> TurnState {
        match self {
            Self::Done => TurnState::Done,
            Self::Cancelled => TurnState::Cancelled,
            Self::Failed(_) => TurnState::Failed,
        }
    }
}

/// The turn in flight. Lives only for the duration of `drive()`.
struct PendingTurn {
    turn_id: TurnId,
    request_id: RequestId,
    cancel: tokio_util::sync::CancellationToken,
    // User text not yet written to context; taken once the first stream opens.
    input: Option<String>,
    deadline: Option<Instant>,
    text: String,
    text_open: bool,
    primary_finalized: bool,
    reasoning: String,
    reasoning_open: bool,
    tool_rounds: u32,
    dispatched: bool,
}

impl PendingTurn {
    fn new(admission: &Admission) -> Self {
        Self {
            turn_id: admission.turn_id,
            request_id: RequestId::new(),
            cancel: admission.cancel.clone(),
            input: Some(admission.text.clone()),
            deadline: None,
            text: String::new(),
            text_open: false,
            primary_finalized: false,
            reasoning: String::new(),
            reasoning_open: false,
            tool_rounds: 0,
            dispatched: false,
        }
    }
}

enum Step {
    Cancelled,
    TimedOut,
    Event(Option<ResponseEvent>),
}

/// Drives one queued input through the model backend and any tool calls,
/// forwarding output to the sink and recording it in context.
pub struct TurnDriver {
    conversation_id: ConversationId,
    backend: Arc<dyn ModelBackend>,
    registry: Arc<ToolRegistry>,
    executor: Arc<dyn ToolExecutor>,
    sink: Arc<dyn ResponseSink>,
    events: broadcast::Sender<ConversationEvent>,
    enricher: Option<Arc<dyn InputEnricher>>,
    config: DriverConfig,
    context: ContextStore,
    state: TurnState,
}

impl TurnDriver {
    pub fn new(
        conversation_id: ConversationId,
        backend: Arc<dyn ModelBackend>,
        registry: Arc<ToolRegistry>,
        executor: Arc<dyn ToolExecutor>,
        sink: Arc<dyn ResponseSink>,
        events: broadcast::Sender<ConversationEvent>,
    ) -> Self {
        Self {
            conversation_id,
            backend,
            registry,
            executor,
            sink,
            events,
            enricher: None,
            config: DriverConfig::default(),
            context: ContextStore::new(),
            state: TurnState::Idle,
        }
    }

    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn InputEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    pub fn into_context(self) -> ContextStore {
        self.context
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Return to `Idle` after a turn was torn down by a panic.
    pub(crate) fn reset(&mut self) {
        self.state = TurnState::Idle;
    }

    fn transition(&mut self, next: TurnState) {
        debug!(from = ?self.state, to = ?next, "turn state");
        self.state = next;
    }

    fn send_event(&self, event: ConversationEvent) {
        events::publish(&self.events, event);
    }

    /// Run one admitted input to a terminal state. Never panics on backend
    /// or tool failure; those come back as `TurnOutcome::Failed`.
    #[instrument(skip(self, admission), fields(conversation_id = %self.conversation_id, turn_id = %admission.turn_id))]
    pub async fn drive(&mut self, admission: &Admission) -> TurnOutcome {
        let mut pending = PendingTurn::new(admission);
        self.send_event(ConversationEvent::TurnStarted {
            conversation_id: self.conversation_id.clone(),
            turn_id: pending.turn_id,
            input: admission.text.clone(),
        });

        let outcome = match self.run(&mut pending).await {
            Ok(()) => {
                info!(tool_rounds = pending.tool_rounds, "turn completed");
                self.transition(TurnState::Done);
                self.send_event(ConversationEvent::TurnCompleted {
                    conversation_id: self.conversation_id.clone(),
                    turn_id: pending.turn_id,
                    tool_rounds: pending.tool_rounds,
                });
                TurnOutcome::Done
            }
            Err(TurnError::Cancelled) => {
                info!(request_id = %pending.request_id, "turn cancelled");
                self.backend.abort(&pending.request_id).await;
                self.finish_cancelled(&mut pending).await;
                self.transition(TurnState::Cancelled);
                self.send_event(ConversationEvent::TurnCancelled {
                    conversation_id: self.conversation_id.clone(),
                    turn_id: pending.turn_id,
                });
                TurnOutcome::Cancelled
            }
            Err(err) => {
                let retryable = err.is_retryable();
                warn!(
                    kind = err.kind(),
                    backend = err.backend_error().map(BackendError::label),
                    retryable,
                    error = %err,
                    "turn failed"
                );
                self.backend.abort(&pending.request_id).await;
                self.close_blocks(&mut pending).await;
                self.transition(TurnState::Failed);
                self.send_event(ConversationEvent::TurnFailed {
                    conversation_id: self.conversation_id.clone(),
                    turn_id: pending.turn_id,
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                    retryable,
                });
                TurnOutcome::Failed(err)
            }
        };

        self.transition(TurnState::Idle);
        outcome
    }

    async fn run(&mut self, p: &mut PendingTurn) -> Result<(), TurnError> {
        self.enrich(p).await?;
        loop {
            let stream = self.send(p).await?;
            self.consume(p, stream).await?;

            if !p.dispatched {
                return Ok(());
            }
            if p.tool_rounds >= self.config.max_tool_rounds {
                return Err(TurnError::ToolLoopLimit(self.config.max_tool_rounds));
            }
            p.tool_rounds += 1;
            p.dispatched = false;
            p.request_id = RequestId::new();
        }
    }

    /// Let the enricher rewrite the pending input. Runs once per turn, before
    /// the first request; tool rounds reuse whatever was stored in context.
    async fn enrich(&self, p: &mut PendingTurn) -> Result<(), TurnError> {
        let (Some(enricher), Some(input)) = (self.enricher.as_ref(), p.input.as_ref()) else {
            return Ok(());
        };
        let cancel = p.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            result = AssertUnwindSafe(enricher.enrich(p.turn_id, input)).catch_unwind() => result,
        };
        match result {
            Ok(Ok(enriched)) => {
                debug!(from = input.len(), to = enriched.len(), "input enriched");
                p.input = Some(enriched);
            }
            Ok(Err(e)) => warn!(error = %e, "enrichment failed, sending input as typed"),
            Err(panic) => {
                error!(panic = %panic_message(&panic), "enricher panicked, sending input as typed");
            }
        }
        Ok(())
    }

    /// `Sending`: build the request from context plus the pending input and
    /// wait for the backend to open the stream.
    async fn send(&mut self, p: &mut PendingTurn) -> Result<ResponseStream, TurnError> {
        self.transition(TurnState::Sending);

        let mut messages = self.context.snapshot();
        if let Some(input) = &p.input {
            messages.push(Message::user_text(input.clone()));
        }
        let request = ModelRequest {
            id: p.request_id.clone(),
            messages,
            streaming: true,
            tools: self.registry.list(),
            parameters: self.config.parameters.clone(),
            instructions: self.config.instructions.clone(),
        };
        debug!(
            request_id = %request.id,
            messages = request.messages.len(),
            tools = request.tools.len(),
            round = p.tool_rounds,
            "submitting request"
        );

        p.deadline = self.config.request_timeout.map(|t| Instant::now() + t);
        let cancel = p.cancel.clone();
        let timeout = self.config.request_timeout.unwrap_or_default();

        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            _ = deadline_elapsed(p.deadline) => Err(BackendError::TimedOut(timeout)),
            result = self.backend.submit(request) => result,
        };
        let stream = submitted.map_err(TurnError::Submission)?;

        if let Some(input) = p.input.take() {
            self.context.append(Message::user_text(input));
        }
        self.transition(TurnState::Streaming);
        Ok(stream)
    }

    /// `Streaming`: consume events in arrival order until the stream ends.
    async fn consume(&mut self, p: &mut PendingTurn, mut stream: ResponseStream) -> Result<(), TurnError> {
        let cancel = p.cancel.clone();
        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                _ = deadline_elapsed(p.deadline) => Step::TimedOut,
                event = stream.next() => Step::Event(event),
            };

            match step {
                Step::Cancelled => return Err(TurnError::Cancelled),
                Step::TimedOut => {
                    let timeout = self.config.request_timeout.unwrap_or_default();
                    return Err(TurnError::Stream(BackendError::TimedOut(timeout)));
                }
                Step::Event(None) => {
                    self.close_blocks(p).await;
                    return Ok(());
                }
                Step::Event(Some(event)) => {
                    if cancel.is_cancelled() {
                        return Err(TurnError::Cancelled);
                    }
                    trace!(event = event.kind(), "response event");
                    self.handle_event(p, event).await?;
                }
            }
        }
    }

    async fn handle_event(&mut self, p: &mut PendingTurn, event: ResponseEvent) -> Result<(), TurnError> {
        match event {
            ResponseEvent::TextDelta { delta } => {
                if delta.is_empty() {
                    return Ok(());
                }
                if !p.text_open {
                    p.text_open = true;
                    self.context.append(Message::assistant_text(delta.clone()));
                } else if !self.context.coalesce_assistant(&delta) {
                    self.context.append(Message::assistant_text(delta.clone()));
                }
                p.text.push_str(&delta);
                let text = p.text.clone();
                self.push(p.turn_id, Channel::Primary, delta, text, false).await;
            }
            ResponseEvent::TextDone { text } => {
                if p.text_open {
                    self.close_text(p).await;
                } else if !text.is_empty() {
                    self.context.append(Message::assistant_text(text.clone()));
                    self.push(p.turn_id, Channel::Primary, text.clone(), text, true).await;
                    p.primary_finalized = true;
                }
            }
            ResponseEvent::ReasoningDelta { delta } => {
                p.reasoning_open = true;
                p.reasoning.push_str(&delta);
                let text = p.reasoning.clone();
                self.push(p.turn_id, Channel::Reasoning, delta, text, false).await;
            }
            ResponseEvent::ReasoningDone { text } => {
                if p.reasoning_open {
                    self.close_reasoning(p).await;
                } else if !text.is_empty() {
                    self.push(p.turn_id, Channel::Reasoning, text.clone(), text, true).await;
                }
            }
            ResponseEvent::ToolCall(call) => {
                self.close_text(p).await;
                self.dispatch(p, call).await?;
                p.dispatched = true;
            }
            ResponseEvent::Error { error } => return Err(TurnError::Stream(error)),
        }
        Ok(())
    }

    /// `ToolDispatch`: resolve, invoke, and record one tool call.
    #[instrument(skip(self, p, call), fields(tool = %call.name, call_id = %call.call_id))]
    async fn dispatch(&mut self, p: &mut PendingTurn, call: ToolCallEvent) -> Result<(), TurnError> {
        if p.cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }
        self.transition(TurnState::ToolDispatch);

        let source = self
            .registry
            .resolve(&call.name)
            .ok_or_else(|| TurnError::ToolResolution(call.name.clone()))?;

        self.send_event(ConversationEvent::ToolInvoked {
            conversation_id: self.conversation_id.clone(),
            turn_id: p.turn_id,
            call_id: call.call_id.clone(),
            tool_name: call.name.clone(),
            source: source.to_string(),
        });

        let invocation = ToolInvocation {
            source,
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            call_id: call.call_id.clone(),
        };
        let cancel = p.cancel.clone();
        let tool_timeout = self.config.tool_timeout;
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            result = tokio::time::timeout(
                tool_timeout,
                AssertUnwindSafe(self.executor.invoke(&invocation)).catch_unwind(),
            ) => result,
        };

        // Tool time does not count against the request deadline.
        let elapsed = started.elapsed();
        if let Some(deadline) = p.deadline.as_mut() {
            *deadline += elapsed;
        }

        let output = match result {
            Ok(Ok(Ok(output))) => output,
            Ok(Ok(Err(e))) => {
                return Err(TurnError::ToolExecution {
                    name: call.name,
                    source: e,
                })
            }
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(panic = %msg, "tool panicked during execution");
                return Err(TurnError::ToolExecution {
                    name: call.name,
                    source: ToolError::ExecutionFailed(format!("handler panicked: {msg}")),
                });
            }
            Err(_) => {
                warn!(timeout_secs = tool_timeout.as_secs(), "tool timed out");
                return Err(TurnError::ToolExecution {
                    name: call.name,
                    source: ToolError::Timeout(tool_timeout),
                });
            }
        };

        let arguments = match &call.arguments {
            Value::String(raw) => raw.clone(),
            other => other.to_string(),
        };
        self.context.append(Message::tool_call(
            call.call_id.clone(),
            call.name.clone(),
            arguments,
            call.response_id.clone(),
        ));
        self.context
            .append(Message::tool_output(call.call_id.clone(), call.name.clone(), output.clone()));

        self.send_event(ConversationEvent::ToolCompleted {
            conversation_id: self.conversation_id.clone(),
            turn_id: p.turn_id,
            call_id: call.call_id,
            output_preview: output.chars().take(200).collect(),
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        });
        self.transition(TurnState::Streaming);
        Ok(())
    }

    async fn push(&self, turn_id: TurnId, channel: Channel, delta: String, text: String, is_final: bool) {
        self.sink
            .push(SinkChunk {
                turn_id,
                channel,
                delta,
                text,
                is_final,
            })
            .await;
    }

    /// Finalize the open assistant message, if any.
    async fn close_text(&self, p: &mut PendingTurn) {
        if !p.text_open {
            return;
        }
        p.text_open = false;
        p.primary_finalized = true;
        let text = std::mem::take(&mut p.text);
        self.push(p.turn_id, Channel::Primary, String::new(), text, true).await;
    }

    async fn close_reasoning(&self, p: &mut PendingTurn) {
        if !p.reasoning_open {
            return;
        }
        p.reasoning_open = false;
        let text = std::mem::take(&mut p.reasoning);
        self.push(p.turn_id, Channel::Reasoning, String::new(), text, true).await;
    }

    async fn close_blocks(&self, p: &mut PendingTurn) {
        self.close_reasoning(p).await;
        self.close_text(p).await;
    }

    /// Close any open reasoning block, then emit the single end-of-utterance
    /// chunk for a cancelled turn. Partial text already written to context
    /// stays there.
    async fn finish_cancelled(&self, p: &mut PendingTurn) {
        self.close_reasoning(p).await;
        if p.text_open || !p.primary_finalized {
            p.text_open = false;
            p.primary_finalized = true;
            let text = std::mem::take(&mut p.text);
            self.push(p.turn_id, Channel::Primary, String::new(), text, true).await;
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
