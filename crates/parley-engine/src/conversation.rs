use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use parley_core::backend::ModelBackend;
use parley_core::enrich::InputEnricher;
use parley_core::ids::ConversationId;
use parley_core::messages::Message;
use parley_core::sink::{ResponseSink, UtteranceConsumer};
use parley_core::tools::{SourceId, ToolExecutor, ToolMetadata};

use crate::context::ContextStore;
use crate::dispatch::LocalToolExecutor;
use crate::driver::{panic_message, DriverConfig, TurnDriver};
use crate::error::{ConversationError, TurnError};
use crate::events::{publish, ConversationEvent};
use crate::queue::{FlushReport, InputQueue};
use crate::registry::ToolRegistry;
use crate::sink::SentenceSink;

const DEFAULT_EVENT_BUFFER: usize = 256;

/// Wires a backend, tool executor and response sink into a running
/// [`Conversation`].
pub struct ConversationBuilder {
    backend: Arc<dyn ModelBackend>,
    sink: Arc<dyn ResponseSink>,
    executor: Option<Arc<dyn ToolExecutor>>,
    registry: Option<Arc<ToolRegistry>>,
    enricher: Option<Arc<dyn InputEnricher>>,
    config: DriverConfig,
    event_buffer: usize,
    id: Option<ConversationId>,
}

impl ConversationBuilder {
    pub fn new(backend: Arc<dyn ModelBackend>, sink: Arc<dyn ResponseSink>) -> Self {
        Self {
            backend,
            sink,
            executor: None,
            registry: None,
            enricher: None,
            config: DriverConfig::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            id: None,
        }
    }

    /// Route primary output through sentence segmentation to `consumer`.
    pub fn with_consumer(backend: Arc<dyn ModelBackend>, consumer: Arc<dyn UtteranceConsumer>) -> Self {
        Self::new(backend, Arc::new(SentenceSink::new(consumer)))
    }

    pub fn executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Share a registry that was populated before the conversation started.
    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Rewrite each input before its first request (retrieval, memory).
    pub fn enricher(mut self, enricher: Arc<dyn InputEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn id(mut self, id: ConversationId) -> Self {
        self.id = Some(id);
        self
    }

    /// Spawn the consumer task. Must be called inside a Tokio runtime.
    pub fn start(self) -> Conversation {
        let id = self.id.unwrap_or_default();
        let registry = self.registry.unwrap_or_default();
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(LocalToolExecutor::new()));
        let (events, _) = broadcast::channel(self.event_buffer);
        let (history_tx, history) = watch::channel(Arc::new(Vec::new()));
        let queue = Arc::new(InputQueue::new());
        let shutdown = CancellationToken::new();

        let mut driver = TurnDriver::new(
            id.clone(),
            self.backend,
            Arc::clone(&registry),
            executor,
            self.sink,
            events.clone(),
        )
        .with_config(self.config);
        if let Some(enricher) = self.enricher {
            driver = driver.with_enricher(enricher);
        }

        let task = tokio::spawn(run_consumer(
            driver,
            Arc::clone(&queue),
            history_tx,
            events.clone(),
            shutdown.clone(),
        ));
        info!(conversation_id = %id, "conversation started");

        Conversation {
            id,
            queue,
            registry,
            events,
            history,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }
}

/// A running conversation: an input queue drained serially by one consumer
/// task that drives each input through the model and any tools.
///
/// Dropping a `Conversation` without calling [`Conversation::shutdown`]
/// stops the consumer and abandons any in-flight turn.
pub struct Conversation {
    id: ConversationId,
    queue: Arc<InputQueue>,
    registry: Arc<ToolRegistry>,
    events: broadcast::Sender<ConversationEvent>,
    history: watch::Receiver<Arc<Vec<Message>>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<ContextStore>>>,
}

impl Conversation {
    pub fn builder(backend: Arc<dyn ModelBackend>, sink: Arc<dyn ResponseSink>) -> ConversationBuilder {
        ConversationBuilder::new(backend, sink)
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    /// Queue user text. Returns the number of inputs waiting behind the
    /// active turn.
    pub fn enqueue(&self, text: impl Into<String>) -> Result<usize, ConversationError> {
        self.queue.enqueue(text)
    }

    /// Drop queued input and cancel the in-flight turn. Resolves once the
    /// cancelled turn can no longer reach the sink.
    pub async fn flush(&self) -> FlushReport {
        let report = self.queue.flush().await;
        if !report.is_noop() {
            info!(
                conversation_id = %self.id,
                drained = report.drained,
                cancelled = report.cancelled,
                "queue flushed"
            );
            publish(
                &self.events,
                ConversationEvent::QueueFlushed {
                    conversation_id: self.id.clone(),
                    drained: report.drained,
                    cancelled: report.cancelled,
                },
            );
        }
        report
    }

    /// Make a tool visible to the model. Safe to call while a turn is in
    /// flight; the next request picks it up.
    pub fn register_tool(&self, metadata: ToolMetadata, source: SourceId) {
        self.registry.register(metadata, source);
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        self.registry.unregister(name)
    }

    pub fn tools(&self) -> Vec<ToolMetadata> {
        self.registry.list()
    }

    /// Which source serves each registered tool.
    pub fn tool_sources(&self) -> HashMap<String, SourceId> {
        self.registry.sources()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// Context as of the last turn that reached a terminal state.
    pub fn history(&self) -> Vec<Message> {
        self.history.borrow().to_vec()
    }

    /// No queued input and no turn in flight.
    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    /// Stop accepting input, flush, and wait for the consumer to exit.
    /// Returns the final context.
    pub async fn shutdown(&self) -> Vec<Message> {
        self.queue.close();
        self.flush().await;

        let Some(task) = self.task.lock().take() else {
            return self.history();
        };
        match task.await {
            Ok(context) => {
                info!(conversation_id = %self.id, messages = context.len(), "conversation stopped");
                context.into_messages()
            }
            Err(e) => {
                error!(conversation_id = %self.id, error = %e, "consumer task failed");
                self.history()
            }
        }
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.queue.close();
        self.shutdown.cancel();
    }
}

async fn run_consumer(
    mut driver: TurnDriver,
    queue: Arc<InputQueue>,
    history: watch::Sender<Arc<Vec<Message>>>,
    events: broadcast::Sender<ConversationEvent>,
    shutdown: CancellationToken,
) -> ContextStore {
    loop {
        let admission = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = queue.dequeue() => match next {
                Some(admission) => admission,
                None => break,
            },
        };
        let turn_id = admission.turn_id;

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                warn!(%turn_id, "conversation dropped mid-turn");
                break;
            }
            result = AssertUnwindSafe(driver.drive(&admission)).catch_unwind() => result,
        };

        if let Err(panic) = result {
            let err = TurnError::Panicked(panic_message(&panic));
            error!(%turn_id, error = %err, "turn driver panicked");
            driver.reset();
            publish(
                &events,
                ConversationEvent::TurnFailed {
                    conversation_id: driver.conversation_id().clone(),
                    turn_id,
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                    retryable: false,
                },
            );
        }

        history.send_replace(Arc::new(driver.context().snapshot()));
        queue.complete(turn_id);
    }
    driver.into_context()
}
