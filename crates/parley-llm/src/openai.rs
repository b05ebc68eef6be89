use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream, StreamExt};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::instrument;

use parley_core::backend::{ModelBackend, ModelRequest};
use parley_core::errors::BackendError;
use parley_core::ids::RequestId;
use parley_core::stream::{ResponseEvent, ResponseStream};

use crate::converter;
use crate::inflight::{InFlight, InFlightGuard};
use crate::sse::{self, ChatStreamParser};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// API root, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            connect_timeout: CONNECT_TIMEOUT,
            idle_timeout: SSE_IDLE_TIMEOUT,
        }
    }

    pub fn with_api_key(mut self, key: SecretString) -> Self {
        self.api_key = Some(key);
        self
    }
}

/// Backend for any server speaking the OpenAI `/chat/completions` streaming
/// protocol.
pub struct OpenAiBackend {
    client: Client,
    config: OpenAiConfig,
    in_flight: InFlight,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| BackendError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            in_flight: InFlight::default(),
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Number of requests whose stream is still open.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    #[instrument(skip(self, request), fields(model = %self.config.model, request_id = %request.id))]
    async fn submit(&self, request: ModelRequest) -> Result<ResponseStream, BackendError> {
        let (guard, token) = self.in_flight.register(&request.id);

        let body = converter::build_request_body(&request, &self.config.model);
        let mut req = self
            .client
            .post(self.endpoint())
            .header("accept", "text/event-stream")
            .json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = tokio::select! {
            _ = token.cancelled() => return Err(BackendError::Aborted),
            resp = req.send() => resp.map_err(|e| BackendError::Connection(e.to_string()))?,
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status, "backend rejected request");
            return Err(BackendError::from_status(status, body));
        }

        let byte_stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| e.to_string()));
        Ok(Box::pin(SseStream::new(
            byte_stream,
            self.config.idle_timeout,
            token,
            Some(guard),
        )))
    }

    async fn abort(&self, request_id: &RequestId) {
        if self.in_flight.cancel(request_id) {
            tracing::debug!(%request_id, "aborted in-flight request");
        }
    }
}

/// Wraps a byte stream from reqwest and yields ResponseEvents.
/// Includes an idle timeout: if no data arrives within `idle_duration`, emits
/// an error and ends. Cancelling `abort` ends the stream without further events.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, String>> + Send>>,
    parser: ChatStreamParser,
    buffer: String,
    pending: VecDeque<ResponseEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    abort: Pin<Box<WaitForCancellationFutureOwned>>,
    done: bool,
    _guard: Option<InFlightGuard>,
}

impl SseStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, String>> + Send + 'static,
        idle_timeout: Duration,
        token: CancellationToken,
        guard: Option<InFlightGuard>,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: ChatStreamParser::new(),
            buffer: String::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            abort: Box::pin(token.cancelled_owned()),
            done: false,
            _guard: guard,
        }
    }

    fn drain_complete_events(&mut self) {
        while let Some(pos) = self.buffer.find("\n\n") {
            let chunk: String = self.buffer.drain(..pos + 2).collect();
            for data in sse::parse_sse_data(&chunk) {
                let events = self.parser.parse_data(&data);
                self.pending.extend(events);
            }
        }
    }
}

impl Stream for SseStream {
    type Item = ResponseEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.done && self.abort.as_mut().poll(cx).is_ready() {
            self.done = true;
            self.pending.clear();
            return Poll::Ready(None);
        }

        loop {
            if let Some(event) = self.pending.pop_front() {
                if matches!(event, ResponseEvent::Error { .. }) {
                    self.done = true;
                    self.pending.clear();
                }
                return Poll::Ready(Some(event));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    // Data received, reset idle timer
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let text = String::from_utf8_lossy(&bytes).replace("\r\n", "\n");
                    self.buffer.push_str(&text);
                    self.drain_complete_events();
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(ResponseEvent::Error {
                        error: BackendError::Interrupted(e),
                    }));
                }
                Poll::Ready(None) => {
                    let remaining = std::mem::take(&mut self.buffer);
                    for data in sse::parse_sse_data(&remaining) {
                        let events = self.parser.parse_data(&data);
                        self.pending.extend(events);
                    }
                    let tail = self.parser.finish();
                    self.pending.extend(tail);
                    self.done = true;
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.done = true;
                        return Poll::Ready(Some(ResponseEvent::Error {
                            error: BackendError::Interrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
