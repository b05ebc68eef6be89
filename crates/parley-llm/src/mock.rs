use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use parley_core::backend::{ModelBackend, ModelRequest};
use parley_core::errors::BackendError;
use parley_core::ids::RequestId;
use parley_core::stream::{ResponseEvent, ResponseStream};

use crate::inflight::{self, InFlight};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of events, then end.
    Stream(Vec<ResponseEvent>),
    /// Return an error from the submit() call itself.
    Error(BackendError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Yield events with `interval` between each one.
    Paced {
        events: Vec<ResponseEvent>,
        interval: Duration,
    },
    /// Yield events, then never end until aborted.
    Hang(Vec<ResponseEvent>),
}

impl MockResponse {
    /// Convenience: one delta carrying the whole text, then TextDone.
    pub fn stream_text(text: &str) -> Self {
        Self::Stream(vec![
            ResponseEvent::text_delta(text),
            ResponseEvent::text_done(text),
        ])
    }

    /// Convenience: one delta per fragment, then TextDone with the joined text.
    pub fn stream_deltas(fragments: &[&str]) -> Self {
        Self::Stream(text_events(fragments))
    }

    /// Convenience: like [`Self::stream_deltas`] but paced.
    pub fn paced_deltas(fragments: &[&str], interval: Duration) -> Self {
        Self::Paced {
            events: text_events(fragments),
            interval,
        }
    }

    /// Convenience: a single tool call, then end of stream.
    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self::Stream(vec![ResponseEvent::tool_call(name, arguments)])
    }

    /// Convenience: create a stream that ends with an error event.
    pub fn stream_error(error: BackendError) -> Self {
        Self::Stream(vec![ResponseEvent::Error { error }])
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

fn text_events(fragments: &[&str]) -> Vec<ResponseEvent> {
    let mut events: Vec<_> = fragments.iter().map(|f| ResponseEvent::text_delta(*f)).collect();
    events.push(ResponseEvent::text_done(fragments.concat()));
    events
}

/// Mock backend that returns pre-programmed responses in sequence and
/// records what it was asked to do.
pub struct MockBackend {
    responses: Mutex<VecDeque<MockResponse>>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
    aborted: Mutex<Vec<RequestId>>,
    in_flight: InFlight,
}

impl MockBackend {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            in_flight: InFlight::default(),
        }
    }

    /// Queue another response after construction.
    pub fn push_response(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every request submitted so far, in order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    /// Ids passed to `abort`, in order.
    pub fn aborted(&self) -> Vec<RequestId> {
        self.aborted.lock().clone()
    }

    /// Number of submitted streams that have not yet ended.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn submit(&self, request: ModelRequest) -> Result<ResponseStream, BackendError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let request_id = request.id.clone();
        self.requests.lock().push(request);

        let Some(response) = self.responses.lock().pop_front() else {
            return Err(BackendError::Rejected(format!(
                "MockBackend: no response configured for call {idx}"
            )));
        };

        let (guard, token) = self.in_flight.register(&request_id);
        let stream = resolve_response(response, token).await?;
        Ok(inflight::track(stream, guard))
    }

    async fn abort(&self, request_id: &RequestId) {
        self.aborted.lock().push(request_id.clone());
        self.in_flight.cancel(request_id);
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(
    response: MockResponse,
    token: CancellationToken,
) -> Result<ResponseStream, BackendError> {
    let mut current = response;
    loop {
        let events = match current {
            MockResponse::Stream(events) => stream::iter(events).boxed(),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(BackendError::Aborted),
                    _ = tokio::time::sleep(duration) => {}
                }
                current = *inner;
                continue;
            }
            MockResponse::Paced { events, interval } => stream::iter(events)
                .then(move |event| async move {
                    tokio::time::sleep(interval).await;
                    event
                })
                .boxed(),
            MockResponse::Hang(events) => stream::iter(events)
                .chain(stream::pending::<ResponseEvent>())
                .boxed(),
        };
        return Ok(events.take_until(token.cancelled_owned()).boxed());
    }
}
