use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};

use parley_core::backend::{ModelBackend, ModelRequest};
use parley_core::errors::BackendError;
use parley_core::ids::RequestId;
use parley_core::messages::Message;
use parley_core::stream::{ResponseEvent, ResponseStream};

use crate::inflight::{self, InFlight};

/// Offline backend that repeats the latest user message back one word at a
/// time. Useful for exercising the pipeline without network access.
pub struct EchoBackend {
    interval: Duration,
    in_flight: InFlight,
}

impl EchoBackend {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            in_flight: InFlight::default(),
        }
    }

    /// Number of replies still streaming.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(80))
    }
}

fn reply_for(messages: &[Message]) -> String {
    let last_user = messages.iter().rev().find_map(|m| match m {
        Message::UserText { content } => Some(content.as_str()),
        _ => None,
    });
    match last_user {
        Some(text) if !text.trim().is_empty() => format!("You said: {}", text.trim()),
        _ => "I did not catch that.".to_string(),
    }
}

/// Split into words, keeping the trailing whitespace on each piece so the
/// deltas concatenate back to the input.
fn split_words(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_whitespace() && !current.trim().is_empty() {
            current.push(c);
            pieces.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[async_trait]
impl ModelBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn submit(&self, request: ModelRequest) -> Result<ResponseStream, BackendError> {
        let reply = reply_for(&request.messages);
        let (guard, token) = self.in_flight.register(&request.id);

        let interval = self.interval;
        let mut events: Vec<ResponseEvent> = split_words(&reply)
            .into_iter()
            .map(ResponseEvent::text_delta)
            .collect();
        events.push(ResponseEvent::text_done(reply));

        let stream = stream::iter(events)
            .then(move |event| async move {
                if event.is_delta() {
                    tokio::time::sleep(interval).await;
                }
                event
            })
            .take_until(token.cancelled_owned())
            .boxed();
        Ok(inflight::track(stream, guard))
    }

    async fn abort(&self, request_id: &RequestId) {
        self.in_flight.cancel(request_id);
    }
}
