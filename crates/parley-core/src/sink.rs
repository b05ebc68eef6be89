use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::TurnId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Text that is spoken and written into context.
    Primary,
    /// Display-only model reasoning.
    Reasoning,
}

/// One streamed fragment pushed by the turn driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SinkChunk {
    pub turn_id: TurnId,
    pub channel: Channel,
    pub delta: String,
    /// Everything received on this channel for the current message so far.
    pub text: String,
    pub is_final: bool,
}

/// Receives the turn driver's output in the exact order it was produced.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn push(&self, chunk: SinkChunk);
}

/// A phrase-sized piece of primary text ready for speech synthesis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechUnit {
    pub turn_id: TurnId,
    pub text: String,
    /// Set on the last unit of an assistant message.
    pub end_of_segment: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptUpdate {
    pub turn_id: TurnId,
    pub channel: Channel,
    pub text: String,
    pub is_final: bool,
    pub timestamp_ms: i64,
}

/// The consumer downstream of the sentence sink (speech synthesis, captions).
#[async_trait]
pub trait UtteranceConsumer: Send + Sync {
    async fn speak(&self, unit: SpeechUnit);

    async fn transcript(&self, _update: TranscriptUpdate) {}
}
