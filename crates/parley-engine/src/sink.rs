use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use parley_core::ids::TurnId;
use parley_core::sink::{Channel, ResponseSink, SinkChunk, SpeechUnit, TranscriptUpdate, UtteranceConsumer};

use crate::segment::SentenceSegmenter;

struct SinkState {
    segmenter: SentenceSegmenter,
    turn: Option<TurnId>,
}

/// Response sink that turns primary-channel deltas into speech units and
/// mirrors every chunk to the consumer as a transcript update.
///
/// Chunks must arrive from one producer at a time, which the turn driver
/// guarantees.
pub struct SentenceSink {
    consumer: Arc<dyn UtteranceConsumer>,
    state: Mutex<SinkState>,
}

impl SentenceSink {
    pub fn new(consumer: Arc<dyn UtteranceConsumer>) -> Self {
        Self {
            consumer,
            state: Mutex::new(SinkState {
                segmenter: SentenceSegmenter::new(),
                turn: None,
            }),
        }
    }

    /// Segment a primary chunk. The lock is released before anything is
    /// awaited.
    fn segment(&self, chunk: &SinkChunk) -> Vec<SpeechUnit> {
        let mut state = self.state.lock();
        if state.turn != Some(chunk.turn_id) {
            if !state.segmenter.pending().is_empty() {
                tracing::debug!(turn_id = %chunk.turn_id, "discarding fragment from previous turn");
            }
            state.segmenter.reset();
            state.turn = Some(chunk.turn_id);
        }

        let mut units: Vec<SpeechUnit> = state
            .segmenter
            .push(&chunk.delta)
            .into_iter()
            .map(|text| SpeechUnit {
                turn_id: chunk.turn_id,
                text,
                end_of_segment: false,
            })
            .collect();

        if chunk.is_final {
            units.push(SpeechUnit {
                turn_id: chunk.turn_id,
                text: state.segmenter.finish(),
                end_of_segment: true,
            });
        }
        units
    }
}

#[async_trait]
impl ResponseSink for SentenceSink {
    async fn push(&self, chunk: SinkChunk) {
        if chunk.channel == Channel::Primary {
            for unit in self.segment(&chunk) {
                self.consumer.speak(unit).await;
            }
        }

        self.consumer
            .transcript(TranscriptUpdate {
                turn_id: chunk.turn_id,
                channel: chunk.channel,
                text: chunk.text,
                is_final: chunk.is_final,
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
            })
            .await;
    }
}
