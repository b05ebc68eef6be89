use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use parley_core::ids::{ConversationId, ToolCallId, TurnId};

/// Lifecycle events published to `Conversation::subscribe()` receivers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConversationEvent {
    #[serde(rename = "turn_started")]
    TurnStarted {
        conversation_id: ConversationId,
        turn_id: TurnId,
        input: String,
    },

    #[serde(rename = "tool_invoked")]
    ToolInvoked {
        conversation_id: ConversationId,
        turn_id: TurnId,
        call_id: ToolCallId,
        tool_name: String,
        source: String,
    },

    #[serde(rename = "tool_completed")]
    ToolCompleted {
        conversation_id: ConversationId,
        turn_id: TurnId,
        call_id: ToolCallId,
        output_preview: String,
        duration_ms: u64,
    },

    #[serde(rename = "turn_completed")]
    TurnCompleted {
        conversation_id: ConversationId,
        turn_id: TurnId,
        tool_rounds: u32,
    },

    #[serde(rename = "turn_cancelled")]
    TurnCancelled {
        conversation_id: ConversationId,
        turn_id: TurnId,
    },

    #[serde(rename = "turn_failed")]
    TurnFailed {
        conversation_id: ConversationId,
        turn_id: TurnId,
        kind: String,
        message: String,
        /// Re-enqueueing the same input may succeed.
        #[serde(default)]
        retryable: bool,
    },

    #[serde(rename = "queue_flushed")]
    QueueFlushed {
        conversation_id: ConversationId,
        drained: usize,
        cancelled: bool,
    },
}

impl ConversationEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::TurnStarted { conversation_id, .. }
            | Self::ToolInvoked { conversation_id, .. }
            | Self::ToolCompleted { conversation_id, .. }
            | Self::TurnCompleted { conversation_id, .. }
            | Self::TurnCancelled { conversation_id, .. }
            | Self::TurnFailed { conversation_id, .. }
            | Self::QueueFlushed { conversation_id, .. } => conversation_id,
        }
    }

    /// Turn the event belongs to; `None` for queue-level events.
    pub fn turn_id(&self) -> Option<TurnId> {
        match self {
            Self::TurnStarted { turn_id, .. }
            | Self::ToolInvoked { turn_id, .. }
            | Self::ToolCompleted { turn_id, .. }
            | Self::TurnCompleted { turn_id, .. }
            | Self::TurnCancelled { turn_id, .. }
            | Self::TurnFailed { turn_id, .. } => Some(*turn_id),
            Self::QueueFlushed { .. } => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnStarted { .. } => "turn_started",
            Self::ToolInvoked { .. } => "tool_invoked",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::TurnCompleted { .. } => "turn_completed",
            Self::TurnCancelled { .. } => "turn_cancelled",
            Self::TurnFailed { .. } => "turn_failed",
            Self::QueueFlushed { .. } => "queue_flushed",
        }
    }

    /// Whether this event marks the end of a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TurnCompleted { .. } | Self::TurnCancelled { .. } | Self::TurnFailed { .. }
        )
    }
}

/// Broadcast `event`. Having no subscribers is normal and not an error.
pub(crate) fn publish(events: &broadcast::Sender<ConversationEvent>, event: ConversationEvent) {
    if let Err(broadcast::error::SendError(event)) = events.send(event) {
        tracing::trace!(event = event.event_type(), "no event receivers, event dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_serde_tag() {
        let event = ConversationEvent::TurnFailed {
            conversation_id: ConversationId::from_raw("conv_1"),
            turn_id: TurnId::new(3),
            kind: "tool_resolution".into(),
            message: "unknown tool: nope".into(),
            retryable: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.event_type());
        assert_eq!(json["turn_id"], 3);
        assert!(event.is_terminal());
        assert_eq!(event.turn_id(), Some(TurnId::new(3)));
    }

    #[test]
    fn queue_flushed_has_no_turn() {
        let event = ConversationEvent::QueueFlushed {
            conversation_id: ConversationId::new(),
            drained: 2,
            cancelled: true,
        };
        assert!(event.turn_id().is_none());
        assert!(!event.is_terminal());

        let back: ConversationEvent =
            serde_json::from_value(serde_json::to_value(&event).unwrap()).unwrap();
        assert_eq!(back.event_type(), "queue_flushed");
        assert_eq!(back.conversation_id(), event.conversation_id());
    }

    #[test]
    fn turn_failed_without_retryable_field_parses() {
        let json = serde_json::json!({
            "type": "turn_failed",
            "conversation_id": "conv_1",
            "turn_id": 2,
            "kind": "stream",
            "message": "reply stream broke off: eof",
        });
        let event: ConversationEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(event, ConversationEvent::TurnFailed { retryable: false, .. }));
    }

    #[test]
    fn publish_without_receivers_is_silent() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        publish(
            &tx,
            ConversationEvent::TurnCancelled {
                conversation_id: ConversationId::new(),
                turn_id: TurnId::new(1),
            },
        );

        let mut rx = tx.subscribe();
        publish(
            &tx,
            ConversationEvent::TurnCancelled {
                conversation_id: ConversationId::new(),
                turn_id: TurnId::new(2),
            },
        );
        assert_eq!(rx.try_recv().unwrap().turn_id(), Some(TurnId::new(2)));
    }
}
