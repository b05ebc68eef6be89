use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use parley_core::ids::TurnId;

use crate::error::ConversationError;

/// One input released to the consumer, together with the cancel handle that
/// `flush()` will trip.
#[derive(Debug)]
pub struct Admission {
    pub turn_id: TurnId,
    pub text: String,
    pub cancel: CancellationToken,
}

/// What a `flush()` call did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Queued inputs discarded without processing.
    pub drained: usize,
    /// Whether an in-flight turn was cancelled.
    pub cancelled: bool,
}

impl FlushReport {
    pub fn is_noop(&self) -> bool {
        self.drained == 0 && !self.cancelled
    }
}

struct ActiveSlot {
    turn_id: TurnId,
    cancel: CancellationToken,
}

struct QueueState {
    items: VecDeque<String>,
    active: Option<ActiveSlot>,
    next_turn: u64,
    closed: bool,
}

/// FIFO of pending user inputs with a single consumer.
///
/// The queue also tracks the turn currently in flight so that `flush()` can
/// cancel it and wait until the consumer reports it finished.
pub struct InputQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    active_tx: watch::Sender<Option<TurnId>>,
}

impl InputQueue {
    pub fn new() -> Self {
        let (active_tx, _) = watch::channel(None);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                active: None,
                next_turn: 0,
                closed: false,
            }),
            notify: Notify::new(),
            active_tx,
        }
    }

    /// Append to the queue. Never blocks; returns the queue depth after the
    /// push.
    pub fn enqueue(&self, text: impl Into<String>) -> Result<usize, ConversationError> {
        let depth = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ConversationError::QueueClosed);
            }
            state.items.push_back(text.into());
            state.items.len()
        };
        self.notify.notify_one();
        Ok(depth)
    }

    /// Wait for the next input and mark it as the active turn. Returns `None`
    /// once the queue is closed and empty.
    pub async fn dequeue(&self) -> Option<Admission> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(text) = state.items.pop_front() {
                    state.next_turn += 1;
                    let turn_id = TurnId::new(state.next_turn);
                    let cancel = CancellationToken::new();
                    state.active = Some(ActiveSlot {
                        turn_id,
                        cancel: cancel.clone(),
                    });
                    self.active_tx.send_replace(Some(turn_id));
                    return Some(Admission {
                        turn_id,
                        text,
                        cancel,
                    });
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Called by the consumer when a turn reaches a terminal state.
    pub fn complete(&self, turn_id: TurnId) {
        let mut state = self.state.lock();
        if state.active.as_ref().is_some_and(|a| a.turn_id == turn_id) {
            state.active = None;
            self.active_tx.send_replace(None);
        }
    }

    /// Drop every queued input and cancel the in-flight turn, if any. Returns
    /// after the consumer has acknowledged the cancelled turn.
    pub async fn flush(&self) -> FlushReport {
        let (drained, active) = {
            let mut state = self.state.lock();
            let drained = state.items.len();
            state.items.clear();
            let active = state
                .active
                .as_ref()
                .map(|a| (a.turn_id, a.cancel.clone()));
            (drained, active)
        };

        let cancelled = match active {
            Some((turn_id, cancel)) => {
                cancel.cancel();
                let mut rx = self.active_tx.subscribe();
                let _ = rx.wait_for(|current| *current != Some(turn_id)).await;
                tracing::debug!(%turn_id, "in-flight turn acknowledged cancel");
                true
            }
            None => false,
        };

        FlushReport { drained, cancelled }
    }

    /// Stop accepting input and wake the consumer.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Inputs waiting behind the active turn.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The turn currently in flight.
    pub fn active(&self) -> Option<TurnId> {
        *self.active_tx.borrow()
    }

    /// No queued input and no turn in flight.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.items.is_empty() && state.active.is_none()
    }
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}
