//! Turn orchestration for parley.
//!
//! A [`Conversation`] owns an [`queue::InputQueue`] drained by one consumer
//! task. Each input becomes a turn run by the [`driver::TurnDriver`], which
//! streams model output to a [`parley_core::sink::ResponseSink`], dispatches
//! tool calls through the [`registry::ToolRegistry`], and records everything
//! in the [`context::ContextStore`].

pub mod context;
pub mod conversation;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod events;
pub mod queue;
pub mod registry;
pub mod segment;
pub mod sink;

pub use conversation::{Conversation, ConversationBuilder};
pub use dispatch::LocalToolExecutor;
pub use driver::{DriverConfig, TurnDriver, TurnOutcome, TurnState};
pub use error::{ConversationError, TurnError};
pub use events::ConversationEvent;
pub use queue::FlushReport;
pub use sink::SentenceSink;
