use parley_core::errors::BackendError;
use parley_core::tools::ToolError;

/// Why a single turn ended in the `Failed` (or `Cancelled`) state.
/// None of these stop the consumer loop.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("backend rejected request: {0}")]
    Submission(BackendError),

    #[error("stream failed: {0}")]
    Stream(BackendError),

    #[error("unknown tool: {0}")]
    ToolResolution(String),

    #[error("tool '{name}' failed: {source}")]
    ToolExecution {
        name: String,
        #[source]
        source: ToolError,
    },

    #[error("turn cancelled")]
    Cancelled,

    #[error("tool loop exceeded {0} rounds")]
    ToolLoopLimit(u32),

    #[error("turn panicked: {0}")]
    Panicked(String),
}

impl TurnError {
    /// Short classification string for logging and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Submission(_) => "submission",
            Self::Stream(_) => "stream",
            Self::ToolResolution(_) => "tool_resolution",
            Self::ToolExecution { .. } => "tool_execution",
            Self::Cancelled => "cancelled",
            Self::ToolLoopLimit(_) => "tool_loop_limit",
            Self::Panicked(_) => "panicked",
        }
    }

    /// The backend error underneath, if any.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            Self::Submission(e) | Self::Stream(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the caller can expect the same input to succeed if re-enqueued.
    /// Only transient backend failures qualify.
    pub fn is_retryable(&self) -> bool {
        self.backend_error().is_some_and(BackendError::is_transient)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("conversation is shut down")]
    QueueClosed,
}
