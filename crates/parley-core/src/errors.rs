use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a failed model request means for whoever re-enqueues the input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// The same request will fail again: bad credentials or a malformed body.
    Permanent,
    /// Resubmitting later may succeed.
    Transient,
    /// Ended on this side of the wire (deadline or abort), not by the provider.
    Local,
}

/// A model backend could not accept or finish a request.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("throttled by provider")]
    Throttled { retry_after: Option<Duration> },

    #[error("provider returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("reply stream broke off: {0}")]
    Interrupted(String),

    #[error("no reply within {0:?}")]
    TimedOut(Duration),

    #[error("aborted")]
    Aborted,
}

impl BackendError {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Unauthorized(_) | Self::Rejected(_) => Disposition::Permanent,
            Self::Throttled { .. }
            | Self::Upstream { .. }
            | Self::Connection(_)
            | Self::Interrupted(_) => Disposition::Transient,
            Self::TimedOut(_) | Self::Aborted => Disposition::Local,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.disposition() == Disposition::Transient
    }

    /// Stable snake_case name used as a log field.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Rejected(_) => "rejected",
            Self::Throttled { .. } => "throttled",
            Self::Upstream { .. } => "upstream",
            Self::Connection(_) => "connection",
            Self::Interrupted(_) => "interrupted",
            Self::TimedOut(_) => "timed_out",
            Self::Aborted => "aborted",
        }
    }

    /// Map a non-success HTTP status from a chat-completions endpoint.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(body),
            429 => Self::Throttled { retry_after: None },
            500..=599 => Self::Upstream { status, body },
            400..=499 => Self::Rejected(body),
            _ => Self::Rejected(format!("unexpected status {status}: {body}")),
        }
    }
}
