use std::fmt;

use crate::record::TopicPartition;

/// Error raised by a [`RecordSource`](crate::source::RecordSource).
#[derive(Debug)]
pub enum SourceError {
    /// Broker unreachable or connection lost. Transient — callers retry
    /// with backoff inside a bounded attempt budget.
    Connection(String),
    /// Resume cursor predates the retained log history. Resolved by
    /// policy: seek to earliest or fail.
    OffsetOutOfRange {
        tp: TopicPartition,
        requested: i64,
        earliest: i64,
    },
}

impl SourceError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Connection(_))
    }

    /// Add context to the error, preserving the variant where possible.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        match self {
            SourceError::Connection(msg) => SourceError::Connection(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Connection(msg) => write!(f, "connection: {msg}"),
            SourceError::OffsetOutOfRange {
                tp,
                requested,
                earliest,
            } => write!(
                f,
                "offset out of range on {tp}: requested {requested}, earliest retained {earliest}"
            ),
        }
    }
}

impl std::error::Error for SourceError {}

/// Failure raised inside agent handler logic.
///
/// Wraps whatever the handler produced; retried per the agent's restart
/// policy, after which the agent is marked Failed.
#[derive(Debug)]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }

    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

// ---------------------------------------------------------------------------
// From impls: standard error types → HandlerError
// ---------------------------------------------------------------------------

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<std::str::Utf8Error> for HandlerError {
    fn from(e: std::str::Utf8Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for HandlerError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Self::new(e.to_string())
    }
}
