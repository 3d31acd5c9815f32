//! Error taxonomy shared by tasks, the hub and clients.

use std::time::Duration;
use tokio_tungstenite::tungstenite;

/// Errors produced by task validation, hub dispatch and client connections.
///
/// Every variant has a stable wire name (see [`Error::kind`]) which the hub
/// puts into the `error` field of error envelopes.
#[derive(Debug)]
pub enum Error {
    /// Missing or malformed required fields.
    Validation(String),
    /// Unknown lifecycle event name.
    UnsupportedEvent(String),
    /// Unknown frame command.
    UnsupportedCommand(String),
    /// An event id that was already recorded on the task.
    DuplicateEvent(String),
    /// A frame that is not parseable as JSON.
    Syntax(String),
    /// An event the transition policy refuses.
    InvalidTransition { task_id: String, message: String },
    /// A non-init event for a task that was never initialized.
    UnknownTask(String),
    /// Connection-time credential mismatch.
    Unauthorized(String),
    /// The connect retry budget was exhausted.
    ConnectionTimeout {
        elapsed: Duration,
        last_error: Box<tungstenite::Error>,
    },
    /// A non-retryable transport failure.
    Connection(Box<tungstenite::Error>),
    /// The connection is no longer open.
    Closed,
    /// Awaiting the result of a failed task without a default.
    NoResult { task_id: String },
    /// The task store failed.
    Store(String),
    /// An error envelope sent back by the hub.
    Remote { kind: String, message: String },
}

impl Error {
    /// Wire name of the error kind.
    pub fn kind(&self) -> &str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::UnsupportedEvent(_) => "UnsupportedEventError",
            Error::UnsupportedCommand(_) => "UnsupportedCommandError",
            Error::DuplicateEvent(_) => "DuplicateEventError",
            Error::Syntax(_) => "SyntaxError",
            Error::InvalidTransition { .. } => "InvalidTransitionError",
            Error::UnknownTask(_) => "UnknownTaskError",
            Error::Unauthorized(_) => "UnauthorizedError",
            Error::ConnectionTimeout { .. } => "ConnectionTimeoutError",
            Error::Connection(_) => "ConnectionError",
            Error::Closed => "ClosedError",
            Error::NoResult { .. } => "NoResultError",
            Error::Store(_) => "StoreError",
            Error::Remote { kind, .. } => kind,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub(crate) fn invalid_transition(task_id: &str, message: impl Into<String>) -> Self {
        Error::InvalidTransition {
            task_id: task_id.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Validation(msg) => write!(f, "{}", msg),
            Error::UnsupportedEvent(event) => write!(f, "unsupported event: '{}'", event),
            Error::UnsupportedCommand(cmd) => write!(f, "unsupported command: '{}'", cmd),
            Error::DuplicateEvent(id) => write!(f, "event with id '{}' has already been added", id),
            Error::Syntax(msg) => write!(f, "invalid JSON: {}", msg),
            Error::InvalidTransition { task_id, message } => write!(f, "task {}: {}", task_id, message),
            Error::UnknownTask(id) => write!(f, "unknown task: {}", id),
            Error::Unauthorized(identity) => write!(f, "unauthorized: {}", identity),
            Error::ConnectionTimeout { elapsed, last_error } => {
                write!(f, "could not connect within {:?}: {}", elapsed, last_error)
            }
            Error::Connection(e) => write!(f, "connection error: {}", e),
            Error::Closed => write!(f, "connection closed"),
            Error::NoResult { task_id } => write!(f, "task {} failed without a result", task_id),
            Error::Store(msg) => write!(f, "store error: {}", msg),
            Error::Remote { kind, message } => write!(f, "{}: {}", kind, message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ConnectionTimeout { last_error, .. } => Some(last_error.as_ref()),
            Error::Connection(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Error::Store(format!("{:#}", e))
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::Connection(Box::new(e))
    }
}
