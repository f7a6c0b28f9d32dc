//! Error Taxonomy
//!
//! Typed errors for every failure the engine can observe. Stream failures
//! travel inside [`crate::transport::StreamEvent::Failed`] and terminate the
//! active reply; persistence failures are logged and never surface on the
//! message; user cancellation is modelled separately because it is not a
//! fault.

use thiserror::Error;

use crate::messages::{LifecycleState, MessageId};

/// A terminal failure reported by a transport adapter
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamFailure {
    /// Channel or request could not be established (includes open timeout)
    #[error("could not open reply stream: {0}")]
    Open(String),

    /// Network-level break after data began flowing
    #[error("reply stream interrupted: {0}")]
    MidStream(String),

    /// Backend returned a structured error (e.g. `{"code": 500, "msg": ...}`)
    #[error("backend error: {0}")]
    Application(String),
}

impl StreamFailure {
    /// The bare reason text, without the category prefix
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Open(reason) | Self::MidStream(reason) | Self::Application(reason) => reason,
        }
    }
}

/// Failure while persisting a finished reply
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Request could not be sent or the response not read
    #[error("persistence request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with a non-success status
    #[error("persistence rejected with status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (possibly empty)
        body: String,
    },
}

/// Errors surfaced by the lifecycle controller and session API
#[derive(Debug, Error)]
pub enum EngineError {
    /// A reply is already in flight for this session
    #[error("a reply is already in flight for this session")]
    Busy,

    /// The user stopped the reply
    #[error("reply cancelled by user")]
    CancelledByUser,

    /// The reply stream failed
    #[error(transparent)]
    Stream(#[from] StreamFailure),

    /// Saving a finished reply failed
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// No message with this id exists in the conversation log
    #[error("message {0} not found in conversation log")]
    MessageNotFound(MessageId),

    /// Attempted mutation violates the lifecycle state machine
    #[error("invalid lifecycle transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state
        from: LifecycleState,
        /// Requested state
        to: LifecycleState,
    },

    /// The reply handle does not match the session's active request
    #[error("message {0} is not the active reply of this session")]
    NotActive(MessageId),

    /// Message belongs to the user and can never be mutated
    #[error("message {0} is immutable")]
    Immutable(MessageId),

    /// HTTP failure outside a reply stream (history restore)
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered a non-stream request with a failure status
    #[error("backend returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (possibly empty)
        body: String,
    },
}
