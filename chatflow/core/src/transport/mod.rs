//! Transport Layer for Reply Streams
//!
//! Normalizes the two wire protocols a backend may speak into one event
//! sequence:
//! - [`ChunkedTransport`]: a single HTTP request whose body is the reply
//! - [`PushTransport`]: an SSE channel carrying named events, triggered by a
//!   separate send request
//! - [`InProcessTransport`]: scripted channel for embedding and tests
//!
//! # Design Philosophy
//!
//! Every adapter produces the same grammar:
//!
//! ```text
//! Opened Chunk* (Finished | Failed)
//! ```
//!
//! An [`EventStream`] is lazy. Nothing touches the network until it is first
//! polled, and dropping it tears down the underlying reader or channel
//! synchronously. Cancellation is therefore as simple as dropping the stream;
//! adapters additionally observe the [`CancelToken`] at every suspension point
//! so a stream that is still being polled ends promptly without a terminal
//! event.

pub mod chunked;
pub mod factory;
pub mod in_process;
pub mod push;

use std::pin::Pin;

use futures::Stream;
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::error::StreamFailure;
use crate::identity::UserId;

pub use chunked::{ChunkFraming, ChunkedTransport};
pub use factory::create_transport;
pub use in_process::InProcessTransport;
pub use push::PushTransport;

/// Normalized transport event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Channel established, the reply may start
    Opened,
    /// A fragment of reply text (arbitrary boundaries)
    Chunk(String),
    /// Reply completed normally
    Finished,
    /// Reply terminated by a failure
    Failed(StreamFailure),
}

impl StreamEvent {
    /// Whether this event ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed(_))
    }
}

/// Boxed event stream returned by every adapter
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Everything an adapter needs to request one reply
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    /// Project the chat belongs to
    pub project_id: String,
    /// Chat identifier
    pub chat_id: String,
    /// Anonymous user identifier
    pub user_id: UserId,
    /// Reply language hint
    pub language: String,
    /// The user's message
    pub msg: String,
}

/// A reply-stream protocol
pub trait TransportAdapter: Send + Sync {
    /// Short protocol name for logs
    fn name(&self) -> &'static str;

    /// Open a reply stream for `request`
    ///
    /// The returned stream must end after its first terminal event, and must
    /// end without a terminal event once `token` is cancelled.
    fn open(&self, request: StreamRequest, token: CancelToken) -> EventStream;
}

/// Logs the release of a reply stream's resources
///
/// Held inside each adapter's stream body, so it drops exactly when the
/// reader or channel does: on completion, failure, cancellation, or when the
/// consumer drops the stream.
#[derive(Debug)]
pub(crate) struct StreamGuard {
    transport: &'static str,
    completed: bool,
}

impl StreamGuard {
    pub(crate) fn new(transport: &'static str) -> Self {
        tracing::debug!(transport, "Reply stream opening");
        Self {
            transport,
            completed: false,
        }
    }

    /// Mark that a terminal event was delivered
    pub(crate) fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.completed {
            tracing::debug!(transport = self.transport, "Reply stream released");
        } else {
            tracing::debug!(
                transport = self.transport,
                "Reply stream released before a terminal event"
            );
        }
    }
}
