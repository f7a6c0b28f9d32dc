//! In-Process Transport
//!
//! Channel-backed adapter for embedding the engine behind a custom backend,
//! and for driving the controller with a scripted event sequence in tests.
//!
//! # Usage
//!
//! ```ignore
//! let (transport, events) = InProcessTransport::new_pair();
//!
//! // Give the transport to a ReplyController, then feed it:
//! events.send(StreamEvent::Opened).await?;
//! events.send(StreamEvent::Chunk("Hello".into())).await?;
//! events.send(StreamEvent::Finished).await?;
//! ```
//!
//! Each call to [`TransportAdapter::open`] takes the next queued channel; the
//! requests it was opened with are recorded for inspection.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{EventStream, StreamEvent, StreamGuard, StreamRequest, TransportAdapter};
use crate::cancel::CancelToken;
use crate::error::StreamFailure;

/// Default channel capacity
const DEFAULT_CAPACITY: usize = 100;

/// In-process transport using tokio channels
#[derive(Clone, Debug, Default)]
pub struct InProcessTransport {
    /// Channels waiting to be opened, in order
    queued: Arc<Mutex<VecDeque<mpsc::Receiver<StreamEvent>>>>,
    /// Requests seen by `open`
    requests: Arc<Mutex<Vec<StreamRequest>>>,
}

impl InProcessTransport {
    /// Create a transport with one queued reply channel
    ///
    /// Returns the transport and the sender that scripts the first reply.
    #[must_use]
    pub fn new_pair() -> (Self, mpsc::Sender<StreamEvent>) {
        let transport = Self::default();
        let sender = transport.queue_reply();
        (transport, sender)
    }

    /// Queue a channel for the next `open`, returning its sender
    #[must_use]
    pub fn queue_reply(&self) -> mpsc::Sender<StreamEvent> {
        self.queue_reply_with_capacity(DEFAULT_CAPACITY)
    }

    /// Queue a channel with custom capacity
    #[must_use]
    pub fn queue_reply_with_capacity(&self, capacity: usize) -> mpsc::Sender<StreamEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.queued.lock().push_back(rx);
        tx
    }

    /// Requests this transport was opened with, in order
    #[must_use]
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }
}

impl TransportAdapter for InProcessTransport {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn open(&self, request: StreamRequest, token: CancelToken) -> EventStream {
        self.requests.lock().push(request);

        let Some(rx) = self.queued.lock().pop_front() else {
            return Box::pin(futures::stream::once(async {
                StreamEvent::Failed(StreamFailure::Open(
                    "no in-process reply channel queued".to_string(),
                ))
            }));
        };

        let mut events = ReceiverStream::new(rx);
        Box::pin(async_stream::stream! {
            let mut guard = StreamGuard::new("in-process");
            loop {
                let Some(next) = token.run_until_cancelled(events.next()).await else {
                    return;
                };
                match next {
                    Some(event) => {
                        let terminal = event.is_terminal();
                        if terminal {
                            guard.complete();
                        }
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                    None => {
                        guard.complete();
                        yield StreamEvent::Failed(StreamFailure::MidStream(
                            "in-process channel closed".to_string(),
                        ));
                        return;
                    }
                }
            }
        })
    }
}
