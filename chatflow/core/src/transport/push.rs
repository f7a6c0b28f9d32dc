//! Server-Push Transport
//!
//! Reply text arrives over a long-lived SSE channel while the message itself
//! is submitted with a separate request:
//!
//! ```text
//! GET  /sse/connect?userId=..      ──▶ Open
//! POST /api/ai/chat-stream-v2      (issued once, after the first Open)
//!                                  ◀── event: add     data: <text>
//!                                  ◀── event: finish
//!                                  ◀── event: error   data: <reason>
//! ```
//!
//! The send request goes out only after the channel is open, so no event can
//! be lost to a channel that is not listening yet. If the channel drops and
//! reconnects, the message is not sent again.
//!
//! While the event source is reconnecting its errors are transient and are
//! only logged. Before the first `Open` the source retries until the open
//! deadline, which fails the stream with `"timeout"`. After it, reconnects
//! are bounded by `max_reconnects`.

use std::time::Duration;

use futures::StreamExt;
use reqwest_eventsource::{retry, Error as SourceError, Event, EventSource, ReadyState};

use super::{EventStream, StreamEvent, StreamGuard, StreamRequest, TransportAdapter};
use crate::cancel::CancelToken;
use crate::error::StreamFailure;

/// Push channel endpoint, relative to the base URL
pub const CONNECT_PATH: &str = "/sse/connect";

/// Send endpoint used together with the push channel
pub const CHAT_STREAM_V2_PATH: &str = "/api/ai/chat-stream-v2";

/// Default deadline for the channel to open
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Server-push adapter
#[derive(Clone, Debug)]
pub struct PushTransport {
    client: reqwest::Client,
    base_url: String,
    open_timeout: Duration,
    reconnect_delay: Duration,
    max_reconnects: usize,
}

impl PushTransport {
    /// Create an adapter for the backend at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create an adapter sharing an existing HTTP client
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            reconnect_delay: Duration::from_secs(1),
            max_reconnects: 3,
        }
    }

    /// Set the open deadline
    #[must_use]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set the reconnect delay and how many reconnects a reply may use
    #[must_use]
    pub fn with_reconnect(mut self, delay: Duration, max_reconnects: usize) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnects = max_reconnects;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Closes the event source when the stream body is dropped
struct PushChannel {
    source: EventSource,
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.source.close();
    }
}

impl TransportAdapter for PushTransport {
    fn name(&self) -> &'static str {
        "push"
    }

    fn open(&self, request: StreamRequest, token: CancelToken) -> EventStream {
        let client = self.client.clone();
        let connect_url = self.url(CONNECT_PATH);
        let send_url = self.url(CHAT_STREAM_V2_PATH);
        let open_timeout = self.open_timeout;
        let max_reconnects = self.max_reconnects;
        let retry_policy = retry::Constant::new(self.reconnect_delay, None);

        Box::pin(async_stream::stream! {
            let mut guard = StreamGuard::new("push");

            let connect = client
                .get(&connect_url)
                .query(&[("userId", request.user_id.to_string())]);
            let mut channel = match EventSource::new(connect) {
                Ok(source) => PushChannel { source },
                Err(e) => {
                    guard.complete();
                    yield StreamEvent::Failed(StreamFailure::Open(e.to_string()));
                    return;
                }
            };
            channel.source.set_retry_policy(Box::new(retry_policy));

            let deadline = tokio::time::Instant::now() + open_timeout;
            let mut opened = false;
            let mut reconnects = 0usize;

            loop {
                let next = if opened {
                    token.run_until_cancelled(channel.source.next()).await
                } else {
                    let waited = token
                        .run_until_cancelled(tokio::time::timeout_at(
                            deadline,
                            channel.source.next(),
                        ))
                        .await;
                    match waited {
                        None => None,
                        Some(Ok(next)) => Some(next),
                        Some(Err(_elapsed)) => {
                            tracing::warn!(url = %connect_url, ?open_timeout, "Push channel did not open in time");
                            guard.complete();
                            yield StreamEvent::Failed(StreamFailure::Open("timeout".to_string()));
                            return;
                        }
                    }
                };
                let Some(next) = next else {
                    // Cancelled
                    return;
                };

                match next {
                    Some(Ok(Event::Open)) if opened => {
                        tracing::debug!("Push channel reconnected");
                    }
                    Some(Ok(Event::Open)) => {
                        opened = true;
                        tracing::debug!(url = %connect_url, "Push channel opened");
                        yield StreamEvent::Opened;

                        let send = client.post(&send_url).json(&request).send();
                        let failure = match token.run_until_cancelled(send).await {
                            None => return,
                            Some(Ok(response)) if response.status().is_success() => None,
                            Some(Ok(response)) => Some(format!(
                                "send failed: HTTP {}",
                                response.status().as_u16()
                            )),
                            Some(Err(e)) => Some(format!("send failed: {e}")),
                        };
                        if let Some(reason) = failure {
                            guard.complete();
                            yield StreamEvent::Failed(StreamFailure::Open(reason));
                            return;
                        }
                    }
                    Some(Ok(Event::Message(message))) => match message.event.as_str() {
                        "add" => {
                            if !message.data.is_empty() {
                                yield StreamEvent::Chunk(message.data);
                            }
                        }
                        "finish" => {
                            guard.complete();
                            yield StreamEvent::Finished;
                            return;
                        }
                        "error" => {
                            let reason = if message.data.trim().is_empty() {
                                "internal server error".to_string()
                            } else {
                                message.data
                            };
                            guard.complete();
                            yield StreamEvent::Failed(StreamFailure::Application(reason));
                            return;
                        }
                        other => {
                            tracing::debug!(event = other, "Ignoring push event");
                        }
                    },
                    Some(Err(err)) => {
                        let fatal = matches!(
                            err,
                            SourceError::InvalidStatusCode(..) | SourceError::InvalidContentType(..)
                        );
                        let retrying = !fatal
                            && matches!(channel.source.ready_state(), ReadyState::Connecting);
                        if retrying && !opened {
                            // Only the open deadline ends a channel that never opened
                            tracing::debug!(error = %err, "Push channel not open yet, retrying");
                            continue;
                        }
                        if retrying && reconnects < max_reconnects {
                            reconnects += 1;
                            tracing::warn!(error = %err, reconnects, "Push channel reconnecting");
                            continue;
                        }
                        let failure = if opened {
                            StreamFailure::MidStream(format!("SSE connection closed: {err}"))
                        } else {
                            StreamFailure::Open(err.to_string())
                        };
                        guard.complete();
                        yield StreamEvent::Failed(failure);
                        return;
                    }
                    None => {
                        let reason = "SSE connection closed".to_string();
                        guard.complete();
                        yield StreamEvent::Failed(if opened {
                            StreamFailure::MidStream(reason)
                        } else {
                            StreamFailure::Open(reason)
                        });
                        return;
                    }
                }
            }
        })
    }
}
