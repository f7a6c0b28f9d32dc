//! Message Lifecycle Controller
//!
//! Drives one assistant placeholder from submission to a terminal state.
//!
//! # Design Philosophy
//!
//! The controller is the only writer of a session's `active_request` slot and
//! of an in-flight placeholder. It consumes transport events strictly in
//! order and applies each one as a lifecycle transition:
//!
//! - `Chunk`: extend the raw buffer, re-segment, re-render
//! - `Finished`: force-close segments, render final text, persist in the
//!   background
//! - `Failed`: keep what streamed, append a visible annotation
//! - token cancelled: drop the stream, append the stop marker
//!
//! Cancellation is checked again after every suspension point, so no chunk
//! that arrives after a stop request is ever applied.
//!
//! # Example
//!
//! ```ignore
//! let controller = ReplyController::new(transport, backend);
//! let reply = controller.submit(&mut session, "Explain lifetimes").await?;
//! let stop = reply.token().clone(); // hand to a Ctrl-C handler
//! let outcome = controller.drive(&mut session, reply).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::error::{EngineError, PersistenceError, StreamFailure};
use crate::messages::{
    error_annotation, LifecycleState, MessageId, ReplyUpdate, STOP_MARKER, THINKING_INDICATOR,
};
use crate::persistence::PersistenceGateway;
use crate::render::{FencedRenderer, Renderer};
use crate::segmenter::{Segment, Segmenter};
use crate::session::{ActiveRequest, Message, Session};
use crate::transport::{StreamEvent, StreamRequest, TransportAdapter};

// ============================================================================
// Configuration
// ============================================================================

/// What to do when a message is submitted while a reply is in flight
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusyPolicy {
    /// Refuse the new message with [`EngineError::Busy`]
    #[default]
    Reject,
    /// Stop the active reply, then accept the new message
    CancelActive,
}

/// Controller settings
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Behavior for a submission while busy
    pub busy_policy: BusyPolicy,
    /// Pause after each applied chunk (typewriter pacing, zero to disable)
    pub reveal_delay: Duration,
    /// Reply language hint sent with every request
    pub language: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            busy_policy: BusyPolicy::Reject,
            reveal_delay: Duration::ZERO,
            language: "en".to_string(),
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

/// A submitted reply waiting to be driven
#[derive(Debug)]
pub struct ActiveReply {
    message_id: MessageId,
    request: StreamRequest,
    token: CancelToken,
}

impl ActiveReply {
    /// Placeholder this reply fills
    #[must_use]
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Request that will be sent to the transport
    #[must_use]
    pub fn request(&self) -> &StreamRequest {
        &self.request
    }

    /// Token that stops this reply
    #[must_use]
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Ask the reply to stop
    ///
    /// Returns `false` if a stop was already requested.
    pub fn stop(&self) -> bool {
        self.token.cancel()
    }
}

/// Terminal result of driving a reply
#[derive(Debug)]
pub struct ReplyOutcome {
    /// The placeholder that was driven
    pub message_id: MessageId,
    /// Terminal state reached
    pub state: LifecycleState,
    /// Final displayed text
    pub text: String,
    /// Why the reply failed (only for `Errored`)
    pub failure: Option<StreamFailure>,
    /// Background save of the reply (only for a non-empty `Finalized` reply)
    pub persistence: Option<JoinHandle<Result<(), PersistenceError>>>,
}

impl ReplyOutcome {
    /// Collapse into the final text, or the reason there is none
    ///
    /// # Errors
    ///
    /// [`EngineError::Stream`] for an errored reply and
    /// [`EngineError::CancelledByUser`] for a stopped one.
    pub fn into_result(self) -> Result<String, EngineError> {
        match (self.state, self.failure) {
            (LifecycleState::Cancelled, _) => Err(EngineError::CancelledByUser),
            (_, Some(failure)) => Err(EngineError::Stream(failure)),
            _ => Ok(self.text),
        }
    }
}

/// How the event loop ended
enum Ending {
    Finished,
    Failed(StreamFailure),
    Cancelled,
}

// ============================================================================
// Controller
// ============================================================================

/// Drives assistant replies for sessions
pub struct ReplyController {
    transport: Arc<dyn TransportAdapter>,
    persistence: Arc<dyn PersistenceGateway>,
    renderer: Arc<dyn Renderer>,
    config: ControllerConfig,
    updates: Option<mpsc::UnboundedSender<ReplyUpdate>>,
}

impl ReplyController {
    /// Create a controller with the default renderer and settings
    pub fn new(
        transport: Arc<dyn TransportAdapter>,
        persistence: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self {
            transport,
            persistence,
            renderer: Arc::new(FencedRenderer),
            config: ControllerConfig::default(),
            updates: None,
        }
    }

    /// Use a different renderer
    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Use different settings
    #[must_use]
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish a [`ReplyUpdate`] after every placeholder mutation
    ///
    /// Publishing never waits on the receiver, so a slow consumer cannot hold
    /// up a reply or its cancellation.
    #[must_use]
    pub fn with_updates(mut self, updates: mpsc::UnboundedSender<ReplyUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    /// Current settings
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Submit a user message and prepare its reply
    ///
    /// Appends the user message and a placeholder in `Thinking` state, and
    /// claims the session's active slot. No network activity happens until
    /// [`Self::drive`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Busy`] if a reply is in flight and the busy
    /// policy is [`BusyPolicy::Reject`].
    pub async fn submit(
        &self,
        session: &mut Session,
        text: &str,
    ) -> Result<ActiveReply, EngineError> {
        if let Some(active) = session.active_request().cloned() {
            match self.config.busy_policy {
                BusyPolicy::Reject => {
                    tracing::warn!(
                        active = %active.message_id,
                        "Rejected message while a reply is in flight"
                    );
                    return Err(EngineError::Busy);
                }
                BusyPolicy::CancelActive => {
                    tracing::info!(active = %active.message_id, "Cancelling active reply for new message");
                    active.token.cancel();
                    let result = self.mark_cancelled(session, &active.message_id);
                    session.clear_active(&active.message_id);
                    result?;
                }
            }
        }

        session.log_mut().push(Message::user(text));
        let message_id = session.log_mut().push(Message::placeholder());
        let message = session
            .log_mut()
            .transition(&message_id, LifecycleState::Thinking)?;
        message.text = THINKING_INDICATOR.to_string();
        let update = update_for(message);

        let token = CancelToken::new();
        session.set_active(ActiveRequest {
            message_id: message_id.clone(),
            token: token.clone(),
        });
        self.notify(update);

        let request = StreamRequest {
            project_id: session.project_id.clone(),
            chat_id: session.chat_id.clone(),
            user_id: session.user_id,
            language: self.config.language.clone(),
            msg: text.to_string(),
        };
        tracing::info!(
            message_id = %message_id,
            chat_id = %session.chat_id,
            transport = self.transport.name(),
            "Submitted message"
        );

        Ok(ActiveReply {
            message_id,
            request,
            token,
        })
    }

    /// Drive a submitted reply to a terminal state
    ///
    /// Errored and cancelled replies are normal outcomes, not errors. The
    /// session's active slot is released on every exit path.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotActive`] if `reply` is not the session's
    /// active request, or a lifecycle error if the placeholder was mutated
    /// out of band.
    pub async fn drive(
        &self,
        session: &mut Session,
        reply: ActiveReply,
    ) -> Result<ReplyOutcome, EngineError> {
        let is_active = session
            .active_request()
            .is_some_and(|active| active.message_id == reply.message_id);
        if !is_active {
            return Err(EngineError::NotActive(reply.message_id));
        }

        let message_id = reply.message_id.clone();
        let result = self.run(session, reply).await;
        session.clear_active(&message_id);
        result
    }

    /// Submit a message and drive its reply
    ///
    /// # Errors
    ///
    /// See [`Self::submit`] and [`Self::drive`].
    pub async fn send(&self, session: &mut Session, text: &str) -> Result<ReplyOutcome, EngineError> {
        let reply = self.submit(session, text).await?;
        self.drive(session, reply).await
    }

    async fn run(
        &self,
        session: &mut Session,
        reply: ActiveReply,
    ) -> Result<ReplyOutcome, EngineError> {
        let ActiveReply {
            message_id,
            request,
            token,
        } = reply;

        let mut stream = self.transport.open(request, token.clone());
        let mut segmenter = Segmenter::new();
        // Length of the displayed text rendered from finalized segments
        let mut stable_len = 0;

        let ending = loop {
            let Some(next) = token.run_until_cancelled(stream.next()).await else {
                break Ending::Cancelled;
            };
            if token.is_cancelled() {
                break Ending::Cancelled;
            }

            match next {
                Some(StreamEvent::Opened) => {
                    tracing::debug!(message_id = %message_id, "Reply stream opened");
                }
                Some(StreamEvent::Chunk(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    let update =
                        self.apply_chunk(session, &message_id, &mut segmenter, &mut stable_len, &chunk)?;
                    self.notify(update);

                    if !self.config.reveal_delay.is_zero()
                        && !token.sleep(self.config.reveal_delay).await
                    {
                        break Ending::Cancelled;
                    }
                }
                Some(StreamEvent::Finished) => break Ending::Finished,
                Some(StreamEvent::Failed(failure)) => break Ending::Failed(failure),
                None => {
                    break Ending::Failed(StreamFailure::MidStream(
                        "reply stream ended without completion".to_string(),
                    ))
                }
            }
        };
        // Tear down the reader before the terminal transition
        drop(stream);

        match ending {
            Ending::Finished => {
                self.finalize(session, &message_id, &mut segmenter, stable_len)
            }
            Ending::Failed(failure) => {
                self.fail(session, &message_id, &mut segmenter, failure)
            }
            Ending::Cancelled => {
                close_segments(session, &message_id, &mut segmenter)?;
                self.mark_cancelled(session, &message_id)
            }
        }
    }

    fn apply_chunk(
        &self,
        session: &mut Session,
        message_id: &MessageId,
        segmenter: &mut Segmenter,
        stable_len: &mut usize,
        chunk: &str,
    ) -> Result<ReplyUpdate, EngineError> {
        let message = session
            .log_mut()
            .transition(message_id, LifecycleState::Streaming)?;
        message.raw.push_str(chunk);

        // Only the provisional tail is re-rendered
        let update = segmenter.update(&message.raw);
        message.text.truncate(*stable_len);
        for segment in update.finalized {
            message.text.push_str(&self.renderer.render(&segment));
            message.segments.push(segment);
        }
        *stable_len = message.text.len();
        if let Some(pending) = &update.pending {
            message.text.push_str(&self.renderer.render(pending));
        }

        tracing::debug!(
            message_id = %message_id,
            chunk_len = chunk.len(),
            total_len = message.raw.len(),
            segments = message.segments.len(),
            "Applied chunk"
        );
        Ok(update_for(message))
    }

    fn finalize(
        &self,
        session: &mut Session,
        message_id: &MessageId,
        segmenter: &mut Segmenter,
        stable_len: usize,
    ) -> Result<ReplyOutcome, EngineError> {
        let chat_id = session.chat_id.clone();
        let message = session
            .log_mut()
            .transition(message_id, LifecycleState::Finalized)?;

        message.text.truncate(stable_len);
        for segment in segmenter.finish(&message.raw) {
            message.text.push_str(&self.renderer.render(&segment));
            message.segments.push(segment);
        }

        let persistence = if message.raw.is_empty() {
            tracing::debug!(message_id = %message_id, "Empty reply, nothing to persist");
            None
        } else {
            Some(self.persist(chat_id, message.raw.clone()))
        };

        tracing::info!(
            message_id = %message_id,
            len = message.raw.len(),
            segments = message.segments.len(),
            "Reply finalized"
        );
        let update = update_for(message);
        let text = update.text.clone();
        self.notify(update);

        Ok(ReplyOutcome {
            message_id: message_id.clone(),
            state: LifecycleState::Finalized,
            text,
            failure: None,
            persistence,
        })
    }

    fn fail(
        &self,
        session: &mut Session,
        message_id: &MessageId,
        segmenter: &mut Segmenter,
        failure: StreamFailure,
    ) -> Result<ReplyOutcome, EngineError> {
        close_segments(session, message_id, segmenter)?;

        let message = session.log_mut().placeholder_mut(message_id)?;
        let streamed = message.state == LifecycleState::Streaming && !message.text.is_empty();
        let message = session
            .log_mut()
            .transition(message_id, LifecycleState::Errored)?;

        let annotation = error_annotation(failure.reason());
        message.text = if streamed {
            format!("{}\n\n{annotation}", message.text)
        } else {
            annotation
        };

        tracing::warn!(message_id = %message_id, error = %failure, "Reply failed");
        let update = update_for(message);
        let text = update.text.clone();
        self.notify(update);

        Ok(ReplyOutcome {
            message_id: message_id.clone(),
            state: LifecycleState::Errored,
            text,
            failure: Some(failure),
            persistence: None,
        })
    }

    /// Move a placeholder to `Cancelled` and show the stop marker
    fn mark_cancelled(
        &self,
        session: &mut Session,
        message_id: &MessageId,
    ) -> Result<ReplyOutcome, EngineError> {
        let message = session.log_mut().placeholder_mut(message_id)?;
        let streamed = message.state == LifecycleState::Streaming && !message.text.is_empty();
        let message = session
            .log_mut()
            .transition(message_id, LifecycleState::Cancelled)?;

        message.text = if streamed {
            format!("{}\n\n{STOP_MARKER}", message.text)
        } else {
            STOP_MARKER.to_string()
        };

        tracing::info!(message_id = %message_id, "Reply stopped by user");
        let update = update_for(message);
        let text = update.text.clone();
        self.notify(update);

        Ok(ReplyOutcome {
            message_id: message_id.clone(),
            state: LifecycleState::Cancelled,
            text,
            failure: None,
            persistence: None,
        })
    }

    fn persist(
        &self,
        chat_id: String,
        content: String,
    ) -> JoinHandle<Result<(), PersistenceError>> {
        let gateway = Arc::clone(&self.persistence);
        tokio::spawn(async move {
            let result = gateway.save(&chat_id, &content).await;
            if let Err(e) = &result {
                tracing::warn!(chat_id = %chat_id, error = %e, "Failed to persist reply");
            }
            result
        })
    }

    fn notify(&self, update: ReplyUpdate) {
        if let Some(tx) = &self.updates {
            if let Err(e) = tx.send(update) {
                tracing::warn!("Failed to send reply update: {}", e);
            }
        }
    }
}

/// Record the remaining segments of an interrupted reply
///
/// The displayed text is left untouched.
fn close_segments(
    session: &mut Session,
    message_id: &MessageId,
    segmenter: &mut Segmenter,
) -> Result<(), EngineError> {
    let message = session.log_mut().placeholder_mut(message_id)?;
    let rest: Vec<Segment> = segmenter.finish(&message.raw);
    message.segments.extend(rest);
    Ok(())
}

fn update_for(message: &Message) -> ReplyUpdate {
    ReplyUpdate {
        message_id: message.id.clone(),
        state: message.state,
        text: message.text.clone(),
    }
}
