//! Session and Conversation Log
//!
//! A [`Session`] identifies one conversation (project, chat, anonymous user)
//! and owns its [`ConversationLog`], the append-only sequence of messages a
//! UI renders.
//!
//! # Design Philosophy
//!
//! The log is the single source of truth. Messages are appended in send
//! order and never removed; the one exception is a history restore, which
//! resets the log of an idle session to what the backend stored. User messages are immutable from birth; an
//! assistant placeholder is mutated in place, always located by its
//! [`MessageId`], until it reaches a terminal lifecycle state.
//!
//! The `active_request` slot enforces the central invariant: at most one
//! reply in flight per session. Only the lifecycle controller writes it.
//! Anyone else may only ask for a stop through the slot's token.

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::identity::UserId;
use crate::messages::{LifecycleState, MessageId, Sender};
use crate::segmenter::Segment;

/// A message in the conversation log
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Stable message ID
    pub id: MessageId,
    /// Who sent this message
    pub sender: Sender,
    /// Displayed content (rendered segments plus annotations)
    pub text: String,
    /// Raw reply text received so far
    pub raw: String,
    /// Lifecycle state
    pub state: LifecycleState,
    /// Finalized segments of an assistant reply
    #[serde(default)]
    pub segments: Vec<Segment>,
    /// When the message was created (Unix timestamp ms)
    pub timestamp: u64,
}

impl Message {
    /// A user message (immutable)
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: MessageId::new(),
            sender: Sender::User,
            raw: text.clone(),
            text,
            state: LifecycleState::Finalized,
            segments: Vec::new(),
            timestamp: now_ms(),
        }
    }

    /// An empty assistant placeholder
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            id: MessageId::new(),
            sender: Sender::Assistant,
            text: String::new(),
            raw: String::new(),
            state: LifecycleState::Pending,
            segments: Vec::new(),
            timestamp: now_ms(),
        }
    }

    /// A finished message loaded from history
    #[must_use]
    pub fn restored(sender: Sender, content: impl Into<String>) -> Self {
        let content = content.into();
        let segments = if sender == Sender::Assistant {
            crate::segmenter::segment(&content)
        } else {
            Vec::new()
        };
        Self {
            id: MessageId::new(),
            sender,
            raw: content.clone(),
            text: content,
            state: LifecycleState::Finalized,
            segments,
            timestamp: now_ms(),
        }
    }

    /// Whether the message can no longer change
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Append-only, ordered message log
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConversationLog {
    messages: Vec<Message>,
}

impl ConversationLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, returning its id
    pub fn push(&mut self, message: Message) -> MessageId {
        let id = message.id.clone();
        self.messages.push(message);
        id
    }

    /// Get message by ID
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// All messages in send order
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Most recent message
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Assistant messages that have not reached a terminal state
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.sender == Sender::Assistant && !m.is_terminal())
            .count()
    }

    /// Mutable access to an assistant message
    ///
    /// User messages are refused. Lifecycle rules are left to
    /// [`Self::transition`], so a terminal message is still returned here.
    pub(crate) fn placeholder_mut(&mut self, id: &MessageId) -> Result<&mut Message, EngineError> {
        let message = self
            .messages
            .iter_mut()
            .find(|m| &m.id == id)
            .ok_or_else(|| EngineError::MessageNotFound(id.clone()))?;

        if message.sender == Sender::User {
            return Err(EngineError::Immutable(id.clone()));
        }
        Ok(message)
    }

    /// Move a placeholder to `next`, validating the state machine
    pub(crate) fn transition(
        &mut self,
        id: &MessageId,
        next: LifecycleState,
    ) -> Result<&mut Message, EngineError> {
        let message = self.placeholder_mut(id)?;
        if !message.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: message.state,
                to: next,
            });
        }
        if message.state != next {
            tracing::debug!(
                message_id = %id,
                from = ?message.state,
                to = ?next,
                "Lifecycle transition"
            );
        }
        message.state = next;
        Ok(message)
    }

    fn replace_all(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }
}

/// The reply currently in flight
#[derive(Clone, Debug)]
pub struct ActiveRequest {
    /// Placeholder being driven
    pub message_id: MessageId,
    /// Token that stops it
    pub token: CancelToken,
}

/// A conversation session
#[derive(Debug)]
pub struct Session {
    /// Project (model/knowledge base) the chat belongs to
    pub project_id: String,
    /// Chat identifier on the backend
    pub chat_id: String,
    /// Anonymous per-install user identifier
    pub user_id: UserId,
    /// Conversation history
    log: ConversationLog,
    /// Reply in flight (if any)
    active_request: Option<ActiveRequest>,
}

impl Session {
    /// Create a session with an empty log
    pub fn new(project_id: impl Into<String>, chat_id: impl Into<String>, user_id: UserId) -> Self {
        Self {
            project_id: project_id.into(),
            chat_id: chat_id.into(),
            user_id,
            log: ConversationLog::new(),
            active_request: None,
        }
    }

    /// The conversation log
    #[must_use]
    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    /// The reply currently in flight
    #[must_use]
    pub fn active_request(&self) -> Option<&ActiveRequest> {
        self.active_request.as_ref()
    }

    /// Whether a reply is in flight
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.active_request.is_some()
    }

    /// Ask the active reply to stop
    ///
    /// Only signals the token; the controller performs the transition.
    /// Returns `false` if nothing was in flight or it was already stopping.
    pub fn request_stop(&self) -> bool {
        self.active_request
            .as_ref()
            .is_some_and(|active| active.token.cancel())
    }

    /// Reset the log to messages loaded from the backend
    ///
    /// Whatever the log held before is discarded, so this is meant for an
    /// idle session that is being (re)opened.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Busy`] while a reply is in flight.
    pub fn restore_history(&mut self, messages: Vec<Message>) -> Result<(), EngineError> {
        if self.is_busy() {
            return Err(EngineError::Busy);
        }
        tracing::debug!(count = messages.len(), chat_id = %self.chat_id, "Restoring history");
        self.log.replace_all(messages);
        Ok(())
    }

    pub(crate) fn log_mut(&mut self) -> &mut ConversationLog {
        &mut self.log
    }

    pub(crate) fn set_active(&mut self, active: ActiveRequest) {
        debug_assert!(self.active_request.is_none(), "active slot already taken");
        self.active_request = Some(active);
    }

    pub(crate) fn clear_active(&mut self, id: &MessageId) {
        if self
            .active_request
            .as_ref()
            .is_some_and(|active| &active.message_id == id)
        {
            self.active_request = None;
        }
    }
}

/// Get current timestamp in milliseconds
fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("118", "5", UserId(123_456))
    }

    #[test]
    fn test_log_append_order() {
        let mut log = ConversationLog::new();
        let first = log.push(Message::user("Hello"));
        let second = log.push(Message::placeholder());

        assert_eq!(log.len(), 2);
        assert_eq!(log.messages()[0].id, first);
        assert_eq!(log.last().map(|m| m.id.clone()), Some(second));
    }

    #[test]
    fn test_user_messages_are_immutable() {
        let mut log = ConversationLog::new();
        let id = log.push(Message::user("Hello"));

        let err = log.transition(&id, LifecycleState::Streaming).unwrap_err();
        assert!(matches!(err, EngineError::Immutable(_)));
    }

    #[test]
    fn test_transition_validated() {
        let mut log = ConversationLog::new();
        let id = log.push(Message::placeholder());

        log.transition(&id, LifecycleState::Thinking).unwrap();
        assert_eq!(log.in_flight(), 1);
        log.transition(&id, LifecycleState::Cancelled).unwrap();
        assert_eq!(log.in_flight(), 0);

        let err = log.transition(&id, LifecycleState::Streaming).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: LifecycleState::Cancelled,
                to: LifecycleState::Streaming
            }
        ));

        // Reachable, but only `transition` decides what may change
        assert_eq!(
            log.placeholder_mut(&id).unwrap().state,
            LifecycleState::Cancelled
        );
    }

    #[test]
    fn test_unknown_message() {
        let mut log = ConversationLog::new();
        let err = log.placeholder_mut(&MessageId::new()).unwrap_err();
        assert!(matches!(err, EngineError::MessageNotFound(_)));
    }

    #[test]
    fn test_request_stop_signals_token() {
        let mut session = session();
        assert!(!session.request_stop());

        let token = CancelToken::new();
        let message_id = session.log_mut().push(Message::placeholder());
        session.set_active(ActiveRequest {
            message_id: message_id.clone(),
            token: token.clone(),
        });

        assert!(session.is_busy());
        assert!(session.request_stop());
        assert!(token.is_cancelled());
        assert!(!session.request_stop());

        session.clear_active(&message_id);
        assert!(!session.is_busy());
    }

    #[test]
    fn test_restore_history_rejected_while_busy() {
        let mut session = session();
        let message_id = session.log_mut().push(Message::placeholder());
        session.set_active(ActiveRequest {
            message_id,
            token: CancelToken::new(),
        });

        let err = session
            .restore_history(vec![Message::user("old")])
            .unwrap_err();
        assert!(matches!(err, EngineError::Busy));
    }

    #[test]
    fn test_restore_history_resets_idle_log() {
        let mut session = session();
        session.log_mut().push(Message::user("stale"));

        session
            .restore_history(vec![
                Message::restored(Sender::User, "hi"),
                Message::restored(Sender::Assistant, "hello!"),
            ])
            .unwrap();

        let texts: Vec<&str> = session
            .log()
            .messages()
            .iter()
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(texts, vec!["hi", "hello!"]);
    }

    #[test]
    fn test_restored_assistant_message_is_segmented() {
        let message = Message::restored(Sender::Assistant, "a\n```\nb\n```");
        assert_eq!(message.state, LifecycleState::Finalized);
        assert_eq!(message.segments.len(), 2);
    }
}
