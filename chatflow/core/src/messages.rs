//! Message Vocabulary
//!
//! Identifiers, senders, the reply lifecycle state machine, and the
//! notifications the controller sends to an observing UI.
//!
//! # Lifecycle
//!
//! ```text
//! Pending ──▶ Thinking ──▶ Streaming ──▶ Finalized
//!                │  │          │  │
//!                │  └──────────┼──┴──▶ Errored
//!                └─────────────┴─────▶ Cancelled
//! ```
//!
//! `Finalized`, `Errored` and `Cancelled` are terminal. A reply that finishes
//! without a single content chunk goes straight from `Thinking` to
//! `Finalized`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Text shown in a placeholder until the first chunk arrives
pub const THINKING_INDICATOR: &str = "Thinking, please wait...";

/// Marker appended (or substituted) when the user stops a reply
pub const STOP_MARKER: &str = "[generation stopped]";

/// Build the user-visible annotation for a failed reply
#[must_use]
pub fn error_annotation(reason: &str) -> String {
    let reason = if reason.trim().is_empty() {
        "internal server error"
    } else {
        reason
    };
    format!("Sorry, something went wrong:\n{reason}")
}

/// Stable message identifier
///
/// Placeholders are located by id, never by position in the log.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new unique message ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("msg_{}", uuid::Uuid::new_v4().simple()))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who sent a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sender {
    /// User input
    User,
    /// AI assistant reply
    Assistant,
}

/// Lifecycle of a message in the conversation log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Created, not yet shown
    Pending,
    /// Shown with the waiting indicator, no content yet
    Thinking,
    /// Receiving content
    Streaming,
    /// Completed successfully (terminal)
    Finalized,
    /// Failed with a visible annotation (terminal)
    Errored,
    /// Stopped by the user (terminal)
    Cancelled,
}

impl LifecycleState {
    /// Whether no further transitions are allowed
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Errored | Self::Cancelled)
    }

    /// Whether the state machine permits `self -> next`
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use LifecycleState::{Cancelled, Errored, Finalized, Pending, Streaming, Thinking};

        matches!(
            (self, next),
            (Pending, Thinking)
                | (Thinking, Streaming | Finalized | Errored | Cancelled)
                | (Streaming, Streaming | Finalized | Errored | Cancelled)
        )
    }
}

/// Progress notification for an observing UI
///
/// Sent after every mutation of the active placeholder. `text` is the full
/// displayed text at that moment, so a surface can simply replace what it
/// shows for `message_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyUpdate {
    /// Placeholder being mutated
    pub message_id: MessageId,
    /// State after the mutation
    pub state: LifecycleState,
    /// Displayed text after the mutation
    pub text: String,
}
