//! Progressive terminal output for reply updates
//!
//! Each [`ReplyUpdate`] carries the full displayed text of a placeholder.
//! The printer keeps what it has already written per message and emits only
//! the new suffix, so a terminal shows the reply growing in place.

use chatflow_core::{LifecycleState, MessageId, ReplyUpdate};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Writes reply progress to stdout
#[derive(Debug, Default)]
pub struct Printer {
    current: Option<MessageId>,
    printed: String,
}

impl Printer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume updates until the controller drops its sender
    pub async fn run(mut self, mut updates: mpsc::UnboundedReceiver<ReplyUpdate>) {
        let mut stdout = tokio::io::stdout();
        while let Some(update) = updates.recv().await {
            let out = self.apply(&update);
            if out.is_empty() {
                continue;
            }
            let written = match stdout.write_all(out.as_bytes()).await {
                Ok(()) => stdout.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                tracing::warn!(error = %e, "Failed to write reply output");
                return;
            }
        }
    }

    /// Compute what to write for `update`
    pub fn apply(&mut self, update: &ReplyUpdate) -> String {
        if self.current.as_ref() != Some(&update.message_id) {
            self.current = Some(update.message_id.clone());
            self.printed.clear();
        }

        // The thinking indicator is replaced by the reply, so it goes to stderr
        if update.state == LifecycleState::Thinking {
            eprintln!("{}", update.text);
            return String::new();
        }

        let mut out = delta(&self.printed, &update.text);
        self.printed = update.text.clone();
        if update.state.is_terminal() {
            out.push('\n');
        }
        out
    }
}

/// Text to write so the terminal goes from `printed` to `text`
///
/// Rendered text normally only grows. When it does not, the whole text is
/// rewritten on a fresh line.
pub fn delta(printed: &str, text: &str) -> String {
    match text.strip_prefix(printed) {
        Some(suffix) => suffix.to_string(),
        None => format!("\n{text}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn update(id: &MessageId, state: LifecycleState, text: &str) -> ReplyUpdate {
        ReplyUpdate {
            message_id: id.clone(),
            state,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_delta_prints_suffix() {
        assert_eq!(delta("Hel", "Hello"), "lo");
        assert_eq!(delta("", "Hi"), "Hi");
        assert_eq!(delta("abc", "xyz"), "\nxyz");
    }

    #[test]
    fn test_printer_follows_one_reply() {
        let id = MessageId::new();
        let mut printer = Printer::new();

        assert_eq!(
            printer.apply(&update(&id, LifecycleState::Thinking, "Thinking, please wait...")),
            ""
        );
        assert_eq!(
            printer.apply(&update(&id, LifecycleState::Streaming, "Hello")),
            "Hello"
        );
        assert_eq!(
            printer.apply(&update(&id, LifecycleState::Streaming, "Hello wor")),
            " wor"
        );
        assert_eq!(
            printer.apply(&update(
                &id,
                LifecycleState::Cancelled,
                "Hello wor\n\n[generation stopped]"
            )),
            "\n\n[generation stopped]\n"
        );
    }

    #[test]
    fn test_printer_resets_for_new_reply() {
        let first = MessageId::new();
        let second = MessageId::new();
        let mut printer = Printer::new();

        printer.apply(&update(&first, LifecycleState::Finalized, "one"));
        assert_eq!(
            printer.apply(&update(&second, LifecycleState::Streaming, "two")),
            "two"
        );
    }
}
