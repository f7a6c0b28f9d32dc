//! Persistence Gateway
//!
//! Finished replies are saved back to the backend so the chat history
//! survives reloads. Saving is best effort: failures are logged by the
//! controller and never change the reply on screen.
//!
//! [`HttpBackend`] also restores a chat's history (`list-msg`) when a session
//! is opened.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, PersistenceError};
use crate::messages::Sender;
use crate::session::Message;

/// Save endpoint, relative to the base URL
pub const SAVE_MSG_PATH: &str = "/api/ai/save-msg";

/// History endpoint, relative to the base URL
pub const LIST_MSG_PATH: &str = "/api/ai/list-msg";

/// Stores finished assistant replies
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Save `content` as the newest message of `chat_id`
    async fn save(&self, chat_id: &str, content: &str) -> Result<(), PersistenceError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveRequest<'a> {
    chat_id: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct StoredMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(rename = "type", default)]
    kind: Value,
}

impl StoredMessage {
    /// `type == 0` marks a user message, anything else is the assistant
    fn sender(&self) -> Sender {
        let is_user = match &self.kind {
            Value::Number(n) => n.as_i64() == Some(0),
            Value::String(s) => s.trim() == "0",
            _ => false,
        };
        if is_user {
            Sender::User
        } else {
            Sender::Assistant
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryResponse {
    Bare(Vec<StoredMessage>),
    Wrapped { data: Vec<StoredMessage> },
}

/// HTTP client for the chat backend's message endpoints
#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Create a backend client for `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a backend client sharing an existing HTTP client
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Load the stored messages of a chat, oldest first
    ///
    /// Restored messages are `Finalized`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Http`] if the request fails or the body is not a
    /// message list, and [`EngineError::Status`] on a non-success status.
    pub async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, EngineError> {
        let url = format!("{}{}", self.base_url, LIST_MSG_PATH);
        let response = self
            .client
            .get(&url)
            .query(&[("chatId", chat_id)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let stored = match response.json::<HistoryResponse>().await? {
            HistoryResponse::Bare(messages) | HistoryResponse::Wrapped { data: messages } => {
                messages
            }
        };
        tracing::debug!(chat_id, count = stored.len(), "Loaded chat history");

        Ok(stored
            .into_iter()
            .map(|m| {
                let sender = m.sender();
                Message::restored(sender, m.content.unwrap_or_default())
            })
            .collect())
    }
}

#[async_trait]
impl PersistenceGateway for HttpBackend {
    async fn save(&self, chat_id: &str, content: &str) -> Result<(), PersistenceError> {
        let url = format!("{}{}", self.base_url, SAVE_MSG_PATH);
        let response = self
            .client
            .post(&url)
            .json(&SaveRequest { chat_id, content })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PersistenceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(chat_id, bytes = content.len(), "Reply saved");
        Ok(())
    }
}
