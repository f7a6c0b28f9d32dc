//! Transport Factory
//!
//! Builds the configured transport adapter. All adapters share one HTTP
//! client so connection pooling spans the send, push and persistence paths.

use std::sync::Arc;

use super::{ChunkedTransport, PushTransport, TransportAdapter};
use crate::config::{ClientConfig, TransportKind};

/// Create the transport adapter selected by `config`
///
/// # Example
///
/// ```ignore
/// let config = load_config()?;
/// let client = reqwest::Client::new();
/// let transport = create_transport(&config, client.clone());
/// let controller = ReplyController::new(transport, Arc::new(HttpBackend::with_client(client, &config.base_url)));
/// ```
#[must_use]
pub fn create_transport(
    config: &ClientConfig,
    client: reqwest::Client,
) -> Arc<dyn TransportAdapter> {
    match config.transport {
        TransportKind::Chunked => Arc::new(
            ChunkedTransport::with_client(client, &config.base_url)
                .with_framing(config.framing)
                .with_peek_limit(config.peek_limit),
        ),
        TransportKind::Push => Arc::new(
            PushTransport::with_client(client, &config.base_url)
                .with_open_timeout(config.open_timeout)
                .with_reconnect(config.reconnect_delay, config.max_reconnects),
        ),
    }
}
