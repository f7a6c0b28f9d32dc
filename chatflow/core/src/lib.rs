//! Chatflow Core - Streaming Reply Engine for an AI Chat Client
//!
//! This crate turns an incrementally delivered assistant reply into a live,
//! structured conversation log. It is independent of any UI: a terminal
//! client, a web view or a test harness observe the same state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Surface (CLI, UI)                     │
//! │        submit / stop            ▲ ReplyUpdate (progress)     │
//! └──────────────┬──────────────────┼────────────────────────────┘
//!                │                  │
//! ┌──────────────┼──────────────────┼────────────────────────────┐
//! │              ▼   CHATFLOW CORE  │                            │
//! │  ┌──────────────────────────────┴─────────┐  ┌────────────┐  │
//! │  │          ReplyController               │──│  Session   │  │
//! │  │  lifecycle ─ Segmenter ─ Renderer      │  │  + Log     │  │
//! │  └───────┬──────────────────────┬─────────┘  └────────────┘  │
//! │          │ StreamEvent          │ save                        │
//! │  ┌───────┴────────────┐  ┌──────┴───────────┐                 │
//! │  │ TransportAdapter   │  │ PersistenceGateway│                │
//! │  │ chunked │ push     │  │ (HttpBackend)     │                │
//! │  └────────────────────┘  └───────────────────┘                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ReplyController`]: drives a placeholder through its lifecycle
//! - [`Session`]: conversation identity plus the append-only [`ConversationLog`]
//! - [`TransportAdapter`]: chunked HTTP or SSE push, normalized to [`StreamEvent`]s
//! - [`Segmenter`]: incremental prose / fenced-code partitioning
//! - [`CancelToken`]: cooperative cancellation shared by every await point
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use chatflow_core::{
//!     config::load_config, identity, transport::create_transport,
//!     HttpBackend, ReplyController, Session,
//! };
//!
//! let config = load_config()?;
//! let user_id = identity::load_or_create(&identity::FileIdentityStore::default_location()?).await?;
//! let client = reqwest::Client::new();
//!
//! let controller = ReplyController::new(
//!     create_transport(&config, client.clone()),
//!     Arc::new(HttpBackend::with_client(client, &config.base_url)),
//! )
//! .with_config(config.controller_config());
//!
//! let mut session = Session::new("118", "5", user_id);
//! let outcome = controller.send(&mut session, "Explain ownership").await?;
//! println!("{}", outcome.text);
//! ```

#![deny(missing_docs)]

pub mod cancel;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod messages;
pub mod persistence;
pub mod render;
pub mod segmenter;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use cancel::CancelToken;
pub use config::{ClientConfig, ConfigError, ConfigOverrides, ConfigSource, TransportKind};
pub use controller::{ActiveReply, BusyPolicy, ControllerConfig, ReplyController, ReplyOutcome};
pub use error::{EngineError, PersistenceError, StreamFailure};
pub use identity::{IdentityError, IdentityStore, UserId};
pub use messages::{LifecycleState, MessageId, ReplyUpdate, Sender};
pub use persistence::{HttpBackend, PersistenceGateway};
pub use render::{FencedRenderer, HtmlRenderer, Renderer};
pub use segmenter::{Segment, SegmentKind, SegmentUpdate, Segmenter};
pub use session::{ConversationLog, Message, Session};
pub use transport::{EventStream, StreamEvent, StreamRequest, TransportAdapter};
