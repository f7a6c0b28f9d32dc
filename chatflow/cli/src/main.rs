//! Chatflow CLI - Terminal Client for the Streaming Reply Engine
//!
//! Sends messages to a chat backend and prints each reply as it streams in.
//!
//! # Usage
//!
//! ```bash
//! # One message, defaults from ~/.config/chatflow/client.toml
//! chatflow "Explain ownership in Rust"
//!
//! # Explicit backend and chat, SSE push transport
//! chatflow --base-url https://chat.example.com --transport push \
//!     --project-id 118 --chat-id 5 "hello"
//!
//! # Read one message per line from stdin, after showing prior history
//! chatflow --history < questions.txt
//!
//! # Code blocks as <pre><code> markup
//! chatflow --html "show me a bash loop"
//!
//! # Verbose logging
//! RUST_LOG=debug chatflow "hi"
//! ```
//!
//! # Signals
//!
//! - `SIGINT` while a reply streams: stop that reply
//! - `SIGINT` otherwise: exit

mod printer;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use chatflow_core::config::{load_config_from_path, ClientConfig, ConfigOverrides};
use chatflow_core::identity::{self, FileIdentityStore};
use chatflow_core::transport::create_transport;
use chatflow_core::{
    CancelToken, HtmlRenderer, HttpBackend, LifecycleState, ReplyController, Sender, Session,
    TransportKind,
};

use printer::Printer;

/// Chatflow - stream AI chat replies in the terminal
#[derive(Parser, Debug)]
#[command(name = "chatflow")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "CHATFLOW_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend base URL
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// Reply transport (chunked, push)
    #[arg(short = 't', long, value_name = "KIND")]
    transport: Option<TransportKind>,

    /// Project identifier
    #[arg(long, value_name = "ID")]
    project_id: Option<String>,

    /// Chat identifier
    #[arg(long, value_name = "ID")]
    chat_id: Option<String>,

    /// Per-chunk reveal delay in milliseconds
    #[arg(long, value_name = "MS")]
    reveal_delay_ms: Option<u64>,

    /// Load and print the chat history before sending
    #[arg(long)]
    history: bool,

    /// Render code blocks as HTML instead of markdown fences
    #[arg(long)]
    html: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "CHATFLOW_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Message to send (reads one message per stdin line when omitted)
    message: Vec<String>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(url) = &self.base_url {
            overrides = overrides.with_base_url(url.clone());
        }
        if let Some(transport) = self.transport {
            overrides = overrides.with_transport(transport);
        }
        if let Some(project_id) = &self.project_id {
            overrides = overrides.with_project_id(project_id.clone());
        }
        if let Some(chat_id) = &self.chat_id {
            overrides = overrides.with_chat_id(chat_id.clone());
        }
        if let Some(ms) = self.reveal_delay_ms {
            overrides = overrides.with_reveal_delay_ms(ms);
        }
        overrides
    }
}

/// Initialize logging on stderr so stdout carries only reply text
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("chatflow={level},chatflow_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(args: &Args) -> Result<ClientConfig> {
    let mut config =
        load_config_from_path(args.config.clone()).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = %config.source(),
        base_url = %config.base_url,
        transport = %config.transport,
        "Configuration resolved"
    );
    Ok(config)
}

async fn resolve_session(config: &ClientConfig) -> Result<Session> {
    let store = match &config.identity_path {
        Some(path) => FileIdentityStore::new(path),
        None => FileIdentityStore::default_location()?,
    };
    let user_id = identity::load_or_create(&store)
        .await
        .with_context(|| format!("Failed to resolve identity at {}", store.path().display()))?;

    let project_id = config
        .project_id
        .clone()
        .context("No project configured (use --project-id or server.project_id)")?;
    let chat_id = config
        .chat_id
        .clone()
        .context("No chat configured (use --chat-id or server.chat_id)")?;

    Ok(Session::new(project_id, chat_id, user_id))
}

fn print_history(session: &Session) {
    for message in session.log().messages() {
        match message.sender {
            Sender::User => println!("> {}", message.text),
            Sender::Assistant => println!("{}\n", message.text),
        }
    }
}

/// Stop the streaming reply on Ctrl-C, or exit when none is active
fn spawn_interrupt_handler(active: watch::Receiver<Option<CancelToken>>) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            match active.borrow().clone() {
                Some(token) if !token.is_cancelled() => {
                    info!("Stop requested");
                    token.cancel();
                }
                _ => std::process::exit(130),
            }
        }
    });
}

/// Send one message and wait for its reply to settle
///
/// Returns whether the reply ended without an error.
async fn send_one(
    controller: &ReplyController,
    session: &mut Session,
    active: &watch::Sender<Option<CancelToken>>,
    text: &str,
) -> Result<bool> {
    let reply = controller.submit(session, text).await?;
    active.send_replace(Some(reply.token().clone()));
    let outcome = controller.drive(session, reply).await;
    active.send_replace(None);
    let outcome = outcome?;

    // Failures are logged by the controller; only wait so the save lands
    if let Some(handle) = outcome.persistence {
        if let Err(e) = handle.await {
            warn!(error = %e, "Persistence task did not complete");
        }
    }
    Ok(outcome.state != LifecycleState::Errored)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = resolve_config(&args)?;
    let mut session = resolve_session(&config).await?;

    let client = reqwest::Client::new();
    let backend = Arc::new(HttpBackend::with_client(client.clone(), &config.base_url));

    if args.history {
        let history = backend
            .list_messages(&session.chat_id)
            .await
            .context("Failed to load chat history")?;
        session.restore_history(history)?;
        print_history(&session);
    }

    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(Printer::new().run(updates_rx));
    let mut controller = ReplyController::new(create_transport(&config, client), backend)
        .with_config(config.controller_config())
        .with_updates(updates_tx);
    if args.html {
        controller = controller.with_renderer(Arc::new(HtmlRenderer));
    }

    let (active_tx, active_rx) = watch::channel(None);
    spawn_interrupt_handler(active_rx);

    let mut all_ok = true;
    if args.message.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            all_ok &= send_one(&controller, &mut session, &active_tx, line).await?;
        }
    } else {
        let message = args.message.join(" ");
        all_ok &= send_one(&controller, &mut session, &active_tx, &message).await?;
    }

    // Dropping the controller closes the update channel
    drop(controller);
    if let Err(e) = printer.await {
        warn!(error = %e, "Printer task failed");
    }

    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
