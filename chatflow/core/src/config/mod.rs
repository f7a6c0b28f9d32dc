//! TOML Configuration File Support
//!
//! Centralized configuration for chatflow clients, loaded from
//! `~/.config/chatflow/client.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`CHATFLOW_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/chatflow/client.toml` (typically `~/.config/chatflow/client.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! base_url = "http://localhost:8080"
//! project_id = "118"
//! chat_id = "5"
//!
//! [stream]
//! transport = "push"
//! framing = "raw"
//! open_timeout_ms = 15000
//! reconnect_delay_ms = 1000
//! max_reconnects = 3
//! peek_limit_bytes = 4096
//!
//! [chat]
//! language = "en"
//! reveal_delay_ms = 30
//! busy_policy = "reject"
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::{BusyPolicy, ControllerConfig};
use crate::transport::chunked::DEFAULT_PEEK_LIMIT;
use crate::transport::push::DEFAULT_OPEN_TIMEOUT;
use crate::transport::ChunkFraming;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Transport Selection
// =============================================================================

/// Which reply-stream protocol to use
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Chunked HTTP body
    #[default]
    Chunked,
    /// SSE push channel
    Push,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chunked" | "stream" => Ok(Self::Chunked),
            "push" | "sse" => Ok(Self::Push),
            other => Err(ConfigError::ValidationError(format!(
                "unknown transport '{other}' (expected 'chunked' or 'push')"
            ))),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chunked => write!(f, "chunked"),
            Self::Push => write!(f, "push"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Backend base URL
    pub base_url: Option<String>,

    /// Default project
    pub project_id: Option<String>,

    /// Default chat
    pub chat_id: Option<String>,
}

/// Stream section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    /// Reply-stream protocol
    pub transport: Option<TransportKind>,

    /// Body framing for the chunked transport
    pub framing: Option<ChunkFraming>,

    /// Push channel open deadline in milliseconds
    pub open_timeout_ms: Option<u64>,

    /// Delay between push channel reconnects in milliseconds
    pub reconnect_delay_ms: Option<u64>,

    /// Reconnects allowed per reply
    pub max_reconnects: Option<usize>,

    /// Error-envelope peek limit in bytes
    pub peek_limit_bytes: Option<usize>,
}

/// Chat section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatToml {
    /// Reply language hint
    pub language: Option<String>,

    /// Typewriter pacing per chunk in milliseconds
    pub reveal_delay_ms: Option<u64>,

    /// Behavior for a message sent while a reply is in flight
    pub busy_policy: Option<BusyPolicy>,

    /// Path of the anonymous identity file
    pub identity_path: Option<PathBuf>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatflowToml {
    /// Server configuration section
    pub server: ServerToml,

    /// Stream configuration section
    pub stream: StreamToml,

    /// Chat configuration section
    pub chat: ChatToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved client configuration
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Backend base URL
    pub base_url: String,

    /// Default project
    pub project_id: Option<String>,

    /// Default chat
    pub chat_id: Option<String>,

    /// Reply-stream protocol
    pub transport: TransportKind,

    /// Body framing for the chunked transport
    pub framing: ChunkFraming,

    /// Push channel open deadline
    pub open_timeout: Duration,

    /// Delay between push channel reconnects
    pub reconnect_delay: Duration,

    /// Reconnects allowed per reply
    pub max_reconnects: usize,

    /// Error-envelope peek limit in bytes
    pub peek_limit: usize,

    /// Reply language hint
    pub language: String,

    /// Typewriter pacing per chunk
    pub reveal_delay: Duration,

    /// Behavior for a message sent while a reply is in flight
    pub busy_policy: BusyPolicy,

    /// Identity file override (platform data dir when `None`)
    pub identity_path: Option<PathBuf>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            project_id: None,
            chat_id: None,
            transport: TransportKind::Chunked,
            framing: ChunkFraming::Raw,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            reconnect_delay: Duration::from_secs(1),
            max_reconnects: 3,
            peek_limit: DEFAULT_PEEK_LIMIT,
            language: "en".to_string(),
            reveal_delay: Duration::ZERO,
            busy_policy: BusyPolicy::Reject,
            identity_path: None,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Settings for a [`crate::ReplyController`]
    #[must_use]
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            busy_policy: self.busy_policy,
            reveal_delay: self.reveal_delay,
            language: self.language.clone(),
        }
    }

    /// Check values that cannot be expressed by the types alone
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "base_url must start with http:// or https://, got '{}'",
                self.base_url
            )));
        }
        if self.open_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "open_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.peek_limit == 0 {
            return Err(ConfigError::ValidationError(
                "peek_limit_bytes must be greater than 0".to_string(),
            ));
        }
        if self.language.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "language must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chatflow/client.toml` or
/// `~/.config/chatflow/client.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chatflow").join("client.toml"))
}

/// Load configuration from all sources with proper priority
///
/// CLI overrides are not handled here; callers apply [`ConfigOverrides`]
/// afterwards and then call [`ClientConfig::validate`].
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ChatflowToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ClientConfig, toml: &ChatflowToml) {
    // Server settings
    if let Some(url) = &toml.server.base_url {
        config.base_url = url.clone();
    }
    if toml.server.project_id.is_some() {
        config.project_id = toml.server.project_id.clone();
    }
    if toml.server.chat_id.is_some() {
        config.chat_id = toml.server.chat_id.clone();
    }

    // Stream settings
    if let Some(transport) = toml.stream.transport {
        config.transport = transport;
    }
    if let Some(framing) = toml.stream.framing {
        config.framing = framing;
    }
    if let Some(ms) = toml.stream.open_timeout_ms {
        config.open_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.stream.reconnect_delay_ms {
        config.reconnect_delay = Duration::from_millis(ms);
    }
    if let Some(n) = toml.stream.max_reconnects {
        config.max_reconnects = n;
    }
    if let Some(bytes) = toml.stream.peek_limit_bytes {
        config.peek_limit = bytes;
    }

    // Chat settings
    if let Some(language) = &toml.chat.language {
        config.language = language.clone();
    }
    if let Some(ms) = toml.chat.reveal_delay_ms {
        config.reveal_delay = Duration::from_millis(ms);
    }
    if let Some(policy) = toml.chat.busy_policy {
        config.busy_policy = policy;
    }
    if toml.chat.identity_path.is_some() {
        config.identity_path = toml.chat.identity_path.clone();
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut ClientConfig) {
    apply_env_with(config, |key| std::env::var(key).ok());
}

/// Apply overrides from an environment lookup
fn apply_env_with(config: &mut ClientConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup("CHATFLOW_BASE_URL") {
        config.base_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(project) = lookup("CHATFLOW_PROJECT_ID") {
        config.project_id = Some(project);
        config.source = ConfigSource::Env;
    }
    if let Some(chat) = lookup("CHATFLOW_CHAT_ID") {
        config.chat_id = Some(chat);
        config.source = ConfigSource::Env;
    }
    if let Some(transport) = lookup("CHATFLOW_TRANSPORT") {
        match transport.parse::<TransportKind>() {
            Ok(kind) => {
                config.transport = kind;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring CHATFLOW_TRANSPORT"),
        }
    }
    if let Some(timeout) = lookup("CHATFLOW_OPEN_TIMEOUT_MS") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.open_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(language) = lookup("CHATFLOW_LANGUAGE") {
        config.language = language;
        config.source = ConfigSource::Env;
    }
    if let Some(delay) = lookup("CHATFLOW_REVEAL_DELAY_MS") {
        if let Ok(ms) = delay.parse::<u64>() {
            config.reveal_delay = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(policy) = lookup("CHATFLOW_BUSY_POLICY") {
        match policy.trim() {
            "reject" => config.busy_policy = BusyPolicy::Reject,
            "cancel-active" => config.busy_policy = BusyPolicy::CancelActive,
            other => {
                tracing::warn!(value = other, "Ignoring unknown CHATFLOW_BUSY_POLICY");
                return;
            }
        }
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// CLI argument overrides for configuration
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Base URL override
    pub base_url: Option<String>,

    /// Transport override
    pub transport: Option<TransportKind>,

    /// Project override
    pub project_id: Option<String>,

    /// Chat override
    pub chat_id: Option<String>,

    /// Reveal delay override in milliseconds
    pub reveal_delay_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base URL override
    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Set transport override
    #[must_use]
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set project override
    #[must_use]
    pub fn with_project_id(mut self, project_id: String) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Set chat override
    #[must_use]
    pub fn with_chat_id(mut self, chat_id: String) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    /// Set reveal delay override
    #[must_use]
    pub fn with_reveal_delay_ms(mut self, ms: u64) -> Self {
        self.reveal_delay_ms = Some(ms);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ClientConfig) {
        if self.base_url.is_some()
            || self.transport.is_some()
            || self.project_id.is_some()
            || self.chat_id.is_some()
            || self.reveal_delay_ms.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if self.project_id.is_some() {
            config.project_id = self.project_id.clone();
        }
        if self.chat_id.is_some() {
            config.chat_id = self.chat_id.clone();
        }
        if let Some(ms) = self.reveal_delay_ms {
            config.reveal_delay = Duration::from_millis(ms);
        }
    }
}
