//! Stable Anonymous Identifier
//!
//! Each installation gets a small numeric user id, generated once and reused
//! on every later run. The backend uses it to route push-channel events to
//! the right client.
//!
//! # Derivation
//!
//! ```text
//! uuid v4 ──▶ first 6 hex chars ──▶ integer (base 16) ──▶ mod 1_000_000
//! ```
//!
//! The value is persisted as a decimal string through an [`IdentityStore`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound (exclusive) of generated identifiers
pub const USER_ID_MODULUS: u32 = 1_000_000;

/// Anonymous per-install user identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u32);

impl UserId {
    /// Generate a fresh identifier from a random UUID
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().to_string();
        // A v4 UUID always starts with six hex digits
        Self(fold_identifier(&uuid).unwrap_or_default())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Fold a UUID string into a six-digit identifier
///
/// Returns `None` if the first six characters are not hex digits.
#[must_use]
pub fn fold_identifier(uuid: &str) -> Option<u32> {
    let prefix = uuid.get(..6)?;
    let value = u32::from_str_radix(prefix, 16).ok()?;
    Some(value % USER_ID_MODULUS)
}

/// Identity persistence errors
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Reading or writing the identity file failed
    #[error("identity store at {path} failed: {source}")]
    Io {
        /// Path of the identity file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// No data directory is known for this platform
    #[error("no data directory available for the identity file")]
    NoDataDir,
}

/// Persistence for the identifier's decimal string
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Read the stored value, `None` if nothing was stored yet
    async fn load(&self) -> Result<Option<String>, IdentityError>;

    /// Persist a value
    async fn save(&self, value: &str) -> Result<(), IdentityError>;
}

/// Load the stored identifier, creating and persisting one on first use
///
/// A stored value that does not parse is replaced with a fresh one.
///
/// # Errors
///
/// Returns an error if the store cannot be read or written.
pub async fn load_or_create(store: &dyn IdentityStore) -> Result<UserId, IdentityError> {
    if let Some(stored) = store.load().await? {
        match stored.parse::<UserId>() {
            Ok(id) if id.0 < USER_ID_MODULUS => {
                tracing::debug!(user_id = %id, "Loaded user id");
                return Ok(id);
            }
            _ => tracing::warn!(stored = %stored, "Stored user id is invalid, regenerating"),
        }
    }

    let id = UserId::generate();
    store.save(&id.to_string()).await?;
    tracing::info!(user_id = %id, "Generated new user id");
    Ok(id)
}

// ============================================================================
// Stores
// ============================================================================

/// File-backed store (`$XDG_DATA_HOME/chatflow/user_id` by default)
#[derive(Clone, Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    /// Store at an explicit path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the platform default location
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NoDataDir`] if the platform has no data dir.
    pub fn default_location() -> Result<Self, IdentityError> {
        default_identity_path()
            .map(Self::new)
            .ok_or(IdentityError::NoDataDir)
    }

    /// Path of the identity file
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> IdentityError {
        IdentityError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn load(&self) -> Result<Option<String>, IdentityError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn save(&self, value: &str) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        tokio::fs::write(&self.path, value)
            .await
            .map_err(|e| self.io_error(e))
    }
}

/// In-memory store
#[derive(Clone, Debug, Default)]
pub struct MemoryIdentityStore {
    value: Arc<Mutex<Option<String>>>,
}

impl MemoryIdentityStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `value`
    pub fn with_value(value: impl Into<String>) -> Self {
        Self {
            value: Arc::new(Mutex::new(Some(value.into()))),
        }
    }

    /// Current stored value
    #[must_use]
    pub fn value(&self) -> Option<String> {
        self.value.lock().clone()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn load(&self) -> Result<Option<String>, IdentityError> {
        Ok(self.value.lock().clone())
    }

    async fn save(&self, value: &str) -> Result<(), IdentityError> {
        *self.value.lock() = Some(value.to_string());
        Ok(())
    }
}

/// Default identity file path
#[must_use]
pub fn default_identity_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("chatflow").join("user_id"))
}
