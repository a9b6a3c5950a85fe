//! Durable per-user token storage.
//!
//! One [`CredentialRecord`] exists per user identity. The store owns every
//! persisted record; callers re-read before deciding anything and never keep a
//! copy across calls.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenStore (trait)                 │
//! │  - put (upsert) / get / update           │
//! │  - conditional update on expires_at      │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!       (seal)               (open)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore (SQLite)           │
//! │  - one row per user_identity             │
//! │  - AES-256-GCM sealed token columns      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use tokenbroker::credentials::{CredentialRecord, CredentialStore, TokenStore};
//!
//! # fn main() -> anyhow::Result<()> {
//! let encryption_key = std::env::var("TOKENBROKER_ENCRYPTION_KEY")?;
//! let store = CredentialStore::new("tokens.db", &encryption_key)?;
//!
//! store.put(&CredentialRecord::new(
//!     "42",
//!     "access-token",
//!     1_700_003_600,
//!     "user-read-email",
//!     Some("refresh-token".to_string()),
//! ))?;
//!
//! let record = store.get("42")?;
//! println!("expires at {}", record.expires_at);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

mod encryption;
mod storage;

pub use encryption::TokenCipher;
pub use storage::CredentialStore;

/// Persisted access/refresh token bundle for one user identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Primary lookup key
    pub user_identity: String,

    /// Bearer token for downstream API calls
    pub access_token: String,

    /// Epoch seconds after which `access_token` must not be used
    pub expires_at: i64,

    /// Space-delimited granted permissions (informational)
    pub scope: String,

    /// Credential for minting new access tokens. `None` when the provider
    /// never issued one or it was invalidated.
    pub refresh_token: Option<String>,
}

impl CredentialRecord {
    /// Builds a record, treating an empty refresh token as absent.
    pub fn new(
        user_identity: impl Into<String>,
        access_token: impl Into<String>,
        expires_at: i64,
        scope: impl Into<String>,
        refresh_token: Option<String>,
    ) -> Self {
        Self {
            user_identity: user_identity.into(),
            access_token: access_token.into(),
            expires_at,
            scope: scope.into(),
            refresh_token: refresh_token.filter(|token| !token.is_empty()),
        }
    }

    /// Whether the record carries a usable refresh token.
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Mutable fields overwritten by a successful refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenUpdate {
    pub access_token: String,
    pub expires_at: i64,
    pub refresh_token: Option<String>,
    /// Left unchanged when `None`
    pub scope: Option<String>,
}

/// Token store errors
#[derive(Debug)]
pub enum StoreError {
    /// No record exists for the identity
    NotFound(String),
    /// Database or encryption failure
    Backend(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(user) => write!(f, "No credential stored for user '{}'", user),
            StoreError::Backend(e) => write!(f, "Token store failure: {:#}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        StoreError::Backend(e)
    }
}

/// Keyed storage for one [`CredentialRecord`] per user identity.
///
/// Every write is atomic with respect to concurrent reads of the same
/// identity: a reader sees either the old record or the new one.
pub trait TokenStore: Send + Sync {
    /// Inserts a record, replacing any existing record for the same identity.
    fn put(&self, record: &CredentialRecord) -> Result<(), StoreError>;

    /// Reads the record for `user_identity`.
    fn get(&self, user_identity: &str) -> Result<CredentialRecord, StoreError>;

    /// Overwrites the mutable fields of an existing record.
    fn update(&self, user_identity: &str, update: &TokenUpdate) -> Result<(), StoreError>;

    /// Like [`TokenStore::update`], but only applies when the stored
    /// `expires_at` still equals `expected_expires_at`.
    ///
    /// Returns `Ok(false)` when another writer got there first.
    fn update_if_current(
        &self,
        user_identity: &str,
        expected_expires_at: i64,
        update: &TokenUpdate,
    ) -> Result<bool, StoreError>;

    /// Drops the refresh token if `expires_at` still equals
    /// `expected_expires_at`, leaving every other field untouched.
    fn clear_refresh_token(
        &self,
        user_identity: &str,
        expected_expires_at: i64,
    ) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_refresh_token_is_absent() {
        let record = CredentialRecord::new("1", "access", 10, "scope", Some(String::new()));
        assert_eq!(record.refresh_token, None);
        assert!(!record.has_refresh_token());

        let record = CredentialRecord::new("1", "access", 10, "scope", Some("r".to_string()));
        assert!(record.has_refresh_token());
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound("42".to_string());
        assert_eq!(err.to_string(), "No credential stored for user '42'");
    }
}
