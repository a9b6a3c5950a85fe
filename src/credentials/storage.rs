//! SQLite-backed token store.
//!
//! Stores one credential row per user identity. Token columns are sealed with
//! AES-256-GCM; `expires_at` stays a plain integer so conditional updates can
//! compare against it.

use super::{CredentialRecord, StoreError, TokenCipher, TokenStore, TokenUpdate};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// How long a writer waits on a locked database file before failing
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Encrypted token storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE tokens (
///     user_identity TEXT PRIMARY KEY,
///     access_token  TEXT NOT NULL,     -- Sealed
///     expires_at    INTEGER NOT NULL,  -- Epoch seconds
///     scope         TEXT NOT NULL,
///     refresh_token TEXT               -- Sealed (optional)
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex, so each statement runs alone
/// - Every mutation is a single statement, so readers never see a torn row
pub struct CredentialStore {
    conn: Mutex<Connection>,
    cipher: TokenCipher,
}

impl CredentialStore {
    /// Creates or opens a token store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`:memory:` for tests)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let cipher =
            TokenCipher::from_base64_key(encryption_key).context("Invalid encryption key")?;

        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open token DB at {}", db_path.display()))?;

        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("Failed to set journal mode")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                user_identity TEXT PRIMARY KEY,
                access_token  TEXT NOT NULL,
                expires_at    INTEGER NOT NULL,
                scope         TEXT NOT NULL DEFAULT '',
                refresh_token TEXT
            );
            "#,
        )
        .context("Failed to create tokens table")?;

        tracing::debug!(journal_mode = %journal_mode, "Token store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Token store connection mutex poisoned"))
    }

    fn seal_optional(&self, token: Option<&str>) -> Result<Option<String>> {
        token
            .filter(|t| !t.is_empty())
            .map(|t| self.cipher.seal(t).context("Failed to encrypt refresh token"))
            .transpose()
    }

    fn exists(conn: &Connection, user_identity: &str) -> Result<bool> {
        let found = conn
            .query_row(
                "SELECT 1 FROM tokens WHERE user_identity = ?1",
                params![user_identity],
                |_| Ok(()),
            )
            .optional()
            .context("Failed to look up token row")?;
        Ok(found.is_some())
    }
}

impl TokenStore for CredentialStore {
    /// Upserts: re-authorization for a known identity replaces the whole row.
    fn put(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let access_token = self
            .cipher
            .seal(&record.access_token)
            .context("Failed to encrypt access token")?;
        let refresh_token = self.seal_optional(record.refresh_token.as_deref())?;

        self.conn()?
            .execute(
                r#"
                INSERT INTO tokens (user_identity, access_token, expires_at, scope, refresh_token)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(user_identity) DO UPDATE SET
                    access_token = excluded.access_token,
                    expires_at = excluded.expires_at,
                    scope = excluded.scope,
                    refresh_token = excluded.refresh_token
                "#,
                params![
                    record.user_identity,
                    access_token,
                    record.expires_at,
                    record.scope,
                    refresh_token,
                ],
            )
            .context("Failed to store credentials")?;

        Ok(())
    }

    fn get(&self, user_identity: &str) -> Result<CredentialRecord, StoreError> {
        let row = self
            .conn()?
            .query_row(
                r#"
                SELECT access_token, expires_at, scope, refresh_token
                FROM tokens
                WHERE user_identity = ?1
                "#,
                params![user_identity],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to read credentials")?;

        let Some((access_token, expires_at, scope, refresh_token)) = row else {
            return Err(StoreError::NotFound(user_identity.to_string()));
        };

        let access_token = self
            .cipher
            .open(&access_token)
            .context("Failed to decrypt access token")?;
        let refresh_token = refresh_token
            .map(|sealed| self.cipher.open(&sealed))
            .transpose()
            .context("Failed to decrypt refresh token")?;

        Ok(CredentialRecord::new(
            user_identity,
            access_token,
            expires_at,
            scope,
            refresh_token,
        ))
    }

    fn update(&self, user_identity: &str, update: &TokenUpdate) -> Result<(), StoreError> {
        let access_token = self
            .cipher
            .seal(&update.access_token)
            .context("Failed to encrypt access token")?;
        let refresh_token = self.seal_optional(update.refresh_token.as_deref())?;

        let changed = self
            .conn()?
            .execute(
                r#"
                UPDATE tokens
                SET access_token = ?1, expires_at = ?2, refresh_token = ?3,
                    scope = COALESCE(?4, scope)
                WHERE user_identity = ?5
                "#,
                params![
                    access_token,
                    update.expires_at,
                    refresh_token,
                    update.scope,
                    user_identity,
                ],
            )
            .context("Failed to update credentials")?;

        if changed == 0 {
            return Err(StoreError::NotFound(user_identity.to_string()));
        }
        Ok(())
    }

    fn update_if_current(
        &self,
        user_identity: &str,
        expected_expires_at: i64,
        update: &TokenUpdate,
    ) -> Result<bool, StoreError> {
        let access_token = self
            .cipher
            .seal(&update.access_token)
            .context("Failed to encrypt access token")?;
        let refresh_token = self.seal_optional(update.refresh_token.as_deref())?;

        let conn = self.conn()?;
        let changed = conn
            .execute(
                r#"
                UPDATE tokens
                SET access_token = ?1, expires_at = ?2, refresh_token = ?3,
                    scope = COALESCE(?4, scope)
                WHERE user_identity = ?5 AND expires_at = ?6
                "#,
                params![
                    access_token,
                    update.expires_at,
                    refresh_token,
                    update.scope,
                    user_identity,
                    expected_expires_at,
                ],
            )
            .context("Failed to update credentials")?;

        if changed > 0 {
            return Ok(true);
        }
        if !Self::exists(&conn, user_identity)? {
            return Err(StoreError::NotFound(user_identity.to_string()));
        }
        Ok(false)
    }

    fn clear_refresh_token(
        &self,
        user_identity: &str,
        expected_expires_at: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE tokens SET refresh_token = NULL WHERE user_identity = ?1 AND expires_at = ?2",
                params![user_identity, expected_expires_at],
            )
            .context("Failed to clear refresh token")?;

        if changed > 0 {
            return Ok(true);
        }
        if !Self::exists(&conn, user_identity)? {
            return Err(StoreError::NotFound(user_identity.to_string()));
        }
        Ok(false)
    }
}
