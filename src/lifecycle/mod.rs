//! Token lifecycle state machine.
//!
//! A user's credential moves through
//!
//! ```text
//!   ABSENT ──complete_authorization──▶ ACTIVE ──(clock)──▶ STALE ──refresh──▶ ACTIVE
//!                                        │                   │
//!                                        └──(clock, no rt)──▶ DEAD ◀── refresh token rejected
//! ```
//!
//! States are never stored. [`TokenState::of`] derives them from the
//! persisted record and the current time, and the manager re-reads the record
//! on every call, so there is no cache that could mask a refresh or revocation
//! performed by another process.
//!
//! Refreshes are serialized per identity: the read → decide → exchange →
//! write sequence runs under an identity lock, and the final write is
//! conditional on `expires_at` still matching the value that was read.

mod clock;
mod locks;


pub use clock::{Clock, ManualClock, SystemClock};

use crate::credentials::{CredentialRecord, StoreError, TokenStore, TokenUpdate};
use crate::oauth::{ExchangeClient, ExchangeError, ProviderTokenResponse};
use locks::IdentityLocks;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default upper bound on a single provider exchange
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Derived state of one user's credential
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    /// No record stored
    Absent,
    /// `now < expires_at`
    Active,
    /// Expired, refresh token available
    Stale,
    /// Expired, no refresh token: needs full re-authorization
    Dead,
}

impl TokenState {
    /// Pure function of (`record`, `now`).
    pub fn of(record: &CredentialRecord, now: i64) -> Self {
        if now < record.expires_at {
            TokenState::Active
        } else if record.has_refresh_token() {
            TokenState::Stale
        } else {
            TokenState::Dead
        }
    }
}

/// Lifecycle failures, scoped to one user identity
#[derive(Debug)]
pub enum LifecycleError {
    /// No record for the identity; authorization must run first
    NoCredential(String),
    /// Record is dead; the external authorization flow must be restarted
    ReauthorizationRequired(String),
    /// Refresh failed for a transient reason; the stored record is untouched
    RefreshTransientFailure(String),
    /// Provider exchange failed
    Exchange(ExchangeError),
    /// Token store failure
    Store(StoreError),
}

impl LifecycleError {
    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        match self {
            LifecycleError::RefreshTransientFailure(_) => true,
            LifecycleError::Exchange(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::NoCredential(user) => {
                write!(f, "No access token available for user '{}'", user)
            }
            LifecycleError::ReauthorizationRequired(user) => {
                write!(f, "Reauthorization required for user '{}'", user)
            }
            LifecycleError::RefreshTransientFailure(msg) => {
                write!(f, "Token refresh temporarily unavailable: {}", msg)
            }
            LifecycleError::Exchange(e) => write!(f, "{}", e),
            LifecycleError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(user) => LifecycleError::NoCredential(user),
            other => LifecycleError::Store(other),
        }
    }
}

impl From<ExchangeError> for LifecycleError {
    fn from(e: ExchangeError) -> Self {
        LifecycleError::Exchange(e)
    }
}

/// Drives the per-user token state machine.
///
/// Holds no token data between calls: the [`TokenStore`] is the single source
/// of truth.
pub struct TokenLifecycleManager {
    store: Arc<dyn TokenStore>,
    exchange: Arc<dyn ExchangeClient>,
    clock: Arc<dyn Clock>,
    locks: IdentityLocks,
    exchange_timeout: Duration,
}

impl TokenLifecycleManager {
    pub fn new(store: Arc<dyn TokenStore>, exchange: Arc<dyn ExchangeClient>) -> Self {
        Self {
            store,
            exchange,
            clock: Arc::new(SystemClock),
            locks: IdentityLocks::new(),
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Exchange an authorization code and persist the resulting record.
    ///
    /// Re-authorization always wins: an existing record for the identity is
    /// replaced whatever its state. Exchange errors propagate unchanged and
    /// leave the store untouched.
    pub async fn complete_authorization(
        &self,
        code: &str,
        user_identity: &str,
    ) -> Result<CredentialRecord, LifecycleError> {
        let response = self
            .bounded(self.exchange.exchange_code(code))
            .await
            .inspect_err(|e| {
                warn!(user_id = %user_identity, error = %e, "Authorization code exchange failed")
            })?;

        let issued_at = self.clock.now();
        let record = CredentialRecord::new(
            user_identity,
            response.access_token,
            expires_at(issued_at, response.expires_in),
            response.scope,
            response.refresh_token,
        );

        let _guard = self.locks.acquire(user_identity).await;
        self.store.put(&record)?;

        info!(
            user_id = %user_identity,
            expires_at = record.expires_at,
            has_refresh_token = record.has_refresh_token(),
            "Authorization completed"
        );

        Ok(record)
    }

    /// Return a usable access token for `user_identity`, refreshing if stale.
    pub async fn get_valid_token(&self, user_identity: &str) -> Result<String, LifecycleError> {
        self.get_valid_credential(user_identity)
            .await
            .map(|record| record.access_token)
    }

    /// Like [`TokenLifecycleManager::get_valid_token`], returning the whole
    /// (possibly refreshed) record.
    pub async fn get_valid_credential(
        &self,
        user_identity: &str,
    ) -> Result<CredentialRecord, LifecycleError> {
        let record = self.store.get(user_identity)?;

        match TokenState::of(&record, self.clock.now()) {
            TokenState::Active => Ok(record),
            TokenState::Dead => {
                debug!(user_id = %user_identity, "Token expired with no refresh token");
                Err(LifecycleError::ReauthorizationRequired(
                    user_identity.to_string(),
                ))
            }
            TokenState::Stale => {
                info!(user_id = %user_identity, "Access token expired, running refresh flow");
                self.refresh(user_identity, false).await
            }
            TokenState::Absent => Err(LifecycleError::NoCredential(user_identity.to_string())),
        }
    }

    /// Run the refresh exchange even if the current token is still active.
    pub async fn force_refresh(
        &self,
        user_identity: &str,
    ) -> Result<CredentialRecord, LifecycleError> {
        self.refresh(user_identity, true).await
    }

    /// Derived state for `user_identity`, without side effects.
    pub fn token_state(&self, user_identity: &str) -> Result<TokenState, LifecycleError> {
        match self.store.get(user_identity) {
            Ok(record) => Ok(TokenState::of(&record, self.clock.now())),
            Err(StoreError::NotFound(_)) => Ok(TokenState::Absent),
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh sub-protocol. Runs entirely under the identity lock.
    async fn refresh(
        &self,
        user_identity: &str,
        force: bool,
    ) -> Result<CredentialRecord, LifecycleError> {
        let _guard = self.locks.acquire(user_identity).await;

        // Re-read: a concurrent caller may have refreshed while we waited.
        let record = self.store.get(user_identity)?;
        match TokenState::of(&record, self.clock.now()) {
            TokenState::Active if !force => {
                debug!(user_id = %user_identity, "Token already refreshed by concurrent caller");
                return Ok(record);
            }
            TokenState::Dead => {
                return Err(LifecycleError::ReauthorizationRequired(
                    user_identity.to_string(),
                ))
            }
            TokenState::Absent => {
                return Err(LifecycleError::NoCredential(user_identity.to_string()))
            }
            TokenState::Active | TokenState::Stale => {}
        }

        let Some(refresh_token) = record.refresh_token.clone() else {
            return Err(LifecycleError::ReauthorizationRequired(
                user_identity.to_string(),
            ));
        };

        let response = match self
            .bounded(self.exchange.exchange_refresh(&refresh_token))
            .await
        {
            Ok(response) => response,
            Err(ExchangeError::RefreshTokenInvalid(reason)) => {
                warn!(user_id = %user_identity, reason = %reason, "Refresh token rejected by provider");
                if self
                    .store
                    .clear_refresh_token(user_identity, record.expires_at)?
                {
                    return Err(LifecycleError::ReauthorizationRequired(
                        user_identity.to_string(),
                    ));
                }

                // Another process rotated the token under us; its write may be usable.
                warn!(user_id = %user_identity, "Token row changed during refresh, re-reading");
                let current = self.store.get(user_identity)?;
                return match TokenState::of(&current, self.clock.now()) {
                    TokenState::Active => Ok(current),
                    _ => Err(LifecycleError::ReauthorizationRequired(
                        user_identity.to_string(),
                    )),
                };
            }
            Err(ExchangeError::ProviderUnreachable(reason)) => {
                warn!(user_id = %user_identity, reason = %reason, "Refresh exchange failed transiently");
                return Err(LifecycleError::RefreshTransientFailure(reason));
            }
            Err(e) => {
                warn!(user_id = %user_identity, error = %e, "Refresh exchange failed");
                return Err(e.into());
            }
        };

        let refreshed_at = self.clock.now();
        let update = refreshed_update(response, refresh_token, refreshed_at);

        if self
            .store
            .update_if_current(user_identity, record.expires_at, &update)?
        {
            info!(
                user_id = %user_identity,
                expires_at = update.expires_at,
                "Access token refreshed"
            );
            return Ok(CredentialRecord {
                user_identity: record.user_identity,
                access_token: update.access_token,
                expires_at: update.expires_at,
                scope: update.scope.unwrap_or(record.scope),
                refresh_token: update.refresh_token,
            });
        }

        // Another process wrote between our read and our write.
        warn!(user_id = %user_identity, "Token row changed during refresh, re-reading");
        let current = self.store.get(user_identity)?;
        if TokenState::of(&current, self.clock.now()) == TokenState::Active {
            Ok(current)
        } else {
            Err(LifecycleError::RefreshTransientFailure(
                "token row changed during refresh".to_string(),
            ))
        }
    }

    /// Bound an exchange by the configured timeout. Timing out counts as the
    /// provider being unreachable.
    async fn bounded<F>(&self, exchange: F) -> Result<ProviderTokenResponse, ExchangeError>
    where
        F: Future<Output = Result<ProviderTokenResponse, ExchangeError>>,
    {
        tokio::time::timeout(self.exchange_timeout, exchange)
            .await
            .unwrap_or_else(|_| {
                Err(ExchangeError::ProviderUnreachable(format!(
                    "exchange timed out after {}ms",
                    self.exchange_timeout.as_millis()
                )))
            })
    }
}

fn expires_at(issued_at: i64, expires_in: u64) -> i64 {
    issued_at.saturating_add(i64::try_from(expires_in).unwrap_or(i64::MAX))
}

/// Fields to persist after a successful refresh. Providers may omit the
/// refresh token, in which case the previous one stays valid.
fn refreshed_update(
    response: ProviderTokenResponse,
    previous_refresh_token: String,
    refreshed_at: i64,
) -> TokenUpdate {
    TokenUpdate {
        access_token: response.access_token,
        expires_at: expires_at(refreshed_at, response.expires_in),
        refresh_token: Some(response.refresh_token.unwrap_or(previous_refresh_token)),
        scope: Some(response.scope).filter(|scope| !scope.is_empty()),
    }
}
