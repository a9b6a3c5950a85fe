//! Pending logins, keyed by the CSRF `state` sent to the provider.
//!
//! `/auth/login` records which user identity started the attempt; the
//! callback redeems the `state` exactly once to learn where to store the
//! resulting credential. Unredeemed attempts lapse after the configured
//! expiry and are swept by [`run_state_cleanup`].

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// A login that has been redirected to the provider but not yet called back
#[derive(Clone, Debug)]
pub struct StateEntry {
    /// Identity the callback's credential is stored under
    pub user_identity: String,
    pub created_at: DateTime<Utc>,
}

/// In-memory table of pending logins. Cloning shares the table.
#[derive(Clone)]
pub struct StateManager {
    pending: Arc<Mutex<HashMap<String, StateEntry>>>,
    expiry: Duration,
}

impl StateManager {
    /// `expiry_seconds` comes from `[server].state_expiry_seconds`.
    pub fn new(expiry_seconds: i64) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            expiry: Duration::seconds(expiry_seconds),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, StateEntry>> {
        // Entries are plain data, so a poisoned map is still consistent.
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_live(&self, entry: &StateEntry, now: DateTime<Utc>) -> bool {
        now - entry.created_at <= self.expiry
    }

    /// Start a login for `user_identity` and return the `state` to send.
    pub fn create_state(&self, user_identity: &str) -> String {
        let state = Uuid::new_v4().to_string();
        self.pending().insert(
            state.clone(),
            StateEntry {
                user_identity: user_identity.to_string(),
                created_at: Utc::now(),
            },
        );
        state
    }

    /// Redeem `state` from a callback. Unknown, reused, and lapsed states
    /// all yield `None`; a lapsed state is discarded either way.
    pub fn validate_and_consume(&self, state: &str) -> Option<StateEntry> {
        let entry = self.pending().remove(state)?;
        self.is_live(&entry, Utc::now()).then_some(entry)
    }

    /// Drop logins that were never called back in time.
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        self.pending().retain(|_, entry| self.is_live(entry, now));
    }

    /// Number of logins awaiting a callback
    pub fn count(&self) -> usize {
        self.pending().len()
    }
}

/// Sweep lapsed logins every `interval_seconds`, forever.
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        manager.cleanup_expired();
        tracing::debug!(pending_logins = manager.count(), "Swept expired login states");
    }
}
