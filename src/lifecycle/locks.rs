//! Per-identity mutual exclusion for the refresh sub-protocol.
//!
//! Locks for different identities never contend. Entries are dropped from the
//! map once no task holds or waits on them.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub(crate) struct IdentityLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IdentityLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `user_identity`.
    pub(crate) async fn acquire(&self, user_identity: &str) -> IdentityGuard<'_> {
        // Clone the Arc out so the shard lock is released before awaiting.
        let mutex = self
            .locks
            .entry(user_identity.to_string())
            .or_default()
            .clone();

        // Built before awaiting so a cancelled waiter still releases the entry.
        let mut guard = IdentityGuard {
            locks: self,
            user_identity: user_identity.to_string(),
            guard: None,
        };
        guard.guard = Some(mutex.lock_owned().await);

        guard
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

pub(crate) struct IdentityGuard<'a> {
    locks: &'a IdentityLocks,
    user_identity: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or waits on it.
        // Runs for abandoned waiters too, after their lock future is gone.
        self.locks
            .locks
            .remove_if(&self.user_identity, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_identity_is_exclusive() {
        let locks = Arc::new(IdentityLocks::new());

        let guard = locks.acquire("user1").await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("user1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_different_identities_do_not_contend() {
        let locks = IdentityLocks::new();

        let _first = locks.acquire("user1").await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.acquire("user2")).await;

        assert!(second.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_releases_entry() {
        let locks = IdentityLocks::new();

        let holder = locks.acquire("user1").await;
        let mut waiter = Box::pin(locks.acquire("user1"));
        // Poll once so the waiter queues on the mutex
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut waiter)
            .await
            .is_err());

        // Holder leaves while the waiter still references the entry...
        drop(holder);
        assert_eq!(locks.len(), 1);

        // ...then the waiter's request is dropped before it is polled again
        drop(waiter);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_entries_are_released() {
        let locks = IdentityLocks::new();

        {
            let _guard = locks.acquire("user1").await;
            assert_eq!(locks.len(), 1);
        }

        assert_eq!(locks.len(), 0);
    }
}
