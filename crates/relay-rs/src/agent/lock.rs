//! Per-conversation serialization.
//!
//! At most one turn runs per conversation id. A competing request polls
//! until the holder's [`ThreadLockGuard`] drops; other ids are unaffected.

use crate::error::RelayError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ThreadLocks {
    held: Arc<Mutex<HashSet<String>>>,
    poll_interval: Duration,
}

impl ThreadLocks {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
            poll_interval,
        }
    }

    /// Take the lock if it is free.
    pub fn try_acquire(&self, id: &str) -> Option<ThreadLockGuard> {
        let inserted = self
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string());
        inserted.then(|| ThreadLockGuard {
            held: Arc::clone(&self.held),
            id: id.to_string(),
        })
    }

    /// Poll until the lock is free, or fail with [`RelayError::Cancelled`].
    pub async fn acquire(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ThreadLockGuard, RelayError> {
        let mut waited = false;
        loop {
            if let Some(guard) = self.try_acquire(id) {
                if waited {
                    debug!("[{id}] lock acquired after waiting");
                }
                return Ok(guard);
            }
            if !waited {
                debug!("[{id}] waiting for lock");
                waited = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }
}

/// Releases its conversation on drop.
#[derive(Debug)]
pub struct ThreadLockGuard {
    held: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl ThreadLockGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ThreadLockGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn guard_releases_on_drop() {
        let locks = ThreadLocks::new(Duration::from_millis(10));
        let guard = locks.try_acquire("a").unwrap();
        assert!(locks.try_acquire("a").is_none());
        assert!(locks.try_acquire("b").is_some());
        assert_eq!(guard.id(), "a");
        drop(guard);
        assert!(!locks.is_locked("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn same_id_is_serialized() {
        let locks = ThreadLocks::new(Duration::from_millis(100));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("conv", &CancellationToken::new()).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(250)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_can_be_cancelled() {
        let locks = ThreadLocks::new(Duration::from_millis(100));
        let _held = locks.try_acquire("conv").unwrap();
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trip.cancel();
        });
        let result = locks.acquire("conv", &cancel).await;
        assert!(matches!(result, Err(RelayError::Cancelled)));
    }
}
