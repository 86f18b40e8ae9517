//! Named, TTL-bound mutual exclusion shared between workers.
//!
//! Callers never hold a raw token: [`DistributedLock::scoped`] releases on
//! success, error and panic, and a dropped (cancelled) scope releases from
//! [`LockGuard`]'s `Drop`.

pub mod store;
pub mod store_sqlx;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::lock::store::LockStore;

pub const POLICY_LOCK_RESOURCE: &str = "subsidy_access_policy";

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("failed to acquire lock {key} within {waited_ms}ms")]
    AcquisitionFailed { key: String, waited_ms: u64 },

    #[error("lock store error: {0}")]
    Store(#[source] anyhow::Error),
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    ttl: Duration,
    wait: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>, ttl: Duration, wait: Duration) -> Self {
        Self { store, ttl, wait }
    }

    pub fn policy_key(policy_uuid: &Uuid) -> String {
        format!("{POLICY_LOCK_RESOURCE}:{policy_uuid}")
    }

    /// Polls until the key is free or `wait` elapses.
    pub async fn acquire(&self, key: &str) -> Result<LockGuard, LockError> {
        let token = Uuid::new_v4().to_string();
        let started = tokio::time::Instant::now();

        loop {
            let taken = self
                .store
                .add(key, &token, self.ttl)
                .await
                .map_err(LockError::Store)?;

            if taken {
                debug!(lock_key = key, "lock acquired");
                return Ok(LockGuard {
                    store: Arc::clone(&self.store),
                    key: key.to_string(),
                    token,
                    released: false,
                });
            }

            let waited = started.elapsed();
            if waited >= self.wait {
                warn!(
                    lock_key = key,
                    waited_ms = waited.as_millis() as u64,
                    "lock contention; giving up"
                );
                return Err(LockError::AcquisitionFailed {
                    key: key.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }

            tokio::time::sleep(POLL_INTERVAL.min(self.wait - waited)).await;
        }
    }

    /// Runs `fut` while holding `key`. The lock is released on every exit
    /// path; a panic inside `fut` is re-raised after release.
    pub async fn scoped<F, T>(&self, key: &str, fut: F) -> Result<T, LockError>
    where
        F: Future<Output = T>,
    {
        let guard = self.acquire(key).await?;
        let outcome = AssertUnwindSafe(fut).catch_unwind().await;
        guard.release().await;

        match outcome {
            Ok(v) => Ok(v),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Proof of holding a key.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    key: String,
    token: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.store.delete(&self.key, &self.token).await {
            // TTL still bounds how long the key stays blocked.
            warn!(lock_key = %self.key, error = %e, "failed to release lock");
        } else {
            debug!(lock_key = %self.key, "lock released");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lock_key = %self.key, "lock guard dropped outside runtime; waiting on ttl");
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = store.delete(&key, &token).await {
                warn!(lock_key = %key, error = %e, "failed to release dropped lock");
            }
        });
    }
}
