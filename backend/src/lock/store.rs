use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Add-if-absent registry of lock tokens. Holds nothing but tokens and
/// expiry times.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Stores `token` under `key` unless an unexpired entry already exists.
    /// Returns whether this call took the key.
    async fn add(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Removes `key` only while it is still held by `token`.
    async fn delete(&self, key: &str, token: &str) -> anyhow::Result<()>;
}

/// Process-local store. Serializes callers inside one process only.
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(token, _)| token.clone())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn add(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some((_, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }

        entries.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str, token: &str) -> anyhow::Result<()> {
        let mut entries = self.entries.lock();
        if entries.get(key).map(|(t, _)| t == token).unwrap_or(false) {
            entries.remove(key);
        }
        Ok(())
    }
}
