use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::AnyPool;

use crate::lock::store::LockStore;
use crate::time::now_ms;

/// Lock registry in the shared database, so every worker process pointed at
/// it contends on the same keys.
pub struct SqlxLockStore {
    pool: AnyPool,
}

impl SqlxLockStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for SqlxLockStore {
    async fn add(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = now_ms();
        let ttl_ms = i64::try_from(ttl.as_millis()).context("lock ttl overflows i64")?;

        // Expired holders forfeit the key.
        sqlx::query("DELETE FROM policy_locks WHERE lock_key = ? AND expires_ms <= ?;")
            .bind(key)
            .bind(now)
            .execute(&self.pool)
            .await
            .context("failed to purge expired lock")?;

        let res = sqlx::query(
            r#"
INSERT INTO policy_locks (lock_key, token, expires_ms)
VALUES (?, ?, ?)
ON CONFLICT (lock_key) DO NOTHING;
"#,
        )
        .bind(key)
        .bind(token)
        .bind(now.saturating_add(ttl_ms))
        .execute(&self.pool)
        .await
        .context("failed to insert lock")?;

        Ok(res.rows_affected() == 1)
    }

    async fn delete(&self, key: &str, token: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM policy_locks WHERE lock_key = ? AND token = ?;")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await
            .context("failed to release lock")?;
        Ok(())
    }
}
