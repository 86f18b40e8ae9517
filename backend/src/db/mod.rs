pub mod schema;

use std::sync::Arc;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;

#[derive(Clone)]
pub struct Db {
    pub pool: Arc<AnyPool>,
}

impl Db {
    /// SQLite only: every query is written with `?` placeholders.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        if !database_url.starts_with("sqlite:") {
            anyhow::bail!("unsupported database url {database_url:?}; expected sqlite:");
        }
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        schema::migrate(&self.pool).await
    }
}

/* =========================
Shared row conversions
========================= */

pub fn bool_from_i64(v: i64, field: &'static str) -> anyhow::Result<bool> {
    match v {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(anyhow::anyhow!("{field} must be 0 or 1, got {other}")),
    }
}

pub fn opt_uuid(raw: Option<String>) -> anyhow::Result<Option<uuid::Uuid>> {
    raw.map(|s| uuid::Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| anyhow::anyhow!("invalid uuid column: {e}"))
}

/// `?, ?, ?` for an `IN (...)` list of `n` binds.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Unique-constraint violations surface as conflicts, not internal errors.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error())
            .map(|db| db.is_unique_violation())
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_sqlite_urls_are_accepted() {
        let err = Db::connect("postgres://localhost/enterprise_access")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("unsupported database url"));
    }
}
