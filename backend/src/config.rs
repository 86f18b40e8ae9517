use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string (any sqlx `Any` URL).
    pub database_url: String,

    /// Address the HTTP API listens on.
    pub bind_addr: String,

    /// JSON log lines instead of the pretty formatter.
    pub json_logs: bool,

    // =========================
    // Collaborators
    // =========================
    /// Base URL of the subsidy ledger service.
    pub ledger_api_url: String,

    /// Base URL of the enterprise catalog service.
    pub catalog_api_url: String,

    /// Base URL of the LMS (enterprise membership + admin contacts).
    pub lms_api_url: String,

    /// Fixed timeout applied to every collaborator call.
    ///
    /// A timeout is treated as a non-redeemable condition for the item being
    /// evaluated, never as a crash of the whole request.
    pub client_timeout_ms: u64,

    // =========================
    // Policy lock
    // =========================
    /// `database` shares locks between every worker pointed at the same
    /// database; `memory` only serializes within this process.
    pub lock_backend: LockBackend,

    /// Lifetime of a lock entry. A crashed holder blocks the policy for at
    /// most this long.
    pub lock_ttl_ms: u64,

    /// How long a caller waits for a contended lock before giving up with a
    /// retryable error.
    pub lock_wait_ms: u64,

    // =========================
    // Price validation
    // =========================
    /// Lower edge of the accepted band, in basis points of the canonical price.
    pub price_lower_bound_bps: u32,

    /// Upper edge of the accepted band, in basis points of the canonical price.
    pub price_upper_bound_bps: u32,

    // =========================
    // Side effects
    // =========================
    /// Capacity of the channel feeding the task worker (notifications,
    /// learner unlinking). Full queue => task dropped with an error log.
    pub task_queue_capacity: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockBackend {
    Database,
    Memory,
}

impl FromStr for LockBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(Self::Database),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown lock backend: {other}")),
        }
    }
}

impl AppConfig {
    /// Readable before the logger exists, so the logger can be installed
    /// first and config warnings are not lost.
    pub fn json_logs_from_env() -> bool {
        std::env::var("APP_ENV").unwrap_or_default() == "production"
            || env_or("JSON_LOGS", 0u8) == 1
    }

    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://enterprise_access_dev.db?mode=rwc".to_string());

        let json_logs = Self::json_logs_from_env();

        Self {
            database_url,
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:18270".to_string()),
            json_logs,

            ledger_api_url: std::env::var("LEDGER_API_URL")
                .unwrap_or_else(|_| "http://localhost:18280".to_string()),
            catalog_api_url: std::env::var("CATALOG_API_URL")
                .unwrap_or_else(|_| "http://localhost:18160".to_string()),
            lms_api_url: std::env::var("LMS_API_URL")
                .unwrap_or_else(|_| "http://localhost:18000".to_string()),
            client_timeout_ms: env_or("CLIENT_TIMEOUT_MS", 5_000),

            lock_backend: env_or("LOCK_BACKEND", LockBackend::Database),
            lock_ttl_ms: env_or("POLICY_LOCK_TTL_MS", 300_000),
            lock_wait_ms: env_or("POLICY_LOCK_WAIT_MS", 2_000),

            // +/- 5% around the catalog price.
            price_lower_bound_bps: env_or("PRICE_LOWER_BOUND_BPS", 9_500),
            price_upper_bound_bps: env_or("PRICE_UPPER_BOUND_BPS", 10_500),

            task_queue_capacity: env_or("TASK_QUEUE_CAPACITY", 256),
        }
    }
}

/// Reads `key`, falling back to `default` when unset or malformed.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring malformed config value");
                default
            }
        },
        Err(_) => default,
    }
}
