use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common::logger::init_logger;
use enterprise_access::{
    api::{self, AppState},
    assignment::repository_sqlx::SqlxAssignmentRepository,
    clients::{catalog::HttpCatalogClient, ledger::HttpLedgerClient, lms::HttpLmsClient},
    config::{AppConfig, LockBackend},
    db::Db,
    history::repository_sqlx::SqlxChangeLogRepository,
    lock::{
        DistributedLock,
        store::{LockStore, MemoryLockStore},
        store_sqlx::SqlxLockStore,
    },
    metrics::Counters,
    policy::{
        engine::{PolicyEngine, PolicyEngineParts},
        price::PriceValidator,
        repository_sqlx::SqlxPolicyRepository,
    },
    requests::{repository_sqlx::SqlxRequestRepository, service::RequestService},
    tasks::{ChannelTaskQueue, TaskWorker},
};

fn lock_store(cfg: &AppConfig, db: &Db) -> Arc<dyn LockStore> {
    match cfg.lock_backend {
        LockBackend::Database => Arc::new(SqlxLockStore::new((*db.pool).clone())),
        LockBackend::Memory => {
            tracing::warn!("in-memory policy locks only serialize within this process");
            Arc::new(MemoryLockStore::new())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger("enterprise-access", AppConfig::json_logs_from_env());
    tracing::info!("Starting enterprise-access backend...");

    let cfg = AppConfig::from_env();

    let db = Db::connect(&cfg.database_url).await?;
    db.migrate().await?;
    let pool = (*db.pool).clone();

    let timeout = Duration::from_millis(cfg.client_timeout_ms);
    let ledger = Arc::new(HttpLedgerClient::new(cfg.ledger_api_url.clone(), timeout)?);
    let catalog = Arc::new(HttpCatalogClient::new(cfg.catalog_api_url.clone(), timeout)?);
    let lms = Arc::new(HttpLmsClient::new(cfg.lms_api_url.clone(), timeout)?);

    let requests_repo = Arc::new(SqlxRequestRepository::new(pool.clone()));
    let counters = Counters::default();

    let (tasks, task_rx) = ChannelTaskQueue::channel(cfg.task_queue_capacity);
    tokio::spawn(TaskWorker::new(lms.clone(), requests_repo.clone()).run(task_rx));

    let engine = PolicyEngine::new(PolicyEngineParts {
        policies: Arc::new(SqlxPolicyRepository::new(pool.clone())),
        assignments: Arc::new(SqlxAssignmentRepository::new(pool.clone())),
        history: Arc::new(SqlxChangeLogRepository::new(pool.clone())),
        ledger,
        catalog,
        lms,
        lock: DistributedLock::new(
            lock_store(&cfg, &db),
            Duration::from_millis(cfg.lock_ttl_ms),
            Duration::from_millis(cfg.lock_wait_ms),
        ),
        prices: PriceValidator::new(cfg.price_lower_bound_bps, cfg.price_upper_bound_bps),
        counters: counters.clone(),
    });
    let requests = RequestService::new(requests_repo, engine.clone(), Arc::new(tasks));

    let app = api::router(AppState {
        engine,
        requests,
        counters,
    });

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind_addr))?;
    tracing::info!(addr = %cfg.bind_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    Ok(())
}
