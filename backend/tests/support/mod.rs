#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use uuid::Uuid;

use enterprise_access::api::AppState;
use enterprise_access::assignment::repository_sqlx::SqlxAssignmentRepository;
use enterprise_access::clients::types::{
    ContentMetadata, EnterpriseCustomerData, NewTransaction, SubsidyRecord, Transaction,
    TransactionAggregates, TransactionFilter, TransactionList, TransactionState,
};
use enterprise_access::clients::{CatalogClient, ClientError, LedgerClient, LmsClient};
use enterprise_access::context::{Actor, RequestContext};
use enterprise_access::db::schema;
use enterprise_access::history::repository_sqlx::SqlxChangeLogRepository;
use enterprise_access::lock::DistributedLock;
use enterprise_access::lock::store::MemoryLockStore;
use enterprise_access::metrics::Counters;
use enterprise_access::policy::engine::{PolicyEngine, PolicyEngineParts};
use enterprise_access::policy::model::{AccessMethod, PolicyType, SubsidyAccessPolicy};
use enterprise_access::policy::price::PriceValidator;
use enterprise_access::policy::repository::PolicyRepository;
use enterprise_access::policy::repository_sqlx::SqlxPolicyRepository;
use enterprise_access::requests::model::LearnerCreditRequestConfig;
use enterprise_access::requests::repository::RequestRepository;
use enterprise_access::requests::repository_sqlx::SqlxRequestRepository;
use enterprise_access::requests::service::RequestService;
use enterprise_access::tasks::{Task, TaskQueue, TaskQueueError};

/// Isolated, uniquely-named in-memory SQLite database with the schema applied.
/// One pinned connection keeps the shared-cache database alive for the test.
pub async fn setup_db() -> AnyPool {
    sqlx::any::install_default_drivers();

    let db_name = Uuid::new_v4().to_string();
    let conn_str = format!("sqlite:file:{}?mode=memory&cache=shared", db_name);

    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(&conn_str)
        .await
        .unwrap();

    schema::migrate(&pool).await.unwrap();
    pool
}

/* =========================
Fake ledger
========================= */

#[derive(Default)]
pub struct FakeLedger {
    subsidies: Mutex<HashMap<Uuid, SubsidyRecord>>,
    transactions: Mutex<HashMap<Uuid, Vec<Transaction>>>,
    pub create_calls: AtomicUsize,
    pub retrieve_calls: AtomicUsize,
    pub fail_creates: AtomicBool,
    pub unavailable: AtomicBool,
}

impl FakeLedger {
    pub fn put_subsidy(&self, record: SubsidyRecord) {
        self.subsidies.lock().insert(record.uuid, record);
    }

    pub fn set_balance(&self, subsidy_uuid: &Uuid, balance: i64) {
        if let Some(r) = self.subsidies.lock().get_mut(subsidy_uuid) {
            r.current_balance = balance;
        }
    }

    pub fn set_active(&self, subsidy_uuid: &Uuid, active: bool) {
        if let Some(r) = self.subsidies.lock().get_mut(subsidy_uuid) {
            r.is_active = active;
        }
    }

    /// Prior committed spend; does not touch the balance.
    pub fn seed_transaction(
        &self,
        subsidy_uuid: Uuid,
        policy_uuid: Uuid,
        lms_user_id: i64,
        content_key: &str,
        quantity: i64,
    ) -> Transaction {
        let tx = Transaction {
            uuid: Uuid::new_v4(),
            state: TransactionState::Committed,
            idempotency_key: format!("seed-{}", Uuid::new_v4()),
            lms_user_id,
            content_key: content_key.to_string(),
            quantity,
            subsidy_access_policy_uuid: policy_uuid,
            metadata: None,
            reversal: None,
        };
        self.transactions
            .lock()
            .entry(subsidy_uuid)
            .or_default()
            .push(tx.clone());
        tx
    }

    pub fn transactions(&self, subsidy_uuid: &Uuid) -> Vec<Transaction> {
        self.transactions
            .lock()
            .get(subsidy_uuid)
            .cloned()
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), ClientError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClientError::Unavailable("ledger"));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn get_balance(&self, subsidy_uuid: &Uuid) -> Result<SubsidyRecord, ClientError> {
        self.check_available()?;
        self.subsidies
            .lock()
            .get(subsidy_uuid)
            .cloned()
            .ok_or(ClientError::NotFound {
                service: "ledger",
                resource: subsidy_uuid.to_string(),
            })
    }

    async fn list_transactions(
        &self,
        subsidy_uuid: &Uuid,
        filter: &TransactionFilter,
    ) -> Result<TransactionList, ClientError> {
        self.check_available()?;
        let results: Vec<Transaction> = self
            .transactions(subsidy_uuid)
            .into_iter()
            .filter(|t| filter.policy_uuid.is_none_or(|p| t.subsidy_access_policy_uuid == p))
            .filter(|t| filter.lms_user_id.is_none_or(|l| t.lms_user_id == l))
            .filter(|t| {
                filter
                    .content_key
                    .as_deref()
                    .is_none_or(|c| t.content_key == c)
            })
            .collect();
        let total: i64 = results.iter().filter(|t| t.is_live()).map(|t| t.quantity).sum();
        Ok(TransactionList {
            results,
            aggregates: TransactionAggregates {
                total_quantity: Some(total),
            },
        })
    }

    async fn create_transaction(
        &self,
        subsidy_uuid: &Uuid,
        tx: &NewTransaction,
    ) -> Result<Transaction, ClientError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(ClientError::Unavailable("ledger"));
        }

        let mut all = self.transactions.lock();
        let list = all.entry(*subsidy_uuid).or_default();
        if let Some(existing) = list.iter().find(|t| t.idempotency_key == tx.idempotency_key) {
            return Ok(existing.clone());
        }

        let created = Transaction {
            uuid: Uuid::new_v4(),
            state: TransactionState::Committed,
            idempotency_key: tx.idempotency_key.clone(),
            lms_user_id: tx.lms_user_id,
            content_key: tx.content_key.clone(),
            quantity: tx.quantity,
            subsidy_access_policy_uuid: tx.subsidy_access_policy_uuid,
            metadata: tx.metadata.clone(),
            reversal: None,
        };
        list.push(created.clone());
        drop(all);

        if let Some(r) = self.subsidies.lock().get_mut(subsidy_uuid) {
            r.current_balance += tx.quantity;
        }
        Ok(created)
    }

    async fn retrieve_transaction(
        &self,
        subsidy_uuid: &Uuid,
        transaction_uuid: &Uuid,
    ) -> Result<Option<Transaction>, ClientError> {
        self.check_available()?;
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .transactions(subsidy_uuid)
            .into_iter()
            .find(|t| t.uuid == *transaction_uuid))
    }
}

/* =========================
Fake catalog
========================= */

#[derive(Default)]
pub struct FakeCatalog {
    /// (catalog, content_key) -> canonical price
    contents: Mutex<HashMap<(Uuid, String), Option<i64>>>,
    pub unavailable: AtomicBool,
    /// Answers with a body the client cannot use.
    pub malformed: AtomicBool,
}

impl FakeCatalog {
    pub fn put(&self, catalog_uuid: Uuid, content_key: &str, price: Option<i64>) {
        self.contents
            .lock()
            .insert((catalog_uuid, content_key.to_string()), price);
    }

    pub fn remove(&self, catalog_uuid: Uuid, content_key: &str) {
        self.contents
            .lock()
            .remove(&(catalog_uuid, content_key.to_string()));
    }
}

#[async_trait]
impl CatalogClient for FakeCatalog {
    async fn contains_content(
        &self,
        catalog_uuid: &Uuid,
        content_key: &str,
    ) -> Result<bool, ClientError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClientError::Unavailable("catalog"));
        }
        if self.malformed.load(Ordering::SeqCst) {
            return Err(ClientError::InvalidResponse("catalog"));
        }
        Ok(self
            .contents
            .lock()
            .contains_key(&(*catalog_uuid, content_key.to_string())))
    }

    async fn content_metadata(
        &self,
        catalog_uuid: &Uuid,
        content_keys: &[String],
    ) -> Result<Vec<ContentMetadata>, ClientError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClientError::Unavailable("catalog"));
        }
        let contents = self.contents.lock();
        Ok(content_keys
            .iter()
            .filter_map(|k| {
                contents
                    .get(&(*catalog_uuid, k.clone()))
                    .map(|price| ContentMetadata {
                        content_key: k.clone(),
                        content_price: *price,
                    })
            })
            .collect())
    }
}

/* =========================
Fake LMS
========================= */

#[derive(Default)]
pub struct FakeLms {
    members: Mutex<HashSet<(Uuid, i64)>>,
    customers: Mutex<HashMap<Uuid, EnterpriseCustomerData>>,
    pub unlinked: Mutex<Vec<(Uuid, i64)>>,
    pub fail_unlink: AtomicBool,
}

impl FakeLms {
    pub fn link(&self, enterprise_uuid: Uuid, lms_user_id: i64) {
        self.members.lock().insert((enterprise_uuid, lms_user_id));
    }

    pub fn put_customer(&self, enterprise_uuid: Uuid, data: EnterpriseCustomerData) {
        self.customers.lock().insert(enterprise_uuid, data);
    }
}

#[async_trait]
impl LmsClient for FakeLms {
    async fn enterprise_contains_learner(
        &self,
        enterprise_uuid: &Uuid,
        lms_user_id: i64,
    ) -> Result<bool, ClientError> {
        Ok(self.members.lock().contains(&(*enterprise_uuid, lms_user_id)))
    }

    async fn enterprise_customer_data(
        &self,
        enterprise_uuid: &Uuid,
    ) -> Result<EnterpriseCustomerData, ClientError> {
        self.customers
            .lock()
            .get(enterprise_uuid)
            .cloned()
            .ok_or(ClientError::NotFound {
                service: "lms",
                resource: enterprise_uuid.to_string(),
            })
    }

    async fn unlink_users_from_enterprise(
        &self,
        enterprise_uuid: &Uuid,
        lms_user_ids: &[i64],
    ) -> Result<(), ClientError> {
        if self.fail_unlink.load(Ordering::SeqCst) {
            return Err(ClientError::Unavailable("lms"));
        }
        let mut unlinked = self.unlinked.lock();
        for id in lms_user_ids {
            unlinked.push((*enterprise_uuid, *id));
            self.members.lock().remove(&(*enterprise_uuid, *id));
        }
        Ok(())
    }
}

/* =========================
Task queue
========================= */

#[derive(Default)]
pub struct RecordingTaskQueue {
    pub tasks: Mutex<Vec<Task>>,
}

impl RecordingTaskQueue {
    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.lock().iter().map(|t| t.name()).collect()
    }
}

impl TaskQueue for RecordingTaskQueue {
    fn enqueue(&self, task: Task) -> Result<(), TaskQueueError> {
        self.tasks.lock().push(task);
        Ok(())
    }
}

/* =========================
Harness
========================= */

pub const COURSE: &str = "course-v1:edX+DemoX+Demo_Course";

pub struct Harness {
    pub pool: AnyPool,
    pub policies: Arc<SqlxPolicyRepository>,
    pub assignments: Arc<SqlxAssignmentRepository>,
    pub requests_repo: Arc<SqlxRequestRepository>,
    pub history: Arc<SqlxChangeLogRepository>,
    pub ledger: Arc<FakeLedger>,
    pub catalog: Arc<FakeCatalog>,
    pub lms: Arc<FakeLms>,
    pub tasks: Arc<RecordingTaskQueue>,
    pub lock_store: Arc<MemoryLockStore>,
    pub counters: Counters,
    pub engine: PolicyEngine,
    pub service: RequestService,
    pub enterprise_uuid: Uuid,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_lock_wait(Duration::from_millis(500)).await
    }

    pub async fn with_lock_wait(wait: Duration) -> Self {
        let pool = setup_db().await;

        let policies = Arc::new(SqlxPolicyRepository::new(pool.clone()));
        let assignments = Arc::new(SqlxAssignmentRepository::new(pool.clone()));
        let requests_repo = Arc::new(SqlxRequestRepository::new(pool.clone()));
        let history = Arc::new(SqlxChangeLogRepository::new(pool.clone()));
        let ledger = Arc::new(FakeLedger::default());
        let catalog = Arc::new(FakeCatalog::default());
        let lms = Arc::new(FakeLms::default());
        let tasks = Arc::new(RecordingTaskQueue::default());
        let lock_store = Arc::new(MemoryLockStore::new());
        let counters = Counters::default();

        let engine = PolicyEngine::new(PolicyEngineParts {
            policies: policies.clone(),
            assignments: assignments.clone(),
            history: history.clone(),
            ledger: ledger.clone(),
            catalog: catalog.clone(),
            lms: lms.clone(),
            lock: DistributedLock::new(lock_store.clone(), Duration::from_secs(30), wait),
            prices: PriceValidator::default(),
            counters: counters.clone(),
        });
        let service = RequestService::new(requests_repo.clone(), engine.clone(), tasks.clone());

        Self {
            pool,
            policies,
            assignments,
            requests_repo,
            history,
            ledger,
            catalog,
            lms,
            tasks,
            lock_store,
            counters,
            engine,
            service,
            enterprise_uuid: Uuid::new_v4(),
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            engine: self.engine.clone(),
            requests: self.service.clone(),
            counters: self.counters.clone(),
        }
    }

    pub fn admin(&self) -> RequestContext {
        RequestContext::new(Actor {
            lms_user_id: 9_000,
            email: "admin@corp.example".into(),
        })
    }

    pub fn learner(&self, lms_user_id: i64) -> RequestContext {
        RequestContext::new(Actor {
            lms_user_id,
            email: format!("learner{lms_user_id}@corp.example"),
        })
    }

    fn base_policy(&self, policy_type: PolicyType, access_method: AccessMethod) -> SubsidyAccessPolicy {
        SubsidyAccessPolicy {
            uuid: Uuid::new_v4(),
            policy_type,
            enterprise_customer_uuid: self.enterprise_uuid,
            description: format!("{policy_type} for tests"),
            catalog_uuid: Uuid::new_v4(),
            subsidy_uuid: Uuid::new_v4(),
            access_method,
            active: true,
            retired: false,
            spend_limit: None,
            per_learner_spend_limit: None,
            per_learner_enrollment_limit: None,
            assignment_configuration_uuid: None,
            learner_credit_request_config_uuid: None,
            deleted_at: None,
            created_at: Utc::now(),
        }
    }

    /// Persists the policy and gives it an active subsidy with `balance`
    /// plus `COURSE` in its catalog at `price`.
    pub async fn install(&self, policy: &SubsidyAccessPolicy, balance: i64, price: i64) {
        self.policies.insert(policy).await.unwrap();
        self.ledger.put_subsidy(SubsidyRecord {
            uuid: policy.subsidy_uuid,
            current_balance: balance,
            is_active: true,
            active_datetime: Some(Utc::now() - chrono::Duration::days(1)),
            expiration_datetime: Some(Utc::now() + chrono::Duration::days(365)),
        });
        self.catalog.put(policy.catalog_uuid, COURSE, Some(price));
    }

    /// Assigned-credit policy with an active learner-credit-request configuration.
    pub async fn assigned_policy(
        &self,
        spend_limit: Option<i64>,
        balance: i64,
        price: i64,
    ) -> SubsidyAccessPolicy {
        let config = LearnerCreditRequestConfig {
            uuid: Uuid::new_v4(),
            active: true,
            created_at: Utc::now(),
        };
        self.requests_repo.insert_config(&config).await.unwrap();

        let mut p = self.base_policy(PolicyType::AssignedLearnerCredit, AccessMethod::Assigned);
        p.spend_limit = spend_limit;
        p.assignment_configuration_uuid = Some(Uuid::new_v4());
        p.learner_credit_request_config_uuid = Some(config.uuid);
        self.install(&p, balance, price).await;
        p
    }

    pub async fn spend_capped_policy(
        &self,
        spend_limit: Option<i64>,
        per_learner: Option<i64>,
        balance: i64,
        price: i64,
    ) -> SubsidyAccessPolicy {
        let mut p = self.base_policy(PolicyType::PerLearnerSpendCap, AccessMethod::Direct);
        p.spend_limit = spend_limit;
        p.per_learner_spend_limit = per_learner;
        self.install(&p, balance, price).await;
        p
    }

    pub async fn enrollment_capped_policy(
        &self,
        per_learner: Option<i64>,
        balance: i64,
        price: i64,
    ) -> SubsidyAccessPolicy {
        let mut p = self.base_policy(PolicyType::PerLearnerEnrollmentCap, AccessMethod::Direct);
        p.per_learner_enrollment_limit = per_learner;
        self.install(&p, balance, price).await;
        p
    }
}
