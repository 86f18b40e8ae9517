//! Contracts for the sibling services the policy engine consults. Every
//! decision re-reads balances through these; nothing here is cached.

pub mod catalog;
pub mod errors;
pub mod ledger;
pub mod lms;
pub mod types;

use async_trait::async_trait;
use uuid::Uuid;

pub use errors::ClientError;
use types::{
    ContentMetadata, EnterpriseCustomerData, NewTransaction, SubsidyRecord, Transaction,
    TransactionFilter, TransactionList,
};

/// The subsidy ledger: source of truth for balances and committed spend.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn get_balance(&self, subsidy_uuid: &Uuid) -> Result<SubsidyRecord, ClientError>;

    async fn list_transactions(
        &self,
        subsidy_uuid: &Uuid,
        filter: &TransactionFilter,
    ) -> Result<TransactionList, ClientError>;

    async fn create_transaction(
        &self,
        subsidy_uuid: &Uuid,
        tx: &NewTransaction,
    ) -> Result<Transaction, ClientError>;

    /// `None` means the ledger has not written it yet.
    async fn retrieve_transaction(
        &self,
        subsidy_uuid: &Uuid,
        transaction_uuid: &Uuid,
    ) -> Result<Option<Transaction>, ClientError>;
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn contains_content(&self, catalog_uuid: &Uuid, content_key: &str)
    -> Result<bool, ClientError>;

    async fn content_metadata(
        &self,
        catalog_uuid: &Uuid,
        content_keys: &[String],
    ) -> Result<Vec<ContentMetadata>, ClientError>;
}

#[async_trait]
pub trait LmsClient: Send + Sync {
    async fn enterprise_contains_learner(
        &self,
        enterprise_uuid: &Uuid,
        lms_user_id: i64,
    ) -> Result<bool, ClientError>;

    /// Admin contacts and branding for user-facing denial messages.
    async fn enterprise_customer_data(
        &self,
        enterprise_uuid: &Uuid,
    ) -> Result<EnterpriseCustomerData, ClientError>;

    async fn unlink_users_from_enterprise(
        &self,
        enterprise_uuid: &Uuid,
        lms_user_ids: &[i64],
    ) -> Result<(), ClientError>;
}

/// Shared builder so every collaborator gets the same fixed timeout.
pub(crate) fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client, ClientError> {
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .pool_idle_timeout(std::time::Duration::from_secs(30))
        .tcp_keepalive(std::time::Duration::from_secs(30))
        .build()?;
    Ok(http)
}
