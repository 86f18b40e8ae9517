use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::clients::types::{
    NewTransaction, SubsidyRecord, Transaction, TransactionFilter, TransactionList,
};
use crate::clients::{ClientError, LedgerClient, http_client};

#[derive(Clone)]
pub struct HttpLedgerClient {
    http: Client,
    url: String,
}

impl HttpLedgerClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            http: http_client(timeout)?,
            url: url.trim_end_matches('/').to_string(),
        })
    }

    fn transactions_url(&self, subsidy_uuid: &Uuid) -> String {
        format!("{}/api/v2/subsidies/{}/admin/transactions/", self.url, subsidy_uuid)
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    #[instrument(skip(self), fields(subsidy_uuid = %subsidy_uuid), level = "debug")]
    async fn get_balance(&self, subsidy_uuid: &Uuid) -> Result<SubsidyRecord, ClientError> {
        let url = format!("{}/api/v2/subsidies/{}/", self.url, subsidy_uuid);

        let resp = self.http.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound {
                service: "ledger",
                resource: format!("subsidy {subsidy_uuid}"),
            });
        }
        let record: SubsidyRecord = resp.error_for_status()?.json().await?;

        debug!(
            current_balance = record.current_balance,
            is_active = record.is_active,
            "subsidy balance fetched"
        );
        Ok(record)
    }

    #[instrument(skip(self), fields(subsidy_uuid = %subsidy_uuid), level = "debug")]
    async fn list_transactions(
        &self,
        subsidy_uuid: &Uuid,
        filter: &TransactionFilter,
    ) -> Result<TransactionList, ClientError> {
        let resp = self
            .http
            .get(self.transactions_url(subsidy_uuid))
            .query(filter)
            .send()
            .await?
            .error_for_status()?;

        let list: TransactionList = resp.json().await?;
        debug!(count = list.results.len(), "ledger transactions listed");
        Ok(list)
    }

    #[instrument(
        skip(self, tx),
        fields(subsidy_uuid = %subsidy_uuid, idempotency_key = %tx.idempotency_key)
    )]
    async fn create_transaction(
        &self,
        subsidy_uuid: &Uuid,
        tx: &NewTransaction,
    ) -> Result<Transaction, ClientError> {
        let resp = self
            .http
            .post(self.transactions_url(subsidy_uuid))
            .json(tx)
            .send()
            .await?
            .error_for_status()?;

        let created: Transaction = resp.json().await?;
        if created.idempotency_key != tx.idempotency_key {
            return Err(ClientError::InvalidResponse("ledger"));
        }
        Ok(created)
    }

    #[instrument(skip(self), level = "debug")]
    async fn retrieve_transaction(
        &self,
        subsidy_uuid: &Uuid,
        transaction_uuid: &Uuid,
    ) -> Result<Option<Transaction>, ClientError> {
        let url = format!("{}/api/v2/transactions/{}/", self.url, transaction_uuid);

        let resp = self.http.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(%subsidy_uuid, %transaction_uuid, "ledger has no such transaction yet");
            return Ok(None);
        }
        Ok(Some(resp.error_for_status()?.json().await?))
    }
}
