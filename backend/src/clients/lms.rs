use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::clients::types::EnterpriseCustomerData;
use crate::clients::{ClientError, LmsClient, http_client};

#[derive(Clone)]
pub struct HttpLmsClient {
    http: Client,
    url: String,
}

#[derive(Deserialize)]
struct CountEnvelope {
    count: u64,
}

#[derive(Serialize)]
struct UnlinkBody<'a> {
    user_ids: &'a [i64],
    is_relinkable: bool,
}

impl HttpLmsClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            http: http_client(timeout)?,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LmsClient for HttpLmsClient {
    #[instrument(skip(self), level = "debug")]
    async fn enterprise_contains_learner(
        &self,
        enterprise_uuid: &Uuid,
        lms_user_id: i64,
    ) -> Result<bool, ClientError> {
        let url = format!("{}/enterprise/api/v1/enterprise-learner/", self.url);

        let envelope: CountEnvelope = self
            .http
            .get(&url)
            .query(&[
                ("enterprise_customer_uuid", enterprise_uuid.to_string()),
                ("user_ids", lms_user_id.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(envelope.count > 0)
    }

    #[instrument(skip(self), level = "debug")]
    async fn enterprise_customer_data(
        &self,
        enterprise_uuid: &Uuid,
    ) -> Result<EnterpriseCustomerData, ClientError> {
        let url = format!(
            "{}/enterprise/api/v1/enterprise-customer/{}/",
            self.url, enterprise_uuid
        );

        let resp = self.http.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound {
                service: "lms",
                resource: format!("enterprise customer {enterprise_uuid}"),
            });
        }
        Ok(resp.error_for_status()?.json().await?)
    }

    #[instrument(skip(self), fields(count = lms_user_ids.len()))]
    async fn unlink_users_from_enterprise(
        &self,
        enterprise_uuid: &Uuid,
        lms_user_ids: &[i64],
    ) -> Result<(), ClientError> {
        let url = format!(
            "{}/enterprise/api/v1/enterprise-customer/{}/unlink_users/",
            self.url, enterprise_uuid
        );

        self.http
            .post(&url)
            .json(&UnlinkBody {
                user_ids: lms_user_ids,
                is_relinkable: true,
            })
            .send()
            .await?
            .error_for_status()?;

        info!("learners unlinked from enterprise");
        Ok(())
    }
}
