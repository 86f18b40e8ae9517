use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use crate::clients::types::ContentMetadata;
use crate::clients::{CatalogClient, ClientError, http_client};

#[derive(Clone)]
pub struct HttpCatalogClient {
    http: Client,
    url: String,
}

#[derive(Deserialize)]
struct ContainsEnvelope {
    contains_content_items: bool,
}

#[derive(Deserialize)]
struct MetadataEnvelope {
    results: Vec<ContentMetadata>,
}

impl HttpCatalogClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            http: http_client(timeout)?,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    #[instrument(skip(self), level = "debug")]
    async fn contains_content(
        &self,
        catalog_uuid: &Uuid,
        content_key: &str,
    ) -> Result<bool, ClientError> {
        let url = format!(
            "{}/api/v1/enterprise-catalogs/{}/contains_content_items/",
            self.url, catalog_uuid
        );

        let envelope: ContainsEnvelope = self
            .http
            .get(&url)
            .query(&[("course_run_ids", content_key)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(envelope.contains_content_items)
    }

    #[instrument(skip(self), fields(keys = content_keys.len()), level = "debug")]
    async fn content_metadata(
        &self,
        catalog_uuid: &Uuid,
        content_keys: &[String],
    ) -> Result<Vec<ContentMetadata>, ClientError> {
        if content_keys.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!(
            "{}/api/v1/enterprise-catalogs/{}/content-metadata/",
            self.url, catalog_uuid
        );

        let envelope: MetadataEnvelope = self
            .http
            .get(&url)
            .query(&[("content_keys", content_keys.join(","))])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(envelope.results)
    }
}
