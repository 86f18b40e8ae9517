use async_trait::async_trait;
use uuid::Uuid;

use crate::policy::model::SubsidyAccessPolicy;

#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn fetch_by_id(&self, uuid: &Uuid) -> anyhow::Result<Option<SubsidyAccessPolicy>>;

    /// Active, unretired, not soft-deleted policies of one customer, newest first.
    async fn list_redeemable(
        &self,
        enterprise_customer_uuid: &Uuid,
    ) -> anyhow::Result<Vec<SubsidyAccessPolicy>>;

    /// The policy learner credit requests under `config_uuid` draw on.
    async fn find_by_request_config(
        &self,
        config_uuid: &Uuid,
    ) -> anyhow::Result<Option<SubsidyAccessPolicy>>;

    async fn insert(&self, policy: &SubsidyAccessPolicy) -> anyhow::Result<()>;

    async fn update(&self, policy: &SubsidyAccessPolicy) -> anyhow::Result<()>;
}
