use async_trait::async_trait;
use uuid::Uuid;

use crate::requests::model::{LearnerCreditRequest, LearnerCreditRequestConfig, RequestAction};

#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn fetch_config(&self, uuid: &Uuid) -> anyhow::Result<Option<LearnerCreditRequestConfig>>;

    async fn insert_config(&self, config: &LearnerCreditRequestConfig) -> anyhow::Result<()>;

    async fn fetch_by_id(&self, uuid: &Uuid) -> anyhow::Result<Option<LearnerCreditRequest>>;

    /// Every request a learner has made for a course under one
    /// configuration, newest first.
    async fn find_for_learner(
        &self,
        lms_user_id: i64,
        course_id: &str,
        config_uuid: &Uuid,
    ) -> anyhow::Result<Vec<LearnerCreditRequest>>;

    async fn find_by_assignment(
        &self,
        assignment_uuid: &Uuid,
    ) -> anyhow::Result<Option<LearnerCreditRequest>>;

    async fn list_for_enterprise(
        &self,
        enterprise_customer_uuid: &Uuid,
    ) -> anyhow::Result<Vec<LearnerCreditRequest>>;

    async fn insert(&self, request: &LearnerCreditRequest) -> anyhow::Result<()>;

    async fn update(&self, request: &LearnerCreditRequest) -> anyhow::Result<()>;

    /// The action log is append-only; there is no update or delete.
    async fn append_action(&self, action: &RequestAction) -> anyhow::Result<()>;

    /// Oldest first.
    async fn actions_for(&self, request_uuid: &Uuid) -> anyhow::Result<Vec<RequestAction>>;

    /// Latest action per request, for list views.
    async fn latest_actions(&self, request_uuids: &[Uuid]) -> anyhow::Result<Vec<RequestAction>>;
}
