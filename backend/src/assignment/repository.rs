use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::assignment::model::LearnerContentAssignment;

#[async_trait]
pub trait AssignmentRepository: Send + Sync {
    async fn fetch_by_id(&self, uuid: &Uuid) -> anyhow::Result<Option<LearnerContentAssignment>>;

    /// Rows for any of `emails` and `content_key` under one configuration.
    async fn find_for_learners(
        &self,
        configuration_uuid: &Uuid,
        emails: &[String],
        content_key: &str,
    ) -> anyhow::Result<Vec<LearnerContentAssignment>>;

    /// Most recently touched row linked to `lms_user_id` for `content_key`.
    async fn find_for_lms_user(
        &self,
        configuration_uuid: &Uuid,
        lms_user_id: i64,
        content_key: &str,
    ) -> anyhow::Result<Option<LearnerContentAssignment>>;

    /// Sum of ALLOCATED quantities (<= 0) under one configuration.
    async fn allocated_quantity(&self, configuration_uuid: &Uuid) -> anyhow::Result<i64>;

    /// Inserts and updates in one transaction.
    async fn save_all(
        &self,
        created: &[LearnerContentAssignment],
        updated: &[LearnerContentAssignment],
    ) -> anyhow::Result<()>;

    /// Moves rows that are still ALLOCATED or ERRORED to CANCELLED, judged
    /// on the stored state rather than the caller's copy. Returns the uuids
    /// that moved.
    async fn cancel_cancelable(
        &self,
        uuids: &[Uuid],
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Uuid>>;
}
