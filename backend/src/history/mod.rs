//! Append-only change log: who changed which entity, when, and why, with a
//! snapshot of the entity as it was before the change.

pub mod repository_sqlx;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChangeEntry {
    pub uuid: Uuid,
    pub entity_type: String,
    pub entity_uuid: Uuid,
    pub actor: Option<String>,
    pub changed_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub snapshot: serde_json::Value,
}

impl ChangeEntry {
    pub fn capture<T: Serialize>(
        entity_type: &str,
        entity_uuid: Uuid,
        actor: Option<&str>,
        reason: Option<&str>,
        before: &T,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            uuid: Uuid::new_v4(),
            entity_type: entity_type.to_string(),
            entity_uuid,
            actor: actor.map(str::to_string),
            changed_at: now,
            reason: reason.map(str::to_string),
            snapshot: serde_json::to_value(before)?,
        })
    }
}

#[async_trait]
pub trait ChangeLogRepository: Send + Sync {
    async fn record(&self, entry: &ChangeEntry) -> anyhow::Result<()>;

    /// Oldest first.
    async fn entries_for(&self, entity_uuid: &Uuid) -> anyhow::Result<Vec<ChangeEntry>>;
}
