use anyhow::Context;
use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::history::{ChangeEntry, ChangeLogRepository};
use crate::time::{from_ms, to_ms};

pub struct SqlxChangeLogRepository {
    pool: AnyPool,
}

impl SqlxChangeLogRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeLogRepository for SqlxChangeLogRepository {
    async fn record(&self, e: &ChangeEntry) -> anyhow::Result<()> {
        sqlx::query(
            r#"
INSERT INTO change_log (uuid, entity_type, entity_uuid, actor, changed_ms, reason, snapshot)
VALUES (?, ?, ?, ?, ?, ?, ?);
"#,
        )
        .bind(e.uuid.to_string())
        .bind(e.entity_type.clone())
        .bind(e.entity_uuid.to_string())
        .bind(e.actor.clone())
        .bind(to_ms(&e.changed_at))
        .bind(e.reason.clone())
        .bind(e.snapshot.to_string())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record change for {}", e.entity_uuid))?;
        Ok(())
    }

    async fn entries_for(&self, entity_uuid: &Uuid) -> anyhow::Result<Vec<ChangeEntry>> {
        let rows = sqlx::query(
            r#"
SELECT uuid, entity_type, entity_uuid, actor, changed_ms, reason, snapshot
FROM change_log
WHERE entity_uuid = ?
ORDER BY changed_ms ASC;
"#,
        )
        .bind(entity_uuid.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok::<_, anyhow::Error>(ChangeEntry {
                    uuid: Uuid::parse_str(&r.try_get::<String, _>("uuid")?)?,
                    entity_type: r.try_get("entity_type")?,
                    entity_uuid: Uuid::parse_str(&r.try_get::<String, _>("entity_uuid")?)?,
                    actor: r.try_get("actor")?,
                    changed_at: from_ms(r.try_get("changed_ms")?)?,
                    reason: r.try_get("reason")?,
                    snapshot: serde_json::from_str(&r.try_get::<String, _>("snapshot")?)
                        .context("invalid change snapshot")?,
                })
            })
            .collect()
    }
}
