use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::assignment::model::{AssignmentState, LearnerContentAssignment};
use crate::assignment::repository::AssignmentRepository;
use crate::db::{opt_uuid, placeholders};
use crate::time::{from_ms, opt_from_ms, to_ms};

const ASSIGNMENT_COLUMNS: &str = r#"
  uuid, assignment_configuration_uuid, learner_email, lms_user_id,
  content_key, content_quantity, state, transaction_uuid,
  last_notification_ms, created_ms, updated_ms
"#;

/// SQLx-backed implementation of AssignmentRepository.
pub struct SqlxAssignmentRepository {
    pool: AnyPool,
}

impl SqlxAssignmentRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssignmentRepository for SqlxAssignmentRepository {
    async fn fetch_by_id(&self, uuid: &Uuid) -> anyhow::Result<Option<LearnerContentAssignment>> {
        let row = sqlx::query(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM learner_content_assignments WHERE uuid = ?;"
        ))
        .bind(uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_assignment).transpose()
    }

    async fn find_for_learners(
        &self,
        configuration_uuid: &Uuid,
        emails: &[String],
        content_key: &str,
    ) -> anyhow::Result<Vec<LearnerContentAssignment>> {
        if emails.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
SELECT {ASSIGNMENT_COLUMNS}
FROM learner_content_assignments
WHERE assignment_configuration_uuid = ? AND content_key = ? AND learner_email IN ({});
"#,
            placeholders(emails.len())
        );

        let mut q = sqlx::query(&sql)
            .bind(configuration_uuid.to_string())
            .bind(content_key.to_string());
        for e in emails {
            q = q.bind(e.clone());
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_assignment).collect()
    }

    async fn find_for_lms_user(
        &self,
        configuration_uuid: &Uuid,
        lms_user_id: i64,
        content_key: &str,
    ) -> anyhow::Result<Option<LearnerContentAssignment>> {
        let row = sqlx::query(&format!(
            r#"
SELECT {ASSIGNMENT_COLUMNS}
FROM learner_content_assignments
WHERE assignment_configuration_uuid = ? AND lms_user_id = ? AND content_key = ?
ORDER BY updated_ms DESC
LIMIT 1;
"#
        ))
        .bind(configuration_uuid.to_string())
        .bind(lms_user_id)
        .bind(content_key.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_assignment).transpose()
    }

    async fn allocated_quantity(&self, configuration_uuid: &Uuid) -> anyhow::Result<i64> {
        let row = sqlx::query(
            r#"
SELECT CAST(COALESCE(SUM(content_quantity), 0) AS BIGINT) AS total
FROM learner_content_assignments
WHERE assignment_configuration_uuid = ? AND state = 'allocated';
"#,
        )
        .bind(configuration_uuid.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<i64, _>("total")?)
    }

    async fn save_all(
        &self,
        created: &[LearnerContentAssignment],
        updated: &[LearnerContentAssignment],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        for a in created {
            sqlx::query(&format!(
                "INSERT INTO learner_content_assignments ({ASSIGNMENT_COLUMNS}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);"
            ))
            .bind(a.uuid.to_string())
            .bind(a.assignment_configuration_uuid.to_string())
            .bind(a.learner_email.clone())
            .bind(a.lms_user_id)
            .bind(a.content_key.clone())
            .bind(a.content_quantity)
            .bind(a.state.as_str())
            .bind(a.transaction_uuid.map(|u| u.to_string()))
            .bind(a.last_notification_at.as_ref().map(to_ms))
            .bind(to_ms(&a.created_at))
            .bind(to_ms(&a.updated_at))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert assignment for {}", a.learner_email))?;
        }

        for a in updated {
            let res = sqlx::query(
                r#"
UPDATE learner_content_assignments
SET lms_user_id = ?, content_quantity = ?, state = ?, transaction_uuid = ?,
    last_notification_ms = ?, updated_ms = ?
WHERE uuid = ?;
"#,
            )
            .bind(a.lms_user_id)
            .bind(a.content_quantity)
            .bind(a.state.as_str())
            .bind(a.transaction_uuid.map(|u| u.to_string()))
            .bind(a.last_notification_at.as_ref().map(to_ms))
            .bind(to_ms(&a.updated_at))
            .bind(a.uuid.to_string())
            .execute(&mut *tx)
            .await?;

            if res.rows_affected() != 1 {
                return Err(anyhow!("assignment {} not found for update", a.uuid));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn cancel_cancelable(
        &self,
        uuids: &[Uuid],
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;
        let mut moved = Vec::with_capacity(uuids.len());

        for uuid in uuids {
            let res = sqlx::query(
                r#"
UPDATE learner_content_assignments
SET state = 'cancelled', updated_ms = ?
WHERE uuid = ? AND state IN ('allocated', 'errored');
"#,
            )
            .bind(to_ms(&now))
            .bind(uuid.to_string())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to cancel assignment {uuid}"))?;

            if res.rows_affected() == 1 {
                moved.push(*uuid);
            }
        }

        tx.commit().await?;
        Ok(moved)
    }
}

/* =========================
Row mapping
========================= */

fn row_to_assignment(r: &sqlx::any::AnyRow) -> anyhow::Result<LearnerContentAssignment> {
    let content_quantity: i64 = r.try_get("content_quantity")?;
    if content_quantity > 0 {
        return Err(anyhow!("assignment quantity must be a debit, got {content_quantity}"));
    }

    Ok(LearnerContentAssignment {
        uuid: Uuid::parse_str(&r.try_get::<String, _>("uuid")?).context("invalid assignment uuid")?,
        assignment_configuration_uuid: Uuid::parse_str(
            &r.try_get::<String, _>("assignment_configuration_uuid")?,
        )
        .context("invalid assignment_configuration_uuid")?,
        learner_email: r.try_get("learner_email")?,
        lms_user_id: r.try_get("lms_user_id")?,
        content_key: r.try_get("content_key")?,
        content_quantity,
        state: r
            .try_get::<String, _>("state")?
            .parse::<AssignmentState>()
            .map_err(|e: String| anyhow!(e))?,
        transaction_uuid: opt_uuid(r.try_get("transaction_uuid")?)?,
        last_notification_at: opt_from_ms(r.try_get("last_notification_ms")?)?,
        created_at: from_ms(r.try_get("created_ms")?)?,
        updated_at: from_ms(r.try_get("updated_ms")?)?,
    })
}
