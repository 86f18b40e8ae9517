use std::collections::HashMap;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::db::{bool_from_i64, opt_uuid, placeholders};
use crate::requests::model::{
    ActionErrorReason, ActionStatus, ActionType, LearnerCreditRequest, LearnerCreditRequestConfig,
    RequestAction, RequestState,
};
use crate::requests::repository::RequestRepository;
use crate::time::{from_ms, opt_from_ms, to_ms};

const REQUEST_COLUMNS: &str = r#"
  uuid, enterprise_customer_uuid, learner_credit_request_config_uuid,
  lms_user_id, learner_email, course_id, course_price, state,
  assignment_uuid, reviewer_lms_user_id, reviewed_ms, decline_reason,
  created_ms, updated_ms
"#;

const ACTION_COLUMNS: &str = r#"
  uuid, learner_credit_request_uuid, seq, recent_action, status,
  error_reason, traceback, created_ms
"#;

/// SQLx-backed implementation of RequestRepository.
pub struct SqlxRequestRepository {
    pool: AnyPool,
}

impl SqlxRequestRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    async fn fetch_requests(
        &self,
        where_clause: &str,
        binds: Vec<String>,
    ) -> anyhow::Result<Vec<LearnerCreditRequest>> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM learner_credit_requests WHERE {where_clause} \
             ORDER BY created_ms DESC;"
        );
        let mut q = sqlx::query(&sql);
        for b in binds {
            q = q.bind(b);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_request(&r) {
                Ok(req) => out.push(req),
                Err(e) => {
                    // poison-row resilience: skip but don't fail the batch
                    tracing::warn!(error = %e, "skipping malformed learner credit request row");
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl RequestRepository for SqlxRequestRepository {
    async fn fetch_config(&self, uuid: &Uuid) -> anyhow::Result<Option<LearnerCreditRequestConfig>> {
        let row = sqlx::query(
            "SELECT uuid, active, created_ms FROM learner_credit_request_configs WHERE uuid = ?;",
        )
        .bind(uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok::<_, anyhow::Error>(LearnerCreditRequestConfig {
                uuid: Uuid::parse_str(&r.try_get::<String, _>("uuid")?)?,
                active: bool_from_i64(r.try_get("active")?, "active")?,
                created_at: from_ms(r.try_get("created_ms")?)?,
            })
        })
        .transpose()
    }

    async fn insert_config(&self, c: &LearnerCreditRequestConfig) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO learner_credit_request_configs (uuid, active, created_ms) VALUES (?, ?, ?);",
        )
        .bind(c.uuid.to_string())
        .bind(c.active as i64)
        .bind(to_ms(&c.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_by_id(&self, uuid: &Uuid) -> anyhow::Result<Option<LearnerCreditRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM learner_credit_requests WHERE uuid = ?;"
        ))
        .bind(uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_request).transpose()
    }

    async fn find_for_learner(
        &self,
        lms_user_id: i64,
        course_id: &str,
        config_uuid: &Uuid,
    ) -> anyhow::Result<Vec<LearnerCreditRequest>> {
        let rows = sqlx::query(&format!(
            r#"
SELECT {REQUEST_COLUMNS}
FROM learner_credit_requests
WHERE lms_user_id = ? AND course_id = ? AND learner_credit_request_config_uuid = ?
ORDER BY created_ms DESC;
"#
        ))
        .bind(lms_user_id)
        .bind(course_id.to_string())
        .bind(config_uuid.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_request).collect()
    }

    async fn find_by_assignment(
        &self,
        assignment_uuid: &Uuid,
    ) -> anyhow::Result<Option<LearnerCreditRequest>> {
        let mut found = self
            .fetch_requests("assignment_uuid = ?", vec![assignment_uuid.to_string()])
            .await?;
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        })
    }

    async fn list_for_enterprise(
        &self,
        enterprise_customer_uuid: &Uuid,
    ) -> anyhow::Result<Vec<LearnerCreditRequest>> {
        self.fetch_requests(
            "enterprise_customer_uuid = ?",
            vec![enterprise_customer_uuid.to_string()],
        )
        .await
    }

    async fn insert(&self, r: &LearnerCreditRequest) -> anyhow::Result<()> {
        sqlx::query(&format!(
            "INSERT INTO learner_credit_requests ({REQUEST_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);"
        ))
        .bind(r.uuid.to_string())
        .bind(r.enterprise_customer_uuid.to_string())
        .bind(r.learner_credit_request_config_uuid.to_string())
        .bind(r.lms_user_id)
        .bind(r.learner_email.clone())
        .bind(r.course_id.clone())
        .bind(r.course_price)
        .bind(r.state.as_str())
        .bind(r.assignment_uuid.map(|u| u.to_string()))
        .bind(r.reviewer_lms_user_id)
        .bind(r.reviewed_at.as_ref().map(to_ms))
        .bind(r.decline_reason.clone())
        .bind(to_ms(&r.created_at))
        .bind(to_ms(&r.updated_at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert learner credit request {}", r.uuid))?;
        Ok(())
    }

    async fn update(&self, r: &LearnerCreditRequest) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
UPDATE learner_credit_requests
SET course_price = ?, state = ?, assignment_uuid = ?, reviewer_lms_user_id = ?,
    reviewed_ms = ?, decline_reason = ?, updated_ms = ?
WHERE uuid = ?;
"#,
        )
        .bind(r.course_price)
        .bind(r.state.as_str())
        .bind(r.assignment_uuid.map(|u| u.to_string()))
        .bind(r.reviewer_lms_user_id)
        .bind(r.reviewed_at.as_ref().map(to_ms))
        .bind(r.decline_reason.clone())
        .bind(to_ms(&r.updated_at))
        .bind(r.uuid.to_string())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update learner credit request {}", r.uuid))?;

        if res.rows_affected() != 1 {
            return Err(anyhow!("learner credit request {} not found for update", r.uuid));
        }
        Ok(())
    }

    async fn append_action(&self, a: &RequestAction) -> anyhow::Result<()> {
        // seq gives a total order even when two actions share a millisecond.
        sqlx::query(&format!(
            r#"
INSERT INTO learner_credit_request_actions ({ACTION_COLUMNS})
VALUES (?, ?,
  (SELECT COALESCE(MAX(seq), 0) + 1 FROM learner_credit_request_actions
   WHERE learner_credit_request_uuid = ?),
  ?, ?, ?, ?, ?);
"#
        ))
        .bind(a.uuid.to_string())
        .bind(a.learner_credit_request_uuid.to_string())
        .bind(a.learner_credit_request_uuid.to_string())
        .bind(a.recent_action.as_str())
        .bind(a.status.as_str())
        .bind(a.error_reason.map(|e| e.as_str()))
        .bind(a.traceback.clone())
        .bind(to_ms(&a.created_at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to append action for {}", a.learner_credit_request_uuid))?;
        Ok(())
    }

    async fn actions_for(&self, request_uuid: &Uuid) -> anyhow::Result<Vec<RequestAction>> {
        let rows = sqlx::query(&format!(
            r#"
SELECT {ACTION_COLUMNS}
FROM learner_credit_request_actions
WHERE learner_credit_request_uuid = ?
ORDER BY seq ASC;
"#
        ))
        .bind(request_uuid.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| row_to_action(r).map(|(_, a)| a)).collect()
    }

    async fn latest_actions(&self, request_uuids: &[Uuid]) -> anyhow::Result<Vec<RequestAction>> {
        if request_uuids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM learner_credit_request_actions \
             WHERE learner_credit_request_uuid IN ({});",
            placeholders(request_uuids.len())
        );
        let mut q = sqlx::query(&sql);
        for u in request_uuids {
            q = q.bind(u.to_string());
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut latest: HashMap<Uuid, (i64, RequestAction)> = HashMap::new();
        for r in rows {
            let (seq, action) = row_to_action(&r)?;
            let key = action.learner_credit_request_uuid;
            match latest.get(&key) {
                Some((best, _)) if *best >= seq => {}
                _ => {
                    latest.insert(key, (seq, action));
                }
            }
        }
        Ok(latest.into_values().map(|(_, a)| a).collect())
    }
}

/* =========================
Row mapping
========================= */

fn row_to_request(r: &sqlx::any::AnyRow) -> anyhow::Result<LearnerCreditRequest> {
    Ok(LearnerCreditRequest {
        uuid: Uuid::parse_str(&r.try_get::<String, _>("uuid")?).context("invalid request uuid")?,
        enterprise_customer_uuid: Uuid::parse_str(
            &r.try_get::<String, _>("enterprise_customer_uuid")?,
        )?,
        learner_credit_request_config_uuid: Uuid::parse_str(
            &r.try_get::<String, _>("learner_credit_request_config_uuid")?,
        )?,
        lms_user_id: r.try_get("lms_user_id")?,
        learner_email: r.try_get("learner_email")?,
        course_id: r.try_get("course_id")?,
        course_price: r.try_get("course_price")?,
        state: r
            .try_get::<String, _>("state")?
            .parse::<RequestState>()
            .map_err(|e: String| anyhow!(e))?,
        assignment_uuid: opt_uuid(r.try_get("assignment_uuid")?)?,
        reviewer_lms_user_id: r.try_get("reviewer_lms_user_id")?,
        reviewed_at: opt_from_ms(r.try_get("reviewed_ms")?)?,
        decline_reason: r.try_get("decline_reason")?,
        created_at: from_ms(r.try_get("created_ms")?)?,
        updated_at: from_ms(r.try_get("updated_ms")?)?,
    })
}

fn row_to_action(r: &sqlx::any::AnyRow) -> anyhow::Result<(i64, RequestAction)> {
    let error_reason = r
        .try_get::<Option<String>, _>("error_reason")?
        .map(|s| s.parse::<ActionErrorReason>().map_err(|e: String| anyhow!(e)))
        .transpose()?;

    let action = RequestAction {
        uuid: Uuid::parse_str(&r.try_get::<String, _>("uuid")?)?,
        learner_credit_request_uuid: Uuid::parse_str(
            &r.try_get::<String, _>("learner_credit_request_uuid")?,
        )?,
        recent_action: r
            .try_get::<String, _>("recent_action")?
            .parse::<ActionType>()
            .map_err(|e: String| anyhow!(e))?,
        status: r
            .try_get::<String, _>("status")?
            .parse::<ActionStatus>()
            .map_err(|e: String| anyhow!(e))?,
        error_reason,
        traceback: r.try_get("traceback")?,
        created_at: from_ms(r.try_get("created_ms")?)?,
    };
    Ok((r.try_get("seq")?, action))
}
