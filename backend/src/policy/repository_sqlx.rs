use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::db::{bool_from_i64, opt_uuid};
use crate::policy::model::{AccessMethod, PolicyType, SubsidyAccessPolicy};
use crate::policy::repository::PolicyRepository;
use crate::time::{from_ms, opt_from_ms, to_ms};

const POLICY_COLUMNS: &str = r#"
  uuid, policy_type, enterprise_customer_uuid, description,
  catalog_uuid, subsidy_uuid, access_method, active, retired,
  spend_limit, per_learner_spend_limit, per_learner_enrollment_limit,
  assignment_configuration_uuid, learner_credit_request_config_uuid,
  deleted_ms, created_ms
"#;

/// SQLx-backed implementation of PolicyRepository.
pub struct SqlxPolicyRepository {
    pool: AnyPool,
}

impl SqlxPolicyRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyRepository for SqlxPolicyRepository {
    async fn fetch_by_id(&self, uuid: &Uuid) -> anyhow::Result<Option<SubsidyAccessPolicy>> {
        let row = sqlx::query(&format!(
            "SELECT {POLICY_COLUMNS} FROM subsidy_access_policies WHERE uuid = ?;"
        ))
        .bind(uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_policy).transpose()
    }

    async fn list_redeemable(
        &self,
        enterprise_customer_uuid: &Uuid,
    ) -> anyhow::Result<Vec<SubsidyAccessPolicy>> {
        let rows = sqlx::query(&format!(
            r#"
SELECT {POLICY_COLUMNS}
FROM subsidy_access_policies
WHERE enterprise_customer_uuid = ? AND active = 1 AND retired = 0 AND deleted_ms IS NULL
ORDER BY created_ms DESC;
"#
        ))
        .bind(enterprise_customer_uuid.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_policy(&r) {
                Ok(p) => out.push(p),
                Err(e) => {
                    // poison-row resilience: skip but don't fail the listing
                    tracing::warn!(error = %e, "skipping malformed policy row");
                }
            }
        }
        Ok(out)
    }

    async fn find_by_request_config(
        &self,
        config_uuid: &Uuid,
    ) -> anyhow::Result<Option<SubsidyAccessPolicy>> {
        let row = sqlx::query(&format!(
            r#"
SELECT {POLICY_COLUMNS}
FROM subsidy_access_policies
WHERE learner_credit_request_config_uuid = ? AND deleted_ms IS NULL
ORDER BY created_ms DESC
LIMIT 1;
"#
        ))
        .bind(config_uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_policy).transpose()
    }

    async fn insert(&self, p: &SubsidyAccessPolicy) -> anyhow::Result<()> {
        p.validate().map_err(|e| anyhow!("invalid policy {}: {e}", p.uuid))?;

        sqlx::query(&format!(
            "INSERT INTO subsidy_access_policies ({POLICY_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);"
        ))
        .bind(p.uuid.to_string())
        .bind(p.policy_type.as_str())
        .bind(p.enterprise_customer_uuid.to_string())
        .bind(p.description.clone())
        .bind(p.catalog_uuid.to_string())
        .bind(p.subsidy_uuid.to_string())
        .bind(p.access_method.as_str())
        .bind(p.active as i64)
        .bind(p.retired as i64)
        .bind(p.spend_limit)
        .bind(p.per_learner_spend_limit)
        .bind(p.per_learner_enrollment_limit)
        .bind(p.assignment_configuration_uuid.map(|u| u.to_string()))
        .bind(p.learner_credit_request_config_uuid.map(|u| u.to_string()))
        .bind(p.deleted_at.as_ref().map(to_ms))
        .bind(to_ms(&p.created_at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert policy {}", p.uuid))?;

        Ok(())
    }

    async fn update(&self, p: &SubsidyAccessPolicy) -> anyhow::Result<()> {
        p.validate().map_err(|e| anyhow!("invalid policy {}: {e}", p.uuid))?;

        let res = sqlx::query(
            r#"
UPDATE subsidy_access_policies
SET description = ?, active = ?, retired = ?,
    spend_limit = ?, per_learner_spend_limit = ?, per_learner_enrollment_limit = ?,
    assignment_configuration_uuid = ?, learner_credit_request_config_uuid = ?,
    deleted_ms = ?
WHERE uuid = ?;
"#,
        )
        .bind(p.description.clone())
        .bind(p.active as i64)
        .bind(p.retired as i64)
        .bind(p.spend_limit)
        .bind(p.per_learner_spend_limit)
        .bind(p.per_learner_enrollment_limit)
        .bind(p.assignment_configuration_uuid.map(|u| u.to_string()))
        .bind(p.learner_credit_request_config_uuid.map(|u| u.to_string()))
        .bind(p.deleted_at.as_ref().map(to_ms))
        .bind(p.uuid.to_string())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() != 1 {
            return Err(anyhow!("policy {} not found for update", p.uuid));
        }
        Ok(())
    }
}

/* =========================
Row mapping
========================= */

fn row_to_policy(r: &sqlx::any::AnyRow) -> anyhow::Result<SubsidyAccessPolicy> {
    let uuid = Uuid::parse_str(&r.try_get::<String, _>("uuid")?).context("invalid policy uuid")?;
    let policy_type = r
        .try_get::<String, _>("policy_type")?
        .parse::<PolicyType>()
        .map_err(|e: String| anyhow!(e))?;
    let access_method = r
        .try_get::<String, _>("access_method")?
        .parse::<AccessMethod>()
        .map_err(|e: String| anyhow!(e))?;

    Ok(SubsidyAccessPolicy {
        uuid,
        policy_type,
        enterprise_customer_uuid: Uuid::parse_str(
            &r.try_get::<String, _>("enterprise_customer_uuid")?,
        )
        .context("invalid enterprise_customer_uuid")?,
        description: r.try_get("description")?,
        catalog_uuid: Uuid::parse_str(&r.try_get::<String, _>("catalog_uuid")?)
            .context("invalid catalog_uuid")?,
        subsidy_uuid: Uuid::parse_str(&r.try_get::<String, _>("subsidy_uuid")?)
            .context("invalid subsidy_uuid")?,
        access_method,
        active: bool_from_i64(r.try_get("active")?, "active")?,
        retired: bool_from_i64(r.try_get("retired")?, "retired")?,
        spend_limit: r.try_get("spend_limit")?,
        per_learner_spend_limit: r.try_get("per_learner_spend_limit")?,
        per_learner_enrollment_limit: r.try_get("per_learner_enrollment_limit")?,
        assignment_configuration_uuid: opt_uuid(r.try_get("assignment_configuration_uuid")?)?,
        learner_credit_request_config_uuid: opt_uuid(
            r.try_get("learner_credit_request_config_uuid")?,
        )?,
        deleted_at: opt_from_ms(r.try_get("deleted_ms")?)?,
        created_at: from_ms(r.try_get("created_ms")?)?,
    })
}
