use sqlx::AnyPool;

pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    // Policies (one flat table; `policy_type` is the variant discriminator)
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS subsidy_access_policies (
  uuid TEXT PRIMARY KEY,
  policy_type TEXT NOT NULL,
  enterprise_customer_uuid TEXT NOT NULL,
  description TEXT NOT NULL,
  catalog_uuid TEXT NOT NULL,
  subsidy_uuid TEXT NOT NULL,
  access_method TEXT NOT NULL,
  active INTEGER NOT NULL CHECK (active IN (0,1)),
  retired INTEGER NOT NULL DEFAULT 0 CHECK (retired IN (0,1)),
  spend_limit BIGINT NULL,
  per_learner_spend_limit BIGINT NULL,
  per_learner_enrollment_limit BIGINT NULL,
  assignment_configuration_uuid TEXT NULL,
  learner_credit_request_config_uuid TEXT NULL,
  deleted_ms BIGINT NULL,
  created_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE INDEX IF NOT EXISTS idx_policies_enterprise
ON subsidy_access_policies(enterprise_customer_uuid);
"#,
    )
    .execute(pool)
    .await?;

    // Assignments
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS learner_content_assignments (
  uuid TEXT PRIMARY KEY,
  assignment_configuration_uuid TEXT NOT NULL,
  learner_email TEXT NOT NULL,
  lms_user_id BIGINT NULL,
  content_key TEXT NOT NULL,
  content_quantity BIGINT NOT NULL CHECK (content_quantity <= 0),
  state TEXT NOT NULL,
  transaction_uuid TEXT NULL,
  last_notification_ms BIGINT NULL,
  created_ms BIGINT NOT NULL,
  updated_ms BIGINT NOT NULL,
  UNIQUE (assignment_configuration_uuid, learner_email, content_key)
);
"#,
    )
    .execute(pool)
    .await?;

    // Request configurations
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS learner_credit_request_configs (
  uuid TEXT PRIMARY KEY,
  active INTEGER NOT NULL CHECK (active IN (0,1)),
  created_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Requests
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS learner_credit_requests (
  uuid TEXT PRIMARY KEY,
  enterprise_customer_uuid TEXT NOT NULL,
  learner_credit_request_config_uuid TEXT NOT NULL,
  lms_user_id BIGINT NOT NULL,
  learner_email TEXT NOT NULL,
  course_id TEXT NOT NULL,
  course_price BIGINT NOT NULL,
  state TEXT NOT NULL,
  assignment_uuid TEXT NULL,
  reviewer_lms_user_id BIGINT NULL,
  reviewed_ms BIGINT NULL,
  decline_reason TEXT NULL,
  created_ms BIGINT NOT NULL,
  updated_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // At most one open request per (learner, course, config)
    sqlx::query(
        r#"
CREATE UNIQUE INDEX IF NOT EXISTS uniq_open_learner_credit_request
ON learner_credit_requests(lms_user_id, course_id, learner_credit_request_config_uuid)
WHERE state IN ('requested', 'approved');
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE INDEX IF NOT EXISTS idx_requests_enterprise
ON learner_credit_requests(enterprise_customer_uuid);
"#,
    )
    .execute(pool)
    .await?;

    // Append-only request action log
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS learner_credit_request_actions (
  uuid TEXT PRIMARY KEY,
  learner_credit_request_uuid TEXT NOT NULL,
  seq BIGINT NOT NULL,
  recent_action TEXT NOT NULL,
  status TEXT NOT NULL,
  error_reason TEXT NULL,
  traceback TEXT NULL,
  created_ms BIGINT NOT NULL,
  UNIQUE (learner_credit_request_uuid, seq)
);
"#,
    )
    .execute(pool)
    .await?;

    // Change history (who changed what, when, why)
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS change_log (
  uuid TEXT PRIMARY KEY,
  entity_type TEXT NOT NULL,
  entity_uuid TEXT NOT NULL,
  actor TEXT NULL,
  changed_ms BIGINT NOT NULL,
  reason TEXT NULL,
  snapshot TEXT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE INDEX IF NOT EXISTS idx_change_log_entity
ON change_log(entity_uuid);
"#,
    )
    .execute(pool)
    .await?;

    // Shared lock registry (tokens + TTLs only)
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS policy_locks (
  lock_key TEXT PRIMARY KEY,
  token TEXT NOT NULL,
  expires_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
