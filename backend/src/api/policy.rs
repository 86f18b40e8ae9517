use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::{AppState, traced};
use crate::assignment::allocator::Learner;
use crate::context::RequestContext;
use crate::error::AccessError;
use crate::policy::reason::RedemptionReason;

#[derive(Debug, Deserialize)]
pub struct PolicyListParams {
    pub enterprise_customer_uuid: Uuid,
    pub lms_user_id: Option<i64>,
    pub content_key: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeletePolicyParams {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RedeemBody {
    pub lms_user_id: i64,
    pub content_key: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct AllocateBody {
    pub learner_emails: Vec<String>,
    pub content_key: String,
    /// Per-learner debit; must be negative.
    pub content_price_cents: i64,
}

/// Denials carry the learner-facing explanation and admin contacts.
async fn denial(state: &AppState, policy_uuid: Uuid, err: AccessError) -> ApiError {
    let reason = match &err {
        AccessError::NotRedeemable(r) => *r,
        _ => return err.into(),
    };
    let enterprise = match state.engine.policy(&policy_uuid).await {
        Ok(p) => p.enterprise_customer_uuid,
        Err(_) => return err.into(),
    };
    let buckets = BTreeMap::<RedemptionReason, Vec<Uuid>>::from([(reason, vec![policy_uuid])]);
    let reasons = state.engine.reasons().explain(&enterprise, &buckets).await;
    ApiError::from(err).with_reasons(reasons)
}

/// GET /api/v1/policy/?enterprise_customer_uuid&lms_user_id&content_key
pub async fn list_policies(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(params): Query<PolicyListParams>,
) -> Result<Response, ApiError> {
    let lms_user_id = params.lms_user_id.unwrap_or(ctx.actor.lms_user_id);
    let policies = traced(
        "list_policies",
        &ctx,
        state.engine.redeemable_policies(
            &ctx,
            &params.enterprise_customer_uuid,
            lms_user_id,
            &params.content_key,
        ),
    )
    .await?;
    Ok(Json(policies).into_response())
}

/// GET /api/v1/policy/{uuid}/
pub async fn retrieve_policy(
    State(state): State<AppState>,
    Path(policy_uuid): Path<Uuid>,
) -> Result<Response, ApiError> {
    let policy = state.engine.policy(&policy_uuid).await?;
    Ok(Json(policy).into_response())
}

/// DELETE /api/v1/policy/{uuid}/?reason=...
pub async fn delete_policy(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(policy_uuid): Path<Uuid>,
    Query(params): Query<DeletePolicyParams>,
) -> Result<Response, ApiError> {
    let policy = traced(
        "delete_policy",
        &ctx,
        state
            .engine
            .soft_delete(&ctx, &policy_uuid, params.reason.as_deref()),
    )
    .await?;
    Ok(Json(policy).into_response())
}

/// POST /api/v1/policy/{uuid}/redeem/
///
/// 201 for a new ledger transaction, 200 when an existing one is returned.
pub async fn redeem(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(policy_uuid): Path<Uuid>,
    Json(body): Json<RedeemBody>,
) -> Result<Response, ApiError> {
    let outcome = traced(
        "redeem",
        &ctx,
        state.engine.redeem(
            &ctx,
            &policy_uuid,
            body.lms_user_id,
            &body.content_key,
            body.metadata,
        ),
    )
    .await;

    let redemption = match outcome {
        Ok(r) => r,
        Err(e) => return Err(denial(&state, policy_uuid, e).await),
    };

    if let Some(assignment) = &redemption.assignment {
        if let Err(e) = state.requests.sync_from_assignment(&ctx, &assignment.uuid).await {
            warn!(assignment_uuid = %assignment.uuid, error = %e, "request sync after redemption failed");
        }
    }

    let status = if redemption.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(redemption.transaction)).into_response())
}

/// GET /api/v1/policy/can-redeem/{enterprise_customer_uuid}/?content_key=a&content_key=b
pub async fn can_redeem(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(enterprise_customer_uuid): Path<Uuid>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(raw.as_deref().unwrap_or(""))
        .map_err(|e| ApiError::bad_request(format!("malformed query: {e}")))?;

    let mut content_keys = Vec::new();
    let mut lms_user_id = ctx.actor.lms_user_id;
    for (k, v) in pairs {
        match k.as_str() {
            "content_key" if !v.trim().is_empty() => {
                if !content_keys.contains(&v) {
                    content_keys.push(v);
                }
            }
            "lms_user_id" => {
                lms_user_id = v
                    .parse()
                    .map_err(|_| ApiError::bad_request("lms_user_id must be an integer"))?;
            }
            _ => {}
        }
    }
    if content_keys.is_empty() {
        return Err(ApiError::bad_request("at least one content_key is required"));
    }

    let results = traced(
        "can_redeem",
        &ctx,
        state
            .engine
            .can_redeem_for_contents(&ctx, &enterprise_customer_uuid, lms_user_id, &content_keys),
    )
    .await?;
    Ok(Json(results).into_response())
}

/// POST /api/v1/policy/{uuid}/allocate/
pub async fn allocate(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(policy_uuid): Path<Uuid>,
    Json(body): Json<AllocateBody>,
) -> Result<Response, ApiError> {
    if body.learner_emails.is_empty() {
        return Err(ApiError::bad_request("learner_emails must not be empty"));
    }
    let learners: Vec<Learner> = body
        .learner_emails
        .iter()
        .map(|e| Learner::by_email(e.trim().to_lowercase()))
        .collect();

    let outcome = traced(
        "allocate",
        &ctx,
        state.engine.allocate(
            &ctx,
            &policy_uuid,
            &learners,
            &body.content_key,
            body.content_price_cents,
        ),
    )
    .await;

    match outcome {
        Ok(result) => Ok((StatusCode::ACCEPTED, Json(result)).into_response()),
        Err(e) => Err(denial(&state, policy_uuid, e).await),
    }
}
