use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::{AppState, traced};
use crate::context::RequestContext;
use crate::requests::listing::ListQuery;
use crate::requests::service::{CreateOutcome, CreateRequestInput, DeclineInput};

#[derive(Debug, Deserialize)]
pub struct CreateRequestBody {
    pub enterprise_customer_uuid: Uuid,
    pub policy_uuid: Uuid,
    pub course_id: String,
    /// Positive cents.
    pub course_price: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListRequestsParams {
    pub enterprise_customer_uuid: Uuid,
    pub state: Option<String>,
    pub latest_action_status: Option<String>,
    pub ordering: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApproveBody {
    pub policy_uuid: Uuid,
    pub learner_credit_request_uuids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct DeclineBody {
    pub learner_credit_request_uuid: Uuid,
    #[serde(default)]
    pub decline_reason: Option<String>,
    #[serde(default)]
    pub send_notification: bool,
    #[serde(default)]
    pub disassociate_from_org: bool,
}

#[derive(Debug, Deserialize)]
pub struct RequestRef {
    pub learner_credit_request_uuid: Uuid,
}

/// POST /api/v1/learner-credit-requests/
///
/// 201 for a new request, 200 when a reusable one was reset.
pub async fn create_request(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<CreateRequestBody>,
) -> Result<Response, ApiError> {
    let input = CreateRequestInput {
        enterprise_customer_uuid: body.enterprise_customer_uuid,
        policy_uuid: body.policy_uuid,
        course_id: body.course_id,
        course_price: body.course_price,
    };
    let (request, outcome) = traced("create_request", &ctx, state.requests.create(&ctx, input)).await?;

    let status = match outcome {
        CreateOutcome::Created => StatusCode::CREATED,
        CreateOutcome::Reused => StatusCode::OK,
    };
    Ok((status, Json(request)).into_response())
}

/// GET /api/v1/learner-credit-requests/?enterprise_customer_uuid&state&latest_action_status&ordering
pub async fn list_requests(
    State(state): State<AppState>,
    Query(params): Query<ListRequestsParams>,
) -> Result<Response, ApiError> {
    let query = ListQuery::parse(
        params.state.as_deref(),
        params.latest_action_status.as_deref(),
        params.ordering.as_deref(),
    )?;
    let rows = state
        .requests
        .list(&params.enterprise_customer_uuid, &query)
        .await?;
    Ok(Json(rows).into_response())
}

/// POST /api/v1/learner-credit-requests/approve/
///
/// 200 with the per-request report unless every request failed (422).
pub async fn approve(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<ApproveBody>,
) -> Result<Response, ApiError> {
    let report = traced(
        "approve_requests",
        &ctx,
        state
            .requests
            .approve(&ctx, &body.policy_uuid, &body.learner_credit_request_uuids),
    )
    .await?;

    let status = if report.all_failed() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)).into_response())
}

/// POST /api/v1/learner-credit-requests/decline/
pub async fn decline(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<DeclineBody>,
) -> Result<Response, ApiError> {
    let input = DeclineInput {
        request_uuid: body.learner_credit_request_uuid,
        reason: body.decline_reason,
        send_notification: body.send_notification,
        disassociate_from_org: body.disassociate_from_org,
    };
    let request = traced("decline_request", &ctx, state.requests.decline(&ctx, input)).await?;
    Ok(Json(request).into_response())
}

/// POST /api/v1/learner-credit-requests/cancel/
pub async fn cancel(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<RequestRef>,
) -> Result<Response, ApiError> {
    let request = traced(
        "cancel_request",
        &ctx,
        state.requests.cancel(&ctx, &body.learner_credit_request_uuid),
    )
    .await?;
    Ok(Json(request).into_response())
}

/// POST /api/v1/learner-credit-requests/remind/
pub async fn remind(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<RequestRef>,
) -> Result<Response, ApiError> {
    let request = traced(
        "remind_request",
        &ctx,
        state.requests.remind(&ctx, &body.learner_credit_request_uuid),
    )
    .await?;
    Ok(Json(request).into_response())
}

/// GET /api/v1/learner-credit-requests/{uuid}/actions/
pub async fn actions(
    State(state): State<AppState>,
    Path(request_uuid): Path<Uuid>,
) -> Result<Response, ApiError> {
    let actions = state.requests.actions(&request_uuid).await?;
    Ok(Json(actions).into_response())
}
