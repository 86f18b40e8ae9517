//! HTTP surface. Handlers are thin: parse, call the service with an
//! explicit `RequestContext`, map `AccessError` to a status.

pub mod error;
pub mod extract;
pub mod policy;
pub mod requests;

use std::future::Future;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use common::logger::root_span;
use tracing::Instrument;

use crate::context::RequestContext;
use crate::metrics::{CounterSnapshot, Counters};
use crate::policy::engine::PolicyEngine;
use crate::requests::service::RequestService;

#[derive(Clone)]
pub struct AppState {
    pub engine: PolicyEngine,
    pub requests: RequestService,
    pub counters: Counters,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/ops/counters", get(counters))
        .route("/api/v1/policy/", get(policy::list_policies))
        .route(
            "/api/v1/policy/can-redeem/:enterprise_customer_uuid/",
            get(policy::can_redeem),
        )
        .route(
            "/api/v1/policy/:policy_uuid/",
            get(policy::retrieve_policy).delete(policy::delete_policy),
        )
        .route("/api/v1/policy/:policy_uuid/redeem/", post(policy::redeem))
        .route("/api/v1/policy/:policy_uuid/allocate/", post(policy::allocate))
        .route(
            "/api/v1/learner-credit-requests/",
            get(requests::list_requests).post(requests::create_request),
        )
        .route("/api/v1/learner-credit-requests/approve/", post(requests::approve))
        .route("/api/v1/learner-credit-requests/decline/", post(requests::decline))
        .route("/api/v1/learner-credit-requests/cancel/", post(requests::cancel))
        .route("/api/v1/learner-credit-requests/remind/", post(requests::remind))
        .route(
            "/api/v1/learner-credit-requests/:request_uuid/actions/",
            get(requests::actions),
        )
        .with_state(state)
}

pub async fn health() -> impl IntoResponse {
    "OK"
}

/// GET /api/v1/ops/counters
pub async fn counters(State(state): State<AppState>) -> Json<CounterSnapshot> {
    Json(state.counters.snapshot())
}

/// Runs a handler body inside a root span carrying the request's trace id.
pub(crate) async fn traced<F, T>(name: &'static str, ctx: &RequestContext, fut: F) -> T
where
    F: Future<Output = T>,
{
    fut.instrument(root_span(name, &ctx.trace_id)).await
}
