use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use common::logger::TraceId;

use crate::api::error::ApiError;
use crate::context::{Actor, RequestContext};

pub const LMS_USER_ID_HEADER: &str = "x-lms-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const TRACE_ID_HEADER: &str = "x-trace-id";

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// The authenticated actor is asserted by the gateway in headers; a
/// missing or malformed actor is 401.
#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let lms_user_id = header(parts, LMS_USER_ID_HEADER)
            .ok_or_else(|| ApiError::unauthorized(format!("missing {LMS_USER_ID_HEADER}")))?
            .parse::<i64>()
            .map_err(|_| ApiError::unauthorized(format!("malformed {LMS_USER_ID_HEADER}")))?;
        let email = header(parts, USER_EMAIL_HEADER)
            .ok_or_else(|| ApiError::unauthorized(format!("missing {USER_EMAIL_HEADER}")))?
            .to_string();

        let ctx = RequestContext::new(Actor { lms_user_id, email });
        Ok(match header(parts, TRACE_ID_HEADER).and_then(TraceId::parse) {
            Some(trace_id) => ctx.with_trace_id(trace_id),
            None => ctx,
        })
    }
}
