use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tracing::error;

use crate::error::AccessError;
use crate::policy::reason::ReasonDetail;

/// An HTTP error response: status plus a JSON body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &str, detail: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": error, "detail": detail.into() }),
        }
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized", detail)
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "InvalidInput", detail)
    }

    /// Attaches learner-facing denial explanations.
    pub fn with_reasons(mut self, reasons: Vec<ReasonDetail>) -> Self {
        if let Value::Object(map) = &mut self.body {
            map.insert("reasons".into(), json!(reasons));
        }
        self
    }
}

/// - lock contention: 429 (retry)
/// - classified denials, price, conflicts, allocation, cancellation and
///   collaborator failures: 422
/// - unknown policy or request: 404
/// - bad input: 400
/// - everything else: 500
pub fn status_for(err: &AccessError) -> StatusCode {
    match err {
        AccessError::LockAcquisitionFailed(_) => StatusCode::TOO_MANY_REQUESTS,
        AccessError::NotRedeemable(_)
        | AccessError::PriceValidation(_)
        | AccessError::Conflict(_)
        | AccessError::Allocation(_)
        | AccessError::CancellationFailed { .. }
        | AccessError::Client(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AccessError::PolicyNotFound(_) | AccessError::RequestNotFound(_) => StatusCode::NOT_FOUND,
        AccessError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        AccessError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<AccessError> for ApiError {
    fn from(err: AccessError) -> Self {
        let status = status_for(&err);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = ?err, "unhandled error");
            return Self::new(status, err.kind(), "internal server error");
        }

        let mut out = Self::new(status, err.kind(), err.to_string());
        if let (AccessError::CancellationFailed { non_cancelable }, Value::Object(map)) =
            (&err, &mut out.body)
        {
            map.insert("non_cancelable".into(), json!(non_cancelable));
        }
        out
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
