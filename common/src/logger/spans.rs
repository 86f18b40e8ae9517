use tracing::{Span, field};

use super::TraceId;

/// Create a root span for an inbound HTTP request or a queued task.
pub fn root_span(name: &'static str, trace_id: &TraceId) -> Span {
    tracing::info_span!(
        "root",
        name = %name,
        trace_id = %trace_id,
        policy_uuid = field::Empty,
        request_uuid = field::Empty
    )
}

/// Create a child span (inherits trace_id from the enclosing root)
pub fn child_span(name: &'static str) -> Span {
    tracing::info_span!(
        "child",
        name = %name,
        policy_uuid = field::Empty,
        request_uuid = field::Empty
    )
}
