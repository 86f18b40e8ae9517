use std::time::Duration;

use tracing::{Span, field};
use uuid::Uuid;

/// Fills the `policy_uuid` / `request_uuid` fields declared by
/// `common::logger::root_span`.
pub fn annotate_span(policy_uuid: Option<&Uuid>, request_uuid: Option<&Uuid>) {
    let span = Span::current();
    if let Some(p) = policy_uuid {
        span.record("policy_uuid", field::display(p));
    }
    if let Some(r) = request_uuid {
        span.record("request_uuid", field::display(r));
    }
}

pub async fn warn_if_slow<F, T>(label: &'static str, max: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = std::time::Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > max {
        tracing::warn!(
            target: "performance",
            label = label,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow operation detected"
        );
    }
    out
}
