use chrono::{DateTime, Utc};
use common::logger::TraceId;

/// Who is acting. Passed explicitly into every policy and request operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub lms_user_id: i64,
    pub email: String,
}

/// Per-call context: actor, correlation id and the instant every check in
/// this call is evaluated against.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub actor: Actor,
    pub trace_id: TraceId,
    pub now: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            trace_id: TraceId::new(),
            now: Utc::now(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Background jobs and system-driven transitions.
    pub fn system() -> Self {
        Self::new(Actor {
            lms_user_id: 0,
            email: "system@enterprise-access".to_string(),
        })
    }

    pub fn actor_label(&self) -> String {
        format!("{}:{}", self.actor.lms_user_id, self.actor.email)
    }
}
