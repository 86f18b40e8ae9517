use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self { $($name::$variant => $s),+ }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($name::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Requested,
    Approved,
    Accepted,
    Declined,
    Cancelled,
    Error,
    Expired,
    Reversed,
}

string_enum!(RequestState {
    Requested => "requested",
    Approved => "approved",
    Accepted => "accepted",
    Declined => "declined",
    Cancelled => "cancelled",
    Error => "error",
    Expired => "expired",
    Reversed => "reversed",
});

impl RequestState {
    /// A request in one of these blocks a new one for the same
    /// learner, course and configuration.
    pub fn blocks_new_request(&self) -> bool {
        matches!(
            self,
            RequestState::Requested
                | RequestState::Approved
                | RequestState::Accepted
                | RequestState::Error
        )
    }

    /// Terminal states whose row is reset and reused by a new request.
    pub fn is_reusable(&self) -> bool {
        matches!(
            self,
            RequestState::Cancelled | RequestState::Expired | RequestState::Reversed
        )
    }

    pub fn is_reviewable(&self) -> bool {
        matches!(self, RequestState::Requested | RequestState::Error)
    }

    /// Custom list ordering: requested, declined, cancelled, then the rest.
    pub fn sort_priority(&self) -> u8 {
        match self {
            RequestState::Requested => 0,
            RequestState::Declined => 1,
            RequestState::Cancelled => 2,
            _ => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Requested,
    Approved,
    Declined,
    Error,
    Accepted,
    Cancelled,
    Expired,
    Reversed,
    Reminded,
}

string_enum!(ActionType {
    Requested => "requested",
    Approved => "approved",
    Declined => "declined",
    Error => "error",
    Accepted => "accepted",
    Cancelled => "cancelled",
    Expired => "expired",
    Reversed => "reversed",
    Reminded => "reminded",
});

/// Status shown to admins for the latest action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Requested,
    Reminded,
    Approved,
    Accepted,
    Declined,
    Reversed,
    Cancelled,
    Expired,
    Error,
}

string_enum!(ActionStatus {
    Requested => "requested",
    Reminded => "reminded",
    Approved => "approved",
    Accepted => "accepted",
    Declined => "declined",
    Reversed => "reversed",
    Cancelled => "cancelled",
    Expired => "expired",
    Error => "error",
});

impl ActionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ActionStatus::Requested => "Requested",
            ActionStatus::Reminded | ActionStatus::Approved => "Waiting For Learner",
            ActionStatus::Accepted => "Redeemed By Learner",
            ActionStatus::Declined => "Declined",
            ActionStatus::Reversed => "Refunded",
            ActionStatus::Cancelled => "Cancelled",
            ActionStatus::Expired => "Expired",
            ActionStatus::Error => "Failed",
        }
    }

    pub fn for_state(state: RequestState) -> Self {
        match state {
            RequestState::Requested => ActionStatus::Requested,
            RequestState::Approved => ActionStatus::Approved,
            RequestState::Accepted => ActionStatus::Accepted,
            RequestState::Declined => ActionStatus::Declined,
            RequestState::Cancelled => ActionStatus::Cancelled,
            RequestState::Error => ActionStatus::Error,
            RequestState::Expired => ActionStatus::Expired,
            RequestState::Reversed => ActionStatus::Reversed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorReason {
    FailedApproval,
    FailedDecline,
    FailedCancellation,
    FailedRedemption,
    FailedReversal,
    EmailError,
}

string_enum!(ActionErrorReason {
    FailedApproval => "failed_approval",
    FailedDecline => "failed_decline",
    FailedCancellation => "failed_cancellation",
    FailedRedemption => "failed_redemption",
    FailedReversal => "failed_reversal",
    EmailError => "email_error",
});

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnerCreditRequestConfig {
    pub uuid: Uuid,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnerCreditRequest {
    pub uuid: Uuid,
    pub enterprise_customer_uuid: Uuid,
    pub learner_credit_request_config_uuid: Uuid,
    pub lms_user_id: i64,
    pub learner_email: String,
    pub course_id: String,
    /// Asserted price in cents (positive).
    pub course_price: i64,
    pub state: RequestState,
    pub assignment_uuid: Option<Uuid>,
    pub reviewer_lms_user_id: Option<i64>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub decline_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot {action} a request in state {from}")]
pub struct TransitionError {
    pub action: ActionType,
    pub from: RequestState,
}

impl LearnerCreditRequest {
    pub fn new(
        enterprise_customer_uuid: Uuid,
        config_uuid: Uuid,
        lms_user_id: i64,
        learner_email: &str,
        course_id: &str,
        course_price: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            enterprise_customer_uuid,
            learner_credit_request_config_uuid: config_uuid,
            lms_user_id,
            learner_email: learner_email.to_string(),
            course_id: course_id.to_string(),
            course_price,
            state: RequestState::Requested,
            assignment_uuid: None,
            reviewer_lms_user_id: None,
            reviewed_at: None,
            decline_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn guard(&self, action: ActionType, ok: bool) -> Result<(), TransitionError> {
        if ok {
            Ok(())
        } else {
            Err(TransitionError {
                action,
                from: self.state,
            })
        }
    }

    /// Puts a reusable terminal request back to REQUESTED.
    pub fn reuse(&mut self, course_price: i64, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.guard(ActionType::Requested, self.state.is_reusable())?;
        self.state = RequestState::Requested;
        self.course_price = course_price;
        self.assignment_uuid = None;
        self.reviewer_lms_user_id = None;
        self.reviewed_at = None;
        self.decline_reason = None;
        self.updated_at = now;
        Ok(())
    }

    /// Approval cannot happen without the assignment that reserves its spend.
    pub fn approve(
        &mut self,
        assignment_uuid: Uuid,
        reviewer: i64,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.guard(ActionType::Approved, self.state.is_reviewable())?;
        self.state = RequestState::Approved;
        self.assignment_uuid = Some(assignment_uuid);
        self.reviewer_lms_user_id = Some(reviewer);
        self.reviewed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn decline(
        &mut self,
        reviewer: i64,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.guard(ActionType::Declined, self.state.is_reviewable())?;
        self.state = RequestState::Declined;
        self.reviewer_lms_user_id = Some(reviewer);
        self.reviewed_at = Some(now);
        self.decline_reason = reason;
        self.updated_at = now;
        Ok(())
    }

    pub fn cancel(&mut self, reviewer: i64, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.guard(ActionType::Cancelled, self.state == RequestState::Approved)?;
        self.state = RequestState::Cancelled;
        self.reviewer_lms_user_id = Some(reviewer);
        self.reviewed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// System-only marking; approval failures never land here.
    pub fn mark_error(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.guard(
            ActionType::Error,
            matches!(self.state, RequestState::Requested | RequestState::Approved),
        )?;
        self.state = RequestState::Error;
        self.updated_at = now;
        Ok(())
    }

    /// Learner redeemed the approved assignment.
    pub fn mark_accepted(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.guard(ActionType::Accepted, self.state == RequestState::Approved)?;
        self.state = RequestState::Accepted;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_expired(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.guard(ActionType::Expired, self.state == RequestState::Approved)?;
        self.state = RequestState::Expired;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_reversed(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.guard(ActionType::Reversed, self.state == RequestState::Accepted)?;
        self.state = RequestState::Reversed;
        self.updated_at = now;
        Ok(())
    }
}

/// One attempted transition. Never updated once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAction {
    pub uuid: Uuid,
    pub learner_credit_request_uuid: Uuid,
    pub recent_action: ActionType,
    pub status: ActionStatus,
    pub error_reason: Option<ActionErrorReason>,
    pub traceback: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RequestAction {
    pub fn success(request: &LearnerCreditRequest, action: ActionType, now: DateTime<Utc>) -> Self {
        let status = match action {
            ActionType::Reminded => ActionStatus::Reminded,
            _ => ActionStatus::for_state(request.state),
        };
        Self {
            uuid: Uuid::new_v4(),
            learner_credit_request_uuid: request.uuid,
            recent_action: action,
            status,
            error_reason: None,
            traceback: None,
            created_at: now,
        }
    }

    /// Failed attempt; `status` reflects the state the request stayed in.
    pub fn failure(
        request: &LearnerCreditRequest,
        action: ActionType,
        error_reason: ActionErrorReason,
        traceback: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            learner_credit_request_uuid: request.uuid,
            recent_action: action,
            status: ActionStatus::for_state(request.state),
            error_reason: Some(error_reason),
            traceback: Some(traceback),
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_request() -> LearnerCreditRequest {
        LearnerCreditRequest::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            42,
            "learner@corp.example",
            "edX+DemoX",
            1_000,
            Utc::now(),
        )
    }

    #[test]
    fn approve_requires_reviewable_state_and_attaches_assignment() {
        let mut r = mk_request();
        let a = Uuid::new_v4();
        r.approve(a, 7, Utc::now()).unwrap();
        assert_eq!(r.state, RequestState::Approved);
        assert_eq!(r.assignment_uuid, Some(a));
        assert_eq!(r.reviewer_lms_user_id, Some(7));

        let err = r.approve(Uuid::new_v4(), 7, Utc::now()).unwrap_err();
        assert_eq!(err.from, RequestState::Approved);
    }

    #[test]
    fn cancel_only_from_approved() {
        let mut r = mk_request();
        assert!(r.cancel(1, Utc::now()).is_err());
        r.approve(Uuid::new_v4(), 1, Utc::now()).unwrap();
        r.cancel(1, Utc::now()).unwrap();
        assert_eq!(r.state, RequestState::Cancelled);
    }

    #[test]
    fn reuse_clears_review_fields_and_updates_price() {
        let mut r = mk_request();
        r.approve(Uuid::new_v4(), 1, Utc::now()).unwrap();
        assert!(r.reuse(500, Utc::now()).is_err());

        r.cancel(1, Utc::now()).unwrap();
        r.reuse(1_250, Utc::now()).unwrap();
        assert_eq!(r.state, RequestState::Requested);
        assert_eq!(r.course_price, 1_250);
        assert_eq!(r.assignment_uuid, None);
        assert_eq!(r.reviewer_lms_user_id, None);
        assert_eq!(r.reviewed_at, None);
    }

    #[test]
    fn declined_requests_are_neither_reusable_nor_blocking() {
        let mut r = mk_request();
        r.decline(3, Some("budget".into()), Utc::now()).unwrap();
        assert!(!r.state.is_reusable());
        assert!(!r.state.blocks_new_request());
        assert_eq!(r.decline_reason.as_deref(), Some("budget"));
    }

    #[test]
    fn sort_priority_orders_requested_declined_cancelled_first() {
        let mut states = vec![
            RequestState::Approved,
            RequestState::Cancelled,
            RequestState::Requested,
            RequestState::Declined,
        ];
        states.sort_by_key(|s| s.sort_priority());
        assert_eq!(
            states,
            vec![
                RequestState::Requested,
                RequestState::Declined,
                RequestState::Cancelled,
                RequestState::Approved
            ]
        );
    }

    #[test]
    fn failure_action_keeps_current_status() {
        let r = mk_request();
        let a = RequestAction::failure(
            &r,
            ActionType::Approved,
            ActionErrorReason::FailedApproval,
            "PriceValidationError: boom".into(),
            Utc::now(),
        );
        assert_eq!(a.status, ActionStatus::Requested);
        assert_eq!(a.error_reason, Some(ActionErrorReason::FailedApproval));
    }

    #[test]
    fn string_forms_round_trip() {
        assert_eq!("failed_cancellation".parse(), Ok(ActionErrorReason::FailedCancellation));
        assert_eq!("reminded".parse(), Ok(ActionType::Reminded));
        assert_eq!(ActionStatus::Reminded.label(), "Waiting For Learner");
        assert!("bogus".parse::<RequestState>().is_err());
    }
}
