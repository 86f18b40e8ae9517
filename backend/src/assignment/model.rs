use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentState {
    Allocated,
    Accepted,
    Cancelled,
    Errored,
    Expired,
    Reversed,
}

impl AssignmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentState::Allocated => "allocated",
            AssignmentState::Accepted => "accepted",
            AssignmentState::Cancelled => "cancelled",
            AssignmentState::Errored => "errored",
            AssignmentState::Expired => "expired",
            AssignmentState::Reversed => "reversed",
        }
    }

    /// Terminal states whose row is reset in place on the next allocation.
    pub fn is_reusable(&self) -> bool {
        matches!(
            self,
            AssignmentState::Cancelled | AssignmentState::Expired | AssignmentState::Reversed
        )
    }

    pub fn is_cancelable(&self) -> bool {
        matches!(self, AssignmentState::Allocated | AssignmentState::Errored)
    }
}

impl fmt::Display for AssignmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocated" => Ok(Self::Allocated),
            "accepted" => Ok(Self::Accepted),
            "cancelled" => Ok(Self::Cancelled),
            "errored" => Ok(Self::Errored),
            "expired" => Ok(Self::Expired),
            "reversed" => Ok(Self::Reversed),
            other => Err(format!("unknown assignment state: {other}")),
        }
    }
}

/// Spend reserved for one learner and one piece of content, not yet redeemed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnerContentAssignment {
    pub uuid: Uuid,
    pub assignment_configuration_uuid: Uuid,
    pub learner_email: String,
    pub lms_user_id: Option<i64>,
    pub content_key: String,
    /// Always <= 0: a reservation is a debit.
    pub content_quantity: i64,
    pub state: AssignmentState,
    pub transaction_uuid: Option<Uuid>,
    pub last_notification_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LearnerContentAssignment {
    pub fn allocated(
        assignment_configuration_uuid: Uuid,
        learner_email: &str,
        lms_user_id: Option<i64>,
        content_key: &str,
        content_quantity: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            assignment_configuration_uuid,
            learner_email: learner_email.to_string(),
            lms_user_id,
            content_key: content_key.to_string(),
            content_quantity: content_quantity.min(0),
            state: AssignmentState::Allocated,
            transaction_uuid: None,
            last_notification_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Resets a reusable or errored row to a fresh allocation.
    pub fn reallocate(&mut self, content_quantity: i64, lms_user_id: Option<i64>, now: DateTime<Utc>) {
        self.state = AssignmentState::Allocated;
        self.content_quantity = content_quantity.min(0);
        self.transaction_uuid = None;
        if lms_user_id.is_some() {
            self.lms_user_id = lms_user_id;
        }
        self.updated_at = now;
    }

    /// Reserved spend as a positive amount.
    pub fn price(&self) -> i64 {
        self.content_quantity.saturating_abs()
    }
}
