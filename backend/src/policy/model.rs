use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lower sorts first when several policies could pay for the same content.
pub const CREDIT_POLICY_TYPE_PRIORITY: u8 = 1;

/// Variant discriminator. Persisted verbatim in `policy_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyType {
    #[serde(rename = "PerLearnerEnrollmentCreditAccessPolicy")]
    PerLearnerEnrollmentCap,
    #[serde(rename = "PerLearnerSpendCreditAccessPolicy")]
    PerLearnerSpendCap,
    #[serde(rename = "AssignedLearnerCreditAccessPolicy")]
    AssignedLearnerCredit,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::PerLearnerEnrollmentCap => "PerLearnerEnrollmentCreditAccessPolicy",
            PolicyType::PerLearnerSpendCap => "PerLearnerSpendCreditAccessPolicy",
            PolicyType::AssignedLearnerCredit => "AssignedLearnerCreditAccessPolicy",
        }
    }

    pub fn priority(&self) -> u8 {
        CREDIT_POLICY_TYPE_PRIORITY
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PerLearnerEnrollmentCreditAccessPolicy" => Ok(Self::PerLearnerEnrollmentCap),
            "PerLearnerSpendCreditAccessPolicy" => Ok(Self::PerLearnerSpendCap),
            "AssignedLearnerCreditAccessPolicy" => Ok(Self::AssignedLearnerCredit),
            other => Err(format!("unknown policy type: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMethod {
    Direct,
    Assigned,
}

impl AccessMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMethod::Direct => "direct",
            AccessMethod::Assigned => "assigned",
        }
    }
}

impl FromStr for AccessMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "assigned" => Ok(Self::Assigned),
            other => Err(format!("unknown access method: {other}")),
        }
    }
}

/// A bounded budget rule set. All money fields are cents; `None` limits are
/// unbounded, never zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsidyAccessPolicy {
    pub uuid: Uuid,
    pub policy_type: PolicyType,
    pub enterprise_customer_uuid: Uuid,
    pub description: String,
    pub catalog_uuid: Uuid,
    pub subsidy_uuid: Uuid,
    pub access_method: AccessMethod,
    pub active: bool,
    pub retired: bool,
    pub spend_limit: Option<i64>,
    pub per_learner_spend_limit: Option<i64>,
    pub per_learner_enrollment_limit: Option<i64>,
    pub assignment_configuration_uuid: Option<Uuid>,
    pub learner_credit_request_config_uuid: Option<Uuid>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SubsidyAccessPolicy {
    pub fn is_assignable(&self) -> bool {
        self.policy_type == PolicyType::AssignedLearnerCredit
    }

    /// Accepting new spend at all; the subsidy window is checked separately.
    pub fn is_redemption_enabled(&self) -> bool {
        self.active && !self.retired && self.deleted_at.is_none()
    }

    pub fn priority(&self) -> u8 {
        self.policy_type.priority()
    }

    /// Rejects field combinations a variant cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        for (name, limit) in [
            ("spend_limit", self.spend_limit),
            ("per_learner_spend_limit", self.per_learner_spend_limit),
            ("per_learner_enrollment_limit", self.per_learner_enrollment_limit),
        ] {
            if matches!(limit, Some(v) if v < 0) {
                return Err(format!("{name} must not be negative"));
            }
        }

        match self.policy_type {
            PolicyType::AssignedLearnerCredit => {
                if self.access_method != AccessMethod::Assigned {
                    return Err("assigned learner credit requires access_method=assigned".into());
                }
                if self.assignment_configuration_uuid.is_none() {
                    return Err("assigned learner credit requires an assignment configuration".into());
                }
                if self.per_learner_spend_limit.is_some()
                    || self.per_learner_enrollment_limit.is_some()
                {
                    return Err("assigned learner credit does not support per-learner caps".into());
                }
            }
            PolicyType::PerLearnerSpendCap => {
                if self.per_learner_enrollment_limit.is_some() {
                    return Err("spend-capped policies cannot set per_learner_enrollment_limit".into());
                }
            }
            PolicyType::PerLearnerEnrollmentCap => {
                if self.per_learner_spend_limit.is_some() {
                    return Err("enrollment-capped policies cannot set per_learner_spend_limit".into());
                }
            }
        }

        if self.policy_type != PolicyType::AssignedLearnerCredit
            && self.access_method != AccessMethod::Direct
        {
            return Err(format!("{} requires access_method=direct", self.policy_type));
        }

        Ok(())
    }
}
