//! Why a learner cannot redeem, and what to tell them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::clients::LmsClient;
use crate::clients::types::EnterpriseCustomerData;

/// Stable, user-facing denial classification. The serialized slug is the
/// wire contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RedemptionReason {
    #[serde(rename = "policy_expired")]
    PolicyExpired,
    #[serde(rename = "subsidy_expired")]
    SubsidyExpired,
    #[serde(rename = "content_not_in_catalog")]
    ContentNotInCatalog,
    #[serde(rename = "learner_not_in_enterprise")]
    LearnerNotInEnterprise,
    #[serde(rename = "not_enough_value_in_subsidy")]
    NotEnoughValueInSubsidy,
    #[serde(rename = "policy_spend_limit_reached")]
    PolicySpendLimitReached,
    #[serde(rename = "learner_max_spend_reached")]
    LearnerMaxSpendReached,
    #[serde(rename = "learner_max_enrollments_reached")]
    LearnerMaxEnrollmentsReached,
    #[serde(rename = "reason_learner_not_assigned_content")]
    LearnerNotAssignedContent,
    #[serde(rename = "reason_learner_assignment_cancelled")]
    LearnerAssignmentCancelled,
    #[serde(rename = "reason_learner_assignment_failed")]
    LearnerAssignmentFailed,
    #[serde(rename = "reason_learner_assignment_expired")]
    LearnerAssignmentExpired,
    #[serde(rename = "reason_learner_assignment_reversed")]
    LearnerAssignmentReversed,
    /// A collaborator timed out or answered 5xx while evaluating.
    #[serde(rename = "service_unavailable")]
    ServiceUnavailable,
}

pub mod messages {
    pub const ORGANIZATION_NO_FUNDS: &str =
        "You can't enroll right now because your organization doesn't have enough funds.";
    pub const ORGANIZATION_NO_FUNDS_NO_ADMINS: &str = "You can't enroll right now because your organization doesn't have enough funds. Contact your administrator to request more.";
    pub const ORGANIZATION_EXPIRED_FUNDS: &str =
        "You can't enroll right now because your funds expired.";
    pub const ORGANIZATION_EXPIRED_FUNDS_NO_ADMINS: &str =
        "You can't enroll right now because your funds expired. Contact your administrator for help.";
    pub const LEARNER_LIMITS_REACHED: &str =
        "You can't enroll right now because of limits set by your organization.";
    pub const CONTENT_NOT_IN_CATALOG: &str = "You can't enroll right now because this course is no longer available in your organization's catalog.";
    pub const LEARNER_NOT_IN_ENTERPRISE: &str = "You can't enroll right now because your account is no longer associated with the organization.";
    pub const LEARNER_NOT_ASSIGNED_CONTENT: &str =
        "You can't enroll right now because this course is not assigned to you.";
    pub const LEARNER_ASSIGNMENT_CANCELED: &str =
        "You can't enroll right now because your administrator canceled your course assignment.";
    pub const SERVICE_UNAVAILABLE: &str =
        "You can't enroll right now. Please try again in a few minutes.";
}

impl RedemptionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionReason::PolicyExpired => "policy_expired",
            RedemptionReason::SubsidyExpired => "subsidy_expired",
            RedemptionReason::ContentNotInCatalog => "content_not_in_catalog",
            RedemptionReason::LearnerNotInEnterprise => "learner_not_in_enterprise",
            RedemptionReason::NotEnoughValueInSubsidy => "not_enough_value_in_subsidy",
            RedemptionReason::PolicySpendLimitReached => "policy_spend_limit_reached",
            RedemptionReason::LearnerMaxSpendReached => "learner_max_spend_reached",
            RedemptionReason::LearnerMaxEnrollmentsReached => "learner_max_enrollments_reached",
            RedemptionReason::LearnerNotAssignedContent => "reason_learner_not_assigned_content",
            RedemptionReason::LearnerAssignmentCancelled => "reason_learner_assignment_cancelled",
            RedemptionReason::LearnerAssignmentFailed => "reason_learner_assignment_failed",
            RedemptionReason::LearnerAssignmentExpired => "reason_learner_assignment_expired",
            RedemptionReason::LearnerAssignmentReversed => "reason_learner_assignment_reversed",
            RedemptionReason::ServiceUnavailable => "service_unavailable",
        }
    }

    /// Message shown to the learner. Funding messages point at an
    /// administrator only when nobody can be named.
    pub fn user_message(&self, has_admins: bool) -> Option<&'static str> {
        use messages::*;

        let no_funds = if has_admins {
            ORGANIZATION_NO_FUNDS
        } else {
            ORGANIZATION_NO_FUNDS_NO_ADMINS
        };
        let expired_funds = if has_admins {
            ORGANIZATION_EXPIRED_FUNDS
        } else {
            ORGANIZATION_EXPIRED_FUNDS_NO_ADMINS
        };

        match self {
            RedemptionReason::PolicyExpired
            | RedemptionReason::NotEnoughValueInSubsidy
            | RedemptionReason::PolicySpendLimitReached => Some(no_funds),
            RedemptionReason::SubsidyExpired => Some(expired_funds),
            RedemptionReason::LearnerNotInEnterprise => Some(LEARNER_NOT_IN_ENTERPRISE),
            RedemptionReason::LearnerMaxSpendReached
            | RedemptionReason::LearnerMaxEnrollmentsReached => Some(LEARNER_LIMITS_REACHED),
            RedemptionReason::ContentNotInCatalog => Some(CONTENT_NOT_IN_CATALOG),
            RedemptionReason::LearnerNotAssignedContent
            | RedemptionReason::LearnerAssignmentFailed => Some(LEARNER_NOT_ASSIGNED_CONTENT),
            RedemptionReason::LearnerAssignmentCancelled => Some(LEARNER_ASSIGNMENT_CANCELED),
            RedemptionReason::ServiceUnavailable => Some(SERVICE_UNAVAILABLE),
            RedemptionReason::LearnerAssignmentExpired
            | RedemptionReason::LearnerAssignmentReversed => None,
        }
    }
}

impl fmt::Display for RedemptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminContact {
    pub email: String,
    pub lms_user_id: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonMetadata {
    pub enterprise_administrators: Vec<AdminContact>,
}

/// One denial bucket in an API response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonDetail {
    pub reason: String,
    pub user_message: Option<String>,
    pub metadata: ReasonMetadata,
    pub policy_uuids: Vec<Uuid>,
}

/// Policies grouped by the first check they failed.
pub type ReasonBuckets = BTreeMap<RedemptionReason, Vec<Uuid>>;

/// A designated contact email wins over the list of admin users.
pub fn admin_contacts(data: &EnterpriseCustomerData) -> Vec<AdminContact> {
    if let Some(email) = data.contact_email.as_deref().filter(|e| !e.trim().is_empty()) {
        return vec![AdminContact {
            email: email.to_string(),
            lms_user_id: None,
        }];
    }
    data.admin_users
        .iter()
        .map(|u| AdminContact {
            email: u.email.clone(),
            lms_user_id: u.lms_user_id,
        })
        .collect()
}

/// Turns classified denials into learner-facing explanations.
#[derive(Clone)]
pub struct ReasonEngine {
    lms: Arc<dyn LmsClient>,
}

impl ReasonEngine {
    pub fn new(lms: Arc<dyn LmsClient>) -> Self {
        Self { lms }
    }

    /// Admin contacts for the customer; empty when the LMS cannot answer,
    /// which degrades the message rather than failing the response.
    pub async fn contacts(&self, enterprise_uuid: &Uuid) -> Vec<AdminContact> {
        match self.lms.enterprise_customer_data(enterprise_uuid).await {
            Ok(data) => admin_contacts(&data),
            Err(e) => {
                warn!(enterprise_uuid = %enterprise_uuid, error = %e, "admin contact lookup failed");
                Vec::new()
            }
        }
    }

    pub async fn explain(&self, enterprise_uuid: &Uuid, buckets: &ReasonBuckets) -> Vec<ReasonDetail> {
        if buckets.is_empty() {
            return Vec::new();
        }
        let admins = self.contacts(enterprise_uuid).await;
        explain_with(&admins, buckets)
    }

    /// Body for a single non-classified failure (e.g. price validation)
    /// against one policy.
    pub fn detail_for_error(kind: &str, message: &str, policy_uuid: Uuid) -> ReasonDetail {
        ReasonDetail {
            reason: kind.to_string(),
            user_message: Some(message.to_string()),
            metadata: ReasonMetadata::default(),
            policy_uuids: vec![policy_uuid],
        }
    }
}

pub fn explain_with(admins: &[AdminContact], buckets: &ReasonBuckets) -> Vec<ReasonDetail> {
    let has_admins = !admins.is_empty();
    buckets
        .iter()
        .map(|(reason, policies)| ReasonDetail {
            reason: reason.as_str().to_string(),
            user_message: reason.user_message(has_admins).map(str::to_string),
            metadata: ReasonMetadata {
                enterprise_administrators: admins.to_vec(),
            },
            policy_uuids: policies.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::types::AdminUser;

    #[test]
    fn slugs_match_serde_names() {
        for r in [
            RedemptionReason::PolicyExpired,
            RedemptionReason::PolicySpendLimitReached,
            RedemptionReason::LearnerNotAssignedContent,
            RedemptionReason::ServiceUnavailable,
        ] {
            let json = serde_json::to_string(&r).unwrap();
            assert_eq!(json, format!("\"{}\"", r.as_str()));
        }
    }

    #[test]
    fn funding_messages_depend_on_admin_presence() {
        let r = RedemptionReason::PolicySpendLimitReached;
        assert_eq!(r.user_message(true), Some(messages::ORGANIZATION_NO_FUNDS));
        assert_eq!(
            r.user_message(false),
            Some(messages::ORGANIZATION_NO_FUNDS_NO_ADMINS)
        );
        assert_eq!(
            RedemptionReason::SubsidyExpired.user_message(false),
            Some(messages::ORGANIZATION_EXPIRED_FUNDS_NO_ADMINS)
        );
        assert_eq!(
            RedemptionReason::LearnerMaxEnrollmentsReached.user_message(true),
            Some(messages::LEARNER_LIMITS_REACHED)
        );
    }

    #[test]
    fn contact_email_beats_admin_users() {
        let data = EnterpriseCustomerData {
            contact_email: Some("help@corp.example".into()),
            admin_users: vec![AdminUser {
                email: "admin@corp.example".into(),
                lms_user_id: Some(3),
            }],
        };
        assert_eq!(
            admin_contacts(&data),
            vec![AdminContact {
                email: "help@corp.example".into(),
                lms_user_id: None
            }]
        );

        let no_contact = EnterpriseCustomerData {
            contact_email: Some("  ".into()),
            ..data
        };
        assert_eq!(admin_contacts(&no_contact)[0].lms_user_id, Some(3));
    }

    #[test]
    fn one_detail_per_bucket() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut buckets = ReasonBuckets::new();
        buckets.insert(RedemptionReason::ContentNotInCatalog, vec![a]);
        buckets.insert(RedemptionReason::PolicyExpired, vec![b]);

        let details = explain_with(&[], &buckets);
        assert_eq!(details.len(), 2);
        let expired = details.iter().find(|d| d.reason == "policy_expired").unwrap();
        assert_eq!(expired.policy_uuids, vec![b]);
        assert_eq!(
            expired.user_message.as_deref(),
            Some(messages::ORGANIZATION_NO_FUNDS_NO_ADMINS)
        );
    }
}
