use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsidyRecord {
    pub uuid: Uuid,
    /// Cents remaining; already net of committed transactions.
    pub current_balance: i64,
    pub is_active: bool,
    #[serde(default)]
    pub active_datetime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expiration_datetime: Option<DateTime<Utc>>,
}

impl SubsidyRecord {
    /// Inside `[active_datetime, expiration_datetime)`; open ends are unbounded.
    pub fn is_within_window(&self, now: &DateTime<Utc>) -> bool {
        let started = self.active_datetime.map(|t| t <= *now).unwrap_or(true);
        let not_ended = self.expiration_datetime.map(|t| *now < t).unwrap_or(true);
        started && not_ended
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Created,
    Pending,
    Committed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reversal {
    pub uuid: Uuid,
    pub state: TransactionState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub uuid: Uuid,
    pub state: TransactionState,
    pub idempotency_key: String,
    pub lms_user_id: i64,
    pub content_key: String,
    /// Negative: a debit.
    pub quantity: i64,
    pub subsidy_access_policy_uuid: Uuid,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub reversal: Option<Reversal>,
}

impl Transaction {
    pub fn is_reversed(&self) -> bool {
        self.reversal
            .as_ref()
            .map(|r| r.state == TransactionState::Committed)
            .unwrap_or(false)
    }

    /// Counts against budgets: not failed and not reversed.
    pub fn is_live(&self) -> bool {
        self.state != TransactionState::Failed && !self.is_reversed()
    }

    /// Committed with no committed reversal.
    pub fn is_successful(&self) -> bool {
        self.state == TransactionState::Committed && !self.is_reversed()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAggregates {
    /// Sum of live quantities (negative).
    #[serde(default)]
    pub total_quantity: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionList {
    pub results: Vec<Transaction>,
    #[serde(default)]
    pub aggregates: TransactionAggregates,
}

impl TransactionList {
    /// Absolute value of the aggregate debit.
    pub fn total_spent(&self) -> i64 {
        self.aggregates.total_quantity.unwrap_or(0).saturating_abs()
    }

    pub fn live(&self) -> impl Iterator<Item = &Transaction> {
        self.results.iter().filter(|t| t.is_live())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TransactionFilter {
    #[serde(rename = "subsidy_access_policy_uuid", skip_serializing_if = "Option::is_none")]
    pub policy_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lms_user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_key: Option<String>,
}

impl TransactionFilter {
    pub fn for_policy(policy_uuid: Uuid) -> Self {
        Self {
            policy_uuid: Some(policy_uuid),
            ..Default::default()
        }
    }

    pub fn learner(mut self, lms_user_id: i64) -> Self {
        self.lms_user_id = Some(lms_user_id);
        self
    }

    pub fn content(mut self, content_key: impl Into<String>) -> Self {
        self.content_key = Some(content_key.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NewTransaction {
    pub lms_user_id: i64,
    pub content_key: String,
    pub quantity: i64,
    pub subsidy_access_policy_uuid: Uuid,
    pub idempotency_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub content_key: String,
    /// Canonical price in cents; `None` when the catalog has no price.
    #[serde(default)]
    pub content_price: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminUser {
    pub email: String,
    #[serde(default)]
    pub lms_user_id: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnterpriseCustomerData {
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub admin_users: Vec<AdminUser>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tx(state: TransactionState, reversal: Option<TransactionState>) -> Transaction {
        Transaction {
            uuid: Uuid::new_v4(),
            state,
            idempotency_key: "k".into(),
            lms_user_id: 7,
            content_key: "course-v1:edX+DemoX".into(),
            quantity: -100,
            subsidy_access_policy_uuid: Uuid::new_v4(),
            metadata: None,
            reversal: reversal.map(|s| Reversal {
                uuid: Uuid::new_v4(),
                state: s,
            }),
        }
    }

    #[test]
    fn reversal_must_be_committed_to_count() {
        assert!(tx(TransactionState::Committed, None).is_successful());
        assert!(tx(TransactionState::Committed, Some(TransactionState::Pending)).is_successful());
        assert!(!tx(TransactionState::Committed, Some(TransactionState::Committed)).is_live());
        assert!(!tx(TransactionState::Failed, None).is_live());
        assert!(tx(TransactionState::Pending, None).is_live());
    }

    #[test]
    fn window_bounds_are_half_open() {
        let now = Utc::now();
        let mut rec = SubsidyRecord {
            uuid: Uuid::new_v4(),
            current_balance: 0,
            is_active: true,
            active_datetime: Some(now - Duration::days(1)),
            expiration_datetime: Some(now),
        };
        assert!(!rec.is_within_window(&now));
        rec.expiration_datetime = Some(now + Duration::seconds(1));
        assert!(rec.is_within_window(&now));
        rec.active_datetime = Some(now + Duration::seconds(1));
        assert!(!rec.is_within_window(&now));
    }

    #[test]
    fn ledger_payload_deserializes_with_missing_optionals() {
        let raw = r#"{"results":[],"aggregates":{"total_quantity":-1500}}"#;
        let list: TransactionList = serde_json::from_str(raw).unwrap();
        assert_eq!(list.total_spent(), 1500);

        let empty: TransactionList = serde_json::from_str(r#"{"results":[]}"#).unwrap();
        assert_eq!(empty.total_spent(), 0);
    }
}
