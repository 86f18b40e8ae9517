//! Policy engine: the sole arbiter of whether a (learner, content, price)
//! spend may happen against a policy's budget.
//!
//! Design principles:
//! - **First failure wins**: checks run in a fixed order and the first
//!   failing one is the classified reason. Reasons are never merged.
//! - **No cached balances**: every decision re-reads the ledger.
//! - **Lock for read-then-write**: `redeem` and `allocate` run inside the
//!   policy lock; `can_redeem` / `can_allocate` are lock-free reads.
//!
//! Callers that already hold the policy lock (batch approval) use the
//! `*_while_locked` variants, which never lock again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::assignment::allocator::{AllocationResult, Learner, allocate_assignments};
use crate::assignment::model::{AssignmentState, LearnerContentAssignment};
use crate::assignment::repository::AssignmentRepository;
use crate::clients::types::{NewTransaction, SubsidyRecord, Transaction, TransactionFilter};
use crate::clients::{CatalogClient, ClientError, LedgerClient, LmsClient};
use crate::context::RequestContext;
use crate::error::AccessError;
use crate::history::{ChangeEntry, ChangeLogRepository};
use crate::lock::{DistributedLock, LockError};
use crate::logger::{annotate_span, warn_if_slow};
use crate::metrics::Counters;
use crate::policy::model::{AccessMethod, SubsidyAccessPolicy};
use crate::policy::price::{PriceValidationError, PriceValidator};
use crate::policy::reason::{ReasonBuckets, ReasonDetail, ReasonEngine, RedemptionReason};
use crate::policy::repository::PolicyRepository;

const SLOW_COLLABORATOR: Duration = Duration::from_millis(750);

/// Outcome of a read-only eligibility check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RedeemCheck {
    Redeemable,
    Denied(RedemptionReason),
}

impl RedeemCheck {
    pub fn is_redeemable(&self) -> bool {
        matches!(self, RedeemCheck::Redeemable)
    }

    pub fn reason(&self) -> Option<RedemptionReason> {
        match self {
            RedeemCheck::Redeemable => None,
            RedeemCheck::Denied(r) => Some(*r),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Redemption {
    pub transaction: Transaction,
    /// False when an existing live transaction was returned instead.
    pub created: bool,
    /// The assignment consumed by an assigned-credit redemption.
    pub assignment: Option<LearnerContentAssignment>,
}

/// What a successful eligibility evaluation learned along the way.
#[derive(Clone, Debug)]
struct RedeemPlan {
    price: i64,
    subsidy_balance: i64,
    assignment: Option<LearnerContentAssignment>,
}

/// Redeemable policies for one learner and content, plus why the rest are not.
#[derive(Clone, Debug, Default)]
pub struct PolicyEvaluation {
    /// (policy, subsidy balance, price) for every redeemable policy.
    pub redeemable: Vec<(SubsidyAccessPolicy, i64, i64)>,
    pub buckets: ReasonBuckets,
}

impl PolicyEvaluation {
    /// Lowest type priority first, then the subsidy with the least balance left.
    pub fn resolve(&self) -> Option<&SubsidyAccessPolicy> {
        self.redeemable
            .iter()
            .min_by_key(|(p, balance, _)| (p.priority(), *balance))
            .map(|(p, _, _)| p)
    }

    fn resolved_price(&self) -> Option<i64> {
        let policy = self.resolve()?;
        self.redeemable
            .iter()
            .find(|(p, _, _)| p.uuid == policy.uuid)
            .map(|(_, _, price)| *price)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ListPrice {
    pub usd: f64,
    pub usd_cents: i64,
}

impl ListPrice {
    pub fn from_cents(cents: i64) -> Self {
        Self {
            usd: cents as f64 / 100.0,
            usd_cents: cents,
        }
    }
}

/// One content key's entry in the can-redeem response.
#[derive(Clone, Debug, Serialize)]
pub struct ContentRedeemability {
    pub content_key: String,
    pub list_price: Option<ListPrice>,
    pub redemptions: Vec<Transaction>,
    pub has_successful_redemption: bool,
    pub redeemable_subsidy_access_policy: Option<SubsidyAccessPolicy>,
    pub can_redeem: bool,
    pub reasons: Vec<ReasonDetail>,
}

pub struct PolicyEngineParts {
    pub policies: Arc<dyn PolicyRepository>,
    pub assignments: Arc<dyn AssignmentRepository>,
    pub history: Arc<dyn ChangeLogRepository>,
    pub ledger: Arc<dyn LedgerClient>,
    pub catalog: Arc<dyn CatalogClient>,
    pub lms: Arc<dyn LmsClient>,
    pub lock: DistributedLock,
    pub prices: PriceValidator,
    pub counters: Counters,
}

#[derive(Clone)]
pub struct PolicyEngine {
    policies: Arc<dyn PolicyRepository>,
    assignments: Arc<dyn AssignmentRepository>,
    history: Arc<dyn ChangeLogRepository>,
    ledger: Arc<dyn LedgerClient>,
    catalog: Arc<dyn CatalogClient>,
    lms: Arc<dyn LmsClient>,
    lock: DistributedLock,
    prices: PriceValidator,
    reasons: ReasonEngine,
    counters: Counters,
}

impl PolicyEngine {
    pub fn new(parts: PolicyEngineParts) -> Self {
        Self {
            reasons: ReasonEngine::new(Arc::clone(&parts.lms)),
            policies: parts.policies,
            assignments: parts.assignments,
            history: parts.history,
            ledger: parts.ledger,
            catalog: parts.catalog,
            lms: parts.lms,
            lock: parts.lock,
            prices: parts.prices,
            counters: parts.counters,
        }
    }

    pub fn reasons(&self) -> &ReasonEngine {
        &self.reasons
    }

    pub fn assignments(&self) -> &Arc<dyn AssignmentRepository> {
        &self.assignments
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Soft-deleted policies are not found.
    pub async fn policy(&self, uuid: &Uuid) -> Result<SubsidyAccessPolicy, AccessError> {
        match self.policies.fetch_by_id(uuid).await? {
            Some(p) if p.deleted_at.is_none() => Ok(p),
            _ => Err(AccessError::PolicyNotFound(*uuid)),
        }
    }

    pub async fn policy_for_request_config(
        &self,
        config_uuid: &Uuid,
    ) -> Result<SubsidyAccessPolicy, AccessError> {
        self.policies
            .find_by_request_config(config_uuid)
            .await?
            .ok_or_else(|| {
                AccessError::InvalidInput(format!("no policy uses request configuration {config_uuid}"))
            })
    }

    /// Runs `fut` while holding the policy lock. Contention surfaces as the
    /// retryable `LockAcquisitionFailed`.
    pub async fn locked<F, T>(&self, policy_uuid: &Uuid, fut: F) -> Result<T, AccessError>
    where
        F: Future<Output = Result<T, AccessError>>,
    {
        let key = DistributedLock::policy_key(policy_uuid);
        match self.lock.scoped(&key, fut).await {
            Ok(inner) => inner,
            Err(LockError::AcquisitionFailed { waited_ms, .. }) => {
                Counters::incr(&self.counters.lock_contention);
                warn!(
                    component = "policy_engine",
                    event = "lock_contention",
                    policy_uuid = %policy_uuid,
                    waited_ms,
                    "policy is locked by another caller"
                );
                Err(AccessError::LockAcquisitionFailed(*policy_uuid))
            }
            Err(LockError::Store(e)) => Err(AccessError::Internal(e)),
        }
    }

    // ---------------------------------------------------------------------
    // Collaborator reads
    // ---------------------------------------------------------------------

    async fn subsidy(&self, policy: &SubsidyAccessPolicy) -> Result<SubsidyRecord, ClientError> {
        warn_if_slow(
            "ledger.get_balance",
            SLOW_COLLABORATOR,
            self.ledger.get_balance(&policy.subsidy_uuid),
        )
        .await
    }

    /// Absolute committed spend under the policy, per the ledger's aggregate.
    async fn spent(&self, policy: &SubsidyAccessPolicy) -> Result<i64, ClientError> {
        let list = warn_if_slow(
            "ledger.list_transactions",
            SLOW_COLLABORATOR,
            self.ledger
                .list_transactions(&policy.subsidy_uuid, &TransactionFilter::for_policy(policy.uuid)),
        )
        .await?;
        Ok(list.total_spent())
    }

    /// Absolute ALLOCATED spend reserved by assignments under the policy.
    async fn allocated(&self, policy: &SubsidyAccessPolicy) -> Result<i64, AccessError> {
        let Some(config) = policy.assignment_configuration_uuid else {
            return Ok(0);
        };
        Ok(self.assignments.allocated_quantity(&config).await?.saturating_abs())
    }

    /// Canonical catalog price in cents.
    pub async fn canonical_price(
        &self,
        policy: &SubsidyAccessPolicy,
        content_key: &str,
    ) -> Result<i64, AccessError> {
        let metadata = warn_if_slow(
            "catalog.content_metadata",
            SLOW_COLLABORATOR,
            self.catalog
                .content_metadata(&policy.catalog_uuid, &[content_key.to_string()]),
        )
        .await?;

        metadata
            .into_iter()
            .find(|m| m.content_key == content_key)
            .and_then(|m| m.content_price)
            .ok_or_else(|| PriceValidationError::CanonicalPriceMissing(content_key.to_string()).into())
    }

    // ---------------------------------------------------------------------
    // Redemption
    // ---------------------------------------------------------------------

    /// Read-only. Collaborator failures are returned as errors; classified
    /// denials as `RedeemCheck::Denied`.
    #[instrument(
        skip(self, ctx, policy),
        target = "policy_engine",
        fields(policy_uuid = %policy.uuid, trace_id = %ctx.trace_id)
    )]
    pub async fn can_redeem(
        &self,
        ctx: &RequestContext,
        policy: &SubsidyAccessPolicy,
        lms_user_id: i64,
        content_key: &str,
    ) -> Result<RedeemCheck, AccessError> {
        Ok(match self.evaluate(ctx, policy, lms_user_id, content_key).await? {
            Ok(_) => RedeemCheck::Redeemable,
            Err(reason) => RedeemCheck::Denied(reason),
        })
    }

    async fn evaluate(
        &self,
        ctx: &RequestContext,
        policy: &SubsidyAccessPolicy,
        lms_user_id: i64,
        content_key: &str,
    ) -> Result<Result<RedeemPlan, RedemptionReason>, AccessError> {
        use RedemptionReason as R;

        if !policy.is_redemption_enabled() {
            return Ok(Err(R::PolicyExpired));
        }

        if !self
            .catalog
            .contains_content(&policy.catalog_uuid, content_key)
            .await?
        {
            return Ok(Err(R::ContentNotInCatalog));
        }

        let assignment = match policy.access_method {
            AccessMethod::Assigned => {
                let Some(config) = policy.assignment_configuration_uuid else {
                    return Ok(Err(R::LearnerNotAssignedContent));
                };
                let found = self
                    .assignments
                    .find_for_lms_user(&config, lms_user_id, content_key)
                    .await?;
                let Some(assignment) = found else {
                    return Ok(Err(R::LearnerNotAssignedContent));
                };
                if let Some(reason) = assignment_denial(assignment.state) {
                    return Ok(Err(reason));
                }
                Some(assignment)
            }
            AccessMethod::Direct => {
                if !self
                    .lms
                    .enterprise_contains_learner(&policy.enterprise_customer_uuid, lms_user_id)
                    .await?
                {
                    return Ok(Err(R::LearnerNotInEnterprise));
                }
                None
            }
        };

        let subsidy = self.subsidy(policy).await?;
        if !subsidy.is_within_window(&ctx.now) {
            return Ok(Err(R::PolicyExpired));
        }
        if !subsidy.is_active {
            return Ok(Err(R::SubsidyExpired));
        }

        let price = match &assignment {
            Some(a) => a.price(),
            None => match self.canonical_price(policy, content_key).await {
                Ok(p) => p,
                Err(AccessError::PriceValidation(PriceValidationError::CanonicalPriceMissing(_))) => {
                    return Ok(Err(R::ContentNotInCatalog));
                }
                Err(e) => return Err(e),
            },
        };

        if price > subsidy.current_balance {
            return Ok(Err(R::NotEnoughValueInSubsidy));
        }

        // Assigned spend was reserved against the limit at allocation time.
        if let (None, Some(limit)) = (&assignment, policy.spend_limit) {
            if self.spent(policy).await?.saturating_add(price) > limit {
                return Ok(Err(R::PolicySpendLimitReached));
            }
        }

        if policy.per_learner_spend_limit.is_some() || policy.per_learner_enrollment_limit.is_some() {
            let learner_txs = self
                .ledger
                .list_transactions(
                    &policy.subsidy_uuid,
                    &TransactionFilter::for_policy(policy.uuid).learner(lms_user_id),
                )
                .await?;

            if let Some(cap) = policy.per_learner_spend_limit {
                let learner_spent: i64 = learner_txs.live().map(|t| t.quantity.saturating_abs()).sum();
                if learner_spent.saturating_add(price) > cap {
                    return Ok(Err(R::LearnerMaxSpendReached));
                }
            }
            if let Some(cap) = policy.per_learner_enrollment_limit {
                let enrollments = learner_txs.live().count() as i64;
                if enrollments >= cap {
                    return Ok(Err(R::LearnerMaxEnrollmentsReached));
                }
            }
        }

        Ok(Ok(RedeemPlan {
            price,
            subsidy_balance: subsidy.current_balance,
            assignment,
        }))
    }

    /// Idempotent: an existing live transaction for (policy, learner,
    /// content) is returned instead of debiting again.
    #[instrument(
        skip(self, ctx, metadata),
        target = "policy_engine",
        fields(trace_id = %ctx.trace_id)
    )]
    pub async fn redeem(
        &self,
        ctx: &RequestContext,
        policy_uuid: &Uuid,
        lms_user_id: i64,
        content_key: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<Redemption, AccessError> {
        annotate_span(Some(policy_uuid), None);
        let policy = self.policy(policy_uuid).await?;
        self.locked(policy_uuid, async {
            self.redeem_while_locked(ctx, &policy, lms_user_id, content_key, metadata)
                .await
        })
        .await
    }

    async fn redeem_while_locked(
        &self,
        ctx: &RequestContext,
        policy: &SubsidyAccessPolicy,
        lms_user_id: i64,
        content_key: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<Redemption, AccessError> {
        if let Some(replay) = self.accepted_assignment_replay(policy, lms_user_id, content_key).await? {
            return Ok(replay);
        }

        let prior = self
            .ledger
            .list_transactions(
                &policy.subsidy_uuid,
                &TransactionFilter::for_policy(policy.uuid)
                    .learner(lms_user_id)
                    .content(content_key),
            )
            .await?;

        if let Some(existing) = prior.live().next() {
            Counters::incr(&self.counters.redemptions_replayed);
            info!(
                component = "policy_engine",
                event = "redeem_replayed",
                transaction_uuid = %existing.uuid,
                "returning existing transaction"
            );
            return Ok(Redemption {
                transaction: existing.clone(),
                created: false,
                assignment: None,
            });
        }

        let plan = match self.evaluate(ctx, policy, lms_user_id, content_key).await? {
            Ok(plan) => plan,
            Err(reason) => {
                warn!(
                    component = "policy_engine",
                    event = "redeem_denied",
                    reason = %reason,
                    "redemption denied"
                );
                return Err(AccessError::NotRedeemable(reason));
            }
        };

        let tx = NewTransaction {
            lms_user_id,
            content_key: content_key.to_string(),
            quantity: -plan.price,
            subsidy_access_policy_uuid: policy.uuid,
            idempotency_key: idempotency_key(&policy.uuid, lms_user_id, content_key, prior.results.len()),
            metadata,
        };

        let created = warn_if_slow(
            "ledger.create_transaction",
            SLOW_COLLABORATOR,
            self.ledger.create_transaction(&policy.subsidy_uuid, &tx),
        )
        .await;

        match created {
            Ok(transaction) => {
                Counters::incr(&self.counters.redemptions);
                let assignment = match plan.assignment {
                    Some(mut a) => {
                        a.state = AssignmentState::Accepted;
                        a.transaction_uuid = Some(transaction.uuid);
                        a.updated_at = ctx.now;
                        self.assignments.save_all(&[], std::slice::from_ref(&a)).await?;
                        Some(a)
                    }
                    None => None,
                };
                info!(
                    component = "policy_engine",
                    event = "redeemed",
                    transaction_uuid = %transaction.uuid,
                    quantity = tx.quantity,
                    "redemption committed to ledger"
                );
                Ok(Redemption {
                    transaction,
                    created: true,
                    assignment,
                })
            }
            Err(e) => {
                Counters::incr(&self.counters.redemption_failures);
                tracing::error!(
                    component = "policy_engine",
                    event = "redeem_failed",
                    error = %e,
                    "ledger rejected transaction"
                );
                if let Some(mut a) = plan.assignment {
                    a.state = AssignmentState::Errored;
                    a.updated_at = ctx.now;
                    self.assignments.save_all(&[], std::slice::from_ref(&a)).await?;
                }
                Err(e.into())
            }
        }
    }

    /// An ACCEPTED assignment already names its debit. Returns that
    /// transaction when the ledger still holds it live.
    async fn accepted_assignment_replay(
        &self,
        policy: &SubsidyAccessPolicy,
        lms_user_id: i64,
        content_key: &str,
    ) -> Result<Option<Redemption>, AccessError> {
        let (AccessMethod::Assigned, Some(config)) =
            (policy.access_method, policy.assignment_configuration_uuid)
        else {
            return Ok(None);
        };
        let Some(assignment) = self
            .assignments
            .find_for_lms_user(&config, lms_user_id, content_key)
            .await?
        else {
            return Ok(None);
        };
        let (AssignmentState::Accepted, Some(transaction_uuid)) =
            (assignment.state, assignment.transaction_uuid)
        else {
            return Ok(None);
        };

        let found = warn_if_slow(
            "ledger.retrieve_transaction",
            SLOW_COLLABORATOR,
            self.ledger
                .retrieve_transaction(&policy.subsidy_uuid, &transaction_uuid),
        )
        .await?;

        match found {
            Some(transaction) if transaction.is_live() => {
                Counters::incr(&self.counters.redemptions_replayed);
                info!(
                    component = "policy_engine",
                    event = "redeem_replayed",
                    transaction_uuid = %transaction.uuid,
                    assignment_uuid = %assignment.uuid,
                    "assignment already redeemed"
                );
                Ok(Some(Redemption {
                    transaction,
                    created: false,
                    assignment: Some(assignment),
                }))
            }
            Some(_) => Ok(None),
            None => {
                warn!(
                    component = "policy_engine",
                    assignment_uuid = %assignment.uuid,
                    %transaction_uuid,
                    "accepted assignment names a transaction the ledger does not have"
                );
                Ok(None)
            }
        }
    }

    /// Every redeemable-candidate policy of the customer, evaluated for one
    /// learner and content. Collaborator timeouts and 5xx bucket the policy
    /// under `SERVICE_UNAVAILABLE` instead of failing the whole evaluation.
    pub async fn evaluate_policies(
        &self,
        ctx: &RequestContext,
        enterprise_customer_uuid: &Uuid,
        lms_user_id: i64,
        content_key: &str,
    ) -> Result<PolicyEvaluation, AccessError> {
        let policies = self.policies.list_redeemable(enterprise_customer_uuid).await?;
        self.evaluate_each(ctx, policies, lms_user_id, content_key).await
    }

    async fn evaluate_each(
        &self,
        ctx: &RequestContext,
        policies: Vec<SubsidyAccessPolicy>,
        lms_user_id: i64,
        content_key: &str,
    ) -> Result<PolicyEvaluation, AccessError> {
        let mut out = PolicyEvaluation::default();
        for policy in policies {
            let verdict = match self.evaluate(ctx, &policy, lms_user_id, content_key).await {
                Ok(v) => v,
                Err(AccessError::Client(e)) if e.is_transient() => {
                    tracing::error!(
                        component = "policy_engine",
                        policy_uuid = %policy.uuid,
                        error = %e,
                        "collaborator failed during evaluation"
                    );
                    Err(RedemptionReason::ServiceUnavailable)
                }
                Err(e) => return Err(e),
            };
            match verdict {
                Ok(plan) => out.redeemable.push((policy, plan.subsidy_balance, plan.price)),
                Err(reason) => out.buckets.entry(reason).or_default().push(policy.uuid),
            }
        }
        Ok(out)
    }

    /// Policies the learner can redeem `content_key` against, best first.
    pub async fn redeemable_policies(
        &self,
        ctx: &RequestContext,
        enterprise_customer_uuid: &Uuid,
        lms_user_id: i64,
        content_key: &str,
    ) -> Result<Vec<SubsidyAccessPolicy>, AccessError> {
        let mut eval = self
            .evaluate_policies(ctx, enterprise_customer_uuid, lms_user_id, content_key)
            .await?;
        eval.redeemable
            .sort_by_key(|(p, balance, _)| (p.priority(), *balance));
        Ok(eval.redeemable.into_iter().map(|(p, _, _)| p).collect())
    }

    /// Per content key: prior successful redemptions, or else the resolved
    /// policy and the reasons every other policy was rejected.
    #[instrument(
        skip(self, ctx, content_keys),
        target = "policy_engine",
        fields(trace_id = %ctx.trace_id, keys = content_keys.len())
    )]
    pub async fn can_redeem_for_contents(
        &self,
        ctx: &RequestContext,
        enterprise_customer_uuid: &Uuid,
        lms_user_id: i64,
        content_keys: &[String],
    ) -> Result<Vec<ContentRedeemability>, AccessError> {
        let policies = self.policies.list_redeemable(enterprise_customer_uuid).await?;
        let mut out = Vec::with_capacity(content_keys.len());

        for content_key in content_keys {
            let mut redemptions = Vec::new();
            for policy in &policies {
                match self
                    .ledger
                    .list_transactions(
                        &policy.subsidy_uuid,
                        &TransactionFilter::for_policy(policy.uuid)
                            .learner(lms_user_id)
                            .content(content_key.clone()),
                    )
                    .await
                {
                    Ok(list) => redemptions.extend(list.results.into_iter().filter(|t| t.is_successful())),
                    Err(e) => warn!(policy_uuid = %policy.uuid, error = %e, "redemption lookup failed"),
                }
            }

            if !redemptions.is_empty() {
                debug!(content_key = %content_key, "learner already redeemed; skipping evaluation");
                out.push(ContentRedeemability {
                    content_key: content_key.clone(),
                    list_price: None,
                    has_successful_redemption: true,
                    redemptions,
                    redeemable_subsidy_access_policy: None,
                    can_redeem: false,
                    reasons: Vec::new(),
                });
                continue;
            }

            let eval = self
                .evaluate_each(ctx, policies.clone(), lms_user_id, content_key)
                .await?;
            let resolved = eval.resolve().cloned();
            let reasons = if resolved.is_some() {
                Vec::new()
            } else {
                self.reasons.explain(enterprise_customer_uuid, &eval.buckets).await
            };

            out.push(ContentRedeemability {
                content_key: content_key.clone(),
                list_price: eval.resolved_price().map(ListPrice::from_cents),
                redemptions,
                has_successful_redemption: false,
                can_redeem: resolved.is_some(),
                redeemable_subsidy_access_policy: resolved,
                reasons,
            });
        }
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------------

    /// Pre-flight for bulk assignment. `content_quantity` is the per-learner
    /// debit and must be strictly negative. Price problems are errors;
    /// budget problems are `Denied`.
    #[instrument(
        skip(self, ctx, policy),
        target = "policy_engine",
        fields(policy_uuid = %policy.uuid, trace_id = %ctx.trace_id)
    )]
    pub async fn can_allocate(
        &self,
        ctx: &RequestContext,
        policy: &SubsidyAccessPolicy,
        learner_count: usize,
        content_key: &str,
        content_quantity: i64,
    ) -> Result<RedeemCheck, AccessError> {
        use RedemptionReason as R;

        let price = PriceValidator::debit_to_price(content_quantity)?;

        if !policy.is_redemption_enabled() {
            return Ok(RedeemCheck::Denied(R::PolicyExpired));
        }
        if !policy.is_assignable() {
            return Err(AccessError::InvalidInput(format!(
                "policy {} does not support allocation",
                policy.uuid
            )));
        }

        if !self
            .catalog
            .contains_content(&policy.catalog_uuid, content_key)
            .await?
        {
            return Ok(RedeemCheck::Denied(R::ContentNotInCatalog));
        }

        let canonical = self.canonical_price(policy, content_key).await?;
        self.prices.validate(price, canonical)?;

        let subsidy = self.subsidy(policy).await?;
        if !subsidy.is_within_window(&ctx.now) {
            return Ok(RedeemCheck::Denied(R::PolicyExpired));
        }
        if !subsidy.is_active {
            return Ok(RedeemCheck::Denied(R::SubsidyExpired));
        }

        let requested = price.saturating_mul(learner_count as i64);
        let allocated = self.allocated(policy).await?;

        // Spend still available to the policy: the limit's headroom, capped
        // by what the subsidy holds. The ledger balance is already net of
        // committed spend.
        let available = match policy.spend_limit {
            Some(limit) => {
                let spent = self.spent(policy).await?;
                limit.saturating_sub(spent).min(subsidy.current_balance)
            }
            None => subsidy.current_balance,
        };
        if allocated.saturating_add(requested) > available {
            debug!(allocated, requested, available, "allocation does not fit");
            let reason = if policy.spend_limit.is_some() {
                R::PolicySpendLimitReached
            } else {
                R::NotEnoughValueInSubsidy
            };
            return Ok(RedeemCheck::Denied(reason));
        }

        Ok(RedeemCheck::Redeemable)
    }

    /// `can_allocate` then the allocator, under the policy lock.
    pub async fn allocate(
        &self,
        ctx: &RequestContext,
        policy_uuid: &Uuid,
        learners: &[Learner],
        content_key: &str,
        content_quantity: i64,
    ) -> Result<AllocationResult, AccessError> {
        annotate_span(Some(policy_uuid), None);
        let policy = self.policy(policy_uuid).await?;
        self.locked(policy_uuid, async {
            self.allocate_while_locked(ctx, &policy, learners, content_key, content_quantity)
                .await
        })
        .await
    }

    /// The caller must hold the policy lock.
    pub async fn allocate_while_locked(
        &self,
        ctx: &RequestContext,
        policy: &SubsidyAccessPolicy,
        learners: &[Learner],
        content_key: &str,
        content_quantity: i64,
    ) -> Result<AllocationResult, AccessError> {
        let check = self
            .can_allocate(ctx, policy, learners.len(), content_key, content_quantity)
            .await?;
        if let RedeemCheck::Denied(reason) = check {
            warn!(
                component = "policy_engine",
                event = "allocation_denied",
                policy_uuid = %policy.uuid,
                reason = %reason,
                "allocation denied"
            );
            return Err(AccessError::NotRedeemable(reason));
        }

        let Some(config) = policy.assignment_configuration_uuid else {
            return Err(AccessError::Allocation(format!(
                "policy {} has no assignment configuration",
                policy.uuid
            )));
        };

        let result = allocate_assignments(
            self.assignments.as_ref(),
            &config,
            learners,
            content_key,
            content_quantity,
            ctx.now,
        )
        .await?;
        Counters::incr(&self.counters.allocations);
        Ok(result)
    }

    // ---------------------------------------------------------------------
    // Administration
    // ---------------------------------------------------------------------

    /// Deactivates and hides the policy; the prior state goes to the change log.
    #[instrument(skip(self, ctx), target = "policy_engine", fields(trace_id = %ctx.trace_id))]
    pub async fn soft_delete(
        &self,
        ctx: &RequestContext,
        policy_uuid: &Uuid,
        reason: Option<&str>,
    ) -> Result<SubsidyAccessPolicy, AccessError> {
        let mut policy = self.policy(policy_uuid).await?;
        let entry = ChangeEntry::capture(
            "subsidy_access_policy",
            policy.uuid,
            Some(&ctx.actor_label()),
            reason,
            &policy,
            ctx.now,
        )?;

        policy.active = false;
        policy.deleted_at = Some(ctx.now);
        self.policies.update(&policy).await?;
        self.history.record(&entry).await?;

        info!(policy_uuid = %policy.uuid, actor = %ctx.actor.email, "policy soft-deleted");
        Ok(policy)
    }
}

/// Maps a non-redeemable assignment state to the learner-facing reason.
fn assignment_denial(state: AssignmentState) -> Option<RedemptionReason> {
    match state {
        AssignmentState::Allocated => None,
        AssignmentState::Accepted => Some(RedemptionReason::LearnerNotAssignedContent),
        AssignmentState::Cancelled => Some(RedemptionReason::LearnerAssignmentCancelled),
        AssignmentState::Errored => Some(RedemptionReason::LearnerAssignmentFailed),
        AssignmentState::Expired => Some(RedemptionReason::LearnerAssignmentExpired),
        AssignmentState::Reversed => Some(RedemptionReason::LearnerAssignmentReversed),
    }
}

fn idempotency_key(policy_uuid: &Uuid, lms_user_id: i64, content_key: &str, attempt: usize) -> String {
    format!("ledger-for-policy-{policy_uuid}-learner-{lms_user_id}-content-{content_key}-attempt-{attempt}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_states_map_to_distinct_reasons() {
        assert_eq!(assignment_denial(AssignmentState::Allocated), None);
        assert_eq!(
            assignment_denial(AssignmentState::Cancelled),
            Some(RedemptionReason::LearnerAssignmentCancelled)
        );
        assert_eq!(
            assignment_denial(AssignmentState::Errored),
            Some(RedemptionReason::LearnerAssignmentFailed)
        );
        assert_eq!(
            assignment_denial(AssignmentState::Reversed),
            Some(RedemptionReason::LearnerAssignmentReversed)
        );
    }

    #[test]
    fn idempotency_key_changes_per_attempt() {
        let p = Uuid::new_v4();
        let a = idempotency_key(&p, 7, "course-a", 0);
        let b = idempotency_key(&p, 7, "course-a", 1);
        assert_ne!(a, b);
        assert!(a.ends_with("-attempt-0"));
    }

    #[test]
    fn list_price_carries_dollars_and_cents() {
        let p = ListPrice::from_cents(19_950);
        assert_eq!(p.usd_cents, 19_950);
        assert!((p.usd - 199.5).abs() < f64::EPSILON);
    }
}
