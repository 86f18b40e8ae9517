//! Learner credit request workflow.
//!
//! Every attempted transition appends exactly one action to the request's
//! log, successful or not. Failed transitions leave the request where it
//! was. Side effects (notifications, unlinking) go through the task queue
//! after the state change is persisted.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::assignment::allocator::{Learner, cancel_assignments};
use crate::assignment::model::AssignmentState;
use crate::context::RequestContext;
use crate::db::is_unique_violation;
use crate::error::AccessError;
use crate::logger::annotate_span;
use crate::metrics::Counters;
use crate::policy::engine::PolicyEngine;
use crate::policy::model::SubsidyAccessPolicy;
use crate::requests::listing::{ListQuery, RequestRow};
use crate::requests::model::{
    ActionErrorReason, ActionType, LearnerCreditRequest, RequestAction, RequestState,
};
use crate::requests::repository::RequestRepository;
use crate::tasks::{Task, TaskQueue, enqueue_or_log};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A cancelled, expired or reversed request was reset in place.
    Reused,
}

#[derive(Clone, Debug)]
pub struct CreateRequestInput {
    pub enterprise_customer_uuid: Uuid,
    pub policy_uuid: Uuid,
    pub course_id: String,
    pub course_price: i64,
}

#[derive(Clone, Debug, Default)]
pub struct DeclineInput {
    pub request_uuid: Uuid,
    pub reason: Option<String>,
    pub send_notification: bool,
    pub disassociate_from_org: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApprovalFailure {
    pub request_uuid: Uuid,
    pub error: String,
    pub detail: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ApprovalReport {
    pub approved: Vec<LearnerCreditRequest>,
    pub failed: Vec<ApprovalFailure>,
}

impl ApprovalReport {
    /// Nothing approved out of a non-empty batch.
    pub fn all_failed(&self) -> bool {
        self.approved.is_empty() && !self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct RequestService {
    requests: Arc<dyn RequestRepository>,
    engine: PolicyEngine,
    tasks: Arc<dyn TaskQueue>,
}

impl RequestService {
    pub fn new(
        requests: Arc<dyn RequestRepository>,
        engine: PolicyEngine,
        tasks: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            requests,
            engine,
            tasks,
        }
    }

    fn counters(&self) -> &Counters {
        self.engine.counters()
    }

    async fn fetch(&self, uuid: &Uuid) -> Result<LearnerCreditRequest, AccessError> {
        self.requests
            .fetch_by_id(uuid)
            .await?
            .ok_or(AccessError::RequestNotFound(*uuid))
    }

    async fn record(&self, action: RequestAction) -> Result<(), AccessError> {
        self.requests.append_action(&action).await?;
        Ok(())
    }

    /// Creates a request for the acting learner, or reuses their last
    /// reusable one for the same course and configuration.
    #[instrument(
        skip(self, ctx, input),
        target = "requests",
        fields(trace_id = %ctx.trace_id, course_id = %input.course_id)
    )]
    pub async fn create(
        &self,
        ctx: &RequestContext,
        input: CreateRequestInput,
    ) -> Result<(LearnerCreditRequest, CreateOutcome), AccessError> {
        annotate_span(Some(&input.policy_uuid), None);

        if input.course_price <= 0 {
            return Err(AccessError::InvalidInput(format!(
                "course_price must be positive, got {}",
                input.course_price
            )));
        }

        let policy = self.engine.policy(&input.policy_uuid).await?;
        if policy.enterprise_customer_uuid != input.enterprise_customer_uuid {
            return Err(AccessError::InvalidInput(
                "policy belongs to another enterprise customer".into(),
            ));
        }
        let Some(config_uuid) = policy.learner_credit_request_config_uuid else {
            return Err(AccessError::InvalidInput(
                "policy does not accept learner credit requests".into(),
            ));
        };
        match self.requests.fetch_config(&config_uuid).await? {
            Some(c) if c.active => {}
            _ => {
                return Err(AccessError::InvalidInput(
                    "learner credit request configuration is not active".into(),
                ));
            }
        }

        let learner = &ctx.actor;
        let existing = self
            .requests
            .find_for_learner(learner.lms_user_id, &input.course_id, &config_uuid)
            .await?;

        if let Some(open) = existing.iter().find(|r| r.state.blocks_new_request()) {
            return Err(AccessError::Conflict(format!(
                "learner already has a {} request {} for {}",
                open.state, open.uuid, input.course_id
            )));
        }

        let (request, outcome) = match existing.into_iter().find(|r| r.state.is_reusable()) {
            Some(mut reusable) => {
                reusable
                    .reuse(input.course_price, ctx.now)
                    .map_err(|e| AccessError::Conflict(e.to_string()))?;
                self.requests.update(&reusable).await?;
                (reusable, CreateOutcome::Reused)
            }
            None => {
                let fresh = LearnerCreditRequest::new(
                    input.enterprise_customer_uuid,
                    config_uuid,
                    learner.lms_user_id,
                    &learner.email,
                    &input.course_id,
                    input.course_price,
                    ctx.now,
                );
                if let Err(e) = self.requests.insert(&fresh).await {
                    if is_unique_violation(&e) {
                        return Err(AccessError::Conflict(format!(
                            "a concurrent request for {} already exists",
                            input.course_id
                        )));
                    }
                    return Err(e.into());
                }
                (fresh, CreateOutcome::Created)
            }
        };

        self.record(RequestAction::success(&request, ActionType::Requested, ctx.now))
            .await?;
        enqueue_or_log(
            self.tasks.as_ref(),
            Task::NotifyAdminsOfNewRequest {
                request_uuid: request.uuid,
                enterprise_customer_uuid: request.enterprise_customer_uuid,
            },
        );

        info!(request_uuid = %request.uuid, outcome = ?outcome, "learner credit request submitted");
        Ok((request, outcome))
    }

    /// Approves a batch under one policy lock. Items are processed in the
    /// order given; a failed item is logged against that request only and
    /// never rolls back earlier approvals.
    #[instrument(
        skip(self, ctx, request_uuids),
        target = "requests",
        fields(trace_id = %ctx.trace_id, batch = request_uuids.len())
    )]
    pub async fn approve(
        &self,
        ctx: &RequestContext,
        policy_uuid: &Uuid,
        request_uuids: &[Uuid],
    ) -> Result<ApprovalReport, AccessError> {
        annotate_span(Some(policy_uuid), None);
        let policy = self.engine.policy(policy_uuid).await?;

        self.engine
            .locked(policy_uuid, async {
                let mut report = ApprovalReport::default();
                for uuid in request_uuids {
                    match self.approve_one(ctx, &policy, uuid).await {
                        Ok(approved) => report.approved.push(approved),
                        Err(failure) => report.failed.push(failure),
                    }
                }
                Ok(report)
            })
            .await
    }

    async fn approve_one(
        &self,
        ctx: &RequestContext,
        policy: &SubsidyAccessPolicy,
        request_uuid: &Uuid,
    ) -> Result<LearnerCreditRequest, ApprovalFailure> {
        let failure = |e: &AccessError| ApprovalFailure {
            request_uuid: *request_uuid,
            error: e.kind().to_string(),
            detail: e.to_string(),
        };

        let mut request = match self.fetch(request_uuid).await {
            Ok(r) => r,
            Err(e) => {
                Counters::incr(&self.counters().approval_failures);
                warn!(request_uuid = %request_uuid, error = %e, "approval skipped");
                return Err(failure(&e));
            }
        };

        match self.try_approve(ctx, policy, &mut request).await {
            Ok(()) => {
                Counters::incr(&self.counters().approvals);
                Ok(request)
            }
            Err(e) => {
                Counters::incr(&self.counters().approval_failures);
                warn!(
                    component = "requests",
                    event = "approval_failed",
                    request_uuid = %request.uuid,
                    error = %e,
                    "request stays {}", request.state
                );
                let action = RequestAction::failure(
                    &request,
                    ActionType::Approved,
                    ActionErrorReason::FailedApproval,
                    e.traceback(),
                    ctx.now,
                );
                if let Err(log_err) = self.record(action).await {
                    tracing::error!(request_uuid = %request.uuid, error = %log_err, "failed to record approval failure");
                }
                Err(failure(&e))
            }
        }
    }

    async fn try_approve(
        &self,
        ctx: &RequestContext,
        policy: &SubsidyAccessPolicy,
        request: &mut LearnerCreditRequest,
    ) -> Result<(), AccessError> {
        if !request.state.is_reviewable() {
            return Err(AccessError::InvalidInput(format!(
                "cannot approve a request in state {}",
                request.state
            )));
        }
        if policy.learner_credit_request_config_uuid != Some(request.learner_credit_request_config_uuid) {
            return Err(AccessError::InvalidInput(format!(
                "request does not belong to policy {}",
                policy.uuid
            )));
        }

        let learner = Learner {
            email: request.learner_email.clone(),
            lms_user_id: Some(request.lms_user_id),
        };
        let allocation = self
            .engine
            .allocate_while_locked(
                ctx,
                policy,
                std::slice::from_ref(&learner),
                &request.course_id,
                -request.course_price,
            )
            .await?;

        let assignment = allocation
            .assignment_for(&learner.email)
            .ok_or_else(|| AccessError::Allocation("allocation returned no assignment".into()))?;
        if assignment.state != AssignmentState::Allocated {
            return Err(AccessError::Allocation(format!(
                "assignment {} is {}, not allocated",
                assignment.uuid, assignment.state
            )));
        }

        let assignment_uuid = assignment.uuid;
        request
            .approve(assignment_uuid, ctx.actor.lms_user_id, ctx.now)
            .map_err(|e| AccessError::InvalidInput(e.to_string()))?;
        self.requests.update(request).await?;
        self.record(RequestAction::success(request, ActionType::Approved, ctx.now))
            .await?;

        enqueue_or_log(
            self.tasks.as_ref(),
            Task::SendApprovalNotification {
                request_uuid: request.uuid,
                assignment_uuid,
            },
        );
        info!(request_uuid = %request.uuid, assignment_uuid = %assignment_uuid, "request approved");
        Ok(())
    }

    #[instrument(skip(self, ctx, input), target = "requests", fields(trace_id = %ctx.trace_id))]
    pub async fn decline(
        &self,
        ctx: &RequestContext,
        input: DeclineInput,
    ) -> Result<LearnerCreditRequest, AccessError> {
        annotate_span(None, Some(&input.request_uuid));

        let Some(mut request) = self.requests.fetch_by_id(&input.request_uuid).await? else {
            return Err(AccessError::InvalidInput(format!(
                "learner credit request {} does not exist",
                input.request_uuid
            )));
        };

        if let Err(e) = request.decline(ctx.actor.lms_user_id, input.reason.clone(), ctx.now) {
            warn!(request_uuid = %request.uuid, error = %e, "decline rejected");
            return Err(AccessError::InvalidInput(e.to_string()));
        }

        self.requests.update(&request).await?;
        self.record(RequestAction::success(&request, ActionType::Declined, ctx.now))
            .await?;
        Counters::incr(&self.counters().declines);

        if input.send_notification {
            enqueue_or_log(
                self.tasks.as_ref(),
                Task::SendDeclineNotification {
                    request_uuid: request.uuid,
                },
            );
        }
        if input.disassociate_from_org {
            enqueue_or_log(
                self.tasks.as_ref(),
                Task::UnlinkLearnerFromEnterprise {
                    request_uuid: request.uuid,
                    enterprise_customer_uuid: request.enterprise_customer_uuid,
                    lms_user_id: request.lms_user_id,
                },
            );
        }

        info!(request_uuid = %request.uuid, "request declined");
        Ok(request)
    }

    /// Only from APPROVED. A non-cancelable assignment leaves the request
    /// APPROVED and records a `failed_cancellation` action.
    #[instrument(skip(self, ctx), target = "requests", fields(trace_id = %ctx.trace_id))]
    pub async fn cancel(
        &self,
        ctx: &RequestContext,
        request_uuid: &Uuid,
    ) -> Result<LearnerCreditRequest, AccessError> {
        annotate_span(None, Some(request_uuid));
        let request = self.fetch(request_uuid).await?;
        let policy = self
            .engine
            .policy_for_request_config(&request.learner_credit_request_config_uuid)
            .await?;
        annotate_span(Some(&policy.uuid), None);

        // Redemption flips the assignment to ACCEPTED under this lock.
        self.engine
            .locked(&policy.uuid, self.cancel_while_locked(ctx, request_uuid))
            .await
    }

    async fn cancel_while_locked(
        &self,
        ctx: &RequestContext,
        request_uuid: &Uuid,
    ) -> Result<LearnerCreditRequest, AccessError> {
        let mut request = self.fetch(request_uuid).await?;

        if request.state != RequestState::Approved {
            return Err(AccessError::InvalidInput(format!(
                "cannot cancel a request in state {}",
                request.state
            )));
        }
        let Some(assignment_uuid) = request.assignment_uuid else {
            return Err(AccessError::Allocation(format!(
                "approved request {} has no assignment",
                request.uuid
            )));
        };

        let assignments = self.engine.assignments();
        let non_cancelable = match assignments.fetch_by_id(&assignment_uuid).await? {
            Some(assignment) => {
                cancel_assignments(
                    assignments.as_ref(),
                    self.tasks.as_ref(),
                    std::slice::from_ref(&assignment),
                    false,
                    ctx.now,
                )
                .await?
                .non_cancelable
            }
            None => vec![assignment_uuid],
        };

        if !non_cancelable.is_empty() {
            Counters::incr(&self.counters().cancellation_failures);
            let traceback = format!(
                "Failed to cancel associated assignment with uuid: {assignment_uuid} for request: {}.",
                request.uuid
            );
            warn!(request_uuid = %request.uuid, %assignment_uuid, "assignment not cancelable");
            self.record(RequestAction::failure(
                &request,
                ActionType::Cancelled,
                ActionErrorReason::FailedCancellation,
                traceback,
                ctx.now,
            ))
            .await?;
            return Err(AccessError::CancellationFailed { non_cancelable });
        }

        request
            .cancel(ctx.actor.lms_user_id, ctx.now)
            .map_err(|e| AccessError::InvalidInput(e.to_string()))?;
        self.requests.update(&request).await?;
        self.record(RequestAction::success(&request, ActionType::Cancelled, ctx.now))
            .await?;
        Counters::incr(&self.counters().cancellations);

        enqueue_or_log(
            self.tasks.as_ref(),
            Task::SendCancelNotification { assignment_uuid },
        );
        info!(request_uuid = %request.uuid, "request cancelled");
        Ok(request)
    }

    /// Nudges the learner about an approved request they have not redeemed.
    pub async fn remind(
        &self,
        ctx: &RequestContext,
        request_uuid: &Uuid,
    ) -> Result<LearnerCreditRequest, AccessError> {
        let request = self.fetch(request_uuid).await?;
        let (RequestState::Approved, Some(assignment_uuid)) = (request.state, request.assignment_uuid) else {
            return Err(AccessError::InvalidInput(format!(
                "cannot remind on a request in state {}",
                request.state
            )));
        };

        self.record(RequestAction::success(&request, ActionType::Reminded, ctx.now))
            .await?;
        enqueue_or_log(
            self.tasks.as_ref(),
            Task::SendReminder {
                request_uuid: request.uuid,
                assignment_uuid,
            },
        );
        Ok(request)
    }

    /// System marking into ERROR. Approval failures never call this.
    pub async fn mark_errored(
        &self,
        ctx: &RequestContext,
        request_uuid: &Uuid,
        traceback: Option<String>,
    ) -> Result<LearnerCreditRequest, AccessError> {
        let mut request = self.fetch(request_uuid).await?;
        request
            .mark_error(ctx.now)
            .map_err(|e| AccessError::InvalidInput(e.to_string()))?;
        self.requests.update(&request).await?;

        let mut action = RequestAction::success(&request, ActionType::Error, ctx.now);
        action.traceback = traceback;
        self.record(action).await?;

        warn!(request_uuid = %request.uuid, actor = %ctx.actor.email, "request marked errored");
        Ok(request)
    }

    /// Carries an assignment's ACCEPTED / EXPIRED / REVERSED state onto the
    /// request that produced it. Returns the request when it moved.
    pub async fn sync_from_assignment(
        &self,
        ctx: &RequestContext,
        assignment_uuid: &Uuid,
    ) -> Result<Option<LearnerCreditRequest>, AccessError> {
        let Some(assignment) = self.engine.assignments().fetch_by_id(assignment_uuid).await? else {
            return Ok(None);
        };
        let Some(mut request) = self.requests.find_by_assignment(assignment_uuid).await? else {
            return Ok(None);
        };

        let (moved, action) = match assignment.state {
            AssignmentState::Accepted => (request.mark_accepted(ctx.now), ActionType::Accepted),
            AssignmentState::Expired => (request.mark_expired(ctx.now), ActionType::Expired),
            AssignmentState::Reversed => (request.mark_reversed(ctx.now), ActionType::Reversed),
            _ => return Ok(None),
        };
        if let Err(e) = moved {
            debug!(request_uuid = %request.uuid, error = %e, "request already in sync");
            return Ok(None);
        }

        self.requests.update(&request).await?;
        self.record(RequestAction::success(&request, action, ctx.now))
            .await?;
        Ok(Some(request))
    }

    pub async fn list(
        &self,
        enterprise_customer_uuid: &Uuid,
        query: &ListQuery,
    ) -> Result<Vec<RequestRow>, AccessError> {
        let requests = self.requests.list_for_enterprise(enterprise_customer_uuid).await?;
        let uuids: Vec<Uuid> = requests.iter().map(|r| r.uuid).collect();
        let latest = self.requests.latest_actions(&uuids).await?;

        let rows = requests
            .into_iter()
            .map(|request| {
                let latest_action = latest
                    .iter()
                    .find(|a| a.learner_credit_request_uuid == request.uuid)
                    .cloned();
                RequestRow {
                    request,
                    latest_action,
                }
            })
            .collect();
        Ok(query.apply(rows))
    }

    pub async fn actions(&self, request_uuid: &Uuid) -> Result<Vec<RequestAction>, AccessError> {
        self.fetch(request_uuid).await?;
        Ok(self.requests.actions_for(request_uuid).await?)
    }
}
