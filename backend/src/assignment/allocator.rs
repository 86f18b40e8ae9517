//! Turns "these learners should get this content at this price" into
//! assignment rows. The caller must hold the policy lock; nothing here locks.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::assignment::model::{AssignmentState, LearnerContentAssignment};
use crate::assignment::repository::AssignmentRepository;
use crate::error::AccessError;
use crate::tasks::{Task, TaskQueue, enqueue_or_log};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Learner {
    pub email: String,
    pub lms_user_id: Option<i64>,
}

impl Learner {
    pub fn by_email(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            lms_user_id: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AllocationResult {
    pub updated: Vec<LearnerContentAssignment>,
    pub created: Vec<LearnerContentAssignment>,
    pub no_change: Vec<LearnerContentAssignment>,
}

impl AllocationResult {
    /// The row now representing `email`, whichever bucket it landed in.
    pub fn assignment_for(&self, email: &str) -> Option<&LearnerContentAssignment> {
        self.updated
            .iter()
            .chain(&self.created)
            .chain(&self.no_change)
            .find(|a| a.learner_email == email)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CancellationResult {
    pub cancelled: Vec<LearnerContentAssignment>,
    pub non_cancelable: Vec<Uuid>,
}

/// Creates, reallocates or reprices one assignment per learner. Never
/// writes two rows for the same learner, content and configuration.
#[instrument(
    skip(repo, learners),
    target = "allocator",
    fields(configuration = %configuration_uuid, learners = learners.len())
)]
pub async fn allocate_assignments(
    repo: &dyn AssignmentRepository,
    configuration_uuid: &Uuid,
    learners: &[Learner],
    content_key: &str,
    content_quantity: i64,
    now: DateTime<Utc>,
) -> Result<AllocationResult, AccessError> {
    if content_quantity >= 0 {
        return Err(AccessError::Allocation(format!(
            "content_quantity must be a negative debit, got {content_quantity}"
        )));
    }

    let mut seen = HashSet::new();
    let learners: Vec<&Learner> = learners
        .iter()
        .filter(|l| seen.insert(l.email.clone()))
        .collect();
    let emails: Vec<String> = learners.iter().map(|l| l.email.clone()).collect();

    let existing = repo
        .find_for_learners(configuration_uuid, &emails, content_key)
        .await?;

    let mut result = AllocationResult::default();
    for learner in learners {
        let Some(current) = existing.iter().find(|a| a.learner_email == learner.email) else {
            result.created.push(LearnerContentAssignment::allocated(
                *configuration_uuid,
                &learner.email,
                learner.lms_user_id,
                content_key,
                content_quantity,
                now,
            ));
            continue;
        };

        let mut row = current.clone();
        match row.state {
            s if s.is_reusable() || s == AssignmentState::Errored => {
                row.reallocate(content_quantity, learner.lms_user_id, now);
                result.updated.push(row);
            }
            AssignmentState::Allocated if row.content_quantity != content_quantity => {
                row.content_quantity = content_quantity;
                if learner.lms_user_id.is_some() {
                    row.lms_user_id = learner.lms_user_id;
                }
                row.updated_at = now;
                result.updated.push(row);
            }
            _ => result.no_change.push(row),
        }
    }

    repo.save_all(&result.created, &result.updated).await?;

    info!(
        created = result.created.len(),
        updated = result.updated.len(),
        no_change = result.no_change.len(),
        "assignments allocated"
    );
    Ok(result)
}

/// Cancels ALLOCATED/ERRORED assignments; already-cancelled rows count as
/// cancelled. Anything else is reported in `non_cancelable`, including rows
/// that left a cancelable state after the caller read them.
#[instrument(skip_all, target = "allocator", fields(count = assignments.len(), notify))]
pub async fn cancel_assignments(
    repo: &dyn AssignmentRepository,
    tasks: &dyn TaskQueue,
    assignments: &[LearnerContentAssignment],
    notify: bool,
    now: DateTime<Utc>,
) -> Result<CancellationResult, AccessError> {
    let mut result = CancellationResult::default();
    let mut candidates = Vec::new();

    for a in assignments {
        match a.state {
            AssignmentState::Cancelled => result.cancelled.push(a.clone()),
            s if s.is_cancelable() => candidates.push(a),
            _ => {
                debug!(assignment = %a.uuid, state = %a.state, "assignment not cancelable");
                result.non_cancelable.push(a.uuid);
            }
        }
    }

    let uuids: Vec<Uuid> = candidates.iter().map(|a| a.uuid).collect();
    let moved = repo.cancel_cancelable(&uuids, now).await?;

    for a in candidates {
        if !moved.contains(&a.uuid) {
            debug!(assignment = %a.uuid, "assignment changed state before it could be cancelled");
            result.non_cancelable.push(a.uuid);
            continue;
        }
        let mut row = a.clone();
        row.state = AssignmentState::Cancelled;
        row.updated_at = now;
        if notify {
            enqueue_or_log(
                tasks,
                Task::SendCancelNotification {
                    assignment_uuid: row.uuid,
                },
            );
        }
        result.cancelled.push(row);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory repo keyed by uuid; mirrors the unique triple constraint.
    #[derive(Default)]
    struct MockAssignmentRepository {
        rows: Mutex<HashMap<Uuid, LearnerContentAssignment>>,
        saves: Mutex<usize>,
    }

    impl MockAssignmentRepository {
        fn seed(&self, a: LearnerContentAssignment) {
            self.rows.lock().insert(a.uuid, a);
        }

        fn count_triple(&self, cfg: &Uuid, email: &str, key: &str) -> usize {
            self.rows
                .lock()
                .values()
                .filter(|a| {
                    a.assignment_configuration_uuid == *cfg
                        && a.learner_email == email
                        && a.content_key == key
                })
                .count()
        }
    }

    #[async_trait]
    impl AssignmentRepository for MockAssignmentRepository {
        async fn fetch_by_id(&self, uuid: &Uuid) -> anyhow::Result<Option<LearnerContentAssignment>> {
            Ok(self.rows.lock().get(uuid).cloned())
        }

        async fn find_for_learners(
            &self,
            cfg: &Uuid,
            emails: &[String],
            key: &str,
        ) -> anyhow::Result<Vec<LearnerContentAssignment>> {
            Ok(self
                .rows
                .lock()
                .values()
                .filter(|a| {
                    a.assignment_configuration_uuid == *cfg
                        && a.content_key == key
                        && emails.contains(&a.learner_email)
                })
                .cloned()
                .collect())
        }

        async fn find_for_lms_user(
            &self,
            cfg: &Uuid,
            lms_user_id: i64,
            key: &str,
        ) -> anyhow::Result<Option<LearnerContentAssignment>> {
            Ok(self
                .rows
                .lock()
                .values()
                .find(|a| {
                    a.assignment_configuration_uuid == *cfg
                        && a.lms_user_id == Some(lms_user_id)
                        && a.content_key == key
                })
                .cloned())
        }

        async fn allocated_quantity(&self, cfg: &Uuid) -> anyhow::Result<i64> {
            Ok(self
                .rows
                .lock()
                .values()
                .filter(|a| {
                    a.assignment_configuration_uuid == *cfg && a.state == AssignmentState::Allocated
                })
                .map(|a| a.content_quantity)
                .sum())
        }

        async fn save_all(
            &self,
            created: &[LearnerContentAssignment],
            updated: &[LearnerContentAssignment],
        ) -> anyhow::Result<()> {
            *self.saves.lock() += 1;
            let mut rows = self.rows.lock();
            for a in created.iter().chain(updated) {
                rows.insert(a.uuid, a.clone());
            }
            Ok(())
        }

        async fn cancel_cancelable(
            &self,
            uuids: &[Uuid],
            now: DateTime<Utc>,
        ) -> anyhow::Result<Vec<Uuid>> {
            let mut rows = self.rows.lock();
            let mut moved = Vec::new();
            for uuid in uuids {
                if let Some(a) = rows.get_mut(uuid).filter(|a| a.state.is_cancelable()) {
                    a.state = AssignmentState::Cancelled;
                    a.updated_at = now;
                    moved.push(*uuid);
                }
            }
            Ok(moved)
        }
    }

    #[derive(Default)]
    struct RecordingQueue {
        tasks: Mutex<Vec<Task>>,
    }

    impl TaskQueue for RecordingQueue {
        fn enqueue(&self, task: Task) -> Result<(), crate::tasks::TaskQueueError> {
            self.tasks.lock().push(task);
            Ok(())
        }
    }

    fn mk_assignment(cfg: Uuid, email: &str, state: AssignmentState, qty: i64) -> LearnerContentAssignment {
        let mut a = LearnerContentAssignment::allocated(cfg, email, None, "course-a", qty, Utc::now());
        a.state = state;
        a
    }

    #[tokio::test]
    async fn classifies_created_updated_and_no_change() {
        let repo = MockAssignmentRepository::default();
        let cfg = Uuid::new_v4();
        repo.seed(mk_assignment(cfg, "same@x.org", AssignmentState::Allocated, -100));
        repo.seed(mk_assignment(cfg, "reprice@x.org", AssignmentState::Allocated, -90));
        repo.seed(mk_assignment(cfg, "done@x.org", AssignmentState::Accepted, -100));
        repo.seed(mk_assignment(cfg, "failed@x.org", AssignmentState::Errored, -100));

        let learners: Vec<Learner> = ["same@x.org", "reprice@x.org", "done@x.org", "failed@x.org", "new@x.org"]
            .into_iter()
            .map(Learner::by_email)
            .collect();

        let res = allocate_assignments(&repo, &cfg, &learners, "course-a", -100, Utc::now())
            .await
            .unwrap();

        let emails = |v: &[LearnerContentAssignment]| {
            let mut e: Vec<String> = v.iter().map(|a| a.learner_email.clone()).collect();
            e.sort();
            e
        };
        assert_eq!(emails(&res.created), vec!["new@x.org"]);
        assert_eq!(emails(&res.updated), vec!["failed@x.org", "reprice@x.org"]);
        assert_eq!(emails(&res.no_change), vec!["done@x.org", "same@x.org"]);
        assert!(res.updated.iter().all(|a| a.state == AssignmentState::Allocated));
        assert_eq!(repo.allocated_quantity(&cfg).await.unwrap(), -400);
    }

    #[tokio::test]
    async fn reallocating_reusable_rows_never_adds_rows() {
        let repo = MockAssignmentRepository::default();
        let cfg = Uuid::new_v4();
        for state in [AssignmentState::Cancelled, AssignmentState::Expired, AssignmentState::Reversed] {
            let mut a = mk_assignment(cfg, "again@x.org", state, -100);
            a.transaction_uuid = Some(Uuid::new_v4());
            repo.rows.lock().clear();
            repo.seed(a.clone());

            for _ in 0..3 {
                let res = allocate_assignments(
                    &repo,
                    &cfg,
                    &[Learner::by_email("again@x.org")],
                    "course-a",
                    -150,
                    Utc::now(),
                )
                .await
                .unwrap();
                let row = res.assignment_for("again@x.org").unwrap();
                assert_eq!(row.uuid, a.uuid);
                assert_eq!(row.transaction_uuid, None);
            }
            assert_eq!(repo.count_triple(&cfg, "again@x.org", "course-a"), 1);
        }
    }

    #[tokio::test]
    async fn duplicate_emails_in_one_call_produce_one_row() {
        let repo = MockAssignmentRepository::default();
        let cfg = Uuid::new_v4();
        let learners = vec![Learner::by_email("dup@x.org"), Learner::by_email("dup@x.org")];

        let res = allocate_assignments(&repo, &cfg, &learners, "course-a", -10, Utc::now())
            .await
            .unwrap();
        assert_eq!(res.created.len(), 1);
        assert_eq!(repo.count_triple(&cfg, "dup@x.org", "course-a"), 1);
    }

    #[tokio::test]
    async fn non_debit_quantities_are_rejected_before_touching_storage() {
        let repo = MockAssignmentRepository::default();
        for qty in [0, 5] {
            let err = allocate_assignments(
                &repo,
                &Uuid::new_v4(),
                &[Learner::by_email("a@x.org")],
                "course-a",
                qty,
                Utc::now(),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, AccessError::Allocation(_)));
        }
        assert_eq!(*repo.saves.lock(), 0);
    }

    #[tokio::test]
    async fn cancel_reports_accepted_rows_and_notifies_cancelled_ones() {
        let repo = MockAssignmentRepository::default();
        let queue = RecordingQueue::default();
        let cfg = Uuid::new_v4();
        let allocated = mk_assignment(cfg, "a@x.org", AssignmentState::Allocated, -100);
        let errored = mk_assignment(cfg, "b@x.org", AssignmentState::Errored, -100);
        let already = mk_assignment(cfg, "c@x.org", AssignmentState::Cancelled, -100);
        let accepted = mk_assignment(cfg, "d@x.org", AssignmentState::Accepted, -100);
        for a in [&allocated, &errored, &already, &accepted] {
            repo.seed(a.clone());
        }

        let res = cancel_assignments(
            &repo,
            &queue,
            &[allocated.clone(), errored.clone(), already.clone(), accepted.clone()],
            true,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(res.cancelled.len(), 3);
        assert_eq!(res.non_cancelable, vec![accepted.uuid]);
        assert_eq!(
            repo.fetch_by_id(&allocated.uuid).await.unwrap().unwrap().state,
            AssignmentState::Cancelled
        );
        // Already-cancelled rows are not re-notified.
        assert_eq!(queue.tasks.lock().len(), 2);
    }

    #[tokio::test]
    async fn cancel_leaves_rows_accepted_since_they_were_read() {
        let repo = MockAssignmentRepository::default();
        let queue = RecordingQueue::default();
        let cfg = Uuid::new_v4();
        let read = mk_assignment(cfg, "late@x.org", AssignmentState::Allocated, -100);

        let mut redeemed = read.clone();
        redeemed.state = AssignmentState::Accepted;
        redeemed.transaction_uuid = Some(Uuid::new_v4());
        repo.seed(redeemed.clone());

        let res = cancel_assignments(&repo, &queue, &[read.clone()], true, Utc::now())
            .await
            .unwrap();

        assert!(res.cancelled.is_empty());
        assert_eq!(res.non_cancelable, vec![read.uuid]);
        assert_eq!(repo.fetch_by_id(&read.uuid).await.unwrap(), Some(redeemed));
        assert!(queue.tasks.lock().is_empty());
    }
}
