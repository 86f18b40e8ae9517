//! Side effects of state transitions (notifications, learner unlinking),
//! queued explicitly by the transition that causes them and drained by
//! [`TaskWorker`].

use std::sync::Arc;

use common::logger::child_span;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{Instrument, error, info, instrument, warn};
use uuid::Uuid;

use crate::clients::LmsClient;
use crate::requests::model::{ActionErrorReason, ActionType, RequestAction};
use crate::requests::repository::RequestRepository;
use crate::time::now_utc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    NotifyAdminsOfNewRequest {
        request_uuid: Uuid,
        enterprise_customer_uuid: Uuid,
    },
    SendApprovalNotification {
        request_uuid: Uuid,
        assignment_uuid: Uuid,
    },
    SendDeclineNotification {
        request_uuid: Uuid,
    },
    SendCancelNotification {
        assignment_uuid: Uuid,
    },
    SendReminder {
        request_uuid: Uuid,
        assignment_uuid: Uuid,
    },
    UnlinkLearnerFromEnterprise {
        request_uuid: Uuid,
        enterprise_customer_uuid: Uuid,
        lms_user_id: i64,
    },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::NotifyAdminsOfNewRequest { .. } => "notify_admins_of_new_request",
            Task::SendApprovalNotification { .. } => "send_approval_notification",
            Task::SendDeclineNotification { .. } => "send_decline_notification",
            Task::SendCancelNotification { .. } => "send_cancel_notification",
            Task::SendReminder { .. } => "send_reminder",
            Task::UnlinkLearnerFromEnterprise { .. } => "unlink_learner_from_enterprise",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TaskQueueError {
    #[error("task queue full")]
    Full,

    #[error("task queue closed")]
    Closed,
}

pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: Task) -> Result<(), TaskQueueError>;
}

/// Fire-and-forget: a full or closed queue is logged, never surfaced to the
/// transition that produced the task.
pub fn enqueue_or_log(queue: &dyn TaskQueue, task: Task) {
    let name = task.name();
    if let Err(e) = queue.enqueue(task) {
        error!(task = name, error = %e, "failed to enqueue task");
    }
}

/// Bounded in-process queue.
#[derive(Clone)]
pub struct ChannelTaskQueue {
    tx: mpsc::Sender<Task>,
}

impl ChannelTaskQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Task>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl TaskQueue for ChannelTaskQueue {
    fn enqueue(&self, task: Task) -> Result<(), TaskQueueError> {
        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TaskQueueError::Full,
            mpsc::error::TrySendError::Closed(_) => TaskQueueError::Closed,
        })
    }
}

pub struct TaskWorker {
    lms: Arc<dyn LmsClient>,
    requests: Arc<dyn RequestRepository>,
}

impl TaskWorker {
    pub fn new(lms: Arc<dyn LmsClient>, requests: Arc<dyn RequestRepository>) -> Self {
        Self { lms, requests }
    }

    /// Drains until every sender is dropped.
    pub async fn run(self, mut rx: mpsc::Receiver<Task>) {
        while let Some(task) = rx.recv().await {
            self.handle(task).instrument(child_span("task_worker")).await;
        }
        info!("task worker stopped");
    }

    #[instrument(skip(self, task), fields(task = task.name()))]
    pub async fn handle(&self, task: Task) {
        match task {
            Task::UnlinkLearnerFromEnterprise {
                request_uuid,
                enterprise_customer_uuid,
                lms_user_id,
            } => {
                self.unlink(request_uuid, enterprise_customer_uuid, lms_user_id)
                    .await
            }
            // Delivery belongs to the messaging service; record that the
            // trigger fired.
            other => info!(payload = ?other, "notification task dispatched"),
        }
    }

    async fn unlink(&self, request_uuid: Uuid, enterprise_uuid: Uuid, lms_user_id: i64) {
        let Err(e) = self
            .lms
            .unlink_users_from_enterprise(&enterprise_uuid, &[lms_user_id])
            .await
        else {
            info!(lms_user_id, "learner unlinked after decline");
            return;
        };

        warn!(lms_user_id, error = %e, "failed to unlink learner after decline");

        let request = match self.requests.fetch_by_id(&request_uuid).await {
            Ok(Some(r)) => r,
            Ok(None) => return,
            Err(fetch_err) => {
                error!(error = %fetch_err, "could not load request to record unlink failure");
                return;
            }
        };

        let action = RequestAction::failure(
            &request,
            ActionType::Declined,
            ActionErrorReason::FailedDecline,
            format!("ClientError: {e}"),
            now_utc(),
        );
        if let Err(append_err) = self.requests.append_action(&action).await {
            error!(error = %append_err, "failed to record unlink failure");
        }
    }
}
