use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::scheduler::Job;

/// What the submitter of a failed job is told.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub job_id: Uuid,
    pub submitter: Option<String>,
    pub context: Option<String>,
    pub error_line: String,
}

impl Notification {
    pub fn for_failure(job: &Job) -> Self {
        Self {
            job_id: job.id,
            submitter: job.submitter.clone(),
            context: job.context.clone(),
            error_line: job.error.clone().unwrap_or_default(),
        }
    }
}

/// Delivery of failure notices (email, chat). Delivery problems are the
/// implementation's to log; they never affect the job.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notices to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl FailureNotifier for LogNotifier {
    async fn notify(&self, notification: Notification) {
        tracing::warn!(
            job_id = %notification.job_id,
            submitter = notification.submitter.as_deref().unwrap_or("-"),
            context = notification.context.as_deref().unwrap_or("-"),
            error = %notification.error_line,
            "Job failed"
        );
    }
}
