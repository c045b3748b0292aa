//! Line-delimited JSON task feed.
//!
//! Each line is one message:
//!
//! ```text
//! {"type": "submit", "image": "algo:1", "outputs": ["metrics.json"]}
//! {"type": "cancel", "job_id": "6f1c..."}
//! ```
//!
//! Submissions are stored as `PENDING` jobs before their `Created` event is
//! sent, so a dispatch never races the insert.

use std::io;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::{InputRef, Job, JobStore, ResourceRequirements};
use crate::worker::JobEvent;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueueMessage {
    Submit(Submission),
    Cancel { job_id: Uuid },
}

/// A job as the orchestration layer submits it.
#[derive(Debug, Deserialize)]
pub struct Submission {
    /// Assigned by the runner when absent
    #[serde(default)]
    pub job_id: Option<Uuid>,
    pub image: String,
    #[serde(default)]
    pub requirements: ResourceRequirements,
    #[serde(default)]
    pub inputs: Vec<InputRef>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub submitter: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
}

impl Submission {
    pub fn into_job(self) -> Job {
        let mut job = Job::with_id(self.job_id.unwrap_or_else(Uuid::new_v4), self.image)
            .with_requirements(self.requirements);
        job.inputs = self.inputs;
        job.outputs = self.outputs;
        job.submitter = self.submitter;
        job.context = self.context;
        job
    }
}

/// Turn feed lines into [`JobEvent`]s until the feed ends, the worker hangs
/// up or `shutdown` fires. Malformed lines and rejected submissions are
/// logged and skipped. Returns the number of events sent.
pub async fn feed<S>(
    lines: S,
    store: Arc<dyn JobStore>,
    events: mpsc::Sender<JobEvent>,
    shutdown: CancellationToken,
) -> io::Result<usize>
where
    S: Stream<Item = io::Result<String>> + Unpin,
{
    let mut lines = lines;
    let mut sent = 0;
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next() => line,
        };
        let Some(line) = line.transpose()? else {
            tracing::info!(sent, "Task feed closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: QueueMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed task message");
                continue;
            }
        };
        let event = match message {
            QueueMessage::Submit(submission) => {
                let job = submission.into_job();
                let job_id = job.id;
                if let Err(e) = store.insert(job).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Submission rejected");
                    continue;
                }
                JobEvent::Created { job_id }
            }
            QueueMessage::Cancel { job_id } => JobEvent::Cancel { job_id },
        };
        if events.send(event).await.is_err() {
            tracing::debug!("Worker stopped listening");
            break;
        }
        sent += 1;
    }
    Ok(sent)
}
