//! Task-queue consumer.
//!
//! The orchestration layer announces work with explicit [`JobEvent`]s instead
//! of save hooks. The worker runs one task per in-flight job:
//!
//! 1. `Created` spawns a dispatch of the job
//! 2. `Cancel` asks the dispatcher to cancel it
//! 3. On shutdown in-flight runs are killed, torn down and moved to `RETRY`,
//!    and the worker waits for them before returning

pub mod feed;
pub mod router;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::RunnerError;
use crate::scheduler::Dispatcher;

pub use feed::{feed, QueueMessage, Submission};
pub use router::EventRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Created { job_id: Uuid },
    Cancel { job_id: Uuid },
}

pub struct Worker {
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl Worker {
    /// `shutdown` should be the token the dispatcher was built with.
    pub fn new(dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) -> Self {
        Self {
            dispatcher,
            shutdown,
        }
    }

    /// Consume events until the channel closes or shutdown is requested.
    pub async fn run(self, mut events: mpsc::Receiver<JobEvent>) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!(in_flight = tasks.len(), "Worker shutting down");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::debug!("Event channel closed");
                        break;
                    };
                    self.handle(event, &mut tasks).await;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Dispatch task failed");
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Dispatch task failed");
            }
        }
        tracing::info!("Worker stopped");
    }

    async fn handle(&self, event: JobEvent, tasks: &mut JoinSet<()>) {
        match event {
            JobEvent::Created { job_id } => {
                let dispatcher = self.dispatcher.clone();
                tasks.spawn(async move {
                    match dispatcher.dispatch(job_id).await {
                        Ok(job) => {
                            tracing::debug!(job_id = %job_id, status = %job.status, "Dispatch finished");
                        }
                        Err(RunnerError::DuplicateInvocation { status, .. }) => {
                            tracing::info!(job_id = %job_id, status = %status, "Duplicate delivery ignored");
                        }
                        Err(e) => {
                            tracing::error!(job_id = %job_id, error = %e, "Dispatch failed");
                        }
                    }
                });
            }
            JobEvent::Cancel { job_id } => match self.dispatcher.cancel(job_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(job_id = %job_id, "Cancel for a finished job ignored");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Cancel failed");
                }
            },
        }
    }
}
