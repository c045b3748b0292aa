use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PolicyLimits;
use crate::error::{Result, RunnerError};
use crate::executor::Backend;
use crate::scheduler::notify::{FailureNotifier, Notification};
use crate::scheduler::runner::{self, RunContext, RunReport};
use crate::scheduler::store::{Completion, JobStore};
use crate::scheduler::{Job, JobStatus};
use crate::worker::EventRouter;

/// Entry point invoked once per delivery of a job id.
///
/// Deliveries are at-least-once, so the dispatcher:
///
/// - claims the job atomically and rejects anything not `PENDING`/`RETRY`
/// - never leaves a claimed job in `STARTED`, even when the executor panics
/// - commits logs before the terminal status
/// - notifies the submitter on `FAILURE`
/// - returns infrastructure errors after committing `FAILURE`, so the queue's
///   own retry policy applies
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    backend: Arc<Backend>,
    notifier: Arc<dyn FailureNotifier>,
    router: EventRouter,
    limits: PolicyLimits,
    poll_interval: Duration,
    /// Cancellation handles of claimed jobs
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        backend: Arc<Backend>,
        notifier: Arc<dyn FailureNotifier>,
        limits: PolicyLimits,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            notifier,
            router: EventRouter::new(),
            limits,
            poll_interval,
            running: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie in-flight runs to a worker shutdown token.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_router(mut self, router: EventRouter) -> Self {
        self.router = router;
        self
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Run the job `job_id` once.
    pub async fn dispatch(&self, job_id: Uuid) -> Result<Job> {
        // Claim and register under one lock so cancel() never sees a job
        // started here without its token.
        let (job, cancel) = {
            let mut running = self.running.lock().await;
            let job = match self.store.claim(&job_id).await {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Dispatch rejected");
                    return Err(e);
                }
            };
            let cancel = CancellationToken::new();
            running.insert(job_id, cancel.clone());
            (job, cancel)
        };
        tracing::info!(job_id = %job_id, backend = %self.backend.kind(), image = %job.image_reference, "Job started");
        let events = self.router.register(job_id);

        let ctx = RunContext {
            backend: &self.backend,
            limits: &self.limits,
            poll_interval: self.poll_interval,
            cancel,
            shutdown: self.shutdown.clone(),
            events: Some(events),
        };
        let outcome = AssertUnwindSafe(runner::run(&job, ctx)).catch_unwind().await;
        self.router.unregister(&job_id);

        let (report, panicked) = match outcome {
            Ok(report) => (report, None),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(job_id = %job_id, panic = %message, "Executor panicked");
                let report = RunReport {
                    completion: Completion::failure(format!("internal error: {message}")),
                    log: Vec::new(),
                    raw_log: Vec::new(),
                    admin_url: None,
                    infrastructure: None,
                };
                (report, Some(message))
            }
        };

        let committed = self.commit(job_id, report.log, report.raw_log, report.completion).await;
        {
            let mut running = self.running.lock().await;
            running.remove(&job_id);
        }
        let job = committed?;

        if let Some(url) = report.admin_url {
            tracing::debug!(job_id = %job_id, url = %url, "Backend admin link");
        }
        if job.status == JobStatus::Failure {
            self.notifier.notify(Notification::for_failure(&job)).await;
        }

        if let Some(message) = panicked {
            return Err(RunnerError::Panicked { job_id, message });
        }
        if let Some(source) = report.infrastructure {
            return Err(RunnerError::Infrastructure { job_id, source });
        }
        Ok(job)
    }

    /// Logs first, then the status, so a terminal job always has final logs.
    async fn commit(
        &self,
        job_id: Uuid,
        log: Vec<String>,
        raw_log: Vec<String>,
        completion: Completion,
    ) -> Result<Job> {
        self.store.record_log(&job_id, log, raw_log).await?;
        let job = self.store.complete(&job_id, completion).await?;
        tracing::info!(job_id = %job_id, status = %job.status, "Job status committed");
        Ok(job)
    }

    /// Request cancellation.
    ///
    /// A queued job is cancelled right away. A job running on this dispatcher
    /// is killed at its next poll. Returns `false` if the job had already
    /// finished or is running on another dispatcher.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let mut running = self.running.lock().await;
        if let Some(token) = running.get(&job_id) {
            tracing::info!(job_id = %job_id, "Cancelling running job");
            token.cancel();
            return Ok(true);
        }

        if self.store.cancel_pending(&job_id).await? {
            tracing::info!(job_id = %job_id, "Cancelled queued job");
            return Ok(true);
        }

        let job = self
            .store
            .get(&job_id)
            .await
            .ok_or(RunnerError::JobNotFound(job_id))?;
        if job.status == JobStatus::Started {
            tracing::warn!(job_id = %job_id, "Job is running on another dispatcher, not cancelled");
        }
        Ok(false)
    }

    /// Number of jobs currently claimed by this dispatcher.
    pub async fn in_flight(&self) -> usize {
        self.running.lock().await.len()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
