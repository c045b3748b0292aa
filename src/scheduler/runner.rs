//! One execution attempt of a claimed job.
//!
//! The flow for a job already moved to `STARTED`:
//!
//! 1. Resolve the [`ResourcePolicy`] and create the backend executor
//! 2. Start the deadline, `execute()` the container, then poll it until it
//!    exits, the deadline passes, the job is cancelled or the worker shuts
//!    down
//! 3. On a clean exit collect outputs; missing outputs fail the job
//! 4. Tear the executor down
//! 5. Hand back a [`RunReport`] whose logs are persisted before its status
//!
//! Infrastructure errors still produce a `FAILURE` completion; the report
//! carries the error so the dispatcher can propagate it afterwards.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PolicyLimits;
use crate::error::{ErrorClass, ExecutorError};
use crate::executor::{Backend, BackendEvent, ContainerState, ExecutorGuard, ResourcePolicy};
use crate::scheduler::store::Completion;
use crate::scheduler::{Job, JobStatus};

/// Everything a run needs besides the job.
pub struct RunContext<'a> {
    pub backend: &'a Backend,
    pub limits: &'a PolicyLimits,
    pub poll_interval: Duration,
    /// Explicit cancellation of this job
    pub cancel: CancellationToken,
    /// Worker shutdown
    pub shutdown: CancellationToken,
    pub events: Option<mpsc::UnboundedReceiver<BackendEvent>>,
}

/// Result of one attempt, ready to persist.
#[derive(Debug)]
pub struct RunReport {
    pub completion: Completion,
    pub log: Vec<String>,
    pub raw_log: Vec<String>,
    pub admin_url: Option<String>,
    /// Set when the attempt failed for reasons outside the job's control
    pub infrastructure: Option<ExecutorError>,
}

impl RunReport {
    fn rejected(err: ExecutorError) -> Self {
        let mut report = Self {
            completion: Completion::failure(err.to_string()),
            log: Vec::new(),
            raw_log: Vec::new(),
            admin_url: None,
            infrastructure: None,
        };
        if err.is_infrastructure() {
            report.infrastructure = Some(err);
        }
        report
    }
}

/// How the poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Exited(i64),
    TimedOut,
    Cancelled,
    Interrupted,
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<BackendEvent>>) -> BackendEvent {
    if let Some(rx) = events.as_mut() {
        if let Some(event) = rx.recv().await {
            return event;
        }
        // Router dropped the sender; fall back to polling only
        *events = None;
    }
    std::future::pending().await
}

/// Run a claimed job to completion.
pub async fn run(job: &Job, mut ctx: RunContext<'_>) -> RunReport {
    let policy = match ResourcePolicy::resolve(
        &job.requirements,
        ctx.limits,
        ctx.backend.network_disabled(),
    ) {
        Ok(policy) => policy,
        Err(e) => {
            tracing::warn!(job_id = %job.id, error = %e, "Resource request rejected");
            return RunReport::rejected(e);
        }
    };
    let time_limit = policy.time_limit;

    let executor = match ctx.backend.create_executor(job, policy) {
        Ok(executor) => executor,
        Err(e) => {
            tracing::warn!(job_id = %job.id, error = %e, "Executor could not be created");
            return RunReport::rejected(e);
        }
    };
    let mut guard = ExecutorGuard::new(executor);

    let stop = drive(&mut guard, time_limit, &mut ctx).await;

    let executor = guard.executor();
    if !matches!(stop, Ok(Stop::Exited(_))) {
        if let Err(e) = executor.kill().await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to kill container");
        }
    }
    if let Err(e) = executor.refresh_logs().await {
        tracing::warn!(job_id = %job.id, error = %e, "Could not fetch final logs");
    }

    let mut infrastructure = None;
    let mut completion = match stop {
        Ok(Stop::Exited(0)) => match executor.collect_outputs().await {
            Ok(keys) => Completion {
                exit_code: Some(0),
                output_keys: keys,
                ..Completion::new(JobStatus::Success)
            },
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Output collection failed");
                let mut completion = Completion::failure(e.to_string());
                completion.exit_code = Some(0);
                if e.is_infrastructure() {
                    infrastructure = Some(e);
                }
                completion
            }
        },
        Ok(Stop::Exited(code)) => {
            let message = executor.logs().user_error();
            let err = ExecutorError::NonZeroExit {
                code,
                message: message.clone(),
            };
            tracing::info!(job_id = %job.id, error = %err, "Job failed");
            // The submitter sees the filtered line only
            Completion {
                exit_code: Some(code),
                error: Some(message),
                ..Completion::new(JobStatus::Failure)
            }
        }
        Ok(Stop::TimedOut) => {
            let err = ExecutorError::TimeLimitExceeded(time_limit.as_secs());
            tracing::warn!(job_id = %job.id, error = %err, "Job timed out");
            Completion::failure(err.to_string())
        }
        Ok(Stop::Cancelled) => {
            tracing::info!(job_id = %job.id, "Job cancelled");
            Completion::new(JobStatus::Cancelled)
        }
        Ok(Stop::Interrupted) => {
            tracing::info!(job_id = %job.id, "Worker shutting down, job will be retried");
            Completion::new(JobStatus::Retry)
        }
        Err(e) => {
            match e.class() {
                ErrorClass::Infrastructure => {
                    tracing::error!(job_id = %job.id, error = %e, "Infrastructure failure")
                }
                _ => tracing::warn!(job_id = %job.id, error = %e, "Job failed"),
            }
            let completion = Completion::failure(e.to_string());
            if e.is_infrastructure() {
                infrastructure = Some(e);
            }
            completion
        }
    };

    for line in executor.logs().internal_lines() {
        tracing::debug!(target: "job_runner::container", job_id = %job.id, task = ?line.task, "{}", line.message);
    }

    completion.metrics = Some(executor.runtime_metrics());
    let log = executor.logs().user_lines();
    let raw_log = executor.logs().raw_lines();
    let admin_url = executor.external_admin_url();
    let duration = executor.utilization_duration();

    if let Err(e) = guard.release().await {
        tracing::error!(job_id = %job.id, error = %e, "Cleanup failed, resources may leak");
        infrastructure.get_or_insert(e);
    }

    tracing::info!(
        job_id = %job.id,
        status = %completion.status,
        duration_ms = duration.as_millis() as u64,
        "Job attempt finished"
    );

    RunReport {
        completion,
        log,
        raw_log,
        admin_url,
        infrastructure,
    }
}

/// Launch and wait. The deadline runs from the start of the attempt, so a
/// slow image pull or staging step counts against it. Cancellation and the
/// deadline interrupt `execute()`; while polling they are observed between
/// polls, so their latency is bounded by the poll interval.
async fn drive(
    guard: &mut ExecutorGuard,
    time_limit: Duration,
    ctx: &mut RunContext<'_>,
) -> Result<Stop, ExecutorError> {
    if ctx.cancel.is_cancelled() {
        return Ok(Stop::Cancelled);
    }
    if ctx.shutdown.is_cancelled() {
        return Ok(Stop::Interrupted);
    }

    let deadline = Instant::now() + time_limit;
    let executor = guard.executor();
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Ok(Stop::Cancelled),
        _ = ctx.shutdown.cancelled() => return Ok(Stop::Interrupted),
        _ = tokio::time::sleep_until(deadline) => return Ok(Stop::TimedOut),
        launched = executor.execute() => launched?,
    }

    loop {
        if let Some(rx) = ctx.events.as_mut() {
            while let Ok(event) = rx.try_recv() {
                executor.handle_event(&event);
            }
        }

        if let ContainerState::Exited(code) = executor.poll().await? {
            return Ok(Stop::Exited(code));
        }
        if Instant::now() >= deadline {
            return Ok(Stop::TimedOut);
        }

        let wake = (Instant::now() + ctx.poll_interval).min(deadline);
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Ok(Stop::Cancelled),
            _ = ctx.shutdown.cancelled() => return Ok(Stop::Interrupted),
            event = next_event(&mut ctx.events) => executor.handle_event(&event),
            _ = tokio::time::sleep_until(wake) => {
                if Instant::now() >= deadline {
                    return Ok(Stop::TimedOut);
                }
            }
        }
    }
}
