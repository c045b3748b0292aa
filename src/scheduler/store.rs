use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{RunnerError, TransitionError};
use crate::executor::RuntimeMetrics;
use crate::scheduler::job::{Job, JobStatus};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Final result of one execution attempt, committed atomically.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: JobStatus,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
    pub output_keys: Vec<String>,
    pub metrics: Option<RuntimeMetrics>,
}

impl Completion {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            error: None,
            exit_code: None,
            output_keys: Vec::new(),
            metrics: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(JobStatus::Failure)
        }
    }
}

/// GPU jobs counted by state, the input of the autoscaling signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuDemand {
    pub queued: usize,
    pub active: usize,
    pub warm_requests: usize,
}

/// Persistence of Job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<(), RunnerError>;

    async fn get(&self, id: &Uuid) -> Option<Job>;

    /// Atomically move a `PENDING`/`RETRY` job to `STARTED`.
    ///
    /// Any other state yields `DuplicateInvocation` and changes nothing.
    async fn claim(&self, id: &Uuid) -> Result<Job, RunnerError>;

    /// Atomically cancel a job that has not started. Returns `false` when the
    /// job is already running or finished.
    async fn cancel_pending(&self, id: &Uuid) -> Result<bool, TransitionError>;

    /// Replace the job's logs. Rejected once the job is terminal.
    async fn record_log(
        &self,
        id: &Uuid,
        log: Vec<String>,
        raw_log: Vec<String>,
    ) -> Result<(), TransitionError>;

    /// Commit a terminal (or `RETRY`) status together with its result fields.
    async fn complete(&self, id: &Uuid, completion: Completion) -> Result<Job, TransitionError>;

    async fn gpu_demand(&self) -> GpuDemand;
}

/// Job records held in memory, bounded by a capacity.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    max_jobs: usize,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_jobs,
        }
    }

    fn evict_finished(jobs: &mut HashMap<Uuid, Job>) -> usize {
        let before = jobs.len();
        jobs.retain(|_, job| !job.status.is_terminal());
        before - jobs.len()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), RunnerError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Ok(());
        }
        if jobs.len() >= self.max_jobs {
            // finished records make room before a submission is refused
            let evicted = Self::evict_finished(&mut jobs);
            tracing::debug!(evicted, "Job store full, dropped finished jobs");
        }
        if jobs.len() >= self.max_jobs {
            return Err(RunnerError::QueueFull);
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    async fn claim(&self, id: &Uuid) -> Result<Job, RunnerError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(RunnerError::JobNotFound(*id))?;
        if !job.status.can_start() {
            return Err(RunnerError::DuplicateInvocation {
                job_id: *id,
                status: job.status,
            });
        }
        job.transition(JobStatus::Started, Utc::now())?;
        Ok(job.clone())
    }

    async fn cancel_pending(&self, id: &Uuid) -> Result<bool, TransitionError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(TransitionError::JobNotFound(*id))?;
        if !job.status.can_start() {
            return Ok(false);
        }
        job.transition(JobStatus::Cancelled, Utc::now())?;
        Ok(true)
    }

    async fn record_log(
        &self,
        id: &Uuid,
        log: Vec<String>,
        raw_log: Vec<String>,
    ) -> Result<(), TransitionError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(TransitionError::JobNotFound(*id))?;
        if job.status.is_terminal() {
            return Err(TransitionError::Illegal {
                job_id: *id,
                from: job.status,
                to: job.status,
            });
        }
        job.log = log;
        job.raw_log = raw_log;
        Ok(())
    }

    async fn complete(&self, id: &Uuid, completion: Completion) -> Result<Job, TransitionError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(TransitionError::JobNotFound(*id))?;
        job.transition(completion.status, Utc::now())?;
        job.error = completion.error;
        job.exit_code = completion.exit_code;
        job.output_keys = completion.output_keys;
        job.metrics = completion.metrics;
        Ok(job.clone())
    }

    async fn gpu_demand(&self) -> GpuDemand {
        let jobs = self.jobs.read().await;
        let mut demand = GpuDemand::default();
        for job in jobs.values().filter(|j| j.requires_gpu()) {
            match job.status {
                JobStatus::Pending | JobStatus::Retry => demand.queued += 1,
                JobStatus::Started => demand.active += 1,
                _ => continue,
            }
            if job.requirements.use_warm_pool {
                demand.warm_requests += 1;
            }
        }
        demand
    }
}
