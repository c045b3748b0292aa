use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobStatus;

/// How an executor failure should be reported and propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad image or unsatisfiable resources. Reported, never retried here.
    Validation,
    /// The algorithm itself failed (exit code, missing output).
    Runtime,
    /// Wall-clock limit exceeded.
    Timeout,
    /// Daemon, cluster API or storage failure. Propagated to the task queue.
    Infrastructure,
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Resource request cannot be satisfied: {0}")]
    Unsatisfiable(String),

    #[error("Invalid job specification: {0}")]
    InvalidSpec(String),

    #[error("Container exited with code {code}: {message}")]
    NonZeroExit { code: i64, message: String },

    #[error("Missing output: {0}")]
    MissingOutput(String),

    #[error("Time limit exceeded ({0}s)")]
    TimeLimitExceeded(u64),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ExecutorError::ImageNotFound(_)
            | ExecutorError::Unsatisfiable(_)
            | ExecutorError::InvalidSpec(_) => ErrorClass::Validation,
            ExecutorError::NonZeroExit { .. } | ExecutorError::MissingOutput(_) => {
                ErrorClass::Runtime
            }
            ExecutorError::TimeLimitExceeded(_) => ErrorClass::Timeout,
            ExecutorError::Runtime(_)
            | ExecutorError::Kube(_)
            | ExecutorError::Storage(_)
            | ExecutorError::Io(_) => ErrorClass::Infrastructure,
        }
    }

    pub fn is_infrastructure(&self) -> bool {
        self.class() == ErrorClass::Infrastructure
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Illegal transition for job {job_id}: {from} -> {to}")]
    Illegal {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Job {job_id} is already {status}, refusing duplicate invocation")]
    DuplicateInvocation { job_id: Uuid, status: JobStatus },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job queue at capacity")]
    QueueFull,

    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Infrastructure error for job {job_id}: {source}")]
    Infrastructure {
        job_id: Uuid,
        #[source]
        source: ExecutorError,
    },

    #[error("Executor panicked for job {job_id}: {message}")]
    Panicked { job_id: Uuid, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
