use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransitionError;
use crate::executor::RuntimeMetrics;

/// Lifecycle of a Job.
///
/// `Pending` is the only initial state. `Success`, `Failure` and `Cancelled`
/// are terminal. `Retry` re-enters `Started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Started,
    Retry,
    Failure,
    Success,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Cancelled
        )
    }

    /// Whether a dispatcher may claim a job in this state.
    pub fn can_start(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retry)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Started)
                | (Retry, Started)
                | (Pending, Cancelled)
                | (Retry, Cancelled)
                | (Started, Success)
                | (Started, Failure)
                | (Started, Cancelled)
                | (Started, Retry)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Started => write!(f, "STARTED"),
            JobStatus::Retry => write!(f, "RETRY"),
            JobStatus::Failure => write!(f, "FAILURE"),
            JobStatus::Success => write!(f, "SUCCESS"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// GPU device class requested by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuType {
    #[default]
    None,
    T4,
    A10G,
}

impl GpuType {
    /// Value of the `nvidia.com/gpu.product` node label for this class.
    pub fn product_label(&self) -> Option<&'static str> {
        match self {
            GpuType::None => None,
            GpuType::T4 => Some("Tesla-T4"),
            GpuType::A10G => Some("NVIDIA-A10G"),
        }
    }
}

impl std::fmt::Display for GpuType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuType::None => write!(f, "none"),
            GpuType::T4 => write!(f, "t4"),
            GpuType::A10G => write!(f, "a10g"),
        }
    }
}

impl FromStr for GpuType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(GpuType::None),
            "t4" => Ok(GpuType::T4),
            "a10g" => Ok(GpuType::A10G),
            other => Err(format!("unknown GPU type: {other}")),
        }
    }
}

/// Resources a job declares up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    pub memory_limit_gb: u32,
    pub requires_gpu: bool,
    pub gpu_type: GpuType,
    pub time_limit_seconds: u64,
    pub use_warm_pool: bool,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            memory_limit_gb: 4,
            requires_gpu: false,
            gpu_type: GpuType::None,
            time_limit_seconds: 3600,
            use_warm_pool: false,
        }
    }
}

/// An object-store key staged into the container at `/input/<path>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    pub key: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub image_reference: String,
    pub requirements: ResourceRequirements,
    pub inputs: Vec<InputRef>,
    /// Declared output paths, relative to `/output`.
    pub outputs: Vec<String>,
    /// Object keys of the outputs persisted after success.
    pub output_keys: Vec<String>,
    /// User-visible log lines, most recent retained.
    pub log: Vec<String>,
    /// Every captured line including internal ones, for operators.
    pub raw_log: Vec<String>,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
    pub submitter: Option<String>,
    pub context: Option<String>,
    pub metrics: Option<RuntimeMetrics>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(image_reference: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), image_reference)
    }

    pub fn with_id(id: Uuid, image_reference: impl Into<String>) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            image_reference: image_reference.into(),
            requirements: ResourceRequirements::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            output_keys: Vec::new(),
            log: Vec::new(),
            raw_log: Vec::new(),
            error: None,
            exit_code: None,
            submitter: None,
            context: None,
            metrics: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_requirements(mut self, requirements: ResourceRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, path: impl Into<String>) -> Self {
        self.inputs.push(InputRef {
            key: key.into(),
            path: path.into(),
        });
        self
    }

    pub fn with_output(mut self, path: impl Into<String>) -> Self {
        self.outputs.push(path.into());
        self
    }

    pub fn with_submitter(mut self, submitter: impl Into<String>) -> Self {
        self.submitter = Some(submitter.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Apply a status transition, stamping `started_at` and `completed_at`
    /// the first time their state is entered.
    pub fn transition(&mut self, next: JobStatus, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        if next == JobStatus::Started && self.started_at.is_none() {
            self.started_at = Some(at);
        }
        if next.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(at);
        }
        Ok(())
    }

    pub fn requires_gpu(&self) -> bool {
        self.requirements.requires_gpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_pending() {
        let job = Job::new("alpine:latest");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn happy_path_stamps_timestamps_once() {
        let mut job = Job::new("alpine:latest");
        let t0 = Utc::now();
        job.transition(JobStatus::Started, t0).unwrap();
        assert_eq!(job.started_at, Some(t0));

        let t1 = t0 + chrono::Duration::seconds(10);
        job.transition(JobStatus::Success, t1).unwrap();
        assert_eq!(job.completed_at, Some(t1));
        assert_eq!(job.started_at, Some(t0));
    }

    #[test]
    fn retry_reentry_keeps_original_start() {
        let mut job = Job::new("alpine:latest");
        let t0 = Utc::now();
        job.transition(JobStatus::Started, t0).unwrap();
        job.transition(JobStatus::Retry, t0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(30);
        job.transition(JobStatus::Started, t1).unwrap();
        assert_eq!(job.started_at, Some(t0));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [JobStatus::Success, JobStatus::Failure, JobStatus::Cancelled] {
            let mut job = Job::new("alpine:latest");
            job.transition(JobStatus::Started, Utc::now()).unwrap();
            job.transition(terminal, Utc::now()).unwrap();

            for next in [
                JobStatus::Pending,
                JobStatus::Started,
                JobStatus::Retry,
                JobStatus::Success,
                JobStatus::Failure,
                JobStatus::Cancelled,
            ] {
                let err = job.transition(next, Utc::now()).unwrap_err();
                assert!(matches!(err, TransitionError::Illegal { .. }));
            }
            assert_eq!(job.status, terminal);
        }
    }

    #[test]
    fn cannot_start_twice() {
        let mut job = Job::new("alpine:latest");
        job.transition(JobStatus::Started, Utc::now()).unwrap();
        assert!(!job.status.can_start());
        assert!(job.transition(JobStatus::Started, Utc::now()).is_err());
    }

    #[test]
    fn pending_cannot_finish_without_starting() {
        let mut job = Job::new("alpine:latest");
        assert!(job.transition(JobStatus::Success, Utc::now()).is_err());
        assert!(job.transition(JobStatus::Failure, Utc::now()).is_err());
    }

    #[test]
    fn gpu_type_parses_case_insensitively() {
        assert_eq!("T4".parse::<GpuType>().unwrap(), GpuType::T4);
        assert_eq!("a10g".parse::<GpuType>().unwrap(), GpuType::A10G);
        assert_eq!("none".parse::<GpuType>().unwrap(), GpuType::None);
        assert!("h100".parse::<GpuType>().is_err());
    }

    #[test]
    fn status_display_is_uppercase() {
        assert_eq!(JobStatus::Cancelled.to_string(), "CANCELLED");
        assert_eq!(JobStatus::Retry.to_string(), "RETRY");
    }
}
