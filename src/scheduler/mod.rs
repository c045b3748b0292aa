//! Job lifecycle.
//!
//! - [`job`]: the Job record and its status state machine
//! - [`store`]: persistence of Job records with atomic claims
//! - [`runner`]: one execution attempt against a backend
//! - [`dispatcher`]: the task-queue entry point wrapping the runner
//! - [`autoscale`]: GPU node-pool control loop

pub mod autoscale;
pub mod dispatcher;
pub mod job;
pub mod notify;
pub mod runner;
pub mod store;

pub use autoscale::{Autoscaler, LogScalingSink, ScalingSink};
pub use dispatcher::Dispatcher;
pub use job::{GpuType, InputRef, Job, JobStatus, ResourceRequirements};
pub use notify::{FailureNotifier, LogNotifier, Notification};
pub use store::{Completion, GpuDemand, InMemoryJobStore, JobStore};
