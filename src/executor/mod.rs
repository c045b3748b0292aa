//! Container executors.
//!
//! An [`Executor`] owns one execution attempt of one Job: the container (or
//! Kubernetes Job), its network and its scratch storage. Backends share one
//! contract so the state machine never branches on the runtime:
//!
//! - [`docker::DockerExecutor`]: local Docker daemon, polled by exit code
//! - [`kubernetes::KubernetesExecutor`]: cluster Jobs, driven by watch events
//!
//! Teardown is tied to ownership through [`ExecutorGuard`].

pub mod docker;
pub mod kubernetes;
pub mod logs;
pub mod policy;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{BackendKind, RunnerConfig};
use crate::error::ExecutorError;
use crate::scheduler::Job;
use crate::storage::ObjectStore;

pub use docker::{DockerBackend, DockerExecutor};
pub use kubernetes::{KubernetesBackend, KubernetesExecutor};
pub use logs::LogBuffer;
pub use policy::ResourcePolicy;

/// Best-effort resource usage of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMetrics {
    pub peak_memory_bytes: u64,
    pub cpu_seconds: f64,
    pub gpu_seconds: f64,
}

/// Backend status normalized to what the state machine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited(i64),
    Unknown,
}

/// Lifecycle notification from the local Docker daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerEvent {
    pub container: String,
    pub action: String,
    pub exit_code: Option<i64>,
}

/// Asynchronous event pushed by a backend's notification channel.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Container(ContainerEvent),
    KubeJob(Box<k8s_openapi::api::batch::v1::Job>),
}

impl BackendEvent {
    /// The Job this event belongs to, if it was produced by this runner.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            BackendEvent::Container(_) => DockerExecutor::get_job_name(self),
            BackendEvent::KubeJob(_) => KubernetesExecutor::get_job_name(self),
        }
    }
}

/// Shared dependencies handed to every executor.
#[derive(Clone)]
pub struct ExecutorContext {
    pub store: Arc<dyn ObjectStore>,
    pub log_retention_lines: usize,
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn job_id(&self) -> Uuid;

    fn backend(&self) -> BackendKind;

    /// Launch the container with its resolved policy.
    ///
    /// Fails fast if the image is missing or resources cannot be satisfied.
    async fn execute(&mut self) -> Result<(), ExecutorError>;

    /// Query the backend once and pull any new log lines.
    async fn poll(&mut self) -> Result<ContainerState, ExecutorError>;

    /// Consume a pushed backend event without blocking.
    fn handle_event(&mut self, event: &BackendEvent);

    /// Derive the Job id from an opaque backend event.
    fn get_job_name(event: &BackendEvent) -> Option<Uuid>
    where
        Self: Sized;

    /// Fetch the remaining log tail after the container stopped.
    async fn refresh_logs(&mut self) -> Result<(), ExecutorError>;

    fn logs(&self) -> &LogBuffer;

    /// Force-kill the container. The process is never asked to stop.
    async fn kill(&mut self) -> Result<(), ExecutorError>;

    /// Verify and persist every declared output. Returns the stored keys.
    async fn collect_outputs(&mut self) -> Result<Vec<String>, ExecutorError>;

    /// Never fails; unknown values are zero.
    fn runtime_metrics(&self) -> RuntimeMetrics;

    /// Wall-clock time billed for this run.
    fn utilization_duration(&self) -> Duration;

    fn external_admin_url(&self) -> Option<String>;

    /// Remove every container, network and volume of this run.
    async fn cleanup(&mut self) -> Result<(), ExecutorError>;
}

/// Owns an executor and guarantees its teardown.
///
/// [`ExecutorGuard::release`] tears down in line. If the guard is dropped
/// without it (aborted task, unwinding panic) teardown is spawned on the
/// current runtime instead.
pub struct ExecutorGuard {
    inner: Option<Box<dyn Executor>>,
}

impl ExecutorGuard {
    pub fn new(executor: Box<dyn Executor>) -> Self {
        Self {
            inner: Some(executor),
        }
    }

    pub fn executor(&mut self) -> &mut (dyn Executor + 'static) {
        match self.inner.as_deref_mut() {
            Some(executor) => executor,
            // release() consumes the guard
            None => unreachable!("executor accessed after release"),
        }
    }

    pub async fn release(mut self) -> Result<(), ExecutorError> {
        match self.inner.take() {
            Some(mut executor) => executor.cleanup().await,
            None => Ok(()),
        }
    }
}

impl Drop for ExecutorGuard {
    fn drop(&mut self) {
        let Some(mut executor) = self.inner.take() else {
            return;
        };
        let job_id = executor.job_id();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(job_id = %job_id, "Executor dropped without release, cleaning up");
                handle.spawn(async move {
                    if let Err(e) = executor.cleanup().await {
                        tracing::error!(job_id = %job_id, error = %e, "Deferred cleanup failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!(job_id = %job_id, "No runtime available, job resources may leak");
            }
        }
    }
}

/// Backend selected once from configuration.
pub enum Backend {
    Docker(DockerBackend),
    Kubernetes(KubernetesBackend),
}

impl Backend {
    /// Build the backend named by `config.backend`.
    pub async fn connect(
        config: &RunnerConfig,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, ExecutorError> {
        let ctx = ExecutorContext {
            store,
            log_retention_lines: config.log_retention_lines,
        };
        match config.backend {
            BackendKind::Docker => {
                let cli = docker::DockerCli::new(config.docker.docker_bin.clone());
                Ok(Backend::Docker(DockerBackend::new(
                    Arc::new(cli),
                    config.docker.clone(),
                    ctx,
                )))
            }
            BackendKind::Kubernetes => {
                if ctx.store.bucket().is_none() {
                    return Err(ExecutorError::Storage(
                        "the kubernetes backend needs an [s3] bucket that pods can reach".into(),
                    ));
                }
                let cluster = kubernetes::KubeCluster::connect(&config.kubernetes.namespace).await?;
                Ok(Backend::Kubernetes(KubernetesBackend::new(
                    Arc::new(cluster),
                    config.kubernetes.clone(),
                    ctx,
                )))
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Docker(_) => BackendKind::Docker,
            Backend::Kubernetes(_) => BackendKind::Kubernetes,
        }
    }

    pub fn create_executor(
        &self,
        job: &Job,
        policy: ResourcePolicy,
    ) -> Result<Box<dyn Executor>, ExecutorError> {
        match self {
            Backend::Docker(b) => Ok(Box::new(b.executor(job, policy)?)),
            Backend::Kubernetes(b) => Ok(Box::new(b.executor(job, policy)?)),
        }
    }

    pub fn network_disabled(&self) -> bool {
        match self {
            Backend::Docker(b) => b.config().network_disabled,
            Backend::Kubernetes(_) => true,
        }
    }
}
