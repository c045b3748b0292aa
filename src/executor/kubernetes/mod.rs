//! Kubernetes backend.
//!
//! Each execution is one batch Job with a single pod. Completion is pushed
//! through watch events ([`Executor::handle_event`]); polling the Job status
//! is the fallback when no event arrived. Inputs are staged under the job's
//! prefix in the shared bucket; the pod's init container downloads them and
//! its upload sidecar writes outputs back (see [`manifest::build_job`]).

pub mod client;
pub mod manifest;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::{ContainerState as PodContainerState, Pod};
use uuid::Uuid;

use crate::config::{BackendKind, KubernetesConfig};
use crate::error::ExecutorError;
use crate::executor::docker::JOB_ID_LABEL;
use crate::executor::logs::{LogBuffer, LogSource};
use crate::executor::policy::ResourcePolicy;
use crate::executor::{
    BackendEvent, ContainerState, Executor, ExecutorContext, RuntimeMetrics,
};
use crate::scheduler::{InputRef, Job};
use crate::storage::{self, safe_relative_path, ObjectStore};

pub use client::{ClusterApi, KubeCluster};
pub use manifest::{build_job, job_name, CONTAINER_NAME};

/// Creates Kubernetes executors sharing one cluster client.
#[derive(Clone)]
pub struct KubernetesBackend {
    cluster: Arc<dyn ClusterApi>,
    config: KubernetesConfig,
    ctx: ExecutorContext,
}

impl KubernetesBackend {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: KubernetesConfig, ctx: ExecutorContext) -> Self {
        Self {
            cluster,
            config,
            ctx,
        }
    }

    pub fn config(&self) -> &KubernetesConfig {
        &self.config
    }

    pub fn executor(
        &self,
        job: &Job,
        policy: ResourcePolicy,
    ) -> Result<KubernetesExecutor, ExecutorError> {
        for input in &job.inputs {
            safe_relative_path(&input.path)?;
        }
        for output in &job.outputs {
            safe_relative_path(output)?;
        }
        if job.image_reference.trim().is_empty() {
            return Err(ExecutorError::InvalidSpec("image reference is empty".into()));
        }

        Ok(KubernetesExecutor {
            job_id: job.id,
            name: job_name(job.id),
            image: job.image_reference.clone(),
            inputs: job.inputs.clone(),
            outputs: job.outputs.clone(),
            policy,
            config: self.config.clone(),
            cluster: self.cluster.clone(),
            store: self.ctx.store.clone(),
            logs: LogBuffer::new(self.ctx.log_retention_lines),
            created: false,
            observed: None,
            started_at: None,
            stopped_at: None,
        })
    }

    /// Jobs still labelled with `job_id`.
    pub async fn leftover_resources(&self, job_id: Uuid) -> Result<Vec<String>, ExecutorError> {
        self.cluster.list_jobs(JOB_ID_LABEL, &job_id.to_string()).await
    }
}

pub struct KubernetesExecutor {
    job_id: Uuid,
    name: String,
    image: String,
    inputs: Vec<InputRef>,
    outputs: Vec<String>,
    policy: ResourcePolicy,
    config: KubernetesConfig,
    cluster: Arc<dyn ClusterApi>,
    store: Arc<dyn ObjectStore>,
    logs: LogBuffer,
    created: bool,
    /// Latest Job object pushed by the watch
    observed: Option<KubeJob>,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
}

fn job_container_state(pod: &Pod) -> Option<&PodContainerState> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|cs| cs.name == CONTAINER_NAME)?
        .state
        .as_ref()
}

/// Exit code of the job container, once it terminated.
fn terminated_exit_code(pods: &[Pod]) -> Option<i64> {
    pods.iter()
        .filter_map(job_container_state)
        .filter_map(|state| state.terminated.as_ref())
        .map(|t| i64::from(t.exit_code))
        .next()
}

/// Whether the job container of `pod` ever ran, so its log can be read.
///
/// Pending pods (unscheduled, pulling, waiting on init containers) have
/// nothing to serve yet.
fn has_started(pod: &Pod) -> bool {
    let pending = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map_or(true, |phase| phase == "Pending");
    if pending {
        return false;
    }
    job_container_state(pod).map_or(false, |state| {
        state.running.is_some() || state.terminated.is_some()
    })
}

/// The API server answers 400 while the container is still being created.
fn logs_not_ready(err: &ExecutorError) -> bool {
    matches!(err, ExecutorError::Kube(kube::Error::Api(resp)) if resp.code == 400)
}

/// Normalize the succeeded/failed counters into a container state.
fn job_state(job: &KubeJob) -> Option<bool> {
    let status = job.status.as_ref()?;
    if status.succeeded.unwrap_or(0) > 0 {
        return Some(true);
    }
    if status.failed.unwrap_or(0) > 0 {
        return Some(false);
    }
    let failed = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Failed" && c.status == "True");
    failed.then_some(false)
}

impl KubernetesExecutor {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn stage_inputs(&self) -> Result<(), ExecutorError> {
        for input in &self.inputs {
            let rel = safe_relative_path(&input.path)?;
            let data = self.store.get(&input.key).await?;
            let key = storage::input_key(self.job_id, &rel.to_string_lossy());
            self.store.put(&key, &data).await?;
            tracing::debug!(job_id = %self.job_id, key = %key, "Input staged");
        }
        Ok(())
    }

    async fn pull_logs(&mut self) -> Result<(), ExecutorError> {
        let pods = self.cluster.list_pods(&self.name).await?;
        let since = self.logs.last_timestamp();
        for pod in pods.iter().filter(|p| has_started(p)) {
            let Some(name) = pod.metadata.name.as_deref() else {
                continue;
            };
            let text = match self.cluster.pod_logs(name, since).await {
                Ok(text) => text,
                Err(e) if logs_not_ready(&e) => {
                    tracing::trace!(job_id = %self.job_id, pod = %name, error = %e, "Pod logs not available yet");
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.logs
                .extend_resumed(text.lines().map(|l| (l.to_string(), LogSource::Stdout)));
        }
        Ok(())
    }

    fn mark_stopped(&mut self) {
        if self.stopped_at.is_none() {
            self.stopped_at = Some(Instant::now());
        }
    }
}

#[async_trait]
impl Executor for KubernetesExecutor {
    fn job_id(&self) -> Uuid {
        self.job_id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Kubernetes
    }

    async fn execute(&mut self) -> Result<(), ExecutorError> {
        tracing::info!(
            job_id = %self.job_id,
            image = %self.image,
            namespace = %self.config.namespace,
            gpu = ?self.policy.gpu,
            "Creating Kubernetes job"
        );

        self.stage_inputs().await?;

        let manifest = build_job(
            self.job_id,
            &self.image,
            &self.policy,
            &self.config,
            self.store.bucket(),
        );
        // delete_job tolerates a Job that was never created
        self.created = true;
        self.cluster.create_job(&manifest).await?;
        self.started_at = Some(Instant::now());
        tracing::info!(job_id = %self.job_id, name = %self.name, "Kubernetes job created");
        Ok(())
    }

    async fn poll(&mut self) -> Result<ContainerState, ExecutorError> {
        let job = match self.observed.clone() {
            Some(job) if job_state(&job).is_some() => job,
            _ => match self.cluster.get_job(&self.name).await? {
                Some(job) => job,
                None => {
                    return Err(ExecutorError::Runtime(format!(
                        "kubernetes job {} disappeared",
                        self.name
                    )))
                }
            },
        };

        self.pull_logs().await?;

        let Some(succeeded) = job_state(&job) else {
            return Ok(ContainerState::Running);
        };
        self.mark_stopped();
        let pods = self.cluster.list_pods(&self.name).await?;
        let code = match terminated_exit_code(&pods) {
            Some(code) => code,
            None if succeeded => 0,
            None => 1,
        };
        tracing::info!(job_id = %self.job_id, exit_code = code, "Kubernetes job finished");
        Ok(ContainerState::Exited(code))
    }

    fn handle_event(&mut self, event: &BackendEvent) {
        let BackendEvent::KubeJob(job) = event else {
            return;
        };
        if job.metadata.name.as_deref() != Some(self.name.as_str()) {
            return;
        }
        tracing::trace!(job_id = %self.job_id, "Job status event");
        self.observed = Some(job.as_ref().clone());
    }

    fn get_job_name(event: &BackendEvent) -> Option<Uuid> {
        let BackendEvent::KubeJob(job) = event else {
            return None;
        };
        let from_label = job
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(JOB_ID_LABEL))
            .and_then(|id| Uuid::parse_str(id).ok());
        from_label.or_else(|| {
            job.metadata
                .name
                .as_deref()
                .and_then(|name| name.strip_prefix("job-runner-"))
                .and_then(|id| Uuid::parse_str(id).ok())
        })
    }

    async fn refresh_logs(&mut self) -> Result<(), ExecutorError> {
        if !self.created {
            return Ok(());
        }
        self.pull_logs().await
    }

    fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    async fn kill(&mut self) -> Result<(), ExecutorError> {
        if !self.created {
            return Ok(());
        }
        tracing::warn!(job_id = %self.job_id, name = %self.name, "Deleting Kubernetes job");
        self.cluster.delete_job(&self.name).await?;
        self.mark_stopped();
        Ok(())
    }

    async fn collect_outputs(&mut self) -> Result<Vec<String>, ExecutorError> {
        if self.outputs.is_empty() {
            let keys = self
                .store
                .list(&storage::output_prefix(self.job_id))
                .await?;
            if keys.is_empty() {
                return Err(ExecutorError::MissingOutput(
                    "the container produced no output".into(),
                ));
            }
            return Ok(keys);
        }

        let mut keys = Vec::with_capacity(self.outputs.len());
        for output in &self.outputs {
            let rel = safe_relative_path(output)?;
            let key = storage::output_key(self.job_id, &rel.to_string_lossy());
            if !self.store.exists(&key).await? {
                return Err(ExecutorError::MissingOutput(output.clone()));
            }
            keys.push(key);
        }
        tracing::info!(job_id = %self.job_id, outputs = keys.len(), "Outputs verified");
        Ok(keys)
    }

    fn runtime_metrics(&self) -> RuntimeMetrics {
        let gpu_seconds = if self.policy.requires_gpu() {
            self.utilization_duration().as_secs_f64()
        } else {
            0.0
        };
        RuntimeMetrics {
            gpu_seconds,
            ..Default::default()
        }
    }

    fn utilization_duration(&self) -> Duration {
        match (self.started_at, self.stopped_at) {
            (Some(start), Some(stop)) => stop.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    fn external_admin_url(&self) -> Option<String> {
        let base = self.config.admin_url.as_deref()?;
        Some(format!(
            "{}/#/job/{}/{}?namespace={}",
            base.trim_end_matches('/'),
            self.config.namespace,
            self.name,
            self.config.namespace
        ))
    }

    async fn cleanup(&mut self) -> Result<(), ExecutorError> {
        self.mark_stopped();
        if !self.created {
            return Ok(());
        }
        self.cluster.delete_job(&self.name).await?;
        self.created = false;
        tracing::debug!(job_id = %self.job_id, "Kubernetes resources released");
        Ok(())
    }
}
