//! Docker backend.
//!
//! One execution owns a container, an isolated bridge network and a work
//! directory mounted as `/input` (read-only) and `/output`. The lifecycle is:
//!
//! 1. **Prepare**: make sure the image is present, lease a GPU if required,
//!    stage inputs, create the network
//! 2. **Start**: create and start the container with the resolved limits
//! 3. **Poll**: inspect state, append new log lines, sample usage
//! 4. **Collect**: copy declared outputs into the object store
//! 5. **Cleanup**: remove container, network and work directory

pub mod cli;
pub mod runtime;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{BackendKind, DockerConfig};
use crate::error::ExecutorError;
use crate::executor::logs::LogBuffer;
use crate::executor::policy::{GpuAllocator, GpuLease, ResourcePolicy};
use crate::executor::{
    BackendEvent, ContainerState, Executor, ExecutorContext, RuntimeMetrics,
};
use crate::scheduler::{InputRef, Job};
use crate::storage::{self, safe_relative_path};

pub use cli::DockerCli;
pub use runtime::{
    ContainerRuntime, ContainerSpec, ContainerStats, Mount, JOB_ID_LABEL, MANAGED_BY_LABEL,
    MANAGED_BY_VALUE,
};

const CONTAINER_PREFIX: &str = "job-runner-";

pub fn container_name(job_id: Uuid) -> String {
    format!("{CONTAINER_PREFIX}{job_id}")
}

pub fn network_name(job_id: Uuid) -> String {
    format!("{CONTAINER_PREFIX}{job_id}-net")
}

/// Environment every job container receives.
pub fn job_environment(job_id: Uuid) -> Vec<(String, String)> {
    vec![
        ("JOB_ID".to_string(), job_id.to_string()),
        ("INPUT_DIR".to_string(), "/input".to_string()),
        ("OUTPUT_DIR".to_string(), "/output".to_string()),
        ("JOB_INPUT_PREFIX".to_string(), storage::input_prefix(job_id)),
        ("JOB_OUTPUT_PREFIX".to_string(), storage::output_prefix(job_id)),
    ]
}

/// Creates Docker executors sharing one runtime and GPU pool.
#[derive(Clone)]
pub struct DockerBackend {
    runtime: Arc<dyn ContainerRuntime>,
    config: DockerConfig,
    gpus: GpuAllocator,
    ctx: ExecutorContext,
}

impl DockerBackend {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: DockerConfig, ctx: ExecutorContext) -> Self {
        let gpus = GpuAllocator::new(config.gpu_devices.clone());
        Self {
            runtime,
            config,
            gpus,
            ctx,
        }
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    pub fn gpus(&self) -> &GpuAllocator {
        &self.gpus
    }

    pub fn executor(&self, job: &Job, policy: ResourcePolicy) -> Result<DockerExecutor, ExecutorError> {
        for input in &job.inputs {
            safe_relative_path(&input.path)?;
        }
        for output in &job.outputs {
            safe_relative_path(output)?;
        }
        if job.image_reference.trim().is_empty() {
            return Err(ExecutorError::InvalidSpec("image reference is empty".into()));
        }

        Ok(DockerExecutor {
            job_id: job.id,
            image: job.image_reference.clone(),
            inputs: job.inputs.clone(),
            outputs: job.outputs.clone(),
            policy,
            config: self.config.clone(),
            runtime: self.runtime.clone(),
            gpus: self.gpus.clone(),
            store: self.ctx.store.clone(),
            gpu_lease: None,
            logs: LogBuffer::new(self.ctx.log_retention_lines),
            work_dir: None,
            network_created: false,
            container_created: false,
            event_exit: None,
            started_at: None,
            stopped_at: None,
            metrics: RuntimeMetrics::default(),
            last_sample: None,
        })
    }

    /// Containers and networks still labelled with `job_id`.
    pub async fn leftover_resources(&self, job_id: Uuid) -> Result<Vec<String>, ExecutorError> {
        let id = job_id.to_string();
        let mut names = self.runtime.list_containers(JOB_ID_LABEL, &id).await?;
        names.extend(self.runtime.list_networks(JOB_ID_LABEL, &id).await?);
        Ok(names)
    }
}

pub struct DockerExecutor {
    job_id: Uuid,
    image: String,
    inputs: Vec<InputRef>,
    outputs: Vec<String>,
    policy: ResourcePolicy,
    config: DockerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    gpus: GpuAllocator,
    store: Arc<dyn storage::ObjectStore>,
    gpu_lease: Option<GpuLease>,
    logs: LogBuffer,
    work_dir: Option<PathBuf>,
    network_created: bool,
    container_created: bool,
    event_exit: Option<i64>,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
    metrics: RuntimeMetrics,
    last_sample: Option<Instant>,
}

impl DockerExecutor {
    pub fn container_name(&self) -> String {
        container_name(self.job_id)
    }

    pub fn network_name(&self) -> String {
        network_name(self.job_id)
    }

    fn labels(&self) -> Vec<(String, String)> {
        vec![
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (JOB_ID_LABEL.to_string(), self.job_id.to_string()),
        ]
    }

    fn input_dir(work_dir: &Path) -> PathBuf {
        work_dir.join("input")
    }

    fn output_dir(work_dir: &Path) -> PathBuf {
        work_dir.join("output")
    }

    async fn ensure_image(&self) -> Result<(), ExecutorError> {
        if self.runtime.image_exists(&self.image).await? {
            return Ok(());
        }
        tracing::info!(job_id = %self.job_id, image = %self.image, "Pulling image");
        self.runtime.pull_image(&self.image).await
    }

    /// Create the work directory and copy inputs from the object store.
    async fn stage_inputs(&mut self) -> Result<PathBuf, ExecutorError> {
        let work_dir = self.config.work_root.join(self.job_id.to_string());
        self.work_dir = Some(work_dir.clone());

        let input_dir = Self::input_dir(&work_dir);
        let output_dir = Self::output_dir(&work_dir);
        tokio::fs::create_dir_all(&input_dir).await?;
        tokio::fs::create_dir_all(&output_dir).await?;

        // The container user is unprivileged and must be able to write outputs
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&output_dir, std::fs::Permissions::from_mode(0o777))
                .await?;
        }

        for input in &self.inputs {
            let dest = input_dir.join(safe_relative_path(&input.path)?);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let data = self.store.get(&input.key).await?;
            tokio::fs::write(&dest, &data).await?;
            tracing::debug!(job_id = %self.job_id, key = %input.key, path = %input.path, "Input staged");
        }
        Ok(work_dir)
    }

    fn container_spec(&self, work_dir: &Path) -> ContainerSpec {
        let mut env = job_environment(self.job_id);
        if let Some(bucket) = self.store.bucket() {
            env.extend(storage::bucket_environment(bucket));
        }
        ContainerSpec {
            name: self.container_name(),
            image: self.image.clone(),
            network: self.network_name(),
            labels: self.labels(),
            env,
            mounts: vec![
                Mount {
                    source: Self::input_dir(work_dir),
                    target: "/input".to_string(),
                    read_only: true,
                },
                Mount {
                    source: Self::output_dir(work_dir),
                    target: "/output".to_string(),
                    read_only: false,
                },
            ],
            memory: self.policy.docker_memory(),
            cpu_shares: self.policy.cpu_shares(),
            gpu_device: self.gpu_lease.as_ref().map(|l| l.device().to_string()),
            user: self.config.user.clone(),
            pids_limit: self.config.pids_limit,
            read_only_rootfs: self.config.read_only_rootfs,
        }
    }

    async fn pull_logs(&mut self) -> Result<(), ExecutorError> {
        let since = self.logs.last_timestamp();
        let mut lines = self.runtime.logs(&self.container_name(), since).await?;
        // stdout and stderr arrive separately; interleave by timestamp
        lines.sort_by_key(|(text, _)| crate::executor::logs::split_timestamp(text).0);
        self.logs.extend_resumed(lines);
        Ok(())
    }

    async fn sample_usage(&mut self) {
        let now = Instant::now();
        match self.runtime.stats(&self.container_name()).await {
            Ok(stats) => {
                self.metrics.peak_memory_bytes =
                    self.metrics.peak_memory_bytes.max(stats.memory_bytes);
                if let Some(last) = self.last_sample {
                    let secs = now.duration_since(last).as_secs_f64();
                    self.metrics.cpu_seconds += secs * stats.cpu_percent / 100.0;
                }
            }
            Err(e) => {
                tracing::debug!(job_id = %self.job_id, error = %e, "Stats unavailable");
            }
        }
        self.last_sample = Some(now);
    }

    fn mark_stopped(&mut self) {
        if self.stopped_at.is_none() {
            self.stopped_at = Some(Instant::now());
        }
    }

    /// Every regular file under `dir`, relative to it.
    async fn list_files(dir: &Path) -> Result<Vec<PathBuf>, ExecutorError> {
        let mut found = Vec::new();
        let mut pending = vec![PathBuf::new()];
        while let Some(rel) = pending.pop() {
            let mut entries = tokio::fs::read_dir(dir.join(&rel)).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let child = rel.join(entry.file_name());
                if file_type.is_dir() {
                    pending.push(child);
                } else if file_type.is_file() {
                    found.push(child);
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    fn job_id(&self) -> Uuid {
        self.job_id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn execute(&mut self) -> Result<(), ExecutorError> {
        tracing::info!(
            job_id = %self.job_id,
            image = %self.image,
            memory = %self.policy.docker_memory(),
            gpu = ?self.policy.gpu,
            "Launching container"
        );

        self.ensure_image().await?;

        if self.policy.requires_gpu() {
            self.gpu_lease = Some(self.gpus.claim(self.job_id)?);
        }

        let work_dir = self.stage_inputs().await?;

        // Flags go up first: execute() can be abandoned at any await and
        // removal tolerates resources that never came to exist.
        self.network_created = true;
        self.runtime
            .create_network(&self.network_name(), self.policy.network_disabled, &self.labels())
            .await?;

        let spec = self.container_spec(&work_dir);
        self.container_created = true;
        self.runtime.create_container(&spec).await?;

        self.runtime.start_container(&spec.name).await?;
        self.started_at = Some(Instant::now());
        tracing::info!(job_id = %self.job_id, container = %spec.name, "Container started");
        Ok(())
    }

    async fn poll(&mut self) -> Result<ContainerState, ExecutorError> {
        let state = match self.event_exit {
            Some(code) => ContainerState::Exited(code),
            None => self.runtime.inspect_state(&self.container_name()).await?,
        };

        self.pull_logs().await?;
        if state == ContainerState::Running {
            self.sample_usage().await;
        }
        if let ContainerState::Exited(code) = state {
            self.mark_stopped();
            tracing::info!(job_id = %self.job_id, exit_code = code, "Container exited");
        }
        Ok(state)
    }

    fn handle_event(&mut self, event: &BackendEvent) {
        let BackendEvent::Container(event) = event else {
            return;
        };
        if event.container != self.container_name() {
            return;
        }
        if event.action == "die" {
            self.event_exit = Some(event.exit_code.unwrap_or(-1));
        }
    }

    fn get_job_name(event: &BackendEvent) -> Option<Uuid> {
        match event {
            BackendEvent::Container(event) => event
                .container
                .strip_prefix(CONTAINER_PREFIX)
                .and_then(|id| Uuid::parse_str(id).ok()),
            BackendEvent::KubeJob(_) => None,
        }
    }

    async fn refresh_logs(&mut self) -> Result<(), ExecutorError> {
        if !self.container_created {
            return Ok(());
        }
        self.pull_logs().await
    }

    fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    async fn kill(&mut self) -> Result<(), ExecutorError> {
        if !self.container_created {
            return Ok(());
        }
        tracing::warn!(job_id = %self.job_id, container = %self.container_name(), "Killing container");
        self.runtime.kill_container(&self.container_name()).await?;
        self.mark_stopped();
        Ok(())
    }

    async fn collect_outputs(&mut self) -> Result<Vec<String>, ExecutorError> {
        let Some(work_dir) = self.work_dir.clone() else {
            return Err(ExecutorError::MissingOutput("container was never started".into()));
        };
        let output_dir = Self::output_dir(&work_dir);

        let declared: Vec<PathBuf> = if self.outputs.is_empty() {
            let found = Self::list_files(&output_dir).await?;
            if found.is_empty() {
                return Err(ExecutorError::MissingOutput(
                    "the container produced no output".into(),
                ));
            }
            found
        } else {
            self.outputs
                .iter()
                .map(|p| safe_relative_path(p))
                .collect::<Result<_, _>>()?
        };

        let mut keys = Vec::with_capacity(declared.len());
        for rel in declared {
            let path = output_dir.join(&rel);
            let is_file = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.is_file(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            };
            if !is_file {
                return Err(ExecutorError::MissingOutput(rel.display().to_string()));
            }
            let data = tokio::fs::read(&path).await?;
            let key = storage::output_key(self.job_id, &rel.to_string_lossy());
            self.store.put(&key, &data).await?;
            keys.push(key);
        }
        tracing::info!(job_id = %self.job_id, outputs = keys.len(), "Outputs collected");
        Ok(keys)
    }

    fn runtime_metrics(&self) -> RuntimeMetrics {
        let mut metrics = self.metrics;
        if self.policy.requires_gpu() {
            metrics.gpu_seconds = self.utilization_duration().as_secs_f64();
        }
        metrics
    }

    fn utilization_duration(&self) -> Duration {
        match (self.started_at, self.stopped_at) {
            (Some(start), Some(stop)) => stop.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    fn external_admin_url(&self) -> Option<String> {
        None
    }

    async fn cleanup(&mut self) -> Result<(), ExecutorError> {
        let mut first_error = None;

        if self.container_created {
            match self.runtime.remove_container(&self.container_name()).await {
                Ok(()) => self.container_created = false,
                Err(e) => {
                    tracing::error!(job_id = %self.job_id, error = %e, "Failed to remove container");
                    first_error.get_or_insert(e);
                }
            }
        }

        if self.network_created {
            match self.runtime.remove_network(&self.network_name()).await {
                Ok(()) => self.network_created = false,
                Err(e) => {
                    tracing::error!(job_id = %self.job_id, error = %e, "Failed to remove network");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(work_dir) = self.work_dir.take() {
            if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(job_id = %self.job_id, error = %e, "Failed to remove work directory");
                    self.work_dir = Some(work_dir);
                    first_error.get_or_insert(ExecutorError::Io(e));
                }
            }
        }

        self.mark_stopped();
        self.gpu_lease = None;

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::debug!(job_id = %self.job_id, "Docker resources released");
                Ok(())
            }
        }
    }
}
