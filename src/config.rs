use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::RunnerError;
use crate::scheduler::GpuType;

/// Container runtime that executes jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
    Kubernetes,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Docker => write!(f, "docker"),
            BackendKind::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Configuration for Docker-based job execution.
///
/// Every job gets its own container, an internal bridge network and a work
/// directory holding the `/input` and `/output` mounts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Path or name of the docker CLI
    pub docker_bin: String,
    /// Parent directory of the per-job work directories
    pub work_root: PathBuf,
    /// Create job networks as `--internal` (no route out)
    pub network_disabled: bool,
    /// `uid:gid` to run as, when the image supports it
    pub user: Option<String>,
    pub pids_limit: Option<i64>,
    pub read_only_rootfs: bool,
    /// GPU device ids that may be leased to jobs, e.g. `["0", "1"]`
    pub gpu_devices: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            work_root: std::env::temp_dir().join("job-runner"),
            network_disabled: true,
            user: Some("65534:65534".to_string()),
            pids_limit: Some(256),
            read_only_rootfs: true,
            gpu_devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub namespace: String,
    /// Node label used to pin a GPU class
    pub gpu_node_label: String,
    /// Device-plugin resource name
    pub gpu_resource: String,
    pub service_account: Option<String>,
    pub ttl_seconds_after_finished: Option<i32>,
    /// Base URL of a cluster dashboard, used for operator links
    pub admin_url: Option<String>,
    /// Image with the `aws` CLI that moves inputs and outputs for the pod
    pub io_image: String,
    /// Secret whose keys become the environment of the I/O containers,
    /// typically `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY`
    pub storage_secret: Option<String>,
    /// Grace period the output upload gets after the job container exits
    pub upload_grace_seconds: i64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            gpu_node_label: "nvidia.com/gpu.product".to_string(),
            gpu_resource: "nvidia.com/gpu".to_string(),
            service_account: None,
            ttl_seconds_after_finished: Some(600),
            admin_url: None,
            io_image: "amazon/aws-cli:2.17.0".to_string(),
            storage_secret: None,
            upload_grace_seconds: 300,
        }
    }
}

/// Upper bounds applied when resolving a job's resource policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyLimits {
    pub max_memory_gb: u32,
    pub max_time_limit_seconds: u64,
    /// GPU class used when a job requires a GPU but names none
    pub default_gpu_type: GpuType,
    pub memory_gb_per_cpu: u32,
    pub max_cpu_cores: f64,
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            max_memory_gb: 32,
            max_time_limit_seconds: 24 * 60 * 60,
            default_gpu_type: GpuType::T4,
            memory_gb_per_cpu: 4,
            max_cpu_cores: 8.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub jobs_per_node: usize,
    pub min_nodes: usize,
    pub max_nodes: usize,
    /// Idle GPU nodes kept while warm-pool jobs are queued or running
    pub warm_pool_size: usize,
    pub interval_ms: u64,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            jobs_per_node: 1,
            min_nodes: 0,
            max_nodes: 8,
            warm_pool_size: 1,
            interval_ms: 30_000,
        }
    }
}

/// S3-compatible bucket holding job inputs and outputs.
///
/// Required by the Kubernetes backend: pods cannot see the runner's disk.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    /// Custom endpoint such as MinIO; path-style addressing is used with it
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub backend: BackendKind,
    pub poll_interval_ms: u64,
    /// Lines of container log kept per job
    pub log_retention_lines: usize,
    /// Root directory of the object store when no `[s3]` bucket is set
    pub storage_root: PathBuf,
    pub s3: Option<S3Config>,
    pub docker: DockerConfig,
    pub kubernetes: KubernetesConfig,
    pub limits: PolicyLimits,
    pub autoscale: AutoscaleConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Docker,
            poll_interval_ms: 2_000,
            log_retention_lines: 2_000,
            storage_root: std::env::temp_dir().join("job-runner-store"),
            s3: None,
            docker: DockerConfig::default(),
            kubernetes: KubernetesConfig::default(),
            limits: PolicyLimits::default(),
            autoscale: AutoscaleConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Load a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, RunnerError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RunnerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, RunnerError> {
        toml::from_str(text).map_err(|e| RunnerError::Config(e.to_string()))
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
