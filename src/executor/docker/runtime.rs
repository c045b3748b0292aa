use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ExecutorError;
use crate::executor::logs::LogSource;
use crate::executor::ContainerState;

/// Label carried by every resource this runner creates.
pub const MANAGED_BY_LABEL: &str = "job-runner.managed-by";
pub const MANAGED_BY_VALUE: &str = "job-runner";
/// Label holding the owning Job id.
pub const JOB_ID_LABEL: &str = "job-runner.job-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create one job container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub labels: Vec<(String, String)>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    /// Hard memory limit in docker notation; swap is capped at the same value
    pub memory: String,
    pub cpu_shares: i64,
    /// Exclusively leased GPU device id
    pub gpu_device: Option<String>,
    pub user: Option<String>,
    pub pids_limit: Option<i64>,
    pub read_only_rootfs: bool,
}

impl ContainerSpec {
    /// Arguments for `docker create`.
    pub fn create_args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            format!("--name={}", self.name),
            format!("--network={}", self.network),
            format!("--memory={}", self.memory),
            format!("--memory-swap={}", self.memory),
            format!("--cpu-shares={}", self.cpu_shares),
        ];

        // Security: drop all capabilities, no new privileges
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());

        if self.read_only_rootfs {
            args.push("--read-only".to_string());
            args.push("--tmpfs=/tmp".to_string());
        }
        if let Some(limit) = self.pids_limit {
            args.push(format!("--pids-limit={}", limit));
        }
        if let Some(ref user) = self.user {
            args.push(format!("--user={}", user));
        }
        if let Some(ref device) = self.gpu_device {
            args.push(format!("--gpus=device={}", device));
        }
        for (key, value) in &self.labels {
            args.push(format!("--label={}={}", key, value));
        }
        for (key, value) in &self.env {
            args.push(format!("--env={}={}", key, value));
        }
        for mount in &self.mounts {
            let mode = if mount.read_only { "ro" } else { "rw" };
            args.push(format!(
                "--volume={}:{}:{}",
                mount.source.display(),
                mount.target,
                mode
            ));
        }

        args.push(self.image.clone());
        args
    }
}

/// Point-in-time resource usage of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerStats {
    pub memory_bytes: u64,
    pub cpu_percent: f64,
}

/// Operations the Docker executor needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool, ExecutorError>;

    /// Pull an image. A registry miss is `ImageNotFound`.
    async fn pull_image(&self, image: &str) -> Result<(), ExecutorError>;

    async fn create_network(
        &self,
        name: &str,
        internal: bool,
        labels: &[(String, String)],
    ) -> Result<(), ExecutorError>;

    /// Idempotent: removing a missing network succeeds.
    async fn remove_network(&self, name: &str) -> Result<(), ExecutorError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), ExecutorError>;

    async fn start_container(&self, name: &str) -> Result<(), ExecutorError>;

    async fn inspect_state(&self, name: &str) -> Result<ContainerState, ExecutorError>;

    /// Timestamped log lines, optionally only those after `since`.
    async fn logs(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<(String, LogSource)>, ExecutorError>;

    async fn stats(&self, name: &str) -> Result<ContainerStats, ExecutorError>;

    /// SIGKILL. Killing a stopped container succeeds.
    async fn kill_container(&self, name: &str) -> Result<(), ExecutorError>;

    /// Force-remove with anonymous volumes. Idempotent.
    async fn remove_container(&self, name: &str) -> Result<(), ExecutorError>;

    /// Names of containers carrying `key=value`.
    async fn list_containers(&self, key: &str, value: &str) -> Result<Vec<String>, ExecutorError>;

    /// Names of networks carrying `key=value`.
    async fn list_networks(&self, key: &str, value: &str) -> Result<Vec<String>, ExecutorError>;
}
