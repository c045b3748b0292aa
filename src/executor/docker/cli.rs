use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;
use crate::executor::docker::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStats, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
use crate::executor::logs::LogSource;
use crate::executor::{BackendEvent, ContainerEvent, ContainerState};
use crate::worker::EventRouter;

const EVENTS_BACKOFF: Duration = Duration::from_secs(5);

/// [`ContainerRuntime`] driving the `docker` command-line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    #[serde(default)]
    exit_code: i64,
    #[serde(default, rename = "OOMKilled")]
    oom_killed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatsLine {
    #[serde(default)]
    mem_usage: String,
    #[serde(default, rename = "CPUPerc")]
    cpu_perc: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EventLine {
    action: String,
    #[serde(default)]
    actor: EventActor,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EventActor {
    #[serde(default)]
    attributes: HashMap<String, String>,
}

impl EventLine {
    fn into_event(self) -> Option<ContainerEvent> {
        let container = self.actor.attributes.get("name")?.clone();
        let exit_code = self
            .actor
            .attributes
            .get("exitCode")
            .and_then(|c| c.parse().ok());
        Some(ContainerEvent {
            container,
            action: self.action,
            exit_code,
        })
    }
}

struct CliOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Follow `docker events` for managed containers and route `die` events
    /// until `shutdown`. The follower restarts if the stream ends.
    pub async fn watch_events(&self, router: EventRouter, shutdown: CancellationToken) {
        let filter = format!("--filter=label={}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);
        loop {
            let child = Command::new(&self.bin)
                .args([
                    "events",
                    "--filter=type=container",
                    "--filter=event=die",
                    filter.as_str(),
                    "--format",
                    "{{json .}}",
                ])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn();

            match child {
                Ok(mut child) => {
                    if let Some(stdout) = child.stdout.take() {
                        let mut lines = BufReader::new(stdout).lines();
                        loop {
                            let line = tokio::select! {
                                _ = shutdown.cancelled() => return,
                                line = lines.next_line() => line,
                            };
                            match line {
                                Ok(Some(line)) => {
                                    let event = serde_json::from_str::<EventLine>(&line)
                                        .ok()
                                        .and_then(EventLine::into_event);
                                    if let Some(event) = event {
                                        router.route(BackendEvent::Container(event));
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::warn!(error = %e, "docker events stream broke");
                                    break;
                                }
                            }
                        }
                    }
                    let _ = child.kill().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to follow docker events");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(EVENTS_BACKOFF) => {}
            }
        }
    }

    async fn run(&self, args: &[String]) -> Result<CliOutput, ExecutorError> {
        tracing::trace!(bin = %self.bin, args = ?args, "docker");
        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ExecutorError::Runtime(format!("failed to run {}: {}", self.bin, e)))?;

        Ok(CliOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run and require success.
    async fn checked(&self, args: &[String]) -> Result<CliOutput, ExecutorError> {
        let out = self.run(args).await?;
        if out.success {
            Ok(out)
        } else {
            Err(ExecutorError::Runtime(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                out.stderr.trim()
            )))
        }
    }

    /// Run, treating "not found" style failures as success.
    async fn tolerant(&self, args: &[String], benign: &[&str]) -> Result<(), ExecutorError> {
        let out = self.run(args).await?;
        if out.success || benign.iter().any(|b| out.stderr.contains(b)) {
            Ok(())
        } else {
            Err(ExecutorError::Runtime(format!(
                "docker {} failed: {}",
                args.join(" "),
                out.stderr.trim()
            )))
        }
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Parse a docker size such as `1.5MiB` or `20kB` into bytes.
pub(crate) fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "B" | "" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

fn lines(text: &str, source: LogSource) -> impl Iterator<Item = (String, LogSource)> + '_ {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(move |l| (l.to_string(), source))
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn image_exists(&self, image: &str) -> Result<bool, ExecutorError> {
        let out = self.run(&args(["image", "inspect", image])).await?;
        if out.success {
            Ok(true)
        } else if out.stderr.contains("No such image") {
            Ok(false)
        } else {
            Err(ExecutorError::Runtime(out.stderr.trim().to_string()))
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), ExecutorError> {
        let out = self.run(&args(["pull", "--quiet", image])).await?;
        if out.success {
            return Ok(());
        }
        if out.stderr.contains("Cannot connect to the Docker daemon") {
            return Err(ExecutorError::Runtime(out.stderr.trim().to_string()));
        }
        Err(ExecutorError::ImageNotFound(format!(
            "{}: {}",
            image,
            out.stderr.trim()
        )))
    }

    async fn create_network(
        &self,
        name: &str,
        internal: bool,
        labels: &[(String, String)],
    ) -> Result<(), ExecutorError> {
        let mut cmd = args(["network", "create", "--driver=bridge"]);
        if internal {
            cmd.push("--internal".to_string());
        }
        for (key, value) in labels {
            cmd.push(format!("--label={}={}", key, value));
        }
        cmd.push(name.to_string());
        self.checked(&cmd).await.map(|_| ())
    }

    async fn remove_network(&self, name: &str) -> Result<(), ExecutorError> {
        self.tolerant(&args(["network", "rm", name]), &["No such network", "not found"])
            .await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), ExecutorError> {
        self.checked(&spec.create_args()).await.map(|_| ())
    }

    async fn start_container(&self, name: &str) -> Result<(), ExecutorError> {
        self.checked(&args(["start", name])).await.map(|_| ())
    }

    async fn inspect_state(&self, name: &str) -> Result<ContainerState, ExecutorError> {
        let out = self
            .checked(&args(["inspect", "--format", "{{json .State}}", name]))
            .await?;
        let state: InspectState = serde_json::from_str(out.stdout.trim())
            .map_err(|e| ExecutorError::Runtime(format!("unreadable inspect output: {e}")))?;

        if state.oom_killed {
            tracing::debug!(container = name, "Container was OOM killed");
        }
        Ok(match state.status.as_str() {
            "exited" | "dead" => ContainerState::Exited(state.exit_code),
            "created" | "running" | "restarting" | "paused" => ContainerState::Running,
            _ => ContainerState::Unknown,
        })
    }

    async fn logs(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<(String, LogSource)>, ExecutorError> {
        let mut cmd = args(["logs", "--timestamps"]);
        if let Some(since) = since {
            cmd.push(format!(
                "--since={}",
                since.to_rfc3339_opts(SecondsFormat::Nanos, true)
            ));
        }
        cmd.push(name.to_string());
        let out = self.checked(&cmd).await?;

        Ok(lines(&out.stdout, LogSource::Stdout)
            .chain(lines(&out.stderr, LogSource::Stderr))
            .collect())
    }

    async fn stats(&self, name: &str) -> Result<ContainerStats, ExecutorError> {
        let out = self
            .checked(&args(["stats", "--no-stream", "--format", "{{json .}}", name]))
            .await?;
        let line: StatsLine = serde_json::from_str(out.stdout.trim())
            .map_err(|e| ExecutorError::Runtime(format!("unreadable stats output: {e}")))?;

        let memory_bytes = line
            .mem_usage
            .split('/')
            .next()
            .and_then(parse_size)
            .unwrap_or(0);
        let cpu_percent = line
            .cpu_perc
            .trim()
            .trim_end_matches('%')
            .parse()
            .unwrap_or(0.0);
        Ok(ContainerStats {
            memory_bytes,
            cpu_percent,
        })
    }

    async fn kill_container(&self, name: &str) -> Result<(), ExecutorError> {
        self.tolerant(
            &args(["kill", "--signal=KILL", name]),
            &["is not running", "No such container"],
        )
        .await
    }

    async fn remove_container(&self, name: &str) -> Result<(), ExecutorError> {
        self.tolerant(&args(["rm", "--force", "--volumes", name]), &["No such container"])
            .await
    }

    async fn list_containers(&self, key: &str, value: &str) -> Result<Vec<String>, ExecutorError> {
        let filter = format!("--filter=label={}={}", key, value);
        let out = self
            .checked(&args(["ps", "--all", filter.as_str(), "--format", "{{.Names}}"]))
            .await?;
        Ok(out.stdout.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn list_networks(&self, key: &str, value: &str) -> Result<Vec<String>, ExecutorError> {
        let filter = format!("--filter=label={}={}", key, value);
        let out = self
            .checked(&args(["network", "ls", filter.as_str(), "--format", "{{.Name}}"]))
            .await?;
        Ok(out.stdout.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_sizes() {
        assert_eq!(parse_size("512B"), Some(512));
        assert_eq!(parse_size("1.5MiB"), Some(1_572_864));
        assert_eq!(parse_size("20kB"), Some(20_000));
        assert_eq!(parse_size(" 2GiB "), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn inspect_state_deserializes() {
        let state: InspectState = serde_json::from_str(
            r#"{"Status":"exited","Running":false,"ExitCode":137,"OOMKilled":true,"Pid":0}"#,
        )
        .unwrap();
        assert_eq!(state.status, "exited");
        assert_eq!(state.exit_code, 137);
        assert!(state.oom_killed);
    }

    #[test]
    fn stats_line_deserializes() {
        let line: StatsLine = serde_json::from_str(
            r#"{"BlockIO":"0B / 0B","CPUPerc":"12.50%","MemUsage":"100MiB / 1GiB","Name":"x"}"#,
        )
        .unwrap();
        assert_eq!(line.cpu_perc, "12.50%");
        assert_eq!(
            line.mem_usage.split('/').next().and_then(parse_size),
            Some(100 * 1024 * 1024)
        );
    }

    #[test]
    fn die_event_becomes_container_event() {
        let line: EventLine = serde_json::from_str(
            r#"{"status":"die","Type":"container","Action":"die","Actor":{"ID":"abc","Attributes":{"exitCode":"3","name":"job-runner-x"}}}"#,
        )
        .unwrap();
        let event = line.into_event().unwrap();
        assert_eq!(event.container, "job-runner-x");
        assert_eq!(event.action, "die");
        assert_eq!(event.exit_code, Some(3));
    }

    #[tokio::test]
    async fn missing_binary_is_infrastructure_error() {
        let cli = DockerCli::new("/nonexistent/docker-binary");
        let err = cli.image_exists("alpine:latest").await.unwrap_err();
        assert!(err.is_infrastructure());
    }
}
