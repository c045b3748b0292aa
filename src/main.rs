use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use job_runner::config::{BackendKind, RunnerConfig};
use job_runner::executor::docker::DockerCli;
use job_runner::executor::kubernetes::KubeCluster;
use job_runner::executor::logs::{user_error, LogBuffer, LogSource};
use job_runner::executor::Backend;
use job_runner::scheduler::{
    Autoscaler, Dispatcher, GpuType, InMemoryJobStore, Job, JobStore, LogNotifier,
    LogScalingSink, ResourceRequirements,
};
use job_runner::shutdown::install_shutdown_handler;
use job_runner::storage;
use job_runner::worker::{self, EventRouter, Worker};

#[derive(Parser, Debug)]
#[command(name = "job-runner")]
#[command(version)]
#[command(about = "Run compute jobs in isolated Docker or Kubernetes containers")]
#[command(propagate_version = true)]
struct Args {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run one job to completion
    Run(RunArgs),

    /// Consume the task feed on stdin until it closes or a signal arrives
    Serve(ServeArgs),

    /// Filter a saved container log
    Logs {
        /// Log file, one line per record
        file: PathBuf,
    },
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Container image reference
    #[arg(long)]
    image: String,

    /// Backend overriding the configuration file
    #[arg(long)]
    backend: Option<BackendKind>,

    #[arg(long, default_value = "4")]
    memory_gb: u32,

    /// GPU class, implies a GPU job
    #[arg(long)]
    gpu: Option<GpuType>,

    /// Wall-clock limit in seconds
    #[arg(long, default_value = "3600")]
    time_limit: u64,

    /// Keep a warm GPU node for this job
    #[arg(long)]
    warm_pool: bool,

    /// Object key staged at /input/<path>, as `key=path`
    #[arg(long = "input", value_parser = parse_input)]
    inputs: Vec<(String, String)>,

    /// Output path under /output that must exist after success
    #[arg(long = "output-path")]
    outputs: Vec<String>,

    /// Poll interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Backend overriding the configuration file
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Jobs the in-memory store holds before refusing submissions
    #[arg(long, default_value = "10000")]
    max_jobs: usize,

    /// Events buffered between the feed and the worker
    #[arg(long, default_value = "64")]
    queue_depth: usize,

    /// Do not run the GPU autoscaling loop
    #[arg(long)]
    no_autoscale: bool,
}

fn parse_input(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, p)| (k.to_string(), p.to_string()))
        .filter(|(k, p)| !k.is_empty() && !p.is_empty())
        .ok_or_else(|| format!("expected key=path, got {s}"))
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct LogsOutput {
    user_lines: Vec<String>,
    internal_lines: usize,
    user_error: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn load_config(path: Option<&Path>) -> Result<RunnerConfig, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => RunnerConfig::from_file(path)?,
        None => RunnerConfig::default(),
    })
}

/// Follow the backend's event channel for the lifetime of `shutdown`.
async fn spawn_event_watcher(
    config: &RunnerConfig,
    router: EventRouter,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    match config.backend {
        BackendKind::Docker => {
            let cli = DockerCli::new(config.docker.docker_bin.clone());
            tokio::spawn(async move { cli.watch_events(router, shutdown).await });
        }
        BackendKind::Kubernetes => {
            let cluster = KubeCluster::connect(&config.kubernetes.namespace).await?;
            tokio::spawn(async move { cluster.watch_events(router, shutdown).await });
        }
    }
    Ok(())
}

/// Lines of stdin, read on a dedicated thread so a blocked read never holds
/// up runtime shutdown.
fn stdin_lines() -> impl Stream<Item = std::io::Result<String>> + Unpin {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let failed = line.is_err();
            if tx.send(line).is_err() || failed {
                break;
            }
        }
    });
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|line| (line, rx))
    }))
}

fn print_job(job: &Job, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(job)?);
        }
        OutputFormat::Table => {
            println!("Job ID:          {}", job.id);
            println!("Status:          {}", job.status);
            println!("Image:           {}", job.image_reference);
            if let Some(exit_code) = job.exit_code {
                println!("Exit Code:       {}", exit_code);
            }
            if let (Some(start), Some(end)) = (job.started_at, job.completed_at) {
                println!("Duration:        {}ms", (end - start).num_milliseconds());
            }
            if let Some(metrics) = job.metrics {
                println!("Peak Memory:     {} bytes", metrics.peak_memory_bytes);
                println!("CPU Seconds:     {:.1}", metrics.cpu_seconds);
                if metrics.gpu_seconds > 0.0 {
                    println!("GPU Seconds:     {:.1}", metrics.gpu_seconds);
                }
            }
            if !job.output_keys.is_empty() {
                println!("Outputs:");
                for key in &job.output_keys {
                    println!("  {}", key);
                }
            }
            if !job.log.is_empty() {
                println!("Log:");
                for line in &job.log {
                    println!("  {}", line);
                }
            }
            if let Some(ref error) = job.error {
                println!("Error:           {}", error);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_run(
    mut config: RunnerConfig,
    args: RunArgs,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(backend) = args.backend {
        config = config.with_backend(backend);
    }
    if let Some(ms) = args.poll_interval_ms {
        config = config.with_poll_interval_ms(ms);
    }

    let requirements = ResourceRequirements {
        memory_limit_gb: args.memory_gb,
        requires_gpu: args.gpu.is_some(),
        gpu_type: args.gpu.unwrap_or_default(),
        time_limit_seconds: args.time_limit,
        use_warm_pool: args.warm_pool,
    };
    let mut job = Job::new(args.image).with_requirements(requirements);
    for (key, path) in args.inputs {
        job = job.with_input(key, path);
    }
    for path in args.outputs {
        job = job.with_output(path);
    }
    let job_id = job.id;

    let objects = storage::open(&config).await;
    let backend = Backend::connect(&config, objects).await?;
    let jobs: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    jobs.insert(job).await?;

    let shutdown = install_shutdown_handler()?;
    let router = EventRouter::new();
    let watcher = CancellationToken::new();
    spawn_event_watcher(&config, router.clone(), watcher.clone()).await?;

    let dispatcher = Dispatcher::new(
        jobs.clone(),
        Arc::new(backend),
        Arc::new(LogNotifier),
        config.limits.clone(),
        config.poll_interval(),
    )
    .with_shutdown(shutdown)
    .with_router(router);

    tracing::info!(job_id = %job_id, backend = %config.backend, "Dispatching job");
    let result = dispatcher.dispatch(job_id).await;
    watcher.cancel();

    if let Some(job) = jobs.get(&job_id).await {
        print_job(&job, output_format)?;
    }
    result?;
    Ok(())
}

async fn handle_serve(
    mut config: RunnerConfig,
    args: ServeArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(backend) = args.backend {
        config = config.with_backend(backend);
    }

    let shutdown = install_shutdown_handler()?;
    let objects = storage::open(&config).await;
    let backend = Backend::connect(&config, objects).await?;
    let jobs: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::with_capacity(args.max_jobs));

    let router = EventRouter::new();
    spawn_event_watcher(&config, router.clone(), shutdown.clone()).await?;

    let dispatcher = Dispatcher::new(
        jobs.clone(),
        Arc::new(backend),
        Arc::new(LogNotifier),
        config.limits.clone(),
        config.poll_interval(),
    )
    .with_shutdown(shutdown.clone())
    .with_router(router);

    // Separate token: the autoscaler outlives the feed while runs drain
    let autoscale_stop = CancellationToken::new();
    let autoscaler = (!args.no_autoscale).then(|| {
        let autoscaler = Autoscaler::new(
            jobs.clone(),
            Arc::new(LogScalingSink),
            config.autoscale.clone(),
        );
        tokio::spawn(autoscaler.run(autoscale_stop.clone()))
    });

    let (tx, rx) = mpsc::channel(args.queue_depth.max(1));
    let worker_task = tokio::spawn(Worker::new(Arc::new(dispatcher), shutdown.clone()).run(rx));

    tracing::info!(
        backend = %config.backend,
        max_jobs = args.max_jobs,
        autoscale = !args.no_autoscale,
        "Worker ready, reading tasks from stdin"
    );
    let sent = worker::feed(stdin_lines(), jobs.clone(), tx, shutdown.clone()).await?;

    worker_task.await?;
    autoscale_stop.cancel();
    if let Some(handle) = autoscaler {
        handle.await?;
    }
    // Stop the event watcher once the last run is committed
    shutdown.cancel();
    tracing::info!(tasks = sent, "Worker exited");
    Ok(())
}

fn handle_logs(file: &Path, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(file)?;
    let mut buffer = LogBuffer::default();
    buffer.extend(text.lines().map(str::to_string), LogSource::Stdout);

    let output = LogsOutput {
        user_lines: buffer.user_lines(),
        internal_lines: buffer.internal_lines().len(),
        user_error: user_error(&text),
    };
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("User Lines:      {}", output.user_lines.len());
            println!("Internal Lines:  {}", output.internal_lines);
            for line in &output.user_lines {
                println!("  {}", line);
            }
            println!("Error:           {}", output.user_error);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Commands::Run(run_args) => {
            handle_run(config, run_args, &args.output).await?;
        }
        Commands::Serve(serve_args) => {
            handle_serve(config, serve_args).await?;
        }
        Commands::Logs { file } => {
            handle_logs(&file, &args.output)?;
        }
    }

    Ok(())
}
