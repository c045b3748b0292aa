
use std::sync::Arc;
use std::time::Duration;

use job_runner::config::{DockerConfig, PolicyLimits};
use job_runner::error::ExecutorError;
use job_runner::executor::docker::container_name;
use job_runner::executor::{
    BackendEvent, ContainerEvent, ContainerState, DockerBackend, DockerExecutor, Executor,
    ExecutorContext, ExecutorGuard, ResourcePolicy,
};
use job_runner::scheduler::{GpuType, Job, ResourceRequirements};
use job_runner::storage::FsObjectStore;
use tempfile::TempDir;
use test_harness::{wait_for, FakeDocker, Script};

struct Fixture {
    _dir: TempDir,
    backend: DockerBackend,
}

fn fixture(fake: &FakeDocker, gpu_devices: Vec<String>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ExecutorContext {
        store: Arc::new(FsObjectStore::new(dir.path().join("store"))),
        log_retention_lines: 100,
    };
    let config = DockerConfig {
        work_root: dir.path().join("work"),
        gpu_devices,
        ..Default::default()
    };
    Fixture {
        backend: DockerBackend::new(Arc::new(fake.clone()), config, ctx),
        _dir: dir,
    }
}

fn executor_for(backend: &DockerBackend, job: &Job) -> DockerExecutor {
    let policy = ResourcePolicy::resolve(&job.requirements, &PolicyLimits::default(), true).unwrap();
    backend.executor(job, policy).unwrap()
}

fn gpu_job() -> Job {
    Job::new("trainer:1").with_requirements(ResourceRequirements {
        requires_gpu: true,
        gpu_type: GpuType::T4,
        ..Default::default()
    })
}

async fn poll_until_exit(executor: &mut DockerExecutor) -> i64 {
    for _ in 0..100 {
        if let ContainerState::Exited(code) = executor.poll().await.unwrap() {
            return code;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("container never exited");
}

#[tokio::test]
async fn test_execute_poll_and_collect() {
    let docker = FakeDocker::new();
    docker.script(
        "algo:1",
        Script::exit(0)
            .with_log(r#"{"log": "step 1", "internal": false}"#)
            .with_output("result.csv", b"a,b")
            .after_polls(2),
    );
    let fx = fixture(&docker, Vec::new());
    let job = Job::new("algo:1").with_output("result.csv");
    let mut executor = executor_for(&fx.backend, &job);

    executor.execute().await.unwrap();
    assert_eq!(executor.poll().await.unwrap(), ContainerState::Running);
    assert_eq!(poll_until_exit(&mut executor).await, 0);

    assert_eq!(executor.logs().user_lines(), vec!["step 1".to_string()]);
    let keys = executor.collect_outputs().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].ends_with("result.csv"));

    let metrics = executor.runtime_metrics();
    assert_eq!(metrics.gpu_seconds, 0.0);
    assert!(executor.external_admin_url().is_none());

    executor.cleanup().await.unwrap();
    assert_eq!(docker.container_count(), 0);
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let docker = FakeDocker::new();
    docker.script("algo:1", Script::forever());
    let fx = fixture(&docker, Vec::new());
    let job = Job::new("algo:1");
    let mut executor = executor_for(&fx.backend, &job);

    executor.execute().await.unwrap();
    executor.cleanup().await.unwrap();
    executor.cleanup().await.unwrap();

    assert_eq!(docker.container_count(), 0);
    assert_eq!(docker.network_count(), 0);
    assert!(fx.backend.leftover_resources(job.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cleanup_before_execute_is_noop() {
    let docker = FakeDocker::new();
    let fx = fixture(&docker, Vec::new());
    let mut executor = executor_for(&fx.backend, &Job::new("algo:1"));

    executor.cleanup().await.unwrap();
    assert_eq!(docker.starts(), 0);
}

#[tokio::test]
async fn test_failed_cleanup_can_be_retried() {
    let docker = FakeDocker::new();
    docker.script("algo:1", Script::forever());
    let fx = fixture(&docker, Vec::new());
    let job = Job::new("algo:1");
    let mut executor = executor_for(&fx.backend, &job);
    executor.execute().await.unwrap();

    docker.set_unreachable(true);
    let err = executor.cleanup().await.unwrap_err();
    assert!(err.is_infrastructure());
    assert_eq!(docker.container_count(), 1);

    docker.set_unreachable(false);
    executor.cleanup().await.unwrap();
    assert_eq!(docker.container_count(), 0);
    assert_eq!(docker.network_count(), 0);
}

#[tokio::test]
async fn test_dropped_guard_cleans_up() {
    let docker = FakeDocker::new();
    docker.script("algo:1", Script::forever());
    let fx = fixture(&docker, Vec::new());
    let job = Job::new("algo:1");

    let mut guard = ExecutorGuard::new(Box::new(executor_for(&fx.backend, &job)));
    guard.executor().execute().await.unwrap();
    assert_eq!(docker.container_count(), 1);

    drop(guard);
    assert!(wait_for(Duration::from_secs(2), || docker.container_count() == 0).await);
    assert!(wait_for(Duration::from_secs(2), || docker.network_count() == 0).await);
}

#[tokio::test]
async fn test_kill_stops_container() {
    let docker = FakeDocker::new();
    docker.script("algo:1", Script::forever());
    let fx = fixture(&docker, Vec::new());
    let mut executor = executor_for(&fx.backend, &Job::new("algo:1"));

    executor.execute().await.unwrap();
    assert_eq!(docker.running(), 1);
    executor.kill().await.unwrap();

    assert_eq!(docker.running(), 0);
    assert_eq!(executor.poll().await.unwrap(), ContainerState::Exited(137));
    executor.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_gpu_device_is_exclusive() {
    let docker = FakeDocker::new();
    docker.script("trainer:1", Script::forever());
    let fx = fixture(&docker, vec!["0".into()]);
    let first = gpu_job();
    let second = gpu_job();

    let mut a = executor_for(&fx.backend, &first);
    let mut b = executor_for(&fx.backend, &second);
    a.execute().await.unwrap();
    assert_eq!(fx.backend.gpus().holder("0"), Some(first.id));

    let err = b.execute().await.unwrap_err();
    assert!(matches!(err, ExecutorError::Unsatisfiable(_)));
    b.cleanup().await.unwrap();

    a.cleanup().await.unwrap();
    assert_eq!(fx.backend.gpus().available(), 1);

    let mut c = executor_for(&fx.backend, &second);
    c.execute().await.unwrap();
    assert_eq!(fx.backend.gpus().holder("0"), Some(second.id));
    assert_eq!(
        docker.created_specs().last().unwrap().gpu_device.as_deref(),
        Some("0")
    );
    c.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_die_event_is_used_instead_of_inspect() {
    let docker = FakeDocker::new();
    docker.script("algo:1", Script::forever());
    let fx = fixture(&docker, Vec::new());
    let job = Job::new("algo:1");
    let mut executor = executor_for(&fx.backend, &job);
    executor.execute().await.unwrap();

    let event = BackendEvent::Container(ContainerEvent {
        container: container_name(job.id),
        action: "die".into(),
        exit_code: Some(2),
    });
    assert_eq!(DockerExecutor::get_job_name(&event), Some(job.id));
    executor.handle_event(&event);

    assert_eq!(executor.poll().await.unwrap(), ContainerState::Exited(2));
    executor.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_unsafe_paths_are_rejected() {
    let docker = FakeDocker::new();
    let fx = fixture(&docker, Vec::new());
    let policy = ResourcePolicy::resolve(
        &ResourceRequirements::default(),
        &PolicyLimits::default(),
        true,
    )
    .unwrap();

    let job = Job::new("algo:1").with_input("uploads/a", "../../etc/passwd");
    assert!(fx.backend.executor(&job, policy.clone()).is_err());

    let job = Job::new("algo:1").with_output("/abs/path");
    assert!(fx.backend.executor(&job, policy).is_err());
}
