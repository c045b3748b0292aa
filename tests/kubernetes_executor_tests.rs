
use std::time::Duration;

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use job_runner::config::{BackendKind, RunnerConfig, S3Config};
use job_runner::error::{ExecutorError, RunnerError};
use job_runner::executor::kubernetes::{job_name, CONTAINER_NAME};
use job_runner::executor::{Backend, BackendEvent};
use job_runner::scheduler::{GpuType, Job, JobStatus, ResourceRequirements};
use job_runner::storage::{input_key, output_key, FsObjectStore, ObjectStore};
use test_harness::{wait_for, FakeCluster, Script, TestRunner};

#[tokio::test]
async fn test_kube_job_success_verifies_outputs_in_store() {
    let (runner, cluster) = TestRunner::kubernetes(FakeCluster::new);
    cluster.script(
        "algo:1",
        Script::exit(0)
            .with_output("metrics.json", br#"{"acc": 0.5}"#)
            .after_polls(1),
    );
    let id = runner
        .submit(Job::new("algo:1").with_output("metrics.json"))
        .await;

    let job = runner.dispatcher.dispatch(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.exit_code, Some(0));
    assert_eq!(job.output_keys, vec![output_key(id, "metrics.json")]);
    let stored = runner.objects.get(&output_key(id, "metrics.json")).await.unwrap();
    assert_eq!(stored, br#"{"acc": 0.5}"#);

    assert_eq!(cluster.deleted(), vec![job_name(id)]);
    assert!(runner.leftovers(id).await.is_empty());
}

#[tokio::test]
async fn test_kube_manifest_carries_policy() {
    let (runner, cluster) = TestRunner::kubernetes(FakeCluster::new);
    cluster.script("trainer:1", Script::exit(0).with_output("model.bin", b"w"));
    let id = runner
        .submit(Job::new("trainer:1").with_requirements(ResourceRequirements {
            memory_limit_gb: 16,
            requires_gpu: true,
            gpu_type: GpuType::A10G,
            time_limit_seconds: 600,
            use_warm_pool: false,
        }))
        .await;

    let job = runner.dispatcher.dispatch(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Success);

    let created = cluster.created();
    assert_eq!(created.len(), 1);
    let spec = created[0].spec.as_ref().unwrap();
    assert_eq!(spec.active_deadline_seconds, Some(600));
    assert_eq!(spec.backoff_limit, Some(0));
    let pod = spec.template.spec.as_ref().unwrap();
    let limits = pod.containers[0]
        .resources
        .as_ref()
        .and_then(|r| r.limits.as_ref())
        .unwrap();
    assert_eq!(limits["memory"], Quantity("16Gi".into()));
    assert_eq!(limits["nvidia.com/gpu"], Quantity("1".into()));
    assert_eq!(
        pod.node_selector.as_ref().unwrap()["nvidia.com/gpu.product"],
        "NVIDIA-A10G"
    );
    assert!(job.metrics.unwrap().gpu_seconds >= 0.0);
}

#[tokio::test]
async fn test_kube_inputs_are_staged_under_job_prefix() {
    let (runner, cluster) = TestRunner::kubernetes(FakeCluster::new);
    cluster.script("algo:1", Script::exit(0).with_output("out.txt", b"ok"));
    runner.objects.put("uploads/case-1.nii", b"data").await.unwrap();
    let id = runner
        .submit(Job::new("algo:1").with_input("uploads/case-1.nii", "case.nii"))
        .await;

    runner.dispatcher.dispatch(id).await.unwrap();

    let staged = runner.objects.get(&input_key(id, "case.nii")).await.unwrap();
    assert_eq!(staged, b"data");
}

#[tokio::test]
async fn test_kube_failed_pod_reports_exit_code_and_error_line() {
    let (runner, cluster) = TestRunner::kubernetes(FakeCluster::new);
    cluster.script(
        "crash:1",
        Script::exit(3)
            .with_log(r#"{"log": "fetching credentials", "internal": true}"#)
            .with_log("Traceback (most recent call last):")
            .with_log("RuntimeError: CUDA out of memory"),
    );
    let id = runner
        .submit(Job::new("crash:1").with_submitter("bob"))
        .await;

    let job = runner.dispatcher.dispatch(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failure);
    assert_eq!(job.exit_code, Some(3));
    assert_eq!(job.error.as_deref(), Some("RuntimeError: CUDA out of memory"));
    assert_eq!(job.raw_log.len(), 3);
    // Unstructured lines are never shown to the submitter
    assert!(job.log.is_empty());
    assert_eq!(runner.notifier.sent()[0].submitter.as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_kube_missing_output_fails() {
    let (runner, cluster) = TestRunner::kubernetes(FakeCluster::new);
    cluster.script("lazy:1", Script::exit(0));
    let id = runner
        .submit(Job::new("lazy:1").with_output("metrics.json"))
        .await;

    let job = runner.dispatcher.dispatch(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failure);
    assert!(job.error.unwrap().contains("metrics.json"));
}

#[tokio::test]
async fn test_kube_timeout_deletes_job() {
    let (runner, cluster) = TestRunner::kubernetes(FakeCluster::new);
    cluster.script("sleeper:1", Script::forever());
    let id = runner
        .submit(Job::new("sleeper:1").with_requirements(ResourceRequirements {
            time_limit_seconds: 1,
            ..Default::default()
        }))
        .await;

    let job = runner.dispatcher.dispatch(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failure);
    assert!(job.error.unwrap().to_lowercase().contains("time limit"));
    assert_eq!(cluster.job_count(), 0);
    assert!(runner.leftovers(id).await.is_empty());
}

#[tokio::test]
async fn test_kube_watch_event_completes_run() {
    let (runner, cluster) = TestRunner::kubernetes(FakeCluster::new);
    cluster.set_watch_only(true);
    cluster.script("algo:1", Script::forever().with_output("out.txt", b"done"));
    let id = runner.submit(Job::new("algo:1")).await;

    let dispatcher = runner.dispatcher.clone();
    let handle = tokio::spawn(async move { dispatcher.dispatch(id).await });
    assert!(wait_for(Duration::from_secs(2), || cluster.job_count() == 1).await);

    let finished = FakeCluster::completed_job(&job_name(id), true);
    assert!(runner
        .dispatcher
        .router()
        .route(BackendEvent::KubeJob(Box::new(finished))));

    let job = handle.await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.output_keys, vec![output_key(id, "out.txt")]);
}

#[tokio::test]
async fn test_kube_cancel_deletes_job() {
    let (runner, cluster) = TestRunner::kubernetes(FakeCluster::new);
    cluster.script("sleeper:1", Script::forever());
    let id = runner.submit(Job::new("sleeper:1")).await;

    let dispatcher = runner.dispatcher.clone();
    let handle = tokio::spawn(async move { dispatcher.dispatch(id).await });
    assert!(wait_for(Duration::from_secs(2), || cluster.job_count() == 1).await);

    assert!(runner.dispatcher.cancel(id).await.unwrap());
    let job = handle.await.unwrap().unwrap();

    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(cluster.job_count(), 0);
    assert!(cluster.deleted().contains(&job_name(id)));
}

#[tokio::test]
async fn test_kube_duplicate_delivery_is_rejected() {
    let (runner, cluster) = TestRunner::kubernetes(FakeCluster::new);
    cluster.script("algo:1", Script::exit(0).with_output("out.txt", b"ok"));
    let id = runner.submit(Job::new("algo:1")).await;

    runner.dispatcher.dispatch(id).await.unwrap();
    let err = runner.dispatcher.dispatch(id).await.unwrap_err();

    assert!(matches!(err, RunnerError::DuplicateInvocation { .. }));
    assert_eq!(cluster.created().len(), 1);
}

#[tokio::test]
async fn test_kube_pending_pod_is_not_a_failure() {
    let (runner, cluster) = TestRunner::kubernetes(FakeCluster::new);
    cluster.set_pending_polls(2);
    cluster.script(
        "algo:1",
        Script::exit(0)
            .with_log(r#"{"log": "epoch 1", "internal": false}"#)
            .with_log(r#"{"log": "epoch 2", "internal": false}"#)
            .with_output("out.txt", b"ok")
            .after_polls(4),
    );
    let id = runner.submit(Job::new("algo:1").with_output("out.txt")).await;

    let job = runner.dispatcher.dispatch(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.log, vec!["epoch 1".to_string(), "epoch 2".to_string()]);
    // later polls re-read from the resume point without duplicating lines
    assert_eq!(job.raw_log.len(), 2);
    assert!(runner.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_kube_unscheduled_pod_keeps_waiting() {
    let (runner, cluster) = TestRunner::kubernetes(FakeCluster::new);
    cluster.set_unscheduled_polls(2);
    cluster.set_pending_polls(1);
    cluster.script(
        "trainer:1",
        Script::exit(0).with_output("model.bin", b"w").after_polls(5),
    );
    let id = runner
        .submit(Job::new("trainer:1").with_requirements(ResourceRequirements {
            requires_gpu: true,
            gpu_type: GpuType::A10G,
            ..Default::default()
        }))
        .await;

    let job = runner.dispatcher.dispatch(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.output_keys, vec![output_key(id, "model.bin")]);
}

#[tokio::test]
async fn test_kube_refused_log_read_is_retried_next_poll() {
    let (runner, cluster) = TestRunner::kubernetes(FakeCluster::new);
    cluster.set_refused_log_reads(2);
    cluster.script(
        "algo:1",
        Script::exit(0)
            .with_log(r#"{"log": "done", "internal": false}"#)
            .with_output("out.txt", b"ok")
            .after_polls(3),
    );
    let id = runner.submit(Job::new("algo:1")).await;

    let job = runner.dispatcher.dispatch(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.log, vec!["done".to_string()]);
    assert!(cluster.log_reads() > 2);
}

#[tokio::test]
async fn test_kube_pod_moves_data_through_bucket() {
    let bucket = S3Config {
        bucket: "jobs".into(),
        endpoint: Some("http://minio:9000".into()),
        region: None,
    };
    let (runner, cluster) = TestRunner::kubernetes_with(FakeCluster::new, Some(bucket));
    cluster.script("algo:1", Script::exit(0).with_output("out.txt", b"ok"));
    runner.objects.put("uploads/scan.nii", b"data").await.unwrap();
    let id = runner
        .submit(Job::new("algo:1").with_input("uploads/scan.nii", "scan.nii"))
        .await;

    let job = runner.dispatcher.dispatch(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Success);

    let created = cluster.created();
    let pod = created[0].spec.as_ref().unwrap().template.spec.as_ref().unwrap();
    assert_eq!(pod.containers[0].name, CONTAINER_NAME);
    let env = pod.containers[0].env.as_ref().unwrap();
    assert!(env
        .iter()
        .any(|e| e.name == "STORAGE_BUCKET" && e.value.as_deref() == Some("jobs")));
    let init: Vec<_> = pod
        .init_containers
        .as_ref()
        .unwrap()
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(init, vec!["fetch-inputs", "upload-outputs"]);
    // the init container downloads from here
    assert!(runner.objects.exists(&input_key(id, "scan.nii")).await.unwrap());
}

#[tokio::test]
async fn test_kube_backend_requires_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunnerConfig::default().with_backend(BackendKind::Kubernetes);
    let store = Arc::new(FsObjectStore::new(dir.path()));

    let err = match Backend::connect(&config, store).await {
        Ok(_) => panic!("kubernetes backend accepted a local store"),
        Err(e) => e,
    };
    assert!(matches!(err, ExecutorError::Storage(_)));
}
