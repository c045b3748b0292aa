
use std::time::Duration;

use job_runner::scheduler::{Job, JobStatus};
use job_runner::worker::{feed, JobEvent, Worker};
use tokio_util::sync::CancellationToken;
use test_harness::{wait_for, FakeDocker, Script, TestRunner};
use tokio::sync::mpsc;

async fn wait_for_status(runner: &TestRunner, id: uuid::Uuid, status: JobStatus) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if runner.job(id).await.status == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_duplicate_created_events_run_once() {
    let docker = FakeDocker::new();
    docker.script("algo:1", Script::exit(0).with_output("out.txt", b"ok").after_polls(2));
    let runner = TestRunner::docker(&docker);
    let id = runner.submit(Job::new("algo:1")).await;

    let (tx, rx) = mpsc::channel(8);
    let worker = Worker::new(runner.dispatcher.clone(), runner.shutdown.clone());
    let handle = tokio::spawn(worker.run(rx));

    tx.send(JobEvent::Created { job_id: id }).await.unwrap();
    tx.send(JobEvent::Created { job_id: id }).await.unwrap();
    drop(tx);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(runner.job(id).await.status, JobStatus::Success);
    assert_eq!(docker.starts(), 1);
}

#[tokio::test]
async fn test_cancel_event_stops_running_job() {
    let docker = FakeDocker::new();
    docker.script("sleeper:1", Script::forever());
    let runner = TestRunner::docker(&docker);
    let id = runner.submit(Job::new("sleeper:1")).await;

    let (tx, rx) = mpsc::channel(8);
    let worker = Worker::new(runner.dispatcher.clone(), runner.shutdown.clone());
    let handle = tokio::spawn(worker.run(rx));

    tx.send(JobEvent::Created { job_id: id }).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || docker.running() == 1).await);

    tx.send(JobEvent::Cancel { job_id: id }).await.unwrap();
    assert!(wait_for_status(&runner, id, JobStatus::Cancelled).await);
    assert_eq!(docker.container_count(), 0);

    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_cancel_before_created_skips_run() {
    let docker = FakeDocker::new();
    docker.script("algo:1", Script::exit(0).with_output("out.txt", b"ok"));
    let runner = TestRunner::docker(&docker);
    let id = runner.submit(Job::new("algo:1")).await;

    let (tx, rx) = mpsc::channel(8);
    let worker = Worker::new(runner.dispatcher.clone(), runner.shutdown.clone());
    let handle = tokio::spawn(worker.run(rx));

    tx.send(JobEvent::Cancel { job_id: id }).await.unwrap();
    tx.send(JobEvent::Created { job_id: id }).await.unwrap();
    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(runner.job(id).await.status, JobStatus::Cancelled);
    assert_eq!(docker.starts(), 0);
}

#[tokio::test]
async fn test_shutdown_moves_in_flight_jobs_to_retry() {
    let docker = FakeDocker::new();
    docker.script("sleeper:1", Script::forever());
    let runner = TestRunner::docker(&docker);
    let first = runner.submit(Job::new("sleeper:1")).await;
    let second = runner.submit(Job::new("sleeper:1")).await;

    let (tx, rx) = mpsc::channel(8);
    let worker = Worker::new(runner.dispatcher.clone(), runner.shutdown.clone());
    let handle = tokio::spawn(worker.run(rx));

    tx.send(JobEvent::Created { job_id: first }).await.unwrap();
    tx.send(JobEvent::Created { job_id: second }).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || docker.running() == 2).await);

    runner.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(runner.job(first).await.status, JobStatus::Retry);
    assert_eq!(runner.job(second).await.status, JobStatus::Retry);
    assert_eq!(docker.container_count(), 0);
    assert_eq!(docker.network_count(), 0);
}

#[tokio::test]
async fn test_unknown_job_does_not_stop_worker() {
    let docker = FakeDocker::new();
    docker.script("algo:1", Script::exit(0).with_output("out.txt", b"ok"));
    let runner = TestRunner::docker(&docker);
    let id = runner.submit(Job::new("algo:1")).await;

    let (tx, rx) = mpsc::channel(8);
    let worker = Worker::new(runner.dispatcher.clone(), runner.shutdown.clone());
    let handle = tokio::spawn(worker.run(rx));

    tx.send(JobEvent::Created {
        job_id: uuid::Uuid::new_v4(),
    })
    .await
    .unwrap();
    tx.send(JobEvent::Created { job_id: id }).await.unwrap();
    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(runner.job(id).await.status, JobStatus::Success);
}

#[tokio::test]
async fn test_task_feed_drives_worker() {
    let docker = FakeDocker::new();
    docker.script("algo:1", Script::exit(0).with_output("out.txt", b"ok"));
    let runner = TestRunner::docker(&docker);
    let id = uuid::Uuid::new_v4();
    let lines = vec![Ok(format!(
        r#"{{"type": "submit", "job_id": "{id}", "image": "algo:1", "outputs": ["out.txt"], "submitter": "alice"}}"#
    ))];

    let (tx, rx) = mpsc::channel(8);
    let worker = Worker::new(runner.dispatcher.clone(), runner.shutdown.clone());
    let handle = tokio::spawn(worker.run(rx));

    let sent = feed(
        futures::stream::iter(lines),
        runner.jobs.clone(),
        tx,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(sent, 1);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    let job = runner.job(id).await;
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.submitter.as_deref(), Some("alice"));
}
