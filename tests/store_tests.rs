use job_runner::error::{RunnerError, TransitionError};
use job_runner::scheduler::{
    Completion, GpuDemand, GpuType, InMemoryJobStore, Job, JobStatus, JobStore,
    ResourceRequirements,
};
use uuid::Uuid;

fn gpu_job(warm: bool) -> Job {
    Job::new("trainer:1").with_requirements(ResourceRequirements {
        requires_gpu: true,
        gpu_type: GpuType::T4,
        use_warm_pool: warm,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_claim_moves_pending_to_started() {
    let store = InMemoryJobStore::new();
    let job = Job::new("alpine:3");
    let id = job.id;
    store.insert(job).await.unwrap();

    let claimed = store.claim(&id).await.unwrap();
    assert_eq!(claimed.status, JobStatus::Started);
    assert!(claimed.started_at.is_some());
    assert_eq!(store.get(&id).await.unwrap().status, JobStatus::Started);
}

#[tokio::test]
async fn test_second_claim_is_duplicate() {
    let store = InMemoryJobStore::new();
    let job = Job::new("alpine:3");
    let id = job.id;
    store.insert(job).await.unwrap();

    store.claim(&id).await.unwrap();
    let err = store.claim(&id).await.unwrap_err();
    assert!(matches!(
        err,
        RunnerError::DuplicateInvocation {
            status: JobStatus::Started,
            ..
        }
    ));
}

#[tokio::test]
async fn test_retry_can_be_claimed_again() {
    let store = InMemoryJobStore::new();
    let job = Job::new("alpine:3");
    let id = job.id;
    store.insert(job).await.unwrap();

    let first = store.claim(&id).await.unwrap();
    store
        .complete(&id, Completion::new(JobStatus::Retry))
        .await
        .unwrap();
    let second = store.claim(&id).await.unwrap();

    assert_eq!(second.status, JobStatus::Started);
    // started_at keeps the first attempt's time
    assert_eq!(second.started_at, first.started_at);
}

#[tokio::test]
async fn test_claim_unknown_job() {
    let store = InMemoryJobStore::new();
    let id = Uuid::new_v4();
    assert!(matches!(
        store.claim(&id).await.unwrap_err(),
        RunnerError::JobNotFound(missing) if missing == id
    ));
}

#[tokio::test]
async fn test_complete_commits_result_fields() {
    let store = InMemoryJobStore::new();
    let job = Job::new("alpine:3");
    let id = job.id;
    store.insert(job).await.unwrap();
    store.claim(&id).await.unwrap();

    store
        .record_log(&id, vec!["done".into()], vec!["raw done".into()])
        .await
        .unwrap();
    let done = store
        .complete(
            &id,
            Completion {
                exit_code: Some(0),
                output_keys: vec!["outputs/x".into()],
                ..Completion::new(JobStatus::Success)
            },
        )
        .await
        .unwrap();

    assert_eq!(done.status, JobStatus::Success);
    assert_eq!(done.exit_code, Some(0));
    assert_eq!(done.output_keys, vec!["outputs/x".to_string()]);
    assert_eq!(done.log, vec!["done".to_string()]);
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn test_terminal_job_rejects_changes() {
    let store = InMemoryJobStore::new();
    let job = Job::new("alpine:3");
    let id = job.id;
    store.insert(job).await.unwrap();
    store.claim(&id).await.unwrap();
    store
        .complete(&id, Completion::failure("boom"))
        .await
        .unwrap();

    let err = store
        .record_log(&id, vec!["late".into()], Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::Illegal { .. }));

    let err = store
        .complete(&id, Completion::new(JobStatus::Success))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransitionError::Illegal {
            from: JobStatus::Failure,
            to: JobStatus::Success,
            ..
        }
    ));

    let job = store.get(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failure);
    assert_eq!(job.error.as_deref(), Some("boom"));
    assert!(job.log.is_empty());
}

#[tokio::test]
async fn test_cancel_pending_only_before_start() {
    let store = InMemoryJobStore::new();
    let queued = Job::new("alpine:3");
    let running = Job::new("alpine:3");
    let (queued_id, running_id) = (queued.id, running.id);
    store.insert(queued).await.unwrap();
    store.insert(running).await.unwrap();
    store.claim(&running_id).await.unwrap();

    assert!(store.cancel_pending(&queued_id).await.unwrap());
    assert!(!store.cancel_pending(&running_id).await.unwrap());
    // Already cancelled
    assert!(!store.cancel_pending(&queued_id).await.unwrap());

    assert_eq!(
        store.get(&queued_id).await.unwrap().status,
        JobStatus::Cancelled
    );
    assert_eq!(
        store.get(&running_id).await.unwrap().status,
        JobStatus::Started
    );
    assert!(matches!(
        store.claim(&queued_id).await.unwrap_err(),
        RunnerError::DuplicateInvocation { .. }
    ));
}

#[tokio::test]
async fn test_capacity_limit() {
    let store = InMemoryJobStore::with_capacity(2);
    store.insert(Job::new("a")).await.unwrap();
    store.insert(Job::new("b")).await.unwrap();

    let err = store.insert(Job::new("c")).await.unwrap_err();
    assert!(matches!(err, RunnerError::QueueFull));
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn test_reinsert_keeps_existing_record() {
    let store = InMemoryJobStore::new();
    let job = Job::new("alpine:3");
    let id = job.id;
    store.insert(job.clone()).await.unwrap();
    store.claim(&id).await.unwrap();

    store.insert(job).await.unwrap();
    assert_eq!(store.get(&id).await.unwrap().status, JobStatus::Started);
}

#[tokio::test]
async fn test_gpu_demand_counts_by_state() {
    let store = InMemoryJobStore::new();
    let queued = gpu_job(true);
    let active = gpu_job(false);
    let done = gpu_job(true);
    let cpu_only = Job::new("alpine:3");
    let (active_id, done_id) = (active.id, done.id);
    for job in [queued, active, done, cpu_only] {
        store.insert(job).await.unwrap();
    }
    store.claim(&active_id).await.unwrap();
    store.claim(&done_id).await.unwrap();
    store
        .complete(&done_id, Completion::new(JobStatus::Success))
        .await
        .unwrap();

    assert_eq!(
        store.gpu_demand().await,
        GpuDemand {
            queued: 1,
            active: 1,
            warm_requests: 1,
        }
    );
}

#[tokio::test]
async fn test_full_store_makes_room_from_finished_jobs() {
    let store = InMemoryJobStore::with_capacity(2);
    let finished = Job::new("a");
    let running = Job::new("b");
    let (finished_id, running_id) = (finished.id, running.id);
    store.insert(finished).await.unwrap();
    store.insert(running).await.unwrap();
    store.claim(&finished_id).await.unwrap();
    store.claim(&running_id).await.unwrap();
    store
        .complete(&finished_id, Completion::new(JobStatus::Failure))
        .await
        .unwrap();

    let next = Job::new("c");
    let next_id = next.id;
    store.insert(next).await.unwrap();
    assert!(store.get(&finished_id).await.is_none());
    assert_eq!(store.get(&running_id).await.unwrap().status, JobStatus::Started);
    assert_eq!(store.get(&next_id).await.unwrap().status, JobStatus::Pending);

    let err = store.insert(Job::new("d")).await.unwrap_err();
    assert!(matches!(err, RunnerError::QueueFull));
}
