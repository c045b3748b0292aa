use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, WatchEvent, WatchParams};
use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;
use crate::executor::docker::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::executor::kubernetes::manifest::CONTAINER_NAME;
use crate::executor::BackendEvent;
use crate::worker::EventRouter;

const WATCH_BACKOFF: Duration = Duration::from_secs(5);

/// Operations the Kubernetes executor needs from the cluster API.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_job(&self, job: &KubeJob) -> Result<(), ExecutorError>;

    async fn get_job(&self, name: &str) -> Result<Option<KubeJob>, ExecutorError>;

    /// Delete with background propagation so pods go too. Idempotent.
    async fn delete_job(&self, name: &str) -> Result<(), ExecutorError>;

    /// Pods created for the batch Job `job_name`.
    async fn list_pods(&self, job_name: &str) -> Result<Vec<Pod>, ExecutorError>;

    /// Timestamped log text of the job container, from `since` on if given.
    async fn pod_logs(
        &self,
        pod: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<String, ExecutorError>;

    /// Names of Jobs carrying `key=value`.
    async fn list_jobs(&self, key: &str, value: &str) -> Result<Vec<String>, ExecutorError>;
}

/// [`ClusterApi`] backed by a `kube` client, scoped to one namespace.
#[derive(Clone)]
pub struct KubeCluster {
    jobs: Api<KubeJob>,
    pods: Api<Pod>,
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

impl KubeCluster {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            jobs: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client, namespace),
        }
    }

    /// Connect using the in-cluster config or the local kubeconfig.
    pub async fn connect(namespace: &str) -> Result<Self, ExecutorError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    /// Stream Job changes of this runner into `router` until `shutdown`.
    ///
    /// Watches time out server-side; the loop re-establishes them and backs
    /// off after errors.
    pub async fn watch_events(&self, router: EventRouter, shutdown: CancellationToken) {
        let selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);
        let params = WatchParams::default().labels(&selector);

        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => return,
                stream = self.jobs.watch(&params, "0") => stream,
            };

            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "Job watch failed, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(WATCH_BACKOFF) => continue,
                    }
                }
            };
            let mut stream = std::pin::pin!(stream);

            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    next = stream.try_next() => next,
                };
                match next {
                    Ok(Some(WatchEvent::Added(job))) | Ok(Some(WatchEvent::Modified(job))) => {
                        router.route(BackendEvent::KubeJob(Box::new(job)));
                    }
                    Ok(Some(WatchEvent::Error(resp))) => {
                        tracing::warn!(code = resp.code, message = %resp.message, "Watch error event");
                        break;
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Job watch stream broke");
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_job(&self, job: &KubeJob) -> Result<(), ExecutorError> {
        self.jobs.create(&PostParams::default(), job).await?;
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Option<KubeJob>, ExecutorError> {
        Ok(self.jobs.get_opt(name).await?)
    }

    async fn delete_job(&self, name: &str) -> Result<(), ExecutorError> {
        match self.jobs.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods(&self, job_name: &str) -> Result<Vec<Pod>, ExecutorError> {
        let params = ListParams::default().labels(&format!("job-name={job_name}"));
        Ok(self.pods.list(&params).await?.items)
    }

    async fn pod_logs(
        &self,
        pod: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<String, ExecutorError> {
        let params = LogParams {
            container: Some(CONTAINER_NAME.to_string()),
            since_time: since,
            timestamps: true,
            ..Default::default()
        };
        Ok(self.pods.logs(pod, &params).await?)
    }

    async fn list_jobs(&self, key: &str, value: &str) -> Result<Vec<String>, ExecutorError> {
        let params = ListParams::default().labels(&format!("{key}={value}"));
        Ok(self
            .jobs
            .list(&params)
            .await?
            .items
            .into_iter()
            .filter_map(|job| job.metadata.name)
            .collect())
    }
}
