use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::AutoscaleConfig;
use crate::executor::policy::AutoscalePolicy;
use crate::scheduler::store::JobStore;

/// Receiver of the desired GPU node count (cluster autoscaler, node pool API).
#[async_trait]
pub trait ScalingSink: Send + Sync {
    async fn set_desired_gpu_nodes(&self, nodes: usize);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogScalingSink;

#[async_trait]
impl ScalingSink for LogScalingSink {
    async fn set_desired_gpu_nodes(&self, nodes: usize) {
        tracing::info!(nodes, "Desired GPU node count changed");
    }
}

/// Control loop turning GPU queue depth into a node-pool size.
///
/// The signal is only emitted when it changes.
pub struct Autoscaler {
    store: Arc<dyn JobStore>,
    sink: Arc<dyn ScalingSink>,
    policy: AutoscalePolicy,
    interval: Duration,
    last: Option<usize>,
}

impl Autoscaler {
    pub fn new(store: Arc<dyn JobStore>, sink: Arc<dyn ScalingSink>, config: AutoscaleConfig) -> Self {
        let interval = Duration::from_millis(config.interval_ms.max(1));
        Self {
            store,
            sink,
            policy: AutoscalePolicy::new(config),
            interval,
            last: None,
        }
    }

    /// Compute the signal once. Returns the value if it was emitted.
    pub async fn tick(&mut self) -> Option<usize> {
        let demand = self.store.gpu_demand().await;
        let desired = self.policy.desired_gpu_nodes(demand);
        if self.last == Some(desired) {
            return None;
        }
        tracing::debug!(
            queued = demand.queued,
            active = demand.active,
            warm = demand.warm_requests,
            desired,
            "GPU demand"
        );
        self.sink.set_desired_gpu_nodes(desired).await;
        self.last = Some(desired);
        Some(desired)
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Autoscaler stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}
