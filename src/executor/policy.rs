use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::config::{AutoscaleConfig, PolicyLimits};
use crate::error::ExecutorError;
use crate::scheduler::store::GpuDemand;
use crate::scheduler::{GpuType, ResourceRequirements};

/// Limits resolved once per job and applied to its container.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePolicy {
    pub memory_limit_gb: u32,
    pub cpu_cores: f64,
    pub gpu: Option<GpuType>,
    pub time_limit: Duration,
    pub network_disabled: bool,
}

impl ResourcePolicy {
    pub fn resolve(
        req: &ResourceRequirements,
        limits: &PolicyLimits,
        network_disabled: bool,
    ) -> Result<Self, ExecutorError> {
        if req.memory_limit_gb == 0 {
            return Err(ExecutorError::InvalidSpec(
                "memory_limit_gb must be at least 1".into(),
            ));
        }
        if req.memory_limit_gb > limits.max_memory_gb {
            return Err(ExecutorError::Unsatisfiable(format!(
                "{} GB of memory requested, at most {} GB is available",
                req.memory_limit_gb, limits.max_memory_gb
            )));
        }
        if req.time_limit_seconds == 0 {
            return Err(ExecutorError::InvalidSpec(
                "time_limit_seconds must be positive".into(),
            ));
        }
        if req.time_limit_seconds > limits.max_time_limit_seconds {
            return Err(ExecutorError::Unsatisfiable(format!(
                "time limit of {}s exceeds the maximum of {}s",
                req.time_limit_seconds, limits.max_time_limit_seconds
            )));
        }

        let gpu = if req.requires_gpu {
            match req.gpu_type {
                GpuType::None => match limits.default_gpu_type {
                    GpuType::None => {
                        return Err(ExecutorError::Unsatisfiable(
                            "GPU required but no GPU type is configured".into(),
                        ))
                    }
                    default => Some(default),
                },
                requested => Some(requested),
            }
        } else {
            None
        };

        let per_cpu = limits.memory_gb_per_cpu.max(1);
        let cores = req.memory_limit_gb.div_ceil(per_cpu) as f64;
        let cpu_cores = cores.clamp(1.0, limits.max_cpu_cores.max(1.0));

        Ok(Self {
            memory_limit_gb: req.memory_limit_gb,
            cpu_cores,
            gpu,
            time_limit: Duration::from_secs(req.time_limit_seconds),
            network_disabled,
        })
    }

    pub fn requires_gpu(&self) -> bool {
        self.gpu.is_some()
    }

    pub fn memory_bytes(&self) -> u64 {
        u64::from(self.memory_limit_gb) * 1024 * 1024 * 1024
    }

    /// Memory in docker CLI notation, e.g. `4g`.
    pub fn docker_memory(&self) -> String {
        format!("{}g", self.memory_limit_gb)
    }

    /// Relative CPU weight, 1024 per reserved core.
    pub fn cpu_shares(&self) -> i64 {
        (self.cpu_cores * 1024.0).round() as i64
    }

    /// Memory as a Kubernetes quantity, e.g. `4Gi`.
    pub fn kube_memory(&self) -> String {
        format!("{}Gi", self.memory_limit_gb)
    }

    /// CPU as a Kubernetes quantity in millicores.
    pub fn kube_cpu(&self) -> String {
        format!("{}m", (self.cpu_cores * 1000.0).round() as i64)
    }

    pub fn time_limit_seconds(&self) -> u64 {
        self.time_limit.as_secs()
    }
}

#[derive(Debug, Default)]
struct GpuPool {
    free: Vec<String>,
    leased: HashMap<String, Uuid>,
}

/// Hands out physical GPU devices, one job per device.
#[derive(Debug, Clone, Default)]
pub struct GpuAllocator {
    pool: Arc<Mutex<GpuPool>>,
}

impl GpuAllocator {
    pub fn new(devices: Vec<String>) -> Self {
        let mut free = devices;
        free.reverse();
        Self {
            pool: Arc::new(Mutex::new(GpuPool {
                free,
                leased: HashMap::new(),
            })),
        }
    }

    /// Claim a free device for `job_id`, exclusively.
    pub fn claim(&self, job_id: Uuid) -> Result<GpuLease, ExecutorError> {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        let device = pool
            .free
            .pop()
            .ok_or_else(|| ExecutorError::Unsatisfiable("no GPU available".into()))?;
        pool.leased.insert(device.clone(), job_id);
        tracing::debug!(job_id = %job_id, device = %device, "GPU leased");
        Ok(GpuLease {
            device,
            pool: self.pool.clone(),
        })
    }

    pub fn available(&self) -> usize {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).free.len()
    }

    pub fn holder(&self, device: &str) -> Option<Uuid> {
        self.pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .leased
            .get(device)
            .copied()
    }
}

/// Exclusive claim on one GPU device, returned to the pool on drop.
#[derive(Debug)]
pub struct GpuLease {
    device: String,
    pool: Arc<Mutex<GpuPool>>,
}

impl GpuLease {
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Drop for GpuLease {
    fn drop(&mut self) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.leased.remove(&self.device);
        pool.free.push(self.device.clone());
    }
}

/// Turns GPU queue depth into a desired GPU node count.
#[derive(Debug, Clone)]
pub struct AutoscalePolicy {
    config: AutoscaleConfig,
}

impl AutoscalePolicy {
    pub fn new(config: AutoscaleConfig) -> Self {
        Self { config }
    }

    pub fn desired_gpu_nodes(&self, demand: GpuDemand) -> usize {
        let per_node = self.config.jobs_per_node.max(1);
        let needed = (demand.queued + demand.active).div_ceil(per_node);
        let floor = if demand.warm_requests > 0 {
            self.config.warm_pool_size.max(self.config.min_nodes)
        } else {
            self.config.min_nodes
        };
        needed
            .max(floor)
            .clamp(self.config.min_nodes, self.config.max_nodes.max(self.config.min_nodes))
    }
}
