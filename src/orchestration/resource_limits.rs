//! # System Resource Detection and Worker Sizing
//!
//! Computes a worker count once, when the worker pool starts, from available CPU
//! parallelism and memory headroom. Handlers are I/O bound, so CPU cores are scaled by
//! `workers_per_core`; memory caps the count at `available / per_worker_memory_mb`.

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, info};

use crate::config::WorkerPoolConfig;

/// Detected system resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemResources {
    pub cpu_cores: usize,
    /// Total memory in MB, `None` when detection failed
    pub total_memory_mb: Option<u64>,
    /// Memory available to new workers in MB
    pub available_memory_mb: Option<u64>,
    pub detected_at: chrono::DateTime<chrono::Utc>,
}

impl SystemResources {
    /// Best-effort detection of CPU parallelism and memory
    pub fn detect() -> Self {
        let cpu_cores = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);
        let (total_memory_mb, available_memory_mb) = Self::detect_memory_limits();

        debug!(
            cpu_cores,
            total_memory_mb, available_memory_mb, "Detected system resources"
        );

        Self {
            cpu_cores,
            total_memory_mb,
            available_memory_mb,
            detected_at: chrono::Utc::now(),
        }
    }

    fn detect_memory_limits() -> (Option<u64>, Option<u64>) {
        let mut sys = System::new();
        sys.refresh_memory();

        let total_memory_mb = sys.total_memory() / (1024 * 1024);
        if total_memory_mb == 0 {
            return (None, None);
        }

        // Some platforms report cache as unavailable; fall back to 70% of total minus used
        let available_memory_mb = sys.available_memory() / (1024 * 1024);
        let used_memory_mb = sys.used_memory() / (1024 * 1024);
        let available_percentage = (available_memory_mb as f64 / total_memory_mb as f64) * 100.0;
        let effective_available_mb = if available_percentage > 20.0 {
            available_memory_mb
        } else {
            let conservative_total = (total_memory_mb as f64 * 0.7) as u64;
            conservative_total.saturating_sub(used_memory_mb)
        };

        (Some(total_memory_mb), Some(effective_available_mb))
    }
}

/// Worker count decision and the bounds that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSizing {
    pub worker_count: usize,
    pub cpu_bound: usize,
    pub memory_bound: Option<usize>,
}

impl WorkerSizing {
    /// Size from detected resources, clamped to `[1, max_workers]`
    pub fn recommend(config: &WorkerPoolConfig, resources: &SystemResources) -> Self {
        let cpu_bound = resources
            .cpu_cores
            .max(1)
            .saturating_mul(config.workers_per_core.max(1));
        let memory_bound = resources
            .available_memory_mb
            .map(|available| (available / config.per_worker_memory_mb.max(1)) as usize);

        let worker_count = memory_bound
            .map_or(cpu_bound, |memory| cpu_bound.min(memory))
            .clamp(1, config.max_workers.max(1));

        Self {
            worker_count,
            cpu_bound,
            memory_bound,
        }
    }

    /// Detect resources and size the pool
    pub fn auto(config: &WorkerPoolConfig) -> Self {
        let sizing = Self::recommend(config, &SystemResources::detect());
        info!(
            worker_count = sizing.worker_count,
            cpu_bound = sizing.cpu_bound,
            memory_bound = sizing.memory_bound,
            "📐 RESOURCE_LIMITS: Auto-sized worker pool"
        );
        sizing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(cpu_cores: usize, available_memory_mb: Option<u64>) -> SystemResources {
        SystemResources {
            cpu_cores,
            total_memory_mb: available_memory_mb,
            available_memory_mb,
            detected_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_cpu_bound_sizing() {
        let config = WorkerPoolConfig::default();
        let sizing = WorkerSizing::recommend(&config, &resources(4, Some(64 * 1024)));
        assert_eq!(sizing.cpu_bound, 16);
        assert_eq!(sizing.worker_count, 16);
    }

    #[test]
    fn test_memory_bound_sizing() {
        let config = WorkerPoolConfig::default();
        let sizing = WorkerSizing::recommend(&config, &resources(8, Some(256)));
        assert_eq!(sizing.memory_bound, Some(4));
        assert_eq!(sizing.worker_count, 4);
    }

    #[test]
    fn test_sizing_is_clamped() {
        let config = WorkerPoolConfig {
            max_workers: 10,
            ..WorkerPoolConfig::default()
        };
        assert_eq!(
            WorkerSizing::recommend(&config, &resources(64, None)).worker_count,
            10
        );
        assert_eq!(
            WorkerSizing::recommend(&config, &resources(4, Some(0))).worker_count,
            1
        );
    }

    #[test]
    fn test_detect_reports_at_least_one_core() {
        assert!(SystemResources::detect().cpu_cores >= 1);
    }
}
