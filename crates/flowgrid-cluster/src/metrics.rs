//! Local load sampling for heartbeat records.

use std::sync::Mutex;

use sysinfo::System;

use flowgrid_core::ResourceMetrics;

pub trait MetricsSampler: Send + Sync {
    fn sample(&self) -> ResourceMetrics;
}

/// Samples the host via `sysinfo`.
pub struct SystemSampler {
    system: Mutex<System>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSampler for SystemSampler {
    fn sample(&self) -> ResourceMetrics {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_memory();
        ResourceMetrics {
            cpu_load: System::load_average().one,
            free_memory_bytes: system.available_memory(),
        }
    }
}

/// Always reports the same metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedSampler(pub ResourceMetrics);

impl MetricsSampler for FixedSampler {
    fn sample(&self) -> ResourceMetrics {
        self.0
    }
}
