//! Runtime configuration.

use std::time::Duration;

use kiln_runtime::heap::{MAX_REGION_SIZE, MIN_REGIONS, MIN_REGION_SIZE};

use crate::error::RuntimeError;

/// Default cooperative time slice before `checkpoint()` yields.
pub const TIME_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of OS worker threads.
    pub worker_count: usize,
    pub heap_size: usize,
    pub region_size: usize,
    pub fiber_stack_size: usize,
    pub timeslice: Duration,
    /// Collections an object survives before promotion.
    pub promotion_threshold: u8,
    /// Re-check interval while waiting for mutators to reach a safepoint.
    pub safepoint_poll_interval: Duration,
    /// How long an idle worker sleeps before looking for work again.
    pub idle_wait: Duration,
    /// Recycled fiber stacks kept around.
    pub max_pooled_stacks: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism().map_or(1, |n| n.get()).min(8);
        Self {
            worker_count: workers,
            heap_size: 32 * 1024 * 1024,
            region_size: 256 * 1024,
            fiber_stack_size: 256 * 1024,
            timeslice: TIME_SLICE,
            promotion_threshold: 2,
            safepoint_poll_interval: Duration::from_millis(1),
            idle_wait: Duration::from_millis(10),
            max_pooled_stacks: 64,
        }
    }
}

impl RuntimeConfig {
    pub fn with_workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_heap_size(mut self, bytes: usize) -> Self {
        self.heap_size = bytes;
        self
    }

    pub fn with_region_size(mut self, bytes: usize) -> Self {
        self.region_size = bytes;
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.fiber_stack_size = bytes;
        self
    }

    pub fn with_timeslice(mut self, timeslice: Duration) -> Self {
        self.timeslice = timeslice;
        self
    }

    pub fn with_promotion_threshold(mut self, collections: u8) -> Self {
        self.promotion_threshold = collections;
        self
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.worker_count == 0 {
            return Err(RuntimeError::InvalidConfig("worker_count must be at least 1".into()));
        }
        if !(MIN_REGION_SIZE..=MAX_REGION_SIZE).contains(&self.region_size) || !self.region_size.is_power_of_two() {
            return Err(RuntimeError::InvalidConfig(format!(
                "region_size {} must be a power of two between {} and {}",
                self.region_size, MIN_REGION_SIZE, MAX_REGION_SIZE
            )));
        }
        if self.heap_size < MIN_REGIONS * self.region_size {
            return Err(RuntimeError::InvalidConfig(format!(
                "heap_size must hold at least {} regions",
                MIN_REGIONS
            )));
        }
        if self.fiber_stack_size < 16 * 1024 {
            return Err(RuntimeError::InvalidConfig("fiber_stack_size must be at least 16 KiB".into()));
        }
        if self.promotion_threshold == 0 {
            return Err(RuntimeError::InvalidConfig("promotion_threshold must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.worker_count >= 1 && config.worker_count <= 8);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(RuntimeConfig::default().with_workers(0).validate().is_err());
        assert!(RuntimeConfig::default().with_region_size(3000).validate().is_err());
        assert!(RuntimeConfig::default().with_heap_size(1024).validate().is_err());
        let small = RuntimeConfig::default().with_region_size(4096);
        assert!(small.clone().with_heap_size(4 * 4096).validate().is_err());
        assert!(small.with_heap_size(8 * 4096).validate().is_ok());
        assert!(RuntimeConfig::default().with_promotion_threshold(0).validate().is_err());
    }
}
