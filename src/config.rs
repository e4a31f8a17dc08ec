//! Kernel configuration.
//!
//! A plain record handed to the kernel at startup by whatever launches the
//! run. The kernel performs no argument parsing itself.

use std::time::Duration;

use crate::error::{KernelError, KernelResult};
use crate::time::VirtualTime;

/// How entities perform their expensive per-step computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ExecutionMode {
    /// Every entity computes inline inside its own batch.
    Cooperative,
    /// Entities may hand their computation to the accelerator batch
    /// manager. With `asynchronous` the scheduler keeps running while a
    /// dispatch is in flight; otherwise every flush is joined immediately.
    Offload { asynchronous: bool },
}

impl ExecutionMode {
    /// Returns `true` if entities may request accelerator offload.
    pub fn offload_enabled(self) -> bool {
        matches!(self, ExecutionMode::Offload { .. })
    }
}

/// Configuration for one simulation instance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct KernelConfig {
    /// Number of worker threads processing entities of this process.
    pub worker_threads: usize,
    /// Scheduler loop iterations between GVT rounds.
    pub gvt_period: u64,
    /// Maximum distance, in ticks, between a batch's time and the event
    /// horizon of the last GVT round (never less than GVT). Entities further
    /// ahead are deferred. `None` means unbounded.
    pub time_window: Option<u64>,
    /// Maximum number of entities per accelerator batch.
    pub batch_capacity: usize,
    /// Size of the accelerator transfer buffer, in records.
    pub buffer_records: usize,
    /// Cooperative or accelerator-offload execution.
    pub execution: ExecutionMode,
    /// Events received at or beyond this time are not scheduled.
    pub end_time: VirtualTime,
    /// Bound on a single GVT collective before the round fails.
    pub gvt_timeout: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            gvt_period: 16,
            time_window: None,
            batch_capacity: 64,
            buffer_records: 1024,
            execution: ExecutionMode::Cooperative,
            end_time: VirtualTime::INFINITY,
            gvt_timeout: Duration::from_secs(30),
        }
    }
}

impl KernelConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the GVT cadence.
    pub fn with_gvt_period(mut self, period: u64) -> Self {
        self.gvt_period = period;
        self
    }

    /// Bound optimism to `ticks` past GVT.
    pub fn with_time_window(mut self, ticks: u64) -> Self {
        self.time_window = Some(ticks);
        self
    }

    /// Set the accelerator batch capacity.
    pub fn with_batch_capacity(mut self, capacity: usize) -> Self {
        self.batch_capacity = capacity;
        self
    }

    /// Set the transfer buffer size in records.
    pub fn with_buffer_records(mut self, records: usize) -> Self {
        self.buffer_records = records;
        self
    }

    /// Select the execution mode.
    pub fn with_execution(mut self, execution: ExecutionMode) -> Self {
        self.execution = execution;
        self
    }

    /// Stop scheduling events at `end_time`.
    pub fn with_end_time(mut self, end_time: VirtualTime) -> Self {
        self.end_time = end_time;
        self
    }

    /// Set the GVT collective timeout.
    pub fn with_gvt_timeout(mut self, timeout: Duration) -> Self {
        self.gvt_timeout = timeout;
        self
    }

    /// Number of entities that actually fit in one dispatch.
    ///
    /// A transfer buffer smaller than the batch capacity shrinks batches
    /// instead of dropping entities.
    pub fn effective_batch_capacity(&self) -> usize {
        self.batch_capacity.min(self.buffer_records)
    }

    /// Check the configuration for inconsistencies.
    pub fn validate(&self) -> KernelResult<()> {
        if self.worker_threads == 0 {
            return Err(KernelError::InvalidConfig(
                "worker_threads must be at least 1".into(),
            ));
        }
        if self.gvt_period == 0 {
            return Err(KernelError::InvalidConfig(
                "gvt_period must be at least 1".into(),
            ));
        }
        if self.end_time == VirtualTime::ZERO {
            return Err(KernelError::InvalidConfig(
                "end_time must be after the initialization instant".into(),
            ));
        }
        if self.execution.offload_enabled() {
            if self.batch_capacity == 0 || self.buffer_records == 0 {
                return Err(KernelError::InvalidConfig(
                    "offload execution needs a non-zero batch capacity and buffer".into(),
                ));
            }
            if self.worker_threads > 1 {
                return Err(KernelError::InvalidConfig(
                    "offload execution requires a single worker thread".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = KernelConfig::default();
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.gvt_period, 16);
        assert!(config.time_window.is_none());
        assert!(config.end_time.is_infinite());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = KernelConfig::new()
            .with_worker_threads(4)
            .with_gvt_period(8)
            .with_time_window(20)
            .with_end_time(VirtualTime::new(100));

        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.gvt_period, 8);
        assert_eq!(config.time_window, Some(20));
        assert_eq!(config.end_time, VirtualTime::new(100));
    }

    #[test]
    fn test_small_buffer_clamps_capacity() {
        let config = KernelConfig::new()
            .with_batch_capacity(64)
            .with_buffer_records(10);
        assert_eq!(config.effective_batch_capacity(), 10);
    }

    #[test]
    fn test_rejects_offload_with_workers() {
        let config = KernelConfig::new()
            .with_worker_threads(2)
            .with_execution(ExecutionMode::Offload { asynchronous: true });
        assert!(matches!(config.validate(), Err(KernelError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_period() {
        let config = KernelConfig::new().with_gvt_period(0);
        assert!(config.validate().is_err());
    }
}
