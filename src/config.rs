//! Startup configuration of the fiber scheduler.
//!
//! Every capacity here is fixed once the manager is built: pools never grow
//! at runtime.

use crate::error::FiberError;
use serde::{Deserialize, Serialize};

/// Strategy for pinning fiber threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    None,
    /// Linear pinning (fiber thread i -> logical processor i, wrapping).
    #[default]
    Linear,
}

/// Configuration for the fiber system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberConfig {
    /// Requested fiber threads. Positive is used as is, `0` means one per
    /// hardware thread, negative leaves that many hardware threads free.
    pub thread_count: i32,
    /// Job records available for submission. Default: 4096.
    pub job_capacity: usize,
    /// Small-stack fiber contexts. Default: 128.
    pub fiber_count: usize,
    /// Big-stack fiber contexts. Default: 32.
    pub big_fiber_count: usize,
    /// Stack size of a small fiber in bytes. Default: 256KB.
    pub stack_size: usize,
    /// Stack size of a big fiber in bytes. Default: 1MB.
    pub big_stack_size: usize,
    /// Empty-queue polls before an idle fiber thread sleeps. Default: 50.
    pub retrieve_spin_count: u32,
    /// How fiber threads are pinned to cores.
    pub pinning: PinningStrategy,
    /// Block asynchronous signals on fiber threads (Unix only).
    pub block_signals: bool,
    /// How long jobs may keep failing to get a fiber context, with no job
    /// running, before the pool is reported exhausted. `0` disables the
    /// report. Default: 2000.
    pub context_starvation_timeout_ms: u64,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            thread_count: 0,
            job_capacity: 4096,
            fiber_count: 128,
            big_fiber_count: 32,
            stack_size: 256 * 1024,
            big_stack_size: 1024 * 1024,
            retrieve_spin_count: 50,
            pinning: PinningStrategy::Linear,
            block_signals: true,
            context_starvation_timeout_ms: 2_000,
        }
    }
}

/// Smallest accepted fiber stack.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

impl FiberConfig {
    /// Default configuration with an explicit thread count.
    pub fn with_threads(thread_count: i32) -> Self {
        Self {
            thread_count,
            ..Self::default()
        }
    }

    /// Rejects values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), FiberError> {
        if self.job_capacity == 0 {
            return Err(FiberError::InvalidConfig("job_capacity must be positive"));
        }
        if self.job_capacity > u32::MAX as usize {
            return Err(FiberError::InvalidConfig("job_capacity exceeds u32 range"));
        }
        if self.fiber_count == 0 {
            return Err(FiberError::InvalidConfig("fiber_count must be positive"));
        }
        if self.fiber_count + self.big_fiber_count > u16::MAX as usize {
            return Err(FiberError::InvalidConfig("too many fiber contexts"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(FiberError::InvalidConfig("stack_size below 16KB"));
        }
        if self.big_fiber_count > 0 && self.big_stack_size < self.stack_size {
            return Err(FiberError::InvalidConfig(
                "big_stack_size smaller than stack_size",
            ));
        }
        Ok(())
    }
}
