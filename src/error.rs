//! Error type shared by the scheduler.

use std::fmt;
use std::io;

/// Failures reported by the fiber scheduler.
///
/// Capacity errors are configuration problems: pool sizes are decided at
/// startup and the scheduler never grows them at runtime.
#[derive(Debug)]
pub enum FiberError {
    /// A configuration value is out of range.
    InvalidConfig(&'static str),
    /// Every job slot is in use.
    JobPoolExhausted { capacity: usize },
    /// A fiber stack could not be mapped.
    StackAllocation(io::Error),
    /// A fiber thread could not be spawned.
    ThreadSpawn(io::Error),
    /// Some fiber threads panicked and were joined with an error.
    ThreadsPanicked(usize),
    /// Jobs were still queued, running or suspended when the manager stopped.
    AbandonedJobs(usize),
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberError::InvalidConfig(reason) => write!(f, "invalid fiber configuration: {reason}"),
            FiberError::JobPoolExhausted { capacity } => {
                write!(f, "job pool exhausted ({capacity} slots in use)")
            }
            FiberError::StackAllocation(err) => write!(f, "failed to allocate fiber stack: {err}"),
            FiberError::ThreadSpawn(err) => write!(f, "failed to spawn fiber thread: {err}"),
            FiberError::ThreadsPanicked(count) => write!(f, "{count} fiber thread(s) panicked"),
            FiberError::AbandonedJobs(count) => {
                write!(f, "{count} job(s) were still pending at shutdown")
            }
        }
    }
}

impl std::error::Error for FiberError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FiberError::StackAllocation(err) | FiberError::ThreadSpawn(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_display_mentions_capacity() {
        let err = FiberError::JobPoolExhausted { capacity: 64 };
        assert_eq!(err.to_string(), "job pool exhausted (64 slots in use)");
        assert!(err.source().is_none());
    }

    #[test]
    fn test_io_source_is_exposed() {
        let err = FiberError::ThreadSpawn(io::Error::other("no threads left"));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("no threads left"));
    }
}
