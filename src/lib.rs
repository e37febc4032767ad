//! # fiberjobs - Cooperative Fiber-Based Job Scheduler
//!
//! A fiber-based job system in the style of Naughty Dog's engine. Work is
//! split into many small jobs that run on lightweight user-space execution
//! contexts (fibers), multiplexed over a fixed pool of OS threads. A job can
//! wait on a counter without blocking its OS thread: it is switched out and
//! the thread picks up other work until the counter reaches its target.
//!
//! ## Architecture
//!
//! - **Fiber contexts**: reusable stacks with a guard page, switched with
//!   `corosensei`
//! - **Jobs**: pooled records holding an entry point and its counters
//! - **Counters**: atomic join points jobs decrement on completion
//! - **Fiber threads**: OS threads retrieving ready jobs and switching into them
//! - **Lightweight locks**: [`SpinLock`], [`RwSpinLock`],
//!   [`LightweightBinarySemaphore`], [`LightweightSemaphore`] and
//!   [`LightweightMutex`] for very short critical sections
//!
//! ## Example
//!
//! ```no_run
//! use fiberjobs::{Counter, FibersManager};
//!
//! let manager = FibersManager::new(4).unwrap(); // 4 fiber threads
//!
//! let counter = Counter::new(0);
//! manager
//!     .submit_job(
//!         |ctx| {
//!             let children = Counter::new(0);
//!             for i in 0..8 {
//!                 ctx.submit_job(move |_| println!("child {i}"), Some(&children))
//!                     .unwrap();
//!             }
//!             // Suspends this fiber; the thread runs the children meanwhile.
//!             ctx.wait_for_counter(&children, 0);
//!         },
//!         Some(&counter),
//!     )
//!     .unwrap();
//!
//! manager.wait_for_counter(&counter, 0);
//! manager.stop().unwrap();
//! ```

pub mod config;
mod context;
pub mod counter;
pub mod error;
pub mod fiber_thread;
pub mod fibers_manager;
pub mod job;
pub mod mutex;
pub mod profiling;
pub mod rw_spin_lock;
pub mod semaphore;
pub mod spin_lock;
pub mod threads;

pub use config::{FiberConfig, PinningStrategy};
pub use counter::{Counter, JobScheduler};
pub use error::FiberError;
pub use fiber_thread::{FiberThreadInfo, current_index, is_fiber_thread};
pub use fibers_manager::FibersManager;
pub use job::{JobContext, JobEntry, JobHandle, JobOptions, JobStatus};
pub use mutex::{LightweightMutex, LightweightMutexGuard};
pub use rw_spin_lock::{RwSpinLock, RwSpinLockReadGuard, RwSpinLockWriteGuard};
pub use semaphore::{LightweightBinarySemaphore, LightweightSemaphore, LightweightSemaphoreGuard};
pub use spin_lock::{RawSpinLock, SpinLock, SpinLockGuard};
