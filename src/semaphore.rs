//! Fiber-safe semaphores: a binary one built on [`RawSpinLock`] and a
//! counting one on a single atomic.

use crate::spin_lock::RawSpinLock;
use crate::threads::cpu_yield;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

/// A binary semaphore for short producer/consumer handoffs.
///
/// `signal` and `wait` map to unlock and lock of the inner spin lock, so a
/// `wait` with no pending `signal` keeps the OS thread busy. Between spin
/// rounds the waiter yields its time slice but is never descheduled by a
/// blocking call.
///
/// The scheduler uses one per job slot as the hosting token: a fiber thread
/// must take it before switching into the job and gives it back once the job
/// has switched out.
pub struct LightweightBinarySemaphore {
    lock: RawSpinLock,
    yield_spin_count: u32,
}

impl LightweightBinarySemaphore {
    pub const DEFAULT_SPIN_COUNT: u32 = 1_000;

    /// Creates a semaphore, available to one waiter if `signaled`.
    pub fn new(signaled: bool) -> Self {
        Self::with_spin_count(signaled, Self::DEFAULT_SPIN_COUNT)
    }

    /// Creates a semaphore spinning `spin_count` times before each thread yield.
    pub fn with_spin_count(signaled: bool, spin_count: u32) -> Self {
        let lock = RawSpinLock::new();
        if !signaled {
            lock.lock();
        }
        Self {
            lock,
            yield_spin_count: spin_count.max(1),
        }
    }

    /// Releases one waiter. Signaling an already signaled semaphore is a no-op.
    pub fn signal(&self) {
        self.lock.unlock();
    }

    /// Waits until signaled, consuming the signal.
    pub fn wait(&self) {
        while !self.lock.try_lock_spin(self.yield_spin_count) {
            thread::yield_now();
        }
    }

    /// Consumes a pending signal if there is one.
    pub fn try_wait(&self) -> bool {
        self.lock.try_lock()
    }

    /// Whether no signal is pending. Racy, for diagnostics only.
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

impl Default for LightweightBinarySemaphore {
    fn default() -> Self {
        Self::new(true)
    }
}

impl fmt::Debug for LightweightBinarySemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LightweightBinarySemaphore")
            .field("locked", &self.is_locked())
            .field("yield_spin_count", &self.yield_spin_count)
            .finish()
    }
}

/// A counting semaphore that spins, then yields, while the count is zero.
///
/// Never blocks in the kernel. Meant for bounding concurrency over short
/// sections, e.g. a fixed number of scratch buffers shared by jobs.
pub struct LightweightSemaphore {
    count: AtomicU32,
    yield_spin_count: u32,
}

impl LightweightSemaphore {
    pub const DEFAULT_SPIN_COUNT: u32 = 1_000;

    /// Creates a semaphore with `count` permits available.
    pub fn new(count: u32) -> Self {
        Self::with_spin_count(count, Self::DEFAULT_SPIN_COUNT)
    }

    /// Creates a semaphore spinning `spin_count` times before each thread yield.
    pub fn with_spin_count(count: u32, spin_count: u32) -> Self {
        Self {
            count: AtomicU32::new(count),
            yield_spin_count: spin_count.max(1),
        }
    }

    /// Returns `permits` to the semaphore.
    pub fn signal(&self, permits: u32) {
        if permits > 0 {
            self.count.fetch_add(permits, Ordering::Release);
        }
    }

    pub fn signal_once(&self) {
        self.signal(1);
    }

    /// Takes one permit if any is available. The count never goes below zero.
    pub fn try_wait(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Takes one permit, spinning and then yielding until one is available.
    pub fn wait(&self) {
        let mut spins = 0;
        while !self.try_wait() {
            while self.count.load(Ordering::Relaxed) == 0 {
                if spins < self.yield_spin_count {
                    cpu_yield();
                    spins += 1;
                } else {
                    thread::yield_now();
                    spins = 0;
                }
            }
        }
    }

    /// Available permits. Racy, for diagnostics only.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Takes one permit and hands it back when the guard drops.
    pub fn auto_lock(&self) -> LightweightSemaphoreGuard<'_> {
        self.wait();
        LightweightSemaphoreGuard { semaphore: self }
    }
}

impl fmt::Debug for LightweightSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LightweightSemaphore")
            .field("count", &self.count())
            .field("yield_spin_count", &self.yield_spin_count)
            .finish()
    }
}

#[must_use = "the permit is returned as soon as the guard is dropped"]
pub struct LightweightSemaphoreGuard<'a> {
    semaphore: &'a LightweightSemaphore,
}

impl Drop for LightweightSemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.signal_once();
    }
}
