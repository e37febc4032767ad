//! Counter-based synchronization primitives for job completion tracking.
//!
//! A [`Counter`] is raised once per submitted job and lowered when that job
//! finishes. Jobs and OS threads wait for it to drop to a target value;
//! waiting jobs are handed back to a [`JobScheduler`] once it does.

use crate::job::JobHandle;
use crate::mutex::LightweightMutex;
use crossbeam::deque::Injector;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, Thread};

/// Trait for handing jobs back to a ready queue.
pub trait JobScheduler {
    fn schedule(&self, job: JobHandle);
}

impl JobScheduler for Injector<JobHandle> {
    fn schedule(&self, job: JobHandle) {
        self.push(job);
    }
}

/// Wake-up handle of an OS thread blocked on a counter.
pub(crate) struct ThreadSignal {
    woken: AtomicBool,
    thread: Thread,
}

impl ThreadSignal {
    fn for_current_thread() -> Self {
        Self {
            woken: AtomicBool::new(false),
            thread: thread::current(),
        }
    }

    fn wake(&self) {
        self.woken.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

/// Something waiting for a counter to reach its target.
pub(crate) enum Waiter {
    /// A suspended job, requeued through the scheduler.
    Job(JobHandle),
    /// A parked OS thread outside the fiber pool.
    Thread(Arc<ThreadSignal>),
}

/// Outcome of [`Counter::add_waiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitRegistration {
    /// The target was already reached; the waiter was not stored.
    Satisfied,
    /// The waiter will be woken by a later decrement.
    Registered,
}

struct InnerCounter {
    value: AtomicUsize,
    /// Mirrors `waiters.len()` so decrements skip the lock when nobody waits.
    waiter_count: AtomicUsize,
    waiters: LightweightMutex<Vec<(Waiter, usize)>>,
}

/// A thread-safe counter for tracking job completion.
#[derive(Clone)]
pub struct Counter {
    inner: Arc<InnerCounter>,
}

impl Counter {
    /// Creates a new counter with the specified initial value.
    pub fn new(initial: usize) -> Self {
        Counter {
            inner: Arc::new(InnerCounter {
                value: AtomicUsize::new(initial),
                waiter_count: AtomicUsize::new(0),
                waiters: LightweightMutex::with_name(Vec::new(), "Counter::waiters"),
            }),
        }
    }

    /// Increments the counter by one.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Raises the counter by `count` in one atomic step.
    pub fn add(&self, count: usize) {
        self.inner.value.fetch_add(count, Ordering::SeqCst);
    }

    /// Decrements the counter by one and wakes every waiter whose target is
    /// now reached. Returns the new value.
    ///
    /// Decrementing a counter already at zero is a logic error: it is logged,
    /// asserted in debug builds and otherwise ignored.
    pub fn decrement<S: JobScheduler + ?Sized>(&self, scheduler: &S) -> usize {
        let previous =
            match self
                .inner
                .value
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            {
                Ok(previous) => previous,
                Err(_) => {
                    log::error!("counter decremented below zero");
                    debug_assert!(false, "counter decremented below zero");
                    return 0;
                }
            };

        // Pairs with the SeqCst increment in `add_waiter`: either we see the
        // waiter here or it sees our decrement.
        if self.inner.waiter_count.load(Ordering::SeqCst) > 0 {
            self.wake_reached(scheduler);
        }
        previous - 1
    }

    fn wake_reached<S: JobScheduler + ?Sized>(&self, scheduler: &S) {
        let mut woken = Vec::new();
        {
            let mut waiters = self.inner.waiters.lock();
            let value = self.value();
            let mut i = 0;
            while i < waiters.len() {
                if value <= waiters[i].1 {
                    woken.push(waiters.swap_remove(i).0);
                } else {
                    i += 1;
                }
            }
            self.inner
                .waiter_count
                .fetch_sub(woken.len(), Ordering::SeqCst);
        }

        for waiter in woken {
            match waiter {
                Waiter::Job(handle) => scheduler.schedule(handle),
                Waiter::Thread(signal) => signal.wake(),
            }
        }
    }

    /// Registers `waiter` until the counter drops to `target`, unless it
    /// already has.
    pub(crate) fn add_waiter(&self, waiter: Waiter, target: usize) -> WaitRegistration {
        let mut waiters = self.inner.waiters.lock();
        self.inner.waiter_count.fetch_add(1, Ordering::SeqCst);
        if self.has_reached(target) {
            self.inner.waiter_count.fetch_sub(1, Ordering::SeqCst);
            return WaitRegistration::Satisfied;
        }
        waiters.push((waiter, target));
        WaitRegistration::Registered
    }

    /// Parks the calling OS thread until the counter drops to `target`.
    pub(crate) fn wait_blocking(&self, target: usize) {
        if self.has_reached(target) {
            return;
        }

        let signal = Arc::new(ThreadSignal::for_current_thread());
        if self.add_waiter(Waiter::Thread(signal.clone()), target) == WaitRegistration::Satisfied {
            return;
        }
        while !signal.woken.load(Ordering::Acquire) {
            thread::park();
        }
    }

    /// Returns the current value of the counter.
    pub fn value(&self) -> usize {
        self.inner.value.load(Ordering::SeqCst)
    }

    /// Checks if the counter has reached zero.
    pub fn is_complete(&self) -> bool {
        self.value() == 0
    }

    /// Whether the counter is at or below `target`.
    pub fn has_reached(&self, target: usize) -> bool {
        self.value() <= target
    }

    /// Number of jobs and threads currently waiting on this counter.
    pub fn waiter_count(&self) -> usize {
        self.inner.waiter_count.load(Ordering::SeqCst)
    }

    /// Overwrites the value. Only valid while nobody waits on the counter.
    pub fn reset(&self, value: usize) {
        debug_assert_eq!(self.waiter_count(), 0, "counter reset with pending waiters");
        self.inner.value.store(value, Ordering::SeqCst);
    }
}

impl Default for Counter {
    fn default() -> Self {
        Counter::new(0)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("value", &self.value())
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn handle(index: u32) -> JobHandle {
        JobHandle::new(index, 0)
    }

    #[test]
    fn test_counter_basic() {
        let counter = Counter::new(5);
        assert_eq!(counter.value(), 5);
        assert!(!counter.is_complete());

        let injector = Injector::<JobHandle>::new();
        assert_eq!(counter.decrement(&injector), 4);

        counter.increment();
        assert_eq!(counter.value(), 5);
        counter.add(3);
        assert_eq!(counter.value(), 8);
    }

    #[test]
    fn test_counter_completion() {
        let counter = Counter::new(1);
        assert!(!counter.is_complete());

        let injector = Injector::<JobHandle>::new();
        counter.decrement(&injector);
        assert!(counter.is_complete());
        assert!(counter.has_reached(0));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "below zero"))]
    fn test_decrement_never_goes_below_zero() {
        let counter = Counter::new(0);
        let injector = Injector::<JobHandle>::new();
        assert_eq!(counter.decrement(&injector), 0);
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_waiter_satisfied_immediately() {
        let counter = Counter::new(2);
        assert_eq!(
            counter.add_waiter(Waiter::Job(handle(0)), 2),
            WaitRegistration::Satisfied
        );
        assert_eq!(counter.waiter_count(), 0);
    }

    #[test]
    fn test_waiters_woken_at_their_target() {
        let counter = Counter::new(3);
        let injector = Injector::<JobHandle>::new();

        assert_eq!(
            counter.add_waiter(Waiter::Job(handle(1)), 1),
            WaitRegistration::Registered
        );
        assert_eq!(
            counter.add_waiter(Waiter::Job(handle(2)), 0),
            WaitRegistration::Registered
        );
        assert_eq!(counter.waiter_count(), 2);

        counter.decrement(&injector);
        assert!(injector.is_empty());

        counter.decrement(&injector);
        assert_eq!(injector.steal().success(), Some(handle(1)));
        assert!(injector.is_empty());

        counter.decrement(&injector);
        assert_eq!(injector.steal().success(), Some(handle(2)));
        assert_eq!(counter.waiter_count(), 0);
    }

    #[test]
    fn test_blocking_wait_unparks() {
        let counter = Counter::new(1);
        let remote = counter.clone();
        let decrementer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.decrement(&Injector::<JobHandle>::new());
        });

        counter.wait_blocking(0);
        assert!(counter.is_complete());
        decrementer.join().unwrap();
    }

    #[test]
    fn test_counter_reset() {
        let counter = Counter::new(10);
        counter.reset(5);
        assert_eq!(counter.value(), 5);
    }
}
