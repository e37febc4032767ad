//! Fiber thread implementation.
//!
//! A fiber thread owns one OS thread that keeps retrieving ready jobs and
//! switching into them. It only blocks when the ready queue stays empty for
//! a while, on the manager's condition variable.

use crate::config::PinningStrategy;
use crate::context::{FiberInput, SwitchOut};
use crate::counter::{WaitRegistration, Waiter};
use crate::error::FiberError;
use crate::fibers_manager::Shared;
use crate::job::{JobHandle, JobStatus, NO_HOST, StartJob};
use crate::profiling::{Category, CollectorGuard, TraceGuard};
use crate::threads;
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Per-OS-thread scheduler identity, set for the lifetime of a fiber thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FiberThreadInfo {
    pub index: u16,
}

thread_local! {
    static CURRENT_THREAD: Cell<Option<FiberThreadInfo>> = const { Cell::new(None) };
}

/// Identity of the calling thread, if it is a fiber thread.
// Never inlined: a fiber may resume on another OS thread, so the TLS slot
// must be looked up again on every call.
#[inline(never)]
pub fn current() -> Option<FiberThreadInfo> {
    CURRENT_THREAD.get()
}

/// Whether the calling code runs on a fiber thread.
pub fn is_fiber_thread() -> bool {
    current().is_some()
}

/// Index of the calling fiber thread.
pub fn current_index() -> Option<u16> {
    current().map(|info| info.index)
}

/// An OS thread hosting fibers.
pub struct FiberThread {
    index: u16,
    should_stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FiberThread {
    /// Spawns the thread and starts its retrieval loop.
    pub(crate) fn spawn(index: u16, shared: Arc<Shared>) -> Result<Self, FiberError> {
        let should_stop = Arc::new(AtomicBool::new(false));
        let thread_stop = should_stop.clone();

        let handle = thread::Builder::new()
            .name(format!("fiber-thread-{index}"))
            .spawn(move || {
                CURRENT_THREAD.set(Some(FiberThreadInfo { index }));
                let _collector = CollectorGuard;
                setup_current_thread(index, &shared);

                log::debug!("fiber thread {index} started");
                run_loop(&shared, index, &thread_stop);
                log::debug!("fiber thread {index} stopped");

                CURRENT_THREAD.set(None);
            })
            .map_err(FiberError::ThreadSpawn)?;

        Ok(FiberThread {
            index,
            should_stop,
            handle: Some(handle),
        })
    }

    /// Returns the thread's index.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Asks the thread to leave its loop and wakes it if it sleeps.
    ///
    /// The thread exits the next time it looks for work, so a job it is
    /// hosting still runs to its next suspension or completion.
    pub(crate) fn request_stop(&self, shared: &Shared) {
        // Under the wait mutex so a thread about to sleep cannot miss it.
        let _lock = shared.lock_wait_mutex();
        self.should_stop.store(true, Ordering::SeqCst);
        shared.wake_all();
    }

    /// Waits for the thread to finish.
    pub(crate) fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }

    /// Stops and joins the thread.
    pub(crate) fn stop(self, shared: &Shared) -> thread::Result<()> {
        self.request_stop(shared);
        self.join()
    }
}

fn setup_current_thread(index: u16, shared: &Shared) {
    let config = shared.config();

    match config.pinning {
        PinningStrategy::None => {}
        PinningStrategy::Linear => {
            if !threads::set_current_thread_affinity(index as usize) {
                log::warn!("fiber thread {index}: failed to set core affinity");
            }
        }
    }

    if config.block_signals && !threads::block_current_thread_signals() {
        log::warn!("fiber thread {index}: failed to block signals");
    }
}

fn run_loop(shared: &Arc<Shared>, index: u16, should_stop: &AtomicBool) {
    let mut next = None;
    loop {
        // A job resumed in place is finished first, stop or not.
        if next.is_none() && should_stop.load(Ordering::SeqCst) {
            break;
        }
        next = switch_to_next_job(shared, index, next, should_stop);
    }
}

/// Hosts `next` if given, otherwise the next ready job.
///
/// Returns a job to host right away: one whose counter was already reached by
/// the time it suspended.
pub(crate) fn switch_to_next_job(
    shared: &Arc<Shared>,
    index: u16,
    next: Option<JobHandle>,
    should_stop: &AtomicBool,
) -> Option<JobHandle> {
    let handle = match next {
        Some(handle) => handle,
        None => retrieve_next_job(shared, should_stop)?,
    };
    host_job(shared, index, handle)
}

fn retrieve_next_job(shared: &Shared, should_stop: &AtomicBool) -> Option<JobHandle> {
    for _ in 0..shared.config().retrieve_spin_count {
        if let Some(handle) = shared.pop_ready() {
            return Some(handle);
        }
        threads::cpu_yield();
    }

    let _span = TraceGuard::new("idle", Category::Idle);
    shared.wait_for_job(should_stop)
}

/// Switches into `handle` and deals with how it switched back out.
fn host_job(shared: &Arc<Shared>, index: u16, handle: JobHandle) -> Option<JobHandle> {
    let Some(slot) = shared.jobs().slot(handle) else {
        log::error!("fiber thread {index}: stale job handle {handle:?}");
        debug_assert!(false, "stale job handle");
        return None;
    };

    if !slot.host_token.try_wait() {
        let other = slot.host_index.load(Ordering::Relaxed);
        log::error!("job {handle:?} already hosted by fiber thread {other}");
        debug_assert!(false, "job hosted by two fiber threads");
        return None;
    }
    slot.host_index.store(index as u32, Ordering::Relaxed);

    let (context_id, input) = {
        // SAFETY: the host token is held.
        let job = unsafe { slot.job_mut() };
        debug_assert!(job.can_run(), "job {handle:?} has nothing to run");

        let context_id = match job.context {
            Some(id) => id,
            None => match shared.contexts().acquire(job.big_stack) {
                Some(id) => {
                    shared.context_acquired();
                    job.context = Some(id);
                    id
                }
                None => {
                    log::debug!("no free fiber context for job {handle:?}, requeueing");
                    slot.host_index.store(NO_HOST, Ordering::Relaxed);
                    slot.host_token.signal();
                    shared.requeue(handle);

                    // Every context is parked in a suspended job and nothing
                    // runs that could release one.
                    if shared.context_starved() {
                        log::error!(
                            "fiber context pool exhausted: job {handle:?} found no free context for {}ms",
                            shared.config().context_starvation_timeout_ms
                        );
                        debug_assert!(false, "fiber context pool exhausted");
                    }
                    return None;
                }
            },
        };

        job.waiting_on = None;
        let input = match job.entry.take() {
            Some(entry) => FiberInput::Start(StartJob {
                entry,
                handle,
                shared: shared.clone(),
            }),
            None => FiberInput::Resume,
        };
        (context_id, input)
    };

    slot.set_status(JobStatus::Running);
    shared.job_switched_in();
    let out = {
        let _span = TraceGuard::new("job", Category::Job);
        // SAFETY: the context is bound to this job and the host token is held.
        unsafe { shared.contexts().get_mut(context_id) }.switch_in(input)
    };
    shared.job_switched_out();

    match out {
        SwitchOut::Finished => {
            let completion = {
                // SAFETY: the host token is still held.
                let job = unsafe { slot.job_mut() };
                job.context = None;
                job.completion.take()
            };
            shared.contexts().release(context_id);

            slot.set_status(JobStatus::Finished);
            slot.host_index.store(NO_HOST, Ordering::Relaxed);
            slot.host_token.signal();

            // Recycle before the decrement: whoever observes the counter may
            // immediately submit into this slot.
            shared.jobs().recycle(handle);
            if let Some(counter) = completion {
                counter.decrement(&**shared);
            }
            None
        }
        SwitchOut::Waiting { counter, target } => {
            {
                // SAFETY: the host token is still held.
                let job = unsafe { slot.job_mut() };
                job.waiting_on = Some((counter.clone(), target));
            }
            slot.set_status(JobStatus::Suspended);
            shared.record_suspension();
            slot.host_index.store(NO_HOST, Ordering::Relaxed);
            slot.host_token.signal();

            // The job's frames are parked on its own stack now, so it may be
            // requeued and resumed elsewhere as soon as it is registered.
            match counter.add_waiter(Waiter::Job(handle), target) {
                WaitRegistration::Satisfied => Some(handle),
                WaitRegistration::Registered => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_thread_is_not_fiber_thread() {
        assert!(!is_fiber_thread());
        assert_eq!(current_index(), None);
    }
}
