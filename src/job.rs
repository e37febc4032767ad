//! Job definitions and the job-slot pool.
//!
//! A job is a boxed entry point plus the counters it relates to. Jobs live in
//! a fixed pool of slots drawn at submission and recycled once finished; the
//! fiber context (stack) a job runs on is bound separately, the first time a
//! fiber thread switches into it.

use crate::context::{ContextId, JobYielder, SwitchOut};
use crate::counter::{Counter, JobScheduler};
use crate::error::FiberError;
use crate::fiber_thread;
use crate::fibers_manager::Shared;
use crate::semaphore::LightweightBinarySemaphore;
use crate::spin_lock::SpinLock;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

/// Entry point of a job. Arguments are captured by the closure.
pub type JobEntry = Box<dyn for<'a> FnOnce(&JobContext<'a>) + Send + 'static>;

/// Generation-checked reference to a job slot.
///
/// Handles stay `Copy` and cheap; once the slot is recycled, the old handle
/// no longer resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobHandle {
    index: u32,
    generation: u32,
}

impl JobHandle {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Lifecycle of a job.
///
/// `Created -> Running -> {Suspended <-> Running} -> Finished`, then the slot
/// is recycled and reads as `Created` again under a new generation.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Created = 0,
    Running = 1,
    Suspended = 2,
    Finished = 3,
}

impl JobStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => JobStatus::Running,
            2 => JobStatus::Suspended,
            3 => JobStatus::Finished,
            _ => JobStatus::Created,
        }
    }

    /// Whether the job's stack holds no live frames.
    pub fn is_idle(self) -> bool {
        matches!(self, JobStatus::Created | JobStatus::Finished)
    }
}

/// Per-submission options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Run on a big-stack fiber context.
    pub big_stack: bool,
}

/// The schedulable record behind a job slot.
pub(crate) struct FiberJob {
    /// Taken by the host on first switch-in.
    pub(crate) entry: Option<JobEntry>,
    /// Decremented once the job finished.
    pub(crate) completion: Option<Counter>,
    /// Counter and target the job is suspended on.
    pub(crate) waiting_on: Option<(Counter, usize)>,
    /// Fiber context the job is bound to, from first switch-in to completion.
    pub(crate) context: Option<ContextId>,
    pub(crate) big_stack: bool,
}

impl FiberJob {
    fn new() -> Self {
        Self {
            entry: None,
            completion: None,
            waiting_on: None,
            context: None,
            big_stack: false,
        }
    }

    /// Reinitializes a recycled record for a new entry point.
    pub(crate) fn reset(&mut self, entry: JobEntry, completion: Option<Counter>, options: JobOptions) {
        debug_assert!(self.context.is_none(), "job reset while bound to a fiber");
        self.entry = Some(entry);
        self.completion = completion;
        self.waiting_on = None;
        self.context = None;
        self.big_stack = options.big_stack;
    }

    /// Whether a host may switch into this job.
    pub(crate) fn can_run(&self) -> bool {
        self.entry.is_some() || self.context.is_some()
    }
}

pub(crate) const NO_HOST: u32 = u32::MAX;

/// A pooled job record plus its hosting instrumentation.
pub(crate) struct JobSlot {
    generation: AtomicU32,
    status: AtomicU8,
    /// Taken by the fiber thread hosting the job, released on switch-out.
    pub(crate) host_token: LightweightBinarySemaphore,
    /// Index of the fiber thread currently hosting the job, or `NO_HOST`.
    pub(crate) host_index: AtomicU32,
    job: UnsafeCell<FiberJob>,
}

impl JobSlot {
    fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            status: AtomicU8::new(JobStatus::Created as u8),
            host_token: LightweightBinarySemaphore::new(true),
            host_index: AtomicU32::new(NO_HOST),
            job: UnsafeCell::new(FiberJob::new()),
        }
    }

    pub(crate) fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: JobStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// # Safety
    ///
    /// The caller must hold the host token, or own the slot outright while it
    /// is out of circulation (reserved and not yet queued).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn job_mut(&self) -> &mut FiberJob {
        unsafe { &mut *self.job.get() }
    }
}

/// Fixed-capacity pool of job slots.
pub(crate) struct JobPool {
    slots: Box<[JobSlot]>,
    free: SpinLock<Vec<u32>>,
}

// SAFETY: a slot's `FiberJob` is only touched under its host token or while
// the slot is reserved by a single submitter.
unsafe impl Sync for JobPool {}
unsafe impl Send for JobPool {}

impl JobPool {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.min(NO_HOST as usize);
        Self {
            slots: (0..capacity).map(|_| JobSlot::new()).collect(),
            // Lowest index on top.
            free: SpinLock::new((0..capacity as u32).rev().collect()),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots reserved, queued, running or suspended.
    pub(crate) fn outstanding(&self) -> usize {
        self.capacity() - self.free.lock().len()
    }

    /// Takes `count` free slots, or none at all.
    pub(crate) fn reserve(&self, count: usize) -> Result<Vec<u32>, FiberError> {
        let mut free = self.free.lock();
        if free.len() < count {
            return Err(FiberError::JobPoolExhausted {
                capacity: self.capacity(),
            });
        }
        let split = free.len() - count;
        let mut taken = free.split_off(split);
        taken.reverse();
        Ok(taken)
    }

    /// Fills a reserved slot and returns its handle.
    pub(crate) fn initialize(
        &self,
        index: u32,
        entry: JobEntry,
        completion: Option<Counter>,
        options: JobOptions,
    ) -> JobHandle {
        let slot = &self.slots[index as usize];
        // SAFETY: the slot is reserved and not yet visible to any host.
        unsafe { slot.job_mut() }.reset(entry, completion, options);
        slot.set_status(JobStatus::Created);
        JobHandle::new(index, slot.generation.load(Ordering::Acquire))
    }

    /// Returns a finished slot to the pool, invalidating its handles.
    pub(crate) fn recycle(&self, handle: JobHandle) {
        let slot = &self.slots[handle.index as usize];
        debug_assert_eq!(slot.status(), JobStatus::Finished);
        slot.generation
            .store(handle.generation.wrapping_add(1), Ordering::Release);
        slot.set_status(JobStatus::Created);
        self.free.lock().push(handle.index);
    }

    /// Resolves a handle, failing for recycled or out-of-range ones.
    pub(crate) fn slot(&self, handle: JobHandle) -> Option<&JobSlot> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation.load(Ordering::Acquire) == handle.generation)
    }

    pub(crate) fn status(&self, handle: JobHandle) -> Option<JobStatus> {
        self.slot(handle).map(JobSlot::status)
    }
}

/// What a fiber receives when a host starts a fresh job on it.
pub(crate) struct StartJob {
    pub(crate) entry: JobEntry,
    pub(crate) handle: JobHandle,
    pub(crate) shared: Arc<Shared>,
}

impl StartJob {
    /// Runs the entry point on the current fiber. Panics stop here.
    pub(crate) fn run(self, yielder: &JobYielder) {
        let StartJob {
            entry,
            handle,
            shared,
        } = self;
        let context = JobContext {
            shared: &shared,
            yielder,
            handle,
        };

        let result = catch_unwind(AssertUnwindSafe(|| entry(&context)));
        if let Err(payload) = result {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "unknown panic"
            };
            log::error!("job {handle:?} panicked: {msg}");
        }
    }
}

/// Scheduler access from inside a running job.
pub struct JobContext<'a> {
    shared: &'a Arc<Shared>,
    yielder: &'a JobYielder,
    handle: JobHandle,
}

impl JobContext<'_> {
    /// Handle of the running job.
    pub fn handle(&self) -> JobHandle {
        self.handle
    }

    /// Index of the fiber thread currently hosting the job.
    ///
    /// May change across [`wait_for_counter`](Self::wait_for_counter): a
    /// resumed job runs on whichever thread picked it up.
    pub fn thread_index(&self) -> u16 {
        fiber_thread::current_index().unwrap_or(u16::MAX)
    }

    /// Submits a job from inside this one. See
    /// [`FibersManager::submit_job`](crate::FibersManager::submit_job).
    pub fn submit_job<F>(&self, entry: F, counter: Option<&Counter>) -> Result<JobHandle, FiberError>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.shared
            .submit(Box::new(entry), JobOptions::default(), counter)
    }

    /// Submits a job with explicit options from inside this one.
    pub fn submit_job_with<F>(
        &self,
        entry: F,
        options: JobOptions,
        counter: Option<&Counter>,
    ) -> Result<JobHandle, FiberError>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.shared.submit(Box::new(entry), options, counter)
    }

    /// Submits a batch sharing `counter`. See
    /// [`FibersManager::submit_jobs`](crate::FibersManager::submit_jobs).
    pub fn submit_jobs<I, F>(&self, entries: I, counter: &Counter) -> Result<Vec<JobHandle>, FiberError>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.shared.submit_batch(
            entries.into_iter().map(|f| Box::new(f) as JobEntry).collect(),
            counter,
        )
    }

    /// Suspends the job until `counter` drops to `target`.
    ///
    /// Returns at once if it already has. Otherwise the hosting fiber thread
    /// moves on to other work and the job is requeued when the counter gets
    /// there; it may resume on a different thread.
    pub fn wait_for_counter(&self, counter: &Counter, target: usize) {
        if counter.has_reached(target) {
            return;
        }

        let _resumed = self.yielder.suspend(SwitchOut::Waiting {
            counter: counter.clone(),
            target,
        });
    }
}

/// Lets a job decrement counters other jobs are waiting on.
impl JobScheduler for JobContext<'_> {
    fn schedule(&self, job: JobHandle) {
        self.shared.schedule(job);
    }
}

impl fmt::Debug for JobContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
