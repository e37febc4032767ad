//! High-level fiber scheduler interface.
//!
//! The [`FibersManager`] owns the fiber threads, the job-slot pool, the fiber
//! contexts and the ready queue. It is the entry point for submitting jobs
//! and waiting on their counters from outside the pool.

use crate::config::FiberConfig;
use crate::context::ContextPool;
use crate::counter::{Counter, JobScheduler};
use crate::error::FiberError;
use crate::fiber_thread::{self, FiberThread};
use crate::job::{JobContext, JobEntry, JobHandle, JobOptions, JobPool, JobStatus};
use crate::threads;
use crossbeam::deque::{Injector, Steal};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering, fence};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// State shared by the manager, its fiber threads and running jobs.
pub(crate) struct Shared {
    config: FiberConfig,
    ready: Injector<JobHandle>,
    jobs: JobPool,
    contexts: ContextPool,
    wait_mutex: Mutex<()>,
    wait_variable: Condvar,
    /// Fiber threads inside `wait_for_job`. Submitters skip the mutex when zero.
    sleepers: AtomicUsize,
    suspensions: AtomicUsize,
    /// Jobs currently switched in on some fiber thread.
    running: AtomicUsize,
    epoch: Instant,
    /// Microseconds since `epoch` when jobs started failing to get a fiber
    /// context with no job running, 0 if they are not.
    starved_since: AtomicU64,
}

impl Shared {
    fn new(config: FiberConfig) -> Result<Self, FiberError> {
        let contexts = ContextPool::new(
            config.fiber_count,
            config.stack_size,
            config.big_fiber_count,
            config.big_stack_size,
        )
        .map_err(FiberError::StackAllocation)?;

        Ok(Shared {
            ready: Injector::new(),
            jobs: JobPool::new(config.job_capacity),
            contexts,
            wait_mutex: Mutex::new(()),
            wait_variable: Condvar::new(),
            sleepers: AtomicUsize::new(0),
            suspensions: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            epoch: Instant::now(),
            starved_since: AtomicU64::new(0),
            config,
        })
    }

    pub(crate) fn config(&self) -> &FiberConfig {
        &self.config
    }

    pub(crate) fn jobs(&self) -> &JobPool {
        &self.jobs
    }

    pub(crate) fn contexts(&self) -> &ContextPool {
        &self.contexts
    }

    pub(crate) fn pop_ready(&self) -> Option<JobHandle> {
        loop {
            match self.ready.steal() {
                Steal::Success(handle) => return Some(handle),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub(crate) fn lock_wait_mutex(&self) -> MutexGuard<'_, ()> {
        self.wait_mutex
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wake_all(&self) {
        self.wait_variable.notify_all();
    }

    /// Wakes up to `count` sleeping fiber threads after jobs were queued.
    fn notify_sleepers(&self, count: usize) {
        // Pairs with the fence in `wait_for_job`: either the sleeper sees the
        // queued job or we see the sleeper.
        fence(Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }

        let _lock = self.lock_wait_mutex();
        if count == 1 {
            self.wait_variable.notify_one();
        } else {
            self.wait_variable.notify_all();
        }
    }

    pub(crate) fn record_suspension(&self) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_switched_in(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn job_switched_out(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn context_acquired(&self) {
        if self.starved_since.load(Ordering::Relaxed) != 0 {
            self.starved_since.store(0, Ordering::Relaxed);
        }
    }

    /// Notes a job that found no free fiber context.
    ///
    /// Returns true once jobs kept failing to get one, with no job running to
    /// free one, for longer than `context_starvation_timeout_ms`. Reported
    /// once per timeout period.
    pub(crate) fn context_starved(&self) -> bool {
        if self.running.load(Ordering::SeqCst) > 0 {
            self.starved_since.store(0, Ordering::Relaxed);
            return false;
        }
        let timeout = self.config.context_starvation_timeout_ms.saturating_mul(1000);
        if timeout == 0 {
            return false;
        }

        let now = (self.epoch.elapsed().as_micros() as u64).max(1);
        match self
            .starved_since
            .compare_exchange(0, now, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => false,
            Err(since) if now.saturating_sub(since) >= timeout => {
                self.starved_since.store(0, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    /// Puts a job that could not start back at the tail of the ready queue.
    pub(crate) fn requeue(&self, handle: JobHandle) {
        self.schedule(handle);
    }

    /// Sleeps until a job is ready or `should_stop` is raised.
    pub(crate) fn wait_for_job(&self, should_stop: &AtomicBool) -> Option<JobHandle> {
        let mut guard = self.lock_wait_mutex();
        loop {
            // Raised under the wait mutex, so it cannot change between this
            // check and the wait below.
            if should_stop.load(Ordering::SeqCst) {
                return None;
            }

            self.sleepers.fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if let Some(handle) = self.pop_ready() {
                self.sleepers.fetch_sub(1, Ordering::SeqCst);
                return Some(handle);
            }

            guard = self
                .wait_variable
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
            self.sleepers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Draws a slot, raises `counter`, then queues the job.
    pub(crate) fn submit(
        &self,
        entry: JobEntry,
        options: JobOptions,
        counter: Option<&Counter>,
    ) -> Result<JobHandle, FiberError> {
        self.check_options(options)?;
        let index = self.reserve(1)?[0];

        if let Some(counter) = counter {
            counter.increment();
        }
        let handle = self
            .jobs
            .initialize(index, entry, counter.cloned(), options);
        self.schedule(handle);
        Ok(handle)
    }

    /// Draws every slot and raises `counter` by the batch size before the
    /// first job is queued, so no early finisher can drive it to zero.
    pub(crate) fn submit_batch(
        &self,
        entries: Vec<JobEntry>,
        counter: &Counter,
    ) -> Result<Vec<JobHandle>, FiberError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let indices = self.reserve(entries.len())?;

        counter.add(entries.len());
        let handles: Vec<_> = indices
            .into_iter()
            .zip(entries)
            .map(|(index, entry)| {
                self.jobs
                    .initialize(index, entry, Some(counter.clone()), JobOptions::default())
            })
            .collect();

        for handle in &handles {
            self.ready.push(*handle);
        }
        self.notify_sleepers(handles.len());
        Ok(handles)
    }

    fn reserve(&self, count: usize) -> Result<Vec<u32>, FiberError> {
        self.jobs.reserve(count).inspect_err(|err| {
            log::error!("cannot submit {count} job(s): {err}");
        })
    }

    fn check_options(&self, options: JobOptions) -> Result<(), FiberError> {
        if options.big_stack && self.config.big_fiber_count == 0 {
            log::error!("big-stack job submitted without big fiber contexts");
            return Err(FiberError::InvalidConfig(
                "big_stack requested but big_fiber_count is 0",
            ));
        }
        Ok(())
    }
}

impl JobScheduler for Shared {
    fn schedule(&self, job: JobHandle) {
        self.ready.push(job);
        self.notify_sleepers(1);
    }
}

/// The fiber scheduler.
///
/// This is the primary interface for the fiber-based job system. It owns a
/// fixed pool of fiber threads for its whole lifetime and must be stopped
/// with [`stop`](Self::stop) once every submitted job has completed.
///
/// # Example
///
/// ```no_run
/// use fiberjobs::{Counter, FibersManager};
///
/// let manager = FibersManager::new(4).expect("failed to start fiber threads");
/// let counter = Counter::new(0);
/// manager
///     .submit_job(|_| println!("Hello from a fiber job!"), Some(&counter))
///     .expect("job pool exhausted");
/// manager.wait_for_counter(&counter, 0);
/// manager.stop().expect("Shutdown failed");
/// ```
pub struct FibersManager {
    shared: Arc<Shared>,
    threads: Vec<FiberThread>,
}

impl FibersManager {
    /// Creates a manager with the default configuration and `thread_count`
    /// fiber threads.
    ///
    /// A positive count is used as is, `0` starts one thread per hardware
    /// thread and a negative count leaves that many hardware threads free.
    pub fn new(thread_count: i32) -> Result<Self, FiberError> {
        Self::with_config(FiberConfig::with_threads(thread_count))
    }

    /// Creates a manager from an explicit configuration.
    ///
    /// Allocates every job slot and fiber stack up front and starts the fiber
    /// threads.
    pub fn with_config(config: FiberConfig) -> Result<Self, FiberError> {
        config.validate()?;
        let thread_count = threads::resolve_thread_count(config.thread_count);
        if thread_count > u16::MAX as usize {
            return Err(FiberError::InvalidConfig("thread_count exceeds u16 range"));
        }

        let shared = Arc::new(Shared::new(config)?);
        let mut fiber_threads = Vec::with_capacity(thread_count);
        for index in 0..thread_count {
            match FiberThread::spawn(index as u16, shared.clone()) {
                Ok(thread) => fiber_threads.push(thread),
                Err(err) => {
                    log::error!("failed to start fiber thread {index}: {err}");
                    stop_threads(&shared, fiber_threads);
                    return Err(err);
                }
            }
        }

        log::debug!("fibers manager started with {thread_count} fiber thread(s)");
        Ok(FibersManager {
            shared,
            threads: fiber_threads,
        })
    }

    /// Returns the number of fiber threads.
    pub fn fiber_thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn config(&self) -> &FiberConfig {
        self.shared.config()
    }

    /// Submits a job to the ready queue.
    ///
    /// If `counter` is given it is incremented now and decremented once the
    /// job finished.
    ///
    /// # Errors
    ///
    /// [`FiberError::JobPoolExhausted`] if every job slot is in use. Pool
    /// capacity is a startup decision, so this is a configuration error.
    pub fn submit_job<F>(&self, entry: F, counter: Option<&Counter>) -> Result<JobHandle, FiberError>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.shared
            .submit(Box::new(entry), JobOptions::default(), counter)
    }

    /// Submits a job with explicit options, e.g. a big stack.
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

    /// Submits several jobs sharing one completion counter.
    ///
    /// The counter is raised by the number of jobs before any of them can
    /// run. Either every job is queued or none is.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fiberjobs::{Counter, FibersManager, JobContext};
    ///
    /// let manager = FibersManager::new(4).unwrap();
    /// let counter = Counter::new(0);
    /// let jobs = (0..3).map(|i| move |_: &JobContext<'_>| println!("Job {i}"));
    /// manager.submit_jobs(jobs, &counter).unwrap();
    /// manager.wait_for_counter(&counter, 0);
    /// manager.stop().unwrap();
    /// ```
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

    /// Blocks the calling OS thread until `counter` drops to `target`.
    ///
    /// For threads outside the pool. Jobs wait through
    /// [`JobContext::wait_for_counter`], which suspends the fiber instead;
    /// blocking a fiber thread here is a programming error.
    pub fn wait_for_counter(&self, counter: &Counter, target: usize) {
        if counter.has_reached(target) {
            return;
        }

        if fiber_thread::is_fiber_thread() {
            log::error!("wait_for_counter blocked a fiber thread; use JobContext::wait_for_counter");
            debug_assert!(false, "blocking counter wait on a fiber thread");
        }
        counter.wait_blocking(target);
    }

    /// Status of a job, or `None` once its slot was recycled.
    pub fn job_status(&self, handle: JobHandle) -> Option<JobStatus> {
        self.shared.jobs().status(handle)
    }

    /// Jobs submitted and not yet finished.
    pub fn outstanding_jobs(&self) -> usize {
        self.shared.jobs().outstanding()
    }

    /// Fiber contexts not bound to a running or suspended job.
    pub fn available_fiber_contexts(&self) -> usize {
        self.shared.contexts().available()
    }

    /// Times a job switched out to wait on a counter since startup.
    pub fn suspension_count(&self) -> usize {
        self.shared.suspensions.load(Ordering::Relaxed)
    }

    /// Stops every fiber thread and joins it.
    ///
    /// Call only once all submitted counters reached their targets: threads
    /// finish what they host but queued or suspended jobs are abandoned.
    ///
    /// Returns Ok if shutdown was clean, otherwise the number of panicked
    /// threads or abandoned jobs.
    pub fn stop(mut self) -> Result<(), FiberError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), FiberError> {
        let panicked = stop_threads(&self.shared, self.threads.drain(..));
        if panicked > 0 {
            return Err(FiberError::ThreadsPanicked(panicked));
        }

        let abandoned = self.shared.jobs().outstanding();
        if abandoned > 0 {
            log::error!("fibers manager stopped with {abandoned} pending job(s)");
            return Err(FiberError::AbandonedJobs(abandoned));
        }
        Ok(())
    }
}

/// Stops and joins `threads`, logging each one that panicked.
///
/// Returns how many panicked.
fn stop_threads(shared: &Shared, threads: impl IntoIterator<Item = FiberThread>) -> usize {
    let threads: Vec<_> = threads.into_iter().collect();
    for thread in &threads {
        thread.request_stop(shared);
    }

    let mut panicked = 0;
    for thread in threads {
        let index = thread.index();
        if thread.join().is_err() {
            panicked += 1;
            log::error!("fiber thread {index} panicked");
        }
    }
    panicked
}

/// Lets threads outside the pool decrement counters jobs are waiting on.
impl JobScheduler for FibersManager {
    fn schedule(&self, job: JobHandle) {
        self.shared.schedule(job);
    }
}

impl Drop for FibersManager {
    fn drop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        log::warn!("fibers manager dropped without stop()");
        if let Err(err) = self.shutdown() {
            log::error!("implicit shutdown failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn small_config(thread_count: i32) -> FiberConfig {
        FiberConfig {
            thread_count,
            job_capacity: 64,
            fiber_count: 8,
            big_fiber_count: 1,
            stack_size: 64 * 1024,
            big_stack_size: 256 * 1024,
            ..FiberConfig::default()
        }
    }

    #[test]
    fn test_manager_creation() {
        let manager = FibersManager::with_config(small_config(3)).unwrap();
        assert_eq!(manager.fiber_thread_count(), 3);
        assert_eq!(manager.config().job_capacity, 64);
        manager.stop().expect("Shutdown failed");
    }

    #[test]
    fn test_negative_thread_count_keeps_one_thread() {
        let manager = FibersManager::with_config(small_config(-4096)).unwrap();
        assert_eq!(manager.fiber_thread_count(), 1);
        manager.stop().expect("Shutdown failed");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = FiberConfig {
            fiber_count: 0,
            ..small_config(1)
        };
        assert!(matches!(
            FibersManager::with_config(config),
            Err(FiberError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_submit_job_runs_and_decrements() {
        let manager = FibersManager::with_config(small_config(2)).unwrap();
        let counter = Counter::new(0);
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        manager
            .submit_job(move |_| flag.store(true, Ordering::SeqCst), Some(&counter))
            .unwrap();
        manager.wait_for_counter(&counter, 0);

        assert!(ran.load(Ordering::SeqCst));
        assert!(counter.is_complete());
        manager.stop().expect("Shutdown failed");
    }

    #[test]
    fn test_big_stack_requires_big_contexts() {
        let config = FiberConfig {
            big_fiber_count: 0,
            ..small_config(1)
        };
        let manager = FibersManager::with_config(config).unwrap();
        let result = manager.submit_job_with(|_| {}, JobOptions { big_stack: true }, None);
        assert!(matches!(result, Err(FiberError::InvalidConfig(_))));
        manager.stop().expect("Shutdown failed");
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let manager = FibersManager::with_config(small_config(1)).unwrap();
        let counter = Counter::new(0);
        let handles = manager
            .submit_jobs(Vec::<JobEntry>::new(), &counter)
            .unwrap();
        assert!(handles.is_empty());
        assert_eq!(counter.value(), 0);
        manager.stop().expect("Shutdown failed");
    }

    #[test]
    fn test_context_starvation_reported_after_timeout() {
        let shared = Shared::new(FiberConfig {
            context_starvation_timeout_ms: 5,
            ..small_config(1)
        })
        .unwrap();

        assert!(!shared.context_starved());
        thread::sleep(Duration::from_millis(10));
        assert!(shared.context_starved());
        // Reported once, then the period starts over.
        assert!(!shared.context_starved());

        thread::sleep(Duration::from_millis(10));
        shared.context_acquired();
        assert!(!shared.context_starved());

        // A running job may still free a context.
        shared.job_switched_in();
        thread::sleep(Duration::from_millis(10));
        assert!(!shared.context_starved());
        shared.job_switched_out();
    }

    #[test]
    fn test_zero_starvation_timeout_disables_report() {
        let shared = Shared::new(FiberConfig {
            context_starvation_timeout_ms: 0,
            ..small_config(1)
        })
        .unwrap();

        assert!(!shared.context_starved());
        thread::sleep(Duration::from_millis(5));
        assert!(!shared.context_starved());
    }

    // The starvation report asserts in debug builds, which kills the thread.
    #[cfg(debug_assertions)]
    #[test]
    fn test_stop_threads_counts_panicked_thread() {
        let shared = Arc::new(
            Shared::new(FiberConfig {
                fiber_count: 1,
                big_fiber_count: 0,
                context_starvation_timeout_ms: 10,
                ..small_config(1)
            })
            .unwrap(),
        );
        let worker = FiberThread::spawn(0, shared.clone()).unwrap();

        // The parent holds the only context while its child waits for one.
        shared
            .submit(
                Box::new(|ctx: &JobContext<'_>| {
                    let child = Counter::new(0);
                    ctx.submit_job(|_| {}, Some(&child)).unwrap();
                    ctx.wait_for_counter(&child, 0);
                }),
                JobOptions::default(),
                None,
            )
            .unwrap();
        thread::sleep(Duration::from_millis(300));

        assert_eq!(stop_threads(&shared, vec![worker]), 1);
    }
}
