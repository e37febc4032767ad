//! A job is never hosted by two fiber threads at once, even when it is
//! suspended and resumed many times across threads.

use fiberjobs::{Counter, FiberConfig, FibersManager, JobContext};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct JobTracker {
    active: AtomicBool,
    steps: AtomicUsize,
}

#[test]
fn test_suspending_jobs_hosted_exclusively() {
    const JOBS: usize = 64;
    const ROUNDS: usize = 8;

    let manager = FibersManager::with_config(FiberConfig {
        thread_count: 8,
        ..FiberConfig::default()
    })
    .expect("failed to start fibers manager");

    let trackers: Arc<Vec<JobTracker>> = Arc::new(
        (0..JOBS)
            .map(|_| JobTracker {
                active: AtomicBool::new(false),
                steps: AtomicUsize::new(0),
            })
            .collect(),
    );
    let hosts = Arc::new(Mutex::new(HashSet::new()));
    let counter = Counter::new(0);

    let jobs = (0..JOBS).map(|i| {
        let (trackers, hosts) = (trackers.clone(), hosts.clone());
        move |ctx: &JobContext<'_>| {
            let tracker = &trackers[i];
            for _ in 0..ROUNDS {
                assert!(!tracker.active.swap(true, Ordering::SeqCst), "job {i} hosted twice");
                tracker.steps.fetch_add(1, Ordering::SeqCst);
                hosts.lock().unwrap().insert(ctx.thread_index());
                tracker.active.store(false, Ordering::SeqCst);

                let child = Counter::new(0);
                ctx.submit_job(|_| std::hint::black_box(()), Some(&child))
                    .unwrap();
                ctx.wait_for_counter(&child, 0);
            }
        }
    });
    manager.submit_jobs(jobs, &counter).unwrap();
    manager.wait_for_counter(&counter, 0);

    for (i, tracker) in trackers.iter().enumerate() {
        assert_eq!(tracker.steps.load(Ordering::SeqCst), ROUNDS, "job {i}");
    }
    assert!(!hosts.lock().unwrap().is_empty());
    // A failed hosting check aborts the fiber thread, which stop() reports.
    manager.stop().expect("Shutdown failed");
}
