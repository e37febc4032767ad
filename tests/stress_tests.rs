use fiberjobs::{Counter, FiberConfig, FibersManager, JobContext};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[test]
fn test_ten_thousand_jobs_fill_distinct_slots() {
    const JOB_COUNT: usize = 10_000;

    let manager = FibersManager::with_config(FiberConfig {
        thread_count: 8,
        job_capacity: 16_384,
        ..FiberConfig::default()
    })
    .expect("failed to start fibers manager");

    let results: Arc<Vec<AtomicU64>> = Arc::new((0..JOB_COUNT).map(|_| AtomicU64::new(0)).collect());
    let counter = Counter::new(0);

    let jobs = (0..JOB_COUNT).map(|i| {
        let results = results.clone();
        move |_: &JobContext<'_>| {
            results[i].store((i * i) as u64, Ordering::Relaxed);
        }
    });
    manager.submit_jobs(jobs, &counter).unwrap();
    manager.wait_for_counter(&counter, 0);

    for (i, slot) in results.iter().enumerate() {
        assert_eq!(slot.load(Ordering::Relaxed), (i * i) as u64, "slot {i}");
    }
    assert_eq!(manager.outstanding_jobs(), 0);
    manager.stop().expect("Shutdown failed");
}

fn spawn_tree(ctx: &JobContext<'_>, depth: usize, leaves: Arc<AtomicUsize>) {
    if depth == 0 {
        leaves.fetch_add(1, Ordering::SeqCst);
        return;
    }

    let children = Counter::new(0);
    for _ in 0..4 {
        let leaves = leaves.clone();
        ctx.submit_job(move |ctx| spawn_tree(ctx, depth - 1, leaves), Some(&children))
            .unwrap();
    }
    ctx.wait_for_counter(&children, 0);
}

#[test]
fn test_recursive_fan_out_with_waits() {
    // 1 + 4 + 16 + 64 inner jobs may be suspended at once.
    let manager = FibersManager::with_config(FiberConfig {
        thread_count: 4,
        ..FiberConfig::default()
    })
    .expect("failed to start fibers manager");

    let leaves = Arc::new(AtomicUsize::new(0));
    let root = Counter::new(0);
    let leaves_clone = leaves.clone();
    manager
        .submit_job(move |ctx| spawn_tree(ctx, 4, leaves_clone), Some(&root))
        .unwrap();
    manager.wait_for_counter(&root, 0);

    assert_eq!(leaves.load(Ordering::SeqCst), 256);
    assert_eq!(
        manager.available_fiber_contexts(),
        manager.config().fiber_count + manager.config().big_fiber_count
    );
    manager.stop().expect("Shutdown failed");
}

#[test]
fn test_many_submitters_share_one_counter() {
    let manager = Arc::new(
        FibersManager::with_config(FiberConfig {
            thread_count: 4,
            ..FiberConfig::default()
        })
        .expect("failed to start fibers manager"),
    );
    let counter = Counter::new(0);
    let executed = Arc::new(AtomicUsize::new(0));

    let submitters: Vec<_> = (0..4)
        .map(|_| {
            let (manager, counter, executed) = (manager.clone(), counter.clone(), executed.clone());
            std::thread::spawn(move || {
                for _ in 0..250 {
                    let executed = executed.clone();
                    manager
                        .submit_job(
                            move |_| {
                                executed.fetch_add(1, Ordering::SeqCst);
                            },
                            Some(&counter),
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().unwrap();
    }

    manager.wait_for_counter(&counter, 0);
    assert_eq!(executed.load(Ordering::SeqCst), 1000);

    let manager = Arc::into_inner(manager).expect("submitters still hold the manager");
    manager.stop().expect("Shutdown failed");
}

#[test]
fn test_random_mix_of_waiting_and_plain_jobs() {
    // Every parent may be suspended at once and still leave contexts for the
    // children.
    let manager = FibersManager::with_config(FiberConfig {
        thread_count: 4,
        fiber_count: 1024,
        big_fiber_count: 0,
        stack_size: 64 * 1024,
        ..FiberConfig::default()
    })
    .expect("failed to start fibers manager");

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let expected = Arc::new(AtomicUsize::new(0));
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = Counter::new(0);

    for _ in 0..500 {
        let children: usize = rng.random_range(0..4);
        let work: u32 = rng.random_range(0..2_000);
        expected.fetch_add(1 + children, Ordering::SeqCst);

        let executed = executed.clone();
        manager
            .submit_job(
                move |ctx| {
                    let mut acc = 0u32;
                    for k in 0..work {
                        acc = acc.wrapping_add(std::hint::black_box(k));
                    }
                    std::hint::black_box(acc);

                    let done = Counter::new(0);
                    for _ in 0..children {
                        let executed = executed.clone();
                        ctx.submit_job(
                            move |_| {
                                executed.fetch_add(1, Ordering::SeqCst);
                            },
                            Some(&done),
                        )
                        .unwrap();
                    }
                    ctx.wait_for_counter(&done, 0);
                    executed.fetch_add(1, Ordering::SeqCst);
                },
                Some(&counter),
            )
            .unwrap();
    }

    manager.wait_for_counter(&counter, 0);
    assert_eq!(executed.load(Ordering::SeqCst), expected.load(Ordering::SeqCst));
    manager.stop().expect("Shutdown failed");
}
