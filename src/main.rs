use fiberjobs::{Counter, FiberError, FibersManager, JobContext, profiling};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

fn main() -> Result<(), FiberError> {
    println!("fiberjobs - Cooperative Fiber-Based Job Scheduler\n");

    // Pass a path to write a Chrome trace of the run.
    let trace_path = std::env::args().nth(1);
    if trace_path.is_some() {
        profiling::set_enabled(true);
    }

    // Create a manager with 4 fiber threads
    let num_threads = 4;
    let manager = FibersManager::new(num_threads)?;
    println!(
        "Initialized fibers manager with {} fiber threads\n",
        manager.fiber_thread_count()
    );

    // Example 1: Simple job execution
    println!("Example 1: Simple job execution");
    let counter = Counter::new(0);
    manager
        .submit_job(|_| println!("  Hello from a fiber job!"), Some(&counter))?;
    manager.wait_for_counter(&counter, 0);
    println!("  Job completed\n");

    // Example 2: Multiple parallel jobs
    println!("Example 2: Parallel computation");
    let sum = Arc::new(AtomicUsize::new(0));
    let num_jobs = 100;

    let start = Instant::now();
    let jobs = (0..num_jobs).map(|i| {
        let sum_clone = sum.clone();
        move |_: &JobContext<'_>| {
            // Simulate some work
            let _local_sum: usize = std::hint::black_box((0..1000).sum());
            sum_clone.fetch_add(i, Ordering::SeqCst);
        }
    });
    let counter = Counter::new(0);
    manager.submit_jobs(jobs, &counter)?;
    manager.wait_for_counter(&counter, 0);

    let duration = start.elapsed();
    let expected_sum: usize = (0..num_jobs).sum();
    println!("  Executed {} jobs in {:?}", num_jobs, duration);
    println!(
        "  Sum result: {} (expected: {})\n",
        sum.load(Ordering::SeqCst),
        expected_sum
    );

    // Example 3: A job waiting on its children without blocking its thread
    println!("Example 3: Nested jobs");
    let counter = Counter::new(0);
    manager
        .submit_job(
            |ctx| {
                let children = Counter::new(0);
                let results = Arc::new(AtomicUsize::new(0));
                for i in 1..=8 {
                    let results = results.clone();
                    let job = move |_: &JobContext<'_>| {
                        results.fetch_add(i * i, Ordering::SeqCst);
                    };
                    if let Err(e) = ctx.submit_job(job, Some(&children)) {
                        eprintln!("  Failed to submit child: {}", e);
                    }
                }
                ctx.wait_for_counter(&children, 0);
                println!(
                    "  Sum of squares 1..=8: {} (resumed on fiber thread {})",
                    results.load(Ordering::SeqCst),
                    ctx.thread_index()
                );
            },
            Some(&counter),
        )?;
    manager.wait_for_counter(&counter, 0);
    println!("  Suspensions so far: {}\n", manager.suspension_count());

    // Example 4: High-throughput test
    println!("Example 4: High-throughput benchmark");
    let num_jobs = 4000;
    let start = Instant::now();
    let jobs = (0..num_jobs).map(|_| {
        |_: &JobContext<'_>| {
            // Minimal work
            std::hint::black_box((0..10).sum::<i32>());
        }
    });
    let counter = Counter::new(0);
    manager.submit_jobs(jobs, &counter)?;
    manager.wait_for_counter(&counter, 0);

    let duration = start.elapsed();
    let jobs_per_second = num_jobs as f64 / duration.as_secs_f64();
    println!("  Executed {} jobs in {:?}", num_jobs, duration);
    println!("  Throughput: {:.2} jobs/second\n", jobs_per_second);

    // Shutdown the manager
    println!("Shutting down fibers manager...");
    match manager.stop() {
        Ok(_) => println!("Done!"),
        Err(e) => eprintln!("Shutdown error: {}", e),
    }

    if let Some(path) = trace_path {
        profiling::collect_local_trace();
        match profiling::export_to_file(&path) {
            Ok(_) => println!("Trace written to {}", path),
            Err(e) => eprintln!("Failed to write trace: {}", e),
        }
    }

    Ok(())
}
