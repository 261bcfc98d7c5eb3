//! Exactly-once execution under steal contention.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use frame_scheduler::{Scheduler, SchedulerConfig};

const TASKS: usize = 100_000;
const THREADS: usize = 8;

fn counters(n: usize) -> Arc<Vec<AtomicU8>> {
    Arc::new((0..n).map(|_| AtomicU8::new(0)).collect())
}

/// Flat batches: each root fans out 1000 leaf tasks that other workers steal.
#[test]
fn each_task_body_runs_once_flat() {
    const BATCH: usize = 1_000;

    let mut s = Scheduler::with_threads(THREADS).unwrap();
    let runs = counters(TASKS);

    for batch in 0..TASKS / BATCH {
        let runs = Arc::clone(&runs);
        let root = s.submit_task(
            move |ctx| {
                for k in 0..BATCH {
                    let runs = Arc::clone(&runs);
                    let index = batch * BATCH + k;
                    ctx.spawn(move |_| {
                        runs[index].fetch_add(1, Ordering::Relaxed);
                    });
                }
            },
            None,
        );
        s.run_and_wait(root);
    }

    for (i, c) in runs.iter().enumerate() {
        assert_eq!(c.load(Ordering::Relaxed), 1, "task {i}");
    }
    let m = s.shutdown();
    assert_eq!(m.tasks_executed, (TASKS + TASKS / BATCH) as u64);
    assert_eq!(m.tasks_skipped, 0);
}

/// Recursive splitting down to single-index leaves; every split is a task.
#[test]
fn each_task_body_runs_once_recursive() {
    let cfg = SchedulerConfig {
        tasks_per_thread: 8192,
        ..SchedulerConfig::with_threads(THREADS)
    };
    let mut s = Scheduler::new(cfg).unwrap();
    let runs = counters(TASKS);
    let r = Arc::clone(&runs);
    let id = s.parallel_for(TASKS, Some(1), move |i| {
        r[i].fetch_add(1, Ordering::Relaxed);
    });
    s.run_and_wait(id);
    assert!(runs.iter().all(|c| c.load(Ordering::Relaxed) == 1));

    let m = s.shutdown();
    // 100_000 leaves in a full binary split tree: 2n - 1 tasks.
    assert_eq!(m.tasks_executed, (2 * TASKS - 1) as u64);
    assert_eq!(m.tasks_submitted, m.tasks_executed);
}
