//! Parallel-for coverage.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use frame_scheduler::{Scheduler, SchedulerConfig};

fn counters(n: usize) -> Arc<Vec<AtomicU8>> {
    Arc::new((0..n).map(|_| AtomicU8::new(0)).collect())
}

fn assert_each_once(hits: &[AtomicU8]) {
    for (i, c) in hits.iter().enumerate() {
        assert_eq!(c.load(Ordering::Relaxed), 1, "index {i}");
    }
}

#[test]
fn covers_1000_indices_with_block_7() {
    for threads in [1, 2, 8] {
        let mut s = Scheduler::with_threads(threads).unwrap();
        let hits = counters(1000);
        let h = Arc::clone(&hits);
        let id = s.parallel_for(1000, Some(7), move |i| {
            h[i].fetch_add(1, Ordering::Relaxed);
        });
        s.run_and_wait(id);
        assert_each_once(&hits);
    }
}

#[test]
fn leaf_count_matches_split_depth() {
    // 1024 / 8 splits evenly into 128 leaves of 8.
    let mut s = Scheduler::with_threads(4).unwrap();
    let leaves = Arc::new(AtomicUsize::new(0));
    let l = Arc::clone(&leaves);
    let id = s.parallel_for_chunks(1024, Some(8), move |range| {
        assert_eq!(range.len(), 8);
        l.fetch_add(1, Ordering::Relaxed);
    });
    s.run_and_wait(id);
    assert_eq!(leaves.load(Ordering::Relaxed), 128);
}

#[test]
fn count_below_block_is_a_single_leaf() {
    let mut s = Scheduler::with_threads(2).unwrap();
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&ranges);
    let id = s.parallel_for_chunks(5, Some(64), move |range| {
        r.lock().unwrap().push(range);
    });
    s.run_and_wait(id);
    assert_eq!(*ranges.lock().unwrap(), vec![0..5]);
}

#[test]
fn consecutive_frames_reuse_the_pool() {
    let cfg = SchedulerConfig {
        tasks_per_thread: 256,
        ..SchedulerConfig::with_threads(4)
    };
    let mut s = Scheduler::new(cfg).unwrap();
    for frame in 0..50 {
        let hits = counters(500);
        let h = Arc::clone(&hits);
        let id = s.parallel_for(500, Some(16), move |i| {
            h[i].fetch_add(1, Ordering::Relaxed);
        });
        s.run_and_wait(id);
        assert!(
            hits.iter().all(|c| c.load(Ordering::Relaxed) == 1),
            "frame {frame}"
        );
    }
}

#[test]
fn nested_loops_inside_tasks() {
    let mut s = Scheduler::with_threads(4).unwrap();
    let hits = counters(32 * 32);
    let h = Arc::clone(&hits);
    let root = s.submit_task(
        move |ctx| {
            let outer = ctx.parallel_for_chunks(32, Some(4), move |rows| {
                for row in rows {
                    for col in 0..32 {
                        h[row * 32 + col].fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
            ctx.wait(outer);
            assert!(ctx.is_complete(outer));
        },
        None,
    );
    s.run_and_wait(root);
    assert_each_once(&hits);
}
