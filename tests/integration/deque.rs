//! Deque ordering and steal starvation-freedom.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use frame_scheduler::stdx::ws_deque::{Steal, Worker};
use frame_scheduler::{Scheduler, SchedulerConfig};

#[test]
fn owner_pops_in_lifo_order() {
    let w = Worker::with_capacity(8);
    for v in [b'A', b'B', b'C'] {
        w.push(u64::from(v));
    }
    let popped: Vec<u8> = std::iter::from_fn(|| w.pop()).map(|v| v as u8).collect();
    assert_eq!(popped, b"CBA");
}

#[test]
fn thieves_take_the_oldest_entry() {
    let w = Worker::with_capacity(8);
    let s = w.stealer();
    for v in 1..=3 {
        w.push(v);
    }
    assert_eq!(s.steal(), Steal::Success(1));
    assert_eq!(w.pop(), Some(3));
    assert_eq!(s.steal(), Steal::Success(2));
    assert_eq!(s.steal(), Steal::Empty);
}

#[test]
fn owner_and_thieves_drain_each_entry_once() {
    const M: u64 = 20_000;
    const THIEVES: usize = 4;

    let w = Worker::with_capacity(32_768);
    let seen: Arc<Vec<AtomicU8>> = Arc::new((0..M).map(|_| AtomicU8::new(0)).collect());
    let taken = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THIEVES)
        .map(|_| {
            let s = w.stealer();
            let seen = Arc::clone(&seen);
            let taken = Arc::clone(&taken);
            thread::spawn(move || {
                while taken.load(Ordering::Acquire) < M as usize {
                    if let Steal::Success(v) = s.steal() {
                        seen[v as usize].fetch_add(1, Ordering::Relaxed);
                        taken.fetch_add(1, Ordering::AcqRel);
                    }
                }
            })
        })
        .collect();

    for v in 0..M {
        w.push(v);
        if v % 3 == 0 {
            if let Some(p) = w.pop() {
                seen[p as usize].fetch_add(1, Ordering::Relaxed);
                taken.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
    while let Some(p) = w.pop() {
        seen[p as usize].fetch_add(1, Ordering::Relaxed);
        taken.fetch_add(1, Ordering::AcqRel);
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(taken.load(Ordering::Relaxed), M as usize);
    assert!(seen.iter().all(|c| c.load(Ordering::Relaxed) == 1));
}

/// M independent tasks pushed onto the owner's deque are all executed once
/// while the other workers steal them.
#[test]
fn tasks_on_one_deque_all_run_once() {
    const M: usize = 5_000;

    let cfg = SchedulerConfig {
        deque_capacity: 8192,
        tasks_per_thread: 8192,
        ..SchedulerConfig::with_threads(4)
    };
    let mut s = Scheduler::new(cfg).unwrap();
    let runs: Arc<Vec<AtomicU8>> = Arc::new((0..M).map(|_| AtomicU8::new(0)).collect());
    let workers: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());

    let root = s.create_task(None, |_| {});
    for i in 0..M {
        let runs = Arc::clone(&runs);
        let workers = Arc::clone(&workers);
        s.submit_task(
            move |ctx| {
                runs[i].fetch_add(1, Ordering::Relaxed);
                workers[ctx.worker_index()].fetch_add(1, Ordering::Relaxed);
                std::hint::black_box((0..200).sum::<u64>());
            },
            Some(root),
        );
    }
    s.run_and_wait(root);

    assert!(runs.iter().all(|c| c.load(Ordering::Relaxed) == 1));
    let total: usize = workers.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    assert_eq!(total, M);

    let m = s.shutdown();
    assert_eq!(m.tasks_executed, M as u64 + 1);
    assert_eq!(m.local_pops + m.steal_successes, M as u64 + 1);
}
