//! Contract violations, task panics and construction errors.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use frame_scheduler::{ConfigError, Scheduler, SchedulerConfig, SchedulerError};

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_default()
}

#[test]
fn task_panic_halts_the_frame_and_reaches_the_owner() {
    let mut s = Scheduler::with_threads(4).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ran);
    let id = s.parallel_for(10_000, Some(10), move |i| {
        if i == 4_321 {
            panic!("bad index {i}");
        }
        r.fetch_add(1, Ordering::Relaxed);
    });

    let err = panic::catch_unwind(AssertUnwindSafe(|| s.run_and_wait(id)))
        .expect_err("the task panic must surface in run_and_wait");
    assert_eq!(panic_message(err.as_ref()), "bad index 4321");
    assert!(s.is_complete(id));
    assert!(ran.load(Ordering::Relaxed) < 10_000);

    // Next frame runs normally.
    let ran = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ran);
    let id = s.parallel_for(1_000, Some(10), move |_| {
        r.fetch_add(1, Ordering::Relaxed);
    });
    s.run_and_wait(id);
    assert_eq!(ran.load(Ordering::Relaxed), 1_000);
}

#[test]
fn nested_wait_propagates_panic_upwards() {
    let mut s = Scheduler::with_threads(2).unwrap();
    let after_wait = Arc::new(AtomicUsize::new(0));
    let a = Arc::clone(&after_wait);
    let root = s.submit_task(
        move |ctx| {
            let child = ctx.spawn(|_| panic!("child failed"));
            ctx.wait(child);
            a.fetch_add(1, Ordering::Relaxed);
        },
        None,
    );
    let err = panic::catch_unwind(AssertUnwindSafe(|| s.run_and_wait(root))).unwrap_err();
    // The first payload wins, not the nested wait's own panic.
    assert_eq!(panic_message(err.as_ref()), "child failed");
    assert_eq!(after_wait.load(Ordering::Relaxed), 0);
}

#[test]
fn scheduler_cannot_be_created_inside_a_task() {
    let mut s = Scheduler::with_threads(3).unwrap();
    let results = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&results);
    let id = s.parallel_for(12, Some(1), move |_| {
        let res = Scheduler::with_threads(1);
        let index = frame_scheduler::current_worker_index();
        r.lock().unwrap().push((res.err().map(|e| e.to_string()), index));
    });
    s.run_and_wait(id);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 12);
    for (err, index) in results.iter() {
        let index = index.expect("tasks run on workers");
        assert_eq!(
            err.as_deref(),
            Some(SchedulerError::NestedScheduler(index).to_string().as_str())
        );
    }
}

#[test]
fn invalid_config_is_reported() {
    let cfg = SchedulerConfig {
        deque_capacity: 1000,
        ..SchedulerConfig::with_threads(2)
    };
    match Scheduler::new(cfg) {
        Err(SchedulerError::Config(ConfigError::DequeCapacity(1000))) => {}
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn malformed_env_override_is_reported() {
    std::env::set_var("FRAME_SCHED_MIN_BLOCK", "lots");
    let res = SchedulerConfig::from_env();
    std::env::remove_var("FRAME_SCHED_MIN_BLOCK");
    assert_eq!(
        res,
        Err(ConfigError::InvalidEnv {
            var: "FRAME_SCHED_MIN_BLOCK",
            value: "lots".to_owned(),
        })
    );
}

#[test]
#[should_panic(expected = "exceeds max_closure_bytes")]
fn closure_over_budget_panics() {
    let cfg = SchedulerConfig {
        max_closure_bytes: 16,
        ..SchedulerConfig::with_threads(1)
    };
    let mut s = Scheduler::new(cfg).unwrap();
    let payload = [7u64; 4];
    s.submit_task(
        move |_| {
            std::hint::black_box(payload);
        },
        None,
    );
}

#[test]
#[should_panic(expected = "deque overflow")]
fn deque_overflow_panics() {
    let cfg = SchedulerConfig {
        deque_capacity: 4,
        tasks_per_thread: 64,
        ..SchedulerConfig::with_threads(1)
    };
    let mut s = Scheduler::new(cfg).unwrap();
    for _ in 0..5 {
        s.submit_task(|_| {}, None);
    }
}

#[test]
#[should_panic(expected = "exhausted")]
fn pool_exhaustion_panics() {
    let cfg = SchedulerConfig {
        tasks_per_thread: 4,
        ..SchedulerConfig::with_threads(1)
    };
    let mut s = Scheduler::new(cfg).unwrap();
    for _ in 0..5 {
        s.create_task(None, |_| {});
    }
}
