//! Completion cascade through parent links.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use frame_scheduler::{Scheduler, SchedulerConfig, TaskContext, TaskState};

const FAN_OUT: usize = 4;
const DEPTH: usize = 3;
/// 1 + 4 + 16 + 64.
const TREE_SIZE: usize = 85;

fn grow(ctx: &TaskContext<'_>, level: usize, executed: Arc<AtomicUsize>) {
    executed.fetch_add(1, Ordering::Relaxed);
    if level == DEPTH {
        return;
    }
    for _ in 0..FAN_OUT {
        let executed = Arc::clone(&executed);
        ctx.spawn(move |ctx| grow(ctx, level + 1, executed));
    }
}

#[test]
fn dynamic_tree_completes_before_root_wait_returns() {
    for threads in [1, 2, 8] {
        let mut s = Scheduler::with_threads(threads).unwrap();
        let executed = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&executed);
        let root = s.submit_task(move |ctx| grow(ctx, 0, e), None);
        s.run_and_wait(root);
        assert_eq!(executed.load(Ordering::SeqCst), TREE_SIZE, "threads={threads}");
    }
}

fn count_into(executed: &Arc<AtomicUsize>) -> impl FnOnce(&TaskContext<'_>) + Send + 'static {
    let executed = Arc::clone(executed);
    move |_| {
        executed.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn prebuilt_tree_completes_before_root_wait_returns() {
    let mut s = Scheduler::with_threads(4).unwrap();
    let executed = Arc::new(AtomicUsize::new(0));

    let root = s.create_task(None, count_into(&executed));
    let mut level = vec![root];
    let mut pending = Vec::new();
    for _ in 0..DEPTH {
        let mut next = Vec::new();
        for &parent in &level {
            for _ in 0..FAN_OUT {
                next.push(s.create_task(Some(parent), count_into(&executed)));
            }
        }
        pending.extend_from_slice(&next);
        level = next;
    }
    assert_eq!(pending.len() + 1, TREE_SIZE);
    assert!(pending.iter().all(|&id| s.task_state(id) == TaskState::Created));

    for id in pending.iter().rev() {
        s.submit(*id);
    }
    s.run_and_wait(root);

    assert_eq!(executed.load(Ordering::SeqCst), TREE_SIZE);
    assert!(pending.iter().all(|&id| s.is_complete(id)));
}

#[test]
fn parent_is_not_complete_while_a_child_runs() {
    let mut s = Scheduler::with_threads(2).unwrap();
    let release = Arc::new(AtomicBool::new(false));
    let observed_incomplete = Arc::new(AtomicBool::new(false));

    let (r, o) = (Arc::clone(&release), Arc::clone(&observed_incomplete));
    let root = s.submit_task(
        move |ctx| {
            let r2 = Arc::clone(&r);
            let parent = ctx.task_id();
            let child = ctx.spawn(move |_| {
                while !r2.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
            });
            // The body is done once we return, but the child still blocks
            // completion.
            o.store(!ctx.is_complete(parent) && !ctx.is_complete(child), Ordering::Relaxed);
            r.store(true, Ordering::Release);
        },
        None,
    );
    s.run_and_wait(root);
    assert!(observed_incomplete.load(Ordering::Relaxed));
    assert!(s.is_complete(root));
}

#[test]
fn recycled_handle_reads_complete() {
    let cfg = SchedulerConfig {
        tasks_per_thread: 2,
        ..SchedulerConfig::with_threads(1)
    };
    let mut s = Scheduler::new(cfg).unwrap();
    let first = s.submit_task(|_| {}, None);
    s.run_and_wait(first);

    let mut later = Vec::new();
    for _ in 0..4 {
        let id = s.submit_task(|_| {}, None);
        s.run_and_wait(id);
        later.push(id);
    }
    assert!(later.iter().any(|id| id.slot() == first.slot()));
    assert!(s.is_complete(first));
    assert_eq!(s.task_state(first), TaskState::Completed);
}

#[test]
fn submit_from_another_task() {
    let mut s = Scheduler::with_threads(3).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    let root = s.submit_task(
        move |ctx| {
            let h2 = Arc::clone(&h);
            let deferred = ctx.create_child(move |_| {
                h2.fetch_add(1, Ordering::Relaxed);
            });
            let h3 = Arc::clone(&h);
            ctx.spawn(move |ctx| {
                h3.fetch_add(1, Ordering::Relaxed);
                ctx.submit(deferred);
            });
        },
        None,
    );
    s.run_and_wait(root);
    assert_eq!(hits.load(Ordering::Relaxed), 2);
}
