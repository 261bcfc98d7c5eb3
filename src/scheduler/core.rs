//! Scheduler core: worker threads, the scheduling loop and task waits.
//!
//! # Architecture
//!
//! ```text
//!   owner thread (worker 0)               background workers 1..N
//!   ┌──────────────────────────┐          ┌──────────────────────────┐
//!   │ Scheduler                │          │ worker_main              │
//!   │   local: WorkerLocal ────┼─ deque ──┼── local: WorkerLocal     │
//!   │   run_and_wait: helps    │          │   loop: pop / steal /    │
//!   │   until the task is done │          │   spin → yield → park    │
//!   └─────────────┬────────────┘          └────────────┬─────────────┘
//!                 │            Arc<Shared>             │
//!                 └──► pool, stealers, unparkers, panic slot ◄──┘
//! ```
//!
//! Every participating thread owns one deque and one slice of the task pool.
//! Task handles are the only thing that crosses threads, through a steal or
//! a parent link.
//!
//! # Scheduling loop
//!
//! 1. Pop from the own deque (LIFO: newest task, hottest cache lines).
//! 2. Else steal from up to `steal_tries` random peers (FIFO end: oldest,
//!    usually coarsest, task).
//! 3. Else go idle. Background workers spin, then yield, then park with a
//!    timeout. A thread waiting on a task never parks; it keeps polling so
//!    the task it waits on (or its stolen children) keep moving.
//!
//! # Task panics
//!
//! Bodies run under `catch_unwind`. The first payload is kept and the
//! scheduler is poisoned: later bodies are skipped, but their counters still
//! cascade so every wait returns. The outermost [`Scheduler::run_and_wait`]
//! re-raises the payload on the owning thread and clears the poison.

use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::hint;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_utils::sync::{Parker, Unparker};
use tracing::{debug, info, warn};

use super::config::SchedulerConfig;
use super::error::SchedulerError;
use super::metrics::{MetricsSnapshot, WorkerMetricsLocal};
use super::rng::VictimRng;
use super::task::{InlineJob, TaskId, TaskState};
use super::task_pool::TaskPool;
use super::worker_id::{current_worker_index, set_current_worker_index};
use crate::stdx::ws_deque::{Steal, Stealer, Worker};

/// Idle rounds between `yield_now` calls while waiting on a task.
const WAIT_YIELD_MASK: u32 = 0x3F;

// ============================================================================
// Shared state
// ============================================================================

/// State visible to every worker.
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) pool: TaskPool,
    /// One per worker, indexed by worker index.
    stealers: Box<[Stealer]>,
    /// Background workers only: `unparkers[i]` wakes worker `i + 1`.
    unparkers: Box<[Unparker]>,
    next_unpark: AtomicUsize,
    /// Background workers currently parked (or about to).
    sleepers: AtomicUsize,
    stop: AtomicBool,
    poisoned: AtomicBool,
    panic: Mutex<Option<Box<dyn Any + Send + 'static>>>,
}

impl Shared {
    fn unpark_one(&self) {
        let n = self.unparkers.len();
        if n == 0 {
            return;
        }
        let idx = self.next_unpark.fetch_add(1, Ordering::Relaxed) % n;
        self.unparkers[idx].unpark();
    }

    fn unpark_all(&self) {
        for u in self.unparkers.iter() {
            u.unpark();
        }
    }

    /// Keeps the first payload and poisons the scheduler.
    fn record_panic(&self, payload: Box<dyn Any + Send + 'static>) {
        let mut slot = self.panic.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(payload);
        }
        self.poisoned.store(true, Ordering::Release);
    }

    fn take_panic(&self) -> Option<Box<dyn Any + Send + 'static>> {
        let mut slot = self.panic.lock().unwrap_or_else(PoisonError::into_inner);
        let payload = slot.take();
        self.poisoned.store(false, Ordering::Release);
        payload
    }

    #[inline]
    fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn any_queued(&self) -> bool {
        self.stealers.iter().any(|s| !s.is_empty())
    }
}

// ============================================================================
// Per-worker state
// ============================================================================

/// State owned by exactly one thread.
pub(crate) struct WorkerLocal {
    index: usize,
    deque: Worker,
    /// Allocation cursor into this worker's pool slice.
    next_slot: Cell<usize>,
    rng: RefCell<VictimRng>,
    metrics: UnsafeCell<WorkerMetricsLocal>,
}

impl WorkerLocal {
    fn new(index: usize, deque: Worker, seed: u64) -> Self {
        Self {
            index,
            deque,
            next_slot: Cell::new(0),
            rng: RefCell::new(VictimRng::seeded(seed, index)),
            metrics: UnsafeCell::new(WorkerMetricsLocal::default()),
        }
    }

    #[inline(always)]
    fn record(&self, f: impl FnOnce(&mut WorkerMetricsLocal)) {
        // SAFETY: WorkerLocal is !Sync and `f` never calls back into user
        // code, so no other reference to the counters is live.
        f(unsafe { &mut *self.metrics.get() })
    }

    fn metrics(&self) -> WorkerMetricsLocal {
        // SAFETY: as in `record`.
        unsafe { *self.metrics.get() }
    }
}

/// A thread's view of the scheduler: shared state plus its own local state.
///
/// Both [`Scheduler`] (worker 0) and [`TaskContext`] (any worker) reduce to
/// this, so every operation is written once.
#[derive(Clone, Copy)]
pub(crate) struct WorkerRef<'a> {
    pub(crate) shared: &'a Shared,
    pub(crate) local: &'a WorkerLocal,
}

impl<'a> WorkerRef<'a> {
    pub(crate) fn create<F>(self, parent: Option<TaskId>, f: F) -> TaskId
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        let job = InlineJob::new(f);
        let budget = self.shared.config.max_closure_bytes;
        assert!(
            job.size() <= budget,
            "task closure of {} bytes exceeds max_closure_bytes ({budget})",
            job.size()
        );
        self.shared
            .pool
            .allocate(self.local.index, &self.local.next_slot, parent, job)
    }

    /// Pushes `id` onto this thread's deque.
    ///
    /// # Panics
    /// - `id` was already submitted;
    /// - the deque is full. The task is retired unrun first so that waits
    ///   on its ancestors still terminate.
    pub(crate) fn submit(self, id: TaskId) {
        self.shared.pool.mark_queued(id);
        self.push_queued(id);
    }

    /// Pushes a task this thread has just moved to the queued state.
    fn push_queued(self, id: TaskId) {
        let shared = self.shared;
        let deque = &self.local.deque;
        if deque.len() >= deque.capacity() {
            // SAFETY: `id` was just marked queued by us and is in no deque.
            drop(unsafe { shared.pool.begin(id) });
            shared.pool.finish(id);
            panic!(
                "work-stealing deque overflow: capacity {} exhausted on worker {}",
                deque.capacity(),
                self.local.index
            );
        }

        deque.push(id.to_raw());
        self.local.record(|m| m.tasks_submitted += 1);

        // Pairs with the fence in `park`: either the sleeper sees our push
        // on its re-check or we see its sleeper count.
        fence(Ordering::SeqCst);
        if shared.sleepers.load(Ordering::Relaxed) > 0 {
            shared.unpark_one();
        }
    }

    pub(crate) fn spawn<F>(self, parent: Option<TaskId>, f: F) -> TaskId
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        let id = self.create(parent, f);
        self.submit(id);
        id
    }

    /// Own deque first, then random peers.
    fn pop_task(self) -> Option<TaskId> {
        let local = self.local;
        if let Some(raw) = local.deque.pop() {
            local.record(|m| m.local_pops += 1);
            return Some(TaskId::from_raw(raw));
        }

        let workers = self.shared.stealers.len();
        if workers <= 1 {
            return None;
        }

        let mut rng = local.rng.borrow_mut();
        for _ in 0..self.shared.config.steal_tries {
            let victim = rng.pick_victim(local.index, workers);
            let outcome = self.shared.stealers[victim].steal();
            local.record(|m| m.steal_attempts += 1);
            if let Steal::Success(raw) = outcome {
                local.record(|m| m.steal_successes += 1);
                return Some(TaskId::from_raw(raw));
            }
        }
        None
    }

    /// Runs one task body (unless poisoned) and retires it.
    fn execute(self, id: TaskId) {
        let shared = self.shared;
        // SAFETY: `id` came from a successful pop or steal.
        let job = unsafe { shared.pool.begin(id) };

        if shared.is_poisoned() {
            drop(job);
            self.local.record(|m| m.tasks_skipped += 1);
        } else {
            let ctx = TaskContext {
                shared,
                local: self.local,
                task: id,
            };
            let res = panic::catch_unwind(AssertUnwindSafe(|| job.run(&ctx)));
            self.local.record(|m| m.tasks_executed += 1);
            if let Err(payload) = res {
                warn!(
                    worker = self.local.index,
                    task = ?id,
                    "task panicked; draining remaining tasks without running them"
                );
                shared.record_panic(payload);
            }
        }

        shared.pool.finish(id);
    }

    /// Runs other tasks until `id` completes. Never parks.
    ///
    /// Submits `id` first if it was created but never submitted.
    pub(crate) fn wait(self, id: TaskId) {
        if self.shared.pool.try_mark_queued(id) {
            self.push_queued(id);
        }

        let mut idle_rounds = 0u32;
        while !self.shared.pool.is_complete(id) {
            if let Some(task) = self.pop_task() {
                idle_rounds = 0;
                self.execute(task);
                continue;
            }
            idle_rounds = idle_rounds.wrapping_add(1);
            self.local.record(|m| m.idle_spins += 1);
            if idle_rounds & WAIT_YIELD_MASK == 0 {
                thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }
    }
}

// ============================================================================
// Background workers
// ============================================================================

enum IdleAction {
    Continue,
    Park,
}

/// Spin, then occasionally yield, then park.
struct TieredIdle {
    idle_rounds: u32,
}

impl TieredIdle {
    fn new() -> Self {
        Self { idle_rounds: 0 }
    }

    fn on_work(&mut self) {
        self.idle_rounds = 0;
    }

    fn on_idle(&mut self, cfg: &SchedulerConfig) -> IdleAction {
        self.idle_rounds = self.idle_rounds.saturating_add(1);

        if self.idle_rounds <= cfg.spin_iters {
            hint::spin_loop();
            return IdleAction::Continue;
        }

        if (self.idle_rounds & 0xF) == 0 {
            thread::yield_now();
        }

        IdleAction::Park
    }
}

fn park(worker: WorkerRef<'_>, parker: &Parker) {
    let shared = worker.shared;
    shared.sleepers.fetch_add(1, Ordering::Relaxed);
    fence(Ordering::SeqCst);
    if !shared.any_queued() && !shared.stop.load(Ordering::Acquire) {
        worker.local.record(|m| m.park_count += 1);
        parker.park_timeout(shared.config.park_timeout);
    }
    shared.sleepers.fetch_sub(1, Ordering::Relaxed);
}

fn worker_main(shared: Arc<Shared>, local: WorkerLocal, parker: Parker) -> WorkerMetricsLocal {
    set_current_worker_index(Some(local.index));
    debug!(worker = local.index, "worker started");

    let worker = WorkerRef {
        shared: &shared,
        local: &local,
    };
    let mut idle = TieredIdle::new();

    loop {
        if let Some(id) = worker.pop_task() {
            idle.on_work();
            worker.execute(id);
            continue;
        }

        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        worker.local.record(|m| m.idle_spins += 1);
        match idle.on_idle(&shared.config) {
            IdleAction::Continue => {}
            IdleAction::Park => park(worker, &parker),
        }
    }

    let metrics = local.metrics();
    debug!(
        worker = local.index,
        executed = metrics.tasks_executed,
        steals = metrics.steal_successes,
        "worker exiting"
    );
    set_current_worker_index(None);
    metrics
}

// ============================================================================
// Scheduler
// ============================================================================

/// A fixed pool of worker threads running small tasks.
///
/// The thread that calls [`Scheduler::new`] becomes worker 0 and keeps that
/// role until the scheduler is shut down or dropped. Only that thread may
/// submit from outside a task or wait on one; the type is neither `Send` nor
/// `Sync`. Task bodies get the same abilities through [`TaskContext`].
///
/// ```no_run
/// use frame_scheduler::{Scheduler, SchedulerConfig};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let mut sched = Scheduler::new(SchedulerConfig::with_threads(4)).unwrap();
/// let hits = Arc::new(AtomicUsize::new(0));
/// let h = Arc::clone(&hits);
/// let frame = sched.parallel_for(1000, Some(16), move |_| {
///     h.fetch_add(1, Ordering::Relaxed);
/// });
/// sched.run_and_wait(frame);
/// assert_eq!(hits.load(Ordering::Relaxed), 1000);
/// ```
pub struct Scheduler {
    shared: Arc<Shared>,
    local: WorkerLocal,
    threads: Vec<JoinHandle<WorkerMetricsLocal>>,
    owner: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl Scheduler {
    /// Validates `config`, binds the calling thread as worker 0 and spawns
    /// `thread_count - 1` background workers.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        if let Some(index) = current_worker_index() {
            return Err(SchedulerError::NestedScheduler(index));
        }

        let n = config.thread_count;
        let mut deques: Vec<Worker> = (0..n)
            .map(|_| Worker::with_capacity(config.deque_capacity))
            .collect();
        let stealers = deques.iter().map(Worker::stealer).collect();

        let parkers: Vec<Parker> = (1..n).map(|_| Parker::new()).collect();
        let unparkers = parkers.iter().map(|p| p.unparker().clone()).collect();

        let shared = Arc::new(Shared {
            config,
            pool: TaskPool::new(n, config.tasks_per_thread),
            stealers,
            unparkers,
            next_unpark: AtomicUsize::new(0),
            sleepers: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            panic: Mutex::new(None),
        });

        debug!(
            threads = n,
            deque_capacity = config.deque_capacity,
            tasks_per_thread = config.tasks_per_thread,
            "starting scheduler"
        );

        // Worker 0's deque stays with the owner; the rest move to threads.
        let own_deque = deques.remove(0);

        let mut threads = Vec::with_capacity(n - 1);
        for (offset, (deque, parker)) in deques.into_iter().zip(parkers).enumerate() {
            let index = offset + 1;
            let local = WorkerLocal::new(index, deque, config.seed);
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("frame-worker-{index}"))
                .spawn(move || worker_main(worker_shared, local, parker));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(source) => {
                    shutdown_threads(&shared, &mut threads);
                    return Err(SchedulerError::SpawnWorker { index, source });
                }
            }
        }

        set_current_worker_index(Some(0));

        Ok(Self {
            local: WorkerLocal::new(0, own_deque, config.seed),
            shared,
            threads,
            owner: thread::current().id(),
            _not_send: PhantomData,
        })
    }

    /// Default configuration with `thread_count` workers.
    pub fn with_threads(thread_count: usize) -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::with_threads(thread_count))
    }

    /// Total workers, including the owning thread.
    #[inline]
    pub fn thread_count(&self) -> usize {
        self.shared.config.thread_count
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    #[inline]
    pub(crate) fn worker(&self) -> WorkerRef<'_> {
        self.assert_owner();
        WorkerRef {
            shared: &self.shared,
            local: &self.local,
        }
    }

    #[inline]
    fn assert_owner(&self) {
        assert!(
            thread::current().id() == self.owner,
            "scheduler operations must run on the thread that created the scheduler"
        );
    }

    /// Allocates a task without submitting it.
    ///
    /// With a `parent`, the parent does not complete until this task does.
    /// The task runs once it is passed to [`submit`](Self::submit) or
    /// [`run_and_wait`](Self::run_and_wait).
    ///
    /// # Panics
    /// Panics if the closure exceeds `max_closure_bytes`, the owner's pool
    /// slice is exhausted, or `parent` has already completed.
    pub fn create_task<F>(&mut self, parent: Option<TaskId>, f: F) -> TaskId
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        self.worker().create(parent, f)
    }

    /// Pushes a created task onto the owner's deque.
    ///
    /// # Panics
    /// Panics if `id` was already submitted or the deque is full.
    pub fn submit(&mut self, id: TaskId) {
        self.worker().submit(id);
    }

    /// [`create_task`](Self::create_task) followed by [`submit`](Self::submit).
    pub fn submit_task<F>(&mut self, f: F, parent: Option<TaskId>) -> TaskId
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        self.worker().spawn(parent, f)
    }

    /// Submits `id` if needed, then runs tasks on this thread until `id`
    /// and all of its descendants have completed.
    ///
    /// # Panics
    /// Re-raises the first panic from any task body that ran while waiting
    /// (or since the last wait). The scheduler is usable again afterwards.
    pub fn run_and_wait(&mut self, id: TaskId) {
        self.worker().wait(id);
        if let Some(payload) = self.shared.take_panic() {
            panic::resume_unwind(payload);
        }
    }

    /// True once `id` and every descendant have finished. A handle whose
    /// slot has been recycled also reads as complete.
    #[inline]
    pub fn is_complete(&self, id: TaskId) -> bool {
        self.shared.pool.is_complete(id)
    }

    pub fn task_state(&self, id: TaskId) -> TaskState {
        self.shared.pool.state(id)
    }

    /// Runs the owner's remaining queued tasks, stops the background workers
    /// and returns the merged counters.
    ///
    /// Created-but-never-submitted tasks are dropped without running.
    pub fn shutdown(mut self) -> MetricsSnapshot {
        let snapshot = self.shutdown_inner();
        info!(%snapshot, "scheduler shut down");
        snapshot
    }

    fn shutdown_inner(&mut self) -> MetricsSnapshot {
        let worker = WorkerRef {
            shared: &self.shared,
            local: &self.local,
        };
        while let Some(raw) = self.local.deque.pop() {
            worker.execute(TaskId::from_raw(raw));
        }

        let mut snapshot = MetricsSnapshot::default();
        snapshot.merge_worker(&self.local.metrics());
        for m in shutdown_threads(&self.shared, &mut self.threads) {
            snapshot.merge_worker(&m);
        }
        set_current_worker_index(None);
        snapshot
    }
}

/// Sets the stop flag, wakes everyone and joins. A worker thread that died
/// contributes empty counters.
fn shutdown_threads(
    shared: &Shared,
    threads: &mut Vec<JoinHandle<WorkerMetricsLocal>>,
) -> Vec<WorkerMetricsLocal> {
    shared.stop.store(true, Ordering::Release);
    shared.unpark_all();
    threads
        .drain(..)
        .map(|th| th.join().unwrap_or_default())
        .collect()
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.threads.is_empty() || current_worker_index() == Some(0) {
            self.shutdown_inner();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("thread_count", &self.thread_count())
            .field("queued_on_owner", &self.local.deque.len())
            .field("live_on_owner", &self.shared.pool.live_in_slice(0))
            .finish()
    }
}

// ============================================================================
// TaskContext
// ============================================================================

/// Handed to every task body: the running task and the worker executing it.
///
/// Tasks created through a context are allocated from the executing worker's
/// pool slice and pushed onto its deque.
pub struct TaskContext<'a> {
    pub(crate) shared: &'a Shared,
    pub(crate) local: &'a WorkerLocal,
    pub(crate) task: TaskId,
}

impl<'a> TaskContext<'a> {
    #[inline]
    pub(crate) fn worker(&self) -> WorkerRef<'a> {
        WorkerRef {
            shared: self.shared,
            local: self.local,
        }
    }

    /// Index of the worker running this task (0 is the owning thread).
    #[inline]
    pub fn worker_index(&self) -> usize {
        self.local.index
    }

    /// Handle of the running task.
    #[inline]
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.shared.config.thread_count
    }

    /// Creates and submits a child of the running task.
    pub fn spawn<F>(&self, f: F) -> TaskId
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        self.worker().spawn(Some(self.task), f)
    }

    /// Creates a child of the running task without submitting it.
    pub fn create_child<F>(&self, f: F) -> TaskId
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        self.worker().create(Some(self.task), f)
    }

    /// Creates a task under an arbitrary (live) parent, or a new root.
    pub fn create_task<F>(&self, parent: Option<TaskId>, f: F) -> TaskId
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        self.worker().create(parent, f)
    }

    /// Pushes a created task onto this worker's deque.
    pub fn submit(&self, id: TaskId) {
        self.worker().submit(id);
    }

    /// Runs other tasks until `id` completes, submitting it first if needed.
    ///
    /// # Panics
    /// Panics if another task panicked in the meantime, so the failure
    /// travels up the task tree to the owning thread.
    pub fn wait(&self, id: TaskId) {
        self.worker().wait(id);
        if self.shared.is_poisoned() {
            panic!("scheduler poisoned by a panicking task while waiting on {id:?}");
        }
    }

    #[inline]
    pub fn is_complete(&self, id: TaskId) -> bool {
        self.shared.pool.is_complete(id)
    }
}

impl std::fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("worker", &self.local.index)
            .field("task", &self.task)
            .finish()
    }
}
