//! Fixed-capacity task arena.
//!
//! # Layout
//!
//! ```text
//!   slots: [ worker 0 slice | worker 1 slice | ... | worker N-1 slice ]
//!            └ tasks_per_thread ┘
//! ```
//!
//! Each worker allocates only from its own slice, walking a private cursor
//! oldest-first and claiming the first slot whose previous occupant has
//! completed. Allocation therefore needs no atomic read-modify-write; other
//! threads only ever touch a slot through its counters.
//!
//! # Slot lifecycle
//!
//! - `unfinished == 0`: free (never used, or the previous task completed).
//! - allocation: parent link, job and state are written, `unfinished = 1`,
//!   then `generation` is bumped. The handle is published to other threads
//!   through a deque push (release) or a closure capture.
//! - each child created under the task adds 1 to `unfinished`.
//! - the executing thread subtracts 1 after the body returns; every child
//!   subtracts 1 from its parent when it completes. Reaching 0 completes the
//!   task and cascades to its parent.
//!
//! # Invariants
//!
//! - The parent link is read *before* the decrement. Once `unfinished` hits
//!   0 the owning worker may recycle the slot immediately.
//! - The job is taken out of the slot before the decrement, so a recycled
//!   slot never still holds a previous job.
//! - A handle whose generation no longer matches its slot refers to a task
//!   that completed.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crossbeam_utils::CachePadded;

use super::task::{InlineJob, TaskId, TaskState};

const NO_PARENT: u64 = u64::MAX;

const STATE_CREATED: u8 = 0;
const STATE_QUEUED: u8 = 1;
const STATE_RUNNING: u8 = 2;

struct TaskSlot {
    generation: AtomicU32,
    unfinished: AtomicU32,
    parent: AtomicU64,
    state: AtomicU8,
    job: UnsafeCell<Option<InlineJob>>,
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            unfinished: AtomicU32::new(0),
            parent: AtomicU64::new(NO_PARENT),
            state: AtomicU8::new(STATE_CREATED),
            job: UnsafeCell::new(None),
        }
    }
}

pub(crate) struct TaskPool {
    slots: Box<[CachePadded<TaskSlot>]>,
    per_worker: usize,
}

// SAFETY: `job` is written only by the allocating worker while the slot is
// free (unfinished == 0) and taken only by the single thread that popped or
// stole the handle. Everything else is atomic.
unsafe impl Sync for TaskPool {}
unsafe impl Send for TaskPool {}

impl TaskPool {
    /// # Panics
    /// Panics if the total slot count does not fit a 32-bit slot index.
    pub(crate) fn new(workers: usize, per_worker: usize) -> Self {
        let total = workers
            .checked_mul(per_worker)
            .filter(|&n| n <= u32::MAX as usize)
            .unwrap_or_else(|| panic!("task pool of {workers} x {per_worker} slots is too large"));
        let slots = (0..total).map(|_| CachePadded::new(TaskSlot::new())).collect();
        Self { slots, per_worker }
    }

    #[inline(always)]
    fn slot(&self, id: TaskId) -> &TaskSlot {
        &self.slots[id.slot()]
    }

    /// Claims a free slot from `worker`'s slice and installs `job`.
    ///
    /// `cursor` is the worker's private allocation cursor.
    ///
    /// # Panics
    /// - no slot in the slice is free (too many tasks in flight);
    /// - `parent` is stale or already completed.
    pub(crate) fn allocate(
        &self,
        worker: usize,
        cursor: &Cell<usize>,
        parent: Option<TaskId>,
        job: InlineJob,
    ) -> TaskId {
        let base = worker * self.per_worker;

        for _ in 0..self.per_worker {
            let offset = cursor.get();
            cursor.set(if offset + 1 == self.per_worker { 0 } else { offset + 1 });

            let index = base + offset;
            let slot = &self.slots[index];
            // Acquire pairs with the final AcqRel decrement of the previous
            // occupant: its job was taken and its parent read before that.
            if slot.unfinished.load(Ordering::Acquire) != 0 {
                continue;
            }

            if let Some(parent) = parent {
                self.link_child(parent);
            }

            slot.parent
                .store(parent.map_or(NO_PARENT, TaskId::to_raw), Ordering::Relaxed);
            slot.state.store(STATE_CREATED, Ordering::Relaxed);
            // SAFETY: the slot is free and only this worker allocates from it.
            unsafe { *slot.job.get() = Some(job) };
            slot.unfinished.store(1, Ordering::Relaxed);
            let generation = slot.generation.load(Ordering::Relaxed).wrapping_add(1);
            slot.generation.store(generation, Ordering::Release);

            return TaskId::new(index as u32, generation);
        }

        panic!(
            "task pool slice for worker {worker} exhausted: {} tasks in flight; raise tasks_per_thread",
            self.per_worker
        );
    }

    fn link_child(&self, parent: TaskId) {
        let slot = self.slot(parent);
        assert!(
            slot.generation.load(Ordering::Acquire) == parent.generation(),
            "parent {parent:?} is stale: it already completed and its slot was recycled"
        );
        // Only a live count may grow; a parent that reached zero stays done.
        let mut count = slot.unfinished.load(Ordering::Acquire);
        loop {
            assert!(count > 0, "parent {parent:?} already completed");
            match slot.unfinished.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(seen) => count = seen,
            }
        }
    }

    /// Marks `id` as queued.
    ///
    /// # Panics
    /// Panics if `id` was already submitted.
    pub(crate) fn mark_queued(&self, id: TaskId) {
        let slot = self.slot(id);
        debug_assert_eq!(slot.generation.load(Ordering::Relaxed), id.generation());
        let res = slot.state.compare_exchange(
            STATE_CREATED,
            STATE_QUEUED,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        assert!(res.is_ok(), "task {id:?} submitted twice");
    }

    /// Claims the right to push `id` if nobody has submitted it yet.
    ///
    /// Returns false for a task that is already queued, running or complete,
    /// including a stale handle. Concurrent callers on the same created task
    /// see exactly one `true`.
    pub(crate) fn try_mark_queued(&self, id: TaskId) -> bool {
        let slot = self.slot(id);
        // A created task cannot complete before someone queues it, so the
        // slot cannot be recycled between these checks and the CAS.
        slot.generation.load(Ordering::Acquire) == id.generation()
            && slot.unfinished.load(Ordering::Acquire) != 0
            && slot
                .state
                .compare_exchange(
                    STATE_CREATED,
                    STATE_QUEUED,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    /// Takes the job out of a popped or stolen task and marks it running.
    ///
    /// # Safety
    /// The caller must hold the only copy of `id` obtained from a deque
    /// (a successful `pop` or `steal`).
    pub(crate) unsafe fn begin(&self, id: TaskId) -> InlineJob {
        let slot = self.slot(id);
        slot.state.store(STATE_RUNNING, Ordering::Relaxed);
        // SAFETY: exclusive per the caller contract; the deque CAS/release
        // made the allocating thread's write visible.
        let job = unsafe { (*slot.job.get()).take() };
        job.unwrap_or_else(|| panic!("task {id:?} executed twice"))
    }

    /// Retires one unit of work on `id` and cascades completion upwards.
    pub(crate) fn finish(&self, id: TaskId) {
        let mut current = id;
        loop {
            let slot = self.slot(current);
            let parent = slot.parent.load(Ordering::Relaxed);
            let prev = slot.unfinished.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "unfinished counter underflow on {current:?}");
            if prev != 1 || parent == NO_PARENT {
                return;
            }
            current = TaskId::from_raw(parent);
        }
    }

    #[inline]
    pub(crate) fn is_complete(&self, id: TaskId) -> bool {
        let slot = self.slot(id);
        slot.generation.load(Ordering::Acquire) != id.generation()
            || slot.unfinished.load(Ordering::Acquire) == 0
    }

    pub(crate) fn state(&self, id: TaskId) -> TaskState {
        if self.is_complete(id) {
            return TaskState::Completed;
        }
        match self.slot(id).state.load(Ordering::Acquire) {
            STATE_CREATED => TaskState::Created,
            STATE_QUEUED => TaskState::Queued,
            _ => TaskState::Running,
        }
    }

    /// Tasks currently live in `worker`'s slice. Diagnostic only.
    pub(crate) fn live_in_slice(&self, worker: usize) -> usize {
        let base = worker * self.per_worker;
        self.slots[base..base + self.per_worker]
            .iter()
            .filter(|s| s.unfinished.load(Ordering::Relaxed) != 0)
            .count()
    }
}
