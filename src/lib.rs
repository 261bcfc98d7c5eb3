//! Work-stealing task scheduler for a real-time renderer's frame work.
//!
//! ## Scope
//! A fixed pool of worker threads runs small, short-lived closures. Each
//! worker owns a Chase-Lev deque and a slice of a fixed task arena; idle
//! workers steal from random peers. The thread that creates the
//! [`Scheduler`] is worker 0 and takes part in execution while it waits.
//!
//! ## Key invariants
//! - Task closures are stored inline (at most [`TASK_INLINE_BYTES`]); creating
//!   a task never allocates.
//! - A task completes only when its body and all of its descendants have
//!   finished; `run_and_wait` on a root therefore waits for the whole tree.
//! - Waiting never parks the waiting thread.
//! - Capacity violations (deque overflow, pool exhaustion, oversized
//!   closures) panic. Empty queues and lost steal races are ordinary values.
//!
//! ## Entry points
//! - [`Scheduler`] / [`SchedulerConfig`]: construction, `submit_task`,
//!   `run_and_wait`, `parallel_for`.
//! - [`TaskContext`]: what a running task uses to spawn and wait on children.
//! - [`push_allocator`] / [`pop_allocator`] / [`current_allocator`]: scoped
//!   allocation policy for task bodies.
//! - [`stdx::ws_deque`]: the deque on its own.

pub mod scheduler;
pub mod stdx;

pub use scheduler::{
    allocator_depth, current_allocator, current_worker_index, default_allocator, pop_allocator,
    push_allocator, set_default_allocator, with_allocator, AllocStats, AllocatorError,
    AllocatorHandle, AllocatorScope, ConfigError, ContextAllocator, CountingAllocator, FrameArena,
    MetricsSnapshot, Scheduler, SchedulerConfig, SchedulerError, SystemAllocator, TaskContext,
    TaskId, TaskState, TASK_INLINE_BYTES,
};
