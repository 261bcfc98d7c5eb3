//! Work-stealing task scheduler for per-frame parallel work.
//!
//! # Layout
//!
//! - [`core`](self::core): the [`Scheduler`] object, worker threads, scheduling loop and
//!   [`TaskContext`].
//! - [`task`] / [`task_pool`]: task handles, inline closure storage and the
//!   fixed arena of task records with their completion counters.
//! - [`parallel_for`]: recursive range splitting on top of the task API.
//! - [`alloc_stack`]: per-thread stack of context allocators.
//! - [`config`], [`error`], [`metrics`], [`rng`], [`worker_id`]: support.
//!
//! # Invariants
//!
//! - A task body runs at most once; exactly once unless an earlier task
//!   panicked in the same wait.
//! - A task completes only after its body and every descendant finished.
//! - Only `TaskId` integers cross threads; deques and pool slices have one
//!   owner each.

pub mod alloc_stack;
pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod parallel_for;
pub mod rng;
pub mod task;
mod task_pool;
pub mod worker_id;

pub use alloc_stack::{
    allocator_depth, current_allocator, default_allocator, pop_allocator, push_allocator,
    set_default_allocator, with_allocator, AllocStats, AllocatorHandle, AllocatorScope,
    ContextAllocator, CountingAllocator, FrameArena, SystemAllocator,
};
pub use config::SchedulerConfig;
pub use self::core::{Scheduler, TaskContext};
pub use error::{AllocatorError, ConfigError, SchedulerError};
pub use metrics::{MetricsSnapshot, WorkerMetricsLocal};
pub use rng::VictimRng;
pub use task::{TaskId, TaskState, TASK_INLINE_ALIGN, TASK_INLINE_BYTES};
pub use worker_id::current_worker_index;
