//! Recoverable scheduler errors.
//!
//! Only construction-time problems are reported as values. Capacity
//! violations and other contract breaches panic at the call site.

use std::io;

use super::task::TASK_INLINE_BYTES;

/// Rejected [`SchedulerConfig`](super::SchedulerConfig) values.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("thread_count must be at least 1")]
    ZeroThreads,
    #[error("deque_capacity must be a non-zero power of two, got {0}")]
    DequeCapacity(usize),
    #[error("tasks_per_thread must be at least 1")]
    ZeroTaskSlots,
    #[error("max_closure_bytes must be in 1..={max}, got {got}", max = TASK_INLINE_BYTES)]
    ClosureBudget { got: usize },
    #[error("steal_tries must be at least 1")]
    ZeroStealTries,
    #[error("park_timeout must be non-zero")]
    ZeroParkTimeout,
    #[error("environment variable {var}={value:?} is not a valid value")]
    InvalidEnv { var: &'static str, value: String },
}

/// Failures creating a [`Scheduler`](super::Scheduler).
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid scheduler config: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to spawn worker thread {index}")]
    SpawnWorker {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("a scheduler cannot be created on a thread already acting as worker {0}")]
    NestedScheduler(usize),
}

/// Failures configuring the context-allocator stack.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("the process-wide default allocator was already set")]
    DefaultAlreadySet,
}
