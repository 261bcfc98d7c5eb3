//! Scheduler configuration.

use std::env;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use super::error::ConfigError;
use super::task::TASK_INLINE_BYTES;

/// Scheduler configuration, fixed at construction.
///
/// Defaults are sized for a frame's worth of small tasks. Profile before
/// tuning.
///
/// | Knob | Workload sensitivity |
/// |------|----------------------|
/// | `thread_count` | core count, how CPU-bound the frame is |
/// | `deque_capacity` / `tasks_per_thread` | peak tasks in flight per thread |
/// | `default_min_block_size` | per-index cost in `parallel_for` |
/// | `steal_tries` | fan-out pattern, worker count |
/// | `spin_iters` / `park_timeout` | gap between frames |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Total workers, counting the thread that creates the scheduler.
    pub thread_count: usize,
    /// Leaf size for `parallel_for` when the caller passes `None`.
    pub default_min_block_size: usize,
    /// Per-thread deque capacity. Must be a power of two.
    pub deque_capacity: usize,
    /// Task records reserved for each worker's pool slice.
    pub tasks_per_thread: usize,
    /// Largest closure (in bytes) a task may capture. At most
    /// [`TASK_INLINE_BYTES`].
    pub max_closure_bytes: usize,
    /// Victims tried per scheduling round before going idle.
    pub steal_tries: u32,
    /// Idle rounds spent spinning before a background worker parks.
    pub spin_iters: u32,
    /// Upper bound on a single park; bounds the cost of a missed wakeup.
    pub park_timeout: Duration,
    /// Seed for victim selection.
    pub seed: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_count: thread::available_parallelism().map_or(1, |n| n.get()),
            default_min_block_size: 64,
            deque_capacity: 4096,
            tasks_per_thread: 4096,
            max_closure_bytes: TASK_INLINE_BYTES,
            steal_tries: 4,
            spin_iters: 64,
            park_timeout: Duration::from_micros(100),
            seed: 0x853c49e6748fea9b,
        }
    }
}

impl SchedulerConfig {
    /// Default configuration with an explicit worker count.
    pub fn with_threads(thread_count: usize) -> Self {
        Self {
            thread_count,
            ..Self::default()
        }
    }

    /// Defaults overridden by `FRAME_SCHED_*` environment variables.
    ///
    /// Recognized: `FRAME_SCHED_THREADS`, `FRAME_SCHED_MIN_BLOCK`,
    /// `FRAME_SCHED_DEQUE_CAPACITY`, `FRAME_SCHED_TASKS_PER_THREAD`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = env_var("FRAME_SCHED_THREADS")? {
            cfg.thread_count = v;
        }
        if let Some(v) = env_var("FRAME_SCHED_MIN_BLOCK")? {
            cfg.default_min_block_size = v;
        }
        if let Some(v) = env_var("FRAME_SCHED_DEQUE_CAPACITY")? {
            cfg.deque_capacity = v;
        }
        if let Some(v) = env_var("FRAME_SCHED_TASKS_PER_THREAD")? {
            cfg.tasks_per_thread = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if !self.deque_capacity.is_power_of_two() {
            return Err(ConfigError::DequeCapacity(self.deque_capacity));
        }
        if self.tasks_per_thread == 0 {
            return Err(ConfigError::ZeroTaskSlots);
        }
        if self.max_closure_bytes == 0 || self.max_closure_bytes > TASK_INLINE_BYTES {
            return Err(ConfigError::ClosureBudget {
                got: self.max_closure_bytes,
            });
        }
        if self.steal_tries == 0 {
            return Err(ConfigError::ZeroStealTries);
        }
        if self.park_timeout.is_zero() {
            return Err(ConfigError::ZeroParkTimeout);
        }
        Ok(())
    }

    /// `min_block_size` as used by the decomposer: caller value, else the
    /// configured default, never below 1.
    #[inline]
    pub(crate) fn block_size(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_min_block_size).max(1)
    }
}

fn env_var<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}
