//! Per-worker scheduling counters.
//!
//! Each worker owns a [`WorkerMetricsLocal`] and updates it with plain
//! integer ops (no atomics). Background workers hand theirs back when they
//! exit; [`Scheduler::shutdown`](super::Scheduler::shutdown) merges them into
//! one [`MetricsSnapshot`].

use std::fmt;

/// Counters owned by one worker.
///
/// Cache-line aligned so workers' counters never share a line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(align(64))]
pub struct WorkerMetricsLocal {
    /// Task bodies run by this worker.
    pub tasks_executed: u64,
    /// Tasks pushed onto this worker's deque.
    pub tasks_submitted: u64,
    /// Tasks drained without running because an earlier task panicked.
    pub tasks_skipped: u64,
    /// Tasks taken from this worker's own deque.
    pub local_pops: u64,
    /// Steal attempts against peers.
    pub steal_attempts: u64,
    /// Steal attempts that returned a task.
    pub steal_successes: u64,
    /// Idle rounds spent spinning or yielding.
    pub idle_spins: u64,
    /// Times a background worker parked.
    pub park_count: u64,
}

const _: () = assert!(std::mem::align_of::<WorkerMetricsLocal>() >= 64);

impl WorkerMetricsLocal {
    /// `local_pops / (local_pops + steal_successes)`.
    pub fn local_hit_rate(&self) -> f64 {
        ratio(self.local_pops, self.local_pops + self.steal_successes)
    }

    /// `steal_successes / steal_attempts`.
    pub fn steal_rate(&self) -> f64 {
        ratio(self.steal_successes, self.steal_attempts)
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    match den {
        0 => 0.0,
        d => num as f64 / d as f64,
    }
}

/// Counters summed over every worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub tasks_executed: u64,
    pub tasks_submitted: u64,
    pub tasks_skipped: u64,
    pub local_pops: u64,
    pub steal_attempts: u64,
    pub steal_successes: u64,
    pub idle_spins: u64,
    pub park_count: u64,
    /// Number of workers merged.
    pub worker_count: u32,
}

impl MetricsSnapshot {
    pub fn merge_worker(&mut self, w: &WorkerMetricsLocal) {
        self.tasks_executed = self.tasks_executed.wrapping_add(w.tasks_executed);
        self.tasks_submitted = self.tasks_submitted.wrapping_add(w.tasks_submitted);
        self.tasks_skipped = self.tasks_skipped.wrapping_add(w.tasks_skipped);
        self.local_pops = self.local_pops.wrapping_add(w.local_pops);
        self.steal_attempts = self.steal_attempts.wrapping_add(w.steal_attempts);
        self.steal_successes = self.steal_successes.wrapping_add(w.steal_successes);
        self.idle_spins = self.idle_spins.wrapping_add(w.idle_spins);
        self.park_count = self.park_count.wrapping_add(w.park_count);
        self.worker_count = self.worker_count.wrapping_add(1);
    }

    /// Close to 1.0 when workers mostly ran tasks they spawned themselves.
    pub fn local_hit_rate(&self) -> f64 {
        ratio(self.local_pops, self.local_pops + self.steal_successes)
    }

    pub fn steal_rate(&self) -> f64 {
        ratio(self.steal_successes, self.steal_attempts)
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "workers={} executed={} submitted={} skipped={} local_hit={:.1}% steals={}/{} parks={}",
            self.worker_count,
            self.tasks_executed,
            self.tasks_submitted,
            self.tasks_skipped,
            self.local_hit_rate() * 100.0,
            self.steal_successes,
            self.steal_attempts,
            self.park_count,
        )
    }
}
