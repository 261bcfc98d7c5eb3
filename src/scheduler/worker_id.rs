//! Thread-local worker index.
//!
//! Every thread participating in a [`Scheduler`](super::Scheduler) (the
//! owning thread as worker 0, and each background worker) records its index
//! here for the lifetime of the scheduler. Any other thread sees `None`.
//!
//! Workers clear the slot before exiting, and the owning thread clears it
//! when the scheduler shuts down, so a later scheduler can bind the thread
//! again.

use std::cell::Cell;

const NO_WORKER: usize = usize::MAX;

thread_local! {
    static WORKER_INDEX: Cell<usize> = const { Cell::new(NO_WORKER) };
}

/// Records (or clears, with `None`) the worker index of this thread.
#[inline]
pub(crate) fn set_current_worker_index(index: Option<usize>) {
    WORKER_INDEX.with(|c| c.set(index.unwrap_or(NO_WORKER)));
}

/// Index of the scheduler worker running on this thread, if any.
///
/// Single thread-local read; no atomics.
#[inline]
pub fn current_worker_index() -> Option<usize> {
    WORKER_INDEX.with(|c| {
        let v = c.get();
        (v != NO_WORKER).then_some(v)
    })
}
