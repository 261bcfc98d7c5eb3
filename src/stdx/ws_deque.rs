//! Bounded Chase-Lev work-stealing deque.
//!
//! # Scope
//!
//! One owner pushes and pops at the bottom; any number of thieves steal from
//! the top. Entries are opaque `u64` handles (the scheduler stores packed
//! task ids), so every slot is a plain atomic and a thief that reads a slot
//! the owner is concurrently overwriting never observes torn data.
//!
//! ```text
//!            steal() ──►  top                       bottom  ◄── push()/pop()
//!                          │                           │
//!            ┌─────┬─────┬─▼───┬─────┬─────┬─────┬─────▼┬─────┐
//!            │     │     │ t0  │ t1  │ t2  │ t3  │      │     │
//!            └─────┴─────┴─────┴─────┴─────┴─────┴──────┴─────┘
//!                          live entries = [top, bottom)
//! ```
//!
//! # Invariants
//!
//! - `top <= bottom` whenever no `pop()` is in flight.
//! - `bottom` is written only by the owner. `top` only moves forward, via CAS
//!   (thieves, and the owner when it races for the last element).
//! - Capacity is fixed at construction. Pushing into a full deque is a usage
//!   error and panics.
//!
//! # Memory ordering
//!
//! The orderings follow Lê et al., "Correct and Efficient Work-Stealing for
//! Weak Memory Models" (PPoPP 2013):
//!
//! | Site | Ordering | Pairs with |
//! |------|----------|------------|
//! | `push`: slot write | Relaxed | published by the `bottom` store |
//! | `push`: `bottom` store | Release | `steal`: `bottom` load (Acquire) |
//! | `pop`: `bottom` store, then fence | SeqCst fence | `steal`: fence between `top` and `bottom` loads |
//! | `pop`/`steal`: `top` CAS | SeqCst | each other |
//!
//! Weakening the `bottom` release/acquire pair lets a thief observe the new
//! index before the slot write and take a stale handle.
//!
//! # Failure modes
//!
//! `pop()` returning `None` and `steal()` returning `Empty`/`Retry` are normal
//! outcomes (empty deque or lost race), never errors.

#[cfg(not(loom))]
use std::sync::atomic::{fence, AtomicIsize, AtomicU64, Ordering};
#[cfg(not(loom))]
use std::sync::Arc;

#[cfg(loom)]
use loom::sync::atomic::{fence, AtomicIsize, AtomicU64, Ordering};
#[cfg(loom)]
use loom::sync::Arc;

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use crossbeam_utils::CachePadded;

/// Outcome of a steal attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Steal<T> {
    /// The deque was empty.
    Empty,
    /// Lost a race against the owner or another thief. Worth retrying
    /// elsewhere.
    Retry,
    /// Took one entry from the top.
    Success(T),
}

impl<T> Steal<T> {
    /// Returns the stolen value, if any.
    #[inline]
    pub fn success(self) -> Option<T> {
        match self {
            Steal::Success(v) => Some(v),
            Steal::Empty | Steal::Retry => None,
        }
    }
}

struct Inner {
    top: CachePadded<AtomicIsize>,
    bottom: CachePadded<AtomicIsize>,
    slots: Box<[AtomicU64]>,
    mask: usize,
}

impl Inner {
    #[inline(always)]
    fn slot(&self, index: isize) -> &AtomicU64 {
        debug_assert!(index >= 0);
        &self.slots[(index as usize) & self.mask]
    }

    #[inline(always)]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Acquire);
        let t = self.top.load(Ordering::Acquire);
        b.saturating_sub(t).max(0) as usize
    }
}

/// Owner half of the deque.
///
/// `Send` so it can be moved onto its worker thread, but not `Sync`: push and
/// pop must only ever run on one thread at a time.
pub struct Worker {
    inner: Arc<Inner>,
    _not_sync: PhantomData<Cell<()>>,
}

impl Worker {
    /// Creates an empty deque holding up to `capacity` entries.
    ///
    /// # Panics
    /// Panics unless `capacity` is a non-zero power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "deque capacity must be a non-zero power of two, got {capacity}"
        );
        let slots: Box<[AtomicU64]> = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Self {
            inner: Arc::new(Inner {
                top: CachePadded::new(AtomicIsize::new(0)),
                bottom: CachePadded::new(AtomicIsize::new(0)),
                slots,
                mask: capacity - 1,
            }),
            _not_sync: PhantomData,
        }
    }

    /// Creates a thief handle for this deque.
    pub fn stealer(&self) -> Stealer {
        Stealer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Pushes `value` at the bottom.
    ///
    /// # Panics
    /// Panics if the deque already holds `capacity()` entries.
    #[inline]
    pub fn push(&self, value: u64) {
        let inner = &*self.inner;
        let b = inner.bottom.load(Ordering::Relaxed);
        let t = inner.top.load(Ordering::Acquire);
        assert!(
            ((b - t) as usize) < inner.capacity(),
            "work-stealing deque overflow: capacity {} exhausted",
            inner.capacity()
        );

        inner.slot(b).store(value, Ordering::Relaxed);
        // Publish: a thief that acquires the new bottom also sees the slot.
        inner.bottom.store(b + 1, Ordering::Release);
    }

    /// Pops the most recently pushed entry.
    #[inline]
    pub fn pop(&self) -> Option<u64> {
        let inner = &*self.inner;
        let b = inner.bottom.load(Ordering::Relaxed) - 1;
        inner.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = inner.top.load(Ordering::Relaxed);

        if b < t {
            // Already empty; undo the reservation.
            inner.bottom.store(t, Ordering::Relaxed);
            return None;
        }

        let value = inner.slot(b).load(Ordering::Relaxed);
        if b > t {
            return Some(value);
        }

        // Exactly one entry left. Take it the way a thief would, by advancing
        // `top`, so a concurrent steal and this pop cannot both win.
        let won = inner
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        inner.bottom.store(t + 1, Ordering::Relaxed);
        won.then_some(value)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Number of entries. Exact on the owner thread while no thief is active.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Thief half of the deque. Cheap to clone and safe to share.
#[derive(Clone)]
pub struct Stealer {
    inner: Arc<Inner>,
}

impl Stealer {
    /// Attempts to take the oldest entry.
    #[inline]
    pub fn steal(&self) -> Steal<u64> {
        let inner = &*self.inner;
        let t = inner.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = inner.bottom.load(Ordering::Acquire);

        if t >= b {
            return Steal::Empty;
        }

        // May be stale if we lose the CAS below; the value is discarded then.
        let value = inner.slot(t).load(Ordering::Relaxed);
        match inner
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => Steal::Success(value),
            Err(_) => Steal::Retry,
        }
    }

    /// Approximate number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Stealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stealer").field("len", &self.len()).finish()
    }
}
