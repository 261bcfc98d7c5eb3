//! Per-thread stack of context allocators.
//!
//! Task bodies that need scratch memory ask [`current_allocator`] instead of
//! taking an allocator parameter. Whoever sets up the work decides the policy
//! by pushing an allocator for the dynamic extent of a scope:
//!
//! ```text
//!   push_allocator(frame_arena) ───────────────────────────┐
//!       current_allocator() == frame_arena                 │ balanced,
//!       push_allocator(counting) ──────┐                   │ per thread
//!           current_allocator() == counting                │
//!       pop_allocator() ───────────────┘                   │
//!       current_allocator() == frame_arena                 │
//!   pop_allocator() ───────────────────────────────────────┘
//!   current_allocator() == process default
//! ```
//!
//! # Invariants
//! - Each thread has its own stack; nothing here synchronizes across threads.
//! - Pushes and pops must nest within a single task's execution. An
//!   unbalanced push leaks the allocator into every later task on that
//!   thread and is not detected. [`AllocatorScope`] pops on drop, including
//!   during unwinding.
//! - The process default is fixed on first use ([`SystemAllocator`] unless
//!   [`set_default_allocator`] ran earlier).

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_utils::CachePadded;

use super::error::AllocatorError;

/// A memory source a task can allocate scratch space from.
pub trait ContextAllocator: Send + Sync {
    /// Returns `None` when the allocator cannot satisfy `layout`.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    /// Short label for logs and debugging.
    fn name(&self) -> &str;
}

/// Shared, cloneable reference to a [`ContextAllocator`].
///
/// Identity (see [`ptr_eq`](Self::ptr_eq)) is the identity of the underlying
/// allocator object, not of the handle.
#[derive(Clone)]
pub struct AllocatorHandle(Arc<dyn ContextAllocator>);

impl AllocatorHandle {
    pub fn new<A: ContextAllocator + 'static>(allocator: A) -> Self {
        Self(Arc::new(allocator))
    }

    pub fn from_arc(allocator: Arc<dyn ContextAllocator>) -> Self {
        Self(allocator)
    }

    /// True if both handles refer to the same allocator object.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.0).cast::<u8>() == Arc::as_ptr(&other.0).cast::<u8>()
    }

    #[inline]
    pub fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.0.allocate(layout)
    }

    /// # Safety
    /// See [`ContextAllocator::deallocate`].
    #[inline]
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract.
        unsafe { self.0.deallocate(ptr, layout) }
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }
}

impl fmt::Debug for AllocatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AllocatorHandle").field(&self.name()).finish()
    }
}

// ============================================================================
// Process default and per-thread stack
// ============================================================================

static DEFAULT_ALLOCATOR: OnceLock<AllocatorHandle> = OnceLock::new();

thread_local! {
    static STACK: RefCell<Vec<AllocatorHandle>> = const { RefCell::new(Vec::new()) };
}

/// Sets the allocator returned when a thread's stack is empty.
///
/// Must run before the first [`current_allocator`] call anywhere in the
/// process.
pub fn set_default_allocator(allocator: AllocatorHandle) -> Result<(), AllocatorError> {
    DEFAULT_ALLOCATOR
        .set(allocator)
        .map_err(|_| AllocatorError::DefaultAlreadySet)
}

/// The process-wide fallback allocator.
pub fn default_allocator() -> AllocatorHandle {
    DEFAULT_ALLOCATOR
        .get_or_init(|| AllocatorHandle::new(SystemAllocator))
        .clone()
}

/// Makes `allocator` current on this thread until the matching
/// [`pop_allocator`].
pub fn push_allocator(allocator: AllocatorHandle) {
    STACK.with(|s| s.borrow_mut().push(allocator));
}

/// Removes the top of this thread's stack. Returns `None` if it was empty.
pub fn pop_allocator() -> Option<AllocatorHandle> {
    STACK.with(|s| s.borrow_mut().pop())
}

/// Top of this thread's stack, or the process default when it is empty.
pub fn current_allocator() -> AllocatorHandle {
    STACK
        .with(|s| s.borrow().last().cloned())
        .unwrap_or_else(default_allocator)
}

/// Number of allocators pushed on this thread.
pub fn allocator_depth() -> usize {
    STACK.with(|s| s.borrow().len())
}

/// Runs `f` with `allocator` current, restoring the previous one after.
pub fn with_allocator<R>(allocator: AllocatorHandle, f: impl FnOnce() -> R) -> R {
    let _scope = AllocatorScope::enter(allocator);
    f()
}

/// Pushes on creation, pops on drop.
///
/// Not `Send`: the pop must happen on the thread that pushed.
#[must_use = "the allocator is popped as soon as the scope is dropped"]
pub struct AllocatorScope {
    depth: usize,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl AllocatorScope {
    pub fn enter(allocator: AllocatorHandle) -> Self {
        push_allocator(allocator);
        Self {
            depth: allocator_depth(),
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for AllocatorScope {
    fn drop(&mut self) {
        debug_assert_eq!(
            allocator_depth(),
            self.depth,
            "allocator stack unbalanced inside scope"
        );
        pop_allocator();
    }
}

impl fmt::Debug for AllocatorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorScope")
            .field("depth", &self.depth)
            .finish()
    }
}

// ============================================================================
// Allocators
// ============================================================================

/// The global allocator. Zero-size requests get a dangling, aligned pointer.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

impl ContextAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return NonNull::new(layout.align() as *mut u8);
        }
        // SAFETY: non-zero size.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            // SAFETY: caller contract; came from `alloc::alloc(layout)`.
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
        }
    }

    fn name(&self) -> &str {
        "system"
    }
}

/// Bump allocator over one fixed block, reset once per frame.
///
/// Allocation is a single CAS on the offset, so every worker of a frame can
/// share one arena. `deallocate` is a no-op; memory comes back in bulk on
/// [`reset`](Self::reset).
pub struct FrameArena {
    base: NonNull<u8>,
    layout: Layout,
    offset: CachePadded<AtomicUsize>,
    name: String,
}

// SAFETY: the block is only handed out in disjoint pieces claimed by CAS.
unsafe impl Send for FrameArena {}
unsafe impl Sync for FrameArena {}

impl FrameArena {
    const BLOCK_ALIGN: usize = 64;

    /// # Panics
    /// Panics if `capacity` is zero or the block cannot be allocated.
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        assert!(capacity > 0, "frame arena capacity must be non-zero");
        let layout = Layout::from_size_align(capacity, Self::BLOCK_ALIGN)
            .unwrap_or_else(|e| panic!("frame arena layout for {capacity} bytes: {e}"));
        // SAFETY: non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self {
            base,
            layout,
            offset: CachePadded::new(AtomicUsize::new(0)),
            name: name.into(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes handed out since the last reset, including alignment padding.
    #[inline]
    pub fn used(&self) -> usize {
        self.offset.load(Ordering::Relaxed)
    }

    /// Makes the whole block available again.
    ///
    /// Every pointer handed out before the reset must be dead by now; the
    /// caller typically resets between frames, after `run_and_wait`.
    pub fn reset(&self) {
        self.offset.store(0, Ordering::Release);
    }
}

impl ContextAllocator for FrameArena {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let base = self.base.as_ptr() as usize;
        let mut current = self.offset.load(Ordering::Relaxed);
        loop {
            let start = (base + current).checked_next_multiple_of(layout.align())? - base;
            let end = start.checked_add(layout.size())?;
            if end > self.capacity() {
                return None;
            }
            match self.offset.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                // SAFETY: start <= capacity, inside the block.
                Ok(_) => return NonNull::new(unsafe { self.base.as_ptr().add(start) }),
                Err(observed) => current = observed,
            }
        }
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {}

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for FrameArena {
    fn drop(&mut self) {
        // SAFETY: allocated in `with_capacity` with `self.layout`.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for FrameArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameArena")
            .field("name", &self.name)
            .field("used", &self.used())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Allocation counters reported by [`CountingAllocator::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub allocs: u64,
    pub deallocs: u64,
    pub failed: u64,
    pub bytes_allocated: u64,
    pub bytes_deallocated: u64,
}

impl AllocStats {
    #[inline]
    pub fn live_bytes(&self) -> u64 {
        self.bytes_allocated.saturating_sub(self.bytes_deallocated)
    }
}

/// Wraps another allocator and counts traffic through it.
///
/// Counters are cache-padded; under many workers they still bounce, so use
/// this for measurement, not in shipped frames.
#[derive(Debug, Default)]
pub struct CountingAllocator<A> {
    inner: A,
    allocs: CachePadded<AtomicU64>,
    deallocs: CachePadded<AtomicU64>,
    failed: CachePadded<AtomicU64>,
    bytes_allocated: CachePadded<AtomicU64>,
    bytes_deallocated: CachePadded<AtomicU64>,
}

impl<A: ContextAllocator> CountingAllocator<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            allocs: CachePadded::new(AtomicU64::new(0)),
            deallocs: CachePadded::new(AtomicU64::new(0)),
            failed: CachePadded::new(AtomicU64::new(0)),
            bytes_allocated: CachePadded::new(AtomicU64::new(0)),
            bytes_deallocated: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn stats(&self) -> AllocStats {
        AllocStats {
            allocs: self.allocs.load(Ordering::Relaxed),
            deallocs: self.deallocs.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            bytes_deallocated: self.bytes_deallocated.load(Ordering::Relaxed),
        }
    }
}

impl<A: ContextAllocator> ContextAllocator for CountingAllocator<A> {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let res = self.inner.allocate(layout);
        if res.is_some() {
            self.allocs.fetch_add(1, Ordering::Relaxed);
            self.bytes_allocated
                .fetch_add(layout.size() as u64, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        res
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.deallocs.fetch_add(1, Ordering::Relaxed);
        self.bytes_deallocated
            .fetch_add(layout.size() as u64, Ordering::Relaxed);
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.deallocate(ptr, layout) }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
