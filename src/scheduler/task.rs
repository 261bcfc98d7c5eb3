//! Task handles and inline closure storage.
//!
//! A task's closure lives inside its pool record, in a fixed 64-byte buffer
//! next to a function table that knows how to run or drop it. Nothing is
//! boxed: creating a task never touches the global allocator.
//!
//! The size ceiling is checked at compile time. A closure that captures more
//! than [`TASK_INLINE_BYTES`] fails to build; capture an `Arc` (or a pointer
//! to data the caller keeps alive) instead.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop, MaybeUninit};
use std::ptr;

use super::core::TaskContext;

/// Bytes of closure state a task can hold inline.
pub const TASK_INLINE_BYTES: usize = 64;
/// Maximum alignment of a task closure.
pub const TASK_INLINE_ALIGN: usize = 16;

/// Handle to a task in the pool.
///
/// Packs the slot index (low 32 bits) with the slot's generation (high 32
/// bits). Once the slot is recycled the generation moves on, so a stale
/// handle reads as completed instead of aliasing the new occupant.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    #[inline]
    pub(crate) const fn new(slot: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | slot as u64)
    }

    #[inline]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) const fn to_raw(self) -> u64 {
        self.0
    }

    /// Index of the pool slot backing this task.
    #[inline]
    pub const fn slot(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({}#{})", self.slot(), self.generation())
    }
}

/// Observable lifecycle of a task.
///
/// ```text
///   Created ──submit──► Queued ──pop/steal──► Running ──body done + children done──► Completed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Allocated, not yet pushed onto a deque.
    Created,
    /// Waiting in a deque.
    Queued,
    /// Body executing, or finished while children are still outstanding.
    Running,
    /// Body and every descendant finished (or the slot has been recycled).
    Completed,
}

#[repr(C, align(16))]
struct InlineStorage(MaybeUninit<[u8; TASK_INLINE_BYTES]>);

const _: () = assert!(mem::align_of::<InlineStorage>() == TASK_INLINE_ALIGN);

struct JobVTable {
    /// Moves the closure out of the buffer and calls it.
    run: unsafe fn(*mut u8, &TaskContext<'_>),
    drop: unsafe fn(*mut u8),
    size: usize,
}

struct VTableOf<F>(PhantomData<F>);

impl<F> VTableOf<F>
where
    F: FnOnce(&TaskContext<'_>) + Send + 'static,
{
    const FITS: () = {
        assert!(
            mem::size_of::<F>() <= TASK_INLINE_BYTES,
            "task closure exceeds TASK_INLINE_BYTES; capture an Arc instead"
        );
        assert!(
            mem::align_of::<F>() <= TASK_INLINE_ALIGN,
            "task closure alignment exceeds TASK_INLINE_ALIGN"
        );
    };

    const VTABLE: JobVTable = JobVTable {
        run: run_job::<F>,
        drop: drop_job::<F>,
        size: mem::size_of::<F>(),
    };
}

unsafe fn run_job<F: FnOnce(&TaskContext<'_>)>(storage: *mut u8, ctx: &TaskContext<'_>) {
    // SAFETY: caller guarantees `storage` holds an initialized `F` that is
    // never read or dropped again.
    let f = unsafe { ptr::read(storage.cast::<F>()) };
    f(ctx);
}

unsafe fn drop_job<F>(storage: *mut u8) {
    // SAFETY: caller guarantees `storage` holds an initialized `F`.
    unsafe { ptr::drop_in_place(storage.cast::<F>()) }
}

/// A type-erased `FnOnce(&TaskContext)` stored inline.
pub(crate) struct InlineJob {
    storage: InlineStorage,
    vtable: &'static JobVTable,
}

// SAFETY: only built from `F: Send` closures.
unsafe impl Send for InlineJob {}

impl InlineJob {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        #[allow(clippy::let_unit_value)]
        let () = VTableOf::<F>::FITS;

        let mut storage = InlineStorage(MaybeUninit::uninit());
        // SAFETY: FITS proves size and alignment fit the buffer.
        unsafe { ptr::write(storage.0.as_mut_ptr().cast::<F>(), f) };
        Self {
            storage,
            vtable: &VTableOf::<F>::VTABLE,
        }
    }

    /// Size of the captured closure in bytes.
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.vtable.size
    }

    /// Consumes the job and runs the closure.
    ///
    /// If the closure panics its captures are dropped during unwinding and
    /// the storage is not touched again.
    #[inline]
    pub(crate) fn run(self, ctx: &TaskContext<'_>) {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: the closure is initialized and `this` is never dropped, so
        // it is read exactly once.
        unsafe { (this.vtable.run)(this.storage.0.as_mut_ptr().cast(), ctx) }
    }
}

impl Drop for InlineJob {
    fn drop(&mut self) {
        // SAFETY: a job that reaches Drop was never run.
        unsafe { (self.vtable.drop)(self.storage.0.as_mut_ptr().cast()) }
    }
}

impl fmt::Debug for InlineJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineJob").field("size", &self.size()).finish()
    }
}
