//! Process-default allocator installation.
//!
//! The default can only be installed before its first use in a process, so
//! this binary holds a single test.
//!
//! Run with: `cargo test --test default_allocator`

use std::alloc::Layout;
use std::sync::Arc;

use frame_scheduler::{
    current_allocator, default_allocator, set_default_allocator, AllocatorError,
    AllocatorHandle, ContextAllocator, CountingAllocator, Scheduler, SystemAllocator,
};

#[test]
fn installed_default_serves_every_worker() {
    let counting = Arc::new(CountingAllocator::new(SystemAllocator));
    let handle = AllocatorHandle::from_arc(counting.clone() as Arc<dyn ContextAllocator>);
    set_default_allocator(handle.clone()).unwrap();

    assert!(default_allocator().ptr_eq(&handle));
    assert!(current_allocator().ptr_eq(&handle));
    assert_eq!(
        set_default_allocator(AllocatorHandle::new(SystemAllocator)),
        Err(AllocatorError::DefaultAlreadySet)
    );

    let mut sched = Scheduler::with_threads(4).unwrap();
    let expected = handle.clone();
    let root = sched.parallel_for(256, Some(8), move |_| {
        let alloc = current_allocator();
        assert!(alloc.ptr_eq(&expected));
        let layout = Layout::from_size_align(16, 8).unwrap();
        let p = alloc.allocate(layout).unwrap();
        // SAFETY: allocated just above with the same layout.
        unsafe { alloc.deallocate(p, layout) };
    });
    sched.run_and_wait(root);
    drop(sched);

    let stats = counting.stats();
    assert_eq!(stats.allocs, 256);
    assert_eq!(stats.deallocs, 256);
    assert_eq!(stats.live_bytes(), 0);
}
