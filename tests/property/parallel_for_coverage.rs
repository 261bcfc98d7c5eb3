//! Parallel-for covers every index exactly once for arbitrary shapes.

use std::ops::Range;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use proptest::prelude::*;

use frame_scheduler::{Scheduler, SchedulerConfig};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn each_index_once(count in 0usize..3000, block in 1usize..80, threads in 1usize..6) {
        let mut s = Scheduler::new(SchedulerConfig::with_threads(threads)).unwrap();
        let hits: Arc<Vec<AtomicU8>> = Arc::new((0..count).map(|_| AtomicU8::new(0)).collect());
        let h = Arc::clone(&hits);
        let id = s.parallel_for(count, Some(block), move |i| {
            h[i].fetch_add(1, Ordering::Relaxed);
        });
        s.run_and_wait(id);
        for (i, c) in hits.iter().enumerate() {
            prop_assert_eq!(c.load(Ordering::Relaxed), 1, "index {}", i);
        }
    }

    #[test]
    fn leaf_ranges_partition(count in 1usize..3000, block in 1usize..80) {
        let mut s = Scheduler::new(SchedulerConfig::with_threads(3)).unwrap();
        let ranges: Arc<Mutex<Vec<Range<usize>>>> = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let (r, c) = (Arc::clone(&ranges), Arc::clone(&calls));
        let id = s.parallel_for_chunks(count, Some(block), move |range| {
            c.fetch_add(1, Ordering::Relaxed);
            r.lock().unwrap().push(range);
        });
        s.run_and_wait(id);

        let mut ranges = ranges.lock().unwrap().clone();
        ranges.sort_by_key(|r| r.start);
        prop_assert_eq!(ranges.len(), calls.load(Ordering::Relaxed));
        let mut next = 0;
        for r in &ranges {
            prop_assert_eq!(r.start, next);
            prop_assert!(!r.is_empty() && r.len() <= block);
            // A leaf is half of a range larger than `block`, unless the
            // whole range fit in one block.
            prop_assert!(r.len() == count || r.len() >= (block + 1) / 2);
            next = r.end;
        }
        prop_assert_eq!(next, count);
    }
}
