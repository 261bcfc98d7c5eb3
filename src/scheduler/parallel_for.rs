//! Recursive range decomposition on top of the task pool.
//!
//! A range task covering `count` indices either runs the user body on its
//! whole range (`count <= min_block_size`) or splits into two child tasks:
//!
//! ```text
//!   [start, start + count)
//!        ├── left:  [start, start + count/2)
//!        └── right: [start + count/2, start + count)
//! ```
//!
//! Both halves are created as children of the splitting task and submitted
//! before it returns, so the whole tree hangs below the task returned to the
//! caller and waiting on it waits for every leaf. Odd counts give the extra
//! index to the right half.
//!
//! The user body is shared by every task in the tree through one `Arc`, which
//! keeps each range task at 40 bytes of inline state.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use super::core::{Scheduler, TaskContext, WorkerRef};
use super::task::TaskId;

type RangeBody = Arc<dyn Fn(Range<usize>) + Send + Sync + 'static>;

struct RangeTask {
    start: usize,
    count: usize,
    min_block: usize,
    body: RangeBody,
}

impl RangeTask {
    fn run(self, ctx: &TaskContext<'_>) {
        if self.count == 0 {
            return;
        }
        if self.count <= self.min_block {
            (self.body)(self.start..self.start + self.count);
            return;
        }

        let left_count = self.count / 2;
        let right = RangeTask {
            start: self.start + left_count,
            count: self.count - left_count,
            min_block: self.min_block,
            body: Arc::clone(&self.body),
        };
        let left = RangeTask {
            count: left_count,
            ..self
        };

        ctx.spawn(move |ctx| left.run(ctx));
        ctx.spawn(move |ctx| right.run(ctx));
    }
}

impl fmt::Debug for RangeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeTask")
            .field("range", &(self.start..self.start + self.count))
            .field("min_block", &self.min_block)
            .finish()
    }
}

/// Creates and submits the root range task.
fn spawn_range(
    worker: WorkerRef<'_>,
    parent: Option<TaskId>,
    count: usize,
    min_block: usize,
    body: RangeBody,
) -> TaskId {
    let root = RangeTask {
        start: 0,
        count,
        min_block,
        body,
    };
    worker.spawn(parent, move |ctx| root.run(ctx))
}

fn per_index<F>(f: F) -> RangeBody
where
    F: Fn(usize) + Send + Sync + 'static,
{
    Arc::new(move |range: Range<usize>| range.for_each(&f))
}

impl Scheduler {
    /// Calls `f(i)` once for every `i` in `[0, count)`, split into tasks of
    /// at most `min_block_size` indices (the configured default if `None`).
    ///
    /// The returned task is already submitted; pass it to
    /// [`run_and_wait`](Self::run_and_wait).
    pub fn parallel_for<F>(&mut self, count: usize, min_block_size: Option<usize>, f: F) -> TaskId
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let min_block = self.config().block_size(min_block_size);
        spawn_range(self.worker(), None, count, min_block, per_index(f))
    }

    /// Like [`parallel_for`](Self::parallel_for) but calls `f` once per leaf
    /// range. Ranges are non-empty, disjoint and cover `[0, count)`.
    pub fn parallel_for_chunks<F>(
        &mut self,
        count: usize,
        min_block_size: Option<usize>,
        f: F,
    ) -> TaskId
    where
        F: Fn(Range<usize>) + Send + Sync + 'static,
    {
        let min_block = self.config().block_size(min_block_size);
        spawn_range(self.worker(), None, count, min_block, Arc::new(f))
    }
}

impl TaskContext<'_> {
    /// [`Scheduler::parallel_for`] from inside a task. The returned task is a
    /// child of the running task.
    pub fn parallel_for<F>(&self, count: usize, min_block_size: Option<usize>, f: F) -> TaskId
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let min_block = self.shared.config.block_size(min_block_size);
        spawn_range(self.worker(), Some(self.task), count, min_block, per_index(f))
    }

    /// [`Scheduler::parallel_for_chunks`] from inside a task.
    pub fn parallel_for_chunks<F>(
        &self,
        count: usize,
        min_block_size: Option<usize>,
        f: F,
    ) -> TaskId
    where
        F: Fn(Range<usize>) + Send + Sync + 'static,
    {
        let min_block = self.shared.config.block_size(min_block_size);
        spawn_range(self.worker(), Some(self.task), count, min_block, Arc::new(f))
    }
}
