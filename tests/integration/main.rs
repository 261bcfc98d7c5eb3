//! Integration tests for the frame scheduler.
//!
//! Run with: `cargo test --test integration`

mod deque;
mod failure;
mod parallel_for;
mod stress;
mod task_tree;
