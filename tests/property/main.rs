//! Property-based tests.
//!
//! Run with: `cargo test --test property`

mod parallel_for_coverage;
