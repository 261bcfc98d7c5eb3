//! Small, self-contained lock-free data structures.

pub mod ws_deque;

pub use ws_deque::{Steal, Stealer, Worker};
