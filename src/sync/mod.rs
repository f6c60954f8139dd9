//! Synchronization primitives.

pub mod mutex;
pub mod uninterruptible;

pub use mutex::Mutex;
pub use uninterruptible::{InterruptDisabler, UninterruptibleSpinlock, UninterruptibleSpinlockGuard};
