//! The idle thread.
//!
//! The idle thread exists so there is always at least one runnable thread and so dead control
//! blocks get reclaimed even when nothing else is running. It takes the CPU only when every
//! other thread is blocked or dead.

use alloc::sync::Arc;
use core::pin::Pin;

use crate::sched::thread::Thread;
use crate::sched::Scheduler;

pub struct IdleThread;

impl IdleThread {
    /// Creates and registers the idle thread.
    pub fn spawn() -> Pin<Arc<Thread>> {
        let thread = Thread::new(Some("idle"), None, Self::idle_loop);

        Scheduler::instance().add_new_thread(thread.clone());
        thread
    }

    fn idle_loop() {
        loop {
            Scheduler::instance().reap();
            Scheduler::instance().yield_now();
        }
    }
}
