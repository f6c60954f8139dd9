//! Helpers for tests that touch global kernel state.
//!
//! The scheduler is a process-wide singleton, so tests exercising it have to run one at a time
//! and leave the kernel the way they found it: only the boot thread alive and current.

use std::sync::{Mutex, MutexGuard, Once, OnceLock};

use crate::sched::{self, Scheduler};

static KERNEL_LOCK: Mutex<()> = Mutex::new(());
static INIT: Once = Once::new();
static BOOT_PID: OnceLock<u64> = OnceLock::new();

/// Serializes access to global kernel state. Poisoning is ignored since should_panic tests die
/// while holding the lock by design.
pub fn lock_kernel() -> MutexGuard<'static, ()> {
    KERNEL_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs `f` with exclusive access to an initialized scheduler, restoring the kernel to a
/// boot-thread-only state before and after.
pub fn with_kernel(f: impl FnOnce()) {
    let _guard = lock_kernel();

    INIT.call_once(|| {
        let sched = crate::start("");
        BOOT_PID.set(sched.current_thread().pid()).unwrap();
    });

    reset();
    f();
    reset();
}

fn reset() {
    // A previous test may have died inside a simulated interrupt.
    // SAFETY: No interrupt handler is actually running on this host thread.
    unsafe {
        sched::end_interrupt();
    }

    let sched = Scheduler::instance();
    let boot_pid = *BOOT_PID.get().unwrap();

    for thread in sched.threads() {
        if thread.pid() != boot_pid {
            thread.kill();
        }
    }

    for _ in 0..64 {
        if sched.current_thread().pid() == boot_pid {
            break;
        }

        sched.yield_now();
    }

    assert_eq!(boot_pid, sched.current_thread().pid(), "could not return to the boot thread");

    // Tests start from a fresh time slice; an empty-queue yield resets the slice counter.
    sched.yield_now();
    sched.reap();

    assert_eq!(1, sched.thread_count());
}
