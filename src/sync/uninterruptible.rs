//! Synchronization primitives suitable for data structures accessed from within interrupt handlers.
//!
//! A plain spinlock deadlocks if the code holding it is interrupted and the interrupt handler then
//! tries to take the same lock: the handler spins forever on a lock that can only be released once
//! the handler returns. [`UninterruptibleSpinlock`] avoids this by disabling interrupts on the
//! current core before acquiring the lock and re-enabling them (when they were enabled to begin
//! with) once the last guard on the core is dropped.
//!
//! These locks are held by a CPU core, not by a thread, so the holding code must never block or
//! yield while a guard is alive, and critical sections must stay short since no interrupts are
//! serviced while one is held.

use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::interrupts;

// Single-core baseline, so the disabler state is process-global rather than
// per-core.
static DISABLE_DEPTH: AtomicUsize = AtomicUsize::new(0);
static WAS_ENABLED: AtomicBool = AtomicBool::new(false);

/// A guard that keeps interrupts disabled on the current CPU core while it exists.
pub struct InterruptDisabler(PhantomData<*mut ()>);

impl InterruptDisabler {
    /// Creates a new interrupt-disabling guard. All interrupts remain disabled on the local CPU
    /// core as long as any guard exists.
    pub fn new() -> InterruptDisabler {
        if DISABLE_DEPTH.load(Ordering::Relaxed) == 0 {
            let was_enabled = interrupts::are_enabled();
            interrupts::disable();
            WAS_ENABLED.store(was_enabled, Ordering::Relaxed);
        }

        DISABLE_DEPTH.fetch_add(1, Ordering::Relaxed);
        InterruptDisabler(PhantomData)
    }

    /// Materializes a guard that was accounted for but never constructed.
    ///
    /// When the scheduler switches to a thread that has never run, the guard the scheduler was
    /// holding is leaked on the old thread's stack and the new thread's entry point adopts it
    /// through this function so the depth count stays balanced.
    ///
    /// # Safety
    ///
    /// May only be called when a previously created guard is known to have been leaked and will
    /// never be dropped.
    pub(crate) unsafe fn adopt() -> InterruptDisabler {
        debug_assert!(DISABLE_DEPTH.load(Ordering::Relaxed) != 0);

        InterruptDisabler(PhantomData)
    }

    /// Gets the number of interrupt-disabling guards that currently exist on the local CPU core.
    pub fn num_held() -> usize {
        DISABLE_DEPTH.load(Ordering::Relaxed)
    }
}

impl Drop for InterruptDisabler {
    fn drop(&mut self) {
        debug_assert!(!interrupts::are_enabled());

        if DISABLE_DEPTH.fetch_sub(1, Ordering::Relaxed) == 1 && WAS_ENABLED.load(Ordering::Relaxed) {
            interrupts::enable();
        };
    }
}

/// A spinlock that keeps interrupts disabled on the local CPU core while it is locked.
#[derive(Debug)]
pub struct UninterruptibleSpinlock<T>(spin::Mutex<T>);

impl<T> UninterruptibleSpinlock<T> {
    pub const fn new(val: T) -> UninterruptibleSpinlock<T> {
        UninterruptibleSpinlock(spin::Mutex::new(val))
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }

    /// Checks whether this [`UninterruptibleSpinlock`] is currently locked.
    ///
    /// No synchronization is performed, so the answer may be stale by the time it is returned.
    /// Only useful for debugging and heuristics.
    pub fn is_locked(&self) -> bool {
        self.0.is_locked()
    }

    /// Disables interrupts and locks this [`UninterruptibleSpinlock`], returning a guard that
    /// provides access to the underlying data. Dropping the guard unlocks the spinlock and
    /// re-enables interrupts if applicable.
    pub fn lock(&self) -> UninterruptibleSpinlockGuard<T> {
        let interrupt_disabler = InterruptDisabler::new();
        let guard = self.0.lock();

        UninterruptibleSpinlockGuard(guard, interrupt_disabler)
    }

    /// Disables interrupts and attempts to lock this [`UninterruptibleSpinlock`], returning a
    /// guard if successful. On failure, interrupts are restored to their previous state.
    pub fn try_lock(&self) -> Option<UninterruptibleSpinlockGuard<T>> {
        let interrupt_disabler = InterruptDisabler::new();

        self.0
            .try_lock()
            .map(|guard| UninterruptibleSpinlockGuard(guard, interrupt_disabler))
    }

    /// Disables interrupts and locks this [`UninterruptibleSpinlock`], then calls the provided
    /// function with the underlying data.
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut lock = self.lock();
        f(lock.deref_mut())
    }
}

/// A guard that provides access to an [`UninterruptibleSpinlock`]'s internals. Releases the
/// spinlock (and re-enables interrupts if applicable) when dropped.
pub struct UninterruptibleSpinlockGuard<'a, T>(spin::MutexGuard<'a, T>, InterruptDisabler);

impl<'a, T> Deref for UninterruptibleSpinlockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl<'a, T> DerefMut for UninterruptibleSpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_disabler_depth_is_balanced() {
        // The depth counter is process-global, so keep other kernel tests out.
        let _guard = crate::test_util::lock_kernel();
        let before = InterruptDisabler::num_held();

        {
            let _a = InterruptDisabler::new();
            assert_eq!(before + 1, InterruptDisabler::num_held());

            let _b = InterruptDisabler::new();
            assert_eq!(before + 2, InterruptDisabler::num_held());
        }

        assert_eq!(before, InterruptDisabler::num_held());
    }

    #[test]
    fn test_spinlock_basic() {
        let lock = UninterruptibleSpinlock::new(5);

        assert!(!lock.is_locked());

        {
            let mut guard = lock.lock();
            assert!(lock.is_locked());
            assert!(lock.try_lock().is_none());
            *guard += 1;
        }

        assert!(!lock.is_locked());
        assert_eq!(6, lock.with_lock(|v| *v));
    }
}
