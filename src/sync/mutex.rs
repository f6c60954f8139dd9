//! Blocking mutual exclusion between threads.
//!
//! Unlike [`UninterruptibleSpinlock`](super::UninterruptibleSpinlock), a [`Mutex`] is owned by a
//! thread and contention puts the acquiring thread to sleep instead of spinning. That makes it
//! suitable for long critical sections, and unusable from interrupt handlers.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::marker::PhantomPinned;
use core::pin::Pin;
use core::ptr;

use itertools::Itertools;

use crate::kfatal;
use crate::log;
use crate::sched::thread::Thread;
use crate::sched::{self, Scheduler};
use crate::sync::UninterruptibleSpinlock;

struct MutexInternal {
    owner: Option<Pin<Arc<Thread>>>,
    waiters: VecDeque<Pin<Arc<Thread>>>,
}

/// A sleeping mutex.
///
/// Mutexes are named for diagnostics and are address-pinned: sleeping threads carry a raw pointer
/// back to the mutex they are blocked on, so a mutex must never be moved or dropped while any
/// thread is waiting on it.
pub struct Mutex {
    name: &'static str,
    internal: UninterruptibleSpinlock<MutexInternal>,
    _pin: PhantomPinned,
}

impl Mutex {
    pub const fn new(name: &'static str) -> Mutex {
        Mutex {
            name,
            internal: UninterruptibleSpinlock::new(MutexInternal {
                owner: None,
                waiters: VecDeque::new(),
            }),
            _pin: PhantomPinned,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquires this mutex, sleeping until it becomes available.
    ///
    /// Fatal when called from an interrupt handler, since blocking there would block whatever
    /// thread happened to be interrupted. Also fatal when the calling thread already owns the
    /// mutex, which could otherwise never make progress.
    pub fn acquire(self: Pin<&Self>) {
        if sched::is_handling_interrupt() {
            kfatal!("sync::mutex", "Attempt to acquire mutex '{}' from interrupt context", self.name);
        }

        let current = Scheduler::instance().current_thread();

        loop {
            if self.try_claim(&current) {
                return;
            }

            self.block_on(&current);
            Scheduler::instance().yield_now();
        }
    }

    /// Takes ownership if the mutex is free. Fatal on recursive acquisition.
    fn try_claim(&self, current: &Pin<Arc<Thread>>) -> bool {
        let mut internal = self.internal.lock();

        match internal.owner {
            None => {
                internal.owner = Some(current.clone());
                true
            },
            Some(ref owner) => {
                if ptr::eq(&**owner as *const Thread, &**current as *const Thread) {
                    drop(internal);
                    kfatal!("sync::mutex", "Recursive acquisition of mutex '{}'", self.name);
                }

                false
            },
        }
    }

    /// Puts `thread` to sleep on this mutex's wait set. If the mutex turned out to be free by the
    /// time the wait set lock was taken, does nothing and the caller retries instead.
    fn block_on(self: Pin<&Self>, thread: &Pin<Arc<Thread>>) {
        let mut internal = self.internal.lock();

        if internal.owner.is_none() {
            return;
        }

        thread.begin_sleep(&*self as *const Mutex);
        internal.waiters.push_back(thread.clone());
    }

    /// Releases this mutex and wakes the first live waiter, if any.
    ///
    /// Fatal when the calling thread is not the current owner. Waiters that were killed while
    /// asleep are discarded here rather than woken; reclaiming their control blocks is the
    /// scheduler's job.
    pub fn release(&self) {
        if sched::is_handling_interrupt() {
            kfatal!("sync::mutex", "Attempt to release mutex '{}' from interrupt context", self.name);
        }

        let current = Scheduler::instance().current_thread();
        let mut internal = self.internal.lock();

        match internal.owner.take() {
            Some(ref owner) if ptr::eq(&**owner as *const Thread, &*current as *const Thread) => {},
            _ => {
                drop(internal);
                kfatal!(
                    "sync::mutex",
                    "Thread {} released mutex '{}' without holding it",
                    current.debug_name(),
                    self.name
                );
            },
        }

        let mut woken = None;

        while let Some(waiter) = internal.waiters.pop_front() {
            if waiter.wake_from(self as *const Mutex) {
                woken = Some(waiter);
                break;
            }
        }

        drop(internal);

        if let Some(woken) = woken {
            Scheduler::instance().make_ready(woken);
        }
    }

    /// Gets the thread currently owning this mutex, if any.
    pub fn holder(&self) -> Option<Pin<Arc<Thread>>> {
        self.internal.lock().owner.clone()
    }

    pub fn is_held(&self) -> bool {
        self.internal.lock().owner.is_some()
    }

    pub fn waiter_count(&self) -> usize {
        self.internal.lock().waiters.len()
    }

    /// Logs this mutex's owner and wait set, for deadlock analysis.
    pub fn print_status(&self) {
        let Some(internal) = self.internal.try_lock() else {
            log!(Info, "sync::mutex", "Mutex '{}': <locked, state unavailable>", self.name);
            return;
        };

        match internal.owner {
            Some(ref owner) => {
                log!(
                    Info,
                    "sync::mutex",
                    "Mutex '{}': held by {}, waiters: [{}]",
                    self.name,
                    owner.debug_name(),
                    internal.waiters.iter().map(|t| t.pid()).join(", ")
                );
            },
            None => {
                log!(Info, "sync::mutex", "Mutex '{}': free", self.name);
            },
        }
    }

    /// Removes a dead thread from this mutex's wait set. Called by the scheduler's reclamation
    /// sweep via the thread's back-reference.
    pub(crate) fn remove_waiter(&self, thread: &Thread) {
        self.internal
            .lock()
            .waiters
            .retain(|waiter| !ptr::eq(&**waiter as *const Thread, thread as *const Thread));
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        let internal = self.internal.get_mut();

        assert!(internal.waiters.is_empty(), "mutex '{}' dropped with sleeping waiters", self.name);
    }
}
