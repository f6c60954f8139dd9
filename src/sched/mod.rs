//! Thread scheduling.
//!
//! The kernel uses a single round-robin [`Scheduler`] created once during boot. The scheduler's
//! registry owns every thread control block; the FIFO ready queue and `current` hold additional
//! references into it. Threads leave the system in two phases: [`Thread::kill`] marks them
//! `ToBeDestroyed` without touching any scheduler structures, and [`Scheduler::reap`] later
//! removes and frees the corpses from thread context where deallocation is safe.

pub mod idle;
pub mod thread;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::pin::Pin;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::kfatal;
use crate::log;
use crate::sync::{InterruptDisabler, UninterruptibleSpinlock};
use crate::util::OneShotManualInit;

use self::thread::{Thread, ThreadState};

pub const DEFAULT_TIME_SLICE_TICKS: u32 = 4;

static SCHEDULER: OneShotManualInit<Scheduler> = OneShotManualInit::uninit();
static IN_INTERRUPT: AtomicBool = AtomicBool::new(false);

/// Records entry into an interrupt handler.
///
/// # Safety
///
/// Must only be called by interrupt entry stubs and must be balanced by a call to
/// [`end_interrupt`] before the interrupted code resumes.
pub unsafe fn begin_interrupt() {
    IN_INTERRUPT.store(true, Ordering::Relaxed);
}

/// Records exit from an interrupt handler.
///
/// # Safety
///
/// Must only be called by interrupt exit stubs, paired with [`begin_interrupt`].
pub unsafe fn end_interrupt() {
    IN_INTERRUPT.store(false, Ordering::Relaxed);
}

/// Whether the CPU is currently executing an interrupt handler. Blocking, reaping and current
/// thread lookups are forbidden while this is true.
pub fn is_handling_interrupt() -> bool {
    IN_INTERRUPT.load(Ordering::Relaxed)
}

// The in-interrupt flag describes the CPU state captured in a suspended context, not the thread
// being resumed. A preemptive dispatch clears it before switching away and restores it when the
// preempted context eventually resumes, so the interrupted handler's epilogue still sees itself
// in interrupt context while the dispatched thread does not.
fn take_interrupt_state() -> bool {
    IN_INTERRUPT.swap(false, Ordering::Relaxed)
}

fn restore_interrupt_state(was_in_interrupt: bool) {
    IN_INTERRUPT.store(was_in_interrupt, Ordering::Relaxed);
}

struct SchedulerInternal {
    threads: Vec<Pin<Arc<Thread>>>,
    ready: VecDeque<Pin<Arc<Thread>>>,
    current: Option<Pin<Arc<Thread>>>,
    slice_ticks: u32,
}

/// The round-robin thread scheduler.
pub struct Scheduler {
    internal: UninterruptibleSpinlock<SchedulerInternal>,
    time_slice: u32,
}

impl Scheduler {
    /// Creates the scheduler singleton, adopting the currently executing code as the boot
    /// thread. Fatal if called more than once.
    ///
    /// The time slice is taken from the `sched.time_slice` kernel option when present.
    pub fn create() -> &'static Scheduler {
        if SCHEDULER.is_init() {
            kfatal!("sched", "Scheduler created twice");
        }

        let time_slice = crate::options::get()
            .and_then(|options| options.get::<u32>("sched.time_slice"))
            .filter(|&ticks| ticks != 0)
            .unwrap_or(DEFAULT_TIME_SLICE_TICKS);

        let boot = Thread::new_boot();
        let boot_pid = boot.pid();

        let sched = SCHEDULER.set(Scheduler {
            internal: UninterruptibleSpinlock::new(SchedulerInternal {
                threads: vec![boot.clone()],
                ready: VecDeque::with_capacity(8),
                current: Some(boot),
                slice_ticks: 0,
            }),
            time_slice,
        });

        arch::set_timer_handler(timer_tick);
        log!(
            Info,
            "sched",
            "Scheduler created, boot thread has pid {}, time slice is {} tick(s)",
            boot_pid,
            time_slice
        );

        sched
    }

    /// Gets the scheduler singleton. Fatal before [`Scheduler::create`] has run.
    pub fn instance() -> &'static Scheduler {
        match SCHEDULER.try_get() {
            Some(sched) => sched,
            None => kfatal!("sched", "Scheduler used before being created"),
        }
    }

    pub fn try_instance() -> Option<&'static Scheduler> {
        SCHEDULER.try_get()
    }

    /// Registers a new thread and queues it for dispatch at the tail of the ready queue.
    /// Ownership of the control block passes to the scheduler's registry.
    pub fn add_new_thread(&self, thread: Pin<Arc<Thread>>) {
        if is_handling_interrupt() {
            kfatal!("sched", "Cannot register threads from interrupt context");
        }

        let pid = thread.pid();
        let name = thread.name();

        {
            let mut internal = self.internal.lock();

            internal.threads.push(thread.clone());
            Self::reserve_ready(&mut internal);
            internal.ready.push_back(thread);
        }

        log!(Debug, "sched", "Registered thread {} (pid {})", name, pid);
    }

    /// Queues a previously blocked thread for dispatch again.
    pub(crate) fn make_ready(&self, thread: Pin<Arc<Thread>>) {
        let mut internal = self.internal.lock();

        Self::reserve_ready(&mut internal);
        internal.ready.push_back(thread);
    }

    // Keeps the ready queue's capacity at least one larger than the number of live threads, so
    // queue pushes on the dispatch path never allocate. Only callable from allocating paths.
    fn reserve_ready(internal: &mut SchedulerInternal) {
        let needed = internal.threads.len() + 1;

        if internal.ready.capacity() < needed {
            internal.ready.reserve(needed - internal.ready.len());
        }
    }

    /// Gets the thread currently executing. Fatal from interrupt context, where the interrupted
    /// thread is arbitrary and must not be treated as the caller.
    pub fn current_thread(&self) -> Pin<Arc<Thread>> {
        if is_handling_interrupt() {
            kfatal!("sched", "Cannot get the current thread from interrupt context");
        }

        match self.internal.lock().current.clone() {
            Some(thread) => thread,
            None => kfatal!("sched", "No current thread"),
        }
    }

    /// Non-blocking variant of [`Scheduler::current_thread`] for diagnostic paths. Returns
    /// [`None`] instead of spinning or dying.
    pub fn try_current_thread(&self) -> Option<Pin<Arc<Thread>>> {
        if is_handling_interrupt() {
            return None;
        }

        self.internal.try_lock().and_then(|internal| internal.current.clone())
    }

    pub(crate) fn is_current(&self, thread: &Thread) -> bool {
        self.internal
            .lock()
            .current
            .as_ref()
            .map_or(false, |current| ptr::eq(&**current as *const Thread, thread as *const Thread))
    }

    /// Yields the CPU to the next runnable thread. Fatal from interrupt context; preemption from
    /// the timer goes through its own path.
    pub fn yield_now(&self) {
        if is_handling_interrupt() {
            kfatal!("sched", "Cannot yield from interrupt context");
        }

        self.schedule();
    }

    /// Picks the next thread and switches to it. Never allocates, so it is usable from the timer
    /// interrupt. If no other thread is runnable the caller keeps the CPU; if the caller cannot
    /// run either, the kernel has no threads left and dies.
    fn schedule(&self) {
        let disabler = InterruptDisabler::new();
        let mut internal = self.internal.lock();

        // Dead entries are discarded as they surface rather than eagerly, since kill() must not
        // touch scheduler structures. Entries for threads that blocked after being queued are
        // dropped the same way; make_ready() requeues them on wakeup.
        let next = loop {
            match internal.ready.pop_front() {
                Some(thread) if thread.state() == ThreadState::Running => break Some(thread),
                Some(_) => {},
                None => break None,
            }
        };

        let Some(next) = next else {
            let current_runnable = internal
                .current
                .as_ref()
                .map_or(false, |current| current.state() == ThreadState::Running);

            if current_runnable {
                // The caller keeps the CPU and starts a fresh slice.
                internal.slice_ticks = 0;
                return;
            }

            drop(internal);
            drop(disabler);
            kfatal!("sched", "No runnable threads left");
        };

        let Some(prev) = internal.current.take() else {
            kfatal!("sched", "Dispatch with no current thread");
        };

        if ptr::eq(&*prev as *const Thread, &*next as *const Thread) {
            // The queue handed back the thread that is already running.
            internal.current = Some(next);
            internal.slice_ticks = 0;
            return;
        }

        if prev.state() == ThreadState::Running {
            internal.ready.push_back(prev.clone());
        }

        let from = prev.kernel_regs_ptr();
        let to = next.kernel_regs_ptr();

        internal.current = Some(next);
        internal.slice_ticks = 0;

        drop(internal);
        drop(prev);

        let was_in_interrupt = take_interrupt_state();

        // SAFETY: Both context pointers are owned by registry-held control blocks, which stay
        //         alive across the switch since reaping only happens from thread context on this
        //         single core. Interrupts are disabled for the duration.
        unsafe {
            arch::switch_context(from, to);
        }

        restore_interrupt_state(was_in_interrupt);
        drop(disabler);
    }

    /// Timer-tick accounting and preemption. Runs from interrupt context.
    fn on_timer_tick(&self) {
        debug_assert!(is_handling_interrupt());

        let expired = {
            let mut internal = self.internal.lock();

            internal.slice_ticks += 1;

            if let Some(ref current) = internal.current {
                current.bump_jiffies();
            }

            internal.slice_ticks >= self.time_slice
        };

        if expired {
            self.schedule();
        }
    }

    /// Removes every dead thread from the registry, the ready queue and any mutex wait set it
    /// was blocked in, then frees its control block and stack. The current thread is never
    /// reaped, even when already dead. Fatal from interrupt context since this deallocates.
    pub fn reap(&self) {
        if is_handling_interrupt() {
            kfatal!("sched", "Cannot reap threads from interrupt context");
        }

        let mut dead = Vec::new();

        {
            let mut internal = self.internal.lock();
            let current_ptr = internal
                .current
                .as_ref()
                .map_or(ptr::null(), |current| &**current as *const Thread);

            internal.threads.retain(|thread| {
                if thread.state() == ThreadState::ToBeDestroyed && !ptr::eq(&**thread as *const Thread, current_ptr) {
                    dead.push(thread.clone());
                    false
                } else {
                    true
                }
            });

            internal.ready.retain(|thread| thread.state() != ThreadState::ToBeDestroyed);
        }

        for thread in dead {
            let mutex = thread.sleep_link();

            if !mutex.is_null() {
                // SAFETY: The thread is still in this mutex's wait set, which keeps the mutex
                //         alive until we remove it here.
                unsafe {
                    (*mutex).remove_waiter(&thread);
                }

                thread.clear_sleep_link();
            }

            log!(Debug, "sched", "Reaped thread {} (pid {})", thread.name(), thread.pid());
        }
    }

    /// Logs every registered thread with its state, for debugging. Uses non-blocking lock
    /// attempts so it is safe on fatal-error paths.
    pub fn print_thread_list(&self) {
        let Some(internal) = self.internal.try_lock() else {
            log!(Info, "sched", "Thread list unavailable, scheduler is locked");
            return;
        };

        log!(Info, "sched", "{} thread(s):", internal.threads.len());

        for thread in internal.threads.iter() {
            let is_current = internal
                .current
                .as_ref()
                .map_or(false, |current| ptr::eq(&**current as *const Thread, &**thread as *const Thread));

            log!(
                Info,
                "sched",
                "  {} [{}] jiffies={}{}",
                thread.debug_name(),
                thread.state().printable(),
                thread.jiffies(),
                if is_current { " <- current" } else { "" }
            );
        }
    }

    /// A snapshot of the thread registry.
    pub fn threads(&self) -> Vec<Pin<Arc<Thread>>> {
        self.internal.lock().threads.clone()
    }

    pub fn thread_count(&self) -> usize {
        self.internal.lock().threads.len()
    }
}

fn timer_tick() {
    Scheduler::instance().on_timer_tick();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::with_kernel;

    #[test]
    fn test_round_robin_cycles_in_registration_order() {
        with_kernel(|| {
            let sched = Scheduler::instance();
            let boot = sched.current_thread();
            let a = Thread::new(Some("rr-a"), None, || {});
            let b = Thread::new(Some("rr-b"), None, || {});
            let c = Thread::new(Some("rr-c"), None, || {});

            sched.add_new_thread(a.clone());
            sched.add_new_thread(b.clone());
            sched.add_new_thread(c.clone());

            let mut dispatched = Vec::new();

            for _ in 0..12 {
                sched.yield_now();
                dispatched.push(sched.current_thread().pid());
            }

            let cycle = [a.pid(), b.pid(), c.pid(), boot.pid()];

            for (i, &pid) in dispatched.iter().enumerate() {
                assert_eq!(cycle[i % 4], pid, "dispatch {} out of order", i);
            }
        });
    }

    #[test]
    fn test_yield_with_empty_queue_keeps_the_cpu() {
        with_kernel(|| {
            let sched = Scheduler::instance();
            let before = sched.current_thread().pid();

            sched.yield_now();

            assert_eq!(before, sched.current_thread().pid());
        });
    }

    #[test]
    fn test_timer_preempts_after_full_slice() {
        with_kernel(|| {
            let sched = Scheduler::instance();
            let boot = sched.current_thread();
            let boot_jiffies = boot.jiffies();
            let a = Thread::new(Some("preempt-a"), None, || {});

            sched.add_new_thread(a.clone());

            for _ in 0..DEFAULT_TIME_SLICE_TICKS - 1 {
                arch::fire_timer();
                assert_eq!(boot.pid(), sched.current_thread().pid());
            }

            arch::fire_timer();

            assert_eq!(a.pid(), sched.current_thread().pid());
            assert_eq!(boot_jiffies + u64::from(DEFAULT_TIME_SLICE_TICKS), boot.jiffies());
        });
    }

    #[test]
    fn test_dispatch_does_not_leak_interrupt_state() {
        with_kernel(|| {
            // A preemptive dispatch hands the in-interrupt flag back to the suspended frame: the
            // dispatched thread must not observe it, the resumed handler must.
            unsafe {
                begin_interrupt();
            }

            let was_in_interrupt = take_interrupt_state();

            assert!(was_in_interrupt);
            assert!(!is_handling_interrupt());

            restore_interrupt_state(was_in_interrupt);

            assert!(is_handling_interrupt());

            unsafe {
                end_interrupt();
            }

            assert!(!is_handling_interrupt());
        });
    }

    #[test]
    fn test_slice_restarts_when_thread_keeps_the_cpu() {
        with_kernel(|| {
            let sched = Scheduler::instance();
            let boot_pid = sched.current_thread().pid();

            // Expire a full slice with nothing else runnable; the boot thread keeps the CPU and
            // starts a fresh slice rather than staying permanently expired.
            for _ in 0..DEFAULT_TIME_SLICE_TICKS {
                arch::fire_timer();
            }

            assert_eq!(boot_pid, sched.current_thread().pid());

            let a = Thread::new(Some("slice-a"), None, || {});

            sched.add_new_thread(a.clone());

            // The newcomer is not dispatched until the fresh slice runs out in turn.
            for _ in 0..DEFAULT_TIME_SLICE_TICKS - 1 {
                arch::fire_timer();
                assert_eq!(boot_pid, sched.current_thread().pid());
            }

            arch::fire_timer();

            assert_eq!(a.pid(), sched.current_thread().pid());
        });
    }

    #[test]
    fn test_self_kill_defers_reclamation() {
        with_kernel(|| {
            let sched = Scheduler::instance();
            let victim = Thread::new(Some("self-kill"), None, || {});
            let victim_pid = victim.pid();

            sched.add_new_thread(victim.clone());
            sched.yield_now();
            assert_eq!(victim_pid, sched.current_thread().pid());

            // Killing the current thread yields away immediately.
            victim.kill();

            assert_ne!(victim_pid, sched.current_thread().pid());
            assert_eq!(ThreadState::ToBeDestroyed, victim.state());

            // The corpse is never dispatched again, but its control block survives until the
            // sweep.
            for _ in 0..8 {
                sched.yield_now();
                assert_ne!(victim_pid, sched.current_thread().pid());
            }

            assert!(sched.threads().iter().any(|t| t.pid() == victim_pid));

            let count_before = sched.thread_count();

            drop(victim);
            sched.reap();

            assert_eq!(count_before - 1, sched.thread_count());
            assert!(!sched.threads().iter().any(|t| t.pid() == victim_pid));
        });
    }

    #[test]
    fn test_killed_queued_thread_is_discarded_at_dispatch() {
        with_kernel(|| {
            let sched = Scheduler::instance();
            let boot_pid = sched.current_thread().pid();
            let victim = Thread::new(Some("queued-kill"), None, || {});

            sched.add_new_thread(victim.clone());
            victim.kill();

            // The dead entry is dropped when it reaches the head of the queue, so yielding with
            // only the corpse queued keeps the CPU.
            sched.yield_now();

            assert_eq!(boot_pid, sched.current_thread().pid());
        });
    }

    #[test]
    fn test_print_thread_list_smoke() {
        with_kernel(|| {
            let sched = Scheduler::instance();
            let a = Thread::new(Some("list-a"), None, || {});

            sched.add_new_thread(a);
            sched.print_thread_list();
        });
    }
}
