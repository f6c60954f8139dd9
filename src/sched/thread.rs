//! Thread control blocks.
//!
//! A [`Thread`] is the unit of execution the scheduler dispatches. Control blocks live in
//! `Pin<Arc<Thread>>`: the scheduler's registry holds the owning reference for a thread's entire
//! life, while wait sets and `current` hold additional pinned references. The control block
//! embeds the thread's kernel stack, so its address must never change once created.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::marker::PhantomPinned;
use core::pin::Pin;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::arch::{self, SavedRegisters};
use crate::fs::FsContext;
use crate::io::Terminal;
use crate::kfatal;
use crate::log;
use crate::sched::{self, Scheduler};
use crate::sync::mutex::Mutex;
use crate::sync::{InterruptDisabler, UninterruptibleSpinlock};
use crate::util::SharedUnsafeCell;

pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

const_assert!(KERNEL_STACK_SIZE % 16 == 0);
const_assert!(KERNEL_STACK_SIZE >= 4096);

pub const UNNAMED_THREAD: &str = "<unnamed thread>";

static NEXT_PID: AtomicU64 = AtomicU64::new(0);

#[repr(C, align(16))]
struct KernelStack([u8; KERNEL_STACK_SIZE]);

/// The lifecycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Eligible for dispatch. The scheduler may pick this thread at any time; being `Running`
    /// does not mean the thread is on the CPU right now.
    Running,
    /// Blocked on a mutex. Never dispatched; leaves this state only through a wakeup or a kill.
    Sleeping,
    /// Killed. Never dispatched again; the control block survives until the reclamation sweep.
    ToBeDestroyed,
}

impl ThreadState {
    pub fn printable(self) -> &'static str {
        match self {
            ThreadState::Running => "Running",
            ThreadState::Sleeping => "Sleeping",
            ThreadState::ToBeDestroyed => "ToBeDestroyed",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// The thread executes user code and is dispatched from its user context rather than its
        /// kernel context.
        const USERSPACE = 1 << 0;
    }
}

/// The body a kernel thread executes once dispatched for the first time.
pub trait Run: Send {
    fn run(&mut self);
}

impl<F: FnMut() + Send> Run for F {
    fn run(&mut self) {
        self()
    }
}

/// A binary loader a user thread's program was created from. Only the entry point is visible
/// here; everything else about loading is the binfmt layer's business.
pub trait Loader: Send {
    fn entry_point(&self) -> usize;
}

struct ThreadInternal {
    state: ThreadState,
    sleeping_on: *const Mutex,
    jiffies: u64,
    flags: ThreadFlags,
    terminal: Option<&'static dyn Terminal>,
    fs_context: Option<FsContext>,
    loader: Option<Box<dyn Loader>>,
}

// SAFETY: sleeping_on is only ever dereferenced by the reclamation sweep, which runs outside
//         interrupt context and relies on wait-set membership keeping the mutex alive.
unsafe impl Send for ThreadInternal {}

/// A thread control block.
pub struct Thread {
    pid: u64,
    name: Option<&'static str>,
    kernel_regs: SharedUnsafeCell<SavedRegisters>,
    user_regs: SharedUnsafeCell<SavedRegisters>,
    internal: UninterruptibleSpinlock<ThreadInternal>,
    body: SharedUnsafeCell<Option<Box<dyn Run>>>,
    stack: SharedUnsafeCell<KernelStack>,
    _pin: PhantomPinned,
}

impl Thread {
    /// Creates a new kernel thread that will execute `body` once dispatched.
    ///
    /// The thread starts in the `Running` state but is not known to the scheduler until it is
    /// passed to [`Scheduler::add_new_thread`](crate::sched::Scheduler::add_new_thread).
    /// Allocation failure aborts; a control block is never half-initialized.
    pub fn new(name: Option<&'static str>, fs_context: Option<FsContext>, body: impl Run + 'static) -> Pin<Arc<Thread>> {
        let thread = Thread::alloc(name, fs_context, Some(Box::new(body)));

        // SAFETY: The control block was just created and nothing else can be holding a reference
        //         to its register state yet.
        unsafe {
            *thread.kernel_regs.get() =
                SavedRegisters::new_kernel_thread(thread_entry, &*thread as *const Thread as *mut u8, thread.stack_start_pointer());
        }

        thread
    }

    /// Creates the control block for the boot thread, which is already executing and needs no
    /// entry context of its own.
    pub(crate) fn new_boot() -> Pin<Arc<Thread>> {
        Thread::alloc(Some("boot"), None, None)
    }

    fn alloc(name: Option<&'static str>, fs_context: Option<FsContext>, body: Option<Box<dyn Run>>) -> Pin<Arc<Thread>> {
        Arc::pin(Thread {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            name,
            kernel_regs: SharedUnsafeCell::new(SavedRegisters::new()),
            user_regs: SharedUnsafeCell::new(SavedRegisters::new()),
            internal: UninterruptibleSpinlock::new(ThreadInternal {
                state: ThreadState::Running,
                sleeping_on: ptr::null(),
                jiffies: 0,
                flags: ThreadFlags::empty(),
                terminal: None,
                fs_context,
                loader: None,
            }),
            body: SharedUnsafeCell::new(body),
            stack: SharedUnsafeCell::new(KernelStack([0; KERNEL_STACK_SIZE])),
            _pin: PhantomPinned,
        })
    }

    /// Reconstructs a pinned reference from a raw control block pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from a live `Pin<Arc<Thread>>`.
    unsafe fn as_arc(ptr: *const Thread) -> Pin<Arc<Thread>> {
        Arc::increment_strong_count(ptr);
        Pin::new_unchecked(Arc::from_raw(ptr))
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn name(&self) -> &'static str {
        self.name.unwrap_or(UNNAMED_THREAD)
    }

    pub fn state(&self) -> ThreadState {
        self.internal.lock().state
    }

    /// The number of timer ticks this thread has been on the CPU for.
    pub fn jiffies(&self) -> u64 {
        self.internal.lock().jiffies
    }

    pub(crate) fn bump_jiffies(&self) {
        self.internal.lock().jiffies += 1;
    }

    /// The top of this thread's kernel stack. Stable for the thread's entire life. The returned
    /// pointer is valid for writes into the stack area, which only the thread itself and the
    /// entry-context setup ever perform.
    pub fn stack_start_pointer(&self) -> *mut u8 {
        (self.stack.get() as *mut u8).wrapping_add(KERNEL_STACK_SIZE)
    }

    pub fn flags(&self) -> ThreadFlags {
        self.internal.lock().flags
    }

    pub fn set_flags(&self, flags: ThreadFlags) {
        self.internal.lock().flags = flags;
    }

    pub fn terminal(&self) -> Option<&'static dyn Terminal> {
        self.internal.lock().terminal
    }

    pub fn set_terminal(&self, terminal: Option<&'static dyn Terminal>) {
        self.internal.lock().terminal = terminal;
    }

    pub fn fs_context(&self) -> Option<FsContext> {
        self.internal.lock().fs_context.clone()
    }

    /// Replaces this thread's filesystem context. The previous context is dropped.
    pub fn set_fs_context(&self, fs_context: Option<FsContext>) {
        self.internal.lock().fs_context = fs_context;
    }

    pub fn set_loader(&self, loader: Box<dyn Loader>) {
        self.internal.lock().loader = Some(loader);
    }

    pub fn loader_entry_point(&self) -> Option<usize> {
        self.internal.lock().loader.as_ref().map(|l| l.entry_point())
    }

    /// Installs the user-mode entry context and marks this thread as a userspace thread.
    pub fn set_user_context(&self, entry: usize, stack_top: usize) {
        let mut internal = self.internal.lock();

        // SAFETY: The user context is only read during dispatch, which cannot happen while the
        //         internal lock keeps interrupts disabled.
        unsafe {
            *self.user_regs.get() = SavedRegisters::new_user_thread(entry, 0, stack_top);
        }

        internal.flags |= ThreadFlags::USERSPACE;
    }

    /// Marks this thread for destruction.
    ///
    /// Never blocks and never allocates, so it is safe to call from interrupt handlers and with
    /// interrupts disabled. Killing an already-dead thread does nothing. The control block is
    /// not freed here; that is the reclamation sweep's job. A thread killing itself outside
    /// interrupt context yields immediately and is never dispatched again.
    pub fn kill(&self) {
        {
            let mut internal = self.internal.lock();

            if internal.state == ThreadState::ToBeDestroyed {
                return;
            }

            internal.state = ThreadState::ToBeDestroyed;
        }

        if !sched::is_handling_interrupt() {
            if let Some(sched) = Scheduler::try_instance() {
                if sched.is_current(self) {
                    sched.yield_now();
                }
            }
        }
    }

    /// Transitions this thread to `Sleeping` and records the mutex it is blocked on. Called with
    /// the mutex's wait set locked, just before the thread is added to it. A thread that was
    /// killed in the meantime stays dead but still records the back-reference, since it is about
    /// to sit in the wait set either way.
    pub(crate) fn begin_sleep(&self, mutex: *const Mutex) {
        let mut internal = self.internal.lock();

        if internal.state == ThreadState::Sleeping {
            drop(internal);
            kfatal!("sched::thread", "Thread {} blocked while already sleeping", self.debug_name());
        }

        if internal.state == ThreadState::Running {
            internal.state = ThreadState::Sleeping;
        }

        internal.sleeping_on = mutex;
    }

    /// Clears this thread's wait-set back-reference after it was removed from `mutex`'s wait set
    /// and returns whether it should be dispatched again. Dead threads are not revived.
    pub(crate) fn wake_from(&self, mutex: *const Mutex) -> bool {
        let mut internal = self.internal.lock();

        debug_assert!(ptr::eq(internal.sleeping_on, mutex));

        internal.sleeping_on = ptr::null();

        match internal.state {
            ThreadState::Sleeping => {
                internal.state = ThreadState::Running;
                true
            },
            ThreadState::ToBeDestroyed => false,
            ThreadState::Running => {
                drop(internal);
                kfatal!("sched::thread", "Thread {} was woken while not sleeping", self.debug_name());
            },
        }
    }

    /// The mutex this thread is currently blocked on, or null.
    pub fn sleep_link(&self) -> *const Mutex {
        self.internal.lock().sleeping_on
    }

    pub(crate) fn clear_sleep_link(&self) {
        self.internal.lock().sleeping_on = ptr::null();
    }

    pub(crate) fn kernel_regs_ptr(&self) -> *mut SavedRegisters {
        self.kernel_regs.get()
    }

    /// A short form of this thread's identity for log messages.
    pub fn debug_name(&self) -> impl fmt::Display + '_ {
        struct DebugName<'a>(&'a Thread);

        impl fmt::Display for DebugName<'_> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{} (pid {})", self.0.name(), self.0.pid)
            }
        }

        DebugName(self)
    }

    /// Logs this thread's state and a backtrace. With `use_stored_registers` the walk starts
    /// from the thread's saved kernel context; otherwise the caller's own stack is walked, which
    /// is only meaningful when this thread is the current one.
    pub fn print_backtrace(&self, use_stored_registers: bool) {
        let (state, sleeping_on) = match self.internal.try_lock() {
            Some(internal) => (Some(internal.state), internal.sleeping_on),
            None => (None, ptr::null()),
        };

        log!(
            Info,
            "sched::thread",
            "Backtrace of {} [{}]:",
            self.debug_name(),
            state.map_or("<locked>", ThreadState::printable)
        );

        if !sleeping_on.is_null() {
            // SAFETY: A thread in a mutex's wait set keeps that mutex alive, which Mutex's Drop
            //         enforces.
            let mutex_name = unsafe { (*sleeping_on).name() };

            log!(Info, "sched::thread", "  sleeping on mutex '{}'", mutex_name);
        }

        let stack_start = self.stack.get() as usize;
        let stack = stack_start..stack_start + KERNEL_STACK_SIZE;
        let mut idx = 0;
        let mut visit = |ip: usize| {
            log!(Info, "sched::thread", "  #{} {:#018x}", idx, ip);
            idx += 1;
        };

        if use_stored_registers {
            let _disabler = InterruptDisabler::new();

            // SAFETY: The saved context is only written during context switches, which cannot
            //         happen while interrupts are disabled here.
            let regs = unsafe { (*self.kernel_regs.get()).clone() };

            arch::backtrace(&regs, stack, &mut visit);
        } else {
            arch::backtrace_here(&mut visit);
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("pid", &self.pid)
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// First code every new kernel thread executes. Runs the body, then kills the thread.
extern "C" fn thread_entry(thread: *mut u8) -> ! {
    // The dispatch path's interrupt-disabling guard was leaked on the stack of whatever thread
    // switched to this brand-new context, so adopt and release it here.
    // SAFETY: schedule() always holds exactly one leaked guard when entering a fresh thread.
    let disabler = unsafe { InterruptDisabler::adopt() };

    // SAFETY: The scheduler dispatched us, so the registry holds a live reference.
    let thread = unsafe { Thread::as_arc(thread as *const Thread) };

    // SAFETY: The body cell is only touched at creation and here, exactly once.
    let body = unsafe { (*thread.body.get()).take() };

    drop(disabler);

    if let Some(mut body) = body {
        body.run();
    }

    thread.kill();
    kfatal!("sched::thread", "Dead thread {} was dispatched again", thread.debug_name());
}

#[cfg(test)]
mod test {
    use std::sync::Arc as StdArc;

    use super::*;

    #[test]
    fn test_pids_are_unique() {
        let a = Thread::new(Some("pid-a"), None, || {});
        let b = Thread::new(Some("pid-b"), None, || {});
        let c = Thread::new(None, None, || {});

        assert_ne!(a.pid(), b.pid());
        assert_ne!(a.pid(), c.pid());
        assert_ne!(b.pid(), c.pid());
    }

    #[test]
    fn test_name_fallback() {
        let named = Thread::new(Some("worker"), None, || {});
        let unnamed = Thread::new(None, None, || {});

        assert_eq!("worker", named.name());
        assert_eq!(UNNAMED_THREAD, unnamed.name());
        assert_eq!(format!("worker (pid {})", named.pid()), format!("{}", named.debug_name()));
    }

    #[test]
    fn test_stack_pointer_is_stable_and_aligned() {
        let thread = Thread::new(Some("stack"), None, || {});
        let top = thread.stack_start_pointer();

        assert_eq!(0, top as usize % 16);
        assert_eq!(top, thread.stack_start_pointer());

        // The top sits one past the highest usable byte of the stack area, inside the control
        // block.
        let thread_start = &*thread as *const Thread as usize;
        let thread_end = thread_start + core::mem::size_of::<Thread>();

        assert!((top as usize) > thread_start);
        assert!((top as usize) <= thread_end);
    }

    #[test]
    fn test_stack_top_is_writable_through_returned_pointer() {
        // The entry-context setup pushes the initial switch frame through this pointer while the
        // control block is still reachable as `&Thread`, so the write must be a legal mutation of
        // the stack cell and must land inside the stack area.
        let thread = Thread::new(Some("frame"), None, || {});
        let top = thread.stack_start_pointer();
        let slot = top.wrapping_sub(8) as *mut u64;

        unsafe {
            slot.write(0xfeed_face_cafe_beef);
            assert_eq!(0xfeed_face_cafe_beef, slot.read());
        }

        assert_eq!(top, thread.stack_start_pointer());
    }

    #[test]
    fn test_kill_is_idempotent_and_terminal() {
        let thread = Thread::new(Some("doomed"), None, || {});

        assert_eq!(ThreadState::Running, thread.state());

        thread.kill();
        assert_eq!(ThreadState::ToBeDestroyed, thread.state());

        thread.kill();
        assert_eq!(ThreadState::ToBeDestroyed, thread.state());
    }

    #[test]
    fn test_replacing_fs_context_drops_old_one() {
        let root: StdArc<str> = StdArc::from("/");
        let weak = StdArc::downgrade(&root);
        let thread = Thread::new(Some("fs"), Some(crate::fs::FsContext::new(root, "/")), || {});

        assert!(weak.upgrade().is_some());
        assert_eq!("/", thread.fs_context().map(|c| String::from(c.root())).unwrap());

        thread.set_fs_context(Some(crate::fs::FsContext::new("/new", "/new")));

        assert!(weak.upgrade().is_none());
        assert_eq!("/new", thread.fs_context().map(|c| String::from(c.root())).unwrap());
    }

    #[test]
    fn test_terminal_and_loader_attachment() {
        struct NullTerminal;

        impl crate::io::Terminal for NullTerminal {
            fn write_str(&self, _s: &str) {}
        }

        struct FixedLoader(usize);

        impl Loader for FixedLoader {
            fn entry_point(&self) -> usize {
                self.0
            }
        }

        static TERM: NullTerminal = NullTerminal;

        let thread = Thread::new(Some("attach"), None, || {});

        assert!(thread.terminal().is_none());
        assert_eq!(None, thread.loader_entry_point());

        thread.set_terminal(Some(&TERM));
        assert!(thread.terminal().is_some());

        thread.set_loader(Box::new(FixedLoader(0x40_1000)));
        assert_eq!(Some(0x40_1000), thread.loader_entry_point());

        thread.set_terminal(None);
        assert!(thread.terminal().is_none());
    }

    #[test]
    fn test_print_backtrace_from_saved_context_smoke() {
        let thread = Thread::new(Some("backtrace"), None, || {});

        thread.print_backtrace(true);
        thread.print_backtrace(false);
    }

    #[test]
    fn test_user_context_sets_userspace_flag() {
        let thread = Thread::new(Some("user"), None, || {});

        assert!(!thread.flags().contains(ThreadFlags::USERSPACE));

        thread.set_user_context(0x40_0000, 0x7fff_f000);

        assert!(thread.flags().contains(ThreadFlags::USERSPACE));
    }
}
