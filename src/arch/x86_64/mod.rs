//! The x86_64 architecture backend.

use core::arch::global_asm;
use core::fmt::Write;
use core::ops::Range;

use spin::Mutex;
use uart_16550::SerialPort;

use crate::log::LogSink;
use crate::util::OneShotManualInit;

/// The callee-saved register state of a suspended thread.
///
/// Everything else lives on the thread's stack: `switch_context` spills the
/// callee-saved registers and RFLAGS there and only the resulting stack
/// pointer is kept here. The user-mode fields are consulted when entering ring
/// 3 and are unused for pure kernel threads.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct SavedRegisters {
    pub rsp: u64,
    pub user_rip: u64,
    pub user_rsp: u64,
    pub user_rdi: u64,
}

// Layout of the frame switch_context pops, from the saved RSP upward:
//   +0x00 r15  +0x08 r14  +0x10 r13  +0x18 r12
//   +0x20 rbp  +0x28 rbx  +0x30 rflags  +0x38 return address
const SWITCH_FRAME_QWORDS: usize = 8;
const SAVED_RBP_OFFSET: usize = 0x20;

global_asm!(
    r"
    .global __argon_switch_context
    __argon_switch_context:
        pushfq
        push rbx
        push rbp
        push r12
        push r13
        push r14
        push r15
        mov [rdi], rsp
        mov rsp, [rsi]
        pop r15
        pop r14
        pop r13
        pop r12
        pop rbp
        pop rbx
        popfq
        ret

    .global __argon_thread_start
    __argon_thread_start:
        mov rdi, r12
        jmp r13
    "
);

extern "C" {
    fn __argon_switch_context(from: *mut SavedRegisters, to: *const SavedRegisters);
    fn __argon_thread_start() -> !;
}

impl SavedRegisters {
    pub fn new() -> SavedRegisters {
        SavedRegisters {
            rsp: 0,
            user_rip: 0,
            user_rsp: 0,
            user_rdi: 0,
        }
    }

    pub fn new_kernel_thread(entry: extern "C" fn(*mut u8) -> !, arg: *mut u8, stack_top: *mut u8) -> SavedRegisters {
        let frame = stack_top.wrapping_sub(SWITCH_FRAME_QWORDS * 8) as *mut u64;

        // SAFETY: The caller hands us the top of a freshly allocated stack
        //         with at least SWITCH_FRAME_QWORDS free qwords below it.
        unsafe {
            frame.add(0).write(0); // r15
            frame.add(1).write(0); // r14
            frame.add(2).write(entry as u64); // r13
            frame.add(3).write(arg as u64); // r12
            frame.add(4).write(0); // rbp, terminates frame walks
            frame.add(5).write(0); // rbx
            frame.add(6).write(0x202); // rflags, IF set
            frame.add(7).write(__argon_thread_start as u64);
        }

        SavedRegisters {
            rsp: frame as u64,
            user_rip: 0,
            user_rsp: 0,
            user_rdi: 0,
        }
    }

    pub fn new_user_thread(entry: usize, arg: usize, stack_top: usize) -> SavedRegisters {
        SavedRegisters {
            rsp: 0,
            user_rip: entry as u64,
            user_rsp: stack_top as u64,
            user_rdi: arg as u64,
        }
    }
}

impl Default for SavedRegisters {
    fn default() -> SavedRegisters {
        SavedRegisters::new()
    }
}

/// Switches from one saved context to another. Does not return until some
/// other thread switches back to `from`.
///
/// # Safety
///
/// Must be called with interrupts disabled. `from` must be valid to write and
/// `to` must hold a context previously produced by `switch_context` or one of
/// the `SavedRegisters` constructors, on a stack that is still alive.
pub unsafe fn switch_context(from: *mut SavedRegisters, to: *const SavedRegisters) {
    __argon_switch_context(from, to);
}

pub mod interrupts {
    pub fn enable() {
        x86_64::instructions::interrupts::enable();
    }

    pub fn disable() {
        x86_64::instructions::interrupts::disable();
    }

    pub fn are_enabled() -> bool {
        x86_64::instructions::interrupts::are_enabled()
    }
}

pub fn halt() -> ! {
    interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

static TIMER_HANDLER: OneShotManualInit<fn()> = OneShotManualInit::uninit();

pub fn set_timer_handler(handler: fn()) {
    TIMER_HANDLER.set(handler);
}

/// Called from the boot image's PIT interrupt stub after the interrupt
/// prologue has run.
pub fn timer_interrupt() {
    if let Some(&handler) = TIMER_HANDLER.try_get() {
        handler();
    }
}

/// A [`LogSink`] writing to a 16550 serial port.
pub struct SerialSink(Mutex<SerialPort>);

impl SerialSink {
    /// # Safety
    ///
    /// `base` must be the I/O port base of a real serial device.
    pub const unsafe fn new(base: u16) -> SerialSink {
        SerialSink(Mutex::new(SerialPort::new(base)))
    }

    pub fn init(&self) {
        self.0.lock().init();
    }
}

impl LogSink for SerialSink {
    fn write(&self, msg: &str) {
        let _ = self.0.lock().write_str(msg);
    }
}

const MAX_BACKTRACE_FRAMES: usize = 64;

/// Walks the saved frame-pointer chain of a suspended context. The walk stops
/// at a null RBP, at any pointer leaving the thread's stack, or after a fixed
/// number of frames.
pub fn backtrace(regs: &SavedRegisters, stack: Range<usize>, visit: &mut dyn FnMut(usize)) {
    let rsp = regs.rsp as usize;

    if !stack.contains(&rsp) {
        return;
    }

    // SAFETY: rsp points into the live stack at a switch_context frame, so the
    //         saved RBP slot is readable.
    let mut rbp = unsafe { ((rsp + SAVED_RBP_OFFSET) as *const u64).read() as usize };

    // SAFETY: The return address slot of the switch frame is readable for the
    //         same reason.
    let ret = unsafe { ((rsp + (SWITCH_FRAME_QWORDS - 1) * 8) as *const u64).read() as usize };

    if ret != 0 {
        visit(ret);
    }

    for _ in 0..MAX_BACKTRACE_FRAMES {
        if rbp == 0 || !stack.contains(&rbp) || !stack.contains(&(rbp + 8)) {
            break;
        }

        // SAFETY: Both slots were just bounds-checked against the stack.
        let (next_rbp, ret) = unsafe { (((rbp as *const u64).read()) as usize, ((rbp + 8) as *const u64).read() as usize) };

        if ret == 0 {
            break;
        }

        visit(ret);
        rbp = next_rbp;
    }
}

/// Walks the caller's own frame-pointer chain. Only useful in builds with
/// frame pointers enabled.
pub fn backtrace_here(visit: &mut dyn FnMut(usize)) {
    let mut rbp: usize;

    // SAFETY: Reading RBP has no side effects.
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags));
    }

    for _ in 0..MAX_BACKTRACE_FRAMES {
        if rbp == 0 || rbp % 8 != 0 {
            break;
        }

        // SAFETY: A nonzero aligned RBP in a frame-pointer build points at a
        //         valid frame record.
        let (next_rbp, ret) = unsafe { (((rbp as *const u64).read()) as usize, ((rbp + 8) as *const u64).read() as usize) };

        if ret == 0 {
            break;
        }

        visit(ret);
        rbp = next_rbp;
    }
}
