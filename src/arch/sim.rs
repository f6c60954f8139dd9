//! Software model of the architecture interface.
//!
//! This backend makes the scheduling core fully hosted: register contexts are
//! plain data, "switching" to a context records it and returns to the caller,
//! and the timer interrupt is fired explicitly. The scheduler cannot tell the
//! difference, which is what allows its bookkeeping to be exercised by
//! ordinary unit tests.

use crate::util::OneShotManualInit;

/// The register state of a suspended thread.
///
/// Only the fields the scheduling core inspects are modelled. A context built
/// by [`SavedRegisters::new`] is all zeroes and stands for "already running,
/// nothing saved yet".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRegisters {
    pub instruction_pointer: usize,
    pub stack_pointer: usize,
    pub argument: usize,
}

impl SavedRegisters {
    pub fn new() -> SavedRegisters {
        SavedRegisters {
            instruction_pointer: 0,
            stack_pointer: 0,
            argument: 0,
        }
    }

    pub fn new_kernel_thread(entry: extern "C" fn(*mut u8) -> !, arg: *mut u8, stack_top: *mut u8) -> SavedRegisters {
        SavedRegisters {
            instruction_pointer: entry as usize,
            stack_pointer: stack_top as usize,
            argument: arg as usize,
        }
    }

    pub fn new_user_thread(entry: usize, arg: usize, stack_top: usize) -> SavedRegisters {
        SavedRegisters {
            instruction_pointer: entry,
            stack_pointer: stack_top,
            argument: arg,
        }
    }
}

impl Default for SavedRegisters {
    fn default() -> SavedRegisters {
        SavedRegisters::new()
    }
}

/// Switches from one saved context to another.
///
/// The simulated switch copies nothing and transfers no control; it simply
/// returns, leaving the caller running. Callers treat a return from this
/// function as "this thread was dispatched again".
///
/// # Safety
///
/// Both pointers must be valid for the duration of the call and must not
/// alias live references.
pub unsafe fn switch_context(_from: *mut SavedRegisters, _to: *const SavedRegisters) {}

pub mod interrupts {
    use core::sync::atomic::{AtomicBool, Ordering};

    static ENABLED: AtomicBool = AtomicBool::new(false);

    pub fn enable() {
        ENABLED.store(true, Ordering::Relaxed);
    }

    pub fn disable() {
        ENABLED.store(false, Ordering::Relaxed);
    }

    pub fn are_enabled() -> bool {
        ENABLED.load(Ordering::Relaxed)
    }
}

/// Stops the machine. The simulated machine stops by panicking.
pub fn halt() -> ! {
    interrupts::disable();
    panic!("kernel halted");
}

static TIMER_HANDLER: OneShotManualInit<fn()> = OneShotManualInit::uninit();

pub fn set_timer_handler(handler: fn()) {
    TIMER_HANDLER.set(handler);
}

/// Delivers one timer interrupt, running the registered handler with the
/// usual interrupt bookkeeping in place. Delivery is explicit and ignores the
/// simulated interrupt flag; callers that want masking model it themselves.
/// Does nothing if no handler was registered.
pub fn fire_timer() {
    let Some(&handler) = TIMER_HANDLER.try_get() else {
        return;
    };

    // SAFETY: Entry and exit are correctly paired around the handler, the same
    //         way a real interrupt stub brackets its body.
    unsafe {
        crate::sched::begin_interrupt();
    }

    handler();

    unsafe {
        crate::sched::end_interrupt();
    }
}

/// Walks the frame chain of a saved context, calling `visit` with each return
/// address. The simulated context has no real frames, so only the saved
/// instruction pointer is reported.
pub fn backtrace(regs: &SavedRegisters, _stack: core::ops::Range<usize>, visit: &mut dyn FnMut(usize)) {
    if regs.instruction_pointer != 0 {
        visit(regs.instruction_pointer);
    }
}

/// Walks the caller's own stack. Not supported by the simulated backend.
pub fn backtrace_here(_visit: &mut dyn FnMut(usize)) {}

#[cfg(test)]
mod test {
    use super::*;

    extern "C" fn dummy_entry(_arg: *mut u8) -> ! {
        unreachable!()
    }

    #[test]
    fn test_kernel_thread_context_points_at_entry() {
        let mut stack = [0u8; 64];
        let stack_top = stack.as_mut_ptr().wrapping_add(64);
        let regs = SavedRegisters::new_kernel_thread(dummy_entry, core::ptr::null_mut(), stack_top);

        assert_eq!(dummy_entry as usize, regs.instruction_pointer);
        assert_eq!(stack_top as usize, regs.stack_pointer);

        let mut frames = std::vec::Vec::new();
        backtrace(&regs, 0..0, &mut |ip| frames.push(ip));

        assert_eq!(std::vec![dummy_entry as usize], frames);
    }

    #[test]
    fn test_empty_context_has_no_frames() {
        let mut frames = std::vec::Vec::new();
        backtrace(&SavedRegisters::new(), 0..0, &mut |ip| frames.push(ip));

        assert!(frames.is_empty());
    }
}
