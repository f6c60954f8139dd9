//! The kernel's fatal-error path.
//!
//! Invariant violations that leave the kernel in an unknown state go through
//! [`kfatal!`], which logs what it can and halts. Diagnostics here only ever
//! use non-blocking lock attempts since the locks in question may be the ones
//! that were mishandled.

use core::fmt;

use crate::log;
use crate::sched::Scheduler;

pub fn die(module: &'static str, args: fmt::Arguments) -> ! {
    log!(Critical, module, "FATAL: {}", args);

    if let Some(sched) = Scheduler::try_instance() {
        sched.print_thread_list();

        if let Some(thread) = sched.try_current_thread() {
            thread.print_backtrace(false);
        }
    }

    crate::arch::halt();
}

#[macro_export]
macro_rules! kfatal {
    ($module:expr, $msg:expr $(, $($arg:expr),*)?) => {
        $crate::fatal::die($module, ::core::format_args!($msg $(, $($arg),*)?))
    }
}
