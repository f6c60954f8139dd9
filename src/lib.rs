//! The ArgonOS scheduling core.
//!
//! This crate contains the kernel's thread control blocks, the scheduler that
//! dispatches them, and the blocking mutex they synchronize on. Everything
//! architecture-specific lives behind the interface in [`arch`], which has a
//! real x86_64 backend and a software model used for hosted checking and
//! testing.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod fatal;
pub mod fs;
pub mod io;
pub mod log;
pub mod options;
pub mod sched;
pub mod sync;
pub mod util;

#[cfg(test)]
mod test_util;

/// Brings the scheduling core up, adopting the caller as the boot thread.
///
/// Parses the boot option string, applies logging options, creates the scheduler singleton,
/// spawns the idle thread and enables interrupts. May only be called once; the platform entry
/// point calls it after memory management and log sinks are set up.
pub fn start(options_str: &'static str) -> &'static sched::Scheduler {
    options::init(options_str);
    log::apply_options();

    let sched = sched::Scheduler::create();

    sched::idle::IdleThread::spawn();
    arch::interrupts::enable();

    crate::log!(Info, "kernel", "Scheduling core is up");

    sched
}
