//! Architecture-specific code.
//!
//! Everything the scheduling core needs from the hardware goes through the
//! items re-exported here: saved register contexts, the context switch,
//! interrupt control, the timer hook, halting, and stack walking. The
//! `arch_sim` backend is a software model of that interface and is what hosted
//! builds and tests use; `arch_x86_64` is the real thing.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "arch_sim")] {
        pub mod sim;

        pub use sim::*;
    } else if #[cfg(all(feature = "arch_x86_64", target_arch = "x86_64"))] {
        pub mod x86_64;

        pub use x86_64::*;
    } else {
        compile_error!("No usable architecture backend. Enable the arch_sim feature or build for x86_64 with arch_x86_64.");
    }
}
