//! Kernel log output.
//!
//! Log messages are fanned out to every registered [`LogSink`]. Sinks are
//! registered once during boot and live for the kernel's lifetime; which sinks
//! exist depends on the architecture backend and on which devices were found.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::sync::UninterruptibleSpinlock;

static SINKS: UninterruptibleSpinlock<Vec<&'static dyn LogSink>> = UninterruptibleSpinlock::new(vec![]);
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// A destination for formatted log messages.
///
/// Implementations must be callable with interrupts disabled and must not
/// block on the scheduler.
pub trait LogSink: Send + Sync {
    fn write(&self, msg: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug
}

impl LogLevel {
    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Critical => "CRIT",
            LogLevel::Error => "ERR",
            LogLevel::Warning => "WARN",
            LogLevel::Notice => "NOTICE",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG"
        }
    }

    pub fn from_name(name: &str) -> Option<LogLevel> {
        Some(match name {
            "critical" => LogLevel::Critical,
            "error" => LogLevel::Error,
            "warning" => LogLevel::Warning,
            "notice" => LogLevel::Notice,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            _ => {
                return None;
            },
        })
    }
}

pub fn register_sink(sink: &'static dyn LogSink) {
    SINKS.lock().push(sink);
}

pub fn set_max_level(lvl: LogLevel) {
    MAX_LEVEL.store(lvl as u8, Ordering::Relaxed);
}

pub fn max_level() -> LogLevel {
    match MAX_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Critical,
        1 => LogLevel::Error,
        2 => LogLevel::Warning,
        3 => LogLevel::Notice,
        4 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

pub fn is_enabled(lvl: LogLevel) -> bool {
    lvl <= max_level()
}

/// Applies logging-related kernel options, currently only `log.level`.
pub fn apply_options() {
    if let Some(options) = crate::options::get() {
        if let Some(name) = options.get::<&str>("log.level") {
            match LogLevel::from_name(name) {
                Some(lvl) => set_max_level(lvl),
                None => crate::options::KernelOptions::warn_invalid("log.level"),
            }
        }
    }
}

pub fn log_msg(lvl: LogLevel, msg: String) {
    if !is_enabled(lvl) {
        return;
    }

    for sink in SINKS.lock().iter() {
        sink.write(&msg);
    }
}

#[macro_export]
macro_rules! log {
    ($lvl:ident, $module:expr, $msg:expr $(, $($arg:expr),*)?) => {
        {
            let lvl = $crate::log::LogLevel::$lvl;

            if $crate::log::is_enabled(lvl) {
                $crate::log::log_msg(lvl, ::alloc::format!(
                    concat!("[{}] {}: ", $msg, "\n"),
                    lvl.name(),
                    $module,
                    $($($arg),*)?
                ));
            };
        }
    }
}
