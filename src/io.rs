//! Interfaces to I/O subsystems the scheduler only needs opaquely.

/// An output device a thread can be bound to for its console output.
///
/// Terminals are owned by the device layer and outlive every thread bound to
/// them, so threads hold plain `&'static` references.
pub trait Terminal: Send + Sync {
    fn write_str(&self, s: &str);
}
