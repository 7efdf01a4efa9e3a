//! # Timing
//!
//! Short calibrated delays for hardware handshakes and a sleeping wait for
//! long polls.

/// Time source of the platform
pub trait Clock: Send + Sync {
    /// Busy-wait for `us` microseconds
    fn udelay(&self, us: u32);

    /// Sleep for `ms` milliseconds, yielding the CPU
    fn msleep(&self, ms: u32);

    /// Monotonic tick counter
    fn ticks(&self) -> u64;
}
