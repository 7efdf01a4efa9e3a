//! # Register Access
//!
//! Port I/O and memory-mapped registers look the same to a driver: an
//! offset into the device's window and an access width.

/// A device register window
pub trait RegisterIo: Send + Sync {
    /// Read an 8-bit register
    fn read8(&self, offset: usize) -> u8;

    /// Write an 8-bit register
    fn write8(&self, offset: usize, value: u8);

    /// Read a 32-bit register
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit register
    fn write32(&self, offset: usize, value: u32);
}
