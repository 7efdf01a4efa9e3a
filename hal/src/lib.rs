//! # Helix HAL - Device Hardware Abstraction Layer
//!
//! This crate defines the traits a storage or network driver needs from the
//! platform: register access, DMA mapping, interrupt line control and timing.
//! Drivers are generic over a [`DeviceHal`] so the same engine runs on real
//! hardware and on a simulated controller.
//!
//! ## Design Philosophy
//!
//! The HAL is designed to be:
//! - **Minimal**: Only exposes what a driver touches
//! - **Safe**: Encapsulates all unsafe operations behind the implementor
//! - **Composable**: One associated type per hardware concern

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod dma;
pub mod interrupts;
pub mod io;
pub mod time;

use core::fmt;

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported by this platform
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// Hardware reported an error
    HardwareError,
    /// Resource is not available
    ResourceBusy,
    /// Operation timed out
    Timeout,
    /// Address is invalid or outside the device's reach
    InvalidAddress,
    /// DMA memory allocation failed
    OutOfMemory,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::NotSupported => write!(f, "operation not supported"),
            HalError::InvalidParameter => write!(f, "invalid parameter"),
            HalError::HardwareError => write!(f, "hardware error"),
            HalError::ResourceBusy => write!(f, "resource busy"),
            HalError::Timeout => write!(f, "timed out"),
            HalError::InvalidAddress => write!(f, "invalid address"),
            HalError::OutOfMemory => write!(f, "out of DMA memory"),
        }
    }
}

/// The aggregate trait a device driver is generic over
///
/// One instance describes one adapter: its register window, the DMA mapper
/// serving its bus, its interrupt line and a clock.
pub trait DeviceHal: Send + Sync + 'static {
    /// Register window type
    type Regs: io::RegisterIo;

    /// DMA mapper type
    type Dma: dma::DmaMapper;

    /// Interrupt line type
    type Irq: interrupts::IrqLine;

    /// Clock type
    type Clock: time::Clock;

    /// Get the register window
    fn regs(&self) -> &Self::Regs;

    /// Get the DMA mapper
    fn dma(&self) -> &Self::Dma;

    /// Get the interrupt line
    fn irq(&self) -> &Self::Irq;

    /// Get the clock
    fn clock(&self) -> &Self::Clock;

    /// Human-readable device name used in log lines
    fn name(&self) -> &'static str;
}

/// Physical (bus) address type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Low 32 bits, as programmed into 32-bit descriptor fields
    #[inline]
    pub const fn low32(self) -> u32 {
        self.0 as u32
    }

    /// Whether the address is reachable by a 32-bit DMA engine
    #[inline]
    pub const fn fits_u32(self) -> bool {
        self.0 <= u32::MAX as u64
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Align the address up to the given alignment
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Add an offset to the address
    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
