//! # Interrupt Line Abstraction
//!
//! A driver only ever controls its own line: masking it around a polled
//! command and reporting whether an interrupt was meant for it.

use bitflags::bitflags;

/// Interrupt vector number
pub type InterruptVector = u8;

bitflags! {
    /// Properties of an interrupt line
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqFlags: u32 {
        /// Line is shared with other devices
        const SHARED = 1 << 0;
        /// Level-triggered
        const LEVEL = 1 << 1;
    }
}

/// What a handler did with an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The interrupt was not raised by this device
    None,
    /// The interrupt was serviced
    Handled,
}

impl IrqReturn {
    /// Combine the answers of several handlers sharing a line
    pub fn or(self, other: IrqReturn) -> IrqReturn {
        if self == IrqReturn::Handled || other == IrqReturn::Handled {
            IrqReturn::Handled
        } else {
            IrqReturn::None
        }
    }
}

/// The interrupt line of one device
pub trait IrqLine: Send + Sync {
    /// Vector the line is routed to
    fn vector(&self) -> InterruptVector;

    /// Line properties
    fn flags(&self) -> IrqFlags {
        IrqFlags::empty()
    }

    /// Mask the line, waiting for a running handler to finish
    fn disable(&self);

    /// Unmask the line
    fn enable(&self);

    /// Whether the line is currently unmasked
    fn is_enabled(&self) -> bool;
}
