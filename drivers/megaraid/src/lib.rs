//! # Helix MegaRAID Driver
//!
//! Command and queue engine for MegaRAID host bus adapters that talk through
//! a single shared mailbox.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Adapter       submit │ abort │ reset │ ioctl │ delete drive  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Build         CDB decode │ drive numbering │ SG lists        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Issue / ISR   mailbox handshake │ status batch │ completion  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  SCB pool      free │ pending │ internal queues (index FIFO)  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  helix-hal     registers │ DMA │ IRQ line │ clock             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every request handed to [`Adapter::submit`] is completed exactly once
//! through its callback, whether it succeeds, fails in firmware, is aborted
//! or is swept up by a reset.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod adapter;
pub mod cdb;
pub mod config;
pub mod ioctl;
pub mod mailbox;
pub mod passthru;
pub mod registry;
pub mod request;
pub mod scb;

mod build;
mod isr;
mod issue;
mod quiesce;

#[cfg(test)]
mod sim;

#[cfg(test)]
mod adapter_tests;

pub use adapter::{AbortOutcome, Adapter, AdapterStats, ResetOutcome, Submission};
pub use config::{AdapterConfig, BoardFlags, BootDevice, ConfigError};
pub use ioctl::{DriverInfo, IoctlCommand, IoctlReply};
pub use quiesce::QuiesceState;
pub use registry::{AdapterId, AdapterRegistry};
pub use request::{DataBuffer, HostByte, RequestId, ScsiRequest, ScsiResult};

use core::fmt;
use helix_hal::HalError;

// =============================================================================
// LIMITS
// =============================================================================

/// Command slots the firmware can track
pub const MAX_COMMANDS: u16 = 126;

/// Scatter-gather elements per command
pub const MAX_SGLIST: usize = 26;

/// Completed-command ids the firmware reports per interrupt
pub const MAX_FIRMWARE_STATUS: usize = 46;

/// Logical drives on 8LD firmware
pub const MAX_LOGICAL_DRIVES_8LD: u8 = 8;

/// Logical drives on 40LD firmware
pub const MAX_LOGICAL_DRIVES_40LD: u8 = 40;

/// Virtual channels carrying logical drives
pub const NVIRT_CHAN: u8 = 4;

/// Physical SCSI channels an adapter can have
pub const MAX_CHANNELS: u8 = 5;

/// Target ids per virtual channel that map to logical drives
pub const TARGETS_PER_CHANNEL: u8 = 14;

/// The adapter's own target id, never a logical drive
pub const INITIATOR_ID: u8 = 7;

/// Sense bytes the firmware returns through pass-through descriptors
pub const REQ_SENSE_LEN: usize = 14;

/// Bounce buffer used for INQUIRY and READ CAPACITY data
pub const BOUNCE_BUFFER_SIZE: usize = 256;

/// Offset added to logical drive numbers once a drive has been deleted
pub const LDRV_REMAP_OFFSET: u8 = 0x80;

// =============================================================================
// ERRORS
// =============================================================================

/// Result type for driver operations
pub type MegaResult<T> = Result<T, MegaError>;

/// Errors reported by the engine
///
/// Command failures reported by the firmware for a submitted request are
/// not errors: they arrive as a [`ScsiResult`] through the completion
/// callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MegaError {
    /// Every command slot is in use
    NoFreeScb,
    /// The mailbox stayed busy; the command is still queued
    MailboxBusy,
    /// The controller did not answer a polled command
    Timeout,
    /// Malformed request or argument
    InvalidParameter,
    /// The firmware lacks the requested feature
    Unsupported,
    /// A privileged command finished with a non-zero status
    CommandFailed(u8),
    /// The command was swept up by an adapter reset
    Reset,
    /// Commands did not drain before the configured deadline
    DrainTimeout,
    /// Platform failure
    Hal(HalError),
}

impl fmt::Display for MegaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MegaError::NoFreeScb => write!(f, "no free command slot"),
            MegaError::MailboxBusy => write!(f, "mailbox busy"),
            MegaError::Timeout => write!(f, "controller timed out"),
            MegaError::InvalidParameter => write!(f, "invalid parameter"),
            MegaError::Unsupported => write!(f, "not supported by firmware"),
            MegaError::CommandFailed(status) => {
                write!(f, "command failed with status {:#04x}", status)
            }
            MegaError::Reset => write!(f, "command reset"),
            MegaError::DrainTimeout => write!(f, "pending commands did not drain"),
            MegaError::Hal(err) => write!(f, "platform error: {}", err),
        }
    }
}

impl From<HalError> for MegaError {
    fn from(err: HalError) -> Self {
        MegaError::Hal(err)
    }
}
