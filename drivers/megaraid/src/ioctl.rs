//! # Management Interface
//!
//! Administrative commands from management tools share the command slots
//! with regular I/O. The caller blocks on a per-slot completion signal that
//! the interrupt handler (or a reset) fires; the slot is released by the
//! waiter once it has copied the results out.
//!
//! A second, driver-level ioctl is carried inside an ordinary SCSI request
//! and answered without the firmware.

use crate::adapter::{finish_all, Adapter};
use crate::config::BoardFlags;
use crate::mailbox::{cmd, offset, MailboxCommand, MBOX_SIZE};
use crate::passthru::{encode_sg64, PassThru, PASSTHRU_SENSE_OFFSET};
use crate::request::{HostByte, ScsiRequest, ScsiResult};
use crate::scb::{QueueKind, ScbOwner};
use crate::{MegaError, MegaResult, REQ_SENSE_LEN};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};
use helix_hal::dma::DmaMapper;
use helix_hal::time::Clock;
use helix_hal::DeviceHal;

/// CDB opcode of the driver-level ioctl
pub const DRIVER_IOCTL_OPCODE: u8 = 0x82;

/// Driver ioctl sub-opcode (CDB byte 1): report driver information
pub const GET_DRIVER_INFO: u8 = 0x01;

/// Version reported to management tools
pub const IOCTL_VERSION: u32 = 114;

/// Staging buffer size for ioctls that carry no data
const DEFAULT_IOCTL_BUFFER: usize = 4096;

// =============================================================================
// DRIVER IOCTL
// =============================================================================

/// Reply to `GET_DRIVER_INFO`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverInfo {
    /// Bytes following the size field
    pub size: u32,
    /// Interface version
    pub version: u32,
}

impl DriverInfo {
    /// Encoded size
    pub const SIZE: usize = 8;

    /// Information about this driver
    pub const fn current() -> Self {
        Self { size: (Self::SIZE - 4) as u32, version: IOCTL_VERSION }
    }

    /// Little-endian wire form
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.size.to_le_bytes());
        out[4..].copy_from_slice(&self.version.to_le_bytes());
        out
    }
}

/// Answer a driver ioctl carried in a SCSI request
pub(crate) fn driver_ioctl(req: &mut ScsiRequest) {
    let host = match req.cdb().get(1).copied() {
        Some(GET_DRIVER_INFO) if req.data.len() >= DriverInfo::SIZE => {
            req.data.write_prefix(&DriverInfo::current().encode());
            HostByte::Ok
        }
        Some(GET_DRIVER_INFO) => HostByte::BadTarget,
        other => {
            log::debug!("megaraid: unknown driver ioctl {:?}", other);
            HostByte::BadTarget
        }
    };
    req.set_result(ScsiResult::host_only(host));
}

// =============================================================================
// COMPLETION SIGNAL
// =============================================================================

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const FIRED: u8 = 2;
const RESET: u8 = 3;

/// How a waited-on command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signalled {
    /// The firmware returned a status
    Status(u8),
    /// A reset swept the command up
    Reset,
}

/// One-shot completion flag of a command slot
#[derive(Debug)]
pub(crate) struct CompletionSignal {
    state: AtomicU8,
    status: AtomicU8,
}

impl CompletionSignal {
    pub const fn new() -> Self {
        Self { state: AtomicU8::new(IDLE), status: AtomicU8::new(0) }
    }

    pub fn arm(&self) {
        self.state.store(ARMED, Ordering::Release);
    }

    pub fn fire(&self, status: u8) {
        self.status.store(status, Ordering::Relaxed);
        self.state.store(FIRED, Ordering::Release);
    }

    pub fn fire_reset(&self) {
        self.state.store(RESET, Ordering::Release);
    }

    pub fn is_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    /// Sleep until fired
    pub fn wait<C: Clock>(&self, clock: &C, poll_ms: u32) -> Signalled {
        loop {
            match self.state.load(Ordering::Acquire) {
                FIRED => return Signalled::Status(self.status.load(Ordering::Relaxed)),
                RESET => return Signalled::Reset,
                _ => clock.msleep(poll_ms),
            }
        }
    }
}

// =============================================================================
// ADMINISTRATIVE IOCTL
// =============================================================================

/// A management command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoctlCommand {
    /// Mailbox image for non pass-through commands; the transfer address
    /// field is filled in by the driver
    pub mailbox: [u8; MBOX_SIZE],
    /// Pass-through descriptor; its transfer fields are filled in by the driver
    pub passthru: Option<PassThru>,
    /// Data sent to the adapter and overwritten with what it returns
    pub data: Vec<u8>,
}

/// Outcome of a management command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoctlReply {
    /// Firmware status
    pub status: u8,
    /// Data buffer after the command
    pub data: Vec<u8>,
    /// Sense data of a pass-through
    pub sense: Option<[u8; REQ_SENSE_LEN]>,
}

impl<H: DeviceHal> Adapter<H> {
    /// Run a management command and wait for it
    ///
    /// The command queues behind regular I/O and is deferred while the
    /// adapter is quiescing.
    pub fn ioctl(&self, command: IoctlCommand) -> MegaResult<IoctlReply> {
        let dma = self.hal.dma();
        let IoctlCommand { mailbox, passthru, mut data } = command;

        let mut engine = self.engine.lock();
        let index = engine
            .pool
            .allocate(ScbOwner::Ioctl)
            .map_err(|_| MegaError::NoFreeScb)?;
        let buffer_len = if data.is_empty() { DEFAULT_IOCTL_BUFFER } else { data.len() };
        let buffer = match dma.alloc_coherent(buffer_len) {
            Ok(buffer) => buffer,
            Err(err) => {
                engine.pool.release(index, dma);
                return Err(err.into());
            }
        };
        dma.write(&buffer, 0, &data);

        let bit64 = self.caps.board.contains(BoardFlags::BIT64);
        let scb = &mut engine.pool[index];
        scb.ioctl_buffer = Some(buffer);
        scb.command = match passthru {
            Some(mut pthru) => {
                let opcode = if bit64 {
                    dma.write(&scb.buffers.sg, 0, &encode_sg64(buffer.phys().as_u64(), data.len() as u32));
                    pthru.dataxferaddr = scb.buffers.sg.phys().low32();
                    pthru.numsgelements = 1;
                    cmd::PASSTHRU64
                } else {
                    pthru.dataxferaddr = buffer.phys().low32();
                    pthru.numsgelements = 0;
                    cmd::PASSTHRU
                };
                pthru.dataxferlen = data.len() as u32;
                dma.write(&scb.buffers.passthru, 0, &pthru.encode());
                MailboxCommand::PassThru { opcode, xfer: scb.buffers.passthru.phys().low32() }
            }
            None => {
                let mut raw = mailbox;
                raw[offset::XFERADDR..offset::XFERADDR + 4]
                    .copy_from_slice(&buffer.phys().low32().to_le_bytes());
                MailboxCommand::Raw(raw)
            }
        };
        let passthru_region = scb.buffers.passthru;

        let signal = &self.signals[index as usize];
        signal.arm();
        if engine.quiesce.defers_submissions() {
            engine.pool.enqueue(QueueKind::Internal, index);
        } else {
            engine.pool.enqueue(QueueKind::Pending, index);
            if let Err(err) = self.run_pending(&mut engine) {
                log::debug!("{}: pending queue stalled: {}", self.hal.name(), err);
            }
        }
        drop(engine);

        let status = match signal.wait(self.hal.clock(), self.config.ioctl_poll_ms) {
            Signalled::Status(status) => status,
            Signalled::Reset => {
                log::warn!("{}: ioctl swept up by reset", self.hal.name());
                return Err(MegaError::Reset);
            }
        };

        let mut engine = self.engine.lock();
        dma.read(&buffer, 0, &mut data);
        let sense = passthru.map(|_| {
            let mut sense = [0u8; REQ_SENSE_LEN];
            dma.read(&passthru_region, PASSTHRU_SENSE_OFFSET, &mut sense);
            sense
        });
        engine.pool.release(index, dma);
        if let Err(err) = self.run_pending(&mut engine) {
            log::debug!("{}: pending queue stalled: {}", self.hal.name(), err);
        }
        let done = engine.take_completed();
        drop(engine);
        finish_all(done);

        Ok(IoctlReply { status, data, sense })
    }
}
