//! # Mailbox Protocol
//!
//! The adapter takes one command at a time through a 16-byte mailbox in
//! coherent memory, followed by a status area the firmware fills in when
//! commands finish:
//!
//! ```text
//!  -8  xfer_segment_lo (u32)   64-bit transfer address extension
//!  -4  xfer_segment_hi (u32)
//! 0x00 cmd          0x01 cmdid       0x02 numsectors (u16)
//! 0x04 lba (u32)                     0x08 xferaddr (u32)
//! 0x0C logdrv       0x0D numsgelements 0x0E reserved  0x0F busy
//! 0x10 numstatus    0x11 status      0x12 completed[46]
//! 0x40 poll         0x41 ack
//! ```
//!
//! The firmware writes `0xFF` into `numstatus` and `completed[]` slots that
//! carry no value yet. That sentinel lives only in this module; callers see
//! `Option<u8>`.

use crate::{MegaResult, MAX_FIRMWARE_STATUS};
use helix_hal::dma::{CoherentRegion, DmaMapper};
use helix_hal::PhysAddr;
use static_assertions::const_assert;

// =============================================================================
// FIRMWARE OPCODES
// =============================================================================

/// Mailbox command bytes
pub mod cmd {
    /// Logical drive read
    pub const LREAD: u8 = 0x01;
    /// Logical drive write
    pub const LWRITE: u8 = 0x02;
    /// SCSI pass-through
    pub const PASSTHRU: u8 = 0x03;
    /// Adapter inquiry (8LD firmware)
    pub const ADAPTERINQ: u8 = 0x05;
    /// Flush the adapter cache
    pub const FLUSH_CACHE: u8 = 0x0A;
    /// BIOS private data
    pub const BIOS_PVT_DATA: u8 = 0x40;
    /// New-configuration command family (40LD firmware)
    pub const FC_NEW_CONFIG: u8 = 0xA1;
    /// Miscellaneous command family: logical drive deletion, feature probes
    pub const MISC: u8 = 0xA4;
    /// 64-bit logical drive read
    pub const LREAD64: u8 = 0xA7;
    /// 64-bit logical drive write
    pub const LWRITE64: u8 = 0xA8;
    /// Channel class query
    pub const CHNL_CLASS: u8 = 0xA9;
    /// 64-bit SCSI pass-through
    pub const PASSTHRU64: u8 = 0xC3;
    /// Extended (16-byte CDB) pass-through
    pub const EXTPASSTHRU: u8 = 0xE3;
}

/// Sub-opcodes carried in mailbox byte 2
pub mod subop {
    /// ENQUIRY3 under `FC_NEW_CONFIG`
    pub const ENQUIRY3: u8 = 0x0F;
    /// Parameter of ENQUIRY3: full solicited data
    pub const ENQ3_GET_SOLICITED_FULL: u8 = 0x02;
    /// Extended CDB support probe under `MISC`
    pub const EXT_CDB_PROBE: u8 = 0x16;
    /// Random deletion support probe under `MISC`
    pub const SUP_DEL_LOGDRV: u8 = 0x2A;
    /// Delete a logical drive under `MISC`
    pub const DEL_LOGDRV: u8 = 0x1C;
    /// Read channel classes under `CHNL_CLASS`
    pub const GET_CHNL_CLASS: u8 = 0x00;
    /// Read BIOS private data under `BIOS_PVT_DATA`
    pub const GET_BIOS_PVT_DATA: u8 = 0x00;
}

/// Firmware status bytes the engine interprets
pub mod fw_status {
    /// Success
    pub const OK: u8 = 0x00;
    /// Check condition, sense data available
    pub const CHECK_CONDITION: u8 = 0x02;
    /// Target busy
    pub const BUSY: u8 = 0x08;
    /// Synthesised for physical disks hidden behind RAID channels
    pub const HIDDEN_DISK: u8 = 0xF0;
}

/// Command id used for commands without a command slot
pub const INTERNAL_CMD_ID: u8 = 0xFE;

// =============================================================================
// REGISTERS
// =============================================================================

/// Register offsets and values of both board families
pub mod regs {
    /// Quartz inbound doorbell (host to adapter)
    pub const INBOUND_DOORBELL: usize = 0x20;
    /// Quartz outbound doorbell (adapter to host)
    pub const OUTBOUND_DOORBELL: usize = 0x2C;
    /// Inbound doorbell bit: new command in the mailbox
    pub const DOORBELL_NEW_COMMAND: u32 = 0x1;
    /// Inbound doorbell bit: status area consumed
    pub const DOORBELL_ACK: u32 = 0x2;
    /// Outbound doorbell value meaning "completions posted"
    pub const OUTBOUND_VALID: u32 = 0x1000_1234;

    /// Port boards: command port
    pub const CMD_PORT: usize = 0x00;
    /// Port boards: acknowledge port (shared with the command port)
    pub const ACK_PORT: usize = 0x00;
    /// Port boards: interrupt enable toggle
    pub const TOGGLE_PORT: usize = 0x01;
    /// Port boards: first of four mailbox address ports
    pub const MBOX_PORT0: usize = 0x04;
    /// Port boards: interrupt status
    pub const INTR_PORT: usize = 0x0A;
    /// Port boards: mailbox region enable
    pub const ENABLE_MBOX_REGION: usize = 0x0B;

    /// Written to `CMD_PORT` to issue
    pub const ISSUE_BYTE: u8 = 0x10;
    /// Written to `ACK_PORT` to clear the interrupt
    pub const ACK_BYTE: u8 = 0x08;
    /// Written to `TOGGLE_PORT` to enable interrupts
    pub const ENABLE_INTR_BYTE: u8 = 0xC0;
    /// Written to `TOGGLE_PORT` to disable interrupts
    pub const DISABLE_INTR_BYTE: u8 = 0x00;
    /// `INTR_PORT` bit: interrupt raised by the adapter
    pub const VALID_INTR_BYTE: u8 = 0x40;
    /// Written to `ENABLE_MBOX_REGION`
    pub const ENABLE_MBOX_BYTE: u8 = 0x00;
}

// =============================================================================
// WIRE LAYOUT
// =============================================================================

/// Size of the outgoing command image
pub const MBOX_SIZE: usize = 16;

/// Mailbox field offsets
pub mod offset {
    /// Command byte
    pub const CMD: usize = 0x00;
    /// Command id
    pub const CMDID: usize = 0x01;
    /// Sector count (u16); also channel/sub-opcode and parameter bytes
    pub const NUMSECTORS: usize = 0x02;
    /// Logical block address (u32)
    pub const LBA: usize = 0x04;
    /// Transfer address (u32)
    pub const XFERADDR: usize = 0x08;
    /// Logical drive
    pub const LOGDRV: usize = 0x0C;
    /// Scatter-gather element count
    pub const NUMSGELEMENTS: usize = 0x0D;
    /// Busy flag
    pub const BUSY: usize = 0x0F;
    /// Number of completed ids posted
    pub const NUMSTATUS: usize = 0x10;
    /// Status of the posted batch
    pub const STATUS: usize = 0x11;
    /// Completed command ids
    pub const COMPLETED: usize = 0x12;
    /// Quartz polled-completion handshake
    pub const POLL: usize = COMPLETED + crate::MAX_FIRMWARE_STATUS;
    /// Quartz polled-completion acknowledgement
    pub const ACK: usize = POLL + 1;
}

/// Value firmware writes to `POLL` when a polled command finished
pub const POLL_DONE: u8 = 0x77;

/// Sentinel for "not yet written"
const NOT_POSTED: u8 = 0xFF;

/// Mailbox offset inside its coherent region, leaving room for the extension
const MBOX_BASE: usize = 16;

/// Offset of `xfer_segment_lo` inside the region
const EXT_LO: usize = MBOX_BASE - 8;

/// Offset of `xfer_segment_hi` inside the region
const EXT_HI: usize = MBOX_BASE - 4;

/// Bytes allocated for the mailbox region
pub const REGION_SIZE: usize = 96;

const_assert!(offset::ACK == 0x41);
const_assert!(MBOX_BASE + offset::ACK < REGION_SIZE);
const_assert!(MBOX_BASE % 16 == 0);

// =============================================================================
// COMMAND VARIANTS
// =============================================================================

/// A decoded mailbox command
///
/// The firmware overlays several layouts on the same 16 bytes; each variant
/// is encoded to the wire image only when it is handed to the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxCommand {
    /// Slot carries nothing
    Idle,
    /// Logical drive block I/O
    ReadWrite {
        /// `LREAD`, `LWRITE`, `LREAD64` or `LWRITE64`
        opcode: u8,
        /// Blocks
        sectors: u16,
        /// First block
        lba: u32,
        /// Data or SG list address
        xfer: u32,
        /// Logical drive number
        logdrv: u8,
        /// SG elements at `xfer`, zero for a direct buffer
        sg_count: u8,
    },
    /// Pass-through; `xfer` is the descriptor address
    PassThru {
        /// `PASSTHRU`, `PASSTHRU64` or `EXTPASSTHRU`
        opcode: u8,
        /// Descriptor address
        xfer: u32,
    },
    /// Adapter management command
    Admin {
        /// Command family
        opcode: u8,
        /// Sub-opcode or channel
        subop: u8,
        /// Parameter (logical drive, page)
        param: u8,
        /// Data buffer address
        xfer: u32,
    },
    /// Caller-supplied image, sent unchanged
    Raw([u8; MBOX_SIZE]),
}

impl MailboxCommand {
    /// The command byte
    pub fn opcode(&self) -> u8 {
        match *self {
            MailboxCommand::Idle => 0,
            MailboxCommand::ReadWrite { opcode, .. }
            | MailboxCommand::PassThru { opcode, .. }
            | MailboxCommand::Admin { opcode, .. } => opcode,
            MailboxCommand::Raw(image) => image[offset::CMD],
        }
    }

    /// Whether the transfer address must move into the 64-bit extension
    pub fn uses_xfer_extension(&self) -> bool {
        matches!(self.opcode(), cmd::LREAD64 | cmd::LWRITE64)
    }

    /// Logical drive field of block I/O commands
    pub fn logical_drive_mut(&mut self) -> Option<&mut u8> {
        match self {
            MailboxCommand::ReadWrite { logdrv, .. } => Some(logdrv),
            _ => None,
        }
    }

    /// Encode the 16-byte wire image; `cmdid` and `busy` are filled at issue
    pub fn encode(&self) -> [u8; MBOX_SIZE] {
        let mut image = [0u8; MBOX_SIZE];
        match *self {
            MailboxCommand::Idle => {}
            MailboxCommand::ReadWrite { opcode, sectors, lba, xfer, logdrv, sg_count } => {
                image[offset::CMD] = opcode;
                image[offset::NUMSECTORS..offset::NUMSECTORS + 2]
                    .copy_from_slice(&sectors.to_le_bytes());
                image[offset::LBA..offset::LBA + 4].copy_from_slice(&lba.to_le_bytes());
                image[offset::XFERADDR..offset::XFERADDR + 4].copy_from_slice(&xfer.to_le_bytes());
                image[offset::LOGDRV] = logdrv;
                image[offset::NUMSGELEMENTS] = sg_count;
            }
            MailboxCommand::PassThru { opcode, xfer } => {
                image[offset::CMD] = opcode;
                image[offset::XFERADDR..offset::XFERADDR + 4].copy_from_slice(&xfer.to_le_bytes());
            }
            MailboxCommand::Admin { opcode, subop, param, xfer } => {
                image[offset::CMD] = opcode;
                image[offset::NUMSECTORS] = subop;
                image[offset::NUMSECTORS + 1] = param;
                image[offset::XFERADDR..offset::XFERADDR + 4].copy_from_slice(&xfer.to_le_bytes());
            }
            MailboxCommand::Raw(raw) => image = raw,
        }
        image
    }
}

/// Decoded view of a wire image, as the firmware sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxImage {
    /// Command byte
    pub cmd: u8,
    /// Command id
    pub cmdid: u8,
    /// Sector count
    pub numsectors: u16,
    /// LBA
    pub lba: u32,
    /// Transfer address
    pub xferaddr: u32,
    /// Logical drive
    pub logdrv: u8,
    /// SG element count
    pub numsgelements: u8,
    /// Busy flag
    pub busy: u8,
}

impl MailboxImage {
    /// Decode a wire image
    pub fn decode(image: &[u8; MBOX_SIZE]) -> Self {
        let le32 = |at: usize| {
            u32::from_le_bytes([image[at], image[at + 1], image[at + 2], image[at + 3]])
        };
        Self {
            cmd: image[offset::CMD],
            cmdid: image[offset::CMDID],
            numsectors: u16::from_le_bytes([image[offset::NUMSECTORS], image[offset::NUMSECTORS + 1]]),
            lba: le32(offset::LBA),
            xferaddr: le32(offset::XFERADDR),
            logdrv: image[offset::LOGDRV],
            numsgelements: image[offset::NUMSGELEMENTS],
            busy: image[offset::BUSY],
        }
    }
}

// =============================================================================
// SHARED REGION
// =============================================================================

/// The mailbox and status area in coherent memory
#[derive(Debug)]
pub(crate) struct MailboxRegion {
    region: CoherentRegion,
}

impl MailboxRegion {
    /// Allocate the region and mark the status area as unposted
    pub fn alloc<D: DmaMapper>(dma: &D) -> MegaResult<Self> {
        let region = dma.alloc_coherent(REGION_SIZE)?;
        let mailbox = Self { region };
        mailbox.invalidate_numstatus(dma);
        mailbox.invalidate_completed(dma);
        Ok(mailbox)
    }

    /// Release the region
    pub fn free<D: DmaMapper>(self, dma: &D) {
        dma.free_coherent(self.region);
    }

    /// Bus address of the mailbox proper
    pub fn phys(&self) -> PhysAddr {
        self.region.phys_at(MBOX_BASE)
    }

    /// Whether the firmware still holds the previous command
    pub fn is_busy<D: DmaMapper>(&self, dma: &D) -> bool {
        dma.read_u8(&self.region, MBOX_BASE + offset::BUSY) != 0
    }

    /// Copy a command image and its transfer extension into the mailbox
    pub fn post<D: DmaMapper>(&self, dma: &D, image: &[u8; MBOX_SIZE], extension: u64) {
        dma.write_u32(&self.region, EXT_LO, extension as u32);
        dma.write_u32(&self.region, EXT_HI, (extension >> 32) as u32);
        dma.write(&self.region, MBOX_BASE, image);
    }

    /// Completed-id count, `None` while the firmware has not posted it
    pub fn numstatus<D: DmaMapper>(&self, dma: &D) -> Option<u8> {
        posted(dma.read_u8(&self.region, MBOX_BASE + offset::NUMSTATUS))
    }

    /// Mark the count as consumed
    pub fn invalidate_numstatus<D: DmaMapper>(&self, dma: &D) {
        dma.write_u8(&self.region, MBOX_BASE + offset::NUMSTATUS, NOT_POSTED);
    }

    /// Status of the posted batch
    pub fn status<D: DmaMapper>(&self, dma: &D) -> u8 {
        dma.read_u8(&self.region, MBOX_BASE + offset::STATUS)
    }

    /// Mark the status as consumed
    pub fn invalidate_status<D: DmaMapper>(&self, dma: &D) {
        dma.write_u8(&self.region, MBOX_BASE + offset::STATUS, NOT_POSTED);
    }

    /// Completed id in slot `index`, `None` while not yet posted
    pub fn completed<D: DmaMapper>(&self, dma: &D, index: usize) -> Option<u8> {
        posted(dma.read_u8(&self.region, MBOX_BASE + offset::COMPLETED + index))
    }

    /// Mark one completed slot as consumed
    pub fn invalidate_completed_slot<D: DmaMapper>(&self, dma: &D, index: usize) {
        dma.write_u8(&self.region, MBOX_BASE + offset::COMPLETED + index, NOT_POSTED);
    }

    /// Mark every completed slot as consumed
    pub fn invalidate_completed<D: DmaMapper>(&self, dma: &D) {
        dma.write(
            &self.region,
            MBOX_BASE + offset::COMPLETED,
            &[NOT_POSTED; MAX_FIRMWARE_STATUS],
        );
    }

    /// Quartz polled-completion byte
    pub fn poll<D: DmaMapper>(&self, dma: &D) -> u8 {
        dma.read_u8(&self.region, MBOX_BASE + offset::POLL)
    }

    /// Set the Quartz handshake bytes
    pub fn set_handshake<D: DmaMapper>(&self, dma: &D, poll: u8, ack: u8) {
        dma.write(&self.region, MBOX_BASE + offset::POLL, &[poll, ack]);
    }
}

fn posted(value: u8) -> Option<u8> {
    (value != NOT_POSTED).then_some(value)
}
