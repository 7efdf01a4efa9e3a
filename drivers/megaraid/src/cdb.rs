//! # SCSI Command Descriptor Blocks
//!
//! The subset of SCSI the adapter firmware interprets itself: block I/O to
//! logical drives, plus the discovery commands the host issues while
//! scanning.

// =============================================================================
// SCSI OPERATION CODES
// =============================================================================

/// SCSI operation codes
pub mod opcode {
    /// Test Unit Ready
    pub const TEST_UNIT_READY: u8 = 0x00;
    /// Read (6)
    pub const READ_6: u8 = 0x08;
    /// Write (6)
    pub const WRITE_6: u8 = 0x0A;
    /// Inquiry
    pub const INQUIRY: u8 = 0x12;
    /// Mode Sense (6)
    pub const MODE_SENSE_6: u8 = 0x1A;
    /// Read Capacity (10)
    pub const READ_CAPACITY_10: u8 = 0x25;
    /// Read (10)
    pub const READ_10: u8 = 0x28;
    /// Write (10)
    pub const WRITE_10: u8 = 0x2A;
    /// Read (12)
    pub const READ_12: u8 = 0xA8;
    /// Write (12)
    pub const WRITE_12: u8 = 0xAA;
}

/// SCSI status codes
pub mod status {
    /// Good
    pub const GOOD: u8 = 0x00;
    /// Check Condition
    pub const CHECK_CONDITION: u8 = 0x02;
}

/// Sense keys the driver synthesises
pub mod sense_key {
    /// Aborted Command
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

/// Fixed-format current sense response code
pub const SENSE_RESPONSE_CURRENT: u8 = 0x70;

/// Peripheral device type of a direct-access block device
pub const PERIPHERAL_DIRECT_ACCESS: u8 = 0x00;

/// Maximum CDB length accepted from the host
pub const MAX_CDB_LENGTH: usize = 16;

// =============================================================================
// READ / WRITE DECODING
// =============================================================================

/// Block transfer described by a READ or WRITE CDB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTransfer {
    /// Whether data flows to the device
    pub write: bool,
    /// First logical block
    pub lba: u32,
    /// Blocks to transfer
    pub count: u32,
}

/// Whether `op` is one of the 6/10/12-byte READ or WRITE opcodes
pub const fn is_read_write(op: u8) -> bool {
    matches!(
        op,
        opcode::READ_6
            | opcode::WRITE_6
            | opcode::READ_10
            | opcode::WRITE_10
            | opcode::READ_12
            | opcode::WRITE_12
    )
}

/// Decode LBA and block count of a READ/WRITE CDB
///
/// Returns `None` for other opcodes or a CDB shorter than its opcode's
/// group requires.
pub fn decode_block_transfer(cdb: &[u8]) -> Option<BlockTransfer> {
    let op = *cdb.first()?;
    let be32 = |at: usize| -> u32 {
        u32::from_be_bytes([cdb[at], cdb[at + 1], cdb[at + 2], cdb[at + 3]])
    };
    match op {
        opcode::READ_6 | opcode::WRITE_6 if cdb.len() >= 6 => Some(BlockTransfer {
            write: op == opcode::WRITE_6,
            lba: (u32::from(cdb[1] & 0x1F) << 16) | (u32::from(cdb[2]) << 8) | u32::from(cdb[3]),
            count: u32::from(cdb[4]),
        }),
        opcode::READ_10 | opcode::WRITE_10 if cdb.len() >= 10 => Some(BlockTransfer {
            write: op == opcode::WRITE_10,
            lba: be32(2),
            count: (u32::from(cdb[7]) << 8) | u32::from(cdb[8]),
        }),
        opcode::READ_12 | opcode::WRITE_12 if cdb.len() >= 12 => Some(BlockTransfer {
            write: op == opcode::WRITE_12,
            lba: be32(2),
            count: be32(6),
        }),
        _ => None,
    }
}
