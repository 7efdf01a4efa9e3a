//! # Pass-Through Descriptors and Scatter-Gather Elements
//!
//! Commands the firmware does not interpret itself travel as a raw CDB in a
//! descriptor placed in coherent memory; the mailbox only carries the
//! descriptor's address. Two layouts exist: the standard one with a 10-byte
//! CDB and the extended one with a 16-byte CDB.

use static_assertions::const_assert_eq;

/// CDB bytes in a standard descriptor
pub const MAX_CDB_LEN: usize = 10;

/// CDB bytes in an extended descriptor
pub const MAX_EXT_CDB_LEN: usize = 16;

/// Sense bytes the descriptor can hold
pub const MAX_REQ_SENSE_LEN: usize = 32;

/// Size of a standard descriptor
pub const PASSTHRU_SIZE: usize = 60;

/// Size of an extended descriptor
pub const EXT_PASSTHRU_SIZE: usize = 68;

/// Size of a 32-bit SG element
pub const SG32_SIZE: usize = 8;

/// Size of a 64-bit SG element
pub const SG64_SIZE: usize = 12;

const TIMEOUT_MASK: u8 = 0x07;
const ARS_BIT: u8 = 1 << 3;
const LOGICAL_BIT: u8 = 1 << 7;

/// Offset of the sense area in a standard descriptor
pub const PASSTHRU_SENSE_OFFSET: usize = 18;

/// Offset of the sense area in an extended descriptor
pub const EXT_PASSTHRU_SENSE_OFFSET: usize = 27;

fn flags_byte(timeout: u8, ars: bool, islogical: bool) -> u8 {
    let mut byte = timeout & TIMEOUT_MASK;
    if ars {
        byte |= ARS_BIT;
    }
    if islogical {
        byte |= LOGICAL_BIT;
    }
    byte
}

fn le32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

// =============================================================================
// STANDARD DESCRIPTOR
// =============================================================================

/// Standard pass-through descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassThru {
    /// Timeout class (0: 6s, 1: 60s, 2: 10min, 3: none)
    pub timeout: u8,
    /// Auto request sense
    pub ars: bool,
    /// Addressed to a logical drive
    pub islogical: bool,
    /// Logical drive, or LUN for physical devices
    pub logdrv: u8,
    /// Channel (zero on 40LD firmware, which packs it into `target`)
    pub channel: u8,
    /// Target id
    pub target: u8,
    /// Tagged queueing tag
    pub queuetag: u8,
    /// Tagged queueing action
    pub queueaction: u8,
    /// CDB
    pub cdb: [u8; MAX_CDB_LEN],
    /// Valid bytes in `cdb`
    pub cdblen: u8,
    /// Sense bytes requested
    pub reqsenselen: u8,
    /// Sense data returned by the firmware
    pub reqsensearea: [u8; MAX_REQ_SENSE_LEN],
    /// SG elements at `dataxferaddr`, zero for a direct buffer
    pub numsgelements: u8,
    /// SCSI status returned by the device
    pub scsistatus: u8,
    /// Data or SG list address
    pub dataxferaddr: u32,
    /// Data length
    pub dataxferlen: u32,
}

impl Default for PassThru {
    fn default() -> Self {
        Self {
            timeout: 0,
            ars: false,
            islogical: false,
            logdrv: 0,
            channel: 0,
            target: 0,
            queuetag: 0,
            queueaction: 0,
            cdb: [0; MAX_CDB_LEN],
            cdblen: 0,
            reqsenselen: 0,
            reqsensearea: [0; MAX_REQ_SENSE_LEN],
            numsgelements: 0,
            scsistatus: 0,
            dataxferaddr: 0,
            dataxferlen: 0,
        }
    }
}

impl PassThru {
    /// Encode to the wire layout
    pub fn encode(&self) -> [u8; PASSTHRU_SIZE] {
        let mut out = [0u8; PASSTHRU_SIZE];
        out[0] = flags_byte(self.timeout, self.ars, self.islogical);
        out[1] = self.logdrv;
        out[2] = self.channel;
        out[3] = self.target;
        out[4] = self.queuetag;
        out[5] = self.queueaction;
        out[6..16].copy_from_slice(&self.cdb);
        out[16] = self.cdblen;
        out[17] = self.reqsenselen;
        out[18..50].copy_from_slice(&self.reqsensearea);
        out[50] = self.numsgelements;
        out[51] = self.scsistatus;
        out[52..56].copy_from_slice(&self.dataxferaddr.to_le_bytes());
        out[56..60].copy_from_slice(&self.dataxferlen.to_le_bytes());
        out
    }

    /// Decode from the wire layout
    pub fn decode(bytes: &[u8; PASSTHRU_SIZE]) -> Self {
        let mut cdb = [0u8; MAX_CDB_LEN];
        cdb.copy_from_slice(&bytes[6..16]);
        let mut reqsensearea = [0u8; MAX_REQ_SENSE_LEN];
        reqsensearea.copy_from_slice(&bytes[18..50]);
        Self {
            timeout: bytes[0] & TIMEOUT_MASK,
            ars: bytes[0] & ARS_BIT != 0,
            islogical: bytes[0] & LOGICAL_BIT != 0,
            logdrv: bytes[1],
            channel: bytes[2],
            target: bytes[3],
            queuetag: bytes[4],
            queueaction: bytes[5],
            cdb,
            cdblen: bytes[16],
            reqsenselen: bytes[17],
            reqsensearea,
            numsgelements: bytes[50],
            scsistatus: bytes[51],
            dataxferaddr: le32(bytes, 52),
            dataxferlen: le32(bytes, 56),
        }
    }
}

// =============================================================================
// EXTENDED DESCRIPTOR
// =============================================================================

/// Extended pass-through descriptor for CDBs up to 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtPassThru {
    /// Timeout class
    pub timeout: u8,
    /// Auto request sense
    pub ars: bool,
    /// Addressed to a logical drive
    pub islogical: bool,
    /// Logical drive, or LUN for physical devices
    pub logdrv: u8,
    /// Channel
    pub channel: u8,
    /// Target id
    pub target: u8,
    /// Valid bytes in `cdb`
    pub cdblen: u8,
    /// CDB
    pub cdb: [u8; MAX_EXT_CDB_LEN],
    /// SG elements at `dataxferaddr`
    pub numsgelements: u8,
    /// SCSI status returned by the device
    pub status: u8,
    /// Sense bytes requested
    pub reqsenselen: u8,
    /// Sense data returned by the firmware
    pub reqsensearea: [u8; MAX_REQ_SENSE_LEN],
    /// Data or SG list address
    pub dataxferaddr: u32,
    /// Data length
    pub dataxferlen: u32,
}

impl ExtPassThru {
    /// Encode to the wire layout
    pub fn encode(&self) -> [u8; EXT_PASSTHRU_SIZE] {
        let mut out = [0u8; EXT_PASSTHRU_SIZE];
        out[0] = flags_byte(self.timeout, self.ars, self.islogical);
        out[1] = self.logdrv;
        out[2] = self.channel;
        out[3] = self.target;
        out[6] = self.cdblen;
        out[8..24].copy_from_slice(&self.cdb);
        out[24] = self.numsgelements;
        out[25] = self.status;
        out[26] = self.reqsenselen;
        out[27..59].copy_from_slice(&self.reqsensearea);
        out[60..64].copy_from_slice(&self.dataxferaddr.to_le_bytes());
        out[64..68].copy_from_slice(&self.dataxferlen.to_le_bytes());
        out
    }

    /// Decode from the wire layout
    pub fn decode(bytes: &[u8; EXT_PASSTHRU_SIZE]) -> Self {
        let mut cdb = [0u8; MAX_EXT_CDB_LEN];
        cdb.copy_from_slice(&bytes[8..24]);
        let mut reqsensearea = [0u8; MAX_REQ_SENSE_LEN];
        reqsensearea.copy_from_slice(&bytes[27..59]);
        Self {
            timeout: bytes[0] & TIMEOUT_MASK,
            ars: bytes[0] & ARS_BIT != 0,
            islogical: bytes[0] & LOGICAL_BIT != 0,
            logdrv: bytes[1],
            channel: bytes[2],
            target: bytes[3],
            cdblen: bytes[6],
            cdb,
            numsgelements: bytes[24],
            status: bytes[25],
            reqsenselen: bytes[26],
            reqsensearea,
            dataxferaddr: le32(bytes, 60),
            dataxferlen: le32(bytes, 64),
        }
    }
}

const_assert_eq!(PASSTHRU_SENSE_OFFSET + MAX_REQ_SENSE_LEN, 50);
const_assert_eq!(EXT_PASSTHRU_SENSE_OFFSET + MAX_REQ_SENSE_LEN, 59);

// =============================================================================
// SCATTER-GATHER ELEMENTS
// =============================================================================

/// Encode a 32-bit SG element
pub fn encode_sg32(addr: u32, len: u32) -> [u8; SG32_SIZE] {
    let mut out = [0u8; SG32_SIZE];
    out[..4].copy_from_slice(&addr.to_le_bytes());
    out[4..].copy_from_slice(&len.to_le_bytes());
    out
}

/// Encode a 64-bit SG element
pub fn encode_sg64(addr: u64, len: u32) -> [u8; SG64_SIZE] {
    let mut out = [0u8; SG64_SIZE];
    out[..8].copy_from_slice(&addr.to_le_bytes());
    out[8..].copy_from_slice(&len.to_le_bytes());
    out
}
