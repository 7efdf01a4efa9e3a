//! # SCSI Requests
//!
//! A request is created by the storage stack, handed to the adapter by
//! value and given back through its completion callback exactly once.

use crate::cdb::MAX_CDB_LENGTH;
use crate::{MegaError, MegaResult};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use helix_hal::dma::DmaDirection;

/// Sense buffer size carried by every request
pub const SENSE_BUFFER_SIZE: usize = 16;

/// Driver byte flag: sense data is valid
pub const DRIVER_SENSE: u8 = 0x08;

/// Completion callback
pub type CompletionFn = Box<dyn FnOnce(ScsiRequest) + Send>;

// =============================================================================
// REQUEST ID
// =============================================================================

/// Unique identifier for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Generate a new unique request ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

// =============================================================================
// RESULT
// =============================================================================

/// Host byte of a completion result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostByte {
    /// No error
    Ok = 0x00,
    /// Device is gone
    NoConnect = 0x01,
    /// Bus stayed busy
    BusBusy = 0x02,
    /// Timed out
    TimeOut = 0x03,
    /// Bad target or rejected request
    BadTarget = 0x04,
    /// Aborted
    Abort = 0x05,
    /// Parity error
    Parity = 0x06,
    /// Internal driver error
    Error = 0x07,
    /// Swept up by a reset
    Reset = 0x08,
}

impl HostByte {
    /// Convert from raw value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(HostByte::Ok),
            0x01 => Some(HostByte::NoConnect),
            0x02 => Some(HostByte::BusBusy),
            0x03 => Some(HostByte::TimeOut),
            0x04 => Some(HostByte::BadTarget),
            0x05 => Some(HostByte::Abort),
            0x06 => Some(HostByte::Parity),
            0x07 => Some(HostByte::Error),
            0x08 => Some(HostByte::Reset),
            _ => None,
        }
    }
}

/// Packed completion result: `driver << 24 | host << 16 | msg << 8 | status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScsiResult(u32);

impl ScsiResult {
    /// Result with a host byte and a status byte
    pub const fn new(host: HostByte, status: u8) -> Self {
        Self(((host as u32) << 16) | status as u32)
    }

    /// Plain host-byte outcome
    pub const fn host_only(host: HostByte) -> Self {
        Self::new(host, 0)
    }

    /// Build from raw value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Add driver byte flags
    pub const fn with_driver(self, driver: u8) -> Self {
        Self(self.0 | ((driver as u32) << 24))
    }

    /// Host byte
    pub fn host(self) -> Option<HostByte> {
        HostByte::from_u8((self.0 >> 16) as u8)
    }

    /// Driver byte
    pub const fn driver(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Status byte
    pub const fn status(self) -> u8 {
        self.0 as u8
    }

    /// Whether the command succeeded outright
    pub const fn is_good(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ScsiResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

// =============================================================================
// DATA BUFFER
// =============================================================================

/// Data attached to a request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DataBuffer {
    /// No data phase
    #[default]
    None,
    /// One contiguous buffer
    Single(Vec<u8>),
    /// Scatter list
    Scatter(Vec<Vec<u8>>),
}

impl DataBuffer {
    /// Total length in bytes
    pub fn len(&self) -> usize {
        match self {
            DataBuffer::None => 0,
            DataBuffer::Single(buf) => buf.len(),
            DataBuffer::Scatter(list) => list.iter().map(Vec::len).sum(),
        }
    }

    /// Whether there is no data
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of scatter segments, `None` for a contiguous buffer
    pub fn segment_count(&self) -> Option<usize> {
        match self {
            DataBuffer::Scatter(list) => Some(list.len()),
            _ => None,
        }
    }

    /// First data byte
    pub fn first_byte(&self) -> Option<u8> {
        match self {
            DataBuffer::None => None,
            DataBuffer::Single(buf) => buf.first().copied(),
            DataBuffer::Scatter(list) => list.iter().find_map(|seg| seg.first().copied()),
        }
    }

    /// Zero the first `len` bytes
    pub fn zero(&mut self, len: usize) {
        let mut left = len;
        self.for_each_segment(|seg| {
            let n = seg.len().min(left);
            seg[..n].fill(0);
            left -= n;
            left > 0
        });
    }

    /// Copy `data` into the start of the buffer, truncating to its length
    pub fn write_prefix(&mut self, data: &[u8]) -> usize {
        let mut copied = 0;
        self.for_each_segment(|seg| {
            let n = seg.len().min(data.len() - copied);
            seg[..n].copy_from_slice(&data[copied..copied + n]);
            copied += n;
            copied < data.len()
        });
        copied
    }

    /// Borrow every segment in order
    pub fn segments(&self) -> Vec<&[u8]> {
        match self {
            DataBuffer::None => Vec::new(),
            DataBuffer::Single(buf) => alloc::vec![buf.as_slice()],
            DataBuffer::Scatter(list) => list.iter().map(Vec::as_slice).collect(),
        }
    }

    fn for_each_segment(&mut self, mut f: impl FnMut(&mut [u8]) -> bool) {
        match self {
            DataBuffer::None => {}
            DataBuffer::Single(buf) => {
                f(buf.as_mut_slice());
            }
            DataBuffer::Scatter(list) => {
                for seg in list.iter_mut() {
                    if !f(seg.as_mut_slice()) {
                        break;
                    }
                }
            }
        }
    }
}

// =============================================================================
// REQUEST
// =============================================================================

/// A SCSI command addressed to one adapter
pub struct ScsiRequest {
    id: RequestId,
    /// Host channel
    pub channel: u8,
    /// Target id
    pub target: u8,
    /// Logical unit
    pub lun: u8,
    cdb: [u8; MAX_CDB_LENGTH],
    cdb_len: u8,
    /// Data buffer
    pub data: DataBuffer,
    /// Direction of the data phase
    pub direction: DmaDirection,
    result: ScsiResult,
    sense: [u8; SENSE_BUFFER_SIZE],
    done: Option<CompletionFn>,
}

impl ScsiRequest {
    /// Create a request; `done` runs once when the adapter finishes with it
    pub fn new<F>(
        channel: u8,
        target: u8,
        lun: u8,
        cdb: &[u8],
        data: DataBuffer,
        done: F,
    ) -> MegaResult<Self>
    where
        F: FnOnce(ScsiRequest) + Send + 'static,
    {
        if cdb.is_empty() || cdb.len() > MAX_CDB_LENGTH {
            return Err(MegaError::InvalidParameter);
        }
        let mut bytes = [0u8; MAX_CDB_LENGTH];
        bytes[..cdb.len()].copy_from_slice(cdb);
        let direction = if data.is_empty() {
            DmaDirection::None
        } else {
            DmaDirection::Bidirectional
        };
        Ok(Self {
            id: RequestId::new(),
            channel,
            target,
            lun,
            cdb: bytes,
            cdb_len: cdb.len() as u8,
            data,
            direction,
            result: ScsiResult::default(),
            sense: [0; SENSE_BUFFER_SIZE],
            done: Some(Box::new(done)),
        })
    }

    /// Set the data direction
    pub fn with_direction(mut self, direction: DmaDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Request identifier
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// CDB bytes
    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_len as usize]
    }

    /// SCSI opcode
    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }

    /// Completion result
    pub fn result(&self) -> ScsiResult {
        self.result
    }

    /// Sense data
    pub fn sense(&self) -> &[u8; SENSE_BUFFER_SIZE] {
        &self.sense
    }

    pub(crate) fn set_result(&mut self, result: ScsiResult) {
        self.result = result;
    }

    pub(crate) fn sense_mut(&mut self) -> &mut [u8; SENSE_BUFFER_SIZE] {
        &mut self.sense
    }

    /// Hand the request back to its owner
    pub(crate) fn finish(mut self) {
        if let Some(done) = self.done.take() {
            done(self);
        }
    }
}

impl fmt::Debug for ScsiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScsiRequest")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("target", &self.target)
            .field("lun", &self.lun)
            .field("cdb", &self.cdb())
            .field("data_len", &self.data.len())
            .field("result", &self.result)
            .finish()
    }
}
