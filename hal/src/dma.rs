//! # DMA Mapping Abstraction
//!
//! Drivers hand two kinds of memory to a bus master:
//!
//! - **Coherent regions** owned by the driver for its whole lifetime
//!   (mailboxes, descriptor tables, bounce buffers). The CPU and the device
//!   see each other's writes without explicit syncs, so they are accessed
//!   through [`DmaMapper::read`] and [`DmaMapper::write`] rather than through
//!   a Rust reference.
//! - **Streaming mappings** of caller buffers, valid between `map_*` and the
//!   matching `unmap_*`.

use crate::{HalResult, PhysAddr};
use alloc::vec::Vec;

/// Direction of a DMA transfer, seen from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Memory is read by the device
    ToDevice,
    /// Memory is written by the device
    FromDevice,
    /// Either way
    Bidirectional,
    /// No data moves
    None,
}

/// A driver-owned, device-visible memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoherentRegion {
    phys: PhysAddr,
    len: usize,
}

impl CoherentRegion {
    /// Describe a region; only DMA mapper implementations create these
    pub const fn new(phys: PhysAddr, len: usize) -> Self {
        Self { phys, len }
    }

    /// Bus address of the first byte
    pub const fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Bus address of `offset`
    pub const fn phys_at(&self, offset: usize) -> PhysAddr {
        self.phys.add(offset as u64)
    }

    /// Length in bytes
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One mapped piece of a scatter list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    /// Bus address
    pub addr: PhysAddr,
    /// Length in bytes
    pub len: u32,
}

/// DMA mapping services of the bus an adapter sits on
pub trait DmaMapper: Send + Sync {
    /// Allocate a zeroed coherent region
    fn alloc_coherent(&self, len: usize) -> HalResult<CoherentRegion>;

    /// Release a coherent region
    fn free_coherent(&self, region: CoherentRegion);

    /// Copy `data` into the region at `offset`
    fn write(&self, region: &CoherentRegion, offset: usize, data: &[u8]);

    /// Copy bytes out of the region at `offset`
    fn read(&self, region: &CoherentRegion, offset: usize, out: &mut [u8]);

    /// Map a single contiguous buffer for streaming DMA
    fn map_single(&self, buf: &[u8], direction: DmaDirection) -> HalResult<PhysAddr>;

    /// Undo [`DmaMapper::map_single`]
    fn unmap_single(&self, addr: PhysAddr, len: usize, direction: DmaDirection);

    /// Map every buffer of a scatter list
    fn map_sg(&self, segments: &[&[u8]], direction: DmaDirection) -> HalResult<Vec<DmaSegment>>;

    /// Undo [`DmaMapper::map_sg`]
    fn unmap_sg(&self, segments: &[DmaSegment], direction: DmaDirection);

    /// Read one byte of a coherent region
    fn read_u8(&self, region: &CoherentRegion, offset: usize) -> u8 {
        let mut b = [0u8; 1];
        self.read(region, offset, &mut b);
        b[0]
    }

    /// Write one byte of a coherent region
    fn write_u8(&self, region: &CoherentRegion, offset: usize, value: u8) {
        self.write(region, offset, &[value]);
    }

    /// Write a little-endian 32-bit value into a coherent region
    fn write_u32(&self, region: &CoherentRegion, offset: usize, value: u32) {
        self.write(region, offset, &value.to_le_bytes());
    }

    /// Read a little-endian 32-bit value from a coherent region
    fn read_u32(&self, region: &CoherentRegion, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        self.read(region, offset, &mut b);
        u32::from_le_bytes(b)
    }
}
