//! Simulated board for tests
//!
//! Implements the HAL traits over plain memory. The simulated firmware
//! fetches commands when the doorbell (or command port) is rung, answers
//! privileged commands on the spot while the interrupt line is masked, and
//! leaves interrupt-mode commands outstanding until the test completes them.

use crate::mailbox::{cmd, offset, regs, MailboxImage, MBOX_SIZE, POLL_DONE};
use crate::passthru::{PASSTHRU_SENSE_OFFSET, PASSTHRU_SIZE};
use crate::REQ_SENSE_LEN;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use helix_hal::dma::{CoherentRegion, DmaDirection, DmaMapper, DmaSegment};
use helix_hal::interrupts::{InterruptVector, IrqFlags, IrqLine};
use helix_hal::io::RegisterIo;
use helix_hal::time::Clock;
use helix_hal::{DeviceHal, HalError, HalResult, PhysAddr};
use spin::Mutex;

const DMA_BASE: u64 = 0x1000_0000;

// =============================================================================
// MEMORY
// =============================================================================

#[derive(Debug, Default)]
struct MemState {
    regions: BTreeMap<u64, Vec<u8>>,
    next: u64,
    streaming: usize,
    fail_maps: bool,
}

impl MemState {
    fn alloc(&mut self, len: usize) -> u64 {
        if self.next == 0 {
            self.next = DMA_BASE;
        }
        let base = PhysAddr::new(self.next).align_up(16).as_u64();
        self.next = base + len.max(1) as u64;
        self.regions.insert(base, alloc::vec![0; len]);
        base
    }

    fn locate(&mut self, phys: u64) -> Option<(&mut Vec<u8>, usize)> {
        let (&base, bytes) = self.regions.range_mut(..=phys).next_back()?;
        let at = (phys - base) as usize;
        (at < bytes.len()).then_some((bytes, at))
    }
}

/// Simulated bus memory
#[derive(Debug, Clone, Default)]
pub struct SimMemory {
    state: Arc<Mutex<MemState>>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coherent regions and streaming mappings still allocated
    pub fn live_regions(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// Streaming mappings still held
    pub fn live_mappings(&self) -> usize {
        self.state.lock().streaming
    }

    /// Make streaming mappings fail
    pub fn fail_maps(&self, fail: bool) {
        self.state.lock().fail_maps = fail;
    }

    /// Copy out of bus memory
    pub fn read_phys(&self, phys: u64, out: &mut [u8]) {
        let mut state = self.state.lock();
        if let Some((bytes, at)) = state.locate(phys) {
            let n = out.len().min(bytes.len() - at);
            out[..n].copy_from_slice(&bytes[at..at + n]);
        }
    }

    /// Copy into bus memory
    pub fn write_phys(&self, phys: u64, data: &[u8]) {
        let mut state = self.state.lock();
        if let Some((bytes, at)) = state.locate(phys) {
            let n = data.len().min(bytes.len() - at);
            bytes[at..at + n].copy_from_slice(&data[..n]);
        }
    }

    fn map(&self, buf: &[u8]) -> HalResult<PhysAddr> {
        let mut state = self.state.lock();
        if state.fail_maps {
            return Err(HalError::OutOfMemory);
        }
        let base = state.alloc(buf.len());
        if let Some(bytes) = state.regions.get_mut(&base) {
            bytes.copy_from_slice(buf);
        }
        state.streaming += 1;
        Ok(PhysAddr::new(base))
    }

    fn unmap(&self, addr: PhysAddr) {
        let mut state = self.state.lock();
        if state.regions.remove(&addr.as_u64()).is_some() {
            state.streaming -= 1;
        }
    }
}

impl DmaMapper for SimMemory {
    fn alloc_coherent(&self, len: usize) -> HalResult<CoherentRegion> {
        let base = self.state.lock().alloc(len);
        Ok(CoherentRegion::new(PhysAddr::new(base), len))
    }

    fn free_coherent(&self, region: CoherentRegion) {
        self.state.lock().regions.remove(&region.phys().as_u64());
    }

    fn write(&self, region: &CoherentRegion, offset: usize, data: &[u8]) {
        self.write_phys(region.phys_at(offset).as_u64(), data);
    }

    fn read(&self, region: &CoherentRegion, offset: usize, out: &mut [u8]) {
        self.read_phys(region.phys_at(offset).as_u64(), out);
    }

    fn map_single(&self, buf: &[u8], _direction: DmaDirection) -> HalResult<PhysAddr> {
        self.map(buf)
    }

    fn unmap_single(&self, addr: PhysAddr, _len: usize, _direction: DmaDirection) {
        self.unmap(addr);
    }

    fn map_sg(&self, segments: &[&[u8]], _direction: DmaDirection) -> HalResult<Vec<DmaSegment>> {
        let mut mapped = Vec::with_capacity(segments.len());
        for seg in segments {
            match self.map(seg) {
                Ok(addr) => mapped.push(DmaSegment { addr, len: seg.len() as u32 }),
                Err(err) => {
                    for seg in &mapped {
                        self.unmap(seg.addr);
                    }
                    return Err(err);
                }
            }
        }
        Ok(mapped)
    }

    fn unmap_sg(&self, segments: &[DmaSegment], _direction: DmaDirection) {
        for seg in segments {
            self.unmap(seg.addr);
        }
    }
}

// =============================================================================
// INTERRUPT LINE AND CLOCK
// =============================================================================

/// Simulated interrupt line
#[derive(Debug)]
pub struct SimIrq {
    enabled: AtomicBool,
}

impl IrqLine for SimIrq {
    fn vector(&self) -> InterruptVector {
        11
    }

    fn flags(&self) -> IrqFlags {
        IrqFlags::SHARED | IrqFlags::LEVEL
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Simulated clock; sleeps really sleep so other test threads can run
#[derive(Debug, Default)]
pub struct SimClock {
    ticks: AtomicU64,
    sleeps: AtomicUsize,
}

impl SimClock {
    pub fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Clock for SimClock {
    fn udelay(&self, us: u32) {
        self.ticks.fetch_add(u64::from(us), Ordering::SeqCst);
    }

    fn msleep(&self, ms: u32) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        self.ticks.fetch_add(u64::from(ms) * 1000, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

// =============================================================================
// FIRMWARE
// =============================================================================

/// A command as the firmware fetched it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fetched {
    pub image: [u8; MBOX_SIZE],
    pub extension: u64,
    pub decoded: MailboxImage,
    pub privileged: bool,
}

#[derive(Debug, Default)]
struct Firmware {
    quartz: bool,
    inbound: u32,
    outbound: u32,
    intr_port: u8,
    toggle: u8,
    mbox_port: [u8; 4],
    mailbox: Option<u64>,
    hold_busy: bool,
    fetched: Vec<Fetched>,
    outstanding: Vec<u8>,
    status: BTreeMap<(u8, u8), u8>,
    chnl_class: u8,
    bios: [u8; 16],
    passthru_data: Option<Vec<u8>>,
    passthru_sense: Option<[u8; REQ_SENSE_LEN]>,
}

impl Firmware {
    fn fetch(&mut self, mem: &SimMemory, irq_enabled: bool) {
        let Some(mailbox) = self.mailbox else {
            return;
        };
        let mut image = [0u8; MBOX_SIZE];
        mem.read_phys(mailbox, &mut image);
        let mut ext = [0u8; 8];
        mem.read_phys(mailbox - 8, &mut ext);
        if !self.hold_busy {
            mem.write_phys(mailbox + offset::BUSY as u64, &[0]);
        }

        let decoded = MailboxImage::decode(&image);
        self.fetched.push(Fetched {
            image,
            extension: u64::from_le_bytes(ext),
            decoded,
            privileged: !irq_enabled,
        });

        if matches!(decoded.cmd, cmd::PASSTHRU | cmd::PASSTHRU64) {
            let mut desc = [0u8; PASSTHRU_SIZE];
            mem.read_phys(u64::from(decoded.xferaddr), &mut desc);
            let data_addr = u32::from_le_bytes([desc[52], desc[53], desc[54], desc[55]]);
            if let Some(data) = &self.passthru_data {
                mem.write_phys(u64::from(data_addr), data);
            }
            if let Some(sense) = &self.passthru_sense {
                mem.write_phys(u64::from(decoded.xferaddr) + PASSTHRU_SENSE_OFFSET as u64, sense);
            }
        }

        if irq_enabled {
            self.outstanding.push(decoded.cmdid);
            return;
        }

        // Privileged commands finish before the doorbell write returns
        let key = (decoded.cmd, image[offset::NUMSECTORS]);
        let status = self.status.get(&key).copied().unwrap_or(0);
        if status == 0 {
            match decoded.cmd {
                cmd::CHNL_CLASS => mem.write_phys(u64::from(decoded.xferaddr), &[self.chnl_class]),
                cmd::BIOS_PVT_DATA => mem.write_phys(u64::from(decoded.xferaddr), &self.bios),
                _ => {}
            }
        }
        // Polled completions raise no interrupt on Quartz boards
        let raise = !self.quartz;
        self.post(mem, &[decoded.cmdid], status, raise);
        mem.write_phys(mailbox + offset::POLL as u64, &[POLL_DONE]);
    }

    fn post(&mut self, mem: &SimMemory, ids: &[u8], status: u8, raise: bool) {
        let Some(mailbox) = self.mailbox else {
            return;
        };
        mem.write_phys(mailbox + offset::STATUS as u64, &[status]);
        mem.write_phys(mailbox + offset::COMPLETED as u64, ids);
        mem.write_phys(mailbox + offset::NUMSTATUS as u64, &[ids.len() as u8]);
        if !raise {
            return;
        }
        if self.quartz {
            self.outbound = regs::OUTBOUND_VALID;
        } else {
            self.intr_port |= regs::VALID_INTR_BYTE;
        }
    }
}

/// Simulated register window
#[derive(Debug, Clone)]
pub struct SimRegs {
    fw: Arc<Mutex<Firmware>>,
    mem: SimMemory,
    irq: Arc<SimIrq>,
}

impl RegisterIo for SimRegs {
    fn read8(&self, offset: usize) -> u8 {
        let fw = self.fw.lock();
        match offset {
            regs::INTR_PORT => fw.intr_port,
            regs::TOGGLE_PORT => fw.toggle,
            _ => 0,
        }
    }

    fn write8(&self, offset: usize, value: u8) {
        let mut fw = self.fw.lock();
        match offset {
            regs::CMD_PORT if value == regs::ISSUE_BYTE => {
                fw.mailbox = Some(u64::from(u32::from_le_bytes(fw.mbox_port)));
                fw.fetch(&self.mem, self.irq.is_enabled());
            }
            regs::TOGGLE_PORT => fw.toggle = value,
            regs::INTR_PORT => fw.intr_port &= !value,
            port if (regs::MBOX_PORT0..regs::MBOX_PORT0 + 4).contains(&port) => {
                fw.mbox_port[port - regs::MBOX_PORT0] = value;
            }
            _ => {}
        }
    }

    fn read32(&self, offset: usize) -> u32 {
        let fw = self.fw.lock();
        match offset {
            regs::INBOUND_DOORBELL => fw.inbound,
            regs::OUTBOUND_DOORBELL => fw.outbound,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut fw = self.fw.lock();
        match offset {
            regs::INBOUND_DOORBELL => {
                if value & regs::DOORBELL_NEW_COMMAND != 0 {
                    fw.mailbox = Some(u64::from(value & !0xF));
                    fw.fetch(&self.mem, self.irq.is_enabled());
                }
                // Both the new-command and the acknowledge bit are consumed at once
                fw.inbound = 0;
            }
            regs::OUTBOUND_DOORBELL => fw.outbound &= !value,
            _ => {}
        }
    }
}

// =============================================================================
// HAL
// =============================================================================

/// Simulated adapter; clones share the same board
#[derive(Debug, Clone)]
pub struct SimHal {
    regs: SimRegs,
    clock: Arc<SimClock>,
}

impl SimHal {
    pub fn new(quartz: bool) -> Self {
        let fw = Firmware { quartz, chnl_class: 0x00, ..Firmware::default() };
        Self {
            regs: SimRegs {
                fw: Arc::new(Mutex::new(fw)),
                mem: SimMemory::new(),
                irq: Arc::new(SimIrq { enabled: AtomicBool::new(true) }),
            },
            clock: Arc::new(SimClock::default()),
        }
    }

    pub fn memory(&self) -> &SimMemory {
        &self.regs.mem
    }

    pub fn sim_clock(&self) -> &SimClock {
        &self.clock
    }

    /// Status returned by privileged command `(opcode, byte 2)`
    pub fn set_status(&self, opcode: u8, subop: u8, status: u8) {
        self.regs.fw.lock().status.insert((opcode, subop), status);
    }

    pub fn set_chnl_class(&self, class: u8) {
        self.regs.fw.lock().chnl_class = class;
    }

    pub fn set_bios(&self, raw: [u8; 16]) {
        self.regs.fw.lock().bios = raw;
    }

    /// Data the firmware writes for every following pass-through
    pub fn set_passthru_data(&self, data: &[u8]) {
        self.regs.fw.lock().passthru_data = Some(data.to_vec());
    }

    /// Sense the firmware writes for every following pass-through
    pub fn set_passthru_sense(&self, sense: [u8; REQ_SENSE_LEN]) {
        self.regs.fw.lock().passthru_sense = Some(sense);
    }

    /// Keep the mailbox busy flag set after fetching
    pub fn hold_busy(&self, hold: bool) {
        let mut fw = self.regs.fw.lock();
        fw.hold_busy = hold;
        if let (false, Some(mailbox)) = (hold, fw.mailbox) {
            self.regs.mem.write_phys(mailbox + offset::BUSY as u64, &[0]);
        }
    }

    /// Commands fetched so far
    pub fn fetched(&self) -> Vec<Fetched> {
        self.regs.fw.lock().fetched.clone()
    }

    /// Interrupt-mode commands fetched so far
    pub fn issued(&self) -> Vec<Fetched> {
        self.fetched().into_iter().filter(|f| !f.privileged).collect()
    }

    /// Command ids the firmware still holds
    pub fn outstanding(&self) -> Vec<u8> {
        self.regs.fw.lock().outstanding.clone()
    }

    /// Post a completion batch and raise the interrupt
    pub fn complete(&self, ids: &[u8], status: u8) {
        let mut fw = self.regs.fw.lock();
        fw.outstanding.retain(|id| !ids.contains(id));
        fw.post(&self.regs.mem, ids, status, true);
    }

    pub fn irq_enabled(&self) -> bool {
        self.regs.irq.is_enabled()
    }
}

impl DeviceHal for SimHal {
    type Regs = SimRegs;
    type Dma = SimMemory;
    type Irq = SimIrq;
    type Clock = SimClock;

    fn regs(&self) -> &SimRegs {
        &self.regs
    }

    fn dma(&self) -> &SimMemory {
        &self.regs.mem
    }

    fn irq(&self) -> &SimIrq {
        &self.regs.irq
    }

    fn clock(&self) -> &SimClock {
        &self.clock
    }

    fn name(&self) -> &'static str {
        "megaraid-sim"
    }
}
