//! # Adapter
//!
//! Per-adapter context: owns the mailbox, the command slots and every queue,
//! and exposes the operations the storage stack drives it with.
//!
//! ## Locking
//!
//! One `spin::Mutex` (the IO lock) covers the slot pool, the free, pending
//! and internal queues, the completed-request queue and the controller
//! flags, so moving a slot between queues is never split across two
//! critical sections. Completion callbacks run after the lock is dropped,
//! in the order requests reached the completed queue.

use crate::config::{AdapterConfig, BoardFlags, BootDevice, ChannelMap};
use crate::ioctl::CompletionSignal;
use crate::mailbox::{cmd, fw_status, regs, subop, MailboxCommand, MailboxRegion};
use crate::quiesce::QuiesceState;
use crate::request::{HostByte, RequestId, ScsiRequest, ScsiResult};
use crate::scb::{QueueKind, ScbOwner, ScbPool, ScbState};
use crate::{MegaError, MegaResult, MAX_COMMANDS, MAX_LOGICAL_DRIVES_40LD};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use helix_hal::dma::{CoherentRegion, DmaMapper};
use helix_hal::interrupts::IrqLine;
use helix_hal::io::RegisterIo;
use helix_hal::DeviceHal;
use spin::Mutex;

/// Size of the buffer used by attach-time queries
const PROBE_BUFFER_SIZE: usize = 2048;

/// Bytes of BIOS private data covered by its checksum
const BIOS_PVT_CHECKSUMMED: usize = 14;

// =============================================================================
// OUTCOMES
// =============================================================================

/// What happened to a submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Handed to the firmware
    Issued,
    /// Accepted; waits on the pending queue for the mailbox to free up
    Queued,
    /// Accepted while quiescing; runs once the deletion finishes
    Deferred,
    /// Already completed (rejected or answered without the firmware)
    Completed,
}

/// Result of an abort request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The request was pulled before issue and completed as aborted
    Success,
    /// The request is not queued here, or is in flight and will complete normally
    NotRunning,
    /// An abort is already outstanding for this request
    Snooze,
}

/// Result of an adapter reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOutcome {
    /// Command slots swept up by the reset
    pub reset: usize,
}

// =============================================================================
// STATISTICS
// =============================================================================

/// I/O counters of one logical drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriveStats {
    /// Read commands
    pub reads: u64,
    /// Write commands
    pub writes: u64,
    /// Blocks read
    pub read_blocks: u64,
    /// Blocks written
    pub write_blocks: u64,
}

impl DriveStats {
    const ZERO: Self = Self { reads: 0, writes: 0, read_blocks: 0, write_blocks: 0 };
}

/// Snapshot of adapter counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterStats {
    /// Interrupts claimed
    pub interrupts: u64,
    /// Per logical drive counters
    pub drives: [DriveStats; MAX_LOGICAL_DRIVES_40LD as usize],
}

impl Default for AdapterStats {
    fn default() -> Self {
        Self {
            interrupts: 0,
            drives: [DriveStats::ZERO; MAX_LOGICAL_DRIVES_40LD as usize],
        }
    }
}

impl AdapterStats {
    pub(crate) fn record(&mut self, drive: u8, write: bool, blocks: u32) {
        let Some(stats) = self.drives.get_mut(drive as usize) else {
            return;
        };
        if write {
            stats.writes += 1;
            stats.write_blocks += u64::from(blocks);
        } else {
            stats.reads += 1;
            stats.read_blocks += u64::from(blocks);
        }
    }
}

// =============================================================================
// ENGINE STATE
// =============================================================================

/// Everything guarded by the IO lock
#[derive(Debug)]
pub(crate) struct Engine {
    pub pool: ScbPool,
    pub completed: VecDeque<ScsiRequest>,
    pub quiesce: QuiesceState,
    /// A logical drive was deleted; block I/O addresses drives at +0x80
    pub ldrv_remapped: bool,
    /// Host channels already announced as being scanned
    pub scanned_channels: u32,
    pub stats: AdapterStats,
}

impl Engine {
    fn new(pool: ScbPool) -> Self {
        Self {
            pool,
            completed: VecDeque::new(),
            quiesce: QuiesceState::Normal,
            ldrv_remapped: false,
            scanned_channels: 0,
            stats: AdapterStats::default(),
        }
    }

    /// Move the completed queue out so callbacks can run unlocked
    pub fn take_completed(&mut self) -> VecDeque<ScsiRequest> {
        core::mem::take(&mut self.completed)
    }

    /// Complete a request with a bare host byte
    pub fn complete_with(&mut self, mut req: ScsiRequest, host: HostByte) {
        req.set_result(ScsiResult::host_only(host));
        self.completed.push_back(req);
    }
}

/// Run completion callbacks in queue order
pub(crate) fn finish_all(done: VecDeque<ScsiRequest>) {
    for req in done {
        req.finish();
    }
}

/// What attach learned about the firmware
#[derive(Debug, Clone, Copy)]
pub(crate) struct Capabilities {
    pub board: BoardFlags,
    pub ext_cdb: bool,
    pub random_delete: bool,
    pub channels: ChannelMap,
    pub boot_ldrv: Option<u8>,
}

impl Capabilities {
    fn initial(config: &AdapterConfig) -> Self {
        Self::resolve(config, config.board, 0xFF, config.boot_device)
    }

    fn resolve(
        config: &AdapterConfig,
        board: BoardFlags,
        raid_class: u8,
        boot: Option<BootDevice>,
    ) -> Self {
        let boot_ldrv = match boot {
            Some(BootDevice::Logical(drive)) => Some(drive),
            _ => None,
        };
        Self {
            board,
            ext_cdb: false,
            random_delete: false,
            channels: ChannelMap::new(config.scsi_channels, raid_class, boot),
            boot_ldrv,
        }
    }
}

// =============================================================================
// ADAPTER
// =============================================================================

/// One MegaRAID adapter
pub struct Adapter<H: DeviceHal> {
    pub(crate) hal: H,
    pub(crate) config: AdapterConfig,
    pub(crate) caps: Capabilities,
    pub(crate) mailbox: MailboxRegion,
    pub(crate) engine: Mutex<Engine>,
    pub(crate) signals: Vec<CompletionSignal>,
    pub(crate) delete_lock: Mutex<()>,
}

impl<H: DeviceHal> core::fmt::Debug for Adapter<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.hal.name())
            .field("host_no", &self.config.host_no)
            .field("board", &self.caps.board)
            .finish()
    }
}

impl<H: DeviceHal> Adapter<H> {
    /// Bring up an adapter: register the mailbox, build the slot pool and
    /// query the firmware
    pub fn attach(hal: H, config: AdapterConfig) -> MegaResult<Self> {
        config.validate().map_err(|_| MegaError::InvalidParameter)?;

        let mailbox = MailboxRegion::alloc(hal.dma())?;
        let max_cmds = config.max_cmds.min(MAX_COMMANDS);
        let pool = match ScbPool::new(max_cmds, hal.dma()) {
            Ok(pool) => pool,
            Err(err) => {
                mailbox.free(hal.dma());
                return Err(err);
            }
        };

        let mut adapter = Self {
            caps: Capabilities::initial(&config),
            signals: (0..max_cmds).map(|_| CompletionSignal::new()).collect(),
            engine: Mutex::new(Engine::new(pool)),
            delete_lock: Mutex::new(()),
            mailbox,
            config,
            hal,
        };

        adapter.register_mailbox();
        if let Err(err) = adapter.probe() {
            log::error!("{}: adapter query failed: {}", adapter.hal.name(), err);
            adapter.release_resources();
            return Err(err);
        }

        log::info!(
            "{}: host {} ready, {} command slots, {} firmware{}",
            adapter.hal.name(),
            adapter.config.host_no,
            max_cmds,
            if adapter.caps.board.contains(BoardFlags::LD40) { "40LD" } else { "8LD" },
            if adapter.caps.board.contains(BoardFlags::BIT64) { ", 64-bit" } else { "" },
        );
        Ok(adapter)
    }

    /// Flush the adapter cache and release every resource
    ///
    /// Requests still owned by the adapter complete with a no-connect result.
    pub fn detach(self) -> MegaResult<()> {
        let flush = {
            let mut engine = self.engine.lock();
            self.admin(&mut engine, cmd::FLUSH_CACHE, 0, 0, 0)
        };
        let flush = match flush {
            Ok(fw_status::OK) => Ok(()),
            Ok(status) => Err(MegaError::CommandFailed(status)),
            Err(err) => Err(err),
        };
        if let Err(err) = flush {
            log::warn!("{}: cache flush failed: {}", self.hal.name(), err);
        }

        self.hal.irq().disable();
        let done = {
            let mut engine = self.engine.lock();
            for index in engine.pool.busy_ids() {
                match engine.pool.release(index, self.hal.dma()) {
                    Some(ScbOwner::Request(req)) => engine.complete_with(req, HostByte::NoConnect),
                    Some(ScbOwner::Ioctl) => self.signals[index as usize].fire_reset(),
                    None => {}
                }
            }
            engine.take_completed()
        };
        finish_all(done);

        log::info!("{}: host {} detached", self.hal.name(), self.config.host_no);
        self.release_resources();
        flush
    }

    fn release_resources(self) {
        let Self { hal, mailbox, engine, .. } = self;
        engine.lock().pool.destroy(hal.dma());
        mailbox.free(hal.dma());
    }

    // -------------------------------------------------------------------------
    // Submission path
    // -------------------------------------------------------------------------

    /// Accept a request
    ///
    /// The request's callback runs exactly once, possibly before this returns.
    /// When every command slot is in use the request completes with an error
    /// result and `MegaError::NoFreeScb` is returned; the hardware is not
    /// touched.
    pub fn submit(&self, req: ScsiRequest) -> MegaResult<Submission> {
        let mut engine = self.engine.lock();
        let outcome = self.queue_request(&mut engine, req);
        let done = engine.take_completed();
        drop(engine);
        finish_all(done);
        outcome
    }

    fn queue_request(&self, engine: &mut Engine, req: ScsiRequest) -> MegaResult<Submission> {
        let index = match self.build_command(engine, req) {
            Built::Slot(index) => index,
            Built::Finished(req) => {
                engine.completed.push_back(req);
                return Ok(Submission::Completed);
            }
            Built::Exhausted(req) => {
                log::warn!("{}: out of command slots, failing {}", self.hal.name(), req.id());
                engine.complete_with(req, HostByte::Error);
                return Err(MegaError::NoFreeScb);
            }
        };

        if engine.quiesce.defers_submissions() {
            engine.pool.enqueue(QueueKind::Internal, index);
            return Ok(Submission::Deferred);
        }

        engine.pool.enqueue(QueueKind::Pending, index);
        if let Err(err) = self.run_pending(engine) {
            log::debug!("{}: pending queue stalled: {}", self.hal.name(), err);
        }
        match engine.pool.get(index).map(|scb| scb.state) {
            Some(ScbState::Issued) => Ok(Submission::Issued),
            _ => Ok(Submission::Queued),
        }
    }

    /// Issue every pending slot that has not reached the firmware yet
    ///
    /// Stops at the first slot the mailbox refuses; it stays queued.
    pub(crate) fn run_pending(&self, engine: &mut Engine) -> MegaResult<()> {
        for index in engine.pool.ids(QueueKind::Pending) {
            if engine.pool.get(index).map(|scb| scb.state) == Some(ScbState::Active) {
                self.issue(engine, index)?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Abort / reset
    // -------------------------------------------------------------------------

    /// Abort a request
    ///
    /// A request that has not reached the firmware is pulled and completed as
    /// aborted. An in-flight request is only marked; its real completion still
    /// arrives through the interrupt handler.
    pub fn abort(&self, id: RequestId) -> AbortOutcome {
        log::warn!("{}: abort requested for {}", self.hal.name(), id);
        let mut engine = self.engine.lock();
        let outcome = match engine.pool.find_request(id) {
            None => AbortOutcome::NotRunning,
            Some(index) => match engine.pool.get(index).map(|scb| scb.state) {
                Some(ScbState::Aborted) => AbortOutcome::Snooze,
                Some(ScbState::Issued) => {
                    if let Some(scb) = engine.pool.get_mut(index) {
                        scb.state = ScbState::Aborted;
                    }
                    AbortOutcome::NotRunning
                }
                Some(ScbState::Active) => {
                    if let Some(ScbOwner::Request(req)) = engine.pool.release(index, self.hal.dma()) {
                        engine.complete_with(req, HostByte::Abort);
                    }
                    AbortOutcome::Success
                }
                _ => AbortOutcome::NotRunning,
            },
        };
        let done = engine.take_completed();
        drop(engine);
        finish_all(done);
        outcome
    }

    /// Sweep every outstanding command with a reset result
    ///
    /// Each request completes once, immediately. Slots the firmware still
    /// holds stay in `Reset` until their ids come back, and are then freed
    /// without a second completion.
    pub fn reset(&self, trigger: RequestId) -> ResetOutcome {
        log::warn!("{}: reset requested by {}", self.hal.name(), trigger);
        let dma = self.hal.dma();
        let mut engine = self.engine.lock();
        let mut reset = 0;

        for index in engine.pool.busy_ids() {
            let signal = &self.signals[index as usize];
            let Some(scb) = engine.pool.get_mut(index) else {
                continue;
            };
            // An ioctl whose status already arrived is finished by its waiter
            if matches!(scb.owner, Some(ScbOwner::Ioctl)) && signal.is_fired() {
                continue;
            }
            let state = scb.state;
            let owner = match state {
                ScbState::Issued | ScbState::Aborted => {
                    scb.state = ScbState::Reset;
                    scb.owner.take()
                }
                ScbState::Active => engine.pool.release(index, dma),
                ScbState::Free | ScbState::Reset => continue,
            };
            match owner {
                Some(ScbOwner::Request(req)) => engine.complete_with(req, HostByte::Reset),
                Some(ScbOwner::Ioctl) => signal.fire_reset(),
                None => {}
            }
            reset += 1;
        }

        let done = engine.take_completed();
        drop(engine);
        finish_all(done);
        ResetOutcome { reset }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Configuration the adapter was attached with
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Board flags, including what attach discovered
    pub fn board(&self) -> BoardFlags {
        self.caps.board
    }

    /// Whether the firmware takes 16-byte CDBs
    pub fn supports_ext_cdb(&self) -> bool {
        self.caps.ext_cdb
    }

    /// Whether the firmware can delete logical drives online
    pub fn supports_random_delete(&self) -> bool {
        self.caps.random_delete
    }

    /// Host channel layout
    pub fn channels(&self) -> ChannelMap {
        self.caps.channels
    }

    /// Counter snapshot
    pub fn stats(&self) -> AdapterStats {
        self.engine.lock().stats.clone()
    }

    /// Current quiescence state
    pub fn quiesce_state(&self) -> QuiesceState {
        self.engine.lock().quiesce
    }

    /// Slots on the pending queue
    pub fn pending_count(&self) -> usize {
        self.engine.lock().pool.len(QueueKind::Pending)
    }

    /// Slots available for allocation
    pub fn free_slots(&self) -> usize {
        self.engine.lock().pool.len(QueueKind::Free)
    }

    /// Name of the underlying device
    pub fn name(&self) -> &'static str {
        self.hal.name()
    }

    // -------------------------------------------------------------------------
    // Attach helpers
    // -------------------------------------------------------------------------

    fn register_mailbox(&self) {
        if self.caps.board.contains(BoardFlags::QUARTZ) {
            // The doorbell carries the mailbox address with every command
            return;
        }
        let regs = self.hal.regs();
        let addr = self.mailbox.phys().low32().to_le_bytes();
        for (i, byte) in addr.iter().enumerate() {
            regs.write8(regs::MBOX_PORT0 + i, *byte);
        }
        regs.write8(regs::ENABLE_MBOX_REGION, regs::ENABLE_MBOX_BYTE);
        regs.write8(regs::ACK_PORT, regs::ACK_BYTE);
        regs.write8(regs::TOGGLE_PORT, regs::ENABLE_INTR_BYTE);
    }

    fn probe(&mut self) -> MegaResult<()> {
        let dma = self.hal.dma();
        let buffer = dma.alloc_coherent(PROBE_BUFFER_SIZE)?;
        let caps = self.query_firmware(&buffer);
        dma.free_coherent(buffer);
        self.caps = caps?;
        Ok(())
    }

    fn query_firmware(&self, buffer: &CoherentRegion) -> MegaResult<Capabilities> {
        let name = self.hal.name();
        let dma = self.hal.dma();
        let xfer = buffer.phys().low32();
        let mut engine = self.engine.lock();

        let mut board = self.config.board;
        let enquiry3 = self.admin(
            &mut engine,
            cmd::FC_NEW_CONFIG,
            subop::ENQUIRY3,
            subop::ENQ3_GET_SOLICITED_FULL,
            xfer,
        )?;
        if enquiry3 == fw_status::OK {
            board |= BoardFlags::LD40;
        } else {
            match self.admin(&mut engine, cmd::ADAPTERINQ, 0, 0, xfer)? {
                fw_status::OK => {}
                status => return Err(MegaError::CommandFailed(status)),
            }
        }

        let ext_cdb = self.admin(&mut engine, cmd::MISC, subop::EXT_CDB_PROBE, 0, 0)? == fw_status::OK;
        let random_delete =
            self.admin(&mut engine, cmd::MISC, subop::SUP_DEL_LOGDRV, 0, 0)? == fw_status::OK;

        let raid_class =
            match self.admin(&mut engine, cmd::CHNL_CLASS, subop::GET_CHNL_CLASS, 0, xfer)? {
                fw_status::OK => dma.read_u8(buffer, 0),
                _ => 0xFF,
            };

        let boot = match self.config.boot_device {
            Some(boot) => Some(boot),
            None => {
                dma.write(buffer, 0, &[0u8; BIOS_PVT_CHECKSUMMED + 2]);
                match self.admin(&mut engine, cmd::BIOS_PVT_DATA, subop::GET_BIOS_PVT_DATA, 0, xfer)? {
                    fw_status::OK => {
                        let mut raw = [0u8; BIOS_PVT_CHECKSUMMED + 2];
                        dma.read(buffer, 0, &mut raw);
                        parse_bios_private(&raw)
                    }
                    _ => None,
                }
            }
        };

        let mut caps = Capabilities::resolve(&self.config, board, raid_class, boot);
        caps.ext_cdb = ext_cdb;
        caps.random_delete = random_delete;

        if ext_cdb {
            log::info!("{}: firmware supports extended CDBs", name);
        }
        if random_delete {
            log::info!("{}: firmware supports random deletion", name);
        }
        log::info!("{}: RAID channel class {:#04x}", name, raid_class);
        match boot {
            Some(BootDevice::Logical(drive)) => {
                log::info!("{}: boot logical drive {}", name, drive)
            }
            Some(BootDevice::Physical { channel, target }) => {
                log::info!("{}: boot physical drive {}:{}", name, channel, target)
            }
            None => {}
        }
        Ok(caps)
    }

    /// Run an adapter management command as a privileged synchronous command
    pub(crate) fn admin(
        &self,
        engine: &mut Engine,
        opcode: u8,
        subop: u8,
        param: u8,
        xfer: u32,
    ) -> MegaResult<u8> {
        self.issue_sync(engine, MailboxCommand::Admin { opcode, subop, param, xfer })
    }
}

/// Outcome of turning a request into a command
#[derive(Debug)]
pub(crate) enum Built {
    /// A slot is ready to queue
    Slot(u16),
    /// The request already has its result
    Finished(ScsiRequest),
    /// No slot was free
    Exhausted(ScsiRequest),
}

/// Decode the boot drive out of BIOS private data
///
/// The record is valid when its 16-bit checksum cancels the byte sum of
/// the first 14 bytes.
pub(crate) fn parse_bios_private(raw: &[u8; BIOS_PVT_CHECKSUMMED + 2]) -> Option<BootDevice> {
    let sum = raw[..BIOS_PVT_CHECKSUMMED]
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
    let checksum = u16::from_le_bytes([raw[BIOS_PVT_CHECKSUMMED], raw[BIOS_PVT_CHECKSUMMED + 1]]);
    if sum.wrapping_add(checksum) != 0 || sum == 0 {
        return None;
    }
    Some(BootDevice::from_bios_byte(raw[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bios_record(boot_drv: u8) -> [u8; 16] {
        let mut raw = [0u8; 16];
        raw[0] = 0x01;
        raw[1] = boot_drv;
        let sum = raw[..14].iter().fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
        raw[14..].copy_from_slice(&0u16.wrapping_sub(sum).to_le_bytes());
        raw
    }

    #[test]
    fn test_bios_private_logical() {
        assert_eq!(parse_bios_private(&bios_record(3)), Some(BootDevice::Logical(3)));
    }

    #[test]
    fn test_bios_private_physical() {
        assert_eq!(
            parse_bios_private(&bios_record(0x80 | 0x21)),
            Some(BootDevice::Physical { channel: 2, target: 1 })
        );
    }

    #[test]
    fn test_bios_private_bad_checksum() {
        let mut raw = bios_record(3);
        raw[14] ^= 0x55;
        assert_eq!(parse_bios_private(&raw), None);
        assert_eq!(parse_bios_private(&[0u8; 16]), None);
    }

    #[test]
    fn test_stats_record() {
        let mut stats = AdapterStats::default();
        stats.record(2, false, 8);
        stats.record(2, true, 4);
        stats.record(200, true, 4);
        assert_eq!(stats.drives[2].reads, 1);
        assert_eq!(stats.drives[2].read_blocks, 8);
        assert_eq!(stats.drives[2].writes, 1);
        assert_eq!(stats.drives[2].write_blocks, 4);
    }
}
