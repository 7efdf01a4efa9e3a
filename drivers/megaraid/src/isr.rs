//! Interrupt handling
//!
//! The handler claims the interrupt, collects the batch of completed ids
//! the firmware posted, acknowledges it and finishes each slot. Callbacks
//! run after the IO lock is dropped.

use crate::adapter::{finish_all, Adapter, Engine};
use crate::config::BoardFlags;
use crate::mailbox::regs;
use crate::request::HostByte;
use crate::scb::{ScbOwner, ScbState};
use crate::MAX_FIRMWARE_STATUS;
use helix_hal::dma::DmaMapper;
use helix_hal::interrupts::IrqReturn;
use helix_hal::io::RegisterIo;
use helix_hal::DeviceHal;

/// Completed ids of one interrupt
pub(crate) type StatusBatch = heapless::Vec<u8, MAX_FIRMWARE_STATUS>;

impl<H: DeviceHal> Adapter<H> {
    /// Service the adapter interrupt
    ///
    /// Returns `IrqReturn::None` when the adapter did not raise it, so a
    /// shared line can be offered to the next device.
    pub fn handle_interrupt(&self) -> IrqReturn {
        let mut engine = self.engine.lock();
        if !self.claim_interrupt() {
            return IrqReturn::None;
        }
        engine.stats.interrupts += 1;

        let (status, batch) = self.collect_status();
        self.acknowledge();

        for &id in batch.iter() {
            self.dispatch(&mut engine, id, status);
        }

        if let Err(err) = self.run_pending(&mut engine) {
            log::debug!("{}: pending queue stalled: {}", self.hal.name(), err);
        }
        let done = engine.take_completed();
        drop(engine);
        finish_all(done);
        IrqReturn::Handled
    }

    fn claim_interrupt(&self) -> bool {
        let regs = self.hal.regs();
        if self.caps.board.contains(BoardFlags::QUARTZ) {
            let doorbell = regs.read32(regs::OUTBOUND_DOORBELL);
            if doorbell != regs::OUTBOUND_VALID {
                return false;
            }
            regs.write32(regs::OUTBOUND_DOORBELL, doorbell);
        } else {
            let byte = regs.read8(regs::INTR_PORT);
            if byte & regs::VALID_INTR_BYTE == 0 {
                return false;
            }
            regs.write8(regs::INTR_PORT, byte);
        }
        true
    }

    /// Read the posted batch, marking each field consumed as it is read
    fn collect_status(&self) -> (u8, StatusBatch) {
        let dma = self.hal.dma();
        let mut batch = StatusBatch::new();

        let mut count = None;
        if self.spin_until(|| {
            count = self.mailbox.numstatus(dma);
            count.is_some()
        })
        .is_err()
        {
            log::error!("{}: firmware never posted a completion count", self.hal.name());
            return (0, batch);
        }
        self.mailbox.invalidate_numstatus(dma);
        let count = usize::from(count.unwrap_or(0)).min(MAX_FIRMWARE_STATUS);

        for slot in 0..count {
            let mut id = None;
            if self
                .spin_until(|| {
                    id = self.mailbox.completed(dma, slot);
                    id.is_some()
                })
                .is_err()
            {
                log::error!("{}: completed slot {} never posted", self.hal.name(), slot);
                break;
            }
            self.mailbox.invalidate_completed_slot(dma, slot);
            if let Some(id) = id {
                // Capacity matches the firmware limit
                let _ = batch.push(id);
            }
        }
        (self.mailbox.status(dma), batch)
    }

    fn acknowledge(&self) {
        let regs = self.hal.regs();
        if self.caps.board.contains(BoardFlags::QUARTZ) {
            regs.write32(regs::INBOUND_DOORBELL, regs::DOORBELL_ACK);
            if self
                .spin_until(|| regs.read32(regs::INBOUND_DOORBELL) & regs::DOORBELL_ACK == 0)
                .is_err()
            {
                log::warn!("{}: doorbell acknowledge stuck", self.hal.name());
            }
        } else {
            regs.write8(regs::ACK_PORT, regs::ACK_BYTE);
        }
    }

    fn dispatch(&self, engine: &mut Engine, id: u8, status: u8) {
        let name = self.hal.name();
        let capacity = engine.pool.capacity();
        if id == 0 || usize::from(id) > capacity {
            log::warn!("{}: wrong cmd id completed: {}", name, id);
            return;
        }
        let index = u16::from(id) - 1;

        match engine.pool[index].state {
            ScbState::Free => {
                log::warn!("{}: completion for free cmd id {}", name, id);
            }
            ScbState::Reset => {
                // Already finalized by the reset unless the owner is still attached
                if let Some(ScbOwner::Request(req)) = engine.pool.release(index, self.hal.dma()) {
                    engine.complete_with(req, HostByte::Reset);
                }
            }
            _ if matches!(engine.pool[index].owner, Some(ScbOwner::Ioctl)) => {
                self.signals[index as usize].fire(status);
            }
            _ => self.complete(engine, index, status),
        }
    }
}
