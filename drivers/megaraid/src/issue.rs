//! Mailbox handshake and command completion
//!
//! Two ways to hand a command to the firmware:
//!
//! - **interrupt mode**: copy the image into the mailbox, ring the doorbell
//!   and return; the id comes back through the interrupt handler
//! - **privileged mode**: interrupts masked, spin on the status area until
//!   the firmware answers (attach probes, drive deletion, cache flush)

use crate::adapter::{Adapter, Engine};
use crate::cdb::{sense_key, status as scsi_status, SENSE_RESPONSE_CURRENT};
use crate::config::BoardFlags;
use crate::mailbox::{cmd, fw_status, offset, regs, MailboxCommand, INTERNAL_CMD_ID, MBOX_SIZE, POLL_DONE};
use crate::passthru::{EXT_PASSTHRU_SENSE_OFFSET, PASSTHRU_SENSE_OFFSET};
use crate::request::{HostByte, ScsiResult, DRIVER_SENSE};
use crate::scb::{ScbOwner, ScbState};
use crate::{MegaError, MegaResult, BOUNCE_BUFFER_SIZE, REQ_SENSE_LEN};
use helix_hal::dma::DmaMapper;
use helix_hal::interrupts::IrqLine;
use helix_hal::io::RegisterIo;
use helix_hal::time::Clock;
use helix_hal::DeviceHal;

/// Attempts at finding the mailbox free before giving up
const MAILBOX_FREE_TRIES: u32 = 10;

/// Wire image of a command: the 16 mailbox bytes plus the 64-bit extension
pub(crate) fn wire_image(command: &MailboxCommand, cmd_id: u8) -> ([u8; MBOX_SIZE], u64) {
    let mut image = command.encode();
    image[offset::CMDID] = cmd_id;
    image[offset::BUSY] = 1;

    let mut extension = 0;
    if command.uses_xfer_extension() {
        let xfer = &mut image[offset::XFERADDR..offset::XFERADDR + 4];
        extension = u64::from(u32::from_le_bytes([xfer[0], xfer[1], xfer[2], xfer[3]]));
        xfer.copy_from_slice(&u32::MAX.to_le_bytes());
    }
    (image, extension)
}

impl<H: DeviceHal> Adapter<H> {
    fn is_quartz(&self) -> bool {
        self.caps.board.contains(BoardFlags::QUARTZ)
    }

    /// Spin until `done` holds, up to the configured limit
    pub(crate) fn spin_until(&self, mut done: impl FnMut() -> bool) -> MegaResult<()> {
        for _ in 0..self.config.spin_limit {
            if done() {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(MegaError::Timeout)
    }

    fn wait_mailbox_free(&self) -> MegaResult<()> {
        let dma = self.hal.dma();
        for _ in 0..MAILBOX_FREE_TRIES {
            if !self.mailbox.is_busy(dma) {
                return Ok(());
            }
            self.hal.clock().udelay(1);
        }
        if self.mailbox.is_busy(dma) {
            log::warn!("{}: mailbox busy", self.hal.name());
            return Err(MegaError::MailboxBusy);
        }
        Ok(())
    }

    /// Hand one slot to the firmware in interrupt mode
    pub(crate) fn issue(&self, engine: &mut Engine, index: u16) -> MegaResult<()> {
        self.wait_mailbox_free()?;

        let dma = self.hal.dma();
        let regs = self.hal.regs();
        let scb = &mut engine.pool[index];
        let (image, extension) = wire_image(&scb.command, scb.cmd_id());
        self.mailbox.post(dma, &image, extension);

        if self.is_quartz() {
            self.mailbox.set_handshake(dma, 0, 0);
            regs.write32(
                regs::INBOUND_DOORBELL,
                self.mailbox.phys().low32() | regs::DOORBELL_NEW_COMMAND,
            );
        } else {
            regs.write8(regs::TOGGLE_PORT, regs::ENABLE_INTR_BYTE);
            regs.write8(regs::CMD_PORT, regs::ISSUE_BYTE);
        }

        scb.state = ScbState::Issued;
        log::trace!("{}: issued cmd id {}", self.hal.name(), scb.cmd_id());
        Ok(())
    }

    /// Run a command with interrupts masked and poll for its status
    ///
    /// Uses the reserved internal command id, so it never collides with a
    /// slot. The caller holds the IO lock for the whole handshake.
    pub(crate) fn issue_sync(&self, _engine: &mut Engine, command: MailboxCommand) -> MegaResult<u8> {
        let irq = self.hal.irq();
        irq.disable();
        let status = self.poll_command(&command);
        self.mailbox.invalidate_completed(self.hal.dma());
        irq.enable();

        if let Err(err) = status {
            log::error!(
                "{}: privileged command {:#04x} failed: {}",
                self.hal.name(),
                command.opcode(),
                err
            );
        }
        status
    }

    fn poll_command(&self, command: &MailboxCommand) -> MegaResult<u8> {
        self.wait_mailbox_free()?;

        let dma = self.hal.dma();
        let regs = self.hal.regs();
        let (image, extension) = wire_image(command, INTERNAL_CMD_ID);

        if self.is_quartz() {
            self.mailbox.invalidate_numstatus(dma);
            self.mailbox.invalidate_status(dma);
            self.mailbox.post(dma, &image, extension);
            self.mailbox.set_handshake(dma, 0, 0);
            let phys = self.mailbox.phys().low32();
            regs.write32(regs::INBOUND_DOORBELL, phys | regs::DOORBELL_NEW_COMMAND);

            self.spin_until(|| self.mailbox.numstatus(dma).is_some())?;
            self.spin_until(|| self.mailbox.poll(dma) == POLL_DONE)?;
            let status = self.mailbox.status(dma);
            self.mailbox.set_handshake(dma, 0, POLL_DONE);
            self.mailbox.invalidate_numstatus(dma);

            regs.write32(regs::INBOUND_DOORBELL, phys | regs::DOORBELL_ACK);
            self.spin_until(|| regs.read32(regs::INBOUND_DOORBELL) & regs::DOORBELL_ACK == 0)?;
            Ok(status)
        } else {
            self.mailbox.post(dma, &image, extension);
            regs.write8(regs::TOGGLE_PORT, regs::DISABLE_INTR_BYTE);
            regs.write8(regs::CMD_PORT, regs::ISSUE_BYTE);

            self.spin_until(|| regs.read8(regs::INTR_PORT) & regs::VALID_INTR_BYTE != 0)?;
            let byte = regs.read8(regs::INTR_PORT);
            regs.write8(regs::INTR_PORT, byte);
            regs.write8(regs::TOGGLE_PORT, regs::ENABLE_INTR_BYTE);
            regs.write8(regs::ACK_PORT, regs::ACK_BYTE);
            Ok(self.mailbox.status(dma))
        }
    }

    /// Finish a slot the firmware reported with `status`
    ///
    /// Copies bounce data and sense back to the request, frees the slot and
    /// queues the request for its callback.
    pub(crate) fn complete(&self, engine: &mut Engine, index: u16, status: u8) {
        let dma = self.hal.dma();
        let scb = &engine.pool[index];
        let opcode = scb.command.opcode();
        let logical = scb.logical;

        let mut bounce = [0u8; BOUNCE_BUFFER_SIZE];
        let bounce_len = scb.bounce_len;
        if bounce_len > 0 {
            dma.read(&scb.buffers.bounce, 0, &mut bounce[..bounce_len]);
        }
        let mut sense = [0u8; REQ_SENSE_LEN];
        match opcode {
            cmd::PASSTHRU => dma.read(&scb.buffers.passthru, PASSTHRU_SENSE_OFFSET, &mut sense),
            cmd::EXTPASSTHRU => {
                dma.read(&scb.buffers.ext_passthru, EXT_PASSTHRU_SENSE_OFFSET, &mut sense)
            }
            _ => {}
        }

        let mut req = match engine.pool.release(index, dma) {
            Some(ScbOwner::Request(req)) => req,
            Some(ScbOwner::Ioctl) => {
                log::error!("{}: ioctl slot {} completed as a request", self.hal.name(), index);
                return;
            }
            None => {
                log::error!("{}: completion for unowned slot {}", self.hal.name(), index);
                return;
            }
        };

        if bounce_len > 0 {
            req.data.write_prefix(&bounce[..bounce_len]);
        }

        let mut status = status;
        // Physical disks owned by the RAID firmware stay hidden from the host
        if opcode == cmd::PASSTHRU
            && !logical
            && req.opcode() == crate::cdb::opcode::INQUIRY
            && self.caps.channels.is_raid(req.channel)
            && req.data.first_byte().map(|b| b & 0x1F) == Some(crate::cdb::PERIPHERAL_DIRECT_ACCESS)
        {
            status = fw_status::HIDDEN_DISK;
        }

        let result = match status {
            fw_status::OK => ScsiResult::new(HostByte::Ok, scsi_status::GOOD),
            fw_status::CHECK_CONDITION => {
                if matches!(opcode, cmd::PASSTHRU | cmd::EXTPASSTHRU) {
                    req.sense_mut()[..REQ_SENSE_LEN].copy_from_slice(&sense);
                    ScsiResult::new(HostByte::Ok, scsi_status::CHECK_CONDITION).with_driver(DRIVER_SENSE)
                } else {
                    let req_sense = req.sense_mut();
                    req_sense[0] = SENSE_RESPONSE_CURRENT;
                    req_sense[2] = sense_key::ABORTED_COMMAND;
                    ScsiResult::new(HostByte::Ok, scsi_status::CHECK_CONDITION)
                }
            }
            fw_status::BUSY => ScsiResult::new(HostByte::BusBusy, status),
            _ => ScsiResult::new(HostByte::BadTarget, status),
        };
        req.set_result(result);
        engine.completed.push_back(req);
    }
}
