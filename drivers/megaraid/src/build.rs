//! Request to mailbox command translation
//!
//! Runs under the IO lock. A request either leaves here inside a command
//! slot ready to queue, or already carries its final result.

use crate::adapter::{Adapter, Built, Engine};
use crate::cdb::{self, opcode};
use crate::config::{BoardFlags, Route};
use crate::ioctl::{self, DRIVER_IOCTL_OPCODE};
use crate::mailbox::{cmd, MailboxCommand};
use crate::passthru::{
    encode_sg32, encode_sg64, ExtPassThru, PassThru, MAX_CDB_LEN, MAX_EXT_CDB_LEN, SG32_SIZE,
    SG64_SIZE,
};
use crate::request::{DataBuffer, HostByte, ScsiRequest, ScsiResult};
use crate::scb::{Scb, ScbOwner, Transfer};
use crate::{
    MegaError, MegaResult, BOUNCE_BUFFER_SIZE, INITIATOR_ID, LDRV_REMAP_OFFSET,
    MAX_LOGICAL_DRIVES_40LD, MAX_LOGICAL_DRIVES_8LD, MAX_SGLIST, REQ_SENSE_LEN,
    TARGETS_PER_CHANNEL,
};
use helix_hal::dma::{DmaDirection, DmaMapper};
use helix_hal::DeviceHal;

/// Timeout class of pass-through commands to physical devices (10 minutes)
const PHYSICAL_TIMEOUT: u8 = 2;

/// Highest LUN a physical pass-through can address
const MAX_LUN: u8 = 7;

/// Highest physical target that fits the 40LD channel/target byte
const PACKED_TARGET_MAX: u8 = 0x0F;

/// Pass-through descriptor flavours
enum Descriptor {
    Standard(PassThru),
    Extended(ExtPassThru),
}

/// Resolve a virtual channel and target to a logical drive number
///
/// Target 7 is the adapter itself and never names a drive; targets above it
/// shift down by one. With a boot drive configured, it is presented first:
/// drive 0 maps to the boot drive and drives up to it move down by one.
pub(crate) fn logical_drive_number(vchan: u8, target: u8, boot_ldrv: Option<u8>) -> Option<u8> {
    if target == INITIATOR_ID || target > TARGETS_PER_CHANNEL {
        return None;
    }
    let adjusted = if target > INITIATOR_ID { target - 1 } else { target };
    let drive = vchan
        .checked_mul(TARGETS_PER_CHANNEL)?
        .checked_add(adjusted)?;
    Some(match boot_ldrv {
        Some(boot) if drive == 0 => boot,
        Some(boot) if drive <= boot => drive - 1,
        _ => drive,
    })
}

fn finished(mut req: ScsiRequest, host: HostByte) -> Built {
    req.set_result(ScsiResult::host_only(host));
    Built::Finished(req)
}

impl<H: DeviceHal> Adapter<H> {
    /// Translate a request into a command slot
    pub(crate) fn build_command(&self, engine: &mut Engine, mut req: ScsiRequest) -> Built {
        if req.opcode() == DRIVER_IOCTL_OPCODE {
            ioctl::driver_ioctl(&mut req);
            return Built::Finished(req);
        }

        match self.caps.channels.route(req.channel, req.target) {
            Some(Route::Logical { vchan, target }) => self.build_logical(engine, req, vchan, target),
            Some(Route::Physical { channel, target }) => {
                self.build_physical(engine, req, channel, target)
            }
            None => finished(req, HostByte::BadTarget),
        }
    }

    fn max_logical_drives(&self) -> u8 {
        if self.caps.board.contains(BoardFlags::LD40) {
            MAX_LOGICAL_DRIVES_40LD
        } else {
            MAX_LOGICAL_DRIVES_8LD
        }
    }

    // -------------------------------------------------------------------------
    // Logical drives
    // -------------------------------------------------------------------------

    fn build_logical(&self, engine: &mut Engine, mut req: ScsiRequest, vchan: u8, target: u8) -> Built {
        if req.lun != 0 {
            return finished(req, HostByte::BadTarget);
        }
        let drive = match logical_drive_number(vchan, target, self.caps.boot_ldrv) {
            Some(drive) if drive < self.max_logical_drives() => drive,
            _ => return finished(req, HostByte::BadTarget),
        };

        match req.opcode() {
            opcode::TEST_UNIT_READY => {
                let len = req.data.len();
                req.data.zero(len);
                finished(req, HostByte::Ok)
            }
            opcode::MODE_SENSE_6 => {
                let len = req.cdb().get(4).copied().unwrap_or(0);
                req.data.zero(len as usize);
                finished(req, HostByte::Ok)
            }
            opcode::INQUIRY | opcode::READ_CAPACITY_10 => {
                self.note_scan(engine, req.channel);
                let Some((cdb, cdblen)) = short_cdb(req.cdb()) else {
                    return finished(req, HostByte::BadTarget);
                };
                let pthru = PassThru {
                    timeout: 0,
                    ars: true,
                    reqsenselen: REQ_SENSE_LEN as u8,
                    islogical: true,
                    logdrv: drive,
                    cdb,
                    cdblen,
                    ..PassThru::default()
                };
                self.build_passthru(engine, req, Descriptor::Standard(pthru), true, true)
            }
            op if cdb::is_read_write(op) => self.build_block_io(engine, req, drive),
            op => {
                log::debug!("{}: unsupported opcode {:#04x} for logical drive {}", self.hal.name(), op, drive);
                finished(req, HostByte::BadTarget)
            }
        }
    }

    fn note_scan(&self, engine: &mut Engine, channel: u8) {
        let bit = 1u32 << u32::from(channel).min(31);
        if engine.scanned_channels & bit == 0 {
            engine.scanned_channels |= bit;
            log::info!(
                "{}: scanning scsi channel {} for logical drives",
                self.hal.name(),
                channel
            );
        }
    }

    fn build_block_io(&self, engine: &mut Engine, mut req: ScsiRequest, drive: u8) -> Built {
        let Some(transfer) = cdb::decode_block_transfer(req.cdb()) else {
            return finished(req, HostByte::BadTarget);
        };
        let Ok(sectors) = u16::try_from(transfer.count) else {
            log::warn!("{}: {} blocks exceed one command", self.hal.name(), transfer.count);
            return finished(req, HostByte::BadTarget);
        };

        let bit64 = self.caps.board.contains(BoardFlags::BIT64);
        let opcode = match (transfer.write, bit64) {
            (false, false) => cmd::LREAD,
            (true, false) => cmd::LWRITE,
            (false, true) => cmd::LREAD64,
            (true, true) => cmd::LWRITE64,
        };
        req.direction = if transfer.write {
            DmaDirection::ToDevice
        } else {
            DmaDirection::FromDevice
        };
        let logdrv = if engine.ldrv_remapped {
            drive + LDRV_REMAP_OFFSET
        } else {
            drive
        };

        let mapped = match self.map_request(&req) {
            Ok(mapped) => mapped,
            Err(err) => return self.map_failed(req, err),
        };
        let index = match self.take_slot(engine, req, mapped) {
            Ok(index) => index,
            Err(built) => return built,
        };
        engine.stats.record(drive, transfer.write, transfer.count);

        let scb = &mut engine.pool[index];
        let (xfer, sg_count) = self.sg_list(scb, bit64, bit64);
        scb.command = MailboxCommand::ReadWrite {
            opcode,
            sectors,
            lba: transfer.lba,
            xfer,
            logdrv,
            sg_count,
        };
        scb.logical = true;
        Built::Slot(index)
    }

    // -------------------------------------------------------------------------
    // Physical devices
    // -------------------------------------------------------------------------

    fn build_physical(&self, engine: &mut Engine, req: ScsiRequest, channel: u8, target: u8) -> Built {
        let ext_cdb = self.caps.ext_cdb;
        if (req.lun != 0 && !ext_cdb) || req.lun > MAX_LUN || self.config.skip_id == Some(target) {
            return finished(req, HostByte::BadTarget);
        }
        if req.cdb().len() > MAX_CDB_LEN && !ext_cdb {
            return finished(req, HostByte::BadTarget);
        }

        let ld40 = self.caps.board.contains(BoardFlags::LD40);
        // 40LD firmware packs channel and target into one byte
        if ld40 && target > PACKED_TARGET_MAX {
            return finished(req, HostByte::BadTarget);
        }

        let (channel, target) = if ld40 {
            (0, (channel << 4) | target)
        } else {
            (channel, target)
        };

        if req.cdb().len() > MAX_CDB_LEN {
            let mut cdb = [0u8; MAX_EXT_CDB_LEN];
            cdb[..req.cdb().len()].copy_from_slice(req.cdb());
            let epthru = ExtPassThru {
                timeout: PHYSICAL_TIMEOUT,
                ars: true,
                islogical: false,
                logdrv: req.lun,
                channel,
                target,
                cdblen: req.cdb().len() as u8,
                cdb,
                numsgelements: 0,
                status: 0,
                reqsenselen: REQ_SENSE_LEN as u8,
                reqsensearea: [0; crate::passthru::MAX_REQ_SENSE_LEN],
                dataxferaddr: 0,
                dataxferlen: 0,
            };
            return self.build_passthru(engine, req, Descriptor::Extended(epthru), false, false);
        }

        let Some((cdb, cdblen)) = short_cdb(req.cdb()) else {
            return finished(req, HostByte::BadTarget);
        };
        let bounce = matches!(req.opcode(), opcode::INQUIRY | opcode::READ_CAPACITY_10);
        let pthru = PassThru {
            timeout: PHYSICAL_TIMEOUT,
            ars: true,
            reqsenselen: REQ_SENSE_LEN as u8,
            islogical: false,
            logdrv: req.lun,
            channel,
            target,
            cdb,
            cdblen,
            ..PassThru::default()
        };
        self.build_passthru(engine, req, Descriptor::Standard(pthru), bounce, false)
    }

    /// Place a pass-through descriptor in a fresh slot
    ///
    /// With `bounce` the data goes through the slot's bounce buffer and is
    /// copied to the request on completion.
    fn build_passthru(
        &self,
        engine: &mut Engine,
        req: ScsiRequest,
        descriptor: Descriptor,
        bounce: bool,
        logical: bool,
    ) -> Built {
        let data_len = req.data.len();
        let mapped = if bounce {
            Transfer::None
        } else {
            match self.map_request(&req) {
                Ok(mapped) => mapped,
                Err(err) => return self.map_failed(req, err),
            }
        };
        let index = match self.take_slot(engine, req, mapped) {
            Ok(index) => index,
            Err(built) => return built,
        };

        let dma = self.hal.dma();
        let scb = &mut engine.pool[index];
        let (addr, sg_count, len) = if bounce {
            scb.bounce_len = data_len.min(BOUNCE_BUFFER_SIZE);
            (scb.buffers.bounce.phys().low32(), 0, scb.bounce_len)
        } else {
            let (addr, count) = self.sg_list(scb, false, false);
            (addr, count, data_len)
        };

        let (opcode, region) = match descriptor {
            Descriptor::Standard(mut pthru) => {
                pthru.dataxferaddr = addr;
                pthru.dataxferlen = len as u32;
                pthru.numsgelements = sg_count;
                dma.write(&scb.buffers.passthru, 0, &pthru.encode());
                (cmd::PASSTHRU, scb.buffers.passthru)
            }
            Descriptor::Extended(mut epthru) => {
                epthru.dataxferaddr = addr;
                epthru.dataxferlen = len as u32;
                epthru.numsgelements = sg_count;
                dma.write(&scb.buffers.ext_passthru, 0, &epthru.encode());
                (cmd::EXTPASSTHRU, scb.buffers.ext_passthru)
            }
        };
        scb.command = MailboxCommand::PassThru { opcode, xfer: region.phys().low32() };
        scb.logical = logical;
        Built::Slot(index)
    }

    // -------------------------------------------------------------------------
    // Slots and data mapping
    // -------------------------------------------------------------------------

    /// Map the request's data for streaming DMA
    fn map_request(&self, req: &ScsiRequest) -> MegaResult<Transfer> {
        let dma = self.hal.dma();
        match &req.data {
            DataBuffer::None => Ok(Transfer::None),
            DataBuffer::Single(buf) if buf.is_empty() => Ok(Transfer::None),
            DataBuffer::Single(buf) => {
                let addr = dma.map_single(buf, req.direction)?;
                Ok(Transfer::Bulk { addr, len: buf.len() })
            }
            DataBuffer::Scatter(list) => {
                if list.len() > MAX_SGLIST {
                    log::warn!(
                        "{}: {} segments exceed the scatter-gather limit",
                        self.hal.name(),
                        list.len()
                    );
                    return Err(MegaError::InvalidParameter);
                }
                let segments = dma.map_sg(&req.data.segments(), req.direction)?;
                if segments.len() > MAX_SGLIST {
                    dma.unmap_sg(&segments, req.direction);
                    return Err(MegaError::InvalidParameter);
                }
                Ok(Transfer::Scatter(segments))
            }
        }
    }

    fn map_failed(&self, req: ScsiRequest, err: MegaError) -> Built {
        log::warn!("{}: cannot map data of {}: {}", self.hal.name(), req.id(), err);
        finished(req, HostByte::Error)
    }

    fn unmap(&self, transfer: Transfer, direction: DmaDirection) {
        let dma = self.hal.dma();
        match transfer {
            Transfer::None => {}
            Transfer::Bulk { addr, len } => dma.unmap_single(addr, len, direction),
            Transfer::Scatter(segments) => dma.unmap_sg(&segments, direction),
        }
    }

    /// Allocate a slot for a request and hand it the mapped transfer
    fn take_slot(&self, engine: &mut Engine, req: ScsiRequest, transfer: Transfer) -> Result<u16, Built> {
        let direction = req.direction;
        match engine.pool.allocate(ScbOwner::Request(req)) {
            Ok(index) => {
                let scb = &mut engine.pool[index];
                scb.direction = direction;
                scb.transfer = transfer;
                Ok(index)
            }
            Err(owner) => {
                self.unmap(transfer, direction);
                match owner {
                    ScbOwner::Request(req) => Err(Built::Exhausted(req)),
                    ScbOwner::Ioctl => unreachable!("request slot handed back as ioctl"),
                }
            }
        }
    }

    /// Write the slot's SG list and return the transfer address and count
    ///
    /// A contiguous buffer goes out directly unless `force_sg` asks for a
    /// one-element list.
    fn sg_list(&self, scb: &Scb, sg64: bool, force_sg: bool) -> (u32, u8) {
        let dma = self.hal.dma();
        let sg = &scb.buffers.sg;
        match &scb.transfer {
            Transfer::None => (0, 0),
            Transfer::Bulk { addr, .. } if !force_sg => (addr.low32(), 0),
            Transfer::Bulk { addr, len } => {
                dma.write(sg, 0, &encode_sg64(addr.as_u64(), *len as u32));
                (sg.phys().low32(), 1)
            }
            Transfer::Scatter(segments) => {
                for (i, segment) in segments.iter().enumerate() {
                    if sg64 {
                        dma.write(sg, i * SG64_SIZE, &encode_sg64(segment.addr.as_u64(), segment.len));
                    } else {
                        dma.write(sg, i * SG32_SIZE, &encode_sg32(segment.addr.low32(), segment.len));
                    }
                }
                (sg.phys().low32(), segments.len() as u8)
            }
        }
    }
}

/// Copy a CDB into a 10-byte descriptor field
fn short_cdb(cdb: &[u8]) -> Option<([u8; MAX_CDB_LEN], u8)> {
    if cdb.len() > MAX_CDB_LEN {
        return None;
    }
    let mut out = [0u8; MAX_CDB_LEN];
    out[..cdb.len()].copy_from_slice(cdb);
    Some((out, cdb.len() as u8))
}
