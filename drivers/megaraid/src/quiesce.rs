//! Online logical drive deletion
//!
//! Deleting a drive renumbers the ones behind it, so the adapter first
//! stops issuing, waits for every outstanding command to drain, runs the
//! delete, and then releases what was deferred in the meantime with the
//! new numbering.

use crate::adapter::{finish_all, Adapter};
use crate::mailbox::{cmd, fw_status, subop, MailboxCommand};
use crate::scb::QueueKind;
use crate::{MegaError, MegaResult, LDRV_REMAP_OFFSET};
use core::fmt;
use helix_hal::time::Clock;
use helix_hal::DeviceHal;

/// Controller quiescence state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuiesceState {
    /// Commands issue as they arrive
    #[default]
    Normal,
    /// New commands are deferred while outstanding ones drain
    Quiescing,
    /// The delete command is running
    Deleting,
    /// Deferred commands are being moved back onto the pending queue
    DrainingInternal,
}

impl QuiesceState {
    /// Whether new commands go to the internal queue
    pub const fn defers_submissions(self) -> bool {
        !matches!(self, QuiesceState::Normal)
    }
}

impl fmt::Display for QuiesceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuiesceState::Normal => "normal",
            QuiesceState::Quiescing => "quiescing",
            QuiesceState::Deleting => "deleting",
            QuiesceState::DrainingInternal => "draining internal queue",
        };
        f.write_str(name)
    }
}

impl<H: DeviceHal> Adapter<H> {
    /// Delete a logical drive while the adapter stays online
    ///
    /// Blocks until every outstanding command has completed. Requests
    /// submitted meanwhile are deferred and issued afterwards; after a
    /// successful delete, block I/O addresses drives at `drive + 0x80`.
    pub fn delete_logical_drive(&self, drive: u8) -> MegaResult<()> {
        if !self.caps.random_delete {
            return Err(MegaError::Unsupported);
        }
        let _serial = self.delete_lock.lock();

        self.engine.lock().quiesce = QuiesceState::Quiescing;
        log::info!("{}: quiescing for deletion of logical drive {}", self.hal.name(), drive);

        let outcome = self.drain_pending().and_then(|()| {
            let mut engine = self.engine.lock();
            engine.quiesce = QuiesceState::Deleting;
            let status = self.issue_sync(
                &mut engine,
                MailboxCommand::Admin {
                    opcode: cmd::MISC,
                    subop: subop::DEL_LOGDRV,
                    param: drive,
                    xfer: 0,
                },
            )?;
            match status {
                fw_status::OK => {
                    engine.ldrv_remapped = true;
                    Ok(())
                }
                status => Err(MegaError::CommandFailed(status)),
            }
        });

        match outcome {
            Ok(()) => log::info!("{}: logical drive {} deleted", self.hal.name(), drive),
            Err(err) => {
                log::error!("{}: deleting logical drive {} failed: {}", self.hal.name(), drive, err)
            }
        }
        self.resume();
        outcome
    }

    /// Sleep until the pending queue is empty
    fn drain_pending(&self) -> MegaResult<()> {
        let clock = self.hal.clock();
        let poll = self.config.drain_poll_ms;
        let mut waited: u32 = 0;
        loop {
            let pending = self.engine.lock().pool.len(QueueKind::Pending);
            if pending == 0 {
                return Ok(());
            }
            if let Some(limit) = self.config.drain_timeout_ms {
                if waited >= limit {
                    log::warn!("{}: {} commands still pending", self.hal.name(), pending);
                    return Err(MegaError::DrainTimeout);
                }
            }
            log::debug!("{}: waiting for {} pending commands", self.hal.name(), pending);
            clock.msleep(poll);
            waited = waited.saturating_add(poll);
        }
    }

    /// Move deferred commands ahead of the pending queue and restart issue
    fn resume(&self) {
        let mut engine = self.engine.lock();
        engine.quiesce = QuiesceState::DrainingInternal;

        let moved = engine.pool.splice_internal_front();
        if engine.ldrv_remapped {
            for &index in &moved {
                if let Some(logdrv) = engine.pool[index].command.logical_drive_mut() {
                    if *logdrv < LDRV_REMAP_OFFSET {
                        *logdrv += LDRV_REMAP_OFFSET;
                    }
                }
            }
        }
        if !moved.is_empty() {
            log::debug!("{}: releasing {} deferred commands", self.hal.name(), moved.len());
        }

        engine.quiesce = QuiesceState::Normal;
        if let Err(err) = self.run_pending(&mut engine) {
            log::debug!("{}: pending queue stalled: {}", self.hal.name(), err);
        }
        let done = engine.take_completed();
        drop(engine);
        finish_all(done);
    }
}
