//! # Command Control Blocks
//!
//! One SCB per hardware command slot. The slot index plus one is the
//! command id the firmware reports back, so slots never move: they live in
//! a fixed arena and queues link them by index.
//!
//! Every SCB sits on exactly one queue except for the short window between
//! allocation and enqueueing, which never spans a lock release:
//!
//! - **free**: available for allocation, FIFO so slots are reused in order
//! - **pending**: accepted commands, both not yet issued and in flight
//! - **internal**: commands deferred while the controller is quiescing

use crate::mailbox::MailboxCommand;
use crate::passthru::{EXT_PASSTHRU_SIZE, PASSTHRU_SIZE, SG64_SIZE};
use crate::request::{RequestId, ScsiRequest};
use crate::{MegaResult, BOUNCE_BUFFER_SIZE, MAX_SGLIST};
use alloc::vec::Vec;
use core::fmt;
use core::ops::{Index, IndexMut};
use helix_hal::dma::{CoherentRegion, DmaDirection, DmaMapper, DmaSegment};
use helix_hal::PhysAddr;

// =============================================================================
// STATE
// =============================================================================

/// Lifecycle state of a command slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScbState {
    /// Available
    Free,
    /// Built and queued, not yet handed to the firmware
    Active,
    /// Handed to the firmware
    Issued,
    /// In flight and asked to abort; completes normally
    Aborted,
    /// Swept up by a reset; the firmware still owns the slot
    Reset,
}

impl fmt::Display for ScbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScbState::Free => "free",
            ScbState::Active => "active",
            ScbState::Issued => "issued",
            ScbState::Aborted => "aborted",
            ScbState::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Who gets told when the slot completes
#[derive(Debug)]
pub(crate) enum ScbOwner {
    /// A SCSI request, completed through its callback
    Request(ScsiRequest),
    /// An administrative ioctl, completed by the thread waiting on its signal
    Ioctl,
}

impl ScbOwner {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ScbOwner::Request(req) => Some(req.id()),
            ScbOwner::Ioctl => None,
        }
    }
}

/// Streaming DMA mapping held for the current command
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Transfer {
    /// Nothing mapped
    None,
    /// One contiguous buffer
    Bulk { addr: PhysAddr, len: usize },
    /// A mapped scatter list
    Scatter(Vec<DmaSegment>),
}

/// Coherent buffers owned by a slot for its whole life
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScbBuffers {
    pub sg: CoherentRegion,
    pub passthru: CoherentRegion,
    pub ext_passthru: CoherentRegion,
    pub bounce: CoherentRegion,
}

impl ScbBuffers {
    fn alloc<D: DmaMapper>(dma: &D) -> MegaResult<Self> {
        Ok(Self {
            sg: dma.alloc_coherent(MAX_SGLIST * SG64_SIZE)?,
            passthru: dma.alloc_coherent(PASSTHRU_SIZE)?,
            ext_passthru: dma.alloc_coherent(EXT_PASSTHRU_SIZE)?,
            bounce: dma.alloc_coherent(BOUNCE_BUFFER_SIZE)?,
        })
    }

    fn free<D: DmaMapper>(self, dma: &D) {
        dma.free_coherent(self.sg);
        dma.free_coherent(self.passthru);
        dma.free_coherent(self.ext_passthru);
        dma.free_coherent(self.bounce);
    }
}

/// Which queue a slot is linked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueKind {
    Free,
    Pending,
    Internal,
}

/// A command slot
#[derive(Debug)]
pub(crate) struct Scb {
    pub index: u16,
    pub state: ScbState,
    pub owner: Option<ScbOwner>,
    pub command: MailboxCommand,
    pub transfer: Transfer,
    pub direction: DmaDirection,
    pub buffers: ScbBuffers,
    /// Staging buffer of an administrative ioctl
    pub ioctl_buffer: Option<CoherentRegion>,
    /// Bytes of the bounce buffer to copy back on completion
    pub bounce_len: usize,
    /// Addressed to a logical drive
    pub logical: bool,
    queue: Option<QueueKind>,
    next: Option<u16>,
}

impl Scb {
    /// Firmware command id of this slot
    pub fn cmd_id(&self) -> u8 {
        (self.index + 1) as u8
    }

    /// Owning request, if the slot serves one
    pub fn request(&self) -> Option<&ScsiRequest> {
        match &self.owner {
            Some(ScbOwner::Request(req)) => Some(req),
            _ => None,
        }
    }

    /// Queue the slot is linked on
    pub fn queue(&self) -> Option<QueueKind> {
        self.queue
    }
}

// =============================================================================
// POOL
// =============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct ScbQueue {
    head: Option<u16>,
    tail: Option<u16>,
    count: usize,
}

/// Arena of command slots with index-linked FIFO queues
#[derive(Debug)]
pub(crate) struct ScbPool {
    scbs: Vec<Scb>,
    free: ScbQueue,
    pending: ScbQueue,
    internal: ScbQueue,
}

impl ScbPool {
    /// Allocate `count` slots and their coherent buffers
    pub fn new<D: DmaMapper>(count: u16, dma: &D) -> MegaResult<Self> {
        let mut pool = Self {
            scbs: Vec::with_capacity(count as usize),
            free: ScbQueue::default(),
            pending: ScbQueue::default(),
            internal: ScbQueue::default(),
        };
        for index in 0..count {
            let buffers = match ScbBuffers::alloc(dma) {
                Ok(buffers) => buffers,
                Err(err) => {
                    pool.destroy(dma);
                    return Err(err);
                }
            };
            pool.scbs.push(Scb {
                index,
                state: ScbState::Free,
                owner: None,
                command: MailboxCommand::Idle,
                transfer: Transfer::None,
                direction: DmaDirection::None,
                buffers,
                ioctl_buffer: None,
                bounce_len: 0,
                logical: false,
                queue: None,
                next: None,
            });
            pool.push_back(QueueKind::Free, index);
        }
        Ok(pool)
    }

    /// Free every slot's coherent buffers
    pub fn destroy<D: DmaMapper>(&mut self, dma: &D) {
        for scb in self.scbs.drain(..) {
            if let Some(region) = scb.ioctl_buffer {
                dma.free_coherent(region);
            }
            scb.buffers.free(dma);
        }
        self.free = ScbQueue::default();
        self.pending = ScbQueue::default();
        self.internal = ScbQueue::default();
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.scbs.len()
    }

    /// Number of slots on a queue
    pub fn len(&self, kind: QueueKind) -> usize {
        self.queue_ref(kind).count
    }

    pub fn get(&self, index: u16) -> Option<&Scb> {
        self.scbs.get(index as usize)
    }

    pub fn get_mut(&mut self, index: u16) -> Option<&mut Scb> {
        self.scbs.get_mut(index as usize)
    }

    /// Slot indices on a queue, head first
    pub fn ids(&self, kind: QueueKind) -> Vec<u16> {
        let mut ids = Vec::with_capacity(self.queue_ref(kind).count);
        let mut cursor = self.queue_ref(kind).head;
        while let Some(index) = cursor {
            ids.push(index);
            cursor = self.scbs[index as usize].next;
        }
        ids
    }

    /// Slots that are not free
    pub fn busy_ids(&self) -> Vec<u16> {
        self.scbs
            .iter()
            .filter(|scb| scb.state != ScbState::Free)
            .map(|scb| scb.index)
            .collect()
    }

    /// Find the slot serving a request on the pending or internal queue
    pub fn find_request(&self, id: RequestId) -> Option<u16> {
        [QueueKind::Pending, QueueKind::Internal]
            .into_iter()
            .flat_map(|kind| self.ids(kind))
            .find(|&index| {
                self.scbs[index as usize]
                    .owner
                    .as_ref()
                    .and_then(ScbOwner::request_id)
                    == Some(id)
            })
    }

    /// Take a slot off the free queue
    ///
    /// The slot comes back ACTIVE and linked on no queue; the caller must
    /// enqueue or release it before dropping the lock. When every slot is in
    /// use the owner is handed back.
    pub fn allocate(&mut self, owner: ScbOwner) -> Result<u16, ScbOwner> {
        let Some(index) = self.pop_front(QueueKind::Free) else {
            return Err(owner);
        };
        let scb = &mut self.scbs[index as usize];
        scb.state = ScbState::Active;
        scb.owner = Some(owner);
        scb.command = MailboxCommand::Idle;
        scb.transfer = Transfer::None;
        scb.direction = DmaDirection::None;
        scb.bounce_len = 0;
        scb.logical = false;
        Ok(index)
    }

    /// Link a slot at the tail of a queue
    pub fn enqueue(&mut self, kind: QueueKind, index: u16) {
        self.push_back(kind, index);
    }

    /// Return a slot to the free queue
    ///
    /// Unmaps its transfer, frees any ioctl staging buffer and unlinks it
    /// from whichever queue holds it before it becomes allocatable again.
    pub fn release<D: DmaMapper>(&mut self, index: u16, dma: &D) -> Option<ScbOwner> {
        let scb = self.scbs.get_mut(index as usize)?;
        if scb.state == ScbState::Free {
            return None;
        }
        match core::mem::replace(&mut scb.transfer, Transfer::None) {
            Transfer::None => {}
            Transfer::Bulk { addr, len } => dma.unmap_single(addr, len, scb.direction),
            Transfer::Scatter(segments) => dma.unmap_sg(&segments, scb.direction),
        }
        if let Some(region) = scb.ioctl_buffer.take() {
            dma.free_coherent(region);
        }
        let owner = scb.owner.take();
        scb.state = ScbState::Free;
        scb.command = MailboxCommand::Idle;
        scb.bounce_len = 0;
        let queue = scb.queue;

        if let Some(kind) = queue {
            self.unlink(kind, index);
        }
        self.push_back(QueueKind::Free, index);
        owner
    }

    /// Move the whole internal queue in front of the pending queue
    ///
    /// Returns the moved slot indices in their new order.
    pub fn splice_internal_front(&mut self) -> Vec<u16> {
        let moved = self.ids(QueueKind::Internal);
        let (Some(head), Some(tail)) = (self.internal.head, self.internal.tail) else {
            return moved;
        };
        for &index in &moved {
            self.scbs[index as usize].queue = Some(QueueKind::Pending);
        }
        match self.pending.head {
            Some(old_head) => self.scbs[tail as usize].next = Some(old_head),
            None => self.pending.tail = Some(tail),
        }
        self.pending.head = Some(head);
        self.pending.count += self.internal.count;
        self.internal = ScbQueue::default();
        moved
    }

    /// Check queue bookkeeping against the links
    pub fn is_consistent(&self) -> bool {
        let mut linked = 0;
        for kind in [QueueKind::Free, QueueKind::Pending, QueueKind::Internal] {
            let ids = self.ids(kind);
            if ids.len() != self.queue_ref(kind).count {
                return false;
            }
            if ids.last().copied() != self.queue_ref(kind).tail {
                return false;
            }
            for &index in &ids {
                let scb = &self.scbs[index as usize];
                if scb.queue != Some(kind) || (scb.state == ScbState::Free) != (kind == QueueKind::Free) {
                    return false;
                }
            }
            linked += ids.len();
        }
        linked == self.scbs.len()
    }

    // -------------------------------------------------------------------------
    // Links
    // -------------------------------------------------------------------------

    fn queue_ref(&self, kind: QueueKind) -> &ScbQueue {
        match kind {
            QueueKind::Free => &self.free,
            QueueKind::Pending => &self.pending,
            QueueKind::Internal => &self.internal,
        }
    }

    fn queue_mut(&mut self, kind: QueueKind) -> &mut ScbQueue {
        match kind {
            QueueKind::Free => &mut self.free,
            QueueKind::Pending => &mut self.pending,
            QueueKind::Internal => &mut self.internal,
        }
    }

    fn push_back(&mut self, kind: QueueKind, index: u16) {
        let tail = self.queue_ref(kind).tail;
        {
            let scb = &mut self.scbs[index as usize];
            scb.next = None;
            scb.queue = Some(kind);
        }
        match tail {
            Some(tail) => self.scbs[tail as usize].next = Some(index),
            None => self.queue_mut(kind).head = Some(index),
        }
        let queue = self.queue_mut(kind);
        queue.tail = Some(index);
        queue.count += 1;
    }

    fn pop_front(&mut self, kind: QueueKind) -> Option<u16> {
        let head = self.queue_ref(kind).head?;
        let next = self.scbs[head as usize].next.take();
        self.scbs[head as usize].queue = None;
        let queue = self.queue_mut(kind);
        queue.head = next;
        if next.is_none() {
            queue.tail = None;
        }
        queue.count -= 1;
        Some(head)
    }

    fn unlink(&mut self, kind: QueueKind, index: u16) -> bool {
        let mut prev: Option<u16> = None;
        let mut cursor = self.queue_ref(kind).head;
        while let Some(current) = cursor {
            if current == index {
                let next = self.scbs[current as usize].next.take();
                self.scbs[current as usize].queue = None;
                match prev {
                    Some(prev) => self.scbs[prev as usize].next = next,
                    None => self.queue_mut(kind).head = next,
                }
                let queue = self.queue_mut(kind);
                if queue.tail == Some(index) {
                    queue.tail = prev;
                }
                queue.count -= 1;
                return true;
            }
            prev = Some(current);
            cursor = self.scbs[current as usize].next;
        }
        false
    }
}

impl Index<u16> for ScbPool {
    type Output = Scb;

    fn index(&self, index: u16) -> &Scb {
        &self.scbs[index as usize]
    }
}

impl IndexMut<u16> for ScbPool {
    fn index_mut(&mut self, index: u16) -> &mut Scb {
        &mut self.scbs[index as usize]
    }
}
