//! Submission/completion queue pairs.
//!
//! ANS2 runs its submission rings in linear mode: the host copies a command into the slot for its
//! tag and rings a per-queue doorbell with the tag itself. Completions still arrive in order on a
//! conventional completion ring whose entries carry a phase bit that flips on every wrap.

use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use crate::command::{Command, CompletionEntry, COMMAND_SIZE, COMPLETION_SIZE, SQ_ENTRY_SHIFT};
use crate::dma::{dma_rmb, dma_wmb, DmaBuffer, DmaContext};
use crate::error::{NvmeError, Result};
use crate::regs::{
    cq_doorbell, Mmio, ANS_LINEAR_ASQ_DB, ANS_LINEAR_IOSQ_DB, NVMMU_BASE_ASQ, NVMMU_BASE_IOSQ,
};
use crate::request::RequestTable;
use crate::tags::{TagAllocator, ADMIN_QUEUE_DEPTH, MAX_QUEUE_DEPTH};
use crate::tcb::TrackingTable;

/// The two queue pairs the controller supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum QueueRole {
    Admin,
    Io,
}

impl QueueRole {
    pub fn qid(self) -> u16 {
        match self {
            QueueRole::Admin => 0,
            QueueRole::Io => 1,
        }
    }

    fn linear_doorbell(self) -> u64 {
        match self {
            QueueRole::Admin => ANS_LINEAR_ASQ_DB,
            QueueRole::Io => ANS_LINEAR_IOSQ_DB,
        }
    }

    fn tcb_base(self) -> u64 {
        match self {
            QueueRole::Admin => NVMMU_BASE_ASQ,
            QueueRole::Io => NVMMU_BASE_IOSQ,
        }
    }

    fn tags(self, depth: u16) -> TagAllocator {
        match self {
            QueueRole::Admin => TagAllocator::admin(),
            QueueRole::Io => TagAllocator::io(depth),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum QueueState {
    Uninitialized = 0,
    Allocated = 1,
    Enabled = 2,
    Suspended = 3,
}

impl QueueState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => QueueState::Allocated,
            2 => QueueState::Enabled,
            3 => QueueState::Suspended,
            _ => QueueState::Uninitialized,
        }
    }
}

#[derive(Debug)]
struct CqCursor {
    head: u16,
    phase: bool,
}

/// One submission ring, its completion ring and tracking table, and the requests outstanding on
/// them.
pub struct QueuePair {
    role: QueueRole,
    /// Completion ring entries.
    depth: u16,
    sq: DmaBuffer,
    cq: DmaBuffer,
    tcbs: TrackingTable,
    cq_db: AtomicU64,
    state: AtomicU8,
    /// Set when the controller refused to delete this queue during shutdown.
    delete_error: AtomicBool,
    sq_lock: Mutex<()>,
    cursor: Mutex<CqCursor>,
    requests: RequestTable,
}

impl QueuePair {
    /// Allocates the rings and the tracking table.
    ///
    /// The tracking table base register is written here. If a later allocation fails it is pointed
    /// back at zero before the table memory is released.
    pub fn allocate(
        ctx: &DmaContext,
        regs: &dyn Mmio,
        role: QueueRole,
        depth: u16,
        db_stride: u32,
    ) -> Result<Self> {
        let depth = match role {
            QueueRole::Admin => ADMIN_QUEUE_DEPTH,
            QueueRole::Io => depth,
        };
        let cq = ctx.alloc(depth as usize * COMPLETION_SIZE)?;
        let tcbs = TrackingTable::new(ctx, regs, role.tcb_base())?;
        // Linear mode indexes the ring by tag, and tags span the whole controller.
        let sq = match ctx.alloc(MAX_QUEUE_DEPTH as usize * COMMAND_SIZE) {
            Ok(sq) => sq,
            Err(err) => {
                tcbs.unregister(regs);
                return Err(err);
            }
        };
        tracing::debug!(
            ?role,
            depth,
            sq = format_args!("{:#x}", sq.addr()),
            cq = format_args!("{:#x}", cq.addr()),
            tcb = format_args!("{:#x}", tcbs.addr()),
            "allocated queue pair"
        );
        Ok(Self {
            role,
            depth,
            sq,
            cq,
            tcbs,
            cq_db: AtomicU64::new(cq_doorbell(role.qid(), db_stride)),
            state: AtomicU8::new(QueueState::Allocated as u8),
            delete_error: AtomicBool::new(false),
            sq_lock: Mutex::new(()),
            cursor: Mutex::new(CqCursor {
                head: 0,
                phase: true,
            }),
            requests: RequestTable::new(role.tags(depth)),
        })
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    pub fn qid(&self) -> u16 {
        self.role.qid()
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn sq_addr(&self) -> u64 {
        self.sq.addr()
    }

    pub fn cq_addr(&self) -> u64 {
        self.cq.addr()
    }

    pub fn tracking(&self) -> &TrackingTable {
        &self.tcbs
    }

    pub fn requests(&self) -> &RequestTable {
        &self.requests
    }

    pub fn state(&self) -> QueueState {
        QueueState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == QueueState::Enabled
    }

    pub fn enable(&self) {
        self.state
            .store(QueueState::Enabled as u8, Ordering::Release);
    }

    /// Stops admitting submissions. Returns whether the queue was already suspended.
    pub fn suspend(&self) -> bool {
        let prev = self
            .state
            .swap(QueueState::Suspended as u8, Ordering::AcqRel);
        fence(Ordering::SeqCst);
        // Wait out a submitter that saw the queue enabled.
        drop(self.sq_lock.lock().unwrap_or_else(PoisonError::into_inner));
        prev == QueueState::Suspended as u8
    }

    pub fn delete_error(&self) -> bool {
        self.delete_error.load(Ordering::Acquire)
    }

    pub fn set_delete_error(&self, failed: bool) {
        self.delete_error.store(failed, Ordering::Release);
    }

    /// Returns the rings to their power-on state for reuse after a controller reset.
    pub fn reset_for_reuse(&self, regs: &dyn Mmio, db_stride: u32) {
        let mut cursor = self.cursor();
        cursor.head = 0;
        cursor.phase = true;
        self.cq.zero();
        self.sq.zero();
        self.tcbs.reset(regs);
        self.cq_db
            .store(cq_doorbell(self.qid(), db_stride), Ordering::Release);
        self.delete_error.store(false, Ordering::Release);
        dma_wmb();
    }

    /// Detaches the tracking table from the controller ahead of freeing the queue.
    pub fn release(&self, regs: &dyn Mmio) {
        self.tcbs.unregister(regs);
        self.state
            .store(QueueState::Uninitialized as u8, Ordering::Release);
    }

    /// Arms the tracking entry for `tag`, copies `cmd` into the tag's ring slot and rings the
    /// linear doorbell.
    ///
    /// The tracking entry must be complete before the command becomes visible, and both must be
    /// visible before the doorbell; a refused arm leaves the ring untouched.
    pub fn submit(&self, regs: &dyn Mmio, tag: u16, cmd: &Command) -> Result<()> {
        let _sq = self.sq_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_enabled() {
            return Err(NvmeError::NotReady);
        }
        self.tcbs.arm(tag, cmd)?;
        let mut cmd = *cmd;
        cmd.command_id = tag;
        self.sq
            .write_at((tag as usize) << SQ_ENTRY_SHIFT, &cmd.to_bytes());
        dma_wmb();
        regs.write32(self.role.linear_doorbell(), tag as u32);
        Ok(())
    }

    /// Reads back the command stored in the ring slot for `tag`.
    pub fn sq_entry(&self, tag: u16) -> Command {
        let mut bytes = [0u8; COMMAND_SIZE];
        self.sq.read_at((tag as usize) << SQ_ENTRY_SHIFT, &mut bytes);
        Command::parse(&bytes)
    }

    fn cursor(&self) -> MutexGuard<'_, CqCursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive right to consume completions, waiting for any other holder.
    pub fn completion_token(&self) -> CompletionToken<'_> {
        CompletionToken {
            queue: self,
            cursor: self.cursor(),
            consumed: 0,
        }
    }

    /// Like [`completion_token`](Self::completion_token), but gives up if another context is
    /// already draining.
    pub fn try_completion_token(&self) -> Option<CompletionToken<'_>> {
        let cursor = match self.cursor.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(CompletionToken {
            queue: self,
            cursor,
            consumed: 0,
        })
    }

    /// Current completion head and expected phase.
    pub fn cq_position(&self) -> (u16, bool) {
        let cursor = self.cursor();
        (cursor.head, cursor.phase)
    }
}

impl fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePair")
            .field("role", &self.role)
            .field("depth", &self.depth)
            .field("state", &self.state())
            .field("requests", &self.requests)
            .finish_non_exhaustive()
    }
}

/// Held while draining a completion ring; at most one exists per queue.
pub struct CompletionToken<'a> {
    queue: &'a QueuePair,
    cursor: MutexGuard<'a, CqCursor>,
    consumed: u32,
}

impl CompletionToken<'_> {
    fn slot(&self) -> usize {
        self.cursor.head as usize * COMPLETION_SIZE
    }

    /// Whether the entry at the head has been written by the controller in the current lap.
    pub fn pending(&self) -> bool {
        let mut word = [0u8; 2];
        self.queue.cq.read_at(self.slot() + 14, &mut word);
        (u16::from_le_bytes(word) & 1 == 1) == self.cursor.phase
    }

    /// Consumes the entry at the head, if the controller has posted one.
    pub fn next_entry(&mut self) -> Option<CompletionEntry> {
        if !self.pending() {
            return None;
        }
        // The rest of the entry must not be read ahead of the phase bit.
        dma_rmb();
        let mut bytes = [0u8; COMPLETION_SIZE];
        self.queue.cq.read_at(self.slot(), &mut bytes);
        self.cursor.head += 1;
        if self.cursor.head == self.queue.depth {
            self.cursor.head = 0;
            self.cursor.phase = !self.cursor.phase;
        }
        self.consumed += 1;
        Some(CompletionEntry::parse(&bytes))
    }

    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    /// Publishes the new head to the controller if anything was consumed.
    pub fn finish(self, regs: &dyn Mmio) -> u32 {
        if self.consumed > 0 {
            regs.write32(
                self.queue.cq_db.load(Ordering::Acquire),
                self.cursor.head as u32,
            );
        }
        self.consumed
    }
}
