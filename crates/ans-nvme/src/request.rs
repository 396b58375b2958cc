//! Requests handed to the engine and the bookkeeping kept while they are in flight.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::command::{opcode, Command, Status};
use crate::dma::DmaSegment;
use crate::prp::{PrpMapping, PrpPools};
use crate::tags::{TagAllocator, MAX_QUEUE_DEPTH};

/// What a request asks the controller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOp {
    Read { slba: u64, blocks: u32 },
    Write { slba: u64, blocks: u32 },
    Flush,
    /// Admin command sent as given, apart from the tag and data pointers.
    Admin(Command),
}

impl RequestOp {
    pub fn is_admin(&self) -> bool {
        matches!(self, RequestOp::Admin(_))
    }

    pub(crate) fn build(&self, nsid: u32) -> Command {
        match *self {
            RequestOp::Read { slba, blocks } => {
                Command::read_write(opcode::READ, nsid, slba, blocks)
            }
            RequestOp::Write { slba, blocks } => {
                Command::read_write(opcode::WRITE, nsid, slba, blocks)
            }
            RequestOp::Flush => Command::flush(nsid),
            RequestOp::Admin(cmd) => cmd,
        }
    }

    /// Payload size implied by the block range, for block I/O.
    pub(crate) fn expected_len(&self, lba_shift: u8) -> Option<u64> {
        match *self {
            RequestOp::Read { blocks, .. } | RequestOp::Write { blocks, .. } => {
                Some((blocks as u64) << lba_shift)
            }
            RequestOp::Flush => Some(0),
            RequestOp::Admin(_) => None,
        }
    }
}

/// Final status of a request, delivered exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub tag: u16,
    pub status: Status,
    /// Command-specific result (dword 0 and 1 of the completion entry).
    pub result: u64,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

pub type CompletionFn = Box<dyn FnOnce(Completion) + Send>;

/// A block or admin request from the dispatch layer.
pub struct Request {
    pub op: RequestOp,
    pub segments: Vec<DmaSegment>,
    /// Single integrity buffer for the command's metadata pointer.
    pub metadata: Option<DmaSegment>,
    pub(crate) on_complete: CompletionFn,
}

impl Request {
    pub fn new(
        op: RequestOp,
        segments: Vec<DmaSegment>,
        on_complete: impl FnOnce(Completion) + Send + 'static,
    ) -> Self {
        Self {
            op,
            segments,
            metadata: None,
            on_complete: Box::new(on_complete),
        }
    }

    pub fn read(
        slba: u64,
        blocks: u32,
        segments: Vec<DmaSegment>,
        on_complete: impl FnOnce(Completion) + Send + 'static,
    ) -> Self {
        Self::new(RequestOp::Read { slba, blocks }, segments, on_complete)
    }

    pub fn write(
        slba: u64,
        blocks: u32,
        segments: Vec<DmaSegment>,
        on_complete: impl FnOnce(Completion) + Send + 'static,
    ) -> Self {
        Self::new(RequestOp::Write { slba, blocks }, segments, on_complete)
    }

    pub fn flush(on_complete: impl FnOnce(Completion) + Send + 'static) -> Self {
        Self::new(RequestOp::Flush, Vec::new(), on_complete)
    }

    pub fn admin(
        cmd: Command,
        segments: Vec<DmaSegment>,
        on_complete: impl FnOnce(Completion) + Send + 'static,
    ) -> Self {
        Self::new(RequestOp::Admin(cmd), segments, on_complete)
    }

    pub fn with_metadata(mut self, metadata: DmaSegment) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn payload_len(&self) -> u64 {
        self.segments.iter().map(|s| s.len as u64).sum()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("op", &self.op)
            .field("segments", &self.segments)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Per-tag state of a submitted request.
pub(crate) struct InFlight {
    pub opcode: u8,
    pub mapping: PrpMapping,
    /// `None` for commands whose submitter enforces its own deadline.
    pub deadline: Option<Instant>,
    /// An abort has been issued for this request.
    pub aborted: bool,
    on_complete: CompletionFn,
}

impl InFlight {
    pub fn new(
        opcode: u8,
        mapping: PrpMapping,
        deadline: Option<Instant>,
        on_complete: CompletionFn,
    ) -> Self {
        Self {
            opcode,
            mapping,
            deadline,
            aborted: false,
            on_complete,
        }
    }

    /// Returns the descriptor chain to its pool, then hands the status to the submitter.
    pub fn complete(self, pools: &PrpPools, completion: Completion) {
        self.mapping.release(pools);
        (self.on_complete)(completion);
    }

    /// Drops a request that never reached the controller without notifying the submitter.
    pub fn abandon(self, pools: &PrpPools) {
        self.mapping.release(pools);
    }
}

/// Outstanding requests of one queue, indexed by tag.
pub struct RequestTable {
    tags: TagAllocator,
    slots: Mutex<Vec<Option<InFlight>>>,
    idle: Condvar,
}

impl RequestTable {
    pub fn new(tags: TagAllocator) -> Self {
        let slots = (0..MAX_QUEUE_DEPTH).map(|_| None).collect();
        Self {
            tags,
            slots: Mutex::new(slots),
            idle: Condvar::new(),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Option<InFlight>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tags(&self) -> &TagAllocator {
        &self.tags
    }

    pub(crate) fn reserve(&self) -> Option<u16> {
        self.tags.alloc()
    }

    /// Gives back a reserved tag that never reached the controller.
    pub(crate) fn unreserve(&self, tag: u16) {
        self.tags.free(tag);
    }

    pub(crate) fn install(&self, tag: u16, inflight: InFlight) {
        let mut slots = self.slots();
        debug_assert!(slots[tag as usize].is_none(), "tag {tag} installed twice");
        slots[tag as usize] = Some(inflight);
    }

    /// Removes the request for `tag` and frees the tag. `None` if nothing is outstanding.
    pub(crate) fn take(&self, tag: u16) -> Option<InFlight> {
        let mut slots = self.slots();
        let inflight = slots.get_mut(tag as usize)?.take()?;
        self.tags.free(tag);
        if slots.iter().all(Option::is_none) {
            self.idle.notify_all();
        }
        Some(inflight)
    }

    pub(crate) fn with_request<R>(&self, tag: u16, f: impl FnOnce(&mut InFlight) -> R) -> Option<R> {
        self.slots().get_mut(tag as usize)?.as_mut().map(f)
    }

    pub fn is_outstanding(&self, tag: u16) -> bool {
        self.slots()
            .get(tag as usize)
            .is_some_and(Option::is_some)
    }

    pub fn outstanding(&self) -> usize {
        self.slots().iter().filter(|s| s.is_some()).count()
    }

    pub fn outstanding_tags(&self) -> Vec<u16> {
        self.slots()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(tag, _)| tag as u16)
            .collect()
    }

    /// Tags whose deadline is at or before `now`.
    pub(crate) fn expired(&self, now: Instant) -> Vec<u16> {
        self.slots()
            .iter()
            .enumerate()
            .filter_map(|(tag, s)| match s {
                Some(InFlight {
                    deadline: Some(deadline),
                    ..
                }) if *deadline <= now => Some(tag as u16),
                _ => None,
            })
            .collect()
    }

    /// Waits until nothing is outstanding, calling `poll` between short sleeps so completions are
    /// reaped even without an interrupt source. Returns `false` on timeout.
    pub(crate) fn wait_idle(&self, timeout: Duration, mut poll: impl FnMut()) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.outstanding() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            poll();
            let slots = self.slots();
            if slots.iter().all(Option::is_none) {
                return true;
            }
            let _ = self
                .idle
                .wait_timeout(slots, Duration::from_millis(1))
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl fmt::Debug for RequestTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTable")
            .field("tags", &self.tags.range())
            .field("outstanding", &self.outstanding_tags())
            .finish()
    }
}
