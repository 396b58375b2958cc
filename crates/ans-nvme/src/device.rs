//! The controller instance: queue ownership, submission, completion reaping and the lifecycle
//! operations built on top of them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::boot::{self, Coprocessor};
use crate::command::{
    opcode, Command, CompletionEntry, ControllerIdentity, Status, IDENTIFY_DATA_SIZE,
};
use crate::config::DeviceConfig;
use crate::dma::{DmaContext, DmaPlatform, DmaSegment, CTRL_PAGE_SIZE};
use crate::error::{NvmeError, Result};
use crate::filter::AddressFilter;
use crate::prp::{map_data, PrpPools};
use crate::queue::{CompletionToken, QueuePair, QueueRole, QueueState};
use crate::regs::{
    poll_until, Capabilities, Cc, Csts, Mmio, REG_ACQ, REG_AQA, REG_ASQ, REG_CAP, REG_CC,
    REG_CSTS,
};
use crate::request::{Completion, InFlight, Request, RequestOp};
use crate::reset::ResetSignal;
use crate::state::CtrlState;
use crate::tags::{ADMIN_QUEUE_DEPTH, AEN_TAG, MAX_QUEUE_DEPTH};
use crate::timeout::{AbortBudget, TimeoutAction};

const READY_POLL: Duration = Duration::from_millis(1);
const SYNC_POLL: Duration = Duration::from_millis(1);

/// Host resources the engine runs on.
#[derive(Clone)]
pub struct Platform {
    pub regs: Arc<dyn Mmio>,
    pub dma: Arc<dyn DmaPlatform>,
    pub filter: Arc<dyn AddressFilter>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

/// A decoded asynchronous event completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncEvent {
    /// Event type (error, SMART/health, notice, ...).
    pub kind: u8,
    pub info: u8,
    /// Log page the host should read to clear the event.
    pub log_page: u8,
}

impl AsyncEvent {
    pub fn from_result(result: u32) -> Self {
        Self {
            kind: (result & 0x7) as u8,
            info: (result >> 8) as u8,
            log_page: (result >> 16) as u8,
        }
    }
}

type EventHandler = Arc<dyn Fn(AsyncEvent) + Send + Sync>;

/// What a synchronous admin command does when its deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitPolicy {
    /// Run the timeout state machine, which may disable and reset the controller.
    Escalate,
    /// Report [`NvmeError::Timeout`] and leave the command outstanding. Used where the caller is
    /// already tearing the controller down.
    GiveUp,
}

#[derive(Default)]
struct SyncSlot {
    done: Mutex<Option<Completion>>,
    cv: Condvar,
}

impl SyncSlot {
    fn complete(&self, completion: Completion) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = Some(completion);
        self.cv.notify_all();
    }

    fn take(&self) -> Option<Completion> {
        self.done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn wait(&self, timeout: Duration) -> Option<Completion> {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        if done.is_none() {
            done = self
                .cv
                .wait_timeout(done, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        done.take()
    }
}

/// One ANS2 controller.
pub struct Device {
    pub(crate) regs: Arc<dyn Mmio>,
    pub(crate) ctx: DmaContext,
    pub(crate) config: DeviceConfig,
    pub(crate) pools: PrpPools,
    cap: AtomicU64,
    db_stride: AtomicU32,
    max_transfer: AtomicU64,
    admin: RwLock<Option<Arc<QueuePair>>>,
    io: RwLock<Option<Arc<QueuePair>>>,
    pub(crate) adminq_online: AtomicBool,
    pub(crate) ioq_online: AtomicBool,
    /// Serializes disable against queue setup.
    pub(crate) shutdown_lock: Mutex<()>,
    state: Mutex<CtrlState>,
    /// I/O admission is frozen while the controller is being torn down.
    pub(crate) frozen: AtomicBool,
    /// Set once the controller has been given up on; nothing is admitted afterwards.
    pub(crate) killed: AtomicBool,
    pub(crate) abort_budget: Arc<AbortBudget>,
    identity: Mutex<Option<ControllerIdentity>>,
    event_handler: Mutex<Option<EventHandler>>,
    pub(crate) reset_signal: ResetSignal,
    /// Serializes reset sequences.
    pub(crate) reset_lock: Mutex<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Device {
    /// Boots the coprocessor, prepares the controller for linear submission and allocates the
    /// descriptor pools. The controller is left in [`CtrlState::New`]; [`Device::reset`] brings it
    /// up.
    pub fn probe(
        platform: Platform,
        coprocessor: &dyn Coprocessor,
        config: DeviceConfig,
    ) -> Result<Self> {
        config.validate()?;
        boot::boot(&*platform.regs, coprocessor, &config)?;
        let ctx = DmaContext::new(platform.dma, platform.filter);
        let pools = PrpPools::new(&ctx, config.small_pool_blocks, config.page_pool_pages)?;
        tracing::info!(
            io_queue_depth = config.io_queue_depth,
            "ANS2 controller booted"
        );
        Ok(Self {
            regs: platform.regs,
            ctx,
            pools,
            cap: AtomicU64::new(0),
            db_stride: AtomicU32::new(1),
            max_transfer: AtomicU64::new(config.max_transfer_bytes as u64),
            admin: RwLock::new(None),
            io: RwLock::new(None),
            adminq_online: AtomicBool::new(false),
            ioq_online: AtomicBool::new(false),
            shutdown_lock: Mutex::new(()),
            state: Mutex::new(CtrlState::New),
            frozen: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            abort_budget: Arc::new(AbortBudget::new(config.abort_limit)),
            identity: Mutex::new(None),
            event_handler: Mutex::new(None),
            reset_signal: ResetSignal::default(),
            reset_lock: Mutex::new(()),
            config,
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> CtrlState {
        *lock(&self.state)
    }

    pub(crate) fn change_state(&self, next: CtrlState) -> bool {
        let mut state = lock(&self.state);
        if !state.can_transition_to(next) {
            return false;
        }
        tracing::debug!(from = ?*state, to = ?next, "controller state change");
        *state = next;
        true
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities(self.cap.load(Ordering::Acquire))
    }

    pub fn doorbell_stride(&self) -> u32 {
        self.db_stride.load(Ordering::Acquire)
    }

    pub fn identity(&self) -> Option<ControllerIdentity> {
        lock(&self.identity).clone()
    }

    pub fn abort_budget(&self) -> &AbortBudget {
        &self.abort_budget
    }

    pub fn pools(&self) -> &PrpPools {
        &self.pools
    }

    /// Largest payload accepted per request.
    pub fn max_transfer_bytes(&self) -> u64 {
        self.max_transfer.load(Ordering::Acquire)
    }

    pub fn is_io_online(&self) -> bool {
        self.ioq_online.load(Ordering::Acquire)
    }

    pub fn is_admin_online(&self) -> bool {
        self.adminq_online.load(Ordering::Acquire)
    }

    fn slot(&self, role: QueueRole) -> &RwLock<Option<Arc<QueuePair>>> {
        match role {
            QueueRole::Admin => &self.admin,
            QueueRole::Io => &self.io,
        }
    }

    pub fn queue(&self, role: QueueRole) -> Option<Arc<QueuePair>> {
        self.slot(role)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_queue(&self, role: QueueRole, queue: Option<Arc<QueuePair>>) -> Option<Arc<QueuePair>> {
        let mut slot = self.slot(role).write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, queue)
    }

    pub fn queue_state(&self, role: QueueRole) -> QueueState {
        self.queue(role)
            .map_or(QueueState::Uninitialized, |q| q.state())
    }

    pub(crate) fn timeout_for(&self, role: QueueRole) -> Duration {
        match role {
            QueueRole::Admin => self.config.admin_timeout(),
            QueueRole::Io => self.config.io_timeout(),
        }
    }

    pub(crate) fn csts(&self) -> Csts {
        Csts::from_bits_retain(self.regs.read32(REG_CSTS))
    }

    /// Registers a handler for asynchronous event notifications.
    pub fn set_async_event_handler(&self, handler: impl Fn(AsyncEvent) + Send + Sync + 'static) {
        *lock(&self.event_handler) = Some(Arc::new(handler));
    }

    // ---- controller registers ----

    /// Checks that the register window decodes and latches the capabilities.
    pub fn enable(&self) -> Result<()> {
        if self.csts().is_absent() {
            return Err(NvmeError::NoDevice);
        }
        let cap = Capabilities(self.regs.read64(REG_CAP));
        self.cap.store(cap.0, Ordering::Release);
        self.db_stride
            .store(cap.doorbell_stride(), Ordering::Release);
        tracing::debug!(
            cap = format_args!("{:#018x}", cap.0),
            db_stride = cap.doorbell_stride(),
            "controller capabilities"
        );
        Ok(())
    }

    pub(crate) fn cc_enabled(&self) -> bool {
        Cc::from_bits_retain(self.regs.read32(REG_CC)).contains(Cc::ENABLE)
    }

    fn wait_ready(&self, ready: bool) -> Result<()> {
        let mut absent = false;
        let reached = poll_until(self.capabilities().ready_timeout(), READY_POLL, || {
            let csts = self.csts();
            if csts.is_absent() {
                absent = true;
                return true;
            }
            csts.contains(Csts::RDY) == ready
        });
        if absent {
            return Err(NvmeError::NoDevice);
        }
        if !reached {
            tracing::warn!(
                ready,
                csts = format_args!("{:#x}", self.csts().bits()),
                "device not ready; aborting"
            );
            return Err(NvmeError::Timeout);
        }
        Ok(())
    }

    fn enable_ctrl(&self) -> Result<()> {
        let cc = Cc::ENABLE | Cc::IOSQES | Cc::IOCQES;
        self.regs.write32(REG_CC, cc.bits());
        self.wait_ready(true)
    }

    fn disable_ctrl(&self) -> Result<()> {
        let cc = Cc::from_bits_retain(self.regs.read32(REG_CC)) - Cc::ENABLE - Cc::SHN_MASK;
        self.regs.write32(REG_CC, cc.bits());
        self.wait_ready(false)
    }

    fn shutdown_ctrl(&self) -> Result<()> {
        let cc = (Cc::from_bits_retain(self.regs.read32(REG_CC)) - Cc::SHN_MASK) | Cc::SHN_NORMAL;
        self.regs.write32(REG_CC, cc.bits());
        if poll_until(self.config.shutdown_timeout(), READY_POLL, || {
            self.csts().shutdown_complete()
        }) {
            return Ok(());
        }
        tracing::warn!(
            csts = format_args!("{:#x}", self.csts().bits()),
            "device shutdown incomplete"
        );
        Err(NvmeError::Timeout)
    }

    /// Disables the controller, (re)initializes the admin queue and enables it again.
    pub(crate) fn configure_admin_queue(&self) -> Result<()> {
        self.disable_ctrl()?;
        let stride = self.doorbell_stride();
        let queue = match self.queue(QueueRole::Admin) {
            Some(queue) => {
                queue.reset_for_reuse(&*self.regs, stride);
                queue
            }
            None => {
                let queue = Arc::new(QueuePair::allocate(
                    &self.ctx,
                    &*self.regs,
                    QueueRole::Admin,
                    ADMIN_QUEUE_DEPTH,
                    stride,
                )?);
                self.set_queue(QueueRole::Admin, Some(queue.clone()));
                queue
            }
        };
        let aqa = queue.depth() as u32 - 1;
        self.regs.write32(REG_AQA, aqa | aqa << 16);
        self.regs.write64(REG_ASQ, queue.sq_addr());
        self.regs.write64(REG_ACQ, queue.cq_addr());
        self.enable_ctrl()?;
        self.adminq_online.store(true, Ordering::Release);
        queue.enable();
        Ok(())
    }

    // ---- submission ----

    /// Submits `request` to the queue for `role` and returns the tag it was given.
    ///
    /// Fails with [`NvmeError::NotReady`] while the queue is suspended or the controller is
    /// resetting, [`NvmeError::ResourceExhausted`] when no tag or descriptor page is free and
    /// [`NvmeError::Io`] for malformed transfers. On error nothing was sent and the completion
    /// callback is dropped without being called.
    pub fn submit(&self, role: QueueRole, request: Request) -> Result<u16> {
        if self.killed.load(Ordering::Acquire) {
            return Err(NvmeError::NotReady);
        }
        if role == QueueRole::Io
            && (self.frozen.load(Ordering::Acquire)
                || !self.ioq_online.load(Ordering::Acquire)
                || !self.state().admits_io())
        {
            return Err(NvmeError::NotReady);
        }
        let queue = self.queue(role).ok_or(NvmeError::NotReady)?;
        let deadline = Instant::now() + self.timeout_for(role);
        self.submit_to(&queue, request, Some(deadline))
    }

    fn check_geometry(&self, op: &RequestOp, segments: &[DmaSegment], length: u64) -> Result<()> {
        if let RequestOp::Read { blocks, .. } | RequestOp::Write { blocks, .. } = *op {
            if blocks == 0 || blocks > 0x1_0000 {
                return Err(NvmeError::Io(format!("block count {blocks} out of range")));
            }
        }
        if segments.len() > self.config.max_segments {
            return Err(NvmeError::Io(format!(
                "{} fragments exceed the limit of {}",
                segments.len(),
                self.config.max_segments
            )));
        }
        if length > self.max_transfer_bytes() {
            return Err(NvmeError::Io(format!(
                "{length} byte transfer exceeds the limit of {}",
                self.max_transfer_bytes()
            )));
        }
        if let Some(expected) = op.expected_len(self.config.lba_shift) {
            if expected != length {
                return Err(NvmeError::Io(format!(
                    "payload of {length} bytes does not match {expected} bytes of blocks"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn submit_to(
        &self,
        queue: &QueuePair,
        request: Request,
        deadline: Option<Instant>,
    ) -> Result<u16> {
        let Request {
            op,
            segments,
            metadata,
            on_complete,
        } = request;
        if op.is_admin() != (queue.role() == QueueRole::Admin) {
            return Err(NvmeError::Io(format!(
                "{op:?} cannot be sent on the {:?} queue",
                queue.role()
            )));
        }
        let length: u64 = segments.iter().map(|s| s.len as u64).sum();
        self.check_geometry(&op, &segments, length)?;

        let mut cmd = op.build(self.config.nsid);
        let requests = queue.requests();
        let tag = requests
            .reserve()
            .ok_or(NvmeError::ResourceExhausted("command tags"))?;
        let mapping = match map_data(&self.pools, &segments, length as usize) {
            Ok(mapping) => mapping,
            Err(err) => {
                requests.unreserve(tag);
                return Err(err);
            }
        };
        // Queue creation commands carry their ring address in PRP1 and no payload.
        if length > 0 {
            cmd.prp1 = mapping.prp1;
            cmd.prp2 = mapping.prp2;
        }
        if let Some(meta) = metadata {
            cmd.metadata = meta.addr;
        }
        cmd.command_id = tag;

        requests.install(tag, InFlight::new(cmd.opcode, mapping, deadline, on_complete));
        match queue.submit(&*self.regs, tag, &cmd) {
            Ok(()) => Ok(tag),
            Err(err) => match requests.take(tag) {
                Some(inflight) => {
                    inflight.abandon(&self.pools);
                    Err(err)
                }
                // Cancelled by a concurrent disable; the submitter has already been told.
                None => Ok(tag),
            },
        }
    }

    /// Arms the long-lived asynchronous event request on its reserved admin tag.
    pub fn submit_async_event(&self) -> Result<()> {
        let queue = self.queue(QueueRole::Admin).ok_or(NvmeError::NotReady)?;
        queue.submit(&*self.regs, AEN_TAG, &Command::async_event())
    }

    // ---- completion ----

    /// Consumes every posted completion on `role`'s queue, waiting for a concurrent drainer to
    /// finish first. Returns the number of entries consumed.
    pub fn drain(&self, role: QueueRole) -> u32 {
        let Some(queue) = self.queue(role) else {
            return 0;
        };
        let token = queue.completion_token();
        self.reap(&queue, token)
    }

    fn try_drain(&self, role: QueueRole) -> u32 {
        let Some(queue) = self.queue(role) else {
            return 0;
        };
        let Some(token) = queue.try_completion_token() else {
            return 0;
        };
        self.reap(&queue, token)
    }

    /// Interrupt entry point. Returns whether any completion was consumed.
    pub fn handle_irq(&self) -> bool {
        let mut handled = false;
        if self.adminq_online.load(Ordering::Acquire) && self.try_drain(QueueRole::Admin) > 0 {
            handled = true;
        }
        if self.ioq_online.load(Ordering::Acquire) && self.try_drain(QueueRole::Io) > 0 {
            handled = true;
        }
        handled
    }

    fn reap(&self, queue: &QueuePair, mut token: CompletionToken<'_>) -> u32 {
        let mut finished = Vec::new();
        let mut events = Vec::new();
        while let Some(cqe) = token.next_entry() {
            let tag = cqe.command_id;
            if tag >= MAX_QUEUE_DEPTH {
                tracing::warn!(qid = queue.qid(), tag, "invalid id completed");
                continue;
            }
            queue.tracking().invalidate(&*self.regs, tag);
            if queue.role() == QueueRole::Admin && tag == AEN_TAG {
                events.push(cqe);
                continue;
            }
            match queue.requests().take(tag) {
                Some(inflight) => finished.push((
                    inflight,
                    Completion {
                        tag,
                        status: cqe.status(),
                        result: cqe.result,
                    },
                )),
                None => tracing::warn!(
                    qid = queue.qid(),
                    tag,
                    sq_id = cqe.sq_id,
                    "completion for unknown tag"
                ),
            }
        }
        let consumed = token.finish(&*self.regs);
        for (inflight, completion) in finished {
            inflight.complete(&self.pools, completion);
        }
        for cqe in events {
            self.complete_async_event(cqe);
        }
        consumed
    }

    fn complete_async_event(&self, cqe: CompletionEntry) {
        let status = cqe.status();
        if !status.is_success() {
            tracing::debug!(%status, "async event request ended");
            return;
        }
        let event = AsyncEvent::from_result(cqe.result as u32);
        tracing::debug!(?event, "async event");
        let handler = lock(&self.event_handler).clone();
        if let Some(handler) = handler {
            handler(event);
        }
        if self.state() == CtrlState::Live {
            if let Err(err) = self.submit_async_event() {
                tracing::debug!(error = %err, "async event request not re-armed");
            }
        }
    }

    /// Completes everything outstanding on `queue` with a host-aborted status, without waiting
    /// for the controller. Only valid once the queue is suspended.
    pub(crate) fn cancel_outstanding(&self, queue: &QueuePair) -> usize {
        let tags = queue.requests().outstanding_tags();
        let mut cancelled = 0;
        for tag in tags {
            queue.tracking().discard(tag);
            if let Some(inflight) = queue.requests().take(tag) {
                tracing::debug!(qid = queue.qid(), tag, "cancelling I/O");
                inflight.complete(
                    &self.pools,
                    Completion {
                        tag,
                        status: Status::HOST_ABORTED,
                        result: 0,
                    },
                );
                cancelled += 1;
            }
        }
        if queue.role() == QueueRole::Admin {
            queue.tracking().discard(AEN_TAG);
        }
        cancelled
    }

    // ---- synchronous admin commands ----

    fn execute_admin(
        &self,
        cmd: Command,
        data: &[DmaSegment],
        policy: WaitPolicy,
    ) -> Result<Completion> {
        let queue = self.queue(QueueRole::Admin).ok_or(NvmeError::NotReady)?;
        let slot = Arc::new(SyncSlot::default());
        let waiter = slot.clone();
        let request = Request::admin(cmd, data.to_vec(), move |c| waiter.complete(c));
        // The waiter below owns the deadline; the background scan leaves this command alone.
        let tag = self.submit_to(&queue, request, None)?;

        let timeout = self.config.admin_timeout();
        let mut deadline = Instant::now() + timeout;
        loop {
            self.drain(QueueRole::Admin);
            if let Some(completion) = slot.wait(SYNC_POLL) {
                return Ok(completion);
            }
            if Instant::now() < deadline {
                continue;
            }
            match policy {
                WaitPolicy::GiveUp => {
                    tracing::warn!(tag, opcode = cmd.opcode, "admin command timed out");
                    return Err(NvmeError::Timeout);
                }
                WaitPolicy::Escalate => match self.handle_timeout(QueueRole::Admin, tag) {
                    TimeoutAction::ResetTimer => deadline = Instant::now() + timeout,
                    TimeoutAction::Done => {
                        return match slot.take() {
                            Some(c) if c.status != Status::HOST_ABORTED => Ok(c),
                            _ => Err(NvmeError::Timeout),
                        }
                    }
                },
            }
        }
    }

    /// Runs an admin command to completion and returns its result dword.
    pub(crate) fn admin_command(
        &self,
        cmd: Command,
        data: &[DmaSegment],
        policy: WaitPolicy,
    ) -> Result<u64> {
        let completion = self.execute_admin(cmd, data, policy)?;
        if !completion.is_success() {
            return Err(NvmeError::CommandFailed {
                opcode: cmd.opcode,
                status: completion.status.raw(),
            });
        }
        Ok(completion.result)
    }

    /// Reads the Identify Controller data structure.
    pub fn identify(&self) -> Result<ControllerIdentity> {
        let buf = self.ctx.alloc(IDENTIFY_DATA_SIZE)?;
        let data = [DmaSegment::new(buf.addr(), IDENTIFY_DATA_SIZE as u32)];
        self.admin_command(Command::identify_controller(), &data, WaitPolicy::Escalate)?;
        let mut raw = vec![0u8; IDENTIFY_DATA_SIZE];
        buf.read_at(0, &mut raw);
        ControllerIdentity::parse(&raw).ok_or_else(|| NvmeError::Io("short identify data".into()))
    }

    /// Identifies the controller and applies its limits.
    pub(crate) fn init_identify(&self) -> Result<()> {
        let id = self.identify()?;
        let limit = self.config.abort_limit.min(id.acl as u16 + 1);
        self.abort_budget.set_limit(limit);
        let mut max = self.config.max_transfer_bytes as u64;
        if let Some(mdts) = id.max_transfer_bytes(CTRL_PAGE_SIZE) {
            max = max.min(mdts);
        }
        self.max_transfer.store(max, Ordering::Release);
        tracing::info!(
            model = %id.model,
            serial = %id.serial,
            firmware = %id.firmware,
            abort_limit = limit,
            max_transfer = max,
            "controller identified"
        );
        *lock(&self.identity) = Some(id);
        Ok(())
    }

    /// Asks for `count` I/O queue pairs and returns how many were granted. A controller that
    /// rejects the request grants none.
    pub fn set_queue_count(&self, count: u16) -> Result<u16> {
        match self.admin_command(Command::set_queue_count(count), &[], WaitPolicy::Escalate) {
            Ok(result) => {
                let result = result as u32;
                let granted = (result & 0xffff).min(result >> 16) + 1;
                Ok(granted.min(count as u32) as u16)
            }
            Err(NvmeError::CommandFailed { status, .. }) => {
                tracing::warn!(status = format_args!("{status:#x}"), "could not set queue count");
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    // ---- I/O queue lifecycle ----

    /// Creates the I/O queue pair on the controller. Only valid while connecting.
    pub fn create_io_queue(&self) -> Result<()> {
        let stride = self.doorbell_stride();
        let queue = match self.queue(QueueRole::Io) {
            Some(queue) => {
                queue.reset_for_reuse(&*self.regs, stride);
                queue
            }
            None => {
                let queue = Arc::new(QueuePair::allocate(
                    &self.ctx,
                    &*self.regs,
                    QueueRole::Io,
                    self.config.io_queue_depth,
                    stride,
                )?);
                self.set_queue(QueueRole::Io, Some(queue.clone()));
                queue
            }
        };
        let qid = queue.qid();
        let depth = queue.depth();

        self.admin_command(
            Command::create_cq(qid, depth, queue.cq_addr(), 0),
            &[],
            WaitPolicy::Escalate,
        )?;
        if let Err(err) = self.admin_command(
            Command::create_sq(qid, depth, queue.sq_addr(), qid),
            &[],
            WaitPolicy::Escalate,
        ) {
            self.delete_hw_queue(opcode::DELETE_CQ);
            return Err(err);
        }

        // Give up if a disable is running.
        let guard = match self.shutdown_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => None,
        };
        let state = self.state();
        if guard.is_none() || state != CtrlState::Connecting {
            drop(guard);
            self.delete_hw_queue(opcode::DELETE_SQ);
            self.delete_hw_queue(opcode::DELETE_CQ);
            return Err(NvmeError::InvalidState { state });
        }
        self.ioq_online.store(true, Ordering::Release);
        queue.enable();
        tracing::debug!(qid, depth, "I/O queue created");
        Ok(())
    }

    fn delete_hw_queue(&self, opcode: u8) {
        let qid = QueueRole::Io.qid();
        if let Err(err) =
            self.admin_command(Command::delete_queue(opcode, qid), &[], WaitPolicy::GiveUp)
        {
            tracing::warn!(qid, opcode, error = %err, "failed to delete queue");
        }
    }

    /// Deletes the I/O queue pair on the controller (submission ring first) and takes it
    /// offline. Requests the controller dropped are completed with an error.
    pub fn delete_io_queue(&self) -> Result<()> {
        let Some(queue) = self.queue(QueueRole::Io) else {
            return Ok(());
        };
        if !self.ioq_online.load(Ordering::Acquire) {
            return Ok(());
        }
        let qid = queue.qid();
        self.admin_command(
            Command::delete_queue(opcode::DELETE_SQ, qid),
            &[],
            WaitPolicy::GiveUp,
        )?;
        if let Err(err) = self.admin_command(
            Command::delete_queue(opcode::DELETE_CQ, qid),
            &[],
            WaitPolicy::GiveUp,
        ) {
            queue.set_delete_error(true);
            return Err(err);
        }
        queue.suspend();
        self.ioq_online.store(false, Ordering::Release);
        self.drain(QueueRole::Io);
        self.cancel_outstanding(&queue);
        Ok(())
    }

    // ---- disable ----

    /// Quiesces the controller: freezes I/O admission, deletes the I/O queue, disables (or with
    /// `shutdown`, shuts down) the controller, suspends both queues and completes everything
    /// still outstanding with an error. Idempotent.
    pub fn disable(&self, shutdown: bool) {
        let _guard = lock(&self.shutdown_lock);
        let csts = self.csts();
        let state = self.state();
        let freeze = matches!(state, CtrlState::Live | CtrlState::Resetting);
        if freeze {
            self.frozen.store(true, Ordering::Release);
        }
        let dead = csts.contains(Csts::CFS) || !csts.contains(Csts::RDY);
        let io = self.queue(QueueRole::Io);
        let admin = self.queue(QueueRole::Admin);

        if !dead && shutdown && freeze {
            if let Some(io) = &io {
                let drained = io.requests().wait_idle(self.config.io_timeout(), || {
                    self.drain(QueueRole::Io);
                });
                if !drained {
                    tracing::warn!("outstanding I/O did not finish before shutdown");
                }
            }
        }

        if !dead && admin.is_some() {
            if let Err(err) = self.delete_io_queue() {
                tracing::warn!(error = %err, "I/O queue deletion failed");
            }
            let res = if shutdown {
                self.shutdown_ctrl()
            } else {
                self.disable_ctrl()
            };
            if let Err(err) = res {
                tracing::warn!(shutdown, error = %err, "controller did not stop cleanly");
            }
            self.drain(QueueRole::Admin);
        }

        if let Some(io) = &io {
            io.suspend();
            self.ioq_online.store(false, Ordering::Release);
        }
        if let Some(admin) = &admin {
            admin.suspend();
            self.adminq_online.store(false, Ordering::Release);
        }
        if io.is_some() {
            self.drain(QueueRole::Io);
        }

        let mut cancelled = 0;
        if let Some(io) = &io {
            cancelled += self.cancel_outstanding(io);
        }
        if let Some(admin) = &admin {
            cancelled += self.cancel_outstanding(admin);
        }
        if shutdown {
            // Let frozen submitters through so they fail fast on the suspended queues.
            self.frozen.store(false, Ordering::Release);
        }
        tracing::info!(
            shutdown,
            dead,
            csts = format_args!("{:#x}", csts.bits()),
            cancelled,
            "controller disabled"
        );
    }

    /// Shuts the controller down for good and releases its queues.
    pub fn remove(&self) {
        self.change_state(CtrlState::Deleting);
        self.disable(true);
        self.killed.store(true, Ordering::Release);
        for role in [QueueRole::Io, QueueRole::Admin] {
            if let Some(queue) = self.set_queue(role, None) {
                queue.release(&*self.regs);
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        for role in [QueueRole::Io, QueueRole::Admin] {
            if let Some(queue) = self.queue(role) {
                queue.suspend();
                self.cancel_outstanding(&queue);
            }
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("state", &self.state())
            .field("admin", &self.queue(QueueRole::Admin))
            .field("io", &self.queue(QueueRole::Io))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::NoFilter;
    use crate::regs::ANS_BOOT_STATUS;
    use crate::regs::ANS_BOOT_STATUS_OK;
    use crate::testutil::{RecordingMmio, VecMemory};

    struct Ready;

    impl Coprocessor for Ready {
        fn boot_and_wait(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    fn platform() -> (Arc<RecordingMmio>, Platform) {
        let regs = Arc::new(RecordingMmio::default());
        regs.set(ANS_BOOT_STATUS, ANS_BOOT_STATUS_OK);
        let platform = Platform {
            regs: regs.clone(),
            dma: Arc::new(VecMemory::new(4 << 20)),
            filter: Arc::new(NoFilter),
        };
        (regs, platform)
    }

    #[test]
    fn probe_rejects_bad_config() {
        let (_regs, platform) = platform();
        let config = DeviceConfig {
            io_queue_depth: 16,
            ..DeviceConfig::default()
        };
        let err = Device::probe(platform, &Ready, config).unwrap_err();
        assert!(matches!(err, NvmeError::InvalidConfig(_)));
    }

    #[test]
    fn nothing_is_admitted_before_reset() {
        let (_regs, platform) = platform();
        let dev = Device::probe(platform, &Ready, DeviceConfig::default()).unwrap();
        assert_eq!(dev.state(), CtrlState::New);
        assert_eq!(dev.queue_state(QueueRole::Io), QueueState::Uninitialized);
        let err = dev
            .submit(QueueRole::Io, Request::flush(|_| panic!("must not complete")))
            .unwrap_err();
        assert_eq!(err, NvmeError::NotReady);
        assert!(err.is_retryable());
        assert!(!dev.handle_irq());
    }

    #[test]
    fn enable_reports_missing_controller() {
        let (regs, platform) = platform();
        let dev = Device::probe(platform, &Ready, DeviceConfig::default()).unwrap();
        regs.set(REG_CSTS, u32::MAX);
        assert_eq!(dev.enable(), Err(NvmeError::NoDevice));
    }

    #[test]
    fn enable_latches_doorbell_stride() {
        let (regs, platform) = platform();
        let dev = Device::probe(platform, &Ready, DeviceConfig::default()).unwrap();
        // DSTRD = 2 -> 4 words between doorbells.
        regs.set(REG_CAP + 4, 2);
        dev.enable().unwrap();
        assert_eq!(dev.doorbell_stride(), 4);
    }

    #[test]
    fn async_event_fields() {
        let ev = AsyncEvent::from_result(0x0002_0301);
        assert_eq!(
            ev,
            AsyncEvent {
                kind: 1,
                info: 3,
                log_page: 2
            }
        );
    }
}
