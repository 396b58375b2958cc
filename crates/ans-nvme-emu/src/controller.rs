//! Register-level model of an ANS2 controller.
//!
//! Commands are executed synchronously from the doorbell write that submits them, so a test sees
//! the completion entry in memory as soon as `submit` returns. Fault injection knobs hold
//! commands back, fail the controller or corrupt register reads.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ans_nvme::command::{opcode, COMMAND_SIZE, COMPLETION_SIZE, FEATURE_NUM_QUEUES, IDENTIFY_DATA_SIZE};
use ans_nvme::prp::walk_prps;
use ans_nvme::regs::{
    Cc, Csts, ANS_BOOT_STATUS, ANS_BOOT_STATUS_OK, ANS_LINEAR_ASQ_DB, ANS_LINEAR_IOSQ_DB,
    ANS_LINEAR_SQ_CTRL, ANS_LINEAR_SQ_EN, NVMMU_BASE_ASQ, NVMMU_BASE_IOSQ, NVMMU_TCB_INVAL,
    NVMMU_TCB_STAT, REG_ACQ, REG_AQA, REG_ASQ, REG_CAP, REG_CC, REG_CSTS, REG_DOORBELLS, REG_VS,
};
use ans_nvme::tcb::{TrackingEntry, TCB_SIZE};
use ans_nvme::{Command, CompletionEntry, DmaMemory, Mmio, Status};

use crate::memory::EmuMemory;
use crate::sart::EmuSart;

const PAGE_SIZE: u64 = 4096;
const MAX_TAGS: u16 = 64;
const MAX_QUEUE_ENTRIES: u16 = 64;
const IO_QID: u16 = 1;
const INVALID_QUEUE_DELETION: Status = Status::new(1, 0x0c, true);

/// Controller personality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmuConfig {
    /// Namespace size in logical blocks.
    pub blocks: u64,
    pub lba_shift: u8,
    pub nsid: u32,
    /// Reported maximum data transfer size (power of two in 4 KiB pages, 0 = unlimited).
    pub mdts: u8,
    /// Reported abort command limit (0-based).
    pub acl: u8,
    /// Whether Set Features (Number of Queues) succeeds. When it fails the host runs admin-only.
    pub grant_io_queues: bool,
    /// `CAP.DSTRD`.
    pub doorbell_stride_shift: u8,
    /// Whether an abort that finds its target completes the target with Abort Requested.
    pub abort_completes_target: bool,
}

impl Default for EmuConfig {
    fn default() -> Self {
        Self {
            blocks: 1024,
            lba_shift: 12,
            nsid: 1,
            mdts: 8,
            acl: 3,
            grant_io_queues: true,
            doorbell_stride_shift: 0,
            abort_completes_target: true,
        }
    }
}

/// What the controller has seen, for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmuStats {
    /// Opcodes of every admin command fetched, in order.
    pub admin_opcodes: Vec<u8>,
    pub io_commands: u64,
    pub aborts: u32,
    pub flushes: u32,
    /// Doorbells whose tracking entry did not describe the command in the ring slot.
    pub tcb_violations: u32,
    /// Tags written to the TCB invalidate register, in order.
    pub invalidated: Vec<u16>,
    /// `CC.EN` 1 -> 0 transitions.
    pub controller_resets: u32,
    pub shutdowns: u32,
    /// Ring, tracking-table or completion accesses outside every SART window.
    pub filter_violations: u32,
    /// Doorbells ignored because the controller could not take them.
    pub dropped_doorbells: u32,
}

impl EmuStats {
    pub fn admin_count(&self, op: u8) -> usize {
        self.admin_opcodes.iter().filter(|&&o| o == op).count()
    }
}

#[derive(Debug)]
struct Sq {
    base: u64,
}

#[derive(Debug)]
struct Cq {
    base: u64,
    size: u16,
    head: u16,
    tail: u16,
    phase: bool,
    /// Entries waiting for the host to free a slot.
    backlog: VecDeque<(u16, u16, Status, u64)>,
}

impl Cq {
    fn new(base: u64, size: u16) -> Self {
        Self {
            base,
            size,
            head: 0,
            tail: 0,
            phase: true,
            backlog: VecDeque::new(),
        }
    }

    fn is_full(&self) -> bool {
        (self.tail + 1) % self.size == self.head
    }

    fn pending(&self) -> bool {
        self.head != self.tail || !self.backlog.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Held {
    qid: u16,
    tag: u16,
    cmd: Command,
}

#[derive(Debug, Default)]
struct Regs {
    cap: u64,
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    boot_status: u32,
    tcb_base: [u64; 2],
    tcb_stat: u32,
    other: HashMap<u64, u32>,
}

struct State {
    mem: Arc<EmuMemory>,
    config: EmuConfig,
    regs: Regs,
    absent: bool,
    admin_sq: Option<Sq>,
    admin_cq: Option<Cq>,
    io_sq: Option<Sq>,
    io_cq: Option<Cq>,
    held: Vec<Held>,
    aer_tag: Option<u16>,
    pending_events: VecDeque<u32>,
    hold_io: bool,
    hold_admin: HashSet<u8>,
    disk: Vec<u8>,
    sart: Option<Arc<EmuSart>>,
    stats: EmuStats,
}

fn set_lo(reg: &mut u64, value: u32) {
    *reg = (*reg & !0xffff_ffff) | value as u64;
}

fn set_hi(reg: &mut u64, value: u32) {
    *reg = (*reg & 0xffff_ffff) | (value as u64) << 32;
}

fn write_ascii_padded(dst: &mut [u8], s: &str) {
    dst.fill(b' ');
    let bytes = s.as_bytes();
    let len = bytes.len().min(dst.len());
    dst[..len].copy_from_slice(&bytes[..len]);
}

impl State {
    fn stride_bytes(&self) -> u64 {
        4 << ((self.regs.cap >> 32) & 0xf)
    }

    fn read32(&self, offset: u64) -> u32 {
        if self.absent {
            return u32::MAX;
        }
        let regs = &self.regs;
        match offset {
            REG_CAP => regs.cap as u32,
            o if o == REG_CAP + 4 => (regs.cap >> 32) as u32,
            REG_VS => 0x0001_0100,
            REG_CC => regs.cc,
            REG_CSTS => regs.csts,
            REG_AQA => regs.aqa,
            REG_ASQ => regs.asq as u32,
            o if o == REG_ASQ + 4 => (regs.asq >> 32) as u32,
            REG_ACQ => regs.acq as u32,
            o if o == REG_ACQ + 4 => (regs.acq >> 32) as u32,
            ANS_BOOT_STATUS => regs.boot_status,
            NVMMU_BASE_ASQ => regs.tcb_base[0] as u32,
            o if o == NVMMU_BASE_ASQ + 4 => (regs.tcb_base[0] >> 32) as u32,
            NVMMU_BASE_IOSQ => regs.tcb_base[1] as u32,
            o if o == NVMMU_BASE_IOSQ + 4 => (regs.tcb_base[1] >> 32) as u32,
            NVMMU_TCB_STAT => regs.tcb_stat,
            _ => regs.other.get(&offset).copied().unwrap_or(0),
        }
    }

    fn write32(&mut self, offset: u64, value: u32) {
        if self.absent {
            return;
        }
        let enabled = self.regs.cc & Cc::ENABLE.bits() != 0;
        match offset {
            REG_CC => self.write_cc(value),
            // Admin queue attributes are latched while the controller is disabled.
            REG_AQA if !enabled => self.regs.aqa = value,
            REG_ASQ if !enabled => set_lo(&mut self.regs.asq, value),
            o if o == REG_ASQ + 4 && !enabled => set_hi(&mut self.regs.asq, value),
            REG_ACQ if !enabled => set_lo(&mut self.regs.acq, value),
            o if o == REG_ACQ + 4 && !enabled => set_hi(&mut self.regs.acq, value),
            NVMMU_BASE_ASQ => set_lo(&mut self.regs.tcb_base[0], value),
            o if o == NVMMU_BASE_ASQ + 4 => set_hi(&mut self.regs.tcb_base[0], value),
            NVMMU_BASE_IOSQ => set_lo(&mut self.regs.tcb_base[1], value),
            o if o == NVMMU_BASE_IOSQ + 4 => set_hi(&mut self.regs.tcb_base[1], value),
            NVMMU_TCB_INVAL => self.stats.invalidated.push(value as u16),
            ANS_LINEAR_ASQ_DB => self.linear_doorbell(0, value),
            ANS_LINEAR_IOSQ_DB => self.linear_doorbell(IO_QID, value),
            o if (REG_DOORBELLS..REG_DOORBELLS + 0x1000).contains(&o) => {
                self.queue_doorbell(o, value)
            }
            REG_AQA | REG_ASQ | REG_ACQ => {
                tracing::warn!(offset, "admin queue register written while enabled")
            }
            _ => {
                self.regs.other.insert(offset, value);
            }
        }
    }

    fn write_cc(&mut self, value: u32) {
        let prev = Cc::from_bits_retain(self.regs.cc);
        let next = Cc::from_bits_retain(value);
        self.regs.cc = value;

        if !next.contains(Cc::ENABLE) {
            if prev.contains(Cc::ENABLE) {
                self.stats.controller_resets += 1;
            }
            self.controller_reset();
            return;
        }
        if !prev.contains(Cc::ENABLE) {
            self.enable();
        }
        let shn = next & Cc::SHN_MASK;
        if !shn.is_empty() && (prev & Cc::SHN_MASK).is_empty() {
            self.stats.shutdowns += 1;
            self.regs.csts =
                (self.regs.csts & !Csts::SHST_MASK.bits()) | Csts::SHST_CMPLT.bits();
        }
    }

    fn enable(&mut self) {
        let asqs = ((self.regs.aqa >> 16) & 0xfff) as u16 + 1;
        let acqs = (self.regs.aqa & 0xfff) as u16 + 1;
        let misaligned = |addr: u64| addr == 0 || addr % PAGE_SIZE != 0;
        if misaligned(self.regs.asq)
            || misaligned(self.regs.acq)
            || asqs > MAX_QUEUE_ENTRIES
            || acqs > MAX_QUEUE_ENTRIES
        {
            tracing::warn!(
                aqa = self.regs.aqa,
                asq = self.regs.asq,
                acq = self.regs.acq,
                "invalid admin queue setup"
            );
            self.regs.csts = Csts::CFS.bits();
            return;
        }
        self.admin_sq = Some(Sq {
            base: self.regs.asq,
        });
        self.admin_cq = Some(Cq::new(self.regs.acq, acqs));
        self.regs.csts = Csts::RDY.bits();
    }

    /// Forgets all queues and every command in flight, as `CC.EN` 1 -> 0 does.
    fn controller_reset(&mut self) {
        self.regs.csts = 0;
        self.admin_sq = None;
        self.admin_cq = None;
        self.io_sq = None;
        self.io_cq = None;
        self.held.clear();
        self.aer_tag = None;
    }

    fn check_window(&mut self, addr: u64, len: u64) {
        let Some(sart) = &self.sart else {
            return;
        };
        if !sart.covers(addr, len) {
            tracing::warn!(addr, len, "DMA outside SART windows");
            self.stats.filter_violations += 1;
        }
    }

    fn linear_doorbell(&mut self, qid: u16, tag: u32) {
        let csts = Csts::from_bits_retain(self.regs.csts);
        let linear = self
            .regs
            .other
            .get(&ANS_LINEAR_SQ_CTRL)
            .is_some_and(|v| v & ANS_LINEAR_SQ_EN != 0);
        let sq_base = match qid {
            0 => self.admin_sq.as_ref().map(|sq| sq.base),
            _ => self.io_sq.as_ref().map(|sq| sq.base),
        };
        let (Some(sq_base), true, true, false) = (
            sq_base,
            linear,
            csts.contains(Csts::RDY),
            csts.contains(Csts::CFS),
        ) else {
            tracing::debug!(qid, tag, csts = csts.bits(), linear, "doorbell dropped");
            self.stats.dropped_doorbells += 1;
            return;
        };
        if tag >= MAX_TAGS as u32 {
            tracing::warn!(qid, tag, "doorbell for out-of-range tag");
            self.stats.dropped_doorbells += 1;
            return;
        }
        let tag = tag as u16;

        let slot = sq_base + ((tag as u64) << 6);
        let mut bytes = [0u8; COMMAND_SIZE];
        self.mem.read(slot, &mut bytes);
        self.check_window(slot, COMMAND_SIZE as u64);
        let cmd = Command::parse(&bytes);

        let tcb_addr = self.regs.tcb_base[qid as usize] + tag as u64 * TCB_SIZE as u64;
        let mut raw = [0u8; TCB_SIZE];
        self.mem.read(tcb_addr, &mut raw);
        self.check_window(tcb_addr, TCB_SIZE as u64);
        let tcb = TrackingEntry::parse(&raw);
        if self.regs.tcb_base[qid as usize] == 0
            || tcb.opcode != cmd.opcode
            || tcb.command_id != tag as u8
            || tcb.prp1 != cmd.prp1
            || tcb.prp2 != cmd.prp2
            || cmd.command_id != tag
        {
            tracing::warn!(qid, tag, ?tcb, opcode = cmd.opcode, "tracking entry mismatch");
            self.stats.tcb_violations += 1;
            self.post(qid, tag, Status::INVALID_FIELD, 0);
            return;
        }

        let outcome = match qid {
            0 => self.run_admin(tag, cmd),
            _ => self.run_io(tag, cmd),
        };
        if let Some((status, result)) = outcome {
            self.post(qid, tag, status, result);
        }
    }

    fn queue_doorbell(&mut self, offset: u64, value: u32) {
        let idx = (offset - REG_DOORBELLS) / self.stride_bytes();
        let qid = (idx / 2) as u16;
        if idx % 2 == 0 {
            // Tail doorbells mean nothing once the rings are in linear mode.
            tracing::warn!(qid, value, "SQ tail doorbell in linear mode");
            self.stats.dropped_doorbells += 1;
            return;
        }
        let cq = match qid {
            0 => self.admin_cq.as_mut(),
            IO_QID => self.io_cq.as_mut(),
            _ => None,
        };
        let Some(cq) = cq else {
            return;
        };
        if value as u16 >= cq.size {
            tracing::warn!(qid, value, "CQ head beyond ring");
            return;
        }
        cq.head = value as u16;
        self.flush_backlog(qid);
    }

    fn run_admin(&mut self, tag: u16, cmd: Command) -> Option<(Status, u64)> {
        self.stats.admin_opcodes.push(cmd.opcode);
        if self.hold_admin.contains(&cmd.opcode) {
            self.held.push(Held { qid: 0, tag, cmd });
            return None;
        }
        let qid = (cmd.cdw10 & 0xffff) as u16;
        let outcome = match cmd.opcode {
            opcode::IDENTIFY => {
                if cmd.cdw10 & 0xff != 1 {
                    (Status::INVALID_FIELD, 0)
                } else {
                    let data = self.identify_controller();
                    (self.dma_out(&cmd, &data), 0)
                }
            }
            opcode::CREATE_CQ => self.create_cq(qid, &cmd),
            opcode::CREATE_SQ => self.create_sq(qid, &cmd),
            opcode::DELETE_SQ => {
                if qid != IO_QID || self.io_sq.take().is_none() {
                    (Status::INVALID_QID, 0)
                } else {
                    self.fail_held_io(Status::SQ_DELETION);
                    (Status::SUCCESS, 0)
                }
            }
            opcode::DELETE_CQ => {
                if qid != IO_QID || self.io_cq.is_none() {
                    (Status::INVALID_QID, 0)
                } else if self.io_sq.is_some() {
                    (INVALID_QUEUE_DELETION, 0)
                } else {
                    self.io_cq = None;
                    (Status::SUCCESS, 0)
                }
            }
            opcode::ABORT => self.abort(&cmd),
            opcode::SET_FEATURES => {
                if cmd.cdw10 & 0xff == FEATURE_NUM_QUEUES && self.config.grant_io_queues {
                    // One submission and one completion queue, both 0-based.
                    (Status::SUCCESS, 0)
                } else {
                    (Status::INVALID_FIELD, 0)
                }
            }
            opcode::ASYNC_EVENT => match self.pending_events.pop_front() {
                Some(event) => (Status::SUCCESS, event as u64),
                None => {
                    self.aer_tag = Some(tag);
                    return None;
                }
            },
            _ => (Status::INVALID_OPCODE, 0),
        };
        Some(outcome)
    }

    fn create_cq(&mut self, qid: u16, cmd: &Command) -> (Status, u64) {
        if qid != IO_QID {
            return (Status::INVALID_QID, 0);
        }
        let size = (cmd.cdw10 >> 16) as u16 as u32 + 1;
        if size < 2 || size > MAX_QUEUE_ENTRIES as u32 || cmd.prp1 == 0 || cmd.prp1 % PAGE_SIZE != 0
        {
            return (Status::INVALID_FIELD, 0);
        }
        self.io_cq = Some(Cq::new(cmd.prp1, size as u16));
        (Status::SUCCESS, 0)
    }

    fn create_sq(&mut self, qid: u16, cmd: &Command) -> (Status, u64) {
        if qid != IO_QID {
            return (Status::INVALID_QID, 0);
        }
        let cqid = (cmd.cdw11 >> 16) as u16;
        if cqid != IO_QID || self.io_cq.is_none() {
            return (Status::INVALID_QID, 0);
        }
        if cmd.prp1 == 0 || cmd.prp1 % PAGE_SIZE != 0 {
            return (Status::INVALID_FIELD, 0);
        }
        self.io_sq = Some(Sq { base: cmd.prp1 });
        (Status::SUCCESS, 0)
    }

    fn abort(&mut self, cmd: &Command) -> (Status, u64) {
        self.stats.aborts += 1;
        let sqid = (cmd.cdw10 & 0xffff) as u16;
        let cid = (cmd.cdw10 >> 16) as u16;
        let found = self
            .held
            .iter()
            .position(|h| h.qid == sqid && h.tag == cid);
        match found {
            Some(index) if self.config.abort_completes_target => {
                let target = self.held.remove(index);
                self.post(target.qid, target.tag, Status::ABORT_REQUESTED, 0);
                (Status::SUCCESS, 0)
            }
            // Bit 0 set: command not aborted.
            _ => (Status::SUCCESS, 1),
        }
    }

    fn run_io(&mut self, tag: u16, cmd: Command) -> Option<(Status, u64)> {
        self.stats.io_commands += 1;
        if self.hold_io {
            self.held.push(Held {
                qid: IO_QID,
                tag,
                cmd,
            });
            return None;
        }
        Some((self.execute_io(&cmd), 0))
    }

    fn execute_io(&mut self, cmd: &Command) -> Status {
        if cmd.nsid != self.config.nsid {
            return Status::INVALID_NS;
        }
        match cmd.opcode {
            opcode::FLUSH => {
                self.stats.flushes += 1;
                Status::SUCCESS
            }
            opcode::READ | opcode::WRITE => {
                let blocks = cmd.rw_length() as u64 + 1;
                if cmd.slba().saturating_add(blocks) > self.config.blocks {
                    return Status::LBA_RANGE;
                }
                let start = (cmd.slba() << self.config.lba_shift) as usize;
                let len = (blocks << self.config.lba_shift) as usize;
                if cmd.opcode == opcode::READ {
                    let data = self.disk[start..start + len].to_vec();
                    self.dma_out(cmd, &data)
                } else {
                    let mut data = vec![0u8; len];
                    let status = self.dma_in(cmd, &mut data);
                    if status.is_success() {
                        self.disk[start..start + len].copy_from_slice(&data);
                    }
                    status
                }
            }
            _ => Status::INVALID_OPCODE,
        }
    }

    fn dma_out(&mut self, cmd: &Command, data: &[u8]) -> Status {
        let segs = match walk_prps(&*self.mem, cmd.prp1, cmd.prp2, data.len()) {
            Ok(segs) => segs,
            Err(err) => {
                tracing::warn!(error = %err, "bad PRPs");
                return Status::DATA_XFER_ERROR;
            }
        };
        let mut offset = 0usize;
        for seg in segs {
            let len = seg.len as usize;
            self.mem.write(seg.addr, &data[offset..offset + len]);
            offset += len;
        }
        Status::SUCCESS
    }

    fn dma_in(&mut self, cmd: &Command, data: &mut [u8]) -> Status {
        let segs = match walk_prps(&*self.mem, cmd.prp1, cmd.prp2, data.len()) {
            Ok(segs) => segs,
            Err(err) => {
                tracing::warn!(error = %err, "bad PRPs");
                return Status::DATA_XFER_ERROR;
            }
        };
        let mut offset = 0usize;
        for seg in segs {
            let len = seg.len as usize;
            self.mem.read(seg.addr, &mut data[offset..offset + len]);
            offset += len;
        }
        Status::SUCCESS
    }

    fn fail_held_io(&mut self, status: Status) {
        let (io, rest): (Vec<Held>, Vec<Held>) =
            self.held.drain(..).partition(|h| h.qid == IO_QID);
        self.held = rest;
        for h in io {
            self.post(IO_QID, h.tag, status, 0);
        }
    }

    fn identify_controller(&self) -> Vec<u8> {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        data[0..2].copy_from_slice(&0x106bu16.to_le_bytes());
        data[2..4].copy_from_slice(&0x106bu16.to_le_bytes());
        write_ascii_padded(&mut data[4..24], "EMU00000000000000001");
        write_ascii_padded(&mut data[24..64], "APPLE SSD AP0256Q");
        write_ascii_padded(&mut data[64..72], "0.1");
        data[77] = self.config.mdts;
        data[258] = self.config.acl;
        data[259] = 0;
        data[516..520].copy_from_slice(&1u32.to_le_bytes());
        data
    }

    fn post(&mut self, qid: u16, tag: u16, status: Status, result: u64) {
        let cq = match qid {
            0 => self.admin_cq.as_mut(),
            _ => self.io_cq.as_mut(),
        };
        let Some(cq) = cq else {
            tracing::warn!(qid, tag, "completion with no completion queue");
            return;
        };
        cq.backlog.push_back((qid, tag, status, result));
        self.flush_backlog(qid);
    }

    fn flush_backlog(&mut self, qid: u16) {
        let cq = match qid {
            0 => self.admin_cq.as_mut(),
            _ => self.io_cq.as_mut(),
        };
        let Some(cq) = cq else {
            return;
        };
        let mut written = Vec::new();
        while !cq.is_full() {
            let Some((sq_id, tag, status, result)) = cq.backlog.pop_front() else {
                break;
            };
            let entry = CompletionEntry {
                result,
                sq_head: 0,
                sq_id,
                command_id: tag,
                status: status.to_cqe_word(cq.phase),
            };
            let addr = cq.base + cq.tail as u64 * COMPLETION_SIZE as u64;
            self.mem.write(addr, &entry.to_bytes());
            written.push(addr);
            cq.tail = (cq.tail + 1) % cq.size;
            if cq.tail == 0 {
                cq.phase = !cq.phase;
            }
        }
        for addr in written {
            self.check_window(addr, COMPLETION_SIZE as u64);
        }
    }
}

/// An emulated ANS2 controller behind a 32-bit register window.
pub struct AnsController {
    state: Mutex<State>,
}

impl AnsController {
    pub fn new(mem: Arc<EmuMemory>, config: EmuConfig) -> Self {
        let mqes = (MAX_QUEUE_ENTRIES - 1) as u64;
        // CAP.TO = 1: 1 s ready timeout.
        let cap = mqes | 1 << 24 | (config.doorbell_stride_shift as u64 & 0xf) << 32;
        let disk = vec![0u8; (config.blocks << config.lba_shift) as usize];
        Self {
            state: Mutex::new(State {
                mem,
                regs: Regs {
                    cap,
                    ..Regs::default()
                },
                absent: false,
                admin_sq: None,
                admin_cq: None,
                io_sq: None,
                io_cq: None,
                held: Vec::new(),
                aer_tag: None,
                pending_events: VecDeque::new(),
                hold_io: false,
                hold_admin: HashSet::new(),
                disk,
                sart: None,
                stats: EmuStats::default(),
                config,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks every ring, tracking-table and completion access against `sart`'s windows.
    pub fn attach_sart(&self, sart: Arc<EmuSart>) {
        self.state().sart = Some(sart);
    }

    /// Firmware finished booting: the boot status register reads ready.
    pub fn finish_boot(&self) {
        self.state().regs.boot_status = ANS_BOOT_STATUS_OK;
    }

    pub fn block_size(&self) -> usize {
        1 << self.state().config.lba_shift
    }

    pub fn stats(&self) -> EmuStats {
        self.state().stats.clone()
    }

    /// Parks I/O commands instead of executing them.
    pub fn set_hold_io(&self, hold: bool) {
        self.state().hold_io = hold;
    }

    /// Parks admin commands with `op` instead of executing them.
    pub fn hold_admin_opcode(&self, op: u8) {
        self.state().hold_admin.insert(op);
    }

    pub fn release_admin_opcode(&self, op: u8) {
        self.state().hold_admin.remove(&op);
    }

    pub fn held_count(&self) -> usize {
        self.state().held.len()
    }

    /// Executes and completes every parked I/O command.
    pub fn release_held_io(&self) {
        let mut state = self.state();
        let (io, rest): (Vec<Held>, Vec<Held>) =
            state.held.drain(..).partition(|h| h.qid == IO_QID);
        state.held = rest;
        for h in io {
            let status = state.execute_io(&h.cmd);
            state.post(IO_QID, h.tag, status, 0);
        }
    }

    pub fn aer_armed(&self) -> bool {
        self.state().aer_tag.is_some()
    }

    /// Reports an asynchronous event, completing the armed request or queueing the event until
    /// one arrives.
    pub fn raise_async_event(&self, kind: u8, info: u8, log_page: u8) {
        let result = (kind & 0x7) as u32 | (info as u32) << 8 | (log_page as u32) << 16;
        let mut state = self.state();
        match state.aer_tag.take() {
            Some(tag) => state.post(0, tag, Status::SUCCESS, result as u64),
            None => state.pending_events.push_back(result),
        }
    }

    /// Posts a completion for `tag` on queue `qid` that no submitted command asked for.
    pub fn post_spurious_completion(&self, qid: u16, tag: u16, status: Status) {
        self.state().post(qid, tag, status, 0);
    }

    /// Sets `CSTS.CFS`. Nothing is executed until the host resets the controller.
    pub fn inject_fatal(&self) {
        self.state().regs.csts |= Csts::CFS.bits();
    }

    /// Makes every register read return all ones, as a surprise-removed device does.
    pub fn set_absent(&self, absent: bool) {
        self.state().absent = absent;
    }

    /// Value returned from the TCB invalidate status register.
    pub fn set_tcb_status(&self, status: u32) {
        self.state().regs.tcb_stat = status;
    }

    /// Whether a completion is waiting for the host.
    pub fn irq_pending(&self) -> bool {
        let state = self.state();
        state.admin_cq.as_ref().is_some_and(Cq::pending)
            || state.io_cq.as_ref().is_some_and(Cq::pending)
    }

    pub fn io_queue_exists(&self) -> bool {
        let state = self.state();
        state.io_sq.is_some() && state.io_cq.is_some()
    }

    pub fn read_blocks(&self, slba: u64, blocks: u64) -> Vec<u8> {
        let state = self.state();
        let shift = state.config.lba_shift;
        let start = (slba << shift) as usize;
        state.disk[start..start + (blocks << shift) as usize].to_vec()
    }

    pub fn write_blocks(&self, slba: u64, data: &[u8]) {
        let mut state = self.state();
        let start = (slba << state.config.lba_shift) as usize;
        state.disk[start..start + data.len()].copy_from_slice(data);
    }
}

impl Mmio for AnsController {
    fn read32(&self, offset: u64) -> u32 {
        self.state().read32(offset)
    }

    fn write32(&self, offset: u64, value: u32) {
        self.state().write32(offset, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> (Arc<EmuMemory>, AnsController) {
        let mem = Arc::new(EmuMemory::new(1 << 20));
        let ctrl = AnsController::new(mem.clone(), EmuConfig::default());
        (mem, ctrl)
    }

    fn enable(ctrl: &AnsController) {
        ctrl.write32(REG_AQA, 31 << 16 | 31);
        ctrl.write64(REG_ASQ, 0x10000);
        ctrl.write64(REG_ACQ, 0x20000);
        ctrl.write32(REG_CC, Cc::ENABLE.bits());
    }

    #[test]
    fn enable_sets_ready_and_disable_clears_it() {
        let (_mem, ctrl) = controller();
        enable(&ctrl);
        assert_eq!(ctrl.read32(REG_CSTS), Csts::RDY.bits());
        ctrl.write32(REG_CC, 0);
        assert_eq!(ctrl.read32(REG_CSTS), 0);
        assert_eq!(ctrl.stats().controller_resets, 1);
    }

    #[test]
    fn misaligned_admin_queue_is_fatal() {
        let (_mem, ctrl) = controller();
        ctrl.write32(REG_AQA, 31 << 16 | 31);
        ctrl.write64(REG_ASQ, 0x10010);
        ctrl.write64(REG_ACQ, 0x20000);
        ctrl.write32(REG_CC, Cc::ENABLE.bits());
        let csts = Csts::from_bits_retain(ctrl.read32(REG_CSTS));
        assert!(csts.contains(Csts::CFS));
        assert!(!csts.contains(Csts::RDY));
    }

    #[test]
    fn sixty_four_bit_registers_assemble_halves() {
        let (_mem, ctrl) = controller();
        ctrl.write64(NVMMU_BASE_IOSQ, 0x1_2345_6000);
        assert_eq!(ctrl.read64(NVMMU_BASE_IOSQ), 0x1_2345_6000);
        assert_eq!(ctrl.read64(REG_CAP) >> 24 & 0xff, 1);
    }

    #[test]
    fn doorbell_without_linear_mode_is_dropped() {
        let (_mem, ctrl) = controller();
        enable(&ctrl);
        ctrl.write32(ANS_LINEAR_ASQ_DB, 0);
        assert_eq!(ctrl.stats().dropped_doorbells, 1);
        assert!(!ctrl.irq_pending());
    }

    #[test]
    fn unarmed_tracking_entry_is_rejected() {
        let (mem, ctrl) = controller();
        ctrl.write32(ANS_LINEAR_SQ_CTRL, ANS_LINEAR_SQ_EN);
        ctrl.write64(NVMMU_BASE_ASQ, 0x30000);
        enable(&ctrl);
        let mut cmd = Command::identify_controller();
        cmd.command_id = 3;
        cmd.prp1 = 0x40000;
        mem.write(0x10000 + 3 * 64, &cmd.to_bytes());
        ctrl.write32(ANS_LINEAR_ASQ_DB, 3);

        assert_eq!(ctrl.stats().tcb_violations, 1);
        let mut raw = [0u8; COMPLETION_SIZE];
        mem.read(0x20000, &mut raw);
        let cqe = CompletionEntry::parse(&raw);
        assert_eq!(cqe.command_id, 3);
        assert!(cqe.phase());
        assert_eq!(cqe.status(), Status::INVALID_FIELD);
    }

    #[test]
    fn async_event_waits_for_a_request() {
        let (_mem, ctrl) = controller();
        ctrl.raise_async_event(1, 2, 3);
        assert!(!ctrl.aer_armed());
        assert_eq!(ctrl.state().pending_events.front(), Some(&0x0003_0201));
    }
}
