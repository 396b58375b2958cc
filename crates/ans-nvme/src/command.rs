//! Wire formats: submission entries, completion entries and status codes.

use std::fmt;

pub const COMMAND_SIZE: usize = 64;
pub const COMPLETION_SIZE: usize = 16;
/// log2 of [`COMMAND_SIZE`].
pub const SQ_ENTRY_SHIFT: u32 = 6;

pub mod opcode {
    // Admin command set.
    pub const DELETE_SQ: u8 = 0x00;
    pub const CREATE_SQ: u8 = 0x01;
    pub const DELETE_CQ: u8 = 0x04;
    pub const CREATE_CQ: u8 = 0x05;
    pub const IDENTIFY: u8 = 0x06;
    pub const ABORT: u8 = 0x08;
    pub const SET_FEATURES: u8 = 0x09;
    pub const ASYNC_EVENT: u8 = 0x0c;

    // NVM command set.
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
}

pub const FEATURE_NUM_QUEUES: u32 = 0x07;
pub const IDENTIFY_CNS_CONTROLLER: u32 = 0x01;

const QUEUE_PHYS_CONTIG: u32 = 1 << 0;
const CQ_IRQ_ENABLED: u32 = 1 << 1;

/// A 64-byte submission queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    pub flags: u8,
    pub command_id: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub metadata: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl Command {
    pub fn new(opcode: u8) -> Self {
        Self {
            opcode,
            ..Default::default()
        }
    }

    pub fn parse(bytes: &[u8; COMMAND_SIZE]) -> Self {
        let u32_at = |off: usize| le_u32(bytes, off);
        let u64_at = |off: usize| le_u64(bytes, off);
        Self {
            opcode: bytes[0],
            flags: bytes[1],
            command_id: u16::from_le_bytes([bytes[2], bytes[3]]),
            nsid: u32_at(4),
            cdw2: u32_at(8),
            cdw3: u32_at(12),
            metadata: u64_at(16),
            prp1: u64_at(24),
            prp2: u64_at(32),
            cdw10: u32_at(40),
            cdw11: u32_at(44),
            cdw12: u32_at(48),
            cdw13: u32_at(52),
            cdw14: u32_at(56),
            cdw15: u32_at(60),
        }
    }

    pub fn to_bytes(&self) -> [u8; COMMAND_SIZE] {
        let mut out = [0u8; COMMAND_SIZE];
        out[0] = self.opcode;
        out[1] = self.flags;
        out[2..4].copy_from_slice(&self.command_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.nsid.to_le_bytes());
        out[8..12].copy_from_slice(&self.cdw2.to_le_bytes());
        out[12..16].copy_from_slice(&self.cdw3.to_le_bytes());
        out[16..24].copy_from_slice(&self.metadata.to_le_bytes());
        out[24..32].copy_from_slice(&self.prp1.to_le_bytes());
        out[32..40].copy_from_slice(&self.prp2.to_le_bytes());
        for (i, dw) in [
            self.cdw10, self.cdw11, self.cdw12, self.cdw13, self.cdw14, self.cdw15,
        ]
        .into_iter()
        .enumerate()
        {
            let off = 40 + i * 4;
            out[off..off + 4].copy_from_slice(&dw.to_le_bytes());
        }
        out
    }

    /// Read or write of `blocks` logical blocks starting at `slba`.
    pub fn read_write(opcode: u8, nsid: u32, slba: u64, blocks: u32) -> Self {
        debug_assert!((1..=0x1_0000).contains(&blocks));
        Self {
            opcode,
            nsid,
            cdw10: slba as u32,
            cdw11: (slba >> 32) as u32,
            cdw12: blocks.saturating_sub(1) & 0xffff,
            ..Default::default()
        }
    }

    pub fn flush(nsid: u32) -> Self {
        Self {
            opcode: opcode::FLUSH,
            nsid,
            ..Default::default()
        }
    }

    pub fn identify_controller() -> Self {
        Self {
            opcode: opcode::IDENTIFY,
            cdw10: IDENTIFY_CNS_CONTROLLER,
            ..Default::default()
        }
    }

    pub fn create_cq(qid: u16, depth: u16, base: u64, irq_vector: u16) -> Self {
        Self {
            opcode: opcode::CREATE_CQ,
            prp1: base,
            cdw10: (depth as u32 - 1) << 16 | qid as u32,
            cdw11: (irq_vector as u32) << 16 | QUEUE_PHYS_CONTIG | CQ_IRQ_ENABLED,
            ..Default::default()
        }
    }

    pub fn create_sq(qid: u16, depth: u16, base: u64, cqid: u16) -> Self {
        Self {
            opcode: opcode::CREATE_SQ,
            prp1: base,
            cdw10: (depth as u32 - 1) << 16 | qid as u32,
            cdw11: (cqid as u32) << 16 | QUEUE_PHYS_CONTIG,
            ..Default::default()
        }
    }

    pub fn delete_queue(opcode: u8, qid: u16) -> Self {
        Self {
            opcode,
            cdw10: qid as u32,
            ..Default::default()
        }
    }

    pub fn abort(sqid: u16, cid: u16) -> Self {
        Self {
            opcode: opcode::ABORT,
            cdw10: (cid as u32) << 16 | sqid as u32,
            ..Default::default()
        }
    }

    /// Requests `count` submission and completion queues.
    pub fn set_queue_count(count: u16) -> Self {
        let q = count.saturating_sub(1) as u32;
        Self {
            opcode: opcode::SET_FEATURES,
            cdw10: FEATURE_NUM_QUEUES,
            cdw11: q << 16 | q,
            ..Default::default()
        }
    }

    pub fn async_event() -> Self {
        Self::new(opcode::ASYNC_EVENT)
    }

    /// Whether data moves host to device. Bit 0 of the opcode encodes this for every command set.
    pub fn is_write(&self) -> bool {
        self.opcode & 1 != 0
    }

    /// 0-based block count of a read/write (`cdw12[15:0]`).
    pub fn rw_length(&self) -> u16 {
        self.cdw12 as u16
    }

    pub fn slba(&self) -> u64 {
        (self.cdw11 as u64) << 32 | self.cdw10 as u64
    }
}

fn le_u32(bytes: &[u8], off: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[off..off + 4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8], off: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(buf)
}

/// Completion status with the phase bit stripped.
///
/// Layout: `sc` in bits 7:0, `sct` in bits 10:8, more in bit 13, do-not-retry in bit 14.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Status(u16);

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const INVALID_OPCODE: Status = Status::new(0, 0x01, true);
    pub const INVALID_FIELD: Status = Status::new(0, 0x02, true);
    pub const DATA_XFER_ERROR: Status = Status::new(0, 0x04, false);
    pub const ABORT_REQUESTED: Status = Status::new(0, 0x07, false);
    pub const SQ_DELETION: Status = Status::new(0, 0x08, false);
    pub const INVALID_NS: Status = Status::new(0, 0x0b, true);
    pub const LBA_RANGE: Status = Status::new(0, 0x80, true);
    pub const INVALID_QID: Status = Status::new(1, 0x01, true);
    pub const ABORT_LIMIT: Status = Status::new(1, 0x03, false);
    /// Completed by the host because the controller was disabled underneath the command.
    pub const HOST_ABORTED: Status = Status::new(3, 0x71, false);

    pub const fn new(sct: u8, sc: u8, dnr: bool) -> Self {
        let mut val = sc as u16 | ((sct as u16 & 0x7) << 8);
        if dnr {
            val |= 1 << 14;
        }
        Status(val)
    }

    pub const fn from_raw(raw: u16) -> Self {
        Status(raw & 0x7fff)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn sc(self) -> u8 {
        self.0 as u8
    }

    pub fn sct(self) -> u8 {
        ((self.0 >> 8) & 0x7) as u8
    }

    pub fn dnr(self) -> bool {
        self.0 & (1 << 14) != 0
    }

    pub fn is_success(self) -> bool {
        self.0 & 0x7ff == 0
    }

    /// Status word as stored in a completion entry.
    pub fn to_cqe_word(self, phase: bool) -> u16 {
        self.0 << 1 | phase as u16
    }

    pub fn from_cqe_word(word: u16) -> Self {
        Status(word >> 1)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Status {{ sct: {}, sc: {:#04x}, dnr: {} }}",
            self.sct(),
            self.sc(),
            self.dnr()
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// A 16-byte completion queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionEntry {
    pub result: u64,
    pub sq_head: u16,
    pub sq_id: u16,
    pub command_id: u16,
    /// Status word including the phase bit.
    pub status: u16,
}

impl CompletionEntry {
    pub fn parse(bytes: &[u8; COMPLETION_SIZE]) -> Self {
        Self {
            result: le_u64(bytes, 0),
            sq_head: u16::from_le_bytes([bytes[8], bytes[9]]),
            sq_id: u16::from_le_bytes([bytes[10], bytes[11]]),
            command_id: u16::from_le_bytes([bytes[12], bytes[13]]),
            status: u16::from_le_bytes([bytes[14], bytes[15]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; COMPLETION_SIZE] {
        let mut out = [0u8; COMPLETION_SIZE];
        out[0..8].copy_from_slice(&self.result.to_le_bytes());
        out[8..10].copy_from_slice(&self.sq_head.to_le_bytes());
        out[10..12].copy_from_slice(&self.sq_id.to_le_bytes());
        out[12..14].copy_from_slice(&self.command_id.to_le_bytes());
        out[14..16].copy_from_slice(&self.status.to_le_bytes());
        out
    }

    pub fn phase(&self) -> bool {
        self.status & 1 != 0
    }

    pub fn status(&self) -> Status {
        Status::from_cqe_word(self.status)
    }
}

/// The subset of Identify Controller data the engine acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerIdentity {
    pub vendor_id: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    /// Maximum data transfer size as a power of two in controller pages (0 = no limit).
    pub mdts: u8,
    /// Abort command limit (0-based).
    pub acl: u8,
    /// Asynchronous event request limit (0-based).
    pub aerl: u8,
    pub namespaces: u32,
}

pub const IDENTIFY_DATA_SIZE: usize = 4096;

impl ControllerIdentity {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < IDENTIFY_DATA_SIZE {
            return None;
        }
        let ascii = |range: std::ops::Range<usize>| {
            String::from_utf8_lossy(&data[range])
                .trim_end_matches([' ', '\0'])
                .to_string()
        };
        Some(Self {
            vendor_id: u16::from_le_bytes([data[0], data[1]]),
            serial: ascii(4..24),
            model: ascii(24..64),
            firmware: ascii(64..72),
            mdts: data[77],
            acl: data[258],
            aerl: data[259],
            namespaces: le_u32(data, 516),
        })
    }

    /// Largest transfer in bytes, if the controller imposes one.
    pub fn max_transfer_bytes(&self, page_size: usize) -> Option<u64> {
        if self.mdts == 0 {
            return None;
        }
        (page_size as u64).checked_shl(self.mdts as u32)
    }
}
