//! NVMMU tag tracking table.
//!
//! ANS2 refuses to execute a command unless a tracking control block (TCB) describing it sits at
//! the slot for its tag. Completed tags are retired by writing the tag to the invalidate register.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::command::Command;
use crate::dma::{DmaBuffer, DmaContext};
use crate::error::{NvmeError, Result};
use crate::regs::{Mmio, NVMMU_TCB_INVAL, NVMMU_TCB_STAT};

pub const TCB_SIZE: usize = 128;
pub const NUM_TCBS: usize = 64;

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct TcbDmaFlags: u8 {
        const FROM_DEVICE = 1 << 0;
        const TO_DEVICE = 1 << 1;
    }
}

/// Host-visible fields of a TCB. The remaining bytes (including the inline-crypto area) stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackingEntry {
    pub opcode: u8,
    pub dma_flags: TcbDmaFlags,
    pub command_id: u8,
    pub length: u32,
    pub prp1: u64,
    pub prp2: u64,
}

impl TrackingEntry {
    pub fn for_command(tag: u16, cmd: &Command) -> Self {
        let dma_flags = if cmd.is_write() {
            TcbDmaFlags::TO_DEVICE
        } else {
            TcbDmaFlags::FROM_DEVICE
        };
        Self {
            opcode: cmd.opcode,
            dma_flags,
            command_id: tag as u8,
            length: cmd.rw_length() as u32,
            prp1: cmd.prp1,
            prp2: cmd.prp2,
        }
    }

    pub fn to_bytes(&self) -> [u8; TCB_SIZE] {
        let mut out = [0u8; TCB_SIZE];
        out[0] = self.opcode;
        out[1] = self.dma_flags.bits();
        out[2] = self.command_id;
        out[4..8].copy_from_slice(&self.length.to_le_bytes());
        out[24..32].copy_from_slice(&self.prp1.to_le_bytes());
        out[32..40].copy_from_slice(&self.prp2.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8; TCB_SIZE]) -> Self {
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[4..8]);
        let mut prp1 = [0u8; 8];
        prp1.copy_from_slice(&bytes[24..32]);
        let mut prp2 = [0u8; 8];
        prp2.copy_from_slice(&bytes[32..40]);
        Self {
            opcode: bytes[0],
            dma_flags: TcbDmaFlags::from_bits_retain(bytes[1]),
            command_id: bytes[2],
            length: u32::from_le_bytes(len),
            prp1: u64::from_le_bytes(prp1),
            prp2: u64::from_le_bytes(prp2),
        }
    }
}

/// Outcome of retiring a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    Invalidated,
    /// The controller reported a non-zero invalidate status. The slot is still cleared.
    Rejected { status: u32 },
    /// Nothing was armed for the tag; hardware was not touched.
    NotArmed,
}

/// One queue's TCB array in coherent memory.
pub struct TrackingTable {
    buffer: DmaBuffer,
    base_reg: u64,
    armed: AtomicU64,
}

impl TrackingTable {
    /// Allocates the table and points the queue's NVMMU base register at it.
    pub fn new(ctx: &DmaContext, regs: &dyn Mmio, base_reg: u64) -> Result<Self> {
        let buffer = ctx.alloc(NUM_TCBS * TCB_SIZE)?;
        regs.write64(base_reg, buffer.addr());
        Ok(Self {
            buffer,
            base_reg,
            armed: AtomicU64::new(0),
        })
    }

    pub fn addr(&self) -> u64 {
        self.buffer.addr()
    }

    pub fn is_armed(&self, tag: u16) -> bool {
        self.armed.load(Ordering::Acquire) & bit(tag) != 0
    }

    pub fn armed_count(&self) -> u32 {
        self.armed.load(Ordering::Acquire).count_ones()
    }

    pub fn entry(&self, tag: u16) -> TrackingEntry {
        let mut bytes = [0u8; TCB_SIZE];
        self.buffer.read_at(slot(tag), &mut bytes);
        TrackingEntry::parse(&bytes)
    }

    /// Describes `cmd` in the slot for `tag`. The controller is not notified; the doorbell that
    /// follows is what makes it look.
    pub fn arm(&self, tag: u16, cmd: &Command) -> Result<()> {
        debug_assert!((tag as usize) < NUM_TCBS);
        let prev = self.armed.fetch_or(bit(tag), Ordering::AcqRel);
        if prev & bit(tag) != 0 {
            return Err(NvmeError::TagBusy { tag });
        }
        self.buffer
            .write_at(slot(tag), &TrackingEntry::for_command(tag, cmd).to_bytes());
        Ok(())
    }

    /// Clears the slot for `tag` and asks the NVMMU to drop its cached copy.
    pub fn invalidate(&self, regs: &dyn Mmio, tag: u16) -> Invalidation {
        let prev = self.armed.fetch_and(!bit(tag), Ordering::AcqRel);
        if prev & bit(tag) == 0 {
            return Invalidation::NotArmed;
        }
        self.buffer.zero_range(slot(tag), TCB_SIZE);
        regs.write32(NVMMU_TCB_INVAL, tag as u32);
        let status = regs.read32(NVMMU_TCB_STAT);
        if status != 0 {
            tracing::warn!(tag, status, "NVMMU TCB invalidation failed");
            return Invalidation::Rejected { status };
        }
        Invalidation::Invalidated
    }

    /// Forgets `tag` without telling the controller. Only valid once the controller is disabled.
    pub fn discard(&self, tag: u16) {
        self.armed.fetch_and(!bit(tag), Ordering::AcqRel);
        self.buffer.zero_range(slot(tag), TCB_SIZE);
    }

    /// Clears every slot and re-registers the table, as after a controller reset.
    pub fn reset(&self, regs: &dyn Mmio) {
        self.armed.store(0, Ordering::Release);
        self.buffer.zero();
        regs.write64(self.base_reg, self.buffer.addr());
    }

    /// Detaches the table from the controller before its memory is released.
    pub fn unregister(&self, regs: &dyn Mmio) {
        regs.write64(self.base_reg, 0);
    }
}

fn bit(tag: u16) -> u64 {
    1u64 << (tag as u32 % 64)
}

fn slot(tag: u16) -> usize {
    tag as usize * TCB_SIZE
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::command::opcode;
    use crate::filter::NoFilter;
    use crate::regs::NVMMU_BASE_IOSQ;
    use crate::testutil::{RecordingMmio, VecMemory};

    fn table() -> (TrackingTable, RecordingMmio) {
        let mem = Arc::new(VecMemory::new(1 << 20));
        let ctx = DmaContext::new(mem, Arc::new(NoFilter));
        let regs = RecordingMmio::default();
        let table = TrackingTable::new(&ctx, &regs, NVMMU_BASE_IOSQ).unwrap();
        (table, regs)
    }

    fn write_cmd() -> Command {
        let mut cmd = Command::read_write(opcode::WRITE, 1, 100, 8);
        cmd.prp1 = 0x10_0000;
        cmd.prp2 = 0x20_0000;
        cmd
    }

    #[test]
    fn table_base_is_registered() {
        let (table, regs) = table();
        assert_eq!(regs.read64(NVMMU_BASE_IOSQ), table.addr());
    }

    #[test]
    fn arm_mirrors_command() {
        let (table, _regs) = table();
        table.arm(40, &write_cmd()).unwrap();
        assert_eq!(
            table.entry(40),
            TrackingEntry {
                opcode: opcode::WRITE,
                dma_flags: TcbDmaFlags::TO_DEVICE,
                command_id: 40,
                length: 7,
                prp1: 0x10_0000,
                prp2: 0x20_0000,
            }
        );

        table.arm(41, &Command::read_write(opcode::READ, 1, 0, 1)).unwrap();
        assert_eq!(table.entry(41).dma_flags, TcbDmaFlags::FROM_DEVICE);
    }

    #[test]
    fn arm_then_invalidate_leaves_slot_zeroed() {
        let (table, regs) = table();
        table.arm(33, &write_cmd()).unwrap();
        assert_eq!(table.invalidate(&regs, 33), Invalidation::Invalidated);
        assert_eq!(table.entry(33), TrackingEntry::default());
        assert_eq!(regs.writes_to(NVMMU_TCB_INVAL), vec![33]);
        assert!(!table.is_armed(33));
    }

    #[test]
    fn second_invalidate_is_a_no_op() {
        let (table, regs) = table();
        table.arm(33, &write_cmd()).unwrap();
        table.invalidate(&regs, 33);
        regs.clear_writes();
        assert_eq!(table.invalidate(&regs, 33), Invalidation::NotArmed);
        assert!(regs.writes().is_empty());
    }

    #[test]
    fn double_arm_is_refused() {
        let (table, _regs) = table();
        table.arm(50, &write_cmd()).unwrap();
        let other = Command::flush(1);
        assert_eq!(table.arm(50, &other), Err(NvmeError::TagBusy { tag: 50 }));
        // The first description survives.
        assert_eq!(table.entry(50).opcode, opcode::WRITE);
        assert_eq!(table.armed_count(), 1);
    }

    #[test]
    fn rejected_invalidation_still_clears_slot() {
        let (table, regs) = table();
        regs.set(NVMMU_TCB_STAT, 0x1);
        table.arm(3, &write_cmd()).unwrap();
        assert_eq!(
            table.invalidate(&regs, 3),
            Invalidation::Rejected { status: 1 }
        );
        assert_eq!(table.entry(3), TrackingEntry::default());
        table.arm(3, &write_cmd()).unwrap();
    }

    #[test]
    fn reset_forgets_everything_and_reregisters() {
        let (table, regs) = table();
        table.arm(1, &write_cmd()).unwrap();
        table.arm(2, &write_cmd()).unwrap();
        regs.write64(NVMMU_BASE_IOSQ, 0);
        table.reset(&regs);
        assert_eq!(table.armed_count(), 0);
        assert_eq!(table.entry(1), TrackingEntry::default());
        assert_eq!(regs.read64(NVMMU_BASE_IOSQ), table.addr());
    }
}
