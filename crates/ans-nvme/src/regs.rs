//! Controller register window.

use std::time::{Duration, Instant};

use bitflags::bitflags;

/// Access to the controller's memory-mapped register window.
///
/// Offsets are relative to the start of the window. Implementations must perform each access as a
/// single naturally aligned 32-bit load or store. 64-bit registers are accessed low word first,
/// which is the only ordering the controller accepts for the tracking-table base registers.
pub trait Mmio: Send + Sync {
    fn read32(&self, offset: u64) -> u32;
    fn write32(&self, offset: u64, value: u32);

    fn read64(&self, offset: u64) -> u64 {
        let lo = self.read32(offset) as u64;
        let hi = self.read32(offset + 4) as u64;
        hi << 32 | lo
    }

    fn write64(&self, offset: u64, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

impl<T: Mmio + ?Sized> Mmio for std::sync::Arc<T> {
    fn read32(&self, offset: u64) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: u64, value: u32) {
        (**self).write32(offset, value)
    }

    fn read64(&self, offset: u64) -> u64 {
        (**self).read64(offset)
    }

    fn write64(&self, offset: u64, value: u64) {
        (**self).write64(offset, value)
    }
}

// Standard NVMe controller registers.
pub const REG_CAP: u64 = 0x0000;
pub const REG_VS: u64 = 0x0008;
pub const REG_INTMS: u64 = 0x000c;
pub const REG_INTMC: u64 = 0x0010;
pub const REG_CC: u64 = 0x0014;
pub const REG_CSTS: u64 = 0x001c;
pub const REG_AQA: u64 = 0x0024;
pub const REG_ASQ: u64 = 0x0028;
pub const REG_ACQ: u64 = 0x0030;
pub const REG_DOORBELLS: u64 = 0x1000;

// ANS2 vendor registers.
pub const ANS_MAX_PEND_CMDS_CTRL: u64 = 0x1210;
pub const ANS_BOOT_STATUS: u64 = 0x1300;
pub const ANS_UNKNOWN_CTRL: u64 = 0x24008;
pub const ANS_LINEAR_SQ_CTRL: u64 = 0x24908;
pub const ANS_LINEAR_ASQ_DB: u64 = 0x2490c;
pub const ANS_LINEAR_IOSQ_DB: u64 = 0x24910;
pub const NVMMU_NUM: u64 = 0x28100;
pub const NVMMU_BASE_ASQ: u64 = 0x28108;
pub const NVMMU_BASE_IOSQ: u64 = 0x28110;
pub const NVMMU_TCB_INVAL: u64 = 0x28118;
pub const NVMMU_TCB_STAT: u64 = 0x28120;

pub const ANS_BOOT_STATUS_OK: u32 = 0xde71_ce55;
pub const ANS_UNKNOWN_CTRL_PRP_NULL_CHECK: u32 = 1 << 11;
pub const ANS_LINEAR_SQ_EN: u32 = 1 << 0;

bitflags! {
    /// Controller configuration (`CC`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cc: u32 {
        const ENABLE = 1 << 0;
        const SHN_NORMAL = 1 << 14;
        const SHN_ABRUPT = 2 << 14;
        const SHN_MASK = 3 << 14;
        /// I/O submission queue entry size, log2 (64 bytes).
        const IOSQES = 6 << 16;
        /// I/O completion queue entry size, log2 (16 bytes).
        const IOCQES = 4 << 20;
        const _ = !0;
    }
}

bitflags! {
    /// Controller status (`CSTS`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Csts: u32 {
        const RDY = 1 << 0;
        const CFS = 1 << 1;
        const SHST_OCCUR = 1 << 2;
        const SHST_CMPLT = 2 << 2;
        const SHST_MASK = 3 << 2;
        const _ = !0;
    }
}

impl Csts {
    /// All-ones: the read did not reach the controller.
    pub fn is_absent(self) -> bool {
        self.bits() == u32::MAX
    }

    pub fn shutdown_complete(self) -> bool {
        self.bits() & Csts::SHST_MASK.bits() == Csts::SHST_CMPLT.bits()
    }
}

/// Decoded fields of the capabilities register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(pub u64);

impl Capabilities {
    /// Maximum queue entries supported (1-based).
    pub fn mqes(self) -> u32 {
        (self.0 & 0xffff) as u32 + 1
    }

    /// Worst-case time for `CSTS.RDY` to follow `CC.EN`.
    pub fn ready_timeout(self) -> Duration {
        let units = (self.0 >> 24) & 0xff;
        Duration::from_millis((units + 1) * 500)
    }

    /// Doorbell stride in 32-bit words.
    pub fn doorbell_stride(self) -> u32 {
        1 << ((self.0 >> 32) & 0xf)
    }
}

/// Register offset of the SQ tail doorbell for `qid`.
pub fn sq_doorbell(qid: u16, stride: u32) -> u64 {
    REG_DOORBELLS + qid as u64 * 2 * stride as u64 * 4
}

/// Register offset of the CQ head doorbell for `qid`.
pub fn cq_doorbell(qid: u16, stride: u32) -> u64 {
    sq_doorbell(qid, stride) + stride as u64 * 4
}

/// Polls `cond` every `interval` until it holds or `timeout` elapses.
///
/// The condition is evaluated once more after the deadline so a slow final sleep cannot turn a
/// success into a timeout.
pub fn poll_until(timeout: Duration, interval: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return cond();
        }
        std::thread::sleep(interval);
    }
}
