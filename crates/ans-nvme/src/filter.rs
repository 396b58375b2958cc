//! DMA address filtering.
//!
//! On ANS2 systems DMA from the storage coprocessor is checked against a small allow list (the
//! SART). It cannot remap anything; a region must simply be opened before the controller is
//! allowed to touch it.

use std::sync::{Mutex, PoisonError};

use crate::error::{NvmeError, Result};
use crate::regs::Mmio;

/// Allow-list service consulted for every engine-owned DMA buffer.
pub trait AddressFilter: Send + Sync {
    fn allow(&self, addr: u64, len: u64) -> Result<()>;
    /// Closes a region previously opened with exactly the same `addr` and `len`.
    fn revoke(&self, addr: u64, len: u64) -> Result<()>;
}

/// Filter for platforms where the controller may reach all of memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFilter;

impl AddressFilter for NoFilter {
    fn allow(&self, _addr: u64, _len: u64) -> Result<()> {
        Ok(())
    }

    fn revoke(&self, _addr: u64, _len: u64) -> Result<()> {
        Ok(())
    }
}

pub const SART_MAX_ENTRIES: usize = 16;
pub const SART_FLAGS_ALLOW: u8 = 0xff;

const SART_CONFIG_BASE: u64 = 0x00;
const SART_PADDR_BASE: u64 = 0x40;
const SART3_SIZE_BASE: u64 = 0x80;
const SART_GRANULE_SHIFT: u32 = 12;
const SART_GRANULE_MASK: u64 = (1 << SART_GRANULE_SHIFT) - 1;
const SART2_SIZE_MASK: u32 = 0x00ff_ffff;

/// One allow-list slot as seen through the registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SartEntry {
    pub flags: u8,
    pub paddr: u64,
    pub size: u64,
}

/// Register packing of a SART generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SartRevision {
    /// Flags and size share one config word per entry.
    V2,
    /// Separate flags, address and size words per entry.
    V3,
}

impl SartRevision {
    /// Maps a firmware compatible string to the register packing it uses.
    pub fn from_compatible(compatible: &str) -> Option<Self> {
        match compatible {
            "apple,t8103-sart" => Some(SartRevision::V2),
            "apple,t6000-sart" => Some(SartRevision::V3),
            _ => None,
        }
    }

    fn get_entry(self, regs: &dyn Mmio, index: usize) -> SartEntry {
        let idx = index as u64 * 4;
        let paddr = (regs.read32(SART_PADDR_BASE + idx) as u64) << SART_GRANULE_SHIFT;
        match self {
            SartRevision::V2 => {
                let cfg = regs.read32(SART_CONFIG_BASE + idx);
                SartEntry {
                    flags: (cfg >> 24) as u8,
                    paddr,
                    size: ((cfg & SART2_SIZE_MASK) as u64) << SART_GRANULE_SHIFT,
                }
            }
            SartRevision::V3 => SartEntry {
                flags: regs.read32(SART_CONFIG_BASE + idx) as u8,
                paddr,
                size: (regs.read32(SART3_SIZE_BASE + idx) as u64) << SART_GRANULE_SHIFT,
            },
        }
    }

    fn set_entry(self, regs: &dyn Mmio, index: usize, entry: SartEntry) {
        let idx = index as u64 * 4;
        let granules = entry.size >> SART_GRANULE_SHIFT;
        regs.write32(
            SART_PADDR_BASE + idx,
            (entry.paddr >> SART_GRANULE_SHIFT) as u32,
        );
        match self {
            SartRevision::V2 => {
                let cfg = (entry.flags as u32) << 24 | (granules as u32 & SART2_SIZE_MASK);
                regs.write32(SART_CONFIG_BASE + idx, cfg);
            }
            SartRevision::V3 => {
                regs.write32(SART3_SIZE_BASE + idx, granules as u32);
                regs.write32(SART_CONFIG_BASE + idx, entry.flags as u32);
            }
        }
    }

    /// Largest region a single entry can describe.
    fn max_size(self) -> u64 {
        match self {
            SartRevision::V2 => (SART2_SIZE_MASK as u64) << SART_GRANULE_SHIFT,
            SartRevision::V3 => (u32::MAX as u64) << SART_GRANULE_SHIFT,
        }
    }
}

/// Driver for one SART instance.
pub struct Sart<R> {
    regs: R,
    revision: SartRevision,
    /// Entries programmed by the bootloader; never touched.
    protected: u16,
    used: Mutex<u16>,
}

impl<R: Mmio> Sart<R> {
    /// Takes over a SART, recording every entry the bootloader left enabled as protected.
    pub fn probe(regs: R, revision: SartRevision) -> Self {
        let mut protected = 0u16;
        for index in 0..SART_MAX_ENTRIES {
            let entry = revision.get_entry(&regs, index);
            if entry.flags == 0 {
                continue;
            }
            tracing::debug!(
                index,
                flags = entry.flags,
                paddr = entry.paddr,
                size = entry.size,
                "SART bootloader entry"
            );
            protected |= 1 << index;
        }
        Self {
            regs,
            revision,
            protected,
            used: Mutex::new(0),
        }
    }

    pub fn revision(&self) -> SartRevision {
        self.revision
    }

    pub fn protected_entries(&self) -> u16 {
        self.protected
    }

    pub fn entry(&self, index: usize) -> SartEntry {
        self.revision.get_entry(&self.regs, index)
    }

    /// Clears every entry this driver may own. Bootloader entries survive.
    pub fn shutdown(&self) {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        for index in 0..SART_MAX_ENTRIES {
            if self.protected & (1 << index) != 0 {
                continue;
            }
            self.revision
                .set_entry(&self.regs, index, SartEntry::default());
        }
        *used = 0;
    }

    fn check_region(&self, addr: u64, len: u64) -> Result<()> {
        if addr & SART_GRANULE_MASK != 0
            || len & SART_GRANULE_MASK != 0
            || len == 0
            || len > self.revision.max_size()
            || (addr >> SART_GRANULE_SHIFT) > u32::MAX as u64
        {
            return Err(NvmeError::FilterRejected { addr, len });
        }
        Ok(())
    }
}

impl<R: Mmio> AddressFilter for Sart<R> {
    fn allow(&self, addr: u64, len: u64) -> Result<()> {
        self.check_region(addr, len)?;
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        let taken = *used | self.protected;
        let Some(index) = (0..SART_MAX_ENTRIES).find(|i| taken & (1 << i) == 0) else {
            tracing::warn!(addr, len, "no free SART entries left");
            return Err(NvmeError::ResourceExhausted("SART entries"));
        };
        *used |= 1 << index;
        self.revision.set_entry(
            &self.regs,
            index,
            SartEntry {
                flags: SART_FLAGS_ALLOW,
                paddr: addr,
                size: len,
            },
        );
        tracing::debug!(index, addr, len, "SART entry programmed");
        Ok(())
    }

    fn revoke(&self, addr: u64, len: u64) -> Result<()> {
        self.check_region(addr, len)?;
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        for index in 0..SART_MAX_ENTRIES {
            if self.protected & (1 << index) != 0 {
                continue;
            }
            let entry = self.revision.get_entry(&self.regs, index);
            if entry.paddr != addr || entry.size != len {
                continue;
            }
            self.revision
                .set_entry(&self.regs, index, SartEntry::default());
            *used &= !(1 << index);
            tracing::debug!(index, "SART entry cleared");
            return Ok(());
        }
        tracing::warn!(addr, len, "SART entry not found");
        Err(NvmeError::FilterRejected { addr, len })
    }
}
