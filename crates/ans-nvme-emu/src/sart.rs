use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use ans_nvme::filter::SART_MAX_ENTRIES;
use ans_nvme::{Mmio, SartRevision};

const CONFIG_BASE: u64 = 0x00;
const PADDR_BASE: u64 = 0x40;
const SIZE_BASE: u64 = 0x80;
const GRANULE_SHIFT: u32 = 12;

/// Register block of a SART allow list.
///
/// Only decodes what is programmed; it does not police DMA itself. The controller model asks it
/// whether a region is open.
pub struct EmuSart {
    revision: SartRevision,
    regs: Mutex<HashMap<u64, u32>>,
}

impl EmuSart {
    pub fn new(revision: SartRevision) -> Self {
        Self {
            revision,
            regs: Mutex::new(HashMap::new()),
        }
    }

    /// Programs entry `index` the way a bootloader would before handing over.
    pub fn preload(&self, index: usize, paddr: u64, size: u64) {
        let idx = index as u64 * 4;
        let granules = (size >> GRANULE_SHIFT) as u32;
        self.write32(PADDR_BASE + idx, (paddr >> GRANULE_SHIFT) as u32);
        match self.revision {
            SartRevision::V2 => self.write32(CONFIG_BASE + idx, 0xff << 24 | granules),
            SartRevision::V3 => {
                self.write32(SIZE_BASE + idx, granules);
                self.write32(CONFIG_BASE + idx, 0xff);
            }
        }
    }

    /// Enabled entries as `(paddr, size)` pairs.
    pub fn windows(&self) -> Vec<(u64, u64)> {
        (0..SART_MAX_ENTRIES)
            .filter_map(|index| {
                let idx = index as u64 * 4;
                let cfg = self.read32(CONFIG_BASE + idx);
                let paddr = (self.read32(PADDR_BASE + idx) as u64) << GRANULE_SHIFT;
                let (flags, granules) = match self.revision {
                    SartRevision::V2 => (cfg >> 24, cfg & 0x00ff_ffff),
                    SartRevision::V3 => (cfg & 0xff, self.read32(SIZE_BASE + idx)),
                };
                (flags != 0).then_some((paddr, (granules as u64) << GRANULE_SHIFT))
            })
            .collect()
    }

    pub fn covers(&self, addr: u64, len: u64) -> bool {
        self.windows()
            .iter()
            .any(|&(base, size)| addr >= base && addr + len <= base + size)
    }
}

impl Mmio for EmuSart {
    fn read32(&self, offset: u64) -> u32 {
        self.regs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&offset)
            .copied()
            .unwrap_or(0)
    }

    fn write32(&self, offset: u64, value: u32) {
        self.regs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(offset, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_both_packings() {
        for revision in [SartRevision::V2, SartRevision::V3] {
            let sart = EmuSart::new(revision);
            sart.preload(2, 0x8000_0000, 0x10000);
            assert_eq!(sart.windows(), vec![(0x8000_0000, 0x10000)]);
            assert!(sart.covers(0x8000_1000, 0x1000));
            assert!(!sart.covers(0x8000_f000, 0x2000));
        }
    }
}
