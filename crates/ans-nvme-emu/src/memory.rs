use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ans_nvme::dma::CTRL_PAGE_SIZE;
use ans_nvme::{DmaAllocator, DmaMemory, DmaSegment};

/// Flat guest-physical memory shared by the host engine and the emulated controller.
///
/// Address 0 is never handed out so a null pointer in a command is always detectable. Accesses
/// outside the backing store are dropped (writes) or read as zero, like an unclaimed bus cycle.
pub struct EmuMemory {
    inner: Mutex<Inner>,
}

struct Inner {
    ram: Vec<u8>,
    allocs: BTreeMap<u64, usize>,
}

impl EmuMemory {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ram: vec![0u8; size],
                allocs: BTreeMap::new(),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn size(&self) -> usize {
        self.inner().ram.len()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.inner().allocs.values().sum()
    }

    pub fn allocation_count(&self) -> usize {
        self.inner().allocs.len()
    }

    /// Carves out a page-aligned data buffer for a test request and returns it as one fragment.
    pub fn alloc_segment(&self, len: usize) -> Option<DmaSegment> {
        let addr = self.alloc_coherent(len, CTRL_PAGE_SIZE)?;
        Some(DmaSegment::new(addr, len as u32))
    }

    pub fn read_vec(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read(addr, &mut out);
        out
    }
}

impl DmaMemory for EmuMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) {
        let inner = self.inner();
        let start = addr as usize;
        match start
            .checked_add(buf.len())
            .and_then(|end| inner.ram.get(start..end))
        {
            Some(src) => buf.copy_from_slice(src),
            None => {
                tracing::warn!(addr, len = buf.len(), "read outside guest memory");
                buf.fill(0);
            }
        }
    }

    fn write(&self, addr: u64, data: &[u8]) {
        let mut inner = self.inner();
        let start = addr as usize;
        match start
            .checked_add(data.len())
            .and_then(|end| inner.ram.get_mut(start..end))
        {
            Some(dst) => dst.copy_from_slice(data),
            None => tracing::warn!(addr, len = data.len(), "write outside guest memory"),
        }
    }
}

impl DmaAllocator for EmuMemory {
    fn alloc_coherent(&self, len: usize, align: usize) -> Option<u64> {
        let mut inner = self.inner();
        let align = align.max(CTRL_PAGE_SIZE) as u64;
        let align_up = |v: u64| v.div_ceil(align) * align;
        let mut cand = align;
        for (&start, &size) in inner.allocs.iter() {
            if cand + len as u64 <= start {
                break;
            }
            cand = cand.max(align_up(start + size as u64));
        }
        if cand + len as u64 > inner.ram.len() as u64 {
            return None;
        }
        inner.allocs.insert(cand, len);
        Some(cand)
    }

    fn free_coherent(&self, addr: u64, len: usize) {
        let mut inner = self.inner();
        match inner.allocs.remove(&addr) {
            Some(size) if size == len => {}
            other => tracing::warn!(addr, len, recorded = ?other, "mismatched free"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_page_aligned_and_disjoint() {
        let mem = EmuMemory::new(1 << 20);
        let a = mem.alloc_coherent(100, 8).unwrap();
        let b = mem.alloc_coherent(CTRL_PAGE_SIZE * 2, CTRL_PAGE_SIZE).unwrap();
        assert_ne!(a, 0);
        assert_eq!(a % CTRL_PAGE_SIZE as u64, 0);
        assert_eq!(b % CTRL_PAGE_SIZE as u64, 0);
        assert!(b >= a + CTRL_PAGE_SIZE as u64);

        mem.free_coherent(a, 100);
        let c = mem.alloc_coherent(CTRL_PAGE_SIZE, CTRL_PAGE_SIZE).unwrap();
        assert_eq!(c, a);
        assert_eq!(mem.allocation_count(), 2);
    }

    #[test]
    fn out_of_range_access_is_harmless() {
        let mem = EmuMemory::new(CTRL_PAGE_SIZE * 2);
        mem.write(u64::MAX - 2, &[1, 2, 3]);
        let mut buf = [0xffu8; 4];
        mem.read(CTRL_PAGE_SIZE as u64 * 2 - 2, &mut buf);
        assert_eq!(buf, [0; 4]);
        assert!(mem.alloc_coherent(CTRL_PAGE_SIZE * 2, CTRL_PAGE_SIZE).is_none());
    }
}
