//! In-crate fakes for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::dma::{DmaAllocator, DmaMemory, CTRL_PAGE_SIZE};
use crate::regs::Mmio;

/// Flat vector-backed coherent memory with a first-fit allocator. Address 0 is never handed out.
pub(crate) struct VecMemory {
    inner: Mutex<VecInner>,
}

struct VecInner {
    buf: Vec<u8>,
    allocs: BTreeMap<u64, usize>,
    /// Remaining successful allocations; `None` is unlimited.
    budget: Option<usize>,
}

impl VecMemory {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(VecInner {
                buf: vec![0u8; size],
                allocs: BTreeMap::new(),
                budget: None,
            }),
        }
    }

    pub fn allocated_bytes(&self) -> usize {
        self.inner.lock().unwrap().allocs.values().sum()
    }

    pub fn set_alloc_budget(&self, budget: Option<usize>) {
        self.inner.lock().unwrap().budget = budget;
    }
}

impl DmaMemory for VecMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) {
        let inner = self.inner.lock().unwrap();
        let start = addr as usize;
        buf.copy_from_slice(&inner.buf[start..start + buf.len()]);
    }

    fn write(&self, addr: u64, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let start = addr as usize;
        inner.buf[start..start + data.len()].copy_from_slice(data);
    }
}

impl DmaAllocator for VecMemory {
    fn alloc_coherent(&self, len: usize, align: usize) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(budget) = inner.budget.as_mut() {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }
        let align = align.max(CTRL_PAGE_SIZE) as u64;
        let align_up = |v: u64| v.div_ceil(align) * align;
        let mut cand = align;
        for (&start, &size) in inner.allocs.iter() {
            if cand + len as u64 <= start {
                break;
            }
            cand = cand.max(align_up(start + size as u64));
        }
        if cand + len as u64 > inner.buf.len() as u64 {
            return None;
        }
        inner.allocs.insert(cand, len);
        Some(cand)
    }

    fn free_coherent(&self, addr: u64, len: usize) {
        let mut inner = self.inner.lock().unwrap();
        let freed = inner.allocs.remove(&addr);
        assert_eq!(freed, Some(len), "free of unknown region {addr:#x}");
    }
}

/// Register window that stores writes and replays them on reads.
#[derive(Default)]
pub(crate) struct RecordingMmio {
    inner: Mutex<MmioInner>,
}

#[derive(Default)]
struct MmioInner {
    regs: HashMap<u64, u32>,
    writes: Vec<(u64, u32)>,
}

impl RecordingMmio {
    pub fn set(&self, offset: u64, value: u32) {
        self.inner.lock().unwrap().regs.insert(offset, value);
    }

    pub fn get(&self, offset: u64) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .regs
            .get(&offset)
            .copied()
            .unwrap_or(0)
    }

    pub fn writes(&self) -> Vec<(u64, u32)> {
        self.inner.lock().unwrap().writes.clone()
    }

    pub fn writes_to(&self, offset: u64) -> Vec<u32> {
        self.inner
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(off, _)| *off == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.inner.lock().unwrap().writes.clear();
    }
}

impl Mmio for RecordingMmio {
    fn read32(&self, offset: u64) -> u32 {
        self.get(offset)
    }

    fn write32(&self, offset: u64, value: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.regs.insert(offset, value);
        inner.writes.push((offset, value));
    }
}
