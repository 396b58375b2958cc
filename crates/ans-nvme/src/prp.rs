//! PRP (physical region page) descriptor chains.
//!
//! A transfer is described by two pointers in the command. Up to two pages fit in the pointers
//! themselves; anything larger puts a pointer list in PRP2. Lists of up to 32 entries come from
//! the 256-byte small pool, longer ones from the page pool, where a full page spends its last slot
//! on a link to the next list page.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::dma::{DmaContext, DmaMemory, DmaPlatform, DmaSegment, CTRL_PAGE_SIZE};
use crate::error::{NvmeError, Result};

pub const SMALL_POOL_BLOCK: usize = 256;
pub const SMALL_POOL_PRPS: usize = SMALL_POOL_BLOCK / 8;
pub const PRPS_PER_PAGE: usize = CTRL_PAGE_SIZE / 8;

const PAGE_MASK: u64 = CTRL_PAGE_SIZE as u64 - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Small,
    Page,
}

/// Bounded pool of equally sized list blocks carved from one coherent slab.
pub struct PrpPool {
    kind: PoolKind,
    block_size: usize,
    capacity: usize,
    slab: crate::dma::DmaBuffer,
    free: Mutex<Vec<u32>>,
}

impl PrpPool {
    pub fn new(ctx: &DmaContext, kind: PoolKind, blocks: usize) -> Result<Self> {
        let block_size = match kind {
            PoolKind::Small => SMALL_POOL_BLOCK,
            PoolKind::Page => CTRL_PAGE_SIZE,
        };
        let slab = ctx.alloc(block_size * blocks)?;
        // Popped from the back, so the lowest addresses are used first.
        let free = (0..blocks as u32).rev().collect();
        Ok(Self {
            kind,
            block_size,
            capacity: blocks,
            slab,
            free: Mutex::new(free),
        })
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns the bus address of a free block, or `None` when the pool is exhausted.
    pub fn alloc(&self) -> Option<u64> {
        let index = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()?;
        Some(self.slab.addr() + index as u64 * self.block_size as u64)
    }

    pub fn free(&self, addr: u64) {
        let offset = addr.wrapping_sub(self.slab.addr());
        let index = offset / self.block_size as u64;
        debug_assert!(
            offset % self.block_size as u64 == 0 && (index as usize) < self.capacity,
            "{addr:#x} does not belong to the {:?} pool",
            self.kind
        );
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(!free.contains(&(index as u32)), "double free of {addr:#x}");
        free.push(index as u32);
    }
}

impl fmt::Debug for PrpPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrpPool")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// The device's two list pools.
#[derive(Debug)]
pub struct PrpPools {
    small: PrpPool,
    page: PrpPool,
}

impl PrpPools {
    pub fn new(ctx: &DmaContext, small_blocks: usize, pages: usize) -> Result<Self> {
        Ok(Self {
            small: PrpPool::new(ctx, PoolKind::Small, small_blocks)?,
            page: PrpPool::new(ctx, PoolKind::Page, pages)?,
        })
    }

    pub fn pool(&self, kind: PoolKind) -> &PrpPool {
        match kind {
            PoolKind::Small => &self.small,
            PoolKind::Page => &self.page,
        }
    }

    fn memory(&self) -> &dyn DmaPlatform {
        self.page.slab.memory()
    }
}

/// List blocks owned by one in-flight command.
///
/// Releasing consumes the chain, so a chain cannot be returned to its pool twice.
#[derive(Default)]
#[must_use = "a PRP chain must be released back to its pool"]
pub struct PrpChain {
    kind: Option<PoolKind>,
    blocks: Vec<u64>,
}

impl PrpChain {
    fn new(kind: PoolKind) -> Self {
        Self {
            kind: Some(kind),
            blocks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn kind(&self) -> Option<PoolKind> {
        self.kind
    }

    /// Bus addresses of the list blocks, in link order.
    pub fn blocks(&self) -> &[u64] {
        &self.blocks
    }

    pub fn release(mut self, pools: &PrpPools) {
        if let Some(kind) = self.kind {
            let pool = pools.pool(kind);
            for addr in self.blocks.drain(..) {
                pool.free(addr);
            }
        }
    }
}

impl Drop for PrpChain {
    fn drop(&mut self) {
        if !self.blocks.is_empty() {
            tracing::error!(blocks = self.blocks.len(), "PRP chain dropped without release");
        }
    }
}

impl fmt::Debug for PrpChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrpChain")
            .field("kind", &self.kind)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

/// Pointer fields for a command plus the list blocks backing them.
#[derive(Debug, Default)]
pub struct PrpMapping {
    pub prp1: u64,
    pub prp2: u64,
    pub chain: PrpChain,
}

impl PrpMapping {
    pub fn release(self, pools: &PrpPools) {
        self.chain.release(pools);
    }
}

fn bad_fragments(msg: &str, segments: &[DmaSegment], length: usize) -> NvmeError {
    tracing::warn!(length, nents = segments.len(), ?segments, "invalid fragment list");
    NvmeError::Io(format!("{msg} (payload {length} bytes, {} fragments)", segments.len()))
}

/// Builds the PRP pointers describing `segments`, which must cover exactly `length` bytes.
///
/// Fragments after the first must start on a page boundary and every fragment but the last must
/// end on one; anything else cannot be expressed as PRPs and is rejected with [`NvmeError::Io`].
/// When a pool runs dry the partial chain is returned before [`NvmeError::ResourceExhausted`]
/// is reported.
pub fn map_data(pools: &PrpPools, segments: &[DmaSegment], length: usize) -> Result<PrpMapping> {
    if length == 0 {
        if segments.is_empty() {
            return Ok(PrpMapping::default());
        }
        return Err(bad_fragments("fragments on a zero-length transfer", segments, length));
    }
    let Some(&first) = segments.first() else {
        return Err(bad_fragments("no fragments", segments, length));
    };
    if segments.iter().any(|s| s.len == 0) {
        return Err(bad_fragments("zero-length fragment", segments, length));
    }
    if segments
        .iter()
        .any(|s| s.addr.checked_add(s.len as u64).is_none())
    {
        return Err(bad_fragments("fragment wraps the address space", segments, length));
    }
    let total: u64 = segments.iter().map(|s| s.len as u64).sum();
    if total != length as u64 {
        return Err(bad_fragments("fragment lengths do not match payload", segments, length));
    }

    let last = segments.len() - 1;
    for (i, seg) in segments.iter().enumerate() {
        if i > 0 && seg.addr & PAGE_MASK != 0 {
            return Err(bad_fragments("fragment does not start on a page", segments, length));
        }
        if i < last && (seg.addr + seg.len as u64) & PAGE_MASK != 0 {
            return Err(bad_fragments("fragment does not end on a page", segments, length));
        }
    }

    let offset = first.addr & PAGE_MASK;
    if segments.len() == 1 && offset + first.len as u64 <= 2 * CTRL_PAGE_SIZE as u64 {
        let first_prp_len = CTRL_PAGE_SIZE as u64 - offset;
        let prp2 = if first.len as u64 > first_prp_len {
            first.addr + first_prp_len
        } else {
            0
        };
        return Ok(PrpMapping {
            prp1: first.addr,
            prp2,
            chain: PrpChain::default(),
        });
    }

    build_list(pools, segments, length, first, offset)
}

fn build_list(
    pools: &PrpPools,
    segments: &[DmaSegment],
    length: usize,
    first: DmaSegment,
    offset: u64,
) -> Result<PrpMapping> {
    let page = CTRL_PAGE_SIZE as i64;
    let mut remaining = length as i64 - (page - offset as i64);
    if remaining <= 0 {
        return Ok(PrpMapping {
            prp1: first.addr,
            prp2: 0,
            chain: PrpChain::default(),
        });
    }

    let mut seg_index = 0;
    let mut dma_addr = first.addr;
    let mut dma_len = first.len as i64 - (page - offset as i64);
    let next_segment = |seg_index: &mut usize| -> Result<(u64, i64)> {
        *seg_index += 1;
        match segments.get(*seg_index) {
            Some(seg) if seg.addr & PAGE_MASK == 0 => Ok((seg.addr, seg.len as i64)),
            Some(_) => Err(bad_fragments("fragment does not start on a page", segments, length)),
            None => Err(bad_fragments("fragments end before payload", segments, length)),
        }
    };

    if dma_len > 0 {
        dma_addr += (page - offset as i64) as u64;
    } else if dma_len == 0 {
        (dma_addr, dma_len) = next_segment(&mut seg_index)?;
    } else {
        return Err(bad_fragments("fragment does not end on a page", segments, length));
    }

    if remaining <= page {
        return Ok(PrpMapping {
            prp1: first.addr,
            prp2: dma_addr,
            chain: PrpChain::default(),
        });
    }

    let nprps = (remaining as usize).div_ceil(CTRL_PAGE_SIZE);
    let kind = if nprps <= SMALL_POOL_PRPS {
        PoolKind::Small
    } else {
        PoolKind::Page
    };
    let pool = pools.pool(kind);
    let mem = pools.memory();

    let mut chain = PrpChain::new(kind);
    let first_list = pool
        .alloc()
        .ok_or(NvmeError::ResourceExhausted("PRP list pool"))?;
    chain.blocks.push(first_list);

    let mut list = first_list;
    let mut i = 0usize;
    loop {
        if i == PRPS_PER_PAGE {
            let Some(next) = pool.alloc() else {
                chain.release(pools);
                return Err(NvmeError::ResourceExhausted("PRP list pool"));
            };
            chain.blocks.push(next);
            let link_slot = list + (i as u64 - 1) * 8;
            mem.write_u64(next, mem.read_u64(link_slot));
            mem.write_u64(link_slot, next);
            list = next;
            i = 1;
        }
        mem.write_u64(list + i as u64 * 8, dma_addr);
        i += 1;
        dma_len -= page;
        dma_addr += CTRL_PAGE_SIZE as u64;
        remaining -= page;
        if remaining <= 0 {
            break;
        }
        if dma_len > 0 {
            continue;
        }
        if dma_len < 0 {
            chain.release(pools);
            return Err(bad_fragments("fragment does not end on a page", segments, length));
        }
        match next_segment(&mut seg_index) {
            Ok(next) => (dma_addr, dma_len) = next,
            Err(err) => {
                chain.release(pools);
                return Err(err);
            }
        }
    }

    Ok(PrpMapping {
        prp1: first.addr,
        prp2: first_list,
        chain,
    })
}

/// Resolves PRP pointers back into the page fragments they describe.
///
/// This is the controller's view of a command: it reads list entries from memory and follows the
/// chain link in the last slot of a full list page. The first list may start anywhere inside a
/// page (small-pool blocks do); its capacity is whatever remains of that page.
pub fn walk_prps<M: DmaMemory + ?Sized>(
    mem: &M,
    prp1: u64,
    prp2: u64,
    len: usize,
) -> Result<Vec<DmaSegment>> {
    let invalid = |msg: &'static str| NvmeError::Io(msg.to_string());
    if len == 0 {
        return Ok(Vec::new());
    }
    if prp1 == 0 {
        return Err(invalid("PRP1 is null"));
    }

    let first_offset = (prp1 & PAGE_MASK) as usize;
    let first_len = (CTRL_PAGE_SIZE - first_offset).min(len);

    let mut segs = vec![DmaSegment::new(prp1, first_len as u32)];
    let mut remaining = len - first_len;
    if remaining == 0 {
        return Ok(segs);
    }

    if remaining <= CTRL_PAGE_SIZE {
        if prp2 == 0 || prp2 & PAGE_MASK != 0 {
            return Err(invalid("PRP2 is not a page address"));
        }
        segs.push(DmaSegment::new(prp2, remaining as u32));
        return Ok(segs);
    }

    if prp2 == 0 || prp2 & 0x7 != 0 {
        return Err(invalid("PRP list pointer is not qword aligned"));
    }

    let mut list_addr = prp2;
    while remaining > 0 {
        let entries_per_list = (CTRL_PAGE_SIZE - (list_addr & PAGE_MASK) as usize) / 8;
        let pages_needed = remaining.div_ceil(CTRL_PAGE_SIZE);
        let max_pages_this_list = if pages_needed > entries_per_list {
            entries_per_list - 1
        } else {
            pages_needed
        };

        for entry_index in 0..max_pages_this_list {
            let page = mem.read_u64(list_addr + entry_index as u64 * 8);
            if page == 0 || page & PAGE_MASK != 0 {
                return Err(invalid("PRP entry is not a page address"));
            }
            let chunk = remaining.min(CTRL_PAGE_SIZE);
            segs.push(DmaSegment::new(page, chunk as u32));
            remaining -= chunk;
        }

        if remaining == 0 {
            break;
        }

        let next = mem.read_u64(list_addr + (entries_per_list as u64 - 1) * 8);
        if next == 0 || next & PAGE_MASK != 0 {
            return Err(invalid("PRP list link is not a page address"));
        }
        list_addr = next;
    }

    Ok(segs)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::filter::NoFilter;
    use crate::testutil::VecMemory;

    const PAGE: u64 = CTRL_PAGE_SIZE as u64;
    const DATA_BASE: u64 = 0x1_0000_0000;

    fn pools(small: usize, pages: usize) -> PrpPools {
        let mem = Arc::new(VecMemory::new(4 << 20));
        let ctx = DmaContext::new(mem, Arc::new(NoFilter));
        PrpPools::new(&ctx, small, pages).unwrap()
    }

    fn seg(addr: u64, len: u64) -> DmaSegment {
        DmaSegment::new(addr, len as u32)
    }

    /// Merges physically adjacent fragments so different splits of one range compare equal.
    fn coalesce(segs: &[DmaSegment]) -> Vec<(u64, u64)> {
        let mut out: Vec<(u64, u64)> = Vec::new();
        for s in segs {
            match out.last_mut() {
                Some((addr, len)) if *addr + *len == s.addr => *len += s.len as u64,
                _ => out.push((s.addr, s.len as u64)),
            }
        }
        out
    }

    #[test]
    fn single_page_uses_prp1_only() {
        let pools = pools(4, 4);
        let m = map_data(&pools, &[seg(DATA_BASE + 0x200, 0x800)], 0x800).unwrap();
        assert_eq!(m.prp1, DATA_BASE + 0x200);
        assert_eq!(m.prp2, 0);
        assert!(m.chain.is_empty());
        m.release(&pools);
    }

    #[test]
    fn two_pages_use_simple_pair_without_allocation() {
        let pools = pools(4, 4);
        let m = map_data(&pools, &[seg(DATA_BASE + 0x200, 2 * PAGE - 0x200)], 2 * 4096 - 0x200)
            .unwrap();
        assert_eq!(m.prp1, DATA_BASE + 0x200);
        assert_eq!(m.prp2, DATA_BASE + PAGE);
        assert!(m.chain.is_empty());
        assert_eq!(pools.pool(PoolKind::Small).available(), 4);
        assert_eq!(pools.pool(PoolKind::Page).available(), 4);
        m.release(&pools);
    }

    #[test]
    fn two_fragments_of_one_page_each_use_prp2_directly() {
        let pools = pools(4, 4);
        let segs = [seg(DATA_BASE, PAGE), seg(DATA_BASE + 8 * PAGE, PAGE)];
        let m = map_data(&pools, &segs, 2 * CTRL_PAGE_SIZE).unwrap();
        assert_eq!(m.prp1, DATA_BASE);
        assert_eq!(m.prp2, DATA_BASE + 8 * PAGE);
        assert!(m.chain.is_empty());
        m.release(&pools);
    }

    #[test]
    fn small_list_comes_from_small_pool() {
        let pools = pools(4, 4);
        let len = 10 * PAGE;
        let m = map_data(&pools, &[seg(DATA_BASE, len)], len as usize).unwrap();
        assert_eq!(m.chain.kind(), Some(PoolKind::Small));
        assert_eq!(m.chain.blocks(), &[m.prp2]);
        assert_eq!(pools.pool(PoolKind::Small).available(), 3);

        let walked = walk_prps(pools.memory(), m.prp1, m.prp2, len as usize).unwrap();
        assert_eq!(coalesce(&walked), vec![(DATA_BASE, len)]);

        m.release(&pools);
        assert_eq!(pools.pool(PoolKind::Small).available(), 4);
    }

    #[test]
    fn long_transfer_chains_page_lists() {
        let pools = pools(4, 4);
        // PRP1 covers one page; two list pages of 511 entries end in links, the third holds two.
        let pages = 1 + 2 * (PRPS_PER_PAGE as u64 - 1) + 2;
        let len = pages * PAGE;
        let m = map_data(&pools, &[seg(DATA_BASE, len)], len as usize).unwrap();
        assert_eq!(m.chain.kind(), Some(PoolKind::Page));
        assert_eq!(m.chain.blocks().len(), 3);
        assert_eq!(m.chain.blocks()[0], m.prp2);

        let mem = pools.memory();
        let last = (PRPS_PER_PAGE as u64 - 1) * 8;
        assert_eq!(mem.read_u64(m.chain.blocks()[0] + last), m.chain.blocks()[1]);
        assert_eq!(mem.read_u64(m.chain.blocks()[1] + last), m.chain.blocks()[2]);

        let walked = walk_prps(mem, m.prp1, m.prp2, len as usize).unwrap();
        assert_eq!(walked.len() as u64, pages);
        assert_eq!(coalesce(&walked), vec![(DATA_BASE, len)]);

        m.release(&pools);
        assert_eq!(pools.pool(PoolKind::Page).available(), 4);
    }

    #[test]
    fn fragments_wrapping_the_address_space_are_rejected() {
        let pools = pools(4, 4);
        let top = u64::MAX - (PAGE - 1);
        let err = map_data(&pools, &[seg(top, 2 * PAGE)], 2 * PAGE as usize).unwrap_err();
        assert!(matches!(err, NvmeError::Io(_)), "{err:?}");

        let segs = [seg(top, PAGE), seg(DATA_BASE, PAGE)];
        let err = map_data(&pools, &segs, 2 * PAGE as usize).unwrap_err();
        assert!(matches!(err, NvmeError::Io(_)), "{err:?}");
        assert_eq!(pools.pool(PoolKind::Small).available(), 4);
        assert_eq!(pools.pool(PoolKind::Page).available(), 4);
    }

    #[test]
    fn exactly_one_full_list_page_needs_no_link() {
        let pools = pools(4, 4);
        let len = (1 + PRPS_PER_PAGE as u64) * PAGE;
        let m = map_data(&pools, &[seg(DATA_BASE, len)], len as usize).unwrap();
        assert_eq!(m.chain.blocks().len(), 1);
        let walked = walk_prps(pools.memory(), m.prp1, m.prp2, len as usize).unwrap();
        assert_eq!(coalesce(&walked), vec![(DATA_BASE, len)]);
        m.release(&pools);
    }

    #[test]
    fn exhaustion_releases_partial_chain() {
        let pools = pools(4, 1);
        let len = 600 * PAGE;
        let err = map_data(&pools, &[seg(DATA_BASE, len)], len as usize).unwrap_err();
        assert_eq!(err, NvmeError::ResourceExhausted("PRP list pool"));
        assert!(err.is_retryable());
        assert_eq!(pools.pool(PoolKind::Page).available(), 1);
    }

    #[test]
    fn misaligned_middle_fragment_is_rejected() {
        let pools = pools(4, 4);
        let segs = [
            seg(DATA_BASE, 2 * PAGE),
            seg(DATA_BASE + 16 * PAGE, PAGE + 0x200),
            seg(DATA_BASE + 32 * PAGE, 2 * PAGE),
        ];
        let len = segs.iter().map(|s| s.len as usize).sum();
        let err = map_data(&pools, &segs, len).unwrap_err();
        assert!(matches!(err, NvmeError::Io(_)));
        assert_eq!(pools.pool(PoolKind::Small).available(), 4);
    }

    #[test]
    fn unaligned_fragment_start_is_rejected() {
        let pools = pools(4, 4);
        let segs = [
            seg(DATA_BASE, 2 * PAGE),
            seg(DATA_BASE + 16 * PAGE + 0x10, 2 * PAGE),
        ];
        let err = map_data(&pools, &segs, 4 * CTRL_PAGE_SIZE).unwrap_err();
        assert!(matches!(err, NvmeError::Io(_)));
        assert_eq!(pools.pool(PoolKind::Small).available(), 4);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let pools = pools(4, 4);
        let err = map_data(&pools, &[seg(DATA_BASE, PAGE)], 2 * CTRL_PAGE_SIZE).unwrap_err();
        assert!(matches!(err, NvmeError::Io(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn walker_rejects_bad_pointers() {
        let mem = VecMemory::new(1 << 16);
        assert!(walk_prps(&mem, 0, 0, 512).is_err());
        assert!(walk_prps(&mem, 0x1000, 0x2010, 2 * CTRL_PAGE_SIZE).is_err());
        // List entry left at zero.
        assert!(walk_prps(&mem, 0x1000, 0x2000, 3 * CTRL_PAGE_SIZE).is_err());
    }

    /// A fragment list the block layer could hand us: the first fragment may start mid-page,
    /// interior boundaries are page aligned, and the last fragment may end mid-page.
    fn fragment_list() -> impl Strategy<Value = Vec<DmaSegment>> {
        (
            0u64..PAGE / 8,
            prop::collection::vec((1u64..40, 0u64..4), 1..6),
            1u64..=PAGE,
        )
            .prop_map(|(first_offset_qw, middles, tail)| {
                let first_offset = first_offset_qw * 8;
                let mut segs = Vec::new();
                let mut page_cursor = DATA_BASE / PAGE;
                let count = middles.len();
                for (i, (pages, gap)) in middles.into_iter().enumerate() {
                    let start = page_cursor * PAGE + if i == 0 { first_offset } else { 0 };
                    let mut end = (page_cursor + pages) * PAGE;
                    if i + 1 == count {
                        end = end - PAGE + tail;
                        if end <= start {
                            end = start + 1;
                        }
                    }
                    segs.push(DmaSegment::new(start, (end - start) as u32));
                    page_cursor += pages + gap;
                }
                segs
            })
    }

    proptest! {
        #[test]
        fn mapping_walks_back_to_original_fragments(segs in fragment_list()) {
            let pools = pools(8, 8);
            let len: usize = segs.iter().map(|s| s.len as usize).sum();
            let mapping = map_data(&pools, &segs, len).unwrap();
            let walked = walk_prps(pools.memory(), mapping.prp1, mapping.prp2, len).unwrap();

            prop_assert_eq!(walked.iter().map(|s| s.len as usize).sum::<usize>(), len);
            prop_assert_eq!(coalesce(&walked), coalesce(&segs));

            mapping.release(&pools);
            prop_assert_eq!(pools.pool(PoolKind::Small).available(), 8);
            prop_assert_eq!(pools.pool(PoolKind::Page).available(), 8);
        }
    }
}
