//! Coherent DMA memory shared with the controller.

use std::fmt;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::error::{NvmeError, Result};
use crate::filter::AddressFilter;

/// Controller memory page size. `CC.MPS` is always programmed to 4 KiB.
pub const CTRL_PAGE_SIZE: usize = 4096;

/// CPU access to coherent memory, addressed by the bus address the controller sees.
///
/// Accesses are plain loads and stores; ordering against the controller is established with
/// [`dma_wmb`] and [`dma_rmb`], never by the implementation.
pub trait DmaMemory: Send + Sync {
    fn read(&self, addr: u64, buf: &mut [u8]);
    fn write(&self, addr: u64, data: &[u8]);

    fn fill(&self, addr: u64, len: usize, byte: u8) {
        let chunk = [byte; 256];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(chunk.len());
            self.write(addr + done as u64, &chunk[..n]);
            done += n;
        }
    }

    fn read_u16(&self, addr: u64) -> u16 {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf);
        u16::from_le_bytes(buf)
    }

    fn read_u32(&self, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn read_u64(&self, addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u16(&self, addr: u64, val: u16) {
        self.write(addr, &val.to_le_bytes())
    }

    fn write_u32(&self, addr: u64, val: u32) {
        self.write(addr, &val.to_le_bytes())
    }

    fn write_u64(&self, addr: u64, val: u64) {
        self.write(addr, &val.to_le_bytes())
    }
}

/// Allocator for coherent, device-visible memory.
pub trait DmaAllocator: Send + Sync {
    /// Returns the bus address of `len` bytes aligned to `align`, or `None` when exhausted.
    fn alloc_coherent(&self, len: usize, align: usize) -> Option<u64>;
    fn free_coherent(&self, addr: u64, len: usize);
}

/// Everything the engine needs from the platform's DMA layer.
pub trait DmaPlatform: DmaMemory + DmaAllocator {}

impl<T: DmaMemory + DmaAllocator + ?Sized> DmaPlatform for T {}

/// Write barrier: descriptor stores become visible before the doorbell store that follows.
#[inline]
pub fn dma_wmb() {
    fence(Ordering::Release);
}

/// Read barrier: entry payload loads are not satisfied before the phase-bit load that precedes
/// them.
#[inline]
pub fn dma_rmb() {
    fence(Ordering::Acquire);
}

/// One physically contiguous fragment of a data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    pub addr: u64,
    pub len: u32,
}

impl DmaSegment {
    pub fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }
}

/// Allocation context: the platform allocator plus the address filter every buffer must pass.
#[derive(Clone)]
pub struct DmaContext {
    platform: Arc<dyn DmaPlatform>,
    filter: Arc<dyn AddressFilter>,
}

impl DmaContext {
    pub fn new(platform: Arc<dyn DmaPlatform>, filter: Arc<dyn AddressFilter>) -> Self {
        Self { platform, filter }
    }

    pub fn memory(&self) -> &dyn DmaPlatform {
        &*self.platform
    }

    pub fn filter(&self) -> &dyn AddressFilter {
        &*self.filter
    }

    /// Allocates a zeroed, page-aligned buffer and opens it in the address filter.
    ///
    /// The length is rounded up to whole pages so that filter entries never share a page.
    pub fn alloc(&self, len: usize) -> Result<DmaBuffer> {
        let len = len.max(1).div_ceil(CTRL_PAGE_SIZE) * CTRL_PAGE_SIZE;
        let addr = self
            .platform
            .alloc_coherent(len, CTRL_PAGE_SIZE)
            .ok_or(NvmeError::ResourceExhausted("coherent DMA memory"))?;
        if let Err(err) = self.filter.allow(addr, len as u64) {
            self.platform.free_coherent(addr, len);
            return Err(err);
        }
        self.platform.fill(addr, len, 0);
        Ok(DmaBuffer {
            ctx: self.clone(),
            addr,
            len,
        })
    }
}

impl fmt::Debug for DmaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaContext").finish_non_exhaustive()
    }
}

/// A coherent buffer owned by the engine. Dropping it closes the filter window and frees it.
pub struct DmaBuffer {
    ctx: DmaContext,
    addr: u64,
    len: usize,
}

impl DmaBuffer {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn memory(&self) -> &dyn DmaPlatform {
        self.ctx.memory()
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() <= self.len);
        self.ctx.platform.read(self.addr + offset as u64, buf);
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.len);
        self.ctx.platform.write(self.addr + offset as u64, data);
    }

    pub fn zero_range(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.len);
        self.ctx.platform.fill(self.addr + offset as u64, len, 0);
    }

    pub fn zero(&self) {
        self.zero_range(0, self.len);
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.ctx.filter.revoke(self.addr, self.len as u64) {
            tracing::warn!(addr = self.addr, len = self.len, error = %err, "failed to revoke DMA window");
        }
        self.ctx.platform.free_coherent(self.addr, self.len);
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::NoFilter;
    use crate::testutil::VecMemory;

    #[test]
    fn alloc_rounds_to_pages_and_zeroes() {
        let mem = Arc::new(VecMemory::new(1 << 20));
        mem.fill(0, 1 << 20, 0xaa);
        let ctx = DmaContext::new(mem.clone(), Arc::new(NoFilter));

        let buf = ctx.alloc(100).unwrap();
        assert_eq!(buf.len(), CTRL_PAGE_SIZE);
        assert_eq!(buf.addr() % CTRL_PAGE_SIZE as u64, 0);
        let mut out = [0xffu8; 16];
        buf.read_at(CTRL_PAGE_SIZE - 16, &mut out);
        assert_eq!(out, [0u8; 16]);
    }

    #[test]
    fn drop_returns_memory() {
        let mem = Arc::new(VecMemory::new(1 << 20));
        let ctx = DmaContext::new(mem.clone(), Arc::new(NoFilter));
        let buf = ctx.alloc(CTRL_PAGE_SIZE * 2).unwrap();
        assert_eq!(mem.allocated_bytes(), CTRL_PAGE_SIZE * 2);
        drop(buf);
        assert_eq!(mem.allocated_bytes(), 0);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mem = Arc::new(VecMemory::new(CTRL_PAGE_SIZE * 2));
        let ctx = DmaContext::new(mem, Arc::new(NoFilter));
        let _a = ctx.alloc(CTRL_PAGE_SIZE).unwrap();
        assert!(matches!(
            ctx.alloc(CTRL_PAGE_SIZE * 4),
            Err(NvmeError::ResourceExhausted(_))
        ));
    }
}
