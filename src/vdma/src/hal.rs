//! Platform memory services
//!
//! The engine never touches page tables or IOMMUs itself. The host glue
//! implements [`DmaPlatform`] to pin user pages, map scatter lists for bus
//! mastering and hand out DMA-coherent memory.

use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use crate::error::{Result, VdmaError};
use crate::Direction;

pub const PAGE_SIZE: usize = 4096;

/// A pinned user page, identified by its physical frame address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinnedPage {
    pub phys: u64,
}

/// One scatter-list element in CPU physical terms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub phys: u64,
    pub len: u32,
}

/// One mapped segment as the engine sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSegment {
    pub bus_addr: u64,
    pub len: u32,
}

/// Memory services the engine consumes
pub trait DmaPlatform: Send + Sync {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// Whether the bus can master 64-bit addresses
    fn supports_64bit_dma(&self) -> bool;

    /// Whether `[addr, addr+len)` is accessible user memory
    fn access_ok(&self, addr: usize, len: usize, write: bool) -> bool;

    /// Pins `count` pages starting at page-aligned `first`. May return fewer
    /// pages than requested when part of the range cannot be faulted in.
    fn pin_user_pages(&self, first: usize, count: usize, write: bool) -> Result<Vec<PinnedPage>>;

    fn unpin_pages(&self, pages: &[PinnedPage], dirty: bool);

    /// Maps a scatter list; the result may merge entries
    fn map_sg(&self, entries: &[SgEntry], dir: Direction) -> Result<Vec<BusSegment>>;

    fn unmap_sg(&self, entries: &[SgEntry], dir: Direction);

    fn alloc_coherent(&self, size: usize) -> Result<CoherentRegion>;

    fn free_coherent(&self, region: &CoherentRegion);
}

/// DMA-coherent memory visible to both CPU and engine
#[derive(Debug)]
pub struct CoherentRegion {
    cpu: NonNull<u8>,
    bus_addr: u64,
    len: usize,
}

// SAFETY: the region is plain memory owned by the platform allocator and
// all CPU accesses go through atomic or volatile operations.
unsafe impl Send for CoherentRegion {}
unsafe impl Sync for CoherentRegion {}

impl CoherentRegion {
    /// # Safety
    ///
    /// `cpu` must be valid for `len` bytes, 4-byte aligned and stay
    /// allocated until the platform's `free_coherent` is called with it.
    pub unsafe fn from_raw(cpu: *mut u8, bus_addr: u64, len: usize) -> Option<Self> {
        let cpu = NonNull::new(cpu)?;
        if cpu.as_ptr() as usize % 4 != 0 {
            return None;
        }
        Some(Self { cpu, bus_addr, len })
    }

    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.cpu.as_ptr()
    }

    fn word(&self, offset: usize) -> Result<&AtomicU32> {
        if offset % 4 != 0 || offset + 4 > self.len {
            return Err(VdmaError::InvalidArgument("coherent offset out of range"));
        }
        // SAFETY: bounds and alignment checked above.
        Ok(unsafe { &*(self.cpu.as_ptr().add(offset) as *const AtomicU32) })
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        Ok(self.word(offset)?.load(Ordering::Acquire))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.word(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Atomically clears `bits`, returning the previous value
    pub fn clear_bits_u32(&self, offset: usize, bits: u32) -> Result<u32> {
        Ok(self.word(offset)?.fetch_and(!bits, Ordering::AcqRel))
    }

    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > self.len {
            return Err(VdmaError::InvalidArgument("coherent write out of range"));
        }
        // SAFETY: destination range checked above; source is a distinct slice.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.cpu.as_ptr().add(offset), bytes.len());
        }
        fence(Ordering::Release);
        Ok(())
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        if offset + out.len() > self.len {
            return Err(VdmaError::InvalidArgument("coherent read out of range"));
        }
        fence(Ordering::Acquire);
        // SAFETY: source range checked above.
        unsafe {
            core::ptr::copy_nonoverlapping(self.cpu.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }
}
