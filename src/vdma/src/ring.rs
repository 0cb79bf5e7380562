//! Descriptor ring builder
//!
//! Every bound buffer gets its own DMA-coherent descriptor array, one entry
//! per mapped segment. The final entry of each array carries the last flag,
//! so the engine never walks from one buffer's chain into the next.

use core::time::Duration;
use std::sync::Arc;

use log::{debug, info};
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::binder::BoundBuffers;
use crate::error::{Result, VdmaError};
use crate::hal::{CoherentRegion, DmaPlatform};
use crate::regs::layout::{self, IrqBits};
use crate::regs::{settle, Registers};
use crate::{Direction, MAX_BUFFERS};

/// Marks the final entry of a buffer's ring
pub const DESC_LAST: u32 = 1 << 31;
pub const DESC_INDEX_SHIFT: u32 = 24;
pub const DESC_LEN_MASK: u32 = 0x00FF_FFFF;

/// Poll word: bit 0 is set by the engine when bits 12..16 hold a new index
pub const POLL_VALID: u32 = 1 << 0;
pub const POLL_INDEX_MASK: u32 = 0x0001_F000;
pub const POLL_INDEX_SHIFT: u32 = 12;

/// Hardware scatter-gather descriptor, little endian
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct HwDescriptor {
    pub addr_hi: U32<LittleEndian>,
    pub addr_lo: U32<LittleEndian>,
    pub flags_len: U32<LittleEndian>,
    pub rsvd: U32<LittleEndian>,
}

pub const DESC_SIZE: usize = core::mem::size_of::<HwDescriptor>();

impl HwDescriptor {
    pub fn new(bus_addr: u64, len: u32, buffer: usize, last: bool, addr64: bool) -> Self {
        let hi = if addr64 { (bus_addr >> 32) as u32 } else { 0 };
        let mut flags_len = ((buffer as u32) << DESC_INDEX_SHIFT) | (len & DESC_LEN_MASK);
        if last {
            flags_len |= DESC_LAST;
        }
        Self {
            addr_hi: U32::new(hi),
            addr_lo: U32::new(bus_addr as u32),
            flags_len: U32::new(flags_len),
            rsvd: U32::new(0),
        }
    }

    pub fn is_last(&self) -> bool {
        self.flags_len.get() & DESC_LAST != 0
    }

    pub fn buffer_index(&self) -> usize {
        ((self.flags_len.get() & !DESC_LAST) >> DESC_INDEX_SHIFT) as usize
    }

    pub fn len(&self) -> u32 {
        self.flags_len.get() & DESC_LEN_MASK
    }
}

/// Coherent descriptor array of one buffer slot
pub struct DescriptorRing {
    platform: Arc<dyn DmaPlatform>,
    region: CoherentRegion,
    entries: usize,
}

impl DescriptorRing {
    pub fn bus_addr(&self) -> u64 {
        self.region.bus_addr()
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Reads back entry `index`
    pub fn entry(&self, index: usize) -> Result<HwDescriptor> {
        if index >= self.entries {
            return Err(VdmaError::InvalidArgument("descriptor index out of range"));
        }
        let mut desc = HwDescriptor::new_zeroed();
        self.region.read_bytes(index * DESC_SIZE, desc.as_bytes_mut())?;
        Ok(desc)
    }
}

impl Drop for DescriptorRing {
    fn drop(&mut self) {
        self.platform.free_coherent(&self.region);
    }
}

/// Coherent word the engine writes completions to in poll mode
pub struct CompletionWord {
    platform: Arc<dyn DmaPlatform>,
    region: CoherentRegion,
}

impl CompletionWord {
    pub fn bus_addr(&self) -> u64 {
        self.region.bus_addr()
    }

    pub fn read(&self) -> Result<u32> {
        self.region.read_u32(0)
    }

    /// Clears the valid bit, returning the word as it was
    pub fn take_valid(&self) -> Result<u32> {
        self.region.clear_bits_u32(0, POLL_VALID)
    }
}

impl Drop for CompletionWord {
    fn drop(&mut self) {
        self.platform.free_coherent(&self.region);
    }
}

/// Rings built for one channel
pub struct DescriptorSet {
    pub rings: heapless::Vec<DescriptorRing, MAX_BUFFERS>,
    pub word: Option<Arc<CompletionWord>>,
}

/// Where and how a channel's rings get programmed
pub struct RingTarget<'a> {
    pub regs: &'a Registers,
    pub platform: &'a Arc<dyn DmaPlatform>,
    pub dir: Direction,
    pub channel: usize,
    pub addr64: bool,
    pub ring_settle: Duration,
    pub polling: bool,
}

impl RingTarget<'_> {
    fn write_settled(&self, offset: usize, value: u32) -> Result<()> {
        self.regs.write32(offset, value)?;
        settle(self.ring_settle);
        Ok(())
    }

    fn hi(&self, addr: u64) -> u32 {
        if self.addr64 {
            (addr >> 32) as u32
        } else {
            0
        }
    }
}

fn build_ring(target: &RingTarget<'_>, slot: usize, bound: &BoundBuffers) -> Result<DescriptorRing> {
    let segments = bound.slots()[slot].segments();
    let region = target.platform.alloc_coherent(segments.len() * DESC_SIZE)?;
    let ring = DescriptorRing {
        platform: target.platform.clone(),
        region,
        entries: segments.len(),
    };

    for (i, seg) in segments.iter().enumerate() {
        if seg.len > DESC_LEN_MASK {
            return Err(VdmaError::InvalidArgument("segment longer than descriptor length field"));
        }
        let last = i + 1 == segments.len();
        let desc = HwDescriptor::new(seg.bus_addr, seg.len, slot, last, target.addr64);
        ring.region.write_bytes(i * DESC_SIZE, desc.as_bytes())?;
    }
    Ok(ring)
}

/// Builds and programs one descriptor ring per bound buffer.
///
/// In poll mode a completion word is allocated and its address handed to
/// the engine; otherwise the direction's completion interrupts are
/// unmasked. A failure frees every ring built so far.
pub fn build(target: &RingTarget<'_>, bound: &BoundBuffers) -> Result<DescriptorSet> {
    let mut rings = heapless::Vec::new();

    for slot in 0..bound.count() {
        let ring = build_ring(target, slot, bound)?;
        let regs = layout::sgb(target.dir, target.channel, slot);
        target.write_settled(regs.addr_hi, target.hi(ring.bus_addr()))?;
        target.write_settled(regs.addr_lo, ring.bus_addr() as u32)?;
        target.write_settled(regs.list_len, ring.entries() as u32)?;
        debug!(
            "ring: {}{} slot {} at 0x{:x}, {} entries",
            target.dir,
            target.channel,
            slot,
            ring.bus_addr(),
            ring.entries()
        );
        if rings.push(ring).is_err() {
            return Err(VdmaError::InvalidArgument("too many rings"));
        }
    }

    let word = if target.polling {
        let region = target.platform.alloc_coherent(4)?;
        let word = CompletionWord {
            platform: target.platform.clone(),
            region,
        };
        word.region.write_u32(0, 0)?;
        let (hi, lo) = layout::nonint_addr(target.dir, target.channel);
        target.regs.write32(hi, target.hi(word.bus_addr()))?;
        target.regs.write32(lo, word.bus_addr() as u32)?;
        Some(Arc::new(word))
    } else {
        None
    };

    let cr = layout::control(target.dir);
    target.regs.modify32(
        cr,
        layout::CR_BUF_COUNT_MASK,
        (bound.count() as u32) << layout::CR_BUF_COUNT_SHIFT,
    )?;

    if !target.polling {
        target
            .regs
            .clear_bits(layout::irq_mask(target.dir), IrqBits::completion_sources(target.dir).bits())?;
    }

    info!(
        "ring: {}{} programmed {} rings{}",
        target.dir,
        target.channel,
        rings.len(),
        if target.polling { " (poll)" } else { "" }
    );
    Ok(DescriptorSet { rings, word })
}
