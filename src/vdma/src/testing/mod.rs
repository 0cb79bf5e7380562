//! Simulated board for tests and bring-up without hardware
//!
//! [`SimRegisters`] models the register window: plain storage plus the
//! write-one-to-clear registers and a write log. [`SimPlatform`] pins fake
//! user pages and hands out heap-backed coherent memory, counting every
//! acquisition so tests can check that teardown released it.

use core::sync::atomic::{AtomicU32, Ordering};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use spin::Mutex;

use crate::config::EngineConfig;
use crate::device::VdmaDevice;
use crate::error::{Result, VdmaError};
use crate::hal::{BusSegment, CoherentRegion, DmaPlatform, PinnedPage, SgEntry, PAGE_SIZE};
use crate::regs::layout::{self, IrqBits, MsiVector};
use crate::regs::RegisterSpace;
use crate::resources::{BarInfo, PciResources};
use crate::ring::{POLL_INDEX_MASK, POLL_INDEX_SHIFT, POLL_VALID};
use crate::{Direction, MAX_CHANNELS};

/// Register window size of the simulated engine
pub const SIM_WINDOW: usize = 0x1000;
/// Engine revision 1.06.0
pub const SIM_VERSION: u32 = 0x1060_0000;
/// Gen1 x1, both directions, four channels each way
pub const SIM_CAPABILITY: u32 = (2 << 4) | (3 << 20) | (3 << 24);

const PHYS_BASE: u64 = 0x8000_0000;
const COHERENT_BASE_64: u64 = 0x1_0000_0000;
const COHERENT_BASE_32: u64 = 0x7000_0000;
const COHERENT_STRIDE: u64 = 0x1_0000;

#[derive(Default)]
struct RegState {
    words: BTreeMap<usize, u32>,
    writes: Vec<(usize, u32)>,
    w1c: BTreeSet<usize>,
    faults: BTreeSet<usize>,
}

/// In-memory register window
pub struct SimRegisters {
    state: Mutex<RegState>,
}

impl Default for SimRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRegisters {
    /// Empty window; only the write-one-to-clear registers are modelled
    pub fn new() -> Self {
        let mut w1c = BTreeSet::new();
        w1c.insert(layout::MSI_VECTOR);
        for dir in [Direction::CardToHost, Direction::HostToCard] {
            w1c.insert(layout::irq_source(dir));
            for ch in 0..MAX_CHANNELS {
                w1c.insert(layout::buffer_lock(dir, ch));
            }
        }
        Self {
            state: Mutex::new(RegState {
                w1c,
                ..RegState::default()
            }),
        }
    }

    /// Window reporting a supported engine with four channels per direction
    pub fn with_engine() -> Self {
        let sim = Self::new();
        sim.poke(layout::VERSION, SIM_VERSION);
        sim.poke(layout::CAPABILITY, SIM_CAPABILITY);
        sim
    }

    /// Sets a register as the hardware would, bypassing the write log
    pub fn poke(&self, offset: usize, value: u32) {
        self.state.lock().words.insert(offset & !3, value);
    }

    pub fn peek(&self, offset: usize) -> u32 {
        self.state.lock().words.get(&(offset & !3)).copied().unwrap_or(0)
    }

    /// Writes issued to the word at `offset`
    pub fn writes_to(&self, offset: usize) -> usize {
        let offset = offset & !3;
        self.state.lock().writes.iter().filter(|(off, _)| *off == offset).count()
    }

    /// Every logged write as (word offset, value written)
    pub fn write_log(&self) -> Vec<(usize, u32)> {
        self.state.lock().writes.clone()
    }

    pub fn clear_write_log(&self) {
        self.state.lock().writes.clear();
    }

    /// Makes every later write to `offset` fail
    pub fn fail_writes_to(&self, offset: usize) {
        self.state.lock().faults.insert(offset & !3);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Engine side of a finished frame: the status index moves, frame-done
    /// is raised and the channel's MSI cause is latched
    pub fn complete_frame(&self, dir: Direction, channel: usize, index: u8) {
        let shift = layout::STATUS_INDEX_SHIFT + layout::STATUS_INDEX_BITS * channel as u32;
        let group = match dir {
            Direction::CardToHost => MsiVector::C2H_FRAME_DONE,
            Direction::HostToCard => MsiVector::H2C_FRAME_DONE,
        };
        let msi_bit = 1u32 << (group.bits().trailing_zeros() + channel as u32);

        let mut state = self.state.lock();
        let sr = state.words.entry(layout::status(dir)).or_insert(0);
        *sr = (*sr & !(layout::STATUS_INDEX_MASK << shift)) | ((index as u32 & layout::STATUS_INDEX_MASK) << shift);
        *state.words.entry(layout::irq_source(dir)).or_insert(0) |= IrqBits::FRAME_DONE.bits();
        *state.words.entry(layout::MSI_VECTOR).or_insert(0) |= msi_bit;
    }

    fn check(&self, offset: usize, width: usize) -> Result<()> {
        if offset % width != 0 || offset + width > SIM_WINDOW {
            return Err(VdmaError::InvalidArgument("register offset out of range"));
        }
        Ok(())
    }

    fn read_lane(&self, offset: usize, width: usize) -> Result<u32> {
        self.check(offset, width)?;
        let word = self.peek(offset);
        let shift = (offset & 3) * 8;
        let mask = if width == 4 { u32::MAX } else { (1u32 << (width * 8)) - 1 };
        Ok((word >> shift) & mask)
    }

    fn write_lane(&self, offset: usize, width: usize, value: u32) -> Result<()> {
        self.check(offset, width)?;
        let base = offset & !3;
        let mut state = self.state.lock();
        if state.faults.contains(&base) {
            return Err(VdmaError::Platform("register write fault"));
        }
        state.writes.push((base, value));

        let current = state.words.get(&base).copied().unwrap_or(0);
        let next = if width == 4 {
            if state.w1c.contains(&base) {
                current & !value
            } else {
                value
            }
        } else {
            let shift = (offset & 3) * 8;
            let mask = ((1u32 << (width * 8)) - 1) << shift;
            (current & !mask) | ((value << shift) & mask)
        };
        state.words.insert(base, next);
        Ok(())
    }
}

impl RegisterSpace for SimRegisters {
    fn len(&self) -> usize {
        SIM_WINDOW
    }

    fn read8(&self, offset: usize) -> Result<u8> {
        self.read_lane(offset, 1).map(|v| v as u8)
    }

    fn read16(&self, offset: usize) -> Result<u16> {
        self.read_lane(offset, 2).map(|v| v as u16)
    }

    fn read32(&self, offset: usize) -> Result<u32> {
        self.read_lane(offset, 4)
    }

    fn write8(&self, offset: usize, value: u8) -> Result<()> {
        self.write_lane(offset, 1, value as u32)
    }

    fn write16(&self, offset: usize, value: u16) -> Result<()> {
        self.write_lane(offset, 2, value as u32)
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        self.write_lane(offset, 4, value)
    }
}

struct CoherentAlloc {
    cpu: usize,
    words: usize,
}

#[derive(Default)]
struct PlatformState {
    denied: BTreeSet<usize>,
    fail_pin_at: Option<usize>,
    fail_map_after: Option<usize>,
    fail_coherent_after: Option<usize>,
    contiguous: bool,
    no_64bit: bool,
    pin_calls: usize,
    map_calls: usize,
    coherent_calls: usize,
    live_pins: usize,
    live_mappings: usize,
    coherent: BTreeMap<u64, CoherentAlloc>,
}

/// Fake memory services
///
/// User pages map to scattered physical frames unless
/// [`SimPlatform::set_contiguous`] is on. Bus addresses equal physical
/// addresses.
pub struct SimPlatform {
    state: Mutex<PlatformState>,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PlatformState::default()),
        }
    }

    /// Pages currently pinned
    pub fn live_pins(&self) -> usize {
        self.state.lock().live_pins
    }

    /// Scatter lists currently mapped
    pub fn live_mappings(&self) -> usize {
        self.state.lock().live_mappings
    }

    /// Coherent regions currently allocated
    pub fn live_coherent(&self) -> usize {
        self.state.lock().coherent.len()
    }

    pub fn pin_calls(&self) -> usize {
        self.state.lock().pin_calls
    }

    /// Ranges containing `addr` fail the access check
    pub fn deny_access(&self, addr: usize) {
        self.state.lock().denied.insert(addr);
    }

    /// Pinning stops short at the page starting at `page_addr`
    pub fn fail_pin_at(&self, page_addr: usize) {
        self.state.lock().fail_pin_at = Some(page_addr);
    }

    /// The first `n` mappings succeed, later ones fail
    pub fn fail_map_after(&self, n: usize) {
        self.state.lock().fail_map_after = Some(n);
    }

    /// The first `n` coherent allocations succeed, later ones fail
    pub fn fail_coherent_after(&self, n: usize) {
        self.state.lock().fail_coherent_after = Some(n);
    }

    pub fn set_contiguous(&self, contiguous: bool) {
        self.state.lock().contiguous = contiguous;
    }

    pub fn set_64bit(&self, enabled: bool) {
        self.state.lock().no_64bit = !enabled;
    }

    fn phys_of(contiguous: bool, page: usize) -> u64 {
        if contiguous {
            PHYS_BASE + page as u64
        } else {
            // every other frame, so neighbours never merge
            PHYS_BASE + 2 * page as u64
        }
    }

    fn word_at(&self, bus_addr: u64) -> Option<*const AtomicU32> {
        let state = self.state.lock();
        let (&base, alloc) = state.coherent.range(..=bus_addr).next_back()?;
        let offset = (bus_addr - base) as usize;
        if offset % 4 != 0 || offset / 4 >= alloc.words {
            return None;
        }
        Some((alloc.cpu + offset) as *const AtomicU32)
    }

    /// Engine write into coherent memory; ignored outside any region
    pub fn device_write_u32(&self, bus_addr: u64, value: u32) {
        if let Some(word) = self.word_at(bus_addr) {
            // SAFETY: the word lies inside a live allocation of this platform.
            unsafe { (*word).store(value, Ordering::Release) };
        }
    }

    /// Engine read of coherent memory
    pub fn device_read_u32(&self, bus_addr: u64) -> Option<u32> {
        let word = self.word_at(bus_addr)?;
        // SAFETY: as in `device_write_u32`.
        Some(unsafe { (*word).load(Ordering::Acquire) })
    }

    fn release(alloc: CoherentAlloc) {
        let slice = core::ptr::slice_from_raw_parts_mut(alloc.cpu as *mut u32, alloc.words);
        // SAFETY: produced by `Box::into_raw` in `alloc_coherent` and removed
        // from the table before this call, so it is freed once.
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl DmaPlatform for SimPlatform {
    fn supports_64bit_dma(&self) -> bool {
        !self.state.lock().no_64bit
    }

    fn access_ok(&self, addr: usize, len: usize, _write: bool) -> bool {
        let state = self.state.lock();
        state.denied.range(addr..addr.saturating_add(len)).next().is_none()
    }

    fn pin_user_pages(&self, first: usize, count: usize, _write: bool) -> Result<Vec<PinnedPage>> {
        let mut state = self.state.lock();
        state.pin_calls += 1;
        let mut pages = Vec::with_capacity(count);
        for i in 0..count {
            let page = first + i * PAGE_SIZE;
            if state.fail_pin_at == Some(page) {
                break;
            }
            pages.push(PinnedPage {
                phys: Self::phys_of(state.contiguous, page),
            });
        }
        state.live_pins += pages.len();
        Ok(pages)
    }

    fn unpin_pages(&self, pages: &[PinnedPage], _dirty: bool) {
        let mut state = self.state.lock();
        state.live_pins = state.live_pins.saturating_sub(pages.len());
    }

    fn map_sg(&self, entries: &[SgEntry], _dir: Direction) -> Result<Vec<BusSegment>> {
        let mut state = self.state.lock();
        if state.fail_map_after.is_some_and(|n| state.map_calls >= n) {
            return Err(VdmaError::OutOfMemory);
        }
        state.map_calls += 1;
        state.live_mappings += 1;
        Ok(entries
            .iter()
            .map(|e| BusSegment {
                bus_addr: e.phys,
                len: e.len,
            })
            .collect())
    }

    fn unmap_sg(&self, _entries: &[SgEntry], _dir: Direction) {
        let mut state = self.state.lock();
        state.live_mappings = state.live_mappings.saturating_sub(1);
    }

    fn alloc_coherent(&self, size: usize) -> Result<CoherentRegion> {
        let mut state = self.state.lock();
        if state.fail_coherent_after.is_some_and(|n| state.coherent_calls >= n) {
            return Err(VdmaError::OutOfMemory);
        }
        let index = state.coherent_calls as u64;
        state.coherent_calls += 1;

        let words = size.div_ceil(4).max(1);
        let base = if state.no_64bit { COHERENT_BASE_32 } else { COHERENT_BASE_64 };
        let bus_addr = base + index * COHERENT_STRIDE;
        let cpu = Box::into_raw(vec![0u32; words].into_boxed_slice()) as *mut u32 as *mut u8;
        state.coherent.insert(
            bus_addr,
            CoherentAlloc {
                cpu: cpu as usize,
                words,
            },
        );
        // SAFETY: freshly allocated, u32 aligned and kept until `free_coherent`.
        unsafe { CoherentRegion::from_raw(cpu, bus_addr, words * 4) }
            .ok_or(VdmaError::Platform("coherent allocation misaligned"))
    }

    fn free_coherent(&self, region: &CoherentRegion) {
        let alloc = self.state.lock().coherent.remove(&region.bus_addr());
        if let Some(alloc) = alloc {
            Self::release(alloc);
        }
    }
}

impl Drop for SimPlatform {
    fn drop(&mut self) {
        let leftovers = core::mem::take(&mut self.state.lock().coherent);
        for (_, alloc) in leftovers {
            Self::release(alloc);
        }
    }
}

/// Simulated board: register window, platform and a resource table
pub struct SimBoard {
    pub regs: Arc<SimRegisters>,
    pub platform: Arc<SimPlatform>,
    pub resources: PciResources,
}

impl SimBoard {
    /// Board with one shared interrupt vector, `irq`
    pub fn new(irq: u32) -> Self {
        Self::with_vectors(&[irq])
    }

    pub fn with_vectors(vectors: &[u32]) -> Self {
        let resources = PciResources::new(0x1204, 0x9c25)
            .with_bar(BarInfo {
                index: 0,
                addr: 0xF000_0000,
                size: SIM_WINDOW as u64,
                memory: true,
                prefetch: false,
            })
            .with_irq_vectors(vectors);
        Self {
            regs: Arc::new(SimRegisters::with_engine()),
            platform: Arc::new(SimPlatform::new()),
            resources,
        }
    }

    /// Probes a device on this board
    pub fn probe(&self, board: usize, config: EngineConfig) -> Result<VdmaDevice> {
        VdmaDevice::probe(
            board,
            self.regs.clone(),
            self.platform.clone(),
            self.resources.clone(),
            config,
        )
    }

    /// Status word address the driver programmed for a polled channel
    pub fn poll_word_addr(&self, dir: Direction, channel: usize) -> u64 {
        let (hi, lo) = layout::nonint_addr(dir, channel);
        ((self.regs.peek(hi) as u64) << 32) | self.regs.peek(lo) as u64
    }

    /// Engine side of a finished frame in poll mode
    pub fn post_poll_index(&self, dir: Direction, channel: usize, index: u8) {
        let value = (((index as u32) << POLL_INDEX_SHIFT) & POLL_INDEX_MASK) | POLL_VALID;
        self.platform.device_write_u32(self.poll_word_addr(dir, channel), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_w1c_registers_clear_written_bits() {
        let sim = SimRegisters::new();
        let src = layout::irq_source(Direction::HostToCard);
        sim.poke(src, 0b1011);
        sim.write32(src, 0b0001).unwrap();
        assert_eq!(sim.peek(src), 0b1010);

        sim.write32(0x008, 0b0001).unwrap();
        sim.write32(0x008, 0b0100).unwrap();
        assert_eq!(sim.peek(0x008), 0b0100);
        assert_eq!(sim.writes_to(0x008), 2);
    }

    #[test]
    fn test_write_fault_leaves_register_alone() {
        let sim = SimRegisters::new();
        sim.poke(0x030, 7);
        sim.fail_writes_to(0x030);
        assert!(matches!(sim.write32(0x030, 0), Err(VdmaError::Platform(_))));
        assert_eq!(sim.peek(0x030), 7);
        sim.clear_faults();
        sim.write32(0x030, 0).unwrap();
        assert_eq!(sim.peek(0x030), 0);
    }

    #[test]
    fn test_complete_frame_latches_causes() {
        let sim = SimRegisters::new();
        sim.complete_frame(Direction::HostToCard, 2, 9);
        assert_eq!(layout::status_index(sim.peek(layout::status(Direction::HostToCard)), 2), 9);
        assert_eq!(sim.peek(layout::irq_source(Direction::HostToCard)), IrqBits::FRAME_DONE.bits());
        assert_eq!(sim.peek(layout::MSI_VECTOR), 1 << 6);
    }

    #[test]
    fn test_coherent_memory_is_device_visible() {
        let sim = SimPlatform::new();
        let region = sim.alloc_coherent(8).unwrap();
        sim.device_write_u32(region.bus_addr() + 4, 0xABCD);
        assert_eq!(region.read_u32(4).unwrap(), 0xABCD);
        region.write_u32(0, 0x55).unwrap();
        assert_eq!(sim.device_read_u32(region.bus_addr()), Some(0x55));
        assert_eq!(sim.live_coherent(), 1);
        sim.free_coherent(&region);
        assert_eq!(sim.live_coherent(), 0);
        assert_eq!(sim.device_read_u32(region.bus_addr()), None);
    }

    #[test]
    fn test_pages_scatter_unless_contiguous() {
        let sim = SimPlatform::new();
        let pages = sim.pin_user_pages(0x10_0000, 2, true).unwrap();
        assert_ne!(pages[0].phys + PAGE_SIZE as u64, pages[1].phys);
        sim.set_contiguous(true);
        let pages = sim.pin_user_pages(0x10_0000, 2, true).unwrap();
        assert_eq!(pages[0].phys + PAGE_SIZE as u64, pages[1].phys);
        assert_eq!(sim.live_pins(), 4);
    }
}
