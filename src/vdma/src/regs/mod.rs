//! Register access layer
//!
//! [`RegisterSpace`] is the raw handle supplied by the bus glue (a mapped
//! BAR on real boards, [`crate::testing::SimRegisters`] in tests).
//! [`Registers`] adds range checks, the write barrier and the settle delay
//! that the engine's control registers need after every read-modify-write.

pub mod layout;

use core::ptr;
use core::sync::atomic::{fence, Ordering};
use core::time::Duration;
use std::sync::Arc;

use log::trace;
use spin::Mutex;

use crate::error::{Result, VdmaError};

/// Raw width-specific access to a memory-mapped register window
pub trait RegisterSpace: Send + Sync {
    /// Size of the window in bytes
    fn len(&self) -> usize;
    fn read8(&self, offset: usize) -> Result<u8>;
    fn read16(&self, offset: usize) -> Result<u16>;
    fn read32(&self, offset: usize) -> Result<u32>;
    fn write8(&self, offset: usize, value: u8) -> Result<()>;
    fn write16(&self, offset: usize, value: u16) -> Result<()>;
    fn write32(&self, offset: usize, value: u32) -> Result<()>;
}

/// Register window backed by a mapped BAR
pub struct MmioSpace {
    base: *mut u8,
    len: usize,
}

// SAFETY: the window is device memory accessed only with volatile ops.
unsafe impl Send for MmioSpace {}
unsafe impl Sync for MmioSpace {}

impl MmioSpace {
    /// Wraps a mapped register window
    ///
    /// # Safety
    ///
    /// `base` must point to `len` bytes of device memory that stay mapped
    /// for the lifetime of the returned value.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    fn check(&self, offset: usize, width: usize) -> Result<()> {
        if offset % width != 0 || offset + width > self.len {
            return Err(VdmaError::InvalidArgument("register offset out of range"));
        }
        Ok(())
    }
}

impl RegisterSpace for MmioSpace {
    fn len(&self) -> usize {
        self.len
    }

    fn read8(&self, offset: usize) -> Result<u8> {
        self.check(offset, 1)?;
        // SAFETY: `check` keeps the access inside the `len` bytes `new` was given.
        Ok(unsafe { ptr::read_volatile(self.base.add(offset)) })
    }

    fn read16(&self, offset: usize) -> Result<u16> {
        self.check(offset, 2)?;
        // SAFETY: `check` keeps the access inside the `len` bytes `new` was given.
        Ok(unsafe { ptr::read_volatile(self.base.add(offset) as *const u16) })
    }

    fn read32(&self, offset: usize) -> Result<u32> {
        self.check(offset, 4)?;
        // SAFETY: `check` keeps the access inside the `len` bytes `new` was given.
        Ok(unsafe { ptr::read_volatile(self.base.add(offset) as *const u32) })
    }

    fn write8(&self, offset: usize, value: u8) -> Result<()> {
        self.check(offset, 1)?;
        // SAFETY: `check` keeps the access inside the `len` bytes `new` was given.
        unsafe { ptr::write_volatile(self.base.add(offset), value) };
        Ok(())
    }

    fn write16(&self, offset: usize, value: u16) -> Result<()> {
        self.check(offset, 2)?;
        // SAFETY: `check` keeps the access inside the `len` bytes `new` was given.
        unsafe { ptr::write_volatile(self.base.add(offset) as *mut u16, value) };
        Ok(())
    }

    fn write32(&self, offset: usize, value: u32) -> Result<()> {
        self.check(offset, 4)?;
        // SAFETY: `check` keeps the access inside the `len` bytes `new` was given.
        unsafe { ptr::write_volatile(self.base.add(offset) as *mut u32, value) };
        Ok(())
    }
}

/// Engine register accessor shared by a device and its channels
#[derive(Clone)]
pub struct Registers {
    space: Arc<dyn RegisterSpace>,
    /// Serializes read-modify-write cycles across every clone
    rmw: Arc<Mutex<()>>,
    settle_delay: Duration,
    trace: bool,
}

impl Registers {
    pub fn new(space: Arc<dyn RegisterSpace>, settle_delay: Duration, trace: bool) -> Self {
        Self {
            space,
            rmw: Arc::new(Mutex::new(())),
            settle_delay,
            trace,
        }
    }

    pub fn read8(&self, offset: usize) -> Result<u8> {
        let value = self.space.read8(offset)?;
        if self.trace {
            trace!("regs: rd8 0x{:03x} -> 0x{:02x}", offset, value);
        }
        Ok(value)
    }

    pub fn read16(&self, offset: usize) -> Result<u16> {
        let value = self.space.read16(offset)?;
        if self.trace {
            trace!("regs: rd16 0x{:03x} -> 0x{:04x}", offset, value);
        }
        Ok(value)
    }

    pub fn read32(&self, offset: usize) -> Result<u32> {
        let value = self.space.read32(offset)?;
        if self.trace {
            trace!("regs: rd32 0x{:03x} -> 0x{:08x}", offset, value);
        }
        Ok(value)
    }

    pub fn write8(&self, offset: usize, value: u8) -> Result<()> {
        if self.trace {
            trace!("regs: wr8 0x{:03x} <- 0x{:02x}", offset, value);
        }
        self.space.write8(offset, value)
    }

    pub fn write16(&self, offset: usize, value: u16) -> Result<()> {
        if self.trace {
            trace!("regs: wr16 0x{:03x} <- 0x{:04x}", offset, value);
        }
        self.space.write16(offset, value)
    }

    /// 32-bit write followed by a write barrier
    pub fn write32(&self, offset: usize, value: u32) -> Result<()> {
        if self.trace {
            trace!("regs: wr32 0x{:03x} <- 0x{:08x}", offset, value);
        }
        self.space.write32(offset, value)?;
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Reads consecutive 32-bit registers starting at `offset`
    pub fn read_block(&self, offset: usize, out: &mut [u32]) -> Result<()> {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.read32(offset + i * 4)?;
        }
        Ok(())
    }

    /// Writes consecutive 32-bit registers starting at `offset`
    pub fn write_block(&self, offset: usize, values: &[u32]) -> Result<()> {
        for (i, value) in values.iter().enumerate() {
            self.write32(offset + i * 4, *value)?;
        }
        Ok(())
    }

    /// Read-modify-write of the bits in `mask`, then the settle delay
    pub fn modify32(&self, offset: usize, mask: u32, value: u32) -> Result<()> {
        {
            let _rmw = self.rmw.lock();
            let current = self.read32(offset)?;
            self.write32(offset, (current & !mask) | (value & mask))?;
        }
        settle(self.settle_delay);
        Ok(())
    }

    /// Plain 32-bit write followed by the settle delay, for
    /// write-one-to-clear registers that must not be read back first
    pub fn write32_settled(&self, offset: usize, value: u32) -> Result<()> {
        self.write32(offset, value)?;
        settle(self.settle_delay);
        Ok(())
    }

    pub fn set_bits(&self, offset: usize, bits: u32) -> Result<()> {
        self.modify32(offset, bits, bits)
    }

    pub fn clear_bits(&self, offset: usize, bits: u32) -> Result<()> {
        self.modify32(offset, bits, 0)
    }
}

/// Sleeps for a hardware settle time; zero is a no-op
pub fn settle(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimRegisters;

    fn regs(sim: &Arc<SimRegisters>) -> Registers {
        Registers::new(sim.clone(), Duration::ZERO, true)
    }

    #[test]
    fn test_modify_only_touches_masked_bits() {
        let sim = Arc::new(SimRegisters::new());
        let regs = regs(&sim);

        sim.poke(0x008, 0xF000_00F0);
        regs.modify32(0x008, 0x0000_0011, 0x0000_0001).unwrap();
        assert_eq!(sim.peek(0x008), 0xF000_00E1);
    }

    #[test]
    fn test_block_access() {
        let sim = Arc::new(SimRegisters::new());
        let regs = regs(&sim);

        regs.write_block(0x060, &[1, 2, 3]).unwrap();
        let mut out = [0u32; 3];
        regs.read_block(0x060, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_narrow_access() {
        let sim = Arc::new(SimRegisters::new());
        let regs = regs(&sim);

        sim.poke(0x100, 0x1234_5678);
        assert_eq!(regs.read8(0x100).unwrap(), 0x78);
        assert_eq!(regs.read16(0x102).unwrap(), 0x1234);
        regs.write8(0x101, 0xAB).unwrap();
        assert_eq!(sim.peek(0x100), 0x1234_AB78);
        regs.write16(0x102, 0xBEEF).unwrap();
        assert_eq!(sim.peek(0x100), 0xBEEF_AB78);
    }

    #[test]
    fn test_settled_write_waits_and_clears_only_written_bits() {
        let sim = Arc::new(SimRegisters::new());
        let regs = Registers::new(sim.clone(), Duration::from_millis(5), false);
        let src = layout::irq_source(crate::Direction::CardToHost);

        sim.poke(src, 0b0111);
        let started = std::time::Instant::now();
        regs.write32_settled(src, 0b0001).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(5));
        assert_eq!(sim.peek(src), 0b0110);
    }

    #[test]
    fn test_concurrent_modify_keeps_every_bit() {
        let sim = Arc::new(SimRegisters::new());
        let regs = regs(&sim);

        let workers: Vec<_> = (0..8)
            .map(|bit| {
                let regs = regs.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        regs.set_bits(0x040, 1 << bit).unwrap();
                        regs.clear_bits(0x040, 1 << bit).unwrap();
                    }
                    regs.set_bits(0x040, 1 << bit).unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(sim.peek(0x040), 0xFF);
    }

    #[test]
    fn test_mmio_space_bounds() {
        let mut backing = vec![0u32; 4];
        let space = unsafe { MmioSpace::new(backing.as_mut_ptr() as *mut u8, 16) };
        space.write32(12, 0xCAFE_F00D).unwrap();
        assert_eq!(space.read32(12).unwrap(), 0xCAFE_F00D);
        assert_eq!(space.read16(12).unwrap(), 0xF00D);
        assert!(space.read32(16).is_err());
        assert!(space.write32(2, 0).is_err());
        drop(space);
        assert_eq!(backing[3], 0xCAFE_F00D);
    }
}
