//! Engine register map
//!
//! Offsets are relative to the SG-DMA register window. Per-channel blocks
//! repeat every `CHANNEL_STRIDE` bytes.

use bitflags::bitflags;

use crate::Direction;

pub const VERSION: usize = 0x000;
pub const CAPABILITY: usize = 0x004;
pub const MSI_VECTOR: usize = 0x028;

const C2H_CR: usize = 0x008;
const C2H_SR: usize = 0x00C;
const C2H_IRQ_MASK: usize = 0x018;
const C2H_IRQ_SRC: usize = 0x01C;
const C2H_DMA_CH_CR: usize = 0x02C;

const H2C_CR: usize = 0x030;
const H2C_SR: usize = 0x034;
const H2C_IRQ_MASK: usize = 0x040;
const H2C_IRQ_SRC: usize = 0x044;
const H2C_DMA_CH_CR: usize = 0x050;

const CHANNEL_STRIDE: usize = 0x400;

const C2H_BUF_LOCK: usize = 0x010;
const C2H_IRQ_CNT: usize = 0x014;
const C2H_FRAME_SIZE: usize = 0x020;
const C2H_SGB_BASE: usize = 0x060;
const C2H_NONINT_ADDR: usize = 0x260;

const H2C_BUF_LOCK: usize = 0x038;
const H2C_IRQ_CNT: usize = 0x03C;
const H2C_FRAME_SIZE: usize = 0x048;
const H2C_SGB_BASE: usize = 0x120;
const H2C_NONINT_ADDR: usize = 0x270;

/// Bytes between consecutive SGB (hi, lo, len) register triples
const SGB_STRIDE: usize = 12;

/// Bit position of channel 0's 5-bit completed index in the status register
pub const STATUS_INDEX_SHIFT: u32 = 12;
pub const STATUS_INDEX_BITS: u32 = 5;
pub const STATUS_INDEX_MASK: u32 = 0x1F;

/// Bound buffer count field of the control register
pub const CR_BUF_COUNT_SHIFT: u32 = 27;
pub const CR_BUF_COUNT_MASK: u32 = 0xF800_0000;

pub const VERSION_MAJOR_SHIFT: u32 = 28;
pub const VERSION_MINOR_SHIFT: u32 = 20;
pub const VERSION_UPDATE_SHIFT: u32 = 16;

/// Frames-per-interrupt field of the IRQ count register
pub const IRQ_CNT_FRAMES_MASK: u32 = 0x0000_000F;

/// Arbitration field of the DMA channel control register
pub const DMA_CH_ARB_MASK: u32 = 0x0000_0003;

bitflags! {
    /// Direction control register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Control: u32 {
        const DMA_EN        = 1 << 0;
        const SG_STORE_MODE1 = 1 << 1;
        const GLOBAL_RST    = 1 << 3;
        const CH0_RUN       = 1 << 4;
        const CH1_RUN       = 1 << 5;
        const CH2_RUN       = 1 << 6;
        const CH3_RUN       = 1 << 7;
        const CH0_BUF_LOCK  = 1 << 12;
        const CH1_BUF_LOCK  = 1 << 13;
        const CH2_BUF_LOCK  = 1 << 14;
        const CH3_BUF_LOCK  = 1 << 15;
        const HW_FRAME_DROP = 1 << 16;
        const INT_METHOD_POLL = 1 << 17;
    }
}

impl Control {
    pub const ALL_BUF_LOCK: Control = Control::CH0_BUF_LOCK
        .union(Control::CH1_BUF_LOCK)
        .union(Control::CH2_BUF_LOCK)
        .union(Control::CH3_BUF_LOCK);

    /// Per-channel run bit
    pub fn run_bit(channel: usize) -> Control {
        Control::from_bits_truncate(Control::CH0_RUN.bits() << channel)
    }
}

bitflags! {
    /// Direction status register, low half
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        const CH0_HALTED  = 1 << 0;
        const CH1_HALTED  = 1 << 1;
        const CH2_HALTED  = 1 << 2;
        const CH3_HALTED  = 1 << 3;
        const CH0_SGB_RDY = 1 << 4;
        const CH1_SGB_RDY = 1 << 5;
        const CH2_SGB_RDY = 1 << 6;
        const CH3_SGB_RDY = 1 << 7;
    }
}

impl Status {
    pub fn sgb_ready(channel: usize) -> Status {
        Status::from_bits_truncate(Status::CH0_SGB_RDY.bits() << channel)
    }
}

/// Extracts channel `channel`'s completed buffer index from a status value
pub fn status_index(status: u32, channel: usize) -> u8 {
    let shift = STATUS_INDEX_SHIFT + STATUS_INDEX_BITS * channel as u32;
    ((status >> shift) & STATUS_INDEX_MASK) as u8
}

bitflags! {
    /// Interrupt mask and source bits. A set mask bit disables the source;
    /// writing a set bit to the source register acknowledges it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqBits: u32 {
        const FRAME_DONE        = 1 << 0;
        const FRAME_DATA_LOSS   = 1 << 1;
        const VIDEO_IN_HALTED   = 1 << 2;
        const SGB_ADDR_LEN_ERR  = 1 << 3;
        const DESC_TERM         = 1 << 4;
        const FRAME_BROKEN      = 1 << 10;
    }
}

impl IrqBits {
    /// Sources enabled when a direction is armed in interrupt mode
    pub fn completion_sources(dir: Direction) -> IrqBits {
        match dir {
            Direction::CardToHost => {
                IrqBits::FRAME_DONE | IrqBits::FRAME_DATA_LOSS | IrqBits::VIDEO_IN_HALTED
            }
            Direction::HostToCard => IrqBits::FRAME_DONE | IrqBits::DESC_TERM,
        }
    }

    /// Fault sources that are logged and acknowledged, never fatal
    pub fn faults() -> IrqBits {
        IrqBits::FRAME_DATA_LOSS
            | IrqBits::VIDEO_IN_HALTED
            | IrqBits::SGB_ADDR_LEN_ERR
            | IrqBits::DESC_TERM
    }
}

bitflags! {
    /// Shared MSI vector status register; bit `i` corresponds to vector slot `i`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsiVector: u32 {
        const C2H_FRAME_DONE = 0x0000_000F;
        const H2C_FRAME_DONE = 0x0000_00F0;
        const C2H_DESC_TERM  = 0x0000_0F00;
        const H2C_DESC_TERM  = 0x0000_F000;
        const C2H_DATA_LOSS  = 0x000F_0000;
        const C2H_VIDEO_HALT = 0x00F0_0000;
        const USER_DEFINED   = 0x1F00_0000;
        const IP_ERROR       = 1 << 30;
        const PCIE_ERROR     = 1 << 31;
    }
}

/// Direction-scoped register offsets
pub fn control(dir: Direction) -> usize {
    match dir {
        Direction::CardToHost => C2H_CR,
        Direction::HostToCard => H2C_CR,
    }
}

pub fn status(dir: Direction) -> usize {
    match dir {
        Direction::CardToHost => C2H_SR,
        Direction::HostToCard => H2C_SR,
    }
}

pub fn irq_mask(dir: Direction) -> usize {
    match dir {
        Direction::CardToHost => C2H_IRQ_MASK,
        Direction::HostToCard => H2C_IRQ_MASK,
    }
}

pub fn irq_source(dir: Direction) -> usize {
    match dir {
        Direction::CardToHost => C2H_IRQ_SRC,
        Direction::HostToCard => H2C_IRQ_SRC,
    }
}

pub fn dma_channel_control(dir: Direction) -> usize {
    match dir {
        Direction::CardToHost => C2H_DMA_CH_CR,
        Direction::HostToCard => H2C_DMA_CH_CR,
    }
}

fn per_channel(dir: Direction, channel: usize, c2h: usize, h2c: usize) -> usize {
    let base = match dir {
        Direction::CardToHost => c2h,
        Direction::HostToCard => h2c,
    };
    base + channel * CHANNEL_STRIDE
}

pub fn buffer_lock(dir: Direction, channel: usize) -> usize {
    per_channel(dir, channel, C2H_BUF_LOCK, H2C_BUF_LOCK)
}

pub fn irq_count(dir: Direction, channel: usize) -> usize {
    per_channel(dir, channel, C2H_IRQ_CNT, H2C_IRQ_CNT)
}

pub fn frame_size(dir: Direction, channel: usize) -> usize {
    per_channel(dir, channel, C2H_FRAME_SIZE, H2C_FRAME_SIZE)
}

/// SGB base-high, base-low and list-length registers of one buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgbRegs {
    pub addr_hi: usize,
    pub addr_lo: usize,
    pub list_len: usize,
}

pub fn sgb(dir: Direction, channel: usize, slot: usize) -> SgbRegs {
    let addr_hi = per_channel(dir, channel, C2H_SGB_BASE, H2C_SGB_BASE) + slot * SGB_STRIDE;
    SgbRegs {
        addr_hi,
        addr_lo: addr_hi + 4,
        list_len: addr_hi + 8,
    }
}

/// Non-interrupt status word address registers (hi, lo)
pub fn nonint_addr(dir: Direction, channel: usize) -> (usize, usize) {
    let hi = per_channel(dir, channel, C2H_NONINT_ADDR, H2C_NONINT_ADDR);
    (hi, hi + 4)
}
