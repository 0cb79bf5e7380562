//! HNX video DMA engine
//!
//! Host-side driver core for the scatter-gather DMA engine of a PCIe video
//! capture board: user buffer binding, descriptor rings, channel control,
//! interrupt and poll completion paths, and consumer frame pacing.
//!
//! The bus glue supplies a [`regs::RegisterSpace`], a [`hal::DmaPlatform`]
//! and the board's [`resources::PciResources`]; everything else lives here.

use core::fmt;

pub mod binder;
pub mod channel;
pub mod completion;
pub mod config;
pub mod device;
pub mod error;
pub mod hal;
pub mod pacer;
pub mod registry;
pub mod regs;
pub mod resources;
pub mod ring;
pub mod sync;
pub mod testing;

pub use channel::{ChannelHandle, ChannelState, FrameWaiter};
pub use config::{CompletionMode, EngineConfig};
pub use device::VdmaDevice;
pub use error::{Result, VdmaError};
pub use pacer::{pace, FramePacer, PaceOutcome};
pub use registry::DeviceRegistry;

/// Buffer slots per channel
pub const MAX_BUFFERS: usize = 16;
/// Channels per direction
pub const MAX_CHANNELS: usize = 4;
/// Hardware ring length seen by the consumer
pub const RING_SIZE: usize = 16;
/// Index value no hardware revision reports
pub const INVALID_INDEX: u8 = 0x3C;
/// Boards one registry tracks
pub const MAX_BOARDS: usize = 4;
/// MSI vectors per board
pub const MAX_IRQ_VECTORS: usize = 32;

/// Transfer direction of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// Capture: the card writes into host memory
    CardToHost,
    /// Playback: the card reads host memory
    HostToCard,
}

impl Direction {
    /// Whether the engine writes the host buffers
    pub fn device_writes(self) -> bool {
        self == Direction::CardToHost
    }

    pub fn index(self) -> usize {
        match self {
            Direction::CardToHost => 0,
            Direction::HostToCard => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::CardToHost => write!(f, "c2h"),
            Direction::HostToCard => write!(f, "h2c"),
        }
    }
}
