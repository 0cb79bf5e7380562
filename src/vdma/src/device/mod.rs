//! VDMA Device
//!
//! One [`VdmaDevice`] per board. It is responsible for:
//! - Probing the engine version and capabilities
//! - Bringing the engine to a known state (reset, lock, drop, arbitration)
//! - Handing out at most one [`ChannelHandle`] per channel
//! - Routing interrupt vectors to the completion path
//! - Resetting a direction once its last channel is closed

use core::time::Duration;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};

use crate::channel::{ChannelCore, ChannelHandle};
use crate::completion::irq::InterruptPath;
use crate::completion::poll::PollWorker;
use crate::config::{EngineConfig, SgStoreMode};
use crate::error::{Result, VdmaError};
use crate::hal::DmaPlatform;
use crate::regs::layout::{self, Control};
use crate::regs::{settle, RegisterSpace, Registers};
use crate::resources::PciResources;
use crate::{Direction, MAX_CHANNELS};

/// Engine IP major revision this driver speaks
pub const SUPPORTED_MAJOR: u8 = 1;
/// Minor revision the driver was validated against
pub const VALIDATED_MINOR: u8 = 6;

/// Engine IP revision from the version register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineVersion {
    pub major: u8,
    pub minor: u8,
    pub update: u8,
}

impl EngineVersion {
    pub fn from_register(value: u32) -> Self {
        Self {
            major: (value >> layout::VERSION_MAJOR_SHIFT) as u8 & 0xF,
            minor: (value >> layout::VERSION_MINOR_SHIFT) as u8,
            update: (value >> layout::VERSION_UPDATE_SHIFT) as u8 & 0xF,
        }
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}.{}", self.major, self.minor, self.update)
    }
}

/// Directions the engine IP was built with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionSupport {
    CardToHostOnly,
    HostToCardOnly,
    Both,
}

/// Decoded capability register plus the platform's address width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// PCIe generation, 1-based
    pub pcie_gen: u8,
    /// Link width in lanes
    pub link_width: u8,
    pub directions: DirectionSupport,
    pub c2h_channels: usize,
    pub h2c_channels: usize,
    /// Descriptors carry 64-bit bus addresses
    pub addr64: bool,
}

impl Capabilities {
    pub fn from_register(value: u32, addr64: bool) -> Self {
        let link_width = match (value >> 2) & 0x3 {
            0 => 1,
            1 => 2,
            2 => 4,
            _ => 8,
        };
        let directions = match (value >> 4) & 0x3 {
            0 => DirectionSupport::CardToHostOnly,
            1 => DirectionSupport::HostToCardOnly,
            _ => DirectionSupport::Both,
        };
        Self {
            pcie_gen: (value & 0x3) as u8 + 1,
            link_width,
            directions,
            c2h_channels: (((value >> 20) & 0xF) as usize + 1).min(MAX_CHANNELS),
            h2c_channels: (((value >> 24) & 0xF) as usize + 1).min(MAX_CHANNELS),
            addr64,
        }
    }

    pub fn supports(&self, dir: Direction) -> bool {
        matches!(
            (self.directions, dir),
            (DirectionSupport::Both, _)
                | (DirectionSupport::CardToHostOnly, Direction::CardToHost)
                | (DirectionSupport::HostToCardOnly, Direction::HostToCard)
        )
    }

    /// Channels the IP implements for `dir`
    pub fn channels(&self, dir: Direction) -> usize {
        if !self.supports(dir) {
            return 0;
        }
        match dir {
            Direction::CardToHost => self.c2h_channels,
            Direction::HostToCard => self.h2c_channels,
        }
    }
}

/// Per-direction channel counters, guarded by the direction lock
#[derive(Debug, Default)]
pub struct DirectionState {
    /// Channels of this direction currently running
    pub running: usize,
    /// Handles of this direction currently open
    pub opened: usize,
}

/// Device state shared with every channel handle
pub struct DeviceShared {
    pub board: usize,
    pub regs: Registers,
    pub platform: Arc<dyn DmaPlatform>,
    pub config: EngineConfig,
    pub caps: Capabilities,
    pub version: EngineVersion,
    cores: [Vec<Arc<ChannelCore>>; 2],
    dirs: [Mutex<DirectionState>; 2],
}

impl DeviceShared {
    /// Locks the counters of `dir`
    pub fn dir_state(&self, dir: Direction) -> MutexGuard<'_, DirectionState> {
        self.dirs[dir.index()]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn core(&self, dir: Direction, id: usize) -> Option<&Arc<ChannelCore>> {
        self.cores[dir.index()].get(id)
    }

    /// Usable channels of `dir` under the current configuration
    pub fn channel_count(&self, dir: Direction) -> usize {
        self.caps.channels(dir).min(self.config.max_channels)
    }

    /// Pulses the direction's global reset
    pub fn reset_direction(&self, dir: Direction, hold: Duration) -> Result<()> {
        let cr = layout::control(dir);
        let rst = Control::GLOBAL_RST.bits();
        self.regs.set_bits(cr, rst)?;
        settle(hold);
        self.regs.clear_bits(cr, rst)?;
        info!("vdma: board {} {} reset", self.board, dir);
        Ok(())
    }

    /// Bookkeeping for a closing handle; resets the direction when it goes idle
    pub(crate) fn channel_closed(&self, dir: Direction) {
        let mut state = self.dir_state(dir);
        state.opened = state.opened.saturating_sub(1);
        if state.running == 0 && state.opened == 0 {
            if let Err(e) = self.reset_direction(dir, self.config.reset_hold) {
                warn!("vdma: board {} {} reset on close failed: {}", self.board, dir, e);
            }
        }
    }

    fn init_engine(&self) -> Result<()> {
        let cfg = &self.config;
        for dir in [Direction::CardToHost, Direction::HostToCard] {
            self.reset_direction(dir, Duration::from_millis(1).min(cfg.reset_hold))?;
        }

        for dir in [Direction::CardToHost, Direction::HostToCard] {
            let cr = layout::control(dir);
            let lock = if cfg.buffer_lock { Control::ALL_BUF_LOCK } else { Control::empty() };
            self.regs.modify32(cr, Control::ALL_BUF_LOCK.bits(), lock.bits())?;
            self.regs.modify32(
                layout::dma_channel_control(dir),
                layout::DMA_CH_ARB_MASK,
                cfg.arbitration.field(),
            )?;
            if cfg.sg_store_mode == SgStoreMode::Mode1 {
                self.regs.set_bits(cr, Control::SG_STORE_MODE1.bits())?;
            }
            if cfg.is_polling() {
                self.regs.set_bits(cr, Control::INT_METHOD_POLL.bits())?;
            }
        }

        let drop = if cfg.hw_frame_drop { Control::HW_FRAME_DROP } else { Control::empty() };
        self.regs.modify32(
            layout::control(Direction::CardToHost),
            Control::HW_FRAME_DROP.bits(),
            drop.bits(),
        )?;
        Ok(())
    }
}

/// One probed board
pub struct VdmaDevice {
    shared: Arc<DeviceShared>,
    resources: PciResources,
    irq: Option<InterruptPath>,
}

impl VdmaDevice {
    /// Brings up the engine behind `space`.
    ///
    /// Reads and checks the IP version, decodes the capabilities, resets
    /// and configures both directions and, in interrupt mode, starts the
    /// deferred workers.
    pub fn probe(
        board: usize,
        space: Arc<dyn RegisterSpace>,
        platform: Arc<dyn DmaPlatform>,
        resources: PciResources,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let regs = Registers::new(space, config.settle_delay, config.debug_registers);

        let version = EngineVersion::from_register(regs.read32(layout::VERSION)?);
        if version.major != SUPPORTED_MAJOR {
            return Err(VdmaError::UnsupportedVersion {
                major: version.major,
                minor: version.minor,
            });
        }
        if version.minor != VALIDATED_MINOR {
            warn!(
                "vdma: board {} engine {} not validated, expected {}.{:02}",
                board, version, SUPPORTED_MAJOR, VALIDATED_MINOR
            );
        }

        let addr64 = platform.supports_64bit_dma();
        if !addr64 {
            info!("vdma: board {} falls back to 32-bit DMA", board);
        }
        let caps = Capabilities::from_register(regs.read32(layout::CAPABILITY)?, addr64);
        info!(
            "vdma: board {} engine {} Gen{} x{}, {} c2h / {} h2c channels",
            board,
            version,
            caps.pcie_gen,
            caps.link_width,
            caps.channels(Direction::CardToHost),
            caps.channels(Direction::HostToCard)
        );

        let cores = [Direction::CardToHost, Direction::HostToCard].map(|dir| {
            (0..caps.channels(dir).min(config.max_channels))
                .map(|id| Arc::new(ChannelCore::new(dir, id)))
                .collect::<Vec<_>>()
        });

        let shared = Arc::new(DeviceShared {
            board,
            regs,
            platform,
            config,
            caps,
            version,
            cores,
            dirs: [Mutex::new(DirectionState::default()), Mutex::new(DirectionState::default())],
        });
        shared.init_engine()?;

        let irq = if shared.config.is_polling() {
            None
        } else {
            Some(InterruptPath::new(
                board,
                shared.regs.clone(),
                &resources.irq_vectors,
                shared.cores[Direction::CardToHost.index()].clone(),
                shared.cores[Direction::HostToCard.index()].clone(),
            )?)
        };

        Ok(Self {
            shared,
            resources,
            irq,
        })
    }

    pub fn board(&self) -> usize {
        self.shared.board
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.shared.caps
    }

    pub fn version(&self) -> EngineVersion {
        self.shared.version
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// BARs and vector table captured at probe
    pub fn resources(&self) -> &PciResources {
        &self.resources
    }

    pub fn channel_count(&self, dir: Direction) -> usize {
        self.shared.channel_count(dir)
    }

    /// Claims channel `id` of `dir` for a single user
    pub fn open(&self, dir: Direction, id: usize) -> Result<ChannelHandle> {
        let core = self.shared.core(dir, id).ok_or(VdmaError::InvalidChannel)?.clone();
        if !core.try_open() {
            warn!("vdma: {}{} already open", dir, id);
            return Err(VdmaError::Busy);
        }
        core.stats.reset();

        let worker = if self.shared.config.is_polling() {
            match PollWorker::spawn(self.shared.board, core.clone(), self.shared.config.poll_interval) {
                Ok(worker) => Some(worker),
                Err(e) => {
                    core.release();
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.shared.dir_state(dir).opened += 1;
        info!("vdma: board {} {}{} opened", self.shared.board, dir, id);
        Ok(ChannelHandle::new(self.shared.clone(), core, worker))
    }

    /// Interrupt entry point; returns whether the vector belongs to this board
    pub fn handle_irq(&self, irq: u32) -> bool {
        match &self.irq {
            Some(path) => path.handle(irq),
            None => false,
        }
    }

    /// Pulses the global reset of an idle direction
    pub fn reset(&self, dir: Direction) -> Result<()> {
        let state = self.shared.dir_state(dir);
        if state.running != 0 {
            return Err(VdmaError::Busy);
        }
        self.shared.reset_direction(dir, self.shared.config.reset_hold)
    }

    pub(crate) fn interrupt_path(&self) -> Option<&InterruptPath> {
        self.irq.as_ref()
    }
}

impl Drop for VdmaDevice {
    fn drop(&mut self) {
        info!("vdma: board {} removed", self.shared.board);
    }
}

#[cfg(test)]
#[path = "tests/test_device.rs"]
mod tests;
