//! Engine configuration
//!
//! Settings that the board driver fixes once when the engine is
//! initialized. Changing the completion mode requires a new device.

use core::time::Duration;

use crate::error::{Result, VdmaError};

/// How frame completions reach the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// MSI/INTx interrupts feed a deferred worker
    Interrupt,
    /// Per-channel worker polls a coherent status word
    Poll,
}

/// DMA channel arbitration on the shared engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitration {
    FixedPriority,
    RoundRobin,
    WeightedRoundRobin,
}

impl Arbitration {
    /// Value of the arbitration field in the DMA channel control register
    pub fn field(self) -> u32 {
        match self {
            Arbitration::FixedPriority => 0,
            Arbitration::RoundRobin => 1,
            Arbitration::WeightedRoundRobin => 2,
        }
    }
}

/// Where the engine keeps the scatter-gather lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgStoreMode {
    /// Engine fetches descriptors from host memory
    Mode0,
    /// Descriptors are preloaded; start checks the SG-buffer-ready bit
    Mode1,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub completion: CompletionMode,
    /// Poll worker wake-up period
    pub poll_interval: Duration,
    /// Delay after each read-modify-write of a control register
    pub settle_delay: Duration,
    /// Delay after each descriptor ring register write
    pub ring_settle_delay: Duration,
    /// Global reset assert time
    pub reset_hold: Duration,
    pub buffer_lock: bool,
    pub hw_frame_drop: bool,
    pub arbitration: Arbitration,
    pub sg_store_mode: SgStoreMode,
    pub max_channels: usize,
    /// Trace every register access
    pub debug_registers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            completion: CompletionMode::Interrupt,
            poll_interval: Duration::from_millis(5),
            settle_delay: Duration::from_millis(5),
            ring_settle_delay: Duration::from_millis(10),
            reset_hold: Duration::from_millis(50),
            buffer_lock: false,
            hw_frame_drop: true,
            arbitration: Arbitration::RoundRobin,
            sg_store_mode: SgStoreMode::Mode0,
            max_channels: crate::MAX_CHANNELS,
            debug_registers: false,
        }
    }
}

impl EngineConfig {
    /// Configuration with every hardware delay removed, for simulated boards
    pub fn for_simulation() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            settle_delay: Duration::ZERO,
            ring_settle_delay: Duration::ZERO,
            reset_hold: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_completion(mut self, mode: CompletionMode) -> Self {
        self.completion = mode;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_buffer_lock(mut self, enabled: bool) -> Self {
        self.buffer_lock = enabled;
        self
    }

    pub fn with_hw_frame_drop(mut self, enabled: bool) -> Self {
        self.hw_frame_drop = enabled;
        self
    }

    pub fn with_arbitration(mut self, arbitration: Arbitration) -> Self {
        self.arbitration = arbitration;
        self
    }

    pub fn with_sg_store_mode(mut self, mode: SgStoreMode) -> Self {
        self.sg_store_mode = mode;
        self
    }

    pub fn with_max_channels(mut self, channels: usize) -> Self {
        self.max_channels = channels;
        self
    }

    pub fn with_debug_registers(mut self, enabled: bool) -> Self {
        self.debug_registers = enabled;
        self
    }

    pub fn is_polling(&self) -> bool {
        self.completion == CompletionMode::Poll
    }

    /// Checks the configuration before a device is brought up
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(VdmaError::InvalidArgument("poll interval must be non-zero"));
        }
        if self.max_channels == 0 || self.max_channels > crate::MAX_CHANNELS {
            return Err(VdmaError::InvalidArgument("max_channels must be 1..=4"));
        }
        Ok(())
    }
}
