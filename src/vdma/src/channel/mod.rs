//! DMA channel control
//!
//! A [`ChannelHandle`] is the single opener's view of one channel. It
//! walks the channel through `Idle -> Bound -> Armed -> Running` and back
//! to `Idle` on stop. The engine-facing state that the completion path
//! also touches lives in [`ChannelCore`].

mod shared;

pub use self::shared::{Backend, ChannelCore, ChannelStats, Fault, StatsSnapshot};

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::binder::{self, BoundBuffers};
use crate::config::SgStoreMode;
use crate::completion::poll::PollWorker;
use crate::device::DeviceShared;
use crate::error::{Result, VdmaError};
use crate::regs::layout::{self, Control, IrqBits, Status};
use crate::ring::{self, DescriptorSet, RingTarget};
use crate::{Direction, MAX_BUFFERS};

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    /// Buffers pinned and mapped
    Bound,
    /// Descriptor rings programmed
    Armed,
    Running,
}

/// Configured frame dimensions of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u16,
    pub height: u16,
}

impl FrameGeometry {
    pub fn size(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Waits for completions on one channel from any thread
#[derive(Clone)]
pub struct FrameWaiter {
    core: Arc<ChannelCore>,
    backend: Backend,
}

impl FrameWaiter {
    /// Blocks until a new buffer index is published or `timeout` elapses.
    ///
    /// A stop or close while waiting ends the wait with `Timeout`.
    pub fn wait(&self, timeout: Duration) -> Result<u8> {
        let cell = self.core.cell(self.backend);
        let session = self.core.session();
        if self.backend == Backend::Poll {
            self.core.schedule.signal();
        }
        let ready = self
            .core
            .waitq
            .wait_until(timeout, || cell.is_updated() || self.core.session() != session);
        if ready {
            if let Some(index) = cell.take() {
                return Ok(index);
            }
        }
        Err(VdmaError::Timeout)
    }
}

/// Exclusive handle to an open channel; closing is dropping
pub struct ChannelHandle {
    dev: Arc<DeviceShared>,
    core: Arc<ChannelCore>,
    state: ChannelState,
    bound: Option<BoundBuffers>,
    rings: Option<DescriptorSet>,
    poll_worker: Option<PollWorker>,
}

impl ChannelHandle {
    pub(crate) fn new(dev: Arc<DeviceShared>, core: Arc<ChannelCore>, poll_worker: Option<PollWorker>) -> Self {
        Self {
            dev,
            core,
            state: ChannelState::Idle,
            bound: None,
            rings: None,
            poll_worker,
        }
    }

    pub fn direction(&self) -> Direction {
        self.core.dir
    }

    pub fn id(&self) -> usize {
        self.core.id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Bound buffer count, 0 when unbound
    pub fn ubuf_count(&self) -> usize {
        self.bound.as_ref().map_or(0, BoundBuffers::count)
    }

    /// Per-buffer mapped segment counts
    pub fn segment_counts(&self) -> heapless::Vec<usize, MAX_BUFFERS> {
        self.bound
            .as_ref()
            .map(BoundBuffers::segment_counts)
            .unwrap_or_default()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    fn backend(&self) -> Backend {
        if self.dev.config.is_polling() {
            Backend::Poll
        } else {
            Backend::Interrupt
        }
    }

    /// Pins and maps `count` user buffers of `length` bytes
    pub fn bind(&mut self, addrs: &[usize], count: usize, length: usize) -> Result<()> {
        if self.state != ChannelState::Idle {
            return Err(VdmaError::AlreadyBound);
        }
        let bound = binder::bind(&self.dev.platform, addrs, count, length, self.core.dir)?;
        self.bound = Some(bound);
        self.state = ChannelState::Bound;
        Ok(())
    }

    /// Releases the bound buffers; a running channel is stopped first
    pub fn unbind(&mut self) {
        if self.state == ChannelState::Idle {
            return;
        }
        self.stop();
    }

    /// Builds and programs the descriptor rings
    pub fn build(&mut self) -> Result<()> {
        match self.state {
            ChannelState::Idle => return Err(VdmaError::NotBound),
            ChannelState::Bound => {}
            ChannelState::Armed | ChannelState::Running => return Ok(()),
        }
        let Some(bound) = self.bound.as_ref() else {
            return Err(VdmaError::NotBound);
        };
        let target = RingTarget {
            regs: &self.dev.regs,
            platform: &self.dev.platform,
            dir: self.core.dir,
            channel: self.core.id,
            addr64: self.dev.caps.addr64,
            ring_settle: self.dev.config.ring_settle_delay,
            polling: self.dev.config.is_polling(),
        };
        let set = ring::build(&target, bound)?;
        *self.core.poll_word.lock() = set.word.clone();
        self.rings = Some(set);
        self.state = ChannelState::Armed;
        Ok(())
    }

    fn arm_engine(&self) -> Result<()> {
        let dir = self.core.dir;
        let regs = &self.dev.regs;
        let cr = layout::control(dir);

        if self.dev.config.sg_store_mode == SgStoreMode::Mode1 {
            let status = Status::from_bits_truncate(regs.read32(layout::status(dir))?);
            if !status.contains(Status::sgb_ready(self.core.id)) {
                warn!("{}{}: scatter-gather buffers not ready", dir, self.core.id);
                return Err(VdmaError::NotReady);
            }
        }

        self.core.reset_indices();

        let mut state = self.dev.dir_state(dir);
        if state.running == 0 {
            let method = if self.dev.config.is_polling() {
                Control::INT_METHOD_POLL
            } else {
                Control::empty()
            };
            regs.modify32(
                cr,
                (Control::DMA_EN | Control::INT_METHOD_POLL).bits(),
                (Control::DMA_EN | method).bits(),
            )?;
        }
        state.running += 1;
        Ok(())
    }

    /// Arms the engine for this channel; a `Bound` channel is built first.
    ///
    /// A register failure leaves the channel `Bound`.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            ChannelState::Idle => return Err(VdmaError::NotBound),
            ChannelState::Running => return Err(VdmaError::Busy),
            ChannelState::Bound => self.build()?,
            ChannelState::Armed => {}
        }

        if let Err(e) = self.arm_engine() {
            error!("{}{}: start failed: {}", self.core.dir, self.core.id, e);
            self.mask_if_direction_idle();
            *self.core.poll_word.lock() = None;
            self.rings = None;
            self.state = ChannelState::Bound;
            return Err(e);
        }

        self.core.set_running(true);
        if self.dev.config.is_polling() {
            self.core.set_poll_active(true);
        }
        self.state = ChannelState::Running;
        info!(
            "{}{}: started with {} buffers",
            self.core.dir,
            self.core.id,
            self.ubuf_count()
        );
        Ok(())
    }

    /// Binds and starts in one step; a failed start unbinds again
    pub fn bind_and_start(&mut self, addrs: &[usize], count: usize, length: usize) -> Result<()> {
        self.bind(addrs, count, length)?;
        if let Err(e) = self.start() {
            self.unbind();
            return Err(e);
        }
        Ok(())
    }

    /// Masks the completion sources `build` unmasked, unless another
    /// channel of the direction still runs
    fn mask_if_direction_idle(&self) {
        if self.dev.config.is_polling() {
            return;
        }
        let dir = self.core.dir;
        let state = self.dev.dir_state(dir);
        if state.running != 0 {
            return;
        }
        if let Err(e) = self
            .dev
            .regs
            .set_bits(layout::irq_mask(dir), IrqBits::completion_sources(dir).bits())
        {
            warn!("{}{}: completion mask failed: {}", dir, self.core.id, e);
        }
    }

    fn halt_engine(&self) {
        let dir = self.core.dir;
        let id = self.core.id;
        let regs = &self.dev.regs;
        let cr = layout::control(dir);

        {
            let mut state = self.dev.dir_state(dir);
            state.running = state.running.saturating_sub(1);
            if let Err(e) = regs.clear_bits(cr, Control::run_bit(id).bits()) {
                warn!("{}{}: stop write failed: {}", dir, id, e);
            }
            if state.running == 0 {
                let r = regs
                    .set_bits(layout::irq_mask(dir), IrqBits::FRAME_DONE.bits())
                    .and_then(|_| regs.clear_bits(cr, Control::DMA_EN.bits()));
                if let Err(e) = r {
                    warn!("{}: engine disable failed: {}", dir, e);
                }
            }
        }

        if let Err(e) = regs.write32_settled(layout::irq_source(dir), IrqBits::FRAME_DONE.bits()) {
            warn!("{}{}: frame-done ack failed: {}", dir, id, e);
        }

        let lock = layout::buffer_lock(dir, id);
        match regs.read32(lock) {
            Ok(0) => {}
            Ok(held) => {
                debug!("{}{}: force-unlocking buffers 0x{:04x}", dir, id, held);
                if let Err(e) = regs.write32(lock, held) {
                    warn!("{}{}: buffer unlock failed: {}", dir, id, e);
                }
            }
            Err(e) => warn!("{}{}: buffer lock read failed: {}", dir, id, e),
        }
    }

    /// Stops the channel and releases its rings and buffers.
    ///
    /// Stopping an idle channel does nothing. Register failures are logged;
    /// the channel always ends `Idle`.
    pub fn stop(&mut self) {
        match self.state {
            ChannelState::Idle => return,
            ChannelState::Running => {
                self.core.set_poll_active(false);
                self.core.set_running(false);
                self.halt_engine();
            }
            ChannelState::Armed => self.mask_if_direction_idle(),
            ChannelState::Bound => {}
        }

        *self.core.poll_word.lock() = None;
        self.rings = None;
        self.bound = None;
        self.state = ChannelState::Idle;
        self.core.end_session();
        info!("{}{}: stopped", self.core.dir, self.core.id);
    }

    /// A waiter usable from another thread
    pub fn waiter(&self) -> FrameWaiter {
        FrameWaiter {
            core: self.core.clone(),
            backend: self.backend(),
        }
    }

    /// Blocks until the engine reports a completed buffer
    pub fn wait_for_index(&self, timeout: Duration) -> Result<u8> {
        if self.bound.is_none() {
            return Err(VdmaError::NotBound);
        }
        let result = self.waiter().wait(timeout);
        if result == Err(VdmaError::Timeout) {
            self.log_timeout();
        }
        result
    }

    fn log_timeout(&self) {
        let dir = self.core.dir;
        let regs = &self.dev.regs;
        let read = |off| regs.read32(off).unwrap_or(0);
        warn!(
            "{}{}: frame timeout, cr 0x{:08x} sr 0x{:08x} irq_src 0x{:08x}",
            dir,
            self.core.id,
            read(layout::control(dir)),
            read(layout::status(dir)),
            read(layout::irq_source(dir))
        );
    }

    fn lock_bit(index: usize) -> Result<u32> {
        if index >= MAX_BUFFERS {
            return Err(VdmaError::InvalidArgument("buffer index out of range"));
        }
        Ok(1 << index)
    }

    /// Whether the hardware holds buffer `index`; a held buffer is released
    pub fn check_and_clear_lock(&self, index: usize) -> Result<bool> {
        let bit = Self::lock_bit(index)?;
        let lock = layout::buffer_lock(self.core.dir, self.core.id);
        if self.dev.regs.read32(lock)? & bit == 0 {
            return Ok(false);
        }
        self.dev.regs.write32(lock, bit)?;
        Ok(true)
    }

    /// Hands buffer `index` back to the hardware
    pub fn unlock(&self, index: usize) -> Result<()> {
        let bit = Self::lock_bit(index)?;
        self.dev
            .regs
            .write32(layout::buffer_lock(self.core.dir, self.core.id), bit)
    }

    pub fn frame_geometry(&self) -> Result<FrameGeometry> {
        let raw = self
            .dev
            .regs
            .read32(layout::frame_size(self.core.dir, self.core.id))?;
        let geometry = FrameGeometry {
            width: (raw >> 16) as u16,
            height: raw as u16,
        };
        if geometry.size() % binder::LENGTH_ALIGN != 0 {
            return Err(VdmaError::InvalidArgument("frame size must be a multiple of 16"));
        }
        Ok(geometry)
    }

    /// Frames per completion interrupt: 1, 2 or 4
    pub fn set_irq_frame_count(&self, frames: u32) -> Result<()> {
        if !matches!(frames, 1 | 2 | 4) {
            return Err(VdmaError::InvalidArgument("frames per interrupt must be 1, 2 or 4"));
        }
        self.dev.regs.modify32(
            layout::irq_count(self.core.dir, self.core.id),
            layout::IRQ_CNT_FRAMES_MASK,
            frames,
        )
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.stop();
        self.poll_worker = None;
        self.core.release();
        self.dev.channel_closed(self.core.dir);
        info!("{}{}: closed", self.core.dir, self.core.id);
    }
}

#[cfg(test)]
#[path = "tests/test_channel.rs"]
mod tests;
