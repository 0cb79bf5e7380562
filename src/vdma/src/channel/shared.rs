//! Per-channel state shared with the completion path

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use crate::completion::IndexCell;
use crate::ring::CompletionWord;
use crate::sync::{Event, WaitQueue};
use crate::{Direction, INVALID_INDEX};

/// Which backend fed an index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Interrupt,
    Poll,
}

/// Hardware-reported conditions on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    DataLoss,
    VideoHalted,
    DescTerminated,
    SgbAddrLen,
}

/// Frame and fault counters
#[derive(Default)]
pub struct ChannelStats {
    frames: AtomicU64,
    data_loss: AtomicU64,
    video_halted: AtomicU64,
    desc_term: AtomicU64,
    sgb_errors: AtomicU64,
}

/// Point-in-time copy of [`ChannelStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub data_loss: u64,
    pub video_halted: u64,
    pub desc_term: u64,
    pub sgb_errors: u64,
}

impl ChannelStats {
    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self, fault: Fault) {
        let counter = match fault {
            Fault::DataLoss => &self.data_loss,
            Fault::VideoHalted => &self.video_halted,
            Fault::DescTerminated => &self.desc_term,
            Fault::SgbAddrLen => &self.sgb_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        for counter in [
            &self.frames,
            &self.data_loss,
            &self.video_halted,
            &self.desc_term,
            &self.sgb_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            data_loss: self.data_loss.load(Ordering::Relaxed),
            video_halted: self.video_halted.load(Ordering::Relaxed),
            desc_term: self.desc_term.load(Ordering::Relaxed),
            sgb_errors: self.sgb_errors.load(Ordering::Relaxed),
        }
    }
}

/// Channel state reachable from interrupt, deferred and poll contexts
pub struct ChannelCore {
    pub dir: Direction,
    pub id: usize,
    open: AtomicBool,
    running: AtomicBool,
    /// Index seen by the interrupt path
    pub fb: IndexCell,
    /// Write-back index seen by the poll path
    pub wb: IndexCell,
    pub waitq: WaitQueue,
    pub stats: ChannelStats,
    /// Set by the interrupt top half, consumed by deferred work
    trigger: AtomicBool,
    /// Last status-register index the deferred worker saw
    pub(crate) last_seen: spin::Mutex<u8>,
    pub(crate) poll_word: spin::Mutex<Option<Arc<CompletionWord>>>,
    /// Raised by waiters to kick the poll worker
    pub(crate) schedule: Event,
    poll_active: AtomicBool,
    /// Bumped whenever a running session ends
    session: AtomicU64,
}

impl ChannelCore {
    pub fn new(dir: Direction, id: usize) -> Self {
        Self {
            dir,
            id,
            open: AtomicBool::new(false),
            running: AtomicBool::new(false),
            fb: IndexCell::new(),
            wb: IndexCell::new(),
            waitq: WaitQueue::new(),
            stats: ChannelStats::default(),
            trigger: AtomicBool::new(false),
            last_seen: spin::Mutex::new(INVALID_INDEX),
            poll_word: spin::Mutex::new(None),
            schedule: Event::new(),
            poll_active: AtomicBool::new(false),
            session: AtomicU64::new(0),
        }
    }

    /// Claims the channel for a single opener
    pub(crate) fn try_open(&self) -> bool {
        self.open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn set_trigger(&self) {
        self.trigger.store(true, Ordering::Release);
    }

    pub(crate) fn take_trigger(&self) -> bool {
        self.trigger.swap(false, Ordering::AcqRel)
    }

    pub fn poll_active(&self) -> bool {
        self.poll_active.load(Ordering::Acquire)
    }

    pub(crate) fn set_poll_active(&self, active: bool) {
        self.poll_active.store(active, Ordering::Release);
    }

    /// Forgets every index from a previous session
    pub(crate) fn reset_indices(&self) {
        self.fb.reset();
        self.wb.reset();
        *self.last_seen.lock() = INVALID_INDEX;
        self.take_trigger();
    }

    pub fn session(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }

    /// Ends the current session and releases every waiter
    pub(crate) fn end_session(&self) {
        self.session.fetch_add(1, Ordering::AcqRel);
        self.waitq.wake_all();
    }

    /// Records a completed buffer and wakes the consumer
    pub fn publish(&self, backend: Backend, index: u8) {
        self.stats.record_frame();
        match backend {
            Backend::Interrupt => self.fb.publish(index),
            Backend::Poll => self.wb.publish(index),
        }
        self.waitq.wake_all();
        debug!("{}{}: buffer {} done ({:?})", self.dir, self.id, index, backend);
    }

    pub fn cell(&self, backend: Backend) -> &IndexCell {
        match backend {
            Backend::Interrupt => &self.fb,
            Backend::Poll => &self.wb,
        }
    }
}
