//! Poll backend
//!
//! One worker per open channel. It sleeps on the channel's schedule event
//! (raised by every blocking read) with the poll interval as timeout, then
//! inspects the coherent completion word the engine writes.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, info, trace};

use super::{CompletionSource, NewIndex};
use crate::channel::{Backend, ChannelCore};
use crate::error::{Result, VdmaError};
use crate::ring::{POLL_INDEX_MASK, POLL_INDEX_SHIFT, POLL_VALID};
use crate::INVALID_INDEX;

/// Reads a channel's completion word
pub struct PollSource {
    core: Arc<ChannelCore>,
}

impl PollSource {
    pub fn new(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }
}

impl CompletionSource for PollSource {
    fn observe(&mut self) -> Option<NewIndex> {
        let word = self.core.poll_word.lock().clone()?;
        let raw = word.read().ok()?;
        if raw & POLL_VALID == 0 {
            return None;
        }
        // hand the valid bit back to the engine for the next frame
        let raw = word.take_valid().ok()?;
        let index = ((raw & POLL_INDEX_MASK) >> POLL_INDEX_SHIFT) as u8;
        let last = self.core.wb.index();
        trace!("poll: {}{} word 0x{:08x}", self.core.dir, self.core.id, raw);
        if index != last || last == INVALID_INDEX {
            Some(NewIndex(index))
        } else {
            None
        }
    }
}

/// Worker thread polling one channel
pub struct PollWorker {
    core: Arc<ChannelCore>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PollWorker {
    pub fn spawn(board: usize, core: Arc<ChannelCore>, interval: Duration) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut source = PollSource::new(core.clone());
        let worker_core = core.clone();
        let stop = shutdown.clone();

        let thread = thread::Builder::new()
            .name(format!("{}-poll-{}.{}", core.dir, board, core.id))
            .spawn(move || loop {
                worker_core.schedule.wait_timeout(interval);
                if stop.load(Ordering::Acquire) {
                    break;
                }
                if !worker_core.poll_active() {
                    continue;
                }
                if let Some(NewIndex(index)) = source.observe() {
                    worker_core.publish(Backend::Poll, index);
                }
            })
            .map_err(|_| VdmaError::Platform("cannot spawn poll worker"))?;

        info!("poll: {}{} worker up", core.dir, core.id);
        Ok(Self {
            core,
            shutdown,
            thread: Some(thread),
        })
    }
}

impl Drop for PollWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.core.schedule.signal();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("poll: {}{} worker panicked", self.core.dir, self.core.id);
            }
        }
        info!("poll: {}{} worker down", self.core.dir, self.core.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder;
    use crate::hal::DmaPlatform;
    use crate::regs::Registers;
    use crate::ring::{self, RingTarget};
    use crate::testing::{SimPlatform, SimRegisters};
    use crate::Direction;

    fn armed_core(sim: &Arc<SimPlatform>) -> (Arc<ChannelCore>, ring::DescriptorSet, binder::BoundBuffers) {
        let platform: Arc<dyn DmaPlatform> = sim.clone();
        let regs = Registers::new(Arc::new(SimRegisters::new()), Duration::ZERO, false);
        let bound = binder::bind(&platform, &[0x1000_0000], 1, 4096, Direction::CardToHost).unwrap();
        let target = RingTarget {
            regs: &regs,
            platform: &platform,
            dir: Direction::CardToHost,
            channel: 0,
            addr64: true,
            ring_settle: Duration::ZERO,
            polling: true,
        };
        let set = ring::build(&target, &bound).unwrap();
        let core = Arc::new(ChannelCore::new(Direction::CardToHost, 0));
        *core.poll_word.lock() = set.word.clone();
        (core, set, bound)
    }

    #[test]
    fn test_invalid_word_is_ignored() {
        let sim = Arc::new(SimPlatform::new());
        let (core, set, _bound) = armed_core(&sim);
        let bus = set.word.as_ref().unwrap().bus_addr();
        let mut source = PollSource::new(core);

        assert_eq!(source.observe(), None);
        // index present but valid bit clear
        sim.device_write_u32(bus, 3 << 12);
        assert_eq!(source.observe(), None);
    }

    #[test]
    fn test_valid_word_reports_once_and_clears_valid() {
        let sim = Arc::new(SimPlatform::new());
        let (core, set, _bound) = armed_core(&sim);
        let word = set.word.clone().unwrap();
        let mut source = PollSource::new(core.clone());

        sim.device_write_u32(word.bus_addr(), (2 << 12) | POLL_VALID);
        assert_eq!(source.observe(), Some(NewIndex(2)));
        assert_eq!(word.read().unwrap() & POLL_VALID, 0);
        core.publish(Backend::Poll, 2);

        // repeated index with valid set again is not news
        sim.device_write_u32(word.bus_addr(), (2 << 12) | POLL_VALID);
        assert_eq!(source.observe(), None);

        sim.device_write_u32(word.bus_addr(), (3 << 12) | POLL_VALID);
        assert_eq!(source.observe(), Some(NewIndex(3)));
    }

    #[test]
    fn test_sentinel_always_accepts_first_index() {
        let sim = Arc::new(SimPlatform::new());
        let (core, set, _bound) = armed_core(&sim);
        let bus = set.word.as_ref().unwrap().bus_addr();
        let mut source = PollSource::new(core.clone());

        core.publish(Backend::Poll, 0);
        core.wb.reset();
        sim.device_write_u32(bus, POLL_VALID);
        assert_eq!(source.observe(), Some(NewIndex(0)));
    }

    #[test]
    fn test_worker_publishes_when_active() {
        let sim = Arc::new(SimPlatform::new());
        let (core, set, _bound) = armed_core(&sim);
        let bus = set.word.as_ref().unwrap().bus_addr();
        let worker = PollWorker::spawn(0, core.clone(), Duration::from_millis(1)).unwrap();

        sim.device_write_u32(bus, (5 << 12) | POLL_VALID);
        thread::sleep(Duration::from_millis(20));
        assert!(!core.wb.is_updated());

        core.set_poll_active(true);
        core.schedule.signal();
        assert!(core.waitq.wait_until(Duration::from_secs(2), || core.wb.is_updated()));
        assert_eq!(core.wb.take(), Some(5));
        drop(worker);
    }
}
