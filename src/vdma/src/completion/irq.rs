//! Interrupt backend
//!
//! The top half ([`InterruptPath::handle`]) only decodes the vector, raises
//! per-channel trigger flags and kicks the direction's [`DeferredWork`].
//! The deferred worker reads the status register once per pass and
//! publishes every channel whose index moved.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use core::time::Duration;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};

use super::{CompletionSource, NewIndex};
use crate::channel::{Backend, ChannelCore, Fault};
use crate::error::{Result, VdmaError};
use crate::regs::layout::{self, IrqBits, MsiVector};
use crate::regs::Registers;
use crate::{Direction, MAX_CHANNELS, MAX_IRQ_VECTORS};

/// Deferred worker wakes on its own this often to notice shutdown
const IDLE_PARK: Duration = Duration::from_millis(100);

/// Interrupt source of one channel, fed by the deferred worker
pub struct InterruptSource {
    core: Arc<ChannelCore>,
    status: Arc<AtomicU32>,
}

impl InterruptSource {
    pub fn new(core: Arc<ChannelCore>, status: Arc<AtomicU32>) -> Self {
        Self { core, status }
    }
}

impl CompletionSource for InterruptSource {
    fn observe(&mut self) -> Option<NewIndex> {
        let index = layout::status_index(self.status.load(Ordering::Acquire), self.core.id);
        let triggered = self.core.take_trigger();
        let mut last = self.core.last_seen.lock();
        if *last != index || triggered {
            *last = index;
            Some(NewIndex(index))
        } else {
            None
        }
    }
}

struct DeferredShared {
    dir: Direction,
    regs: Registers,
    status: Arc<AtomicU32>,
    pending: AtomicBool,
    shutdown: AtomicBool,
    passes: AtomicU64,
}

impl DeferredShared {
    fn service(&self, sources: &mut [InterruptSource]) {
        let status = match self.regs.read32(layout::status(self.dir)) {
            Ok(status) => status,
            Err(e) => {
                error!("irq: {} status read failed: {}", self.dir, e);
                return;
            }
        };
        self.status.store(status, Ordering::Release);

        for source in sources.iter_mut() {
            if !source.core.is_running() {
                // a stale trigger must not leak into the next session
                source.core.take_trigger();
                continue;
            }
            if let Some(NewIndex(index)) = source.observe() {
                source.core.publish(Backend::Interrupt, index);
            }
        }

        let mut ack = IrqBits::FRAME_DONE;
        // SG address/length errors carry no channel; charge every running one
        if let Ok(raw) = self.regs.read32(layout::irq_source(self.dir)) {
            let pending = IrqBits::from_bits_truncate(raw);
            if pending.contains(IrqBits::SGB_ADDR_LEN_ERR) {
                warn!("irq: {} scatter-gather address/length error", self.dir);
                for source in sources.iter().filter(|s| s.core.is_running()) {
                    source.core.stats.record_fault(Fault::SgbAddrLen);
                }
                ack |= IrqBits::SGB_ADDR_LEN_ERR;
            }
            if pending.contains(IrqBits::FRAME_BROKEN) {
                warn!("irq: {} broken frame", self.dir);
                ack |= IrqBits::FRAME_BROKEN;
            }
        }

        if let Err(e) = self.regs.write32(layout::irq_source(self.dir), ack.bits()) {
            error!("irq: {} source ack failed: {}", self.dir, e);
        }
        self.passes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-direction deferred worker
pub struct DeferredWork {
    shared: Arc<DeferredShared>,
    thread: Option<JoinHandle<()>>,
}

impl DeferredWork {
    pub fn spawn(board: usize, dir: Direction, regs: Registers, cores: &[Arc<ChannelCore>]) -> Result<Self> {
        let status = Arc::new(AtomicU32::new(0));
        let shared = Arc::new(DeferredShared {
            dir,
            regs,
            status: status.clone(),
            pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            passes: AtomicU64::new(0),
        });
        let mut sources: Vec<InterruptSource> = cores
            .iter()
            .map(|core| InterruptSource::new(core.clone(), status.clone()))
            .collect();

        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name(format!("{}-work-{}", dir, board))
            .spawn(move || {
                while !worker.shutdown.load(Ordering::Acquire) {
                    if worker.pending.swap(false, Ordering::AcqRel) {
                        worker.service(&mut sources);
                    } else {
                        thread::park_timeout(IDLE_PARK);
                    }
                }
            })
            .map_err(|_| VdmaError::Platform("cannot spawn deferred worker"))?;

        info!("irq: {} deferred worker up for board {}", dir, board);
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Queues one service pass; repeated calls before it runs coalesce
    pub fn schedule(&self) {
        self.shared.pending.store(true, Ordering::Release);
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }

    /// Completed service passes
    pub fn passes(&self) -> u64 {
        self.shared.passes.load(Ordering::Relaxed)
    }
}

impl Drop for DeferredWork {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                error!("irq: {} deferred worker panicked", self.shared.dir);
            }
        }
    }
}

/// How interrupt vectors map onto causes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsiLayout {
    /// One vector; the cause lives in the MSI vector register
    Shared,
    /// Vector slot `i` is MSI vector register bit `i`
    PerCause,
}

impl MsiLayout {
    pub fn from_vector_count(count: usize) -> Self {
        if count < 8 {
            MsiLayout::Shared
        } else {
            MsiLayout::PerCause
        }
    }
}

/// Per-channel fault causes of the MSI vector register
const FAULT_CAUSES: [(MsiVector, Direction, Fault, IrqBits); 4] = [
    (MsiVector::C2H_DESC_TERM, Direction::CardToHost, Fault::DescTerminated, IrqBits::DESC_TERM),
    (MsiVector::H2C_DESC_TERM, Direction::HostToCard, Fault::DescTerminated, IrqBits::DESC_TERM),
    (MsiVector::C2H_DATA_LOSS, Direction::CardToHost, Fault::DataLoss, IrqBits::FRAME_DATA_LOSS),
    (MsiVector::C2H_VIDEO_HALT, Direction::CardToHost, Fault::VideoHalted, IrqBits::VIDEO_IN_HALTED),
];

fn channels_in(bits: u32, group: MsiVector) -> impl Iterator<Item = usize> {
    let shift = group.bits().trailing_zeros();
    let lanes = (bits & group.bits()) >> shift;
    (0..MAX_CHANNELS).filter(move |ch| lanes & (1 << ch) != 0)
}

/// Interrupt top half of one board
pub struct InterruptPath {
    board: usize,
    regs: Registers,
    layout: MsiLayout,
    vectors: heapless::Vec<u32, MAX_IRQ_VECTORS>,
    cores: [Vec<Arc<ChannelCore>>; 2],
    work: [DeferredWork; 2],
}

impl InterruptPath {
    pub fn new(
        board: usize,
        regs: Registers,
        vectors: &[u32],
        c2h: Vec<Arc<ChannelCore>>,
        h2c: Vec<Arc<ChannelCore>>,
    ) -> Result<Self> {
        if vectors.is_empty() {
            return Err(VdmaError::InvalidArgument("no interrupt vectors"));
        }
        let vectors: heapless::Vec<u32, MAX_IRQ_VECTORS> = vectors.iter().copied().take(MAX_IRQ_VECTORS).collect();
        let layout = MsiLayout::from_vector_count(vectors.len());
        let work = [
            DeferredWork::spawn(board, Direction::CardToHost, regs.clone(), &c2h)?,
            DeferredWork::spawn(board, Direction::HostToCard, regs.clone(), &h2c)?,
        ];
        info!("irq: board {} uses {} vector(s), {:?}", board, vectors.len(), layout);
        Ok(Self {
            board,
            regs,
            layout,
            vectors,
            cores: [c2h, h2c],
            work,
        })
    }

    pub fn layout(&self) -> MsiLayout {
        self.layout
    }

    pub fn deferred(&self, dir: Direction) -> &DeferredWork {
        &self.work[dir.index()]
    }

    /// Top half. Returns whether `irq` belongs to this board.
    pub fn handle(&self, irq: u32) -> bool {
        let Some(slot) = self.vectors.iter().position(|&v| v == irq) else {
            return false;
        };

        let causes = match self.layout {
            MsiLayout::Shared => match self.regs.read32(layout::MSI_VECTOR) {
                Ok(bits) => bits,
                Err(e) => {
                    error!("irq: board {} vector read failed: {}", self.board, e);
                    return true;
                }
            },
            MsiLayout::PerCause => 1u32 << slot,
        };
        self.dispatch(causes);

        if self.layout == MsiLayout::Shared && causes != 0 {
            if let Err(e) = self.regs.write32(layout::MSI_VECTOR, causes) {
                error!("irq: board {} vector ack failed: {}", self.board, e);
            }
        }
        true
    }

    fn core(&self, dir: Direction, ch: usize) -> Option<&Arc<ChannelCore>> {
        self.cores[dir.index()].get(ch)
    }

    fn dispatch(&self, causes: u32) {
        for (group, dir) in [
            (MsiVector::C2H_FRAME_DONE, Direction::CardToHost),
            (MsiVector::H2C_FRAME_DONE, Direction::HostToCard),
        ] {
            let mut any = false;
            for ch in channels_in(causes, group) {
                if let Some(core) = self.core(dir, ch) {
                    core.set_trigger();
                    any = true;
                }
            }
            if any {
                self.work[dir.index()].schedule();
            }
        }

        for (group, dir, fault, source) in FAULT_CAUSES {
            if causes & group.bits() == 0 {
                continue;
            }
            for ch in channels_in(causes, group) {
                warn!("irq: {}{} {:?}", dir, ch, fault);
                if let Some(core) = self.core(dir, ch) {
                    core.stats.record_fault(fault);
                }
            }
            if let Err(e) = self.regs.write32(layout::irq_source(dir), source.bits()) {
                error!("irq: {} fault ack failed: {}", dir, e);
            }
        }

        if causes & MsiVector::IP_ERROR.bits() != 0 {
            error!("irq: board {} engine IP error", self.board);
        }
        if causes & MsiVector::PCIE_ERROR.bits() != 0 {
            error!("irq: board {} PCIe error", self.board);
        }
        if causes & MsiVector::USER_DEFINED.bits() != 0 {
            debug!("irq: board {} user interrupt 0x{:x}", self.board, causes & MsiVector::USER_DEFINED.bits());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimRegisters;
    use std::time::Instant;

    fn cores(dir: Direction) -> Vec<Arc<ChannelCore>> {
        (0..MAX_CHANNELS).map(|ch| Arc::new(ChannelCore::new(dir, ch))).collect()
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_layout_from_vector_count() {
        assert_eq!(MsiLayout::from_vector_count(1), MsiLayout::Shared);
        assert_eq!(MsiLayout::from_vector_count(7), MsiLayout::Shared);
        assert_eq!(MsiLayout::from_vector_count(8), MsiLayout::PerCause);
        assert_eq!(MsiLayout::from_vector_count(32), MsiLayout::PerCause);
    }

    #[test]
    fn test_source_reports_moved_or_triggered_index() {
        let core = Arc::new(ChannelCore::new(Direction::CardToHost, 1));
        let status = Arc::new(AtomicU32::new(4 << 17));
        let mut source = InterruptSource::new(core.clone(), status.clone());

        assert_eq!(source.observe(), Some(NewIndex(4)));
        assert_eq!(source.observe(), None);

        // same index again, but the top half saw a frame-done
        core.set_trigger();
        assert_eq!(source.observe(), Some(NewIndex(4)));

        status.store(5 << 17, Ordering::Release);
        assert_eq!(source.observe(), Some(NewIndex(5)));
    }

    #[test]
    fn test_deferred_pass_publishes_running_channels() {
        let sim = Arc::new(SimRegisters::new());
        let regs = Registers::new(sim.clone(), Duration::ZERO, false);
        let c2h = cores(Direction::CardToHost);
        c2h[0].set_running(true);
        c2h[2].set_running(true);
        sim.poke(layout::status(Direction::CardToHost), (3 << 12) | (9 << 22));

        let work = DeferredWork::spawn(0, Direction::CardToHost, regs, &c2h).unwrap();
        work.schedule();
        assert!(wait_for(|| work.passes() >= 1));

        assert_eq!(c2h[0].fb.take(), Some(3));
        assert_eq!(c2h[2].fb.take(), Some(9));
        assert!(!c2h[1].fb.is_updated());
        assert!(sim.writes_to(layout::irq_source(Direction::CardToHost)) >= 1);
    }

    #[test]
    fn test_sg_error_counted_and_acknowledged() {
        let sim = Arc::new(SimRegisters::new());
        let regs = Registers::new(sim.clone(), Duration::ZERO, false);
        let h2c = cores(Direction::HostToCard);
        h2c[3].set_running(true);
        let src = layout::irq_source(Direction::HostToCard);
        sim.poke(src, (IrqBits::SGB_ADDR_LEN_ERR | IrqBits::FRAME_DONE).bits());

        let work = DeferredWork::spawn(0, Direction::HostToCard, regs, &h2c).unwrap();
        work.schedule();
        assert!(wait_for(|| work.passes() >= 1));

        assert_eq!(h2c[3].stats.snapshot().sgb_errors, 1);
        assert_eq!(h2c[0].stats.snapshot().sgb_errors, 0);
        assert_eq!(sim.peek(src), 0);
    }

    #[test]
    fn test_shared_vector_dispatch() {
        let sim = Arc::new(SimRegisters::new());
        let regs = Registers::new(sim.clone(), Duration::ZERO, false);
        let c2h = cores(Direction::CardToHost);
        let h2c = cores(Direction::HostToCard);
        c2h[1].set_running(true);
        let path = InterruptPath::new(0, regs, &[42], c2h.clone(), h2c).unwrap();
        assert_eq!(path.layout(), MsiLayout::Shared);

        sim.poke(layout::status(Direction::CardToHost), 6 << 17);
        sim.poke(layout::MSI_VECTOR, (1 << 1) | (1 << 17));

        assert!(!path.handle(7));
        assert!(path.handle(42));
        assert!(wait_for(|| c2h[1].fb.is_updated()));
        assert_eq!(c2h[1].fb.take(), Some(6));
        assert_eq!(c2h[1].stats.snapshot().data_loss, 1);
        // vector register is write-one-to-clear
        assert_eq!(sim.peek(layout::MSI_VECTOR), 0);
    }

    #[test]
    fn test_per_cause_slot_maps_to_channel() {
        let sim = Arc::new(SimRegisters::new());
        let regs = Registers::new(sim.clone(), Duration::ZERO, false);
        let c2h = cores(Direction::CardToHost);
        let h2c = cores(Direction::HostToCard);
        h2c[2].set_running(true);
        let vectors: Vec<u32> = (100..108).collect();
        let path = InterruptPath::new(1, regs, &vectors, c2h, h2c.clone()).unwrap();
        assert_eq!(path.layout(), MsiLayout::PerCause);

        sim.poke(layout::status(Direction::HostToCard), 11 << 22);
        // slot 6 is H2C frame done on channel 2
        assert!(path.handle(106));
        assert!(wait_for(|| h2c[2].wb.is_updated() || h2c[2].fb.is_updated()));
        assert_eq!(h2c[2].fb.take(), Some(11));
        assert_eq!(sim.peek(layout::MSI_VECTOR), 0);
    }
}
