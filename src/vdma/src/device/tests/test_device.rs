//! Device probe and lifecycle tests

use super::*;
use crate::completion::irq::MsiLayout;
use crate::config::{Arbitration, CompletionMode};
use crate::regs::layout::{IrqBits, MsiVector};
use crate::testing::{SimBoard, SIM_CAPABILITY};
use std::time::Instant;

const IRQ: u32 = 48;

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn test_version_decode() {
    let version = EngineVersion::from_register(0x1060_0000);
    assert_eq!(version, EngineVersion { major: 1, minor: 6, update: 0 });
    assert_eq!(version.to_string(), "1.06.0");
    assert_eq!(EngineVersion::from_register(0x1073_0000).update, 3);
}

#[test]
fn test_capability_decode() {
    let caps = Capabilities::from_register(SIM_CAPABILITY, true);
    assert_eq!(caps.pcie_gen, 1);
    assert_eq!(caps.link_width, 1);
    assert_eq!(caps.directions, DirectionSupport::Both);
    assert_eq!(caps.channels(Direction::CardToHost), 4);
    assert_eq!(caps.channels(Direction::HostToCard), 4);

    // Gen2 x4, capture only, two channels
    let caps = Capabilities::from_register(0x1 | (2 << 2) | (1 << 20), false);
    assert_eq!(caps.pcie_gen, 2);
    assert_eq!(caps.link_width, 4);
    assert!(caps.supports(Direction::CardToHost));
    assert!(!caps.supports(Direction::HostToCard));
    assert_eq!(caps.channels(Direction::CardToHost), 2);
    assert_eq!(caps.channels(Direction::HostToCard), 0);
    assert!(!caps.addr64);
}

#[test]
fn test_probe_rejects_unknown_major() {
    let sim = SimBoard::new(IRQ);
    sim.regs.poke(layout::VERSION, 0x2010_0000);
    assert_eq!(
        sim.probe(0, EngineConfig::for_simulation()).err(),
        Some(VdmaError::UnsupportedVersion { major: 2, minor: 1 })
    );
}

#[test]
fn test_probe_accepts_other_minor() {
    let sim = SimBoard::new(IRQ);
    sim.regs.poke(layout::VERSION, 0x1050_0000);
    let dev = sim.probe(0, EngineConfig::for_simulation()).unwrap();
    assert_eq!(dev.version().minor, 5);
}

#[test]
fn test_probe_rejects_bad_config() {
    let sim = SimBoard::new(IRQ);
    let config = EngineConfig::for_simulation().with_max_channels(0);
    assert!(matches!(sim.probe(0, config), Err(VdmaError::InvalidArgument(_))));
    assert!(sim.regs.write_log().is_empty());
}

#[test]
fn test_init_programs_engine() {
    let sim = SimBoard::new(IRQ);
    let config = EngineConfig::for_simulation()
        .with_completion(CompletionMode::Poll)
        .with_arbitration(Arbitration::WeightedRoundRobin)
        .with_buffer_lock(true);
    let _dev = sim.probe(0, config).unwrap();

    let c2h = Control::from_bits_truncate(sim.regs.peek(layout::control(Direction::CardToHost)));
    let h2c = Control::from_bits_truncate(sim.regs.peek(layout::control(Direction::HostToCard)));
    assert!(c2h.contains(Control::ALL_BUF_LOCK | Control::HW_FRAME_DROP | Control::INT_METHOD_POLL));
    assert!(h2c.contains(Control::ALL_BUF_LOCK | Control::INT_METHOD_POLL));
    assert!(!h2c.contains(Control::HW_FRAME_DROP));
    assert!(!c2h.contains(Control::GLOBAL_RST));
    for dir in [Direction::CardToHost, Direction::HostToCard] {
        assert_eq!(sim.regs.peek(layout::dma_channel_control(dir)) & layout::DMA_CH_ARB_MASK, 2);
        // asserted then released
        assert!(sim.regs.writes_to(layout::control(dir)) >= 2);
    }
}

#[test]
fn test_init_without_lock_or_drop() {
    let sim = SimBoard::new(IRQ);
    sim.regs.poke(layout::control(Direction::CardToHost), Control::ALL_BUF_LOCK.bits());
    let config = EngineConfig::for_simulation().with_hw_frame_drop(false);
    let _dev = sim.probe(0, config).unwrap();

    let c2h = Control::from_bits_truncate(sim.regs.peek(layout::control(Direction::CardToHost)));
    assert!(!c2h.intersects(Control::ALL_BUF_LOCK | Control::HW_FRAME_DROP | Control::INT_METHOD_POLL));
    assert_eq!(
        sim.regs.peek(layout::dma_channel_control(Direction::CardToHost)) & layout::DMA_CH_ARB_MASK,
        1
    );
}

#[test]
fn test_32bit_platform_is_recorded() {
    let sim = SimBoard::new(IRQ);
    sim.platform.set_64bit(false);
    let dev = sim.probe(0, EngineConfig::for_simulation()).unwrap();
    assert!(!dev.capabilities().addr64);
}

#[test]
fn test_open_rules() {
    let sim = SimBoard::new(IRQ);
    let dev = sim
        .probe(0, EngineConfig::for_simulation().with_max_channels(2))
        .unwrap();
    assert_eq!(dev.channel_count(Direction::CardToHost), 2);

    let ch = dev.open(Direction::CardToHost, 1).unwrap();
    assert_eq!(dev.open(Direction::CardToHost, 1).err(), Some(VdmaError::Busy));
    assert_eq!(dev.open(Direction::CardToHost, 2).err(), Some(VdmaError::InvalidChannel));
    assert!(dev.open(Direction::HostToCard, 1).is_ok());
    drop(ch);
    assert!(dev.open(Direction::CardToHost, 1).is_ok());
}

#[test]
fn test_open_counts_and_reset_on_last_close() {
    let sim = SimBoard::new(IRQ);
    let dev = sim.probe(0, EngineConfig::for_simulation()).unwrap();
    let cr = layout::control(Direction::HostToCard);

    let a = dev.open(Direction::HostToCard, 0).unwrap();
    let b = dev.open(Direction::HostToCard, 3).unwrap();
    assert_eq!(dev.shared.dir_state(Direction::HostToCard).opened, 2);

    let before = sim.regs.writes_to(cr);
    drop(a);
    assert_eq!(sim.regs.writes_to(cr), before);
    drop(b);
    assert_eq!(sim.regs.writes_to(cr), before + 2);
    assert_eq!(dev.shared.dir_state(Direction::HostToCard).opened, 0);
}

#[test]
fn test_reset_refused_while_running() {
    let sim = SimBoard::new(IRQ);
    let dev = sim.probe(0, EngineConfig::for_simulation()).unwrap();
    let mut ch = dev.open(Direction::CardToHost, 0).unwrap();
    ch.bind_and_start(&[0x1000_0000], 1, 4096).unwrap();

    assert_eq!(dev.reset(Direction::CardToHost), Err(VdmaError::Busy));
    assert!(dev.reset(Direction::HostToCard).is_ok());
    ch.stop();
    assert!(dev.reset(Direction::CardToHost).is_ok());
}

#[test]
fn test_poll_mode_has_no_interrupt_path() {
    let sim = SimBoard::new(IRQ);
    let dev = sim
        .probe(0, EngineConfig::for_simulation().with_completion(CompletionMode::Poll))
        .unwrap();
    assert!(dev.interrupt_path().is_none());
    assert!(!dev.handle_irq(IRQ));
}

#[test]
fn test_interrupt_mode_needs_vectors() {
    let sim = SimBoard::with_vectors(&[]);
    assert!(matches!(
        sim.probe(0, EngineConfig::for_simulation()),
        Err(VdmaError::InvalidArgument(_))
    ));
}

#[test]
fn test_foreign_vector_is_not_claimed() {
    let sim = SimBoard::new(IRQ);
    let dev = sim.probe(0, EngineConfig::for_simulation()).unwrap();
    assert!(!dev.handle_irq(IRQ + 1));
    assert_eq!(dev.interrupt_path().map(|p| p.layout()), Some(MsiLayout::Shared));
}

#[test]
fn test_per_cause_vectors_route_faults() {
    let vectors: Vec<u32> = (64..96).collect();
    let sim = SimBoard::with_vectors(&vectors);
    let dev = sim.probe(0, EngineConfig::for_simulation()).unwrap();
    assert_eq!(dev.interrupt_path().map(|p| p.layout()), Some(MsiLayout::PerCause));
    let ch = dev.open(Direction::CardToHost, 2).unwrap();

    // slot 22 is the video-halt cause of c2h channel 2
    let slot = MsiVector::C2H_VIDEO_HALT.bits().trailing_zeros() + 2;
    assert!(dev.handle_irq(64 + slot));
    assert_eq!(ch.stats().video_halted, 1);
    assert_eq!(sim.regs.write_log().last(), Some(&(
        layout::irq_source(Direction::CardToHost),
        IrqBits::VIDEO_IN_HALTED.bits()
    )));
}

#[test]
fn test_shared_vector_frame_done_reaches_deferred_work() {
    let sim = SimBoard::new(IRQ);
    let dev = sim.probe(0, EngineConfig::for_simulation()).unwrap();
    let mut ch = dev.open(Direction::HostToCard, 1).unwrap();
    ch.bind_and_start(&[0x1000_0000, 0x1100_0000], 2, 4096).unwrap();

    sim.regs.complete_frame(Direction::HostToCard, 1, 1);
    assert!(dev.handle_irq(IRQ));
    let path = dev.interrupt_path().unwrap();
    assert!(wait_for(|| path.deferred(Direction::HostToCard).passes() >= 1));
    assert!(wait_for(|| sim.regs.peek(layout::irq_source(Direction::HostToCard)) == 0));
    assert_eq!(sim.regs.peek(layout::MSI_VECTOR), 0);
    assert_eq!(ch.wait_for_index(Duration::from_secs(2)), Ok(1));
}

#[test]
fn test_resources_are_kept() {
    let sim = SimBoard::with_vectors(&[40, 41]);
    let dev = sim.probe(3, EngineConfig::for_simulation()).unwrap();
    assert_eq!(dev.board(), 3);
    assert_eq!(dev.resources().irq_vectors.as_slice(), &[40, 41]);
    assert_eq!(dev.resources().register_bar().map(|b| b.index), Some(0));
}
