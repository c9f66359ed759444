use std::cell::RefCell;
use std::rc::Rc;

use aero_qdev::input::{i8042_init, Mode, Pending, Status, I8042};
use aero_qdev::platform::interrupts::{IsaIrqLines, LevelLatch};
use aero_qdev::platform::memory::MemoryRegion;
use aero_qdev::platform::reset::ResetKind;
use aero_qdev::DeviceModel;
use proptest::prelude::*;

const DATA: u64 = 0x60;
const CMD: u64 = 0x64;

struct Board {
    _model: DeviceModel,
    io: MemoryRegion,
    irqs: IsaIrqLines,
    a20: LevelLatch,
    resets: Rc<RefCell<Vec<ResetKind>>>,
    ctrl: I8042,
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn board() -> Board {
    init_logging();
    let model = DeviceModel::new();
    let io = MemoryRegion::new_container("io", 0x1_0000);
    let irqs = IsaIrqLines::new();
    let a20 = LevelLatch::new();
    let ctrl = i8042_init(&model, &io, irqs.pin(1), irqs.pin(12), Rc::new(a20.clone())).unwrap();

    let resets = Rc::new(RefCell::new(Vec::new()));
    let sink = resets.clone();
    ctrl.set_reset_sink(move |kind| sink.borrow_mut().push(kind));

    // Post-reset: both FIFOs empty, both sub-device pins low.
    assert!(ctrl.keyboard().is_empty());
    assert!(ctrl.mouse().is_empty());
    assert!(!ctrl.keyboard().irq().level());
    assert!(!ctrl.mouse().irq().level());

    Board {
        _model: model,
        io,
        irqs,
        a20,
        resets,
        ctrl,
    }
}

#[test]
fn s1_self_test() {
    let b = board();
    b.io.write_u8(CMD, 0xAA);
    assert_eq!(b.io.read_u8(CMD), 0x1D);
    assert_eq!(b.io.read_u8(DATA), 0x55);
    assert_eq!(b.io.read_u8(CMD), 0x1C);
}

#[test]
fn s2_read_mode() {
    let b = board();
    b.io.write_u8(CMD, 0x20);
    assert_eq!(b.io.read_u8(DATA), 0x03);
}

#[test]
fn s3_write_mode_enables_translation() {
    let b = board();
    b.io.write_u8(CMD, 0x60);
    b.io.write_u8(DATA, 0x43);
    assert_eq!(b.ctrl.mode().bits(), 0x43);
    assert!(b.ctrl.mode().contains(Mode::KCC));
    assert!(b.ctrl.keyboard().translation());
    assert!(!b.irqs.level(1));
}

#[test]
fn s4_mouse_byte_reaches_the_guest() {
    let b = board();
    b.ctrl.mouse().queue(0x08);
    assert!(b.ctrl.mouse().irq().level());
    assert_eq!(b.ctrl.pending(), Pending::AUX);

    let status = Status::from_bits_retain(b.io.read_u8(CMD));
    assert!(status.contains(Status::OBF | Status::MOUSE_OBF));
    assert!(b.irqs.level(12));

    assert_eq!(b.io.read_u8(DATA), 0x08);
    let status = Status::from_bits_retain(b.io.read_u8(CMD));
    assert!(!status.intersects(Status::OBF | Status::MOUSE_OBF));
    assert!(!b.irqs.level(12));
}

#[test]
fn fake_mouse_event_arrives_as_one_packet() {
    let b = board();
    b.io.write_u8(CMD, 0xD4);
    b.io.write_u8(DATA, 0xF4);
    assert!(b.irqs.level(12));
    assert_eq!(b.io.read_u8(DATA), 0xFA);
    assert!(!b.irqs.level(12));

    b.ctrl.mouse_fake_event();
    assert!(b.irqs.level(12));
    let status = Status::from_bits_retain(b.io.read_u8(CMD));
    assert!(status.contains(Status::OBF | Status::MOUSE_OBF));
    assert_eq!(b.io.read_u8(DATA), 0x08);
    assert_eq!(b.io.read_u8(DATA), 0x01);
    assert_eq!(b.io.read_u8(DATA), 0x00);
    assert!(!b.irqs.level(12));
    assert!(b.ctrl.mouse().is_empty());
}

#[test]
fn s5_keyboard_wins_over_mouse() {
    let b = board();
    b.ctrl.mouse().queue(0xCD);
    b.ctrl.keyboard().queue(0xAB);

    let status = Status::from_bits_retain(b.io.read_u8(CMD));
    assert!(status.contains(Status::OBF));
    assert!(!status.contains(Status::MOUSE_OBF));
    assert!(b.irqs.level(1));
    assert!(!b.irqs.level(12));
    assert_eq!(b.io.read_u8(DATA), 0xAB);

    // The mouse byte follows once the keyboard is drained.
    assert!(b.irqs.level(12));
    assert_eq!(b.io.read_u8(DATA), 0xCD);
}

#[test]
fn s6_reset_command_requests_one_system_reset() {
    let b = board();
    b.io.write_u8(CMD, 0xFE);
    assert_eq!(*b.resets.borrow(), [ResetKind::System]);
    assert!(b.ctrl.keyboard().is_empty());
    assert!(b.ctrl.mouse().is_empty());
    assert!(!b.irqs.level(1));
    assert!(!b.irqs.level(12));
}

#[test]
fn disabled_keyboard_reports_obf_without_interrupt() {
    let b = board();
    b.io.write_u8(CMD, 0xAD);
    b.ctrl.keyboard().queue(0x1C);
    assert_ne!(b.io.read_u8(CMD) & Status::OBF.bits(), 0);
    assert!(!b.irqs.level(1));

    b.io.write_u8(CMD, 0xAE);
    assert!(b.irqs.level(1));
}

#[test]
fn a20_commands_leave_interrupts_alone() {
    let b = board();
    b.ctrl.keyboard().queue(0x1C);
    assert!(b.irqs.level(1));

    b.io.write_u8(CMD, 0xDD);
    assert!(!b.a20.level());
    assert!(b.irqs.level(1));
    assert!(!b.irqs.level(12));

    b.io.write_u8(CMD, 0xDF);
    assert!(b.a20.level());
    assert!(b.irqs.level(1));
    assert!(!b.irqs.level(12));
}

proptest! {
    #[test]
    fn pulse_commands_collapse_to_reset_or_nothing(cmd in 0xF0u8..=0xFF) {
        let b = board();
        b.io.write_u8(CMD, cmd);
        let expected = if cmd & 1 == 0 { 1 } else { 0 };
        prop_assert_eq!(b.resets.borrow().len(), expected);
        prop_assert!(b.ctrl.keyboard().is_empty());
        prop_assert_eq!(b.ctrl.write_cmd(), 0);
    }
}
