use std::rc::Rc;

use aero_devices_input::{i8042_init, MouseStatus, I8042};
use aero_devmodel::DeviceModel;
use aero_platform::interrupts::{IsaIrqLines, LevelLatch};
use aero_platform::memory::MemoryRegion;

fn controller() -> (DeviceModel, MemoryRegion, IsaIrqLines, I8042) {
    let model = DeviceModel::new();
    let io = MemoryRegion::new_container("io", 0x1_0000);
    let irqs = IsaIrqLines::new();
    let ctrl = i8042_init(
        &model,
        &io,
        irqs.pin(1),
        irqs.pin(12),
        Rc::new(LevelLatch::new()),
    )
    .unwrap();
    (model, io, irqs, ctrl)
}

fn enable_reporting(io: &MemoryRegion) {
    io.write_u8(0x64, 0xD4);
    io.write_u8(0x60, 0xF4);
    assert_eq!(io.read_u8(0x60), 0xFA);
}

#[test]
fn i8042_mouse_reports_motion_after_enable() {
    let (_model, io, irqs, ctrl) = controller();

    // Reporting starts disabled; motion is not buffered.
    ctrl.mouse_fake_event();
    assert_eq!(io.read_u8(0x64) & 0x01, 0);

    enable_reporting(&io);
    assert!(ctrl.mouse().status().contains(MouseStatus::ENABLED));

    ctrl.mouse_fake_event();
    let status = io.read_u8(0x64);
    assert_ne!(status & 0x01, 0, "output buffer should contain a packet");
    assert_ne!(status & 0x20, 0, "AUX bit should be set for mouse data");
    assert!(irqs.level(12));

    assert_eq!(io.read_u8(0x60), 0x08);
    assert_eq!(io.read_u8(0x60), 0x01);
    assert_eq!(io.read_u8(0x60), 0x00);
    assert_eq!(io.read_u8(0x64) & 0x21, 0);
    assert!(!irqs.level(12));
}

#[test]
fn i8042_mouse_packet_carries_buttons_and_inverted_y() {
    let (_model, io, _irqs, ctrl) = controller();
    enable_reporting(&io);

    // Left button, 5 right, 3 down on screen (negative for the guest).
    ctrl.mouse().mouse_event(5, 3, 0, 0x01);
    assert_eq!(io.read_u8(0x60), 0x29);
    assert_eq!(io.read_u8(0x60), 5);
    assert_eq!(io.read_u8(0x60), 0xFD);
}

#[test]
fn i8042_mouse_port_disable_only_sets_the_mode_bit() {
    let (_model, io, _irqs, ctrl) = controller();
    enable_reporting(&io);

    io.write_u8(0x64, 0xA7);
    assert_eq!(ctrl.mode().bits() & 0x20, 0x20);

    // Motion still reaches the FIFO; the bit is advisory for the guest.
    ctrl.mouse().mouse_event(5, 0, 0, 0);
    assert_eq!(io.read_u8(0x60), 0x08);
    assert_eq!(io.read_u8(0x60), 5);
    assert_eq!(io.read_u8(0x60), 0);

    io.write_u8(0x64, 0xA8);
    assert_eq!(ctrl.mode().bits() & 0x20, 0);
}

#[test]
fn i8042_mouse_status_request_reports_settings() {
    let (_model, io, _irqs, _ctrl) = controller();

    io.write_u8(0x64, 0xD4);
    io.write_u8(0x60, 0xE8);
    io.write_u8(0x64, 0xD4);
    io.write_u8(0x60, 0x03);
    io.write_u8(0x64, 0xD4);
    io.write_u8(0x60, 0xE9);

    let mut out = Vec::new();
    while io.read_u8(0x64) & 0x01 != 0 {
        out.push(io.read_u8(0x60));
    }
    // Power-on leaves the sample rate at zero until SET_DEFAULT or a reset command.
    assert_eq!(out, vec![0xFA, 0xFA, 0xFA, 0x00, 0x03, 0x00]);
}

#[test]
fn i8042_mouse_reset_replies_with_self_test_and_id() {
    let (_model, io, _irqs, ctrl) = controller();
    enable_reporting(&io);

    io.write_u8(0x64, 0xD4);
    io.write_u8(0x60, 0xFF);
    assert_eq!(io.read_u8(0x60), 0xFA);
    assert_eq!(io.read_u8(0x60), 0xAA);
    assert_eq!(io.read_u8(0x60), 0x00);
    assert!(!ctrl.mouse().reporting_enabled());
}
