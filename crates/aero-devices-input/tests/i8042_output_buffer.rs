use std::rc::Rc;

use aero_devices_input::{i8042_init, Pending, I8042};
use aero_devmodel::DeviceModel;
use aero_platform::interrupts::{IsaIrqLines, LevelLatch};
use aero_platform::memory::MemoryRegion;

struct Pc {
    _model: DeviceModel,
    io: MemoryRegion,
    irqs: IsaIrqLines,
    ctrl: I8042,
}

fn pc() -> Pc {
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
    Pc {
        _model: model,
        io,
        irqs,
        ctrl,
    }
}

#[test]
fn i8042_command_d2_writes_keyboard_output_buffer_and_raises_irq1() {
    let pc = pc();

    // 0xD2: next data byte should appear as keyboard output (OBF set, AUX clear).
    pc.io.write_u8(0x64, 0xD2);
    pc.io.write_u8(0x60, 0xAA);

    assert!(pc.irqs.level(1));
    assert!(!pc.irqs.level(12));

    let status = pc.io.read_u8(0x64);
    assert_ne!(status & 0x01, 0, "output buffer should be full");
    assert_eq!(status & 0x20, 0, "AUX bit should be clear for keyboard data");

    assert_eq!(pc.io.read_u8(0x60), 0xAA);
    assert_eq!(pc.io.read_u8(0x64) & 0x01, 0, "output buffer should be empty after read");
    assert!(!pc.irqs.level(1));
}

#[test]
fn i8042_command_d3_writes_mouse_output_buffer_and_raises_irq12() {
    let pc = pc();

    pc.io.write_u8(0x64, 0xD3);
    pc.io.write_u8(0x60, 0xBB);
    assert!(pc.irqs.level(12));
    assert!(!pc.irqs.level(1));
    assert_eq!(pc.ctrl.pending(), Pending::AUX);

    let status = pc.io.read_u8(0x64);
    assert_ne!(status & 0x01, 0, "output buffer should be full");
    assert_ne!(status & 0x20, 0, "AUX bit should be set for mouse data");
    assert_eq!(pc.io.read_u8(0x60), 0xBB);
    assert!(!pc.irqs.level(12));
}

#[test]
fn i8042_mouse_interrupt_is_gated_by_the_command_byte() {
    let pc = pc();

    // Keep only the keyboard interrupt enabled.
    pc.io.write_u8(0x64, 0x60);
    pc.io.write_u8(0x60, 0x01);

    pc.io.write_u8(0x64, 0xD3);
    pc.io.write_u8(0x60, 0xCC);
    assert!(!pc.irqs.level(12), "IRQ12 should be gated by the command byte");
    assert_ne!(pc.io.read_u8(0x64) & 0x20, 0);

    // Re-enabling the interrupt asserts it for the byte already waiting.
    pc.io.write_u8(0x64, 0x60);
    pc.io.write_u8(0x60, 0x03);
    assert!(pc.irqs.level(12));
    assert_eq!(pc.io.read_u8(0x60), 0xCC);
}

#[test]
fn i8042_keyboard_data_takes_priority_over_mouse_data() {
    let pc = pc();

    pc.io.write_u8(0x64, 0xD3);
    pc.io.write_u8(0x60, 0x11);
    pc.io.write_u8(0x64, 0xD2);
    pc.io.write_u8(0x60, 0x22);

    assert_eq!(pc.ctrl.pending(), Pending::KBD | Pending::AUX);
    assert_eq!(pc.io.read_u8(0x64) & 0x21, 0x01);
    assert!(pc.irqs.level(1));
    assert!(!pc.irqs.level(12));

    assert_eq!(pc.io.read_u8(0x60), 0x22);
    assert!(pc.irqs.level(12));
    assert_eq!(pc.io.read_u8(0x60), 0x11);
    assert_eq!(pc.io.read_u8(0x64) & 0x01, 0);
}

#[test]
fn i8042_disabled_keyboard_keeps_obf_but_drops_irq1() {
    let pc = pc();

    pc.io.write_u8(0x64, 0xAD);
    pc.io.write_u8(0x64, 0xD2);
    pc.io.write_u8(0x60, 0x42);
    assert_ne!(pc.io.read_u8(0x64) & 0x01, 0);
    assert!(!pc.irqs.level(1));

    pc.io.write_u8(0x64, 0xAE);
    assert!(pc.irqs.level(1));
}

#[test]
fn i8042_controller_self_test_and_port_tests() {
    let pc = pc();

    pc.io.write_u8(0x64, 0xAA);
    assert_ne!(pc.io.read_u8(0x64) & 0x04, 0, "system flag should be set");
    assert_eq!(pc.io.read_u8(0x60), 0x55);

    for cmd in [0xA9, 0xAB, 0xC0] {
        pc.io.write_u8(0x64, cmd);
        assert_eq!(pc.io.read_u8(0x60), 0x00, "command {cmd:#04x}");
    }

    pc.io.write_u8(0x64, 0x20);
    assert_eq!(pc.io.read_u8(0x60), 0x03);
}
