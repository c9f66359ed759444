//! Intel 8042 keyboard controller.
//!
//! The controller owns a PS/2 keyboard and a PS/2 mouse as `child<>` properties and three output
//! pins: `irq_kbd` (ISA IRQ 1), `irq_mouse` (ISA IRQ 12) and `a20_out`. Guest accesses go through
//! a two-register window where bit `it_shift` of the offset selects data (clear) or
//! command/status (set).

use std::any::Any;
use std::cell::{Cell, OnceCell, RefCell};
use std::fmt;
use std::rc::Rc;

use aero_devmodel::{
    define_prop_int32, prop_state, DevModelError, Device, DeviceModel, Object, ObjectClass, Pin,
    Result, TypeInfo, WeakObject, TYPE_DEVICE,
};
use aero_io_snapshot::io::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
    VmFieldKind, VmStateDescription, VmStateField,
};
use aero_platform::interrupts::IrqLine;
use aero_platform::memory::{MemoryRegion, MmioHandler};
use aero_platform::reset::{PlatformResetSink, ResetKind};
use bitflags::bitflags;

use crate::ps2_keyboard::{Ps2Keyboard, TYPE_PS2_KBD};
use crate::ps2_mouse::{Ps2Mouse, TYPE_PS2_MOUSE};

pub const TYPE_I8042: &str = "i8042";

/// Controller commands written to the command port.
pub mod cmd {
    pub const READ_MODE: u8 = 0x20;
    pub const WRITE_MODE: u8 = 0x60;
    pub const GET_VERSION: u8 = 0xA1;
    pub const MOUSE_DISABLE: u8 = 0xA7;
    pub const MOUSE_ENABLE: u8 = 0xA8;
    pub const TEST_MOUSE: u8 = 0xA9;
    pub const SELF_TEST: u8 = 0xAA;
    pub const KBD_TEST: u8 = 0xAB;
    pub const KBD_DISABLE: u8 = 0xAD;
    pub const KBD_ENABLE: u8 = 0xAE;
    pub const READ_INPORT: u8 = 0xC0;
    pub const READ_OUTPORT: u8 = 0xD0;
    pub const WRITE_OUTPORT: u8 = 0xD1;
    pub const WRITE_OBUF: u8 = 0xD2;
    pub const WRITE_AUX_OBUF: u8 = 0xD3;
    pub const WRITE_MOUSE: u8 = 0xD4;
    pub const DISABLE_A20: u8 = 0xDD;
    pub const ENABLE_A20: u8 = 0xDF;
    /// Pulse output port bits 3..0; only bit 0 (reset) is wired.
    pub const PULSE_BITS_3_0: u8 = 0xF0;
    pub const RESET: u8 = 0xFE;
    pub const NO_OP: u8 = 0xFF;
}

bitflags! {
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Status: u8 {
        const OBF = 0x01;
        const IBF = 0x02;
        const SELFTEST = 0x04;
        const CMD = 0x08;
        const UNLOCKED = 0x10;
        const MOUSE_OBF = 0x20;
        const GTO = 0x40;
        const PERR = 0x80;
    }
}

bitflags! {
    /// The controller command byte.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Mode: u8 {
        const KBD_INT = 0x01;
        const MOUSE_INT = 0x02;
        const SYS = 0x04;
        const NO_KEYLOCK = 0x08;
        const DISABLE_KBD = 0x10;
        const DISABLE_MOUSE = 0x20;
        const KCC = 0x40;
        const RFU = 0x80;
    }
}

bitflags! {
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Outport: u8 {
        const RESET = 0x01;
        const A20 = 0x02;
        const OBF = 0x10;
        const MOUSE_OBF = 0x20;
    }
}

bitflags! {
    /// Which sub-devices have data waiting.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Pending: u8 {
        const KBD = 0x01;
        const AUX = 0x02;
    }
}

struct Parts {
    kbd: Ps2Keyboard,
    mouse: Ps2Mouse,
    irq_kbd: Pin,
    irq_mouse: Pin,
    a20_out: Pin,
}

#[derive(Default)]
pub struct I8042State {
    write_cmd: Cell<u8>,
    status: Cell<Status>,
    mode: Cell<Mode>,
    outport: Cell<Outport>,
    pending: Cell<Pending>,
    it_shift: Cell<i32>,
    addr_size: Cell<i32>,
    parts: OnceCell<Rc<Parts>>,
    region: OnceCell<MemoryRegion>,
    reset_sink: RefCell<Option<Box<dyn PlatformResetSink>>>,
}

/// Handle to an 8042 controller device.
#[derive(Clone)]
pub struct I8042 {
    dev: Device,
    state: Rc<I8042State>,
    parts: Rc<Parts>,
}

impl fmt::Debug for I8042 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("I8042")
            .field("write_cmd", &self.write_cmd())
            .field("status", &self.status())
            .field("mode", &self.mode())
            .field("outport", &self.outport())
            .field("pending", &self.pending())
            .finish()
    }
}

impl I8042 {
    pub fn from_object(obj: &Object) -> Result<Self> {
        obj.check_cast(TYPE_I8042)?;
        let state = prop_state::<I8042State>(obj);
        let parts = state
            .parts
            .get()
            .cloned()
            .ok_or_else(|| DevModelError::TypeMismatch {
                name: obj.type_name().to_string(),
                expected: TYPE_I8042.to_string(),
            })?;
        Ok(Self {
            dev: Device::from_object(obj)?,
            state,
            parts,
        })
    }

    pub fn device(&self) -> &Device {
        &self.dev
    }

    pub fn keyboard(&self) -> &Ps2Keyboard {
        &self.parts.kbd
    }

    pub fn mouse(&self) -> &Ps2Mouse {
        &self.parts.mouse
    }

    pub fn irq_kbd(&self) -> &Pin {
        &self.parts.irq_kbd
    }

    pub fn irq_mouse(&self) -> &Pin {
        &self.parts.irq_mouse
    }

    pub fn a20_out(&self) -> &Pin {
        &self.parts.a20_out
    }

    /// The register window, available once the controller is realized.
    pub fn region(&self) -> Option<MemoryRegion> {
        self.state.region.get().cloned()
    }

    pub fn write_cmd(&self) -> u8 {
        self.state.write_cmd.get()
    }

    pub fn status(&self) -> Status {
        self.state.status.get()
    }

    pub fn mode(&self) -> Mode {
        self.state.mode.get()
    }

    pub fn outport(&self) -> Outport {
        self.state.outport.get()
    }

    pub fn pending(&self) -> Pending {
        self.state.pending.get()
    }

    pub fn it_shift(&self) -> i32 {
        self.state.it_shift.get()
    }

    pub fn addr_size(&self) -> i32 {
        self.state.addr_size.get()
    }

    /// Replaces where system reset requests go. Defaults to the model's reset latch.
    pub fn set_reset_sink(&self, sink: impl PlatformResetSink + 'static) {
        *self.state.reset_sink.borrow_mut() = Some(Box::new(sink));
    }

    fn request_system_reset(&self) {
        tracing::debug!("i8042: requesting system reset");
        if let Some(sink) = self.state.reset_sink.borrow_mut().as_mut() {
            sink.request_reset(ResetKind::System);
        }
    }

    /// Interrupt levels implied by `pending` and `mode`.
    ///
    /// Mouse data only wins when the keyboard has nothing pending. A disabled keyboard still
    /// reports OBF but never asserts its interrupt.
    fn irq_levels(&self) -> (bool, bool) {
        let mode = self.mode();
        let pending = self.pending();
        if pending.is_empty() {
            (false, false)
        } else if pending == Pending::AUX {
            (false, mode.contains(Mode::MOUSE_INT))
        } else {
            (
                mode.contains(Mode::KBD_INT) && !mode.contains(Mode::DISABLE_KBD),
                false,
            )
        }
    }

    fn drive_irqs(&self) {
        let (kbd, mouse) = self.irq_levels();
        self.parts.irq_kbd.set_level(kbd);
        self.parts.irq_mouse.set_level(mouse);
    }

    /// Recomputes both OBF bits and the two interrupt outputs.
    pub fn update_irq(&self) {
        let mut status = self.status() - (Status::OBF | Status::MOUSE_OBF);
        let mut outport = self.outport() - (Outport::OBF | Outport::MOUSE_OBF);
        let pending = self.pending();
        if !pending.is_empty() {
            status |= Status::OBF;
            outport |= Outport::OBF;
            if pending == Pending::AUX {
                status |= Status::MOUSE_OBF;
                outport |= Outport::MOUSE_OBF;
            }
        }
        self.state.status.set(status);
        self.state.outport.set(outport);
        self.drive_irqs();
    }

    fn set_pending(&self, source: Pending, level: bool) {
        let mut pending = self.pending();
        pending.set(source, level);
        self.state.pending.set(pending);
        self.update_irq();
    }

    fn queue(&self, byte: u8, aux: bool) {
        if aux {
            self.parts.mouse.queue(byte);
        } else {
            self.parts.kbd.queue(byte);
        }
    }

    pub fn read_status(&self) -> u8 {
        let val = self.status().bits();
        tracing::debug!(val, "i8042: read status");
        val
    }

    pub fn read_data(&self) -> u8 {
        let val = if self.pending() == Pending::AUX {
            self.parts.mouse.read_data()
        } else {
            self.parts.kbd.read_data()
        };
        tracing::debug!(val, "i8042: read data");
        val
    }

    pub fn write_command(&self, val: u8) {
        tracing::debug!(val, "i8042: write command");

        // Bits 3..0 of the output port may be pulsed low for about 6us. Only bit 0 is wired (to
        // system reset) and the pulse is modeled as an immediate request.
        let val = if val & cmd::PULSE_BITS_3_0 == cmd::PULSE_BITS_3_0 {
            if val & 1 == 0 {
                cmd::RESET
            } else {
                cmd::NO_OP
            }
        } else {
            val
        };

        match val {
            cmd::READ_MODE => self.queue(self.mode().bits(), false),
            cmd::WRITE_MODE
            | cmd::WRITE_OBUF
            | cmd::WRITE_AUX_OBUF
            | cmd::WRITE_MOUSE
            | cmd::WRITE_OUTPORT => self.state.write_cmd.set(val),
            cmd::MOUSE_DISABLE => self.state.mode.set(self.mode() | Mode::DISABLE_MOUSE),
            cmd::MOUSE_ENABLE => self.state.mode.set(self.mode() - Mode::DISABLE_MOUSE),
            cmd::TEST_MOUSE | cmd::KBD_TEST | cmd::READ_INPORT => self.queue(0x00, false),
            cmd::SELF_TEST => {
                self.state.status.set(self.status() | Status::SELFTEST);
                self.queue(0x55, false);
            }
            cmd::KBD_DISABLE => {
                self.state.mode.set(self.mode() | Mode::DISABLE_KBD);
                self.update_irq();
            }
            cmd::KBD_ENABLE => {
                self.state.mode.set(self.mode() - Mode::DISABLE_KBD);
                self.update_irq();
            }
            cmd::READ_OUTPORT => self.queue(self.outport().bits(), false),
            cmd::ENABLE_A20 => {
                self.parts.a20_out.raise();
                self.state.outport.set(self.outport() | Outport::A20);
            }
            cmd::DISABLE_A20 => {
                self.parts.a20_out.lower();
                self.state.outport.set(self.outport() - Outport::A20);
            }
            cmd::RESET => self.request_system_reset(),
            cmd::NO_OP => {}
            _ => tracing::warn!(cmd = val, "i8042: unsupported keyboard controller command"),
        }
    }

    pub fn write_data(&self, val: u8) {
        tracing::debug!(val, write_cmd = self.write_cmd(), "i8042: write data");

        match self.write_cmd() {
            0 => self.parts.kbd.write(val),
            cmd::WRITE_MODE => {
                let mode = Mode::from_bits_retain(val);
                self.state.mode.set(mode);
                self.parts.kbd.set_translation(mode.contains(Mode::KCC));
                self.update_irq();
            }
            cmd::WRITE_OBUF => self.queue(val, false),
            cmd::WRITE_AUX_OBUF => self.queue(val, true),
            cmd::WRITE_OUTPORT => self.write_outport(val),
            cmd::WRITE_MOUSE => self.parts.mouse.write(val),
            _ => {}
        }
        self.state.write_cmd.set(0);
    }

    fn write_outport(&self, val: u8) {
        let outport = Outport::from_bits_retain(val);
        self.state.outport.set(outport);
        self.parts.a20_out.set_level(outport.contains(Outport::A20));
        if !outport.contains(Outport::RESET) {
            self.request_system_reset();
        }
    }

    /// Wiggles the mouse so a guest probing for it sees activity.
    pub fn mouse_fake_event(&self) {
        self.parts.mouse.fake_event();
    }

    /// Resets both sub-devices, then the controller registers.
    pub fn reset(&self) {
        self.parts.kbd.reset();
        self.parts.mouse.reset();
        self.state.mode.set(Mode::KBD_INT | Mode::MOUSE_INT);
        self.state.status.set(Status::CMD | Status::UNLOCKED);
        self.state.outport.set(Outport::RESET | Outport::A20);
        self.state.pending.set(Pending::empty());
        self.state.write_cmd.set(0);
        self.update_irq();
    }

    fn post_load(&self) {
        let mut outport = Outport::RESET;
        if self.parts.a20_out.level() {
            outport |= Outport::A20;
        }
        self.state.outport.set(outport);
        self.update_irq();
    }
}

const TAG_WRITE_CMD: u16 = 1;
const TAG_STATUS: u16 = 2;
const TAG_MODE: u16 = 3;
const TAG_PENDING: u16 = 4;
const TAG_OUTPORT: u16 = 5;
const TAG_KEYBOARD: u16 = 6;
const TAG_MOUSE: u16 = 7;

/// Full controller state, including both PS/2 FIFOs. The registry section ([`VMSTATE_I8042`])
/// only carries the four controller registers.
impl IoSnapshot for I8042 {
    const DEVICE_ID: [u8; 4] = *b"8042";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(3, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u8(TAG_WRITE_CMD, self.write_cmd());
        w.field_u8(TAG_STATUS, self.status().bits());
        w.field_u8(TAG_MODE, self.mode().bits());
        w.field_u8(TAG_PENDING, self.pending().bits());
        w.field_u8(TAG_OUTPORT, self.outport().bits());
        w.field_bytes(TAG_KEYBOARD, self.parts.kbd.save());
        w.field_bytes(TAG_MOUSE, self.parts.mouse.save());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        let write_cmd = r.u8(TAG_WRITE_CMD)?.unwrap_or(0);
        let status = Status::from_bits_retain(r.u8(TAG_STATUS)?.unwrap_or(0));
        let mode = Mode::from_bits_retain(r.u8(TAG_MODE)?.unwrap_or(0));
        let pending = Pending::from_bits(r.u8(TAG_PENDING)?.unwrap_or(0))
            .ok_or(SnapshotError::InvalidFieldEncoding("i8042 pending"))?;
        let outport = r.u8(TAG_OUTPORT)?.map(Outport::from_bits_retain);

        // Sub-devices go first: restoring their FIFOs drives the irq pins, whose notifiers
        // rewrite `pending`. The saved registers are applied on top afterwards.
        if let Some(buf) = r.bytes(TAG_KEYBOARD) {
            self.parts.kbd.load(buf)?;
        }
        if let Some(buf) = r.bytes(TAG_MOUSE) {
            self.parts.mouse.load(buf)?;
        }

        self.state.write_cmd.set(write_cmd);
        self.state.status.set(status);
        self.state.mode.set(mode);
        self.state.pending.set(pending);
        match outport {
            // A guest write to the output port may have left its OBF bits stale; keep them.
            Some(outport) => {
                self.state.outport.set(outport);
                self.parts.a20_out.set_level(outport.contains(Outport::A20));
                self.drive_irqs();
            }
            None => self.post_load(),
        }
        Ok(())
    }
}

fn controller(obj: &Object) -> Rc<I8042State> {
    prop_state::<I8042State>(obj)
}

fn get_write_cmd(obj: &Object) -> u64 {
    u64::from(controller(obj).write_cmd.get())
}
fn set_write_cmd(obj: &Object, v: u64) {
    controller(obj).write_cmd.set(v as u8);
}
fn get_status(obj: &Object) -> u64 {
    u64::from(controller(obj).status.get().bits())
}
fn set_status(obj: &Object, v: u64) {
    controller(obj).status.set(Status::from_bits_retain(v as u8));
}
fn get_mode(obj: &Object) -> u64 {
    u64::from(controller(obj).mode.get().bits())
}
fn set_mode(obj: &Object, v: u64) {
    controller(obj).mode.set(Mode::from_bits_retain(v as u8));
}
fn get_pending(obj: &Object) -> u64 {
    u64::from(controller(obj).pending.get().bits())
}
fn set_pending(obj: &Object, v: u64) {
    controller(obj).pending.set(Pending::from_bits_truncate(v as u8));
}

fn vmstate_post_load(obj: &Object, _version: u16) -> SnapshotResult<()> {
    let ctrl = I8042::from_object(obj)
        .map_err(|_| SnapshotError::InvalidFieldEncoding("pckbd opaque"))?;
    ctrl.post_load();
    Ok(())
}

static VMSTATE_I8042_FIELDS: [VmStateField<Object>; 4] = [
    VmStateField {
        name: "write_cmd",
        kind: VmFieldKind::U8,
        get: get_write_cmd,
        set: set_write_cmd,
    },
    VmStateField {
        name: "status",
        kind: VmFieldKind::U8,
        get: get_status,
        set: set_status,
    },
    VmStateField {
        name: "mode",
        kind: VmFieldKind::U8,
        get: get_mode,
        set: set_mode,
    },
    VmStateField {
        name: "pending",
        kind: VmFieldKind::U8,
        get: get_pending,
        set: set_pending,
    },
];

pub static VMSTATE_I8042: VmStateDescription<Object> = VmStateDescription {
    name: "pckbd",
    device_id: *b"8042",
    version_id: 3,
    minimum_version_id: 3,
    minimum_version_id_old: 3,
    fields: &VMSTATE_I8042_FIELDS,
    post_load: Some(vmstate_post_load),
};

/// Register window handler. Holds the controller weakly; the controller owns the region.
struct I8042Mmio {
    owner: WeakObject,
    it_shift: u32,
}

impl I8042Mmio {
    fn controller(&self) -> Option<I8042> {
        self.owner
            .upgrade()
            .and_then(|obj| I8042::from_object(&obj).ok())
    }

    fn is_command(&self, offset: u64) -> bool {
        (offset >> self.it_shift) & 1 == 1
    }
}

impl MmioHandler for I8042Mmio {
    fn read(&mut self, offset: u64, _size: usize) -> u64 {
        let Some(ctrl) = self.controller() else {
            return 0xFF;
        };
        let val = if self.is_command(offset) {
            ctrl.read_status()
        } else {
            ctrl.read_data()
        };
        u64::from(val)
    }

    fn write(&mut self, offset: u64, _size: usize, value: u64) {
        let Some(ctrl) = self.controller() else {
            return;
        };
        let val = (value & 0xFF) as u8;
        if self.is_command(offset) {
            ctrl.write_command(val);
        } else {
            ctrl.write_data(val);
        }
    }
}

fn new_i8042_state() -> Rc<dyn Any> {
    Rc::new(I8042State::default())
}

fn i8042_initfn(model: &DeviceModel, obj: &Object) -> Result<()> {
    let state = controller(obj);
    *state.reset_sink.borrow_mut() = Some(Box::new(model.reset_latch().clone()));

    let irq_kbd = model.new_pin()?;
    let irq_mouse = model.new_pin()?;
    let a20_out = model.new_pin()?;
    obj.property_add_child("irq_kbd", irq_kbd.object())?;
    obj.property_add_child("irq_mouse", irq_mouse.object())?;
    obj.property_add_child("a20_out", a20_out.object())?;

    let kbd = model.new_device(TYPE_PS2_KBD)?;
    let mouse = model.new_device(TYPE_PS2_MOUSE)?;
    obj.property_add_child("kbd", kbd.object())?;
    obj.property_add_child("mouse", mouse.object())?;
    model.prop_set_globals(&kbd)?;
    model.prop_set_globals(&mouse)?;

    let parts = Parts {
        kbd: Ps2Keyboard::from_object(kbd.object())?,
        mouse: Ps2Mouse::from_object(mouse.object())?,
        irq_kbd,
        irq_mouse,
        a20_out,
    };
    let _ = state.parts.set(Rc::new(parts));
    Ok(())
}

fn realize_failed(dev: &Device, reason: String) -> DevModelError {
    DevModelError::RealizeFailed {
        type_name: dev.type_name().to_string(),
        reason,
    }
}

fn i8042_realize(model: &DeviceModel, dev: &Device) -> Result<()> {
    let ctrl = I8042::from_object(dev.object())?;

    let it_shift = u32::try_from(ctrl.it_shift())
        .ok()
        .filter(|&s| s < 63)
        .ok_or_else(|| realize_failed(dev, format!("invalid it_shift {}", ctrl.it_shift())))?;
    let size = u64::try_from(ctrl.addr_size())
        .ok()
        .filter(|&s| s > 0)
        .ok_or_else(|| realize_failed(dev, format!("invalid addr_size {}", ctrl.addr_size())))?;

    model.realize(ctrl.keyboard().device())?;
    model.realize(ctrl.mouse().device())?;

    let region = MemoryRegion::new_io(
        "i8042",
        size,
        I8042Mmio {
            owner: dev.downgrade(),
            it_shift,
        },
    );
    let _ = ctrl.state.region.set(region);

    for (port, source) in [
        (ctrl.keyboard().port(), Pending::KBD),
        (ctrl.mouse().port(), Pending::AUX),
    ] {
        let owner = dev.downgrade();
        port.irq().add_level_change_notifier(move |pin| {
            if let Some(ctrl) = owner.upgrade().and_then(|o| I8042::from_object(&o).ok()) {
                ctrl.set_pending(source, pin.level());
            }
        });
    }
    Ok(())
}

fn i8042_class_init(class: &mut ObjectClass) {
    class.device.desc = Some("i8042 PS/2 keyboard and mouse controller");
    class.device.init = Some(i8042_realize);
    class.device.reset = Some(|dev| {
        if let Ok(ctrl) = I8042::from_object(dev.object()) {
            ctrl.reset();
        }
    });
    class.device.vmsd = Some(&VMSTATE_I8042);
    class.device.props.extend([
        define_prop_int32!("it_shift", I8042State, it_shift, 2),
        define_prop_int32!("addr_size", I8042State, addr_size, 8),
    ]);
}

pub(crate) fn i8042_type_info() -> TypeInfo {
    TypeInfo {
        instance_state: Some(new_i8042_state),
        instance_init: Some(i8042_initfn),
        class_init: Some(i8042_class_init),
        ..TypeInfo::new(TYPE_I8042, Some(TYPE_DEVICE))
    }
}

/// Standard PC wiring: the controller on the main system bus with its window at port 0x60 of
/// `io_space`, keyboard and mouse interrupts on the given lines and the A20 gate on `a20_line`.
pub fn i8042_init(
    model: &DeviceModel,
    io_space: &MemoryRegion,
    irq_kbd: Rc<dyn IrqLine>,
    irq_mouse: Rc<dyn IrqLine>,
    a20_line: Rc<dyn IrqLine>,
) -> Result<I8042> {
    crate::register_types(model)?;
    let dev = model.create(None, TYPE_I8042)?;
    let ctrl = I8042::from_object(dev.object())?;
    ctrl.irq_kbd().connect(irq_kbd);
    ctrl.irq_mouse().connect(irq_mouse);
    model.realize(&dev)?;
    ctrl.reset();

    if let Some(region) = ctrl.region() {
        io_space.add_subregion_overlap(0x60, &region, 0);
    }
    ctrl.a20_out().connect(a20_line);
    Ok(ctrl)
}

/// Memory-mapped variant used by boards that put the controller in their physical address map.
pub fn i8042_mm_init(
    model: &DeviceModel,
    address_space: &MemoryRegion,
    kbd_irq: Rc<dyn IrqLine>,
    mouse_irq: Rc<dyn IrqLine>,
    base: u64,
    size: u64,
    it_shift: i32,
) -> Result<I8042> {
    crate::register_types(model)?;
    let dev = model.create(None, TYPE_I8042)?;
    let size = i32::try_from(size).map_err(|_| DevModelError::InvalidParameter {
        property: "addr_size".to_string(),
        value: size.to_string(),
    })?;
    model.prop_parse(&dev, "it_shift", &it_shift.to_string())?;
    model.prop_parse(&dev, "addr_size", &size.to_string())?;
    model.realize(&dev)?;

    let ctrl = I8042::from_object(dev.object())?;
    ctrl.irq_kbd().connect(kbd_irq);
    ctrl.irq_mouse().connect(mouse_irq);
    ctrl.reset();
    if let Some(region) = ctrl.region() {
        address_space.add_subregion(base, &region);
    }
    Ok(ctrl)
}
