use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use aero_devmodel::{prop_state, Object, Result, TypeInfo};
use aero_io_snapshot::io::state::codec::{Decoder, Encoder};
use aero_io_snapshot::io::state::{SnapshotError, SnapshotResult};
use bitflags::bitflags;

use crate::ps2::{Ps2Port, PS2_QUEUE_SIZE, TYPE_PS2_DEVICE};

pub const TYPE_PS2_MOUSE: &str = "ps2-mouse";

const AUX_SET_SCALE11: u8 = 0xE6;
const AUX_SET_SCALE21: u8 = 0xE7;
const AUX_SET_RES: u8 = 0xE8;
const AUX_GET_SCALE: u8 = 0xE9;
const AUX_SET_STREAM: u8 = 0xEA;
const AUX_POLL: u8 = 0xEB;
const AUX_RESET_WRAP: u8 = 0xEC;
const AUX_SET_WRAP: u8 = 0xEE;
const AUX_SET_REMOTE: u8 = 0xF0;
const AUX_GET_TYPE: u8 = 0xF2;
const AUX_SET_SAMPLE: u8 = 0xF3;
const AUX_ENABLE_DEV: u8 = 0xF4;
const AUX_DISABLE_DEV: u8 = 0xF5;
const AUX_SET_DEFAULT: u8 = 0xF6;
const AUX_RESET: u8 = 0xFF;

const AUX_ACK: u8 = 0xFA;

/// Mouse ids reported by GET_TYPE once the sample-rate knock sequences unlock them.
const MOUSE_TYPE_IMPS2: u8 = 3;
const MOUSE_TYPE_IMEX: u8 = 4;

bitflags! {
    /// Status byte reported by GET_SCALE.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MouseStatus: u8 {
        const SCALE21 = 0x10;
        const ENABLED = 0x20;
        const REMOTE = 0x40;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct MouseRegs {
    status: MouseStatus,
    resolution: u8,
    sample_rate: u8,
    wrap: bool,
    mouse_type: u8,
    detect_state: u8,
    dx: i32,
    dy: i32,
    dz: i32,
    buttons: u8,
    /// Command waiting for its argument byte.
    write_cmd: Option<u8>,
}

impl MouseRegs {
    fn receive_byte(&mut self, val: u8, out: &mut Vec<u8>) {
        match self.write_cmd.take() {
            Some(AUX_SET_SAMPLE) => {
                self.sample_rate = val;
                self.detect_extension(val);
                out.push(AUX_ACK);
            }
            Some(AUX_SET_RES) => {
                self.resolution = val;
                out.push(AUX_ACK);
            }
            Some(_) | None => self.command(val, out),
        }
    }

    fn command(&mut self, val: u8, out: &mut Vec<u8>) {
        if self.wrap {
            if val == AUX_RESET_WRAP {
                self.wrap = false;
                out.push(AUX_ACK);
                return;
            }
            if val != AUX_RESET {
                out.push(val);
                return;
            }
        }

        match val {
            AUX_SET_SCALE11 => {
                self.status.remove(MouseStatus::SCALE21);
                out.push(AUX_ACK);
            }
            AUX_SET_SCALE21 => {
                self.status.insert(MouseStatus::SCALE21);
                out.push(AUX_ACK);
            }
            AUX_SET_STREAM => {
                self.status.remove(MouseStatus::REMOTE);
                out.push(AUX_ACK);
            }
            AUX_SET_WRAP => {
                self.wrap = true;
                out.push(AUX_ACK);
            }
            AUX_SET_REMOTE => {
                self.status.insert(MouseStatus::REMOTE);
                out.push(AUX_ACK);
            }
            AUX_GET_TYPE => out.extend_from_slice(&[AUX_ACK, self.mouse_type]),
            AUX_SET_RES | AUX_SET_SAMPLE => {
                self.write_cmd = Some(val);
                out.push(AUX_ACK);
            }
            AUX_GET_SCALE => out.extend_from_slice(&[
                AUX_ACK,
                self.status.bits(),
                self.resolution,
                self.sample_rate,
            ]),
            AUX_POLL => {
                out.push(AUX_ACK);
                self.send_packet(out);
            }
            AUX_ENABLE_DEV => {
                self.status.insert(MouseStatus::ENABLED);
                out.push(AUX_ACK);
            }
            AUX_DISABLE_DEV => {
                self.status.remove(MouseStatus::ENABLED);
                out.push(AUX_ACK);
            }
            AUX_SET_DEFAULT => {
                self.set_defaults();
                out.push(AUX_ACK);
            }
            AUX_RESET => {
                self.set_defaults();
                self.mouse_type = 0;
                out.extend_from_slice(&[AUX_ACK, 0xAA, self.mouse_type]);
            }
            _ => tracing::warn!(cmd = val, "ps2 mouse: unsupported command"),
        }
    }

    fn set_defaults(&mut self) {
        self.sample_rate = 100;
        self.resolution = 2;
        self.status = MouseStatus::empty();
    }

    /// IntelliMouse knock: rates 200,100,80 unlock the wheel, 200,200,80 the extra buttons.
    fn detect_extension(&mut self, rate: u8) {
        self.detect_state = match (self.detect_state, rate) {
            (0, 200) => 1,
            (1, 100) => 2,
            (1, 200) => 3,
            (2, 80) => {
                self.mouse_type = MOUSE_TYPE_IMPS2;
                0
            }
            (3, 80) => {
                self.mouse_type = MOUSE_TYPE_IMEX;
                0
            }
            _ => 0,
        };
    }

    /// Emits one movement packet and subtracts what it reported from the accumulated deltas.
    fn send_packet(&mut self, out: &mut Vec<u8>) {
        let dx = self.dx.clamp(-127, 127);
        let dy = self.dy.clamp(-127, 127);
        let mut dz = self.dz;
        let b = 0x08 | (u8::from(dx < 0) << 4) | (u8::from(dy < 0) << 5) | (self.buttons & 0x07);
        out.extend_from_slice(&[b, dx as u8, dy as u8]);

        match self.mouse_type {
            MOUSE_TYPE_IMPS2 => {
                dz = dz.clamp(-127, 127);
                out.push(dz as u8);
            }
            MOUSE_TYPE_IMEX => {
                dz = dz.clamp(-7, 7);
                out.push((dz as u8 & 0x0F) | ((self.buttons & 0x18) << 1));
            }
            // Without a wheel the movement is reported as consumed.
            _ => {}
        }

        self.dx -= dx;
        self.dy -= dy;
        self.dz -= dz;
    }

    fn encode(&self, enc: Encoder) -> Encoder {
        enc.u8(self.status.bits())
            .u8(self.resolution)
            .u8(self.sample_rate)
            .bool(self.wrap)
            .u8(self.mouse_type)
            .u8(self.detect_state)
            .u32(self.dx as u32)
            .u32(self.dy as u32)
            .u32(self.dz as u32)
            .u8(self.buttons)
            .u8(self.write_cmd.unwrap_or(0))
    }

    fn decode(d: &mut Decoder<'_>) -> SnapshotResult<Self> {
        let status = MouseStatus::from_bits(d.u8()?)
            .ok_or(SnapshotError::InvalidFieldEncoding("ps2 mouse status"))?;
        Ok(Self {
            status,
            resolution: d.u8()?,
            sample_rate: d.u8()?,
            wrap: d.bool()?,
            mouse_type: d.u8()?,
            detect_state: d.u8()?,
            dx: d.u32()? as i32,
            dy: d.u32()? as i32,
            dz: d.u32()? as i32,
            buttons: d.u8()?,
            write_cmd: match d.u8()? {
                0 => None,
                cmd @ (AUX_SET_RES | AUX_SET_SAMPLE) => Some(cmd),
                _ => return Err(SnapshotError::InvalidFieldEncoding("ps2 mouse pending command")),
            },
        })
    }
}

#[derive(Default)]
pub struct Ps2MouseState {
    regs: RefCell<MouseRegs>,
}

impl fmt::Debug for Ps2MouseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.regs.borrow(), f)
    }
}

/// PS/2 mouse behind the controller's auxiliary port.
#[derive(Debug, Clone)]
pub struct Ps2Mouse {
    port: Ps2Port,
    state: Rc<Ps2MouseState>,
}

impl Deref for Ps2Mouse {
    type Target = Ps2Port;

    fn deref(&self) -> &Ps2Port {
        &self.port
    }
}

impl Ps2Mouse {
    pub fn from_object(obj: &Object) -> Result<Self> {
        obj.check_cast(TYPE_PS2_MOUSE)?;
        Ok(Self {
            port: Ps2Port::from_object(obj)?,
            state: prop_state::<Ps2MouseState>(obj),
        })
    }

    pub fn port(&self) -> &Ps2Port {
        &self.port
    }

    pub fn status(&self) -> MouseStatus {
        self.state.regs.borrow().status
    }

    pub fn reporting_enabled(&self) -> bool {
        self.status().contains(MouseStatus::ENABLED)
    }

    pub fn resolution(&self) -> u8 {
        self.state.regs.borrow().resolution
    }

    pub fn sample_rate(&self) -> u8 {
        self.state.regs.borrow().sample_rate
    }

    pub fn mouse_type(&self) -> u8 {
        self.state.regs.borrow().mouse_type
    }

    pub fn wrap_mode(&self) -> bool {
        self.state.regs.borrow().wrap
    }

    pub fn buttons(&self) -> u8 {
        self.state.regs.borrow().buttons
    }

    /// Receives a byte forwarded by the controller's WRITE_MOUSE command.
    pub fn write(&self, byte: u8) {
        let mut out = Vec::new();
        self.state.regs.borrow_mut().receive_byte(byte, &mut out);
        for b in out {
            self.port.queue(b);
        }
    }

    /// Host motion. `dy` is in screen orientation (down is positive) and is inverted for the
    /// guest. In stream mode large deltas are split over as many packets as needed.
    pub fn mouse_event(&self, dx: i32, dy: i32, dz: i32, buttons: u8) {
        let mut out = Vec::new();
        {
            let mut regs = self.state.regs.borrow_mut();
            if !regs.status.contains(MouseStatus::ENABLED) {
                return;
            }
            regs.dx = regs.dx.saturating_add(dx);
            regs.dy = regs.dy.saturating_sub(dy);
            regs.dz = regs.dz.saturating_add(dz);

            if dx == 0 && dy == 0 && dz == 0 && regs.buttons == buttons {
                return;
            }
            regs.buttons = buttons;

            if !regs.status.contains(MouseStatus::REMOTE)
                && self.port.pending() < PS2_QUEUE_SIZE - 16
            {
                let room = PS2_QUEUE_SIZE - 16 - self.port.pending();
                loop {
                    regs.send_packet(&mut out);
                    if regs.dx == 0 && regs.dy == 0 && regs.dz == 0 {
                        break;
                    }
                    // The rest stays accumulated for the next event or poll.
                    if out.len() >= room {
                        break;
                    }
                }
            }
        }
        for b in out {
            self.port.queue(b);
        }
    }

    /// Nudges the pointer by one unit, enough to make a polling driver notice the device.
    pub fn fake_event(&self) {
        self.mouse_event(1, 0, 0, 0);
    }

    pub fn reset(&self) {
        self.port.reset_queue();
        *self.state.regs.borrow_mut() = MouseRegs::default();
    }

    pub(crate) fn save(&self) -> Vec<u8> {
        let enc = self.state.regs.borrow().encode(Encoder::new());
        self.port.save_queue(enc).finish()
    }

    pub(crate) fn load(&self, bytes: &[u8]) -> SnapshotResult<()> {
        let mut d = Decoder::new(bytes);
        let regs = MouseRegs::decode(&mut d)?;
        let (last, queue) = Ps2Port::decode_queue(&mut d)?;
        d.finish()?;

        *self.state.regs.borrow_mut() = regs;
        self.port.restore_queue(last, queue);
        Ok(())
    }
}

fn new_mouse_state() -> Rc<dyn Any> {
    Rc::new(Ps2MouseState::default())
}

pub(crate) fn ps2_mouse_type_info() -> TypeInfo {
    TypeInfo {
        instance_state: Some(new_mouse_state),
        class_init: Some(|class| {
            class.device.desc = Some("PS/2 mouse");
            class.device.reset = Some(|dev| {
                if let Ok(mouse) = Ps2Mouse::from_object(dev.object()) {
                    mouse.reset();
                }
            });
        }),
        ..TypeInfo::new(TYPE_PS2_MOUSE, Some(TYPE_PS2_DEVICE))
    }
}

#[cfg(test)]
mod tests {
    use aero_devmodel::DeviceModel;

    use super::*;

    fn mouse() -> (DeviceModel, Ps2Mouse) {
        let model = DeviceModel::new();
        crate::register_types(&model).unwrap();
        let dev = model.new_device(TYPE_PS2_MOUSE).unwrap();
        let mouse = Ps2Mouse::from_object(dev.object()).unwrap();
        (model, mouse)
    }

    fn drain(mouse: &Ps2Mouse) -> Vec<u8> {
        let mut out = Vec::new();
        while !mouse.is_empty() {
            out.push(mouse.read_data());
        }
        out
    }

    #[test]
    fn motion_is_ignored_until_reporting_is_enabled() {
        let (_model, mouse) = mouse();
        mouse.fake_event();
        assert!(mouse.is_empty());

        mouse.write(AUX_ENABLE_DEV);
        assert_eq!(drain(&mouse), [AUX_ACK]);
        mouse.fake_event();
        assert_eq!(drain(&mouse), [0x08, 0x01, 0x00]);
    }

    #[test]
    fn packets_invert_y_and_split_large_deltas() {
        let (_model, mouse) = mouse();
        mouse.write(AUX_ENABLE_DEV);
        drain(&mouse);

        mouse.mouse_event(-3, 5, 0, 0x01);
        assert_eq!(drain(&mouse), [0x08 | 0x10 | 0x20 | 0x01, 0xFD, 0xFB]);

        mouse.mouse_event(200, 0, 0, 0x01);
        assert_eq!(drain(&mouse), [0x09, 127, 0, 0x09, 73, 0]);
    }

    #[test]
    fn remote_mode_accumulates_until_polled() {
        let (_model, mouse) = mouse();
        mouse.write(AUX_ENABLE_DEV);
        mouse.write(AUX_SET_REMOTE);
        drain(&mouse);

        mouse.mouse_event(4, 0, 0, 0);
        assert!(mouse.is_empty());
        mouse.write(AUX_POLL);
        assert_eq!(drain(&mouse), [AUX_ACK, 0x08, 4, 0]);
    }

    #[test]
    fn settings_are_reported_by_get_scale() {
        let (_model, mouse) = mouse();
        mouse.write(AUX_SET_RES);
        mouse.write(3);
        mouse.write(AUX_SET_SAMPLE);
        mouse.write(40);
        mouse.write(AUX_SET_SCALE21);
        mouse.write(AUX_GET_SCALE);
        assert_eq!(
            drain(&mouse),
            [AUX_ACK, AUX_ACK, AUX_ACK, AUX_ACK, AUX_ACK, AUX_ACK, 0x10, 3, 40]
        );

        mouse.write(AUX_RESET);
        assert_eq!(drain(&mouse), [AUX_ACK, 0xAA, 0x00]);
        assert_eq!(mouse.sample_rate(), 100);
        assert_eq!(mouse.resolution(), 2);
    }

    #[test]
    fn wheel_knock_switches_to_imps2() {
        let (_model, mouse) = mouse();
        for rate in [200, 100, 80] {
            mouse.write(AUX_SET_SAMPLE);
            mouse.write(rate);
        }
        drain(&mouse);
        mouse.write(AUX_GET_TYPE);
        assert_eq!(drain(&mouse), [AUX_ACK, MOUSE_TYPE_IMPS2]);

        mouse.write(AUX_ENABLE_DEV);
        drain(&mouse);
        mouse.mouse_event(0, 0, -1, 0);
        assert_eq!(drain(&mouse), [0x08, 0, 0, 0xFF]);
    }

    #[test]
    fn wrap_mode_echoes_until_reset_wrap() {
        let (_model, mouse) = mouse();
        mouse.write(AUX_SET_WRAP);
        mouse.write(0x42);
        mouse.write(AUX_ENABLE_DEV);
        assert!(!mouse.reporting_enabled());
        mouse.write(AUX_RESET_WRAP);
        assert!(!mouse.wrap_mode());
        assert_eq!(drain(&mouse), [AUX_ACK, 0x42, AUX_ENABLE_DEV, AUX_ACK]);
    }
}
