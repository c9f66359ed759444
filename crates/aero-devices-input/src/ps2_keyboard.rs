use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use aero_devmodel::{prop_state, Object, Result, TypeInfo};
use aero_io_snapshot::io::state::codec::{Decoder, Encoder};
use aero_io_snapshot::io::state::{SnapshotError, SnapshotResult};

use crate::ps2::{Ps2Port, TYPE_PS2_DEVICE};

pub const TYPE_PS2_KBD: &str = "ps2-kbd";

const KBD_REPLY_ACK: u8 = 0xFA;
const KBD_REPLY_POR: u8 = 0xAA;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpectingData {
    LedState,
    Typematic,
    ScancodeSet,
}

impl ExpectingData {
    fn to_u8(self) -> u8 {
        match self {
            Self::LedState => 1,
            Self::Typematic => 2,
            Self::ScancodeSet => 3,
        }
    }

    fn from_u8(v: u8) -> SnapshotResult<Option<Self>> {
        Ok(match v {
            0 => None,
            1 => Some(Self::LedState),
            2 => Some(Self::Typematic),
            3 => Some(Self::ScancodeSet),
            _ => return Err(SnapshotError::InvalidFieldEncoding("ps2 keyboard pending command")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyboardRegs {
    scancode_set: u8,
    leds: u8,
    typematic: u8,
    scanning_enabled: bool,
    translate: bool,
    expecting_data: Option<ExpectingData>,
}

impl Default for KeyboardRegs {
    fn default() -> Self {
        Self {
            scancode_set: 2,
            leds: 0,
            typematic: 0x0B,
            scanning_enabled: true,
            translate: false,
            expecting_data: None,
        }
    }
}

impl KeyboardRegs {
    fn set_defaults(&mut self) {
        self.scancode_set = 2;
        self.typematic = 0x0B;
        self.leds = 0;
        self.scanning_enabled = true;
    }

    /// Handles one byte from the controller, appending the replies to `out`.
    fn receive_byte(&mut self, byte: u8, out: &mut Vec<u8>) {
        if let Some(expecting) = self.expecting_data.take() {
            self.handle_data_byte(expecting, byte, out);
            return;
        }

        match byte {
            0xED => {
                // Set LEDs (next byte contains LED state).
                out.push(KBD_REPLY_ACK);
                self.expecting_data = Some(ExpectingData::LedState);
            }
            0xEE => out.push(0xEE),
            0xF0 => {
                // Get/Set scancode set (next byte selects).
                out.push(KBD_REPLY_ACK);
                self.expecting_data = Some(ExpectingData::ScancodeSet);
            }
            0xF2 => {
                // MF2 keyboard ID.
                out.extend_from_slice(&[KBD_REPLY_ACK, 0xAB, 0x83]);
            }
            0xF3 => {
                out.push(KBD_REPLY_ACK);
                self.expecting_data = Some(ExpectingData::Typematic);
            }
            0xF4 => {
                self.scanning_enabled = true;
                out.push(KBD_REPLY_ACK);
            }
            0xF5 => {
                self.scanning_enabled = false;
                out.push(KBD_REPLY_ACK);
            }
            0xF6 => {
                self.set_defaults();
                out.push(KBD_REPLY_ACK);
            }
            0xFF => {
                self.set_defaults();
                out.extend_from_slice(&[KBD_REPLY_ACK, KBD_REPLY_POR]);
            }
            _ => {
                // Most commands are ACKed even if unsupported.
                tracing::debug!(cmd = byte, "ps2 keyboard: acking unsupported command");
                out.push(KBD_REPLY_ACK);
            }
        }
    }

    fn handle_data_byte(&mut self, expecting: ExpectingData, byte: u8, out: &mut Vec<u8>) {
        match expecting {
            ExpectingData::LedState => {
                self.leds = byte & 0x07;
                out.push(KBD_REPLY_ACK);
            }
            ExpectingData::Typematic => {
                self.typematic = byte;
                out.push(KBD_REPLY_ACK);
            }
            ExpectingData::ScancodeSet => {
                if byte == 0 {
                    out.extend_from_slice(&[KBD_REPLY_ACK, self.scancode_set]);
                    return;
                }
                if (1..=3).contains(&byte) {
                    self.scancode_set = byte;
                }
                out.push(KBD_REPLY_ACK);
            }
        }
    }

    fn encode(&self, enc: Encoder) -> Encoder {
        enc.u8(self.scancode_set)
            .u8(self.leds)
            .u8(self.typematic)
            .bool(self.scanning_enabled)
            .bool(self.translate)
            .u8(self.expecting_data.map_or(0, ExpectingData::to_u8))
    }

    fn decode(d: &mut Decoder<'_>) -> SnapshotResult<Self> {
        Ok(Self {
            scancode_set: d.u8()?,
            leds: d.u8()?,
            typematic: d.u8()?,
            scanning_enabled: d.bool()?,
            translate: d.bool()?,
            expecting_data: ExpectingData::from_u8(d.u8()?)?,
        })
    }
}

#[derive(Default)]
pub struct Ps2KbdState {
    regs: RefCell<KeyboardRegs>,
}

/// PS/2 keyboard behind the controller's first port.
#[derive(Debug, Clone)]
pub struct Ps2Keyboard {
    port: Ps2Port,
    state: Rc<Ps2KbdState>,
}

impl fmt::Debug for Ps2KbdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.regs.borrow(), f)
    }
}

impl Deref for Ps2Keyboard {
    type Target = Ps2Port;

    fn deref(&self) -> &Ps2Port {
        &self.port
    }
}

impl Ps2Keyboard {
    pub fn from_object(obj: &Object) -> Result<Self> {
        obj.check_cast(TYPE_PS2_KBD)?;
        Ok(Self {
            port: Ps2Port::from_object(obj)?,
            state: prop_state::<Ps2KbdState>(obj),
        })
    }

    pub fn port(&self) -> &Ps2Port {
        &self.port
    }

    pub fn scancode_set(&self) -> u8 {
        self.state.regs.borrow().scancode_set
    }

    pub fn leds(&self) -> u8 {
        self.state.regs.borrow().leds
    }

    pub fn typematic(&self) -> u8 {
        self.state.regs.borrow().typematic
    }

    pub fn scanning_enabled(&self) -> bool {
        self.state.regs.borrow().scanning_enabled
    }

    pub fn translation(&self) -> bool {
        self.state.regs.borrow().translate
    }

    /// Set by the controller when the guest toggles scancode translation in the command byte.
    pub fn set_translation(&self, translate: bool) {
        self.state.regs.borrow_mut().translate = translate;
    }

    /// Receives a byte from the guest over the data port.
    pub fn write(&self, byte: u8) {
        let mut out = Vec::new();
        self.state.regs.borrow_mut().receive_byte(byte, &mut out);
        // Queueing raises the irq, which may call back into the controller.
        for b in out {
            self.port.queue(b);
        }
    }

    /// Host key input. Dropped while scanning is disabled.
    pub fn put_keycode(&self, keycode: u8) {
        if !self.scanning_enabled() {
            return;
        }
        self.port.queue(keycode);
    }

    pub fn put_keycodes(&self, keycodes: &[u8]) {
        for &k in keycodes {
            self.put_keycode(k);
        }
    }

    pub fn reset(&self) {
        self.port.reset_queue();
        *self.state.regs.borrow_mut() = KeyboardRegs::default();
    }

    pub(crate) fn save(&self) -> Vec<u8> {
        let enc = self.state.regs.borrow().encode(Encoder::new());
        self.port.save_queue(enc).finish()
    }

    /// Decodes the whole blob before applying anything.
    pub(crate) fn load(&self, bytes: &[u8]) -> SnapshotResult<()> {
        let mut d = Decoder::new(bytes);
        let regs = KeyboardRegs::decode(&mut d)?;
        let (last, queue) = Ps2Port::decode_queue(&mut d)?;
        d.finish()?;

        *self.state.regs.borrow_mut() = regs;
        self.port.restore_queue(last, queue);
        Ok(())
    }
}

fn new_kbd_state() -> Rc<dyn Any> {
    Rc::new(Ps2KbdState::default())
}

pub(crate) fn ps2_kbd_type_info() -> TypeInfo {
    TypeInfo {
        instance_state: Some(new_kbd_state),
        class_init: Some(|class| {
            class.device.desc = Some("PS/2 keyboard");
            class.device.reset = Some(|dev| {
                if let Ok(kbd) = Ps2Keyboard::from_object(dev.object()) {
                    kbd.reset();
                }
            });
        }),
        ..TypeInfo::new(TYPE_PS2_KBD, Some(TYPE_PS2_DEVICE))
    }
}
