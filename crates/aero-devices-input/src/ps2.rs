//! Plumbing shared by the PS/2 keyboard and mouse: the byte FIFO towards the controller and the
//! interrupt pin that reflects whether it holds data.

use std::any::Any;
use std::cell::{Cell, OnceCell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use aero_devmodel::{
    prop_state, DevModelError, Device, DeviceModel, Object, Pin, Result, TypeInfo, TYPE_DEVICE,
};
use aero_io_snapshot::io::state::codec::{Decoder, Encoder};
use aero_io_snapshot::io::state::{SnapshotError, SnapshotResult};

pub const TYPE_PS2_DEVICE: &str = "ps2-device";

/// Bytes beyond this many are dropped until the controller drains the FIFO.
pub const PS2_QUEUE_SIZE: usize = 256;

#[derive(Default)]
pub struct Ps2Common {
    queue: RefCell<VecDeque<u8>>,
    last: Cell<u8>,
    irq: OnceCell<Pin>,
}

/// Handle to any PS/2 sub-device.
#[derive(Clone)]
pub struct Ps2Port {
    dev: Device,
    common: Rc<Ps2Common>,
    irq: Pin,
}

impl fmt::Debug for Ps2Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ps2Port")
            .field("type", &self.dev.type_name())
            .field("pending", &self.pending())
            .field("irq", &self.irq.level())
            .finish()
    }
}

impl Ps2Port {
    pub fn from_object(obj: &Object) -> Result<Self> {
        obj.check_cast(TYPE_PS2_DEVICE)?;
        let dev = Device::from_object(obj)?;
        let common = prop_state::<Ps2Common>(obj);
        let irq = common
            .irq
            .get()
            .cloned()
            .ok_or_else(|| DevModelError::TypeMismatch {
                name: obj.type_name().to_string(),
                expected: TYPE_PS2_DEVICE.to_string(),
            })?;
        Ok(Self { dev, common, irq })
    }

    pub fn device(&self) -> &Device {
        &self.dev
    }

    /// Raised while the FIFO holds data.
    pub fn irq(&self) -> &Pin {
        &self.irq
    }

    pub fn pending(&self) -> usize {
        self.common.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.common.queue.borrow().is_empty()
    }

    pub fn queue(&self, byte: u8) {
        {
            let mut q = self.common.queue.borrow_mut();
            if q.len() >= PS2_QUEUE_SIZE {
                tracing::debug!(device = self.dev.type_name(), byte, "ps2 queue full, dropping byte");
                return;
            }
            q.push_back(byte);
        }
        self.irq.raise();
    }

    /// Pops the next byte. An empty FIFO returns the previous byte again without touching the
    /// interrupt line.
    pub fn read_data(&self) -> u8 {
        let popped = self.common.queue.borrow_mut().pop_front();
        let Some(byte) = popped else {
            return self.common.last.get();
        };
        self.common.last.set(byte);
        // Pulse low so edge-triggered consumers see every byte.
        self.irq.lower();
        if !self.is_empty() {
            self.irq.raise();
        }
        byte
    }

    /// Empties the FIFO and lowers the interrupt line.
    pub fn reset_queue(&self) {
        self.common.queue.borrow_mut().clear();
        self.irq.lower();
    }

    pub(crate) fn save_queue(&self, enc: Encoder) -> Encoder {
        let q = self.common.queue.borrow();
        let mut enc = enc.u8(self.common.last.get()).u16(q.len() as u16);
        for &b in q.iter() {
            enc = enc.u8(b);
        }
        enc
    }

    pub(crate) fn decode_queue(d: &mut Decoder<'_>) -> SnapshotResult<(u8, VecDeque<u8>)> {
        let last = d.u8()?;
        let len = usize::from(d.u16()?);
        if len > PS2_QUEUE_SIZE {
            return Err(SnapshotError::InvalidFieldEncoding("ps2 queue length"));
        }
        Ok((last, d.bytes(len)?.iter().copied().collect()))
    }

    /// Replaces the FIFO and drives the interrupt line to match it.
    pub(crate) fn restore_queue(&self, last: u8, queue: VecDeque<u8>) {
        self.common.last.set(last);
        let level = !queue.is_empty();
        *self.common.queue.borrow_mut() = queue;
        self.irq.set_level(level);
    }
}

fn new_ps2_common() -> Rc<dyn Any> {
    Rc::new(Ps2Common::default())
}

fn ps2_initfn(model: &DeviceModel, obj: &Object) -> Result<()> {
    let irq = model.new_pin()?;
    obj.property_add_child("irq", irq.object())?;
    let _ = prop_state::<Ps2Common>(obj).irq.set(irq);
    Ok(())
}

pub(crate) fn ps2_device_type_info() -> TypeInfo {
    TypeInfo {
        is_abstract: true,
        instance_state: Some(new_ps2_common),
        instance_init: Some(ps2_initfn),
        class_init: Some(|class| {
            class.device.reset = Some(|dev| {
                if let Ok(port) = Ps2Port::from_object(dev.object()) {
                    port.reset_queue();
                }
            });
        }),
        ..TypeInfo::new(TYPE_PS2_DEVICE, Some(TYPE_DEVICE))
    }
}
