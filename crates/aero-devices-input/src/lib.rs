//! PC input devices: the i8042 controller and the PS/2 keyboard and mouse behind it.

#![forbid(unsafe_code)]

mod i8042;
mod ps2;
mod ps2_keyboard;
mod ps2_mouse;

use aero_devmodel::{DeviceModel, Result};

pub use i8042::{
    cmd, i8042_init, i8042_mm_init, I8042State, Mode, Outport, Pending, Status, I8042, TYPE_I8042,
    VMSTATE_I8042,
};
pub use ps2::{Ps2Common, Ps2Port, PS2_QUEUE_SIZE, TYPE_PS2_DEVICE};
pub use ps2_keyboard::{Ps2KbdState, Ps2Keyboard, TYPE_PS2_KBD};
pub use ps2_mouse::{MouseStatus, Ps2Mouse, Ps2MouseState, TYPE_PS2_MOUSE};

/// Registers the PS/2 and i8042 types with `model`. Types already present are left alone, so
/// board code may call this once per controller.
pub fn register_types(model: &DeviceModel) -> Result<()> {
    for info in [
        ps2::ps2_device_type_info(),
        ps2_keyboard::ps2_kbd_type_info(),
        ps2_mouse::ps2_mouse_type_info(),
        i8042::i8042_type_info(),
    ] {
        if !model.exists(info.name) {
            model.register_type(info)?;
        }
    }
    Ok(())
}
