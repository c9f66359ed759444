//! A small emulator device model: typed objects and devices in a composition tree, interrupt
//! pins, the i8042 keyboard controller with its PS/2 keyboard and mouse, and a binary trace ring.
//!
//! Each part lives in its own crate; this crate only re-exports them under one roof.

#![forbid(unsafe_code)]

pub use aero_devices_input as input;
pub use aero_devmodel as devmodel;
pub use aero_io_snapshot as io_snapshot;
pub use aero_platform as platform;
pub use aero_trace as trace;

pub use aero_devmodel::{DevModelError, Device, DeviceModel, Object, PathLookup, Pin};
