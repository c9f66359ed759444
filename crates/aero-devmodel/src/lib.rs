//! Device model core: runtime types, objects with properties, devices and buses arranged in a
//! composition tree, interrupt pins, and the machine context tying them together.
//!
//! ```
//! use aero_devmodel::{DeviceModel, PathLookup};
//!
//! let model = DeviceModel::new();
//! let sysbus = model.main_system_bus();
//! assert_eq!(model.canonical_path(sysbus.object()), "/sysbus");
//! assert_eq!(model.resolve_path("sysbus"), PathLookup::Found(sysbus.object().clone()));
//! ```
#![forbid(unsafe_code)]

mod bus;
mod device;
mod error;
mod globals;
mod model;
mod object;
mod path;
mod pin;
mod property;
mod types;

pub use bus::{walk_bus_children, walk_device_children, Bus, BusState, Walk};
pub use device::{DevState, Device, DeviceState, GpioHandler};
pub use error::{DevModelError, Result};
pub use globals::{DeviceModelConfig, GlobalProperty, GlobalPropertyParseError};
pub use model::DeviceModel;
pub use object::{Lifecycle, Object, WeakObject};
pub use path::PathLookup;
pub use pin::{Pin, PinNotifier, PinState, TYPE_PIN};
pub use property::{
    prop_state, LinkSlot, PropGetter, PropRelease, PropSetter, PropValue, Property, PropertyDef,
    PropertyType, StrGetter, StrSetter,
};
pub use types::{
    BusClass, ClassInitFn, DeviceClass, InstanceFinalizeFn, InstanceInitFn, ObjectClass,
    StateFactory, TypeInfo, TypeRegistry,
};

pub const TYPE_OBJECT: &str = "object";
pub const TYPE_CONTAINER: &str = "container";
pub const TYPE_DEVICE: &str = "device";
pub const TYPE_BUS: &str = "bus";
pub const TYPE_SYSTEM_BUS: &str = "System";
