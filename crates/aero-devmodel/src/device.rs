//! Devices: objects that sit on a bus, own child buses and go through a realize step.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use aero_io_snapshot::io::state::{SectionId, VmStateSection};
use aero_platform::interrupts::IrqLine;

use crate::bus::Bus;
use crate::error::{DevModelError, Result};
use crate::model::DeviceModel;
use crate::object::Object;
use crate::pin::Pin;
use crate::property::{LinkSlot, PropertyDef};
use crate::types::TypeInfo;
use crate::{TYPE_BUS, TYPE_DEVICE, TYPE_OBJECT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevState {
    Created,
    Initialized,
}

/// Handler behind an input GPIO line: `(device, line index, level)`.
pub type GpioHandler = fn(&Device, usize, bool);

/// Per-instance state shared by every device.
pub struct DeviceState {
    id: RefCell<Option<String>>,
    pub(crate) parent_bus: LinkSlot,
    pub(crate) child_buses: RefCell<Vec<Bus>>,
    pub(crate) num_child_bus: Cell<u32>,
    gpio_in: RefCell<Vec<Pin>>,
    gpio_out: RefCell<Vec<Pin>>,
    hotplugged: Cell<bool>,
    state: Cell<DevState>,
    instance_id_alias: Cell<i32>,
    alias_required_for_version: Cell<u16>,
    snapshot: Cell<Option<SectionId>>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            id: RefCell::new(None),
            parent_bus: LinkSlot::new(),
            child_buses: RefCell::new(Vec::new()),
            num_child_bus: Cell::new(0),
            gpio_in: RefCell::new(Vec::new()),
            gpio_out: RefCell::new(Vec::new()),
            hotplugged: Cell::new(false),
            state: Cell::new(DevState::Created),
            instance_id_alias: Cell::new(-1),
            alias_required_for_version: Cell::new(0),
            snapshot: Cell::new(None),
        }
    }
}

impl DeviceState {
    pub fn dev_state(&self) -> DevState {
        self.state.get()
    }
}

/// Typed handle to a device object. Derefs to the underlying [`Object`].
#[derive(Clone)]
pub struct Device {
    obj: Object,
    state: Rc<DeviceState>,
}

impl Deref for Device {
    type Target = Object;

    fn deref(&self) -> &Object {
        &self.obj
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.obj == other.obj
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("type", &self.obj.type_name())
            .field("id", &self.id())
            .field("state", &self.dev_state())
            .finish()
    }
}

impl Device {
    pub fn from_object(obj: &Object) -> Result<Self> {
        obj.check_cast(TYPE_DEVICE)?;
        let state = obj
            .state::<DeviceState>()
            .ok_or_else(|| DevModelError::TypeMismatch {
                name: obj.type_name().to_string(),
                expected: TYPE_DEVICE.to_string(),
            })?;
        Ok(Self {
            obj: obj.clone(),
            state,
        })
    }

    pub fn object(&self) -> &Object {
        &self.obj
    }

    pub(crate) fn device_state(&self) -> &Rc<DeviceState> {
        &self.state
    }

    pub fn id(&self) -> Option<String> {
        self.state.id.borrow().clone()
    }

    pub fn set_id(&self, id: Option<&str>) {
        *self.state.id.borrow_mut() = id.map(str::to_string);
    }

    pub fn dev_state(&self) -> DevState {
        self.state.dev_state()
    }

    pub fn is_realized(&self) -> bool {
        self.dev_state() == DevState::Initialized
    }

    pub fn hotplugged(&self) -> bool {
        self.state.hotplugged.get()
    }

    pub fn parent_bus(&self) -> Option<Bus> {
        self.state
            .parent_bus
            .get()
            .and_then(|obj| Bus::from_object(&obj).ok())
    }

    pub fn child_buses(&self) -> Vec<Bus> {
        self.state.child_buses.borrow().clone()
    }

    pub fn num_child_bus(&self) -> u32 {
        self.state.num_child_bus.get()
    }

    pub fn num_gpio_in(&self) -> usize {
        self.state.gpio_in.borrow().len()
    }

    pub fn num_gpio_out(&self) -> usize {
        self.state.gpio_out.borrow().len()
    }

    /// Runs the class reset hook on this device only.
    pub fn reset(&self) {
        if let Some(reset) = self.class().device.reset {
            reset(self);
        }
    }

    /// Resets this device and everything below it.
    pub fn reset_all(&self) {
        crate::bus::reset_device_subtree(self);
    }
}

fn new_device_state() -> Rc<dyn Any> {
    Rc::new(DeviceState::default())
}

fn device_initfn(model: &DeviceModel, obj: &Object) -> Result<()> {
    let dev = Device::from_object(obj)?;
    if model.hotplug_enabled() {
        dev.state.hotplugged.set(true);
        model.mark_hot_added();
    }

    let props = obj.class().device.props.clone();
    model.prop_set_defaults(&dev, &props);
    for def in &props {
        obj.property_add_legacy(def)?;
        obj.property_add_static(def)?;
    }

    obj.property_add_link("parent_bus", TYPE_BUS, dev.state.parent_bus.clone())
}

fn device_finalize(model: &DeviceModel, obj: &Object) -> Result<()> {
    let dev = Device::from_object(obj)?;

    loop {
        let bus = dev.state.child_buses.borrow().first().cloned();
        let Some(bus) = bus else { break };
        model.bus_free(&bus);
    }
    if dev.is_realized() {
        if let Some(id) = dev.state.snapshot.take() {
            model.snapshots().unregister(id);
        }
        if let Some(exit) = obj.class().device.exit {
            exit(model, &dev);
        }
    }
    if let Some(bus) = dev.parent_bus() {
        model.bus_remove_child(&bus, &dev);
    }
    if let Some(parent) = obj.parent() {
        parent.property_del_child(model, obj);
    }

    let refcount = obj.refcount();
    if refcount != 0 {
        let id = dev.id().unwrap_or_default();
        tracing::error!(device = %id, refcount, "device is still in use");
        return Err(DevModelError::DeviceInUse(id));
    }
    Ok(())
}

pub(crate) fn device_type_info() -> TypeInfo {
    TypeInfo {
        is_abstract: true,
        instance_state: Some(new_device_state),
        instance_init: Some(device_initfn),
        instance_finalize: Some(device_finalize),
        ..TypeInfo::new(TYPE_DEVICE, Some(TYPE_OBJECT))
    }
}

impl DeviceModel {
    /// Instantiates `type_name` without attaching it to a bus.
    pub fn new_device(&self, type_name: &str) -> Result<Device> {
        let obj = self.new_object(type_name)?;
        Device::from_object(&obj)
    }

    /// Creates a device of type `type_name` on `bus` (the main system bus if `None`) and applies
    /// the matching global property defaults. The device is left in [`DevState::Created`].
    pub fn create(&self, bus: Option<&Bus>, type_name: &str) -> Result<Device> {
        let dev = self.new_device(type_name)?;
        let bus = match bus {
            Some(bus) => bus.clone(),
            None => self.main_system_bus(),
        };
        self.set_parent_bus(&dev, &bus)?;
        self.prop_set_globals(&dev)?;
        Ok(dev)
    }

    /// Like [`DeviceModel::create`] but reports failure as `None`.
    pub fn try_create(&self, bus: Option<&Bus>, type_name: &str) -> Option<Device> {
        match self.create(bus, type_name) {
            Ok(dev) => Some(dev),
            Err(err) => {
                tracing::debug!(type_name, %err, "device creation failed");
                None
            }
        }
    }

    pub fn set_parent_bus(&self, dev: &Device, bus: &Bus) -> Result<()> {
        dev.state.parent_bus.set_weak(Some(bus.object()));
        self.bus_add_child(bus, dev)
    }

    /// Runs the class `init` hook and moves the device to [`DevState::Initialized`].
    ///
    /// On failure the device is freed and the hook's error returned.
    pub fn realize(&self, dev: &Device) -> Result<()> {
        assert_eq!(
            dev.dev_state(),
            DevState::Created,
            "`{}` is already realized",
            dev.type_name()
        );
        let class = dev.class().clone();

        if let Some(init) = class.device.init {
            if let Err(err) = init(self, dev) {
                if let Err(free_err) = self.free(dev) {
                    tracing::error!(%free_err, "failed to free device after realize error");
                }
                return Err(err);
            }
        }

        if let Some(vmsd) = class.device.vmsd {
            let alias = dev.state.instance_id_alias.get();
            let section = Rc::new(VmStateSection::new(vmsd, dev.object().clone()));
            let id = self.snapshots().register_with_alias(
                None,
                section,
                u32::try_from(alias).ok(),
                dev.state.alias_required_for_version.get(),
            );
            dev.state.snapshot.set(Some(id));
        }

        dev.state.state.set(DevState::Initialized);
        tracing::debug!(type_name = dev.type_name(), id = ?dev.id(), "realized device");
        if dev.hotplugged() {
            dev.reset();
        }
        Ok(())
    }

    /// Realize during machine setup, where failure is fatal.
    pub fn realize_or_abort(&self, dev: &Device) {
        if let Err(err) = self.realize(dev) {
            panic!("initialization of device {} failed: {err}", dev.type_name());
        }
    }

    pub fn set_legacy_instance_id(&self, dev: &Device, alias_id: i32, required_for_version: u16) {
        assert_eq!(dev.dev_state(), DevState::Created);
        dev.state.instance_id_alias.set(alias_id);
        dev.state.alias_required_for_version.set(required_for_version);
    }

    pub fn unplug(&self, dev: &Device) -> Result<()> {
        let bus = dev.parent_bus();
        if !bus.as_ref().is_some_and(Bus::allow_hotplug) {
            return Err(DevModelError::BusNoHotplug(
                bus.map(|b| b.name()).unwrap_or_default(),
            ));
        }
        self.mark_hot_removed();
        tracing::info!(type_name = dev.type_name(), id = ?dev.id(), "unplugging device");
        match dev.class().device.unplug {
            Some(unplug) => unplug(self, dev),
            None => self.free(dev),
        }
    }

    /// Deletes the device, running its finalizer.
    pub fn free(&self, dev: &Device) -> Result<()> {
        self.delete(dev.object())
    }

    pub fn device_reset(&self, dev: &Device) {
        dev.reset();
    }

    pub fn reset_all(&self, dev: &Device) {
        dev.reset_all();
    }

    pub fn get_child_bus(&self, dev: &Device, name: &str) -> Option<Bus> {
        dev.state
            .child_buses
            .borrow()
            .iter()
            .find(|bus| bus.name() == name)
            .cloned()
    }

    /// Allocates `n` input lines; each level change calls `handler` with the line index.
    pub fn init_gpio_in(&self, dev: &Device, n: usize, handler: GpioHandler) -> Result<()> {
        assert_eq!(dev.num_gpio_in(), 0, "gpio inputs already initialized");
        let mut pins = Vec::with_capacity(n);
        for line in 0..n {
            let pin = self.new_pin()?;
            let owner = dev.object().downgrade();
            pin.add_level_change_notifier(move |pin| {
                if let Some(dev) = owner.upgrade().and_then(|o| Device::from_object(&o).ok()) {
                    handler(&dev, line, pin.level());
                }
            });
            pins.push(pin);
        }
        *dev.state.gpio_in.borrow_mut() = pins;
        Ok(())
    }

    pub fn init_gpio_out(&self, dev: &Device, pins: &[Pin]) {
        assert_eq!(dev.num_gpio_out(), 0, "gpio outputs already initialized");
        *dev.state.gpio_out.borrow_mut() = pins.to_vec();
    }

    pub fn get_gpio_in(&self, dev: &Device, n: usize) -> Pin {
        let pins = dev.state.gpio_in.borrow();
        assert!(n < pins.len(), "gpio input {n} out of range");
        pins[n].clone()
    }

    pub fn connect_gpio_out(&self, dev: &Device, n: usize, sink: Rc<dyn IrqLine>) {
        let pins = dev.state.gpio_out.borrow();
        assert!(n < pins.len(), "gpio output {n} out of range");
        pins[n].connect(sink);
    }

    pub fn fw_name(&self, dev: &Device) -> &'static str {
        dev.class().device.fw_name.unwrap_or(dev.type_name())
    }

    /// Firmware path: one component per device from the top-level bus down.
    pub fn fw_dev_path(&self, dev: &Device) -> String {
        fn helper(dev: Option<&Device>, out: &mut String) {
            if let Some(dev) = dev {
                if let Some(bus) = dev.parent_bus() {
                    helper(bus.parent().as_ref(), out);
                    match dev.class().device.get_fw_dev_path {
                        Some(get) => out.push_str(&get(dev)),
                        None => out.push_str(dev.type_name()),
                    }
                }
            }
            out.push('/');
        }

        let mut path = String::new();
        helper(Some(dev), &mut path);
        path.pop();
        path
    }

    pub fn dev_path(&self, dev: &Device) -> Option<String> {
        dev.class().device.get_dev_path.and_then(|get| get(dev))
    }

    pub fn prop_set_defaults(&self, dev: &Device, props: &[PropertyDef]) {
        for def in props {
            if let Some(default) = &def.default {
                (def.set)(dev.object(), default.clone());
            }
        }
    }

    /// Sets property `name` from its textual form.
    pub fn prop_parse(&self, dev: &Device, name: &str, value: &str) -> Result<()> {
        let legacy = format!("legacy-{name}");
        if dev.property_find(&legacy).is_none() {
            return Err(DevModelError::UnknownProperty(name.to_string()));
        }
        dev.property_set(self, &legacy, serde_json::Value::String(value.to_string()))
    }

    /// Applies every registered global whose driver is this device's type.
    pub fn prop_set_globals(&self, dev: &Device) -> Result<()> {
        for global in self.globals() {
            if global.driver != dev.type_name() {
                continue;
            }
            self.prop_parse(dev, &global.property, &global.value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::{define_prop_hex32, define_prop_uint8, prop_state, PropValue};

    #[derive(Default)]
    struct Uart {
        iobase: Cell<u32>,
        irq: Cell<u8>,
        resets: Cell<u32>,
        exits: Cell<u32>,
    }

    fn uart_state() -> Rc<dyn Any> {
        Rc::new(Uart::default())
    }

    fn uart_class_init(class: &mut crate::ObjectClass) {
        class.device.props = vec![
            define_prop_hex32!("iobase", Uart, iobase, 0x3f8),
            define_prop_uint8!("irq", Uart, irq, 4),
        ];
        class.device.reset = Some(|dev| {
            let uart = prop_state::<Uart>(dev.object());
            uart.resets.set(uart.resets.get() + 1);
        });
        class.device.exit = Some(|_, dev| {
            let uart = prop_state::<Uart>(dev.object());
            uart.exits.set(uart.exits.get() + 1);
        });
        class.device.fw_name = Some("serial");
    }

    fn model() -> DeviceModel {
        let model = DeviceModel::new();
        model
            .register_type(TypeInfo {
                instance_state: Some(uart_state),
                class_init: Some(uart_class_init),
                ..TypeInfo::new("uart", Some(TYPE_DEVICE))
            })
            .unwrap();
        model
            .register_type(TypeInfo {
                class_init: Some(|class| {
                    class.device.init = Some(|_, dev| {
                        Err(DevModelError::RealizeFailed {
                            type_name: dev.type_name().to_string(),
                            reason: "no backend".to_string(),
                        })
                    });
                }),
                ..TypeInfo::new("broken", Some(TYPE_DEVICE))
            })
            .unwrap();
        model
    }

    #[test]
    fn create_applies_defaults_and_exposes_typed_and_legacy_properties() {
        let model = model();
        let dev = model.create(None, "uart").unwrap();
        assert_eq!(dev.dev_state(), DevState::Created);
        assert_eq!(
            dev.property_get(&model, "iobase").unwrap(),
            Value::from(0x3f8)
        );
        assert_eq!(
            dev.property_get(&model, "legacy-iobase").unwrap(),
            Value::from("0x3f8")
        );
        assert_eq!(
            dev.property_get_type("legacy-iobase").unwrap(),
            "legacy<hex32>"
        );
        assert_eq!(dev.property_get_type("irq").unwrap(), "uint8");

        model.prop_parse(&dev, "irq", "3").unwrap();
        assert_eq!(prop_state::<Uart>(dev.object()).irq.get(), 3);
        assert!(matches!(
            model.prop_parse(&dev, "irq", "300"),
            Err(DevModelError::InvalidParameter { .. })
        ));
        assert_eq!(
            model.prop_parse(&dev, "nope", "1"),
            Err(DevModelError::UnknownProperty("nope".to_string()))
        );
    }

    #[test]
    fn properties_are_frozen_after_realize() {
        let model = model();
        let dev = model.create(None, "uart").unwrap();
        model.realize(&dev).unwrap();
        assert!(dev.is_realized());
        assert_eq!(
            dev.property_set(&model, "legacy-irq", Value::from("5")),
            Err(DevModelError::PermissionDenied("legacy-irq".to_string()))
        );
        assert_eq!(
            dev.property_set(&model, "irq", Value::from(5)),
            Err(DevModelError::PermissionDenied("irq".to_string()))
        );
    }

    #[test]
    fn globals_apply_to_matching_drivers_only() {
        let model = model();
        model.register_global("uart.irq=7".parse().unwrap());
        model.register_global("other.irq=9".parse().unwrap());
        let dev = model.create(None, "uart").unwrap();
        assert_eq!((dev.class().device.props[1].get)(dev.object()), PropValue::Uint(7));
    }

    #[test]
    fn failed_realize_frees_the_device() {
        let model = model();
        let bus = model.main_system_bus();
        let dev = model.create(None, "broken").unwrap();
        assert_eq!(bus.children().len(), 1);

        let err = model.realize(&dev).unwrap_err();
        assert!(matches!(err, DevModelError::RealizeFailed { .. }));
        assert!(bus.children().is_empty());
        assert!(!dev.is_live());
    }

    #[test]
    fn unknown_and_abstract_types_are_rejected() {
        let model = model();
        assert_eq!(
            model.create(None, "nope").unwrap_err(),
            DevModelError::UnknownType("nope".to_string())
        );
        assert_eq!(
            model.create(None, TYPE_DEVICE).unwrap_err(),
            DevModelError::AbstractType(TYPE_DEVICE.to_string())
        );
        assert!(model.try_create(None, "nope").is_none());
        assert!(model.exists("uart"));
        assert!(!model.exists("nope"));
    }

    #[test]
    fn hotplugged_devices_are_reset_on_realize() {
        let model = model();
        let cold = model.create(None, "uart").unwrap();
        model.realize(&cold).unwrap();
        assert!(!model.machine_modified());

        model.machine_creation_done();
        model.main_system_bus().set_allow_hotplug(true);
        let hot = model.create(None, "uart").unwrap();
        assert!(hot.hotplugged());
        assert!(model.machine_modified());
        model.realize(&hot).unwrap();

        assert_eq!(prop_state::<Uart>(cold.object()).resets.get(), 0);
        assert_eq!(prop_state::<Uart>(hot.object()).resets.get(), 1);
    }

    #[test]
    fn unplug_requires_a_hotplug_bus_and_runs_exit() {
        let model = model();
        let dev = model.create(None, "uart").unwrap();
        model.realize(&dev).unwrap();
        assert_eq!(
            model.unplug(&dev),
            Err(DevModelError::BusNoHotplug("main-system-bus".to_string()))
        );

        model.main_system_bus().set_allow_hotplug(true);
        let uart = prop_state::<Uart>(dev.object());
        model.unplug(&dev).unwrap();
        assert_eq!(uart.exits.get(), 1);
        assert!(model.machine_modified());
        assert!(model.main_system_bus().children().is_empty());
    }

    #[test]
    fn finalize_reports_devices_still_referenced() {
        let model = model();
        let dev = model.create(None, "uart").unwrap();
        dev.set_id(Some("com1"));
        dev.inc_ref();
        assert_eq!(
            model.free(&dev),
            Err(DevModelError::DeviceInUse("com1".to_string()))
        );
    }

    #[test]
    fn firmware_names_and_paths() {
        let model = model();
        let dev = model.create(None, "uart").unwrap();
        assert_eq!(model.fw_name(&dev), "serial");
        assert_eq!(model.fw_dev_path(&dev), "/uart");
        assert_eq!(model.dev_path(&dev), None);
    }

    #[test]
    fn gpio_inputs_dispatch_to_the_handler() {
        thread_local! {
            static SEEN: RefCell<Vec<(usize, bool)>> = const { RefCell::new(Vec::new()) };
        }
        let model = model();
        let dev = model.create(None, "uart").unwrap();
        model
            .init_gpio_in(&dev, 2, |_, line, level| {
                SEEN.with(|s| s.borrow_mut().push((line, level)));
            })
            .unwrap();
        model.get_gpio_in(&dev, 1).raise();
        model.get_gpio_in(&dev, 0).raise();
        model.get_gpio_in(&dev, 1).lower();
        SEEN.with(|s| assert_eq!(s.borrow().as_slice(), &[(1, true), (0, true), (1, false)]));

        let out = model.new_pin().unwrap();
        let target = model.new_pin().unwrap();
        model.init_gpio_out(&dev, std::slice::from_ref(&out));
        model.connect_gpio_out(&dev, 0, Rc::new(target.clone()));
        out.raise();
        assert!(target.level());
    }
}
