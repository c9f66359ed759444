//! Buses and the device/bus tree walkers.
//!
//! A bus is owned by its parent device (through a `child<>` property named after the bus) and in
//! turn owns the devices plugged into it, exposed as `child[N]` properties where `N` is a
//! per-bus index that is never reused.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::convert::Infallible;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use aero_platform::reset::ResetHandlerId;

use crate::device::Device;
use crate::error::{DevModelError, Result};
use crate::model::DeviceModel;
use crate::object::{Object, WeakObject};
use crate::types::TypeInfo;
use crate::{TYPE_BUS, TYPE_OBJECT, TYPE_SYSTEM_BUS};

/// What a tree visitor wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    Continue,
    /// Do not descend below the node just visited.
    SkipChildren,
}

struct BusChild {
    index: u32,
    device: Device,
}

#[derive(Default)]
pub struct BusState {
    name: RefCell<String>,
    parent: RefCell<Option<WeakObject>>,
    children: RefCell<Vec<BusChild>>,
    max_index: Cell<u32>,
    allow_hotplug: Cell<bool>,
    qdev_allocated: Cell<bool>,
    reset_handler: Cell<Option<ResetHandlerId>>,
}

#[derive(Clone)]
pub struct Bus {
    obj: Object,
    state: Rc<BusState>,
}

impl Deref for Bus {
    type Target = Object;

    fn deref(&self) -> &Object {
        &self.obj
    }
}

impl PartialEq for Bus {
    fn eq(&self, other: &Self) -> bool {
        self.obj == other.obj
    }
}

impl Eq for Bus {}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("type", &self.obj.type_name())
            .field("name", &self.name())
            .finish()
    }
}

impl Bus {
    pub fn from_object(obj: &Object) -> Result<Self> {
        obj.check_cast(TYPE_BUS)?;
        let state = obj
            .state::<BusState>()
            .ok_or_else(|| DevModelError::TypeMismatch {
                name: obj.type_name().to_string(),
                expected: TYPE_BUS.to_string(),
            })?;
        Ok(Self {
            obj: obj.clone(),
            state,
        })
    }

    pub fn object(&self) -> &Object {
        &self.obj
    }

    pub fn name(&self) -> String {
        self.state.name.borrow().clone()
    }

    /// The device this bus hangs off, if any.
    pub fn parent(&self) -> Option<Device> {
        self.state
            .parent
            .borrow()
            .as_ref()
            .and_then(WeakObject::upgrade)
            .and_then(|obj| Device::from_object(&obj).ok())
    }

    pub fn allow_hotplug(&self) -> bool {
        self.state.allow_hotplug.get()
    }

    pub fn set_allow_hotplug(&self, allow: bool) {
        self.state.allow_hotplug.set(allow);
    }

    pub fn is_heap_allocated(&self) -> bool {
        self.state.qdev_allocated.get()
    }

    /// Plugged devices in insertion order.
    pub fn children(&self) -> Vec<Device> {
        self.state
            .children
            .borrow()
            .iter()
            .map(|kid| kid.device.clone())
            .collect()
    }

    /// Index assigned to `dev` when it was plugged in.
    pub fn child_index(&self, dev: &Device) -> Option<u32> {
        self.state
            .children
            .borrow()
            .iter()
            .find(|kid| kid.device == *dev)
            .map(|kid| kid.index)
    }

    pub fn reset(&self) {
        if let Some(reset) = self.class().bus.reset {
            reset(self);
        }
    }

    /// Resets every device and bus below (and including) this bus.
    pub fn reset_all(&self) {
        let _ = walk_bus_children::<Infallible, _, _>(
            self,
            &mut |dev| {
                dev.reset();
                Ok(Walk::Continue)
            },
            &mut |bus| {
                bus.reset();
                Ok(Walk::Continue)
            },
        );
    }
}

pub(crate) fn reset_device_subtree(dev: &Device) {
    let _ = walk_device_children::<Infallible, _, _>(
        dev,
        &mut |dev| {
            dev.reset();
            Ok(Walk::Continue)
        },
        &mut |bus| {
            bus.reset();
            Ok(Walk::Continue)
        },
    );
}

/// Visits `bus`, then every device on it (depth first). An `Err` from a visitor aborts the walk.
pub fn walk_bus_children<E, D, B>(bus: &Bus, devfn: &mut D, busfn: &mut B) -> Result<(), E>
where
    D: FnMut(&Device) -> Result<Walk, E>,
    B: FnMut(&Bus) -> Result<Walk, E>,
{
    if busfn(bus)? == Walk::SkipChildren {
        return Ok(());
    }
    for dev in bus.children() {
        walk_device_children(&dev, devfn, busfn)?;
    }
    Ok(())
}

/// Visits `dev`, then every bus it owns (depth first). An `Err` from a visitor aborts the walk.
pub fn walk_device_children<E, D, B>(dev: &Device, devfn: &mut D, busfn: &mut B) -> Result<(), E>
where
    D: FnMut(&Device) -> Result<Walk, E>,
    B: FnMut(&Bus) -> Result<Walk, E>,
{
    if devfn(dev)? == Walk::SkipChildren {
        return Ok(());
    }
    for bus in dev.child_buses() {
        walk_bus_children(&bus, devfn, busfn)?;
    }
    Ok(())
}

fn new_bus_state() -> Rc<dyn Any> {
    Rc::new(BusState::default())
}

pub(crate) fn bus_type_info() -> TypeInfo {
    TypeInfo {
        is_abstract: true,
        instance_state: Some(new_bus_state),
        ..TypeInfo::new(TYPE_BUS, Some(TYPE_OBJECT))
    }
}

pub(crate) fn system_bus_type_info() -> TypeInfo {
    TypeInfo::new(TYPE_SYSTEM_BUS, Some(TYPE_BUS))
}

impl DeviceModel {
    /// Allocates a bus of `type_name` and attaches it to `parent`.
    pub fn bus_create(
        &self,
        type_name: &str,
        parent: Option<&Device>,
        name: Option<&str>,
    ) -> Result<Bus> {
        let bus = Bus::from_object(&self.new_object(type_name)?)?;
        bus.state.qdev_allocated.set(true);
        self.bus_setup(&bus, parent, name, false)?;
        Ok(bus)
    }

    /// Attaches a bus object built by the caller. The caller keeps ownership of the object;
    /// [`DeviceModel::bus_free`] detaches it but does not delete it.
    pub fn bus_create_inplace(
        &self,
        bus: &Bus,
        parent: Option<&Device>,
        name: Option<&str>,
    ) -> Result<()> {
        self.bus_setup(bus, parent, name, false)
    }

    pub(crate) fn main_bus_create(&self) -> Result<Bus> {
        let bus = Bus::from_object(&self.new_object(TYPE_SYSTEM_BUS)?)?;
        bus.state.qdev_allocated.set(true);
        self.bus_setup(&bus, None, Some("main-system-bus"), true)?;
        self.root().property_add_child("sysbus", bus.object())?;
        Ok(bus)
    }

    fn bus_setup(
        &self,
        bus: &Bus,
        parent: Option<&Device>,
        name: Option<&str>,
        is_main: bool,
    ) -> Result<()> {
        let index = parent.map_or(0, Device::num_child_bus);
        let name = match (name, parent.and_then(Device::id)) {
            (Some(name), _) => name.to_string(),
            (None, Some(id)) => format!("{id}.{index}"),
            (None, None) => format!("{}.{index}", bus.type_name()).to_lowercase(),
        };
        *bus.state.name.borrow_mut() = name.clone();

        match parent {
            Some(parent) => {
                parent.property_add_child(name.as_str(), bus.object())?;
                *bus.state.parent.borrow_mut() = Some(parent.downgrade());
                parent.state_child_buses_push(bus);
            }
            None if !is_main => {
                let weak = bus.downgrade();
                let id = self.reset_handlers().register(move || {
                    if let Some(bus) = weak.upgrade().and_then(|o| Bus::from_object(&o).ok()) {
                        bus.reset_all();
                    }
                });
                bus.state.reset_handler.set(Some(id));
            }
            None => {}
        }
        tracing::debug!(bus = %name, type_name = bus.type_name(), "created bus");
        Ok(())
    }

    /// Frees every device on `bus`, detaches it and, if this model allocated it, deletes it.
    pub fn bus_free(&self, bus: &Bus) {
        loop {
            let first = bus.state.children.borrow().first().map(|kid| kid.device.clone());
            let Some(dev) = first else { break };
            if let Err(err) = self.free(&dev) {
                tracing::error!(bus = %bus.name(), %err, "failed to free device");
            }
            // A finalizer that failed early may have left the device plugged in.
            bus.state.children.borrow_mut().retain(|kid| kid.device != dev);
        }

        match bus.parent() {
            Some(parent) => {
                parent.state_child_buses_remove(bus);
                parent.property_del_child(self, bus.object());
                bus.state.parent.borrow_mut().take();
            }
            None => {
                assert!(
                    !self.is_main_system_bus(bus),
                    "the main system bus is never freed"
                );
                if let Some(id) = bus.state.reset_handler.take() {
                    self.reset_handlers().unregister(id);
                }
            }
        }

        if bus.is_heap_allocated() {
            if let Err(err) = self.delete(bus.object()) {
                tracing::error!(bus = %bus.name(), %err, "failed to finalize bus");
            }
        }
    }

    pub(crate) fn bus_add_child(&self, bus: &Bus, dev: &Device) -> Result<()> {
        if self.hotplug_enabled() {
            assert!(
                bus.allow_hotplug(),
                "bus `{}` does not allow hot-plugging",
                bus.name()
            );
        }
        let index = bus.state.max_index.get();
        bus.property_add_child(format!("child[{index}]"), dev.object())?;
        bus.state.max_index.set(index + 1);
        bus.state.children.borrow_mut().push(BusChild {
            index,
            device: dev.clone(),
        });
        if dev.hotplugged() {
            tracing::info!(bus = %bus.name(), index, type_name = dev.type_name(), "hot-plugged device");
        }
        Ok(())
    }

    pub(crate) fn bus_remove_child(&self, bus: &Bus, dev: &Device) {
        let index = {
            let mut children = bus.state.children.borrow_mut();
            let Some(pos) = children.iter().position(|kid| kid.device == *dev) else {
                return;
            };
            children.remove(pos).index
        };
        if let Err(err) = bus.property_del(self, &format!("child[{index}]")) {
            tracing::error!(bus = %bus.name(), index, %err, "bus child property missing");
        }
    }

    /// Depth-first search below `bus` for a device with the given id.
    pub fn find_recursive(&self, bus: &Bus, id: &str) -> Option<Device> {
        for dev in bus.children() {
            if dev.id().as_deref() == Some(id) {
                return Some(dev);
            }
            for child in dev.child_buses() {
                if let Some(found) = self.find_recursive(&child, id) {
                    return Some(found);
                }
            }
        }
        None
    }
}

impl Device {
    fn state_child_buses_push(&self, bus: &Bus) {
        let state = self.device_state();
        state.child_buses.borrow_mut().push(bus.clone());
        state.num_child_bus.set(state.num_child_bus.get() + 1);
    }

    fn state_child_buses_remove(&self, bus: &Bus) {
        let state = self.device_state();
        let mut buses = state.child_buses.borrow_mut();
        let before = buses.len();
        buses.retain(|b| b != bus);
        if buses.len() != before {
            state.num_child_bus.set(state.num_child_bus.get() - 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{prop_state, TYPE_DEVICE};

    #[derive(Default)]
    struct Counter {
        resets: Cell<u32>,
    }

    fn counter_state() -> Rc<dyn Any> {
        Rc::new(Counter::default())
    }

    fn model() -> DeviceModel {
        let model = DeviceModel::new();
        model
            .register_type(TypeInfo {
                instance_state: Some(counter_state),
                class_init: Some(|class| {
                    class.device.reset = Some(|dev| {
                        let c = prop_state::<Counter>(dev.object());
                        c.resets.set(c.resets.get() + 1);
                    });
                }),
                ..TypeInfo::new("bridge", Some(TYPE_DEVICE))
            })
            .unwrap();
        model
            .register_type(TypeInfo::new("pci", Some(TYPE_BUS)))
            .unwrap();
        model
    }

    fn resets(dev: &Device) -> u32 {
        prop_state::<Counter>(dev.object()).resets.get()
    }

    #[test]
    fn bus_names_follow_the_parent_id_or_type() {
        let model = model();
        let bridge = model.create(None, "bridge").unwrap();
        let a = model.bus_create("pci", Some(&bridge), None).unwrap();
        assert_eq!(a.name(), "pci.0");
        bridge.set_id(Some("br"));
        let b = model.bus_create("pci", Some(&bridge), None).unwrap();
        assert_eq!(b.name(), "br.1");
        let c = model.bus_create("pci", Some(&bridge), Some("explicit")).unwrap();
        assert_eq!(c.name(), "explicit");

        assert_eq!(bridge.num_child_bus(), 3);
        assert_eq!(model.get_child_bus(&bridge, "br.1"), Some(b));
        assert_eq!(c.parent(), Some(bridge));
    }

    #[test]
    fn freeing_an_unrealized_device_releases_its_buses() {
        let model = model();
        let bridge = model.create(None, "bridge").unwrap();
        assert!(!bridge.is_realized());
        let bus = model.bus_create("pci", Some(&bridge), None).unwrap();
        model.create(Some(&bus), "bridge").unwrap();

        model.free(&bridge).unwrap();
        assert!(bridge.child_buses().is_empty());
        assert_eq!(bridge.num_child_bus(), 0);
        assert!(bus.children().is_empty());
        assert_eq!(bus.parent(), None);
        assert!(bridge.property_find("pci.0").is_none());
    }

    #[test]
    fn child_indices_are_never_reused() {
        let model = model();
        let bus = model.main_system_bus();
        let a = model.create(None, "bridge").unwrap();
        let b = model.create(None, "bridge").unwrap();
        model.free(&a).unwrap();
        let c = model.create(None, "bridge").unwrap();

        assert_eq!(bus.child_index(&b), Some(1));
        assert_eq!(bus.child_index(&c), Some(2));
        assert_eq!(bus.children(), vec![b.clone(), c]);
        assert!(bus.property_find("child[0]").is_none());
        assert_eq!(model.canonical_path(&b), "/sysbus/child[1]");
        assert_eq!(b.parent_bus(), Some(bus));
    }

    #[test]
    fn walkers_visit_depth_first_and_honour_skip() {
        let model = model();
        let top = model.create(None, "bridge").unwrap();
        top.set_id(Some("top"));
        let sub = model.bus_create("pci", Some(&top), None).unwrap();
        let leaf = model.create(Some(&sub), "bridge").unwrap();
        leaf.set_id(Some("leaf"));

        let mut seen = Vec::new();
        let mut buses = Vec::new();
        walk_bus_children::<Infallible, _, _>(
            &model.main_system_bus(),
            &mut |dev| {
                seen.push(dev.id().unwrap_or_default());
                Ok(Walk::Continue)
            },
            &mut |bus| {
                buses.push(bus.name());
                Ok(Walk::Continue)
            },
        )
        .unwrap();
        assert_eq!(seen, ["top", "leaf"]);
        assert_eq!(buses, ["main-system-bus", "top.0"]);

        let mut seen = Vec::new();
        walk_device_children::<Infallible, _, _>(
            &top,
            &mut |dev| {
                seen.push(dev.id().unwrap_or_default());
                Ok(Walk::SkipChildren)
            },
            &mut |_| Ok(Walk::Continue),
        )
        .unwrap();
        assert_eq!(seen, ["top"]);

        let err = walk_device_children(
            &top,
            &mut |dev| {
                if dev.id().as_deref() == Some("leaf") {
                    Err("stop")
                } else {
                    Ok(Walk::Continue)
                }
            },
            &mut |_| Ok(Walk::Continue),
        );
        assert_eq!(err, Err("stop"));

        assert_eq!(model.find_recursive(&model.main_system_bus(), "leaf"), Some(leaf));
        assert_eq!(model.find_recursive(&model.main_system_bus(), "nope"), None);
    }

    #[test]
    fn reset_reaches_nested_devices_and_is_repeatable() {
        let model = model();
        let top = model.create(None, "bridge").unwrap();
        let sub = model.bus_create("pci", Some(&top), None).unwrap();
        let leaf = model.create(Some(&sub), "bridge").unwrap();

        model.reset_machine();
        model.reset_machine();
        assert_eq!((resets(&top), resets(&leaf)), (2, 2));

        top.reset_all();
        assert_eq!((resets(&top), resets(&leaf)), (3, 3));
    }

    #[test]
    fn orphan_buses_register_a_reset_handler_until_freed() {
        let model = model();
        let handlers = model.reset_handlers().len();
        let bus = model.bus_create("pci", None, Some("isolated")).unwrap();
        let dev = model.create(Some(&bus), "bridge").unwrap();
        assert_eq!(model.reset_handlers().len(), handlers + 1);

        model.reset_machine();
        assert_eq!(resets(&dev), 1);

        model.bus_free(&bus);
        assert_eq!(model.reset_handlers().len(), handlers);
        assert!(!dev.is_live());
        assert!(!bus.is_live());
    }

    #[test]
    fn freeing_a_realized_device_frees_its_buses() {
        let model = model();
        let top = model.create(None, "bridge").unwrap();
        let sub = model.bus_create("pci", Some(&top), None).unwrap();
        let leaf = model.create(Some(&sub), "bridge").unwrap();
        model.realize(&top).unwrap();
        model.realize(&leaf).unwrap();

        model.free(&top).unwrap();
        assert!(!sub.is_live());
        assert!(!leaf.is_live());
        assert_eq!(top.num_child_bus(), 0);
        assert!(model.main_system_bus().children().is_empty());
    }

    #[test]
    #[should_panic(expected = "does not allow hot-plugging")]
    fn hotplug_onto_a_cold_bus_is_a_programming_error() {
        let model = model();
        model.machine_creation_done();
        let _ = model.create(None, "bridge");
    }
}
