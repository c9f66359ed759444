//! Runtime type registry.
//!
//! Types are declared with a [`TypeInfo`] and looked up by name. The class of a type is built
//! lazily the first time it is needed: the parent's class is copied and the type's own
//! `class_init` runs on the copy, so a class always sees everything its ancestors configured.

use std::any::Any;
use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use aero_io_snapshot::io::state::VmStateDescription;

use crate::bus::Bus;
use crate::device::Device;
use crate::error::{DevModelError, Result};
use crate::model::DeviceModel;
use crate::object::Object;
use crate::property::PropertyDef;

pub type StateFactory = fn() -> Rc<dyn Any>;
pub type InstanceInitFn = fn(&DeviceModel, &Object) -> Result<()>;
pub type InstanceFinalizeFn = fn(&DeviceModel, &Object) -> Result<()>;
pub type ClassInitFn = fn(&mut ObjectClass);

/// Static description of a type.
#[derive(Clone, Copy)]
pub struct TypeInfo {
    pub name: &'static str,
    pub parent: Option<&'static str>,
    pub is_abstract: bool,
    /// Allocates the per-instance state this type adds on top of its parent.
    pub instance_state: Option<StateFactory>,
    pub instance_init: Option<InstanceInitFn>,
    pub instance_finalize: Option<InstanceFinalizeFn>,
    pub class_init: Option<ClassInitFn>,
}

impl TypeInfo {
    pub const fn new(name: &'static str, parent: Option<&'static str>) -> Self {
        Self {
            name,
            parent,
            is_abstract: false,
            instance_state: None,
            instance_init: None,
            instance_finalize: None,
            class_init: None,
        }
    }
}

/// Device behaviour shared by every instance of a class.
#[derive(Clone, Default)]
pub struct DeviceClass {
    /// Realize hook; runs once when the device leaves the CREATED state.
    pub init: Option<fn(&DeviceModel, &Device) -> Result<()>>,
    pub reset: Option<fn(&Device)>,
    /// Hot-unplug hook. Without one the device is freed in place.
    pub unplug: Option<fn(&DeviceModel, &Device) -> Result<()>>,
    pub exit: Option<fn(&DeviceModel, &Device)>,
    pub vmsd: Option<&'static VmStateDescription<Object>>,
    /// Typed properties, inherited ones first.
    pub props: Vec<PropertyDef>,
    pub fw_name: Option<&'static str>,
    pub desc: Option<&'static str>,
    pub no_user: bool,
    pub get_fw_dev_path: Option<fn(&Device) -> String>,
    pub get_dev_path: Option<fn(&Device) -> Option<String>>,
}

#[derive(Clone, Default)]
pub struct BusClass {
    pub reset: Option<fn(&Bus)>,
}

#[derive(Clone)]
pub struct ObjectClass {
    type_name: &'static str,
    /// Leaf first, root last.
    ancestry: Vec<&'static str>,
    pub device: DeviceClass,
    pub bus: BusClass,
}

impl ObjectClass {
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn parent_name(&self) -> Option<&'static str> {
        self.ancestry.get(1).copied()
    }

    pub fn ancestry(&self) -> &[&'static str] {
        &self.ancestry
    }

    pub fn is_a(&self, name: &str) -> bool {
        self.ancestry.iter().any(|t| *t == name)
    }
}

struct TypeEntry {
    info: TypeInfo,
    class: OnceCell<Rc<ObjectClass>>,
}

#[derive(Default)]
pub struct TypeRegistry {
    types: RefCell<HashMap<&'static str, Rc<TypeEntry>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: TypeInfo) -> Result<()> {
        let mut types = self.types.borrow_mut();
        if types.contains_key(info.name) {
            return Err(DevModelError::DuplicateType(info.name.to_string()));
        }
        // Registered types form a forest, so this walk ends at a root or an unregistered parent.
        let mut ancestor = info.parent;
        while let Some(name) = ancestor {
            if name == info.name {
                return Err(DevModelError::CyclicType(info.name.to_string()));
            }
            ancestor = types.get(name).and_then(|e| e.info.parent);
        }
        tracing::debug!(name = info.name, parent = ?info.parent, "registered type");
        types.insert(
            info.name,
            Rc::new(TypeEntry {
                info,
                class: OnceCell::new(),
            }),
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.borrow().contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<TypeInfo> {
        self.types.borrow().get(name).map(|e| e.info)
    }

    fn entry(&self, name: &str) -> Result<Rc<TypeEntry>> {
        self.types
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| DevModelError::UnknownType(name.to_string()))
    }

    /// Type chain of `name`, root first.
    pub fn chain(&self, name: &str) -> Result<Vec<TypeInfo>> {
        let mut chain = Vec::new();
        let mut next = Some(self.entry(name)?.info);
        while let Some(info) = next {
            if chain.iter().any(|t: &TypeInfo| t.name == info.name) {
                return Err(DevModelError::CyclicType(name.to_string()));
            }
            next = match info.parent {
                Some(parent) => Some(self.entry(parent)?.info),
                None => None,
            };
            chain.push(info);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Returns the class of `name`, materializing it (and its ancestors) on first use.
    pub fn class(&self, name: &str) -> Result<Rc<ObjectClass>> {
        let entry = self.entry(name)?;
        if let Some(class) = entry.class.get() {
            return Ok(class.clone());
        }

        // Validates the whole parent chain before anything is cached.
        self.chain(name)?;

        let mut class = match entry.info.parent {
            Some(parent) => {
                let parent = self.class(parent)?;
                let mut class = ObjectClass::clone(&parent);
                class.ancestry.insert(0, entry.info.name);
                class
            }
            None => ObjectClass {
                type_name: entry.info.name,
                ancestry: vec![entry.info.name],
                device: DeviceClass::default(),
                bus: BusClass::default(),
            },
        };
        class.type_name = entry.info.name;
        if let Some(class_init) = entry.info.class_init {
            class_init(&mut class);
        }

        Ok(entry.class.get_or_init(|| Rc::new(class)).clone())
    }

    /// Checks that `name` names `target` or one of its descendants.
    pub fn is_subtype(&self, name: &str, target: &str) -> Result<bool> {
        Ok(self.chain(name)?.iter().any(|t| t.name == target))
    }
}
