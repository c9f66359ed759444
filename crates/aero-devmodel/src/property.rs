//! Per-instance properties.
//!
//! Every object carries an insertion-ordered list of named properties. A property is one of four
//! kinds:
//! - scalar: getter/setter closures exchanging [`serde_json::Value`]s,
//! - child: an owning edge; the child's canonical path runs through it,
//! - link: a non-owning, typed reference settable by path,
//! - legacy: a string facade (`legacy-<name>`) over a typed device property.
//!
//! Accessors are cloned out of the list before they run, so they may freely add or remove
//! properties on the same object.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;

use crate::device::{DevState, DeviceState};
use crate::error::{DevModelError, Result};
use crate::model::DeviceModel;
use crate::object::{Object, WeakObject};

pub type PropGetter = Rc<dyn Fn(&DeviceModel, &Object) -> Result<Value>>;
pub type PropSetter = Rc<dyn Fn(&DeviceModel, &Object, Value) -> Result<()>>;
pub type PropRelease = Rc<dyn Fn(&DeviceModel, &Object)>;
pub type StrGetter = Rc<dyn Fn(&Object) -> String>;
pub type StrSetter = Rc<dyn Fn(&Object, &str) -> Result<()>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Int32,
    Uint64,
    Hex8,
    Hex32,
    Hex64,
    String,
}

fn parse_unsigned(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl PropertyType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Uint8 | Self::Hex8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Uint32 | Self::Hex32 => "uint32",
            Self::Int32 => "int32",
            Self::Uint64 | Self::Hex64 => "uint64",
            Self::String => "string",
        }
    }

    /// Name used in the `legacy<...>` tag; hex types keep their display flavour here.
    pub fn legacy_name(self) -> &'static str {
        match self {
            Self::Hex8 => "hex8",
            Self::Hex32 => "hex32",
            Self::Hex64 => "hex64",
            other => other.name(),
        }
    }

    fn unsigned_max(self) -> Option<u64> {
        match self {
            Self::Uint8 | Self::Hex8 => Some(u64::from(u8::MAX)),
            Self::Uint16 => Some(u64::from(u16::MAX)),
            Self::Uint32 | Self::Hex32 => Some(u64::from(u32::MAX)),
            Self::Uint64 | Self::Hex64 => Some(u64::MAX),
            _ => None,
        }
    }

    fn is_hex(self) -> bool {
        matches!(self, Self::Hex8 | Self::Hex32 | Self::Hex64)
    }

    pub fn print(self, v: &PropValue) -> String {
        match v {
            PropValue::Bool(b) => (if *b { "on" } else { "off" }).to_string(),
            PropValue::Uint(u) if self.is_hex() => format!("0x{u:x}"),
            PropValue::Uint(u) => u.to_string(),
            PropValue::Int(i) => i.to_string(),
            PropValue::Str(s) => s.clone(),
        }
    }

    pub fn parse(self, s: &str) -> Option<PropValue> {
        match self {
            Self::Bool => match s {
                "on" | "yes" | "true" => Some(PropValue::Bool(true)),
                "off" | "no" | "false" => Some(PropValue::Bool(false)),
                _ => None,
            },
            Self::Int32 => s.parse::<i32>().ok().map(|v| PropValue::Int(v.into())),
            Self::String => Some(PropValue::Str(s.to_string())),
            _ => {
                let max = self.unsigned_max()?;
                let v = if self.is_hex() {
                    let digits = s
                        .strip_prefix("0x")
                        .or_else(|| s.strip_prefix("0X"))
                        .unwrap_or(s);
                    u64::from_str_radix(digits, 16).ok()?
                } else {
                    parse_unsigned(s)?
                };
                (v <= max).then_some(PropValue::Uint(v))
            }
        }
    }

    pub fn to_json(self, v: &PropValue) -> Value {
        match v {
            PropValue::Bool(b) => Value::Bool(*b),
            PropValue::Int(i) => Value::from(*i),
            PropValue::Uint(u) => Value::from(*u),
            PropValue::Str(s) => Value::String(s.clone()),
        }
    }

    pub fn from_json(self, v: &Value) -> Option<PropValue> {
        match self {
            Self::Bool => v.as_bool().map(PropValue::Bool),
            Self::Int32 => v
                .as_i64()
                .filter(|i| i32::try_from(*i).is_ok())
                .map(PropValue::Int),
            Self::String => v.as_str().map(|s| PropValue::Str(s.to_string())),
            _ => {
                let max = self.unsigned_max()?;
                v.as_u64().filter(|u| *u <= max).map(PropValue::Uint)
            }
        }
    }
}

/// A typed property backed by a field of some state block, declared once per class.
#[derive(Clone)]
pub struct PropertyDef {
    pub name: &'static str,
    pub ty: PropertyType,
    pub default: Option<PropValue>,
    pub get: fn(&Object) -> PropValue,
    pub set: fn(&Object, PropValue),
}

impl std::fmt::Debug for PropertyDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyDef")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("default", &self.default)
            .finish()
    }
}

/// Fetches the state block a [`PropertyDef`] accessor works on.
///
/// Panics if the object does not carry it, which means the property was declared on the wrong
/// class.
pub fn prop_state<T: Any>(obj: &Object) -> Rc<T> {
    obj.state::<T>().unwrap_or_else(|| {
        panic!(
            "`{}` has no {} state",
            obj.type_name(),
            std::any::type_name::<T>()
        )
    })
}

#[doc(hidden)]
#[macro_export]
macro_rules! __define_prop_field {
    ($name:expr, $ptype:ident, $variant:ident, $rust:ty, $state:ty, $field:ident, $default:expr) => {
        $crate::PropertyDef {
            name: $name,
            ty: $crate::PropertyType::$ptype,
            default: Some($crate::PropValue::$variant(($default as $rust).into())),
            get: |obj| {
                $crate::PropValue::$variant($crate::prop_state::<$state>(obj).$field.get().into())
            },
            set: |obj, v| {
                if let $crate::PropValue::$variant(v) = v {
                    $crate::prop_state::<$state>(obj).$field.set(v as $rust);
                }
            },
        }
    };
}

#[macro_export]
macro_rules! define_prop_bool {
    ($name:expr, $state:ty, $field:ident, $default:expr) => {
        $crate::__define_prop_field!($name, Bool, Bool, bool, $state, $field, $default)
    };
}

#[macro_export]
macro_rules! define_prop_uint8 {
    ($name:expr, $state:ty, $field:ident, $default:expr) => {
        $crate::__define_prop_field!($name, Uint8, Uint, u8, $state, $field, $default)
    };
}

#[macro_export]
macro_rules! define_prop_uint16 {
    ($name:expr, $state:ty, $field:ident, $default:expr) => {
        $crate::__define_prop_field!($name, Uint16, Uint, u16, $state, $field, $default)
    };
}

#[macro_export]
macro_rules! define_prop_uint32 {
    ($name:expr, $state:ty, $field:ident, $default:expr) => {
        $crate::__define_prop_field!($name, Uint32, Uint, u32, $state, $field, $default)
    };
}

#[macro_export]
macro_rules! define_prop_uint64 {
    ($name:expr, $state:ty, $field:ident, $default:expr) => {
        $crate::__define_prop_field!($name, Uint64, Uint, u64, $state, $field, $default)
    };
}

#[macro_export]
macro_rules! define_prop_int32 {
    ($name:expr, $state:ty, $field:ident, $default:expr) => {
        $crate::__define_prop_field!($name, Int32, Int, i32, $state, $field, $default)
    };
}

#[macro_export]
macro_rules! define_prop_hex8 {
    ($name:expr, $state:ty, $field:ident, $default:expr) => {
        $crate::__define_prop_field!($name, Hex8, Uint, u8, $state, $field, $default)
    };
}

#[macro_export]
macro_rules! define_prop_hex32 {
    ($name:expr, $state:ty, $field:ident, $default:expr) => {
        $crate::__define_prop_field!($name, Hex32, Uint, u32, $state, $field, $default)
    };
}

#[macro_export]
macro_rules! define_prop_hex64 {
    ($name:expr, $state:ty, $field:ident, $default:expr) => {
        $crate::__define_prop_field!($name, Hex64, Uint, u64, $state, $field, $default)
    };
}

/// String field stored in a `RefCell<String>`. Strings have no default.
#[macro_export]
macro_rules! define_prop_string {
    ($name:expr, $state:ty, $field:ident) => {
        $crate::PropertyDef {
            name: $name,
            ty: $crate::PropertyType::String,
            default: None,
            get: |obj| $crate::PropValue::Str($crate::prop_state::<$state>(obj).$field.borrow().clone()),
            set: |obj, v| {
                if let $crate::PropValue::Str(v) = v {
                    *$crate::prop_state::<$state>(obj).$field.borrow_mut() = v;
                }
            },
        }
    };
}

#[derive(Clone, Copy)]
enum LinkRef {
    /// Written by the framework itself; does not hold a reference.
    Weak,
    /// Set through the property; holds one reference on the target.
    Counted,
}

/// Storage behind a `link<T>` property. Owners keep a clone to read the target directly.
#[derive(Clone, Default)]
pub struct LinkSlot(Rc<RefCell<Option<(WeakObject, LinkRef)>>>);

impl LinkSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Object> {
        self.0.borrow().as_ref().and_then(|(t, _)| t.upgrade())
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }

    /// Points the slot at `target` without taking a reference.
    pub(crate) fn set_weak(&self, target: Option<&Object>) {
        let prev = self
            .0
            .replace(target.map(|t| (t.downgrade(), LinkRef::Weak)));
        Self::drop_ref(prev);
    }

    fn set_counted(&self, target: Option<&Object>) {
        if let Some(t) = target {
            t.inc_ref();
        }
        let prev = self
            .0
            .replace(target.map(|t| (t.downgrade(), LinkRef::Counted)));
        Self::drop_ref(prev);
    }

    fn drop_ref(prev: Option<(WeakObject, LinkRef)>) {
        if let Some((prev, LinkRef::Counted)) = prev {
            if let Some(prev) = prev.upgrade() {
                prev.dec_ref();
            }
        }
    }
}

#[derive(Clone)]
pub(crate) enum PropertyKind {
    Scalar {
        get: Option<PropGetter>,
        set: Option<PropSetter>,
        release: Option<PropRelease>,
    },
    Child(Object),
    Link(LinkSlot),
    Legacy(PropertyDef),
}

#[derive(Clone)]
pub struct Property {
    name: String,
    type_tag: String,
    pub(crate) kind: PropertyKind,
}

impl Property {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn child(&self) -> Option<&Object> {
        match &self.kind {
            PropertyKind::Child(c) => Some(c),
            _ => None,
        }
    }

    pub fn link_target(&self) -> Option<Object> {
        match &self.kind {
            PropertyKind::Link(slot) => slot.get(),
            _ => None,
        }
    }

    pub fn is_link(&self) -> bool {
        matches!(self.kind, PropertyKind::Link(_))
    }
}

/// Device properties may only change before realize.
fn ensure_writable(obj: &Object, name: &str) -> Result<()> {
    match obj.state::<DeviceState>() {
        Some(dev) if dev.dev_state() != DevState::Created => {
            Err(DevModelError::PermissionDenied(name.to_string()))
        }
        _ => Ok(()),
    }
}

fn release(model: &DeviceModel, owner: &Object, prop: Property) {
    match prop.kind {
        PropertyKind::Scalar {
            release: Some(release),
            ..
        } => release(model, owner),
        PropertyKind::Scalar { .. } | PropertyKind::Legacy(_) => {}
        PropertyKind::Child(child) => {
            child.set_parent(None);
            child.dec_ref();
            // Children go down with their owner.
            if !owner.is_live() && child.is_live() {
                if let Err(err) = model.delete(&child) {
                    tracing::error!(child = %prop.name, %err, "failed to finalize child");
                }
            }
        }
        PropertyKind::Link(slot) => slot.set_counted(None),
    }
}

impl Object {
    fn add_property(&self, prop: Property) -> Result<()> {
        let mut props = self.0.properties.borrow_mut();
        if props.iter().any(|p| p.name == prop.name) {
            return Err(DevModelError::DuplicateProperty(prop.name));
        }
        props.push(prop);
        Ok(())
    }

    pub fn property_add(
        &self,
        name: impl Into<String>,
        type_tag: impl Into<String>,
        get: Option<PropGetter>,
        set: Option<PropSetter>,
        release: Option<PropRelease>,
    ) -> Result<()> {
        self.add_property(Property {
            name: name.into(),
            type_tag: type_tag.into(),
            kind: PropertyKind::Scalar { get, set, release },
        })
    }

    pub fn property_find(&self, name: &str) -> Option<Property> {
        self.0
            .properties
            .borrow()
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    fn property(&self, name: &str) -> Result<Property> {
        self.property_find(name)
            .ok_or_else(|| DevModelError::UnknownProperty(name.to_string()))
    }

    pub fn property_get_type(&self, name: &str) -> Result<String> {
        Ok(self.property(name)?.type_tag)
    }

    pub fn property_names(&self) -> Vec<String> {
        self.0
            .properties
            .borrow()
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn properties(&self) -> Vec<Property> {
        self.0.properties.borrow().clone()
    }

    pub fn property_del(&self, model: &DeviceModel, name: &str) -> Result<()> {
        let prop = {
            let mut props = self.0.properties.borrow_mut();
            let idx = props
                .iter()
                .position(|p| p.name == name)
                .ok_or_else(|| DevModelError::UnknownProperty(name.to_string()))?;
            props.remove(idx)
        };
        release(model, self, prop);
        Ok(())
    }

    pub(crate) fn property_del_all(&self, model: &DeviceModel) {
        loop {
            let prop = {
                let mut props = self.0.properties.borrow_mut();
                if props.is_empty() {
                    break;
                }
                props.remove(0)
            };
            release(model, self, prop);
        }
    }

    pub fn property_get(&self, model: &DeviceModel, name: &str) -> Result<Value> {
        let prop = self.property(name)?;
        match prop.kind {
            PropertyKind::Scalar { get, .. } => {
                let get = get.ok_or_else(|| DevModelError::PermissionDenied(name.to_string()))?;
                get(model, self)
            }
            PropertyKind::Child(child) => Ok(Value::String(model.canonical_path(&child))),
            PropertyKind::Link(slot) => Ok(Value::String(
                slot.get()
                    .map(|t| model.canonical_path(&t))
                    .unwrap_or_default(),
            )),
            PropertyKind::Legacy(def) => Ok(Value::String(def.ty.print(&(def.get)(self)))),
        }
    }

    pub fn property_set(&self, model: &DeviceModel, name: &str, value: Value) -> Result<()> {
        let prop = self.property(name)?;
        match prop.kind {
            PropertyKind::Scalar { set, .. } => {
                let set = set.ok_or_else(|| DevModelError::PermissionDenied(name.to_string()))?;
                set(model, self, value)
            }
            PropertyKind::Child(_) => Err(DevModelError::PermissionDenied(name.to_string())),
            PropertyKind::Link(slot) => {
                let Value::String(path) = value else {
                    return Err(DevModelError::InvalidParameter {
                        property: name.to_string(),
                        value: value.to_string(),
                    });
                };
                if path.is_empty() {
                    slot.set_counted(None);
                    return Ok(());
                }
                let target = model
                    .resolve_path(&path)
                    .found()
                    .ok_or_else(|| DevModelError::DeviceNotFound(path.clone()))?;
                let target_tag = format!("link<{}>", target.type_name());
                if target_tag != prop.type_tag {
                    return Err(DevModelError::TypeMismatch {
                        name: name.to_string(),
                        expected: prop.type_tag,
                    });
                }
                slot.set_counted(Some(&target));
                Ok(())
            }
            PropertyKind::Legacy(def) => {
                ensure_writable(self, name)?;
                let invalid = || DevModelError::InvalidParameter {
                    property: name.to_string(),
                    value: value.to_string(),
                };
                let text = value.as_str().ok_or_else(invalid)?;
                let parsed = def.ty.parse(text).ok_or_else(invalid)?;
                (def.set)(self, parsed);
                Ok(())
            }
        }
    }

    /// Attaches `child` under `name`. The child must not already have a parent.
    pub fn property_add_child(&self, name: impl Into<String>, child: &Object) -> Result<()> {
        assert!(
            child.parent().is_none(),
            "`{}` already has a parent",
            child.type_name()
        );
        self.add_property(Property {
            name: name.into(),
            type_tag: format!("child<{}>", child.type_name()),
            kind: PropertyKind::Child(child.clone()),
        })?;
        child.inc_ref();
        child.set_parent(Some(self));
        Ok(())
    }

    /// Removes the `child<>` property pointing at `child`, if any.
    pub(crate) fn property_del_child(&self, model: &DeviceModel, child: &Object) -> bool {
        let name = self
            .0
            .properties
            .borrow()
            .iter()
            .find(|p| p.child().is_some_and(|c| c.ptr_eq(child)))
            .map(|p| p.name.clone());
        match name {
            Some(name) => self.property_del(model, &name).is_ok(),
            None => false,
        }
    }

    pub fn property_add_link(
        &self,
        name: impl Into<String>,
        target_type: &str,
        slot: LinkSlot,
    ) -> Result<()> {
        self.add_property(Property {
            name: name.into(),
            type_tag: format!("link<{target_type}>"),
            kind: PropertyKind::Link(slot),
        })
    }

    /// String property with plain closure accessors.
    pub fn property_add_str(
        &self,
        name: impl Into<String>,
        get: Option<StrGetter>,
        set: Option<StrSetter>,
    ) -> Result<()> {
        let name = name.into();
        let getter: Option<PropGetter> = get.map(|get| {
            Rc::new(move |_: &DeviceModel, obj: &Object| -> Result<Value> {
                Ok(Value::String(get(obj)))
            }) as PropGetter
        });
        let setter: Option<PropSetter> = set.map(|set| {
            let name = name.clone();
            Rc::new(move |_: &DeviceModel, obj: &Object, v: Value| -> Result<()> {
                match v.as_str() {
                    Some(s) => set(obj, s),
                    None => Err(DevModelError::InvalidParameter {
                        property: name.clone(),
                        value: v.to_string(),
                    }),
                }
            }) as PropSetter
        });
        self.property_add(name, "string", getter, setter, None)
    }

    /// Registers `def` under `legacy-<name>` as a string facade.
    pub fn property_add_legacy(&self, def: &PropertyDef) -> Result<()> {
        self.add_property(Property {
            name: format!("legacy-{}", def.name),
            type_tag: format!("legacy<{}>", def.ty.legacy_name()),
            kind: PropertyKind::Legacy(def.clone()),
        })
    }

    /// Registers `def` under its own name with typed JSON values.
    pub fn property_add_static(&self, def: &PropertyDef) -> Result<()> {
        let get_def = def.clone();
        let set_def = def.clone();
        let getter: PropGetter = Rc::new(move |_: &DeviceModel, obj: &Object| -> Result<Value> {
            Ok(get_def.ty.to_json(&(get_def.get)(obj)))
        });
        let setter: PropSetter = Rc::new(move |_: &DeviceModel, obj: &Object, v: Value| -> Result<()> {
            ensure_writable(obj, set_def.name)?;
            let parsed = set_def
                .ty
                .from_json(&v)
                .ok_or_else(|| DevModelError::InvalidParameter {
                    property: set_def.name.to_string(),
                    value: v.to_string(),
                })?;
            (set_def.set)(obj, parsed);
            Ok(())
        });
        self.property_add(def.name, def.ty.name(), Some(getter), Some(setter), None)
    }

    pub fn child_properties(&self) -> Vec<(String, Object)> {
        self.0
            .properties
            .borrow()
            .iter()
            .filter_map(|p| p.child().map(|c| (p.name.clone(), c.clone())))
            .collect()
    }
}
