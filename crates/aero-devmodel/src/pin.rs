//! Named interrupt pins.
//!
//! A [`Pin`] is an object of type [`TYPE_PIN`] holding a level. Changing the level forwards it to
//! the connected [`IrqLine`] (if any) and then runs the level-change notifiers in registration
//! order, all before [`Pin::set_level`] returns.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use aero_platform::interrupts::IrqLine;
use serde_json::Value;

use crate::error::{DevModelError, Result};
use crate::model::DeviceModel;
use crate::object::Object;
use crate::property::{PropGetter, PropSetter};
use crate::types::TypeInfo;
use crate::TYPE_OBJECT;

pub const TYPE_PIN: &str = "pin";

pub type PinNotifier = Rc<dyn Fn(&Pin)>;

#[derive(Default)]
pub struct PinState {
    level: Cell<bool>,
    sink: RefCell<Option<Rc<dyn IrqLine>>>,
    notifiers: RefCell<Vec<PinNotifier>>,
}

#[derive(Clone)]
pub struct Pin {
    obj: Object,
    state: Rc<PinState>,
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pin")
            .field("obj", &self.obj)
            .field("level", &self.level())
            .finish()
    }
}

impl PartialEq for Pin {
    fn eq(&self, other: &Self) -> bool {
        self.obj == other.obj
    }
}

impl Eq for Pin {}

impl Pin {
    pub fn from_object(obj: &Object) -> Result<Self> {
        obj.check_cast(TYPE_PIN)?;
        let state = obj
            .state::<PinState>()
            .ok_or_else(|| DevModelError::TypeMismatch {
                name: obj.type_name().to_string(),
                expected: TYPE_PIN.to_string(),
            })?;
        Ok(Self {
            obj: obj.clone(),
            state,
        })
    }

    pub fn object(&self) -> &Object {
        &self.obj
    }

    pub fn level(&self) -> bool {
        self.state.level.get()
    }

    pub fn set_level(&self, level: bool) {
        if self.state.level.replace(level) == level {
            return;
        }
        let sink = self.state.sink.borrow().clone();
        if let Some(sink) = sink {
            sink.set_level(level);
        }
        let notifiers = self.state.notifiers.borrow().clone();
        for notify in notifiers {
            notify(self);
        }
    }

    pub fn raise(&self) {
        self.set_level(true);
    }

    pub fn lower(&self) {
        self.set_level(false);
    }

    /// Forwards every future level change to `sink`.
    pub fn connect(&self, sink: Rc<dyn IrqLine>) {
        *self.state.sink.borrow_mut() = Some(sink);
    }

    pub fn connect_pin(&self, target: &Pin) {
        self.connect(Rc::new(target.clone()));
    }

    pub fn disconnect(&self) {
        self.state.sink.borrow_mut().take();
    }

    pub fn is_connected(&self) -> bool {
        self.state.sink.borrow().is_some()
    }

    pub fn add_level_change_notifier(&self, notifier: impl Fn(&Pin) + 'static) {
        self.state.notifiers.borrow_mut().push(Rc::new(notifier));
    }
}

impl IrqLine for Pin {
    fn set_level(&self, level: bool) {
        Pin::set_level(self, level);
    }
}

fn new_pin_state() -> Rc<dyn Any> {
    Rc::new(PinState::default())
}

fn pin_initfn(_model: &DeviceModel, obj: &Object) -> Result<()> {
    let get: PropGetter = Rc::new(|_: &DeviceModel, obj: &Object| -> Result<Value> {
        Ok(Value::Bool(Pin::from_object(obj)?.level()))
    });
    let set: PropSetter = Rc::new(|_: &DeviceModel, obj: &Object, v: Value| -> Result<()> {
        let level = v.as_bool().ok_or_else(|| DevModelError::InvalidParameter {
            property: "level".to_string(),
            value: v.to_string(),
        })?;
        Pin::from_object(obj)?.set_level(level);
        Ok(())
    });
    obj.property_add("level", "bool", Some(get), Some(set), None)
}

pub(crate) fn pin_type_info() -> TypeInfo {
    TypeInfo {
        instance_state: Some(new_pin_state),
        instance_init: Some(pin_initfn),
        ..TypeInfo::new(TYPE_PIN, Some(TYPE_OBJECT))
    }
}

impl DeviceModel {
    pub fn new_pin(&self) -> Result<Pin> {
        let obj = self.new_object(TYPE_PIN)?;
        Pin::from_object(&obj)
    }
}
