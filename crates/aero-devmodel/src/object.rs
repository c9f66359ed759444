use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{DevModelError, Result};
use crate::property::Property;
use crate::types::ObjectClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Live,
    Finalizing,
    Finalized,
}

pub(crate) struct ObjectInner {
    class: Rc<ObjectClass>,
    /// One state block per type in the chain that declares one, root first.
    layers: Vec<Rc<dyn Any>>,
    refcount: Cell<u32>,
    parent: RefCell<Option<Weak<ObjectInner>>>,
    pub(crate) properties: RefCell<Vec<Property>>,
    lifecycle: Cell<Lifecycle>,
}

/// Handle to an instance. Clones refer to the same instance; the framework-level reference
/// count (see [`Object::refcount`]) is tracked separately from handle clones.
#[derive(Clone)]
pub struct Object(pub(crate) Rc<ObjectInner>);

#[derive(Clone)]
pub struct WeakObject(Weak<ObjectInner>);

impl WeakObject {
    pub fn upgrade(&self) -> Option<Object> {
        self.0.upgrade().map(Object)
    }
}

impl fmt::Debug for WeakObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(obj) => write!(f, "WeakObject({obj:?})"),
            None => f.write_str("WeakObject(<dropped>)"),
        }
    }
}

impl Object {
    pub(crate) fn with_layers(class: Rc<ObjectClass>, layers: Vec<Rc<dyn Any>>) -> Self {
        Self(Rc::new(ObjectInner {
            class,
            layers,
            refcount: Cell::new(1),
            parent: RefCell::new(None),
            properties: RefCell::new(Vec::new()),
            lifecycle: Cell::new(Lifecycle::Live),
        }))
    }

    pub fn type_name(&self) -> &'static str {
        self.0.class.type_name()
    }

    pub fn class(&self) -> &Rc<ObjectClass> {
        &self.0.class
    }

    pub fn is_a(&self, type_name: &str) -> bool {
        self.0.class.is_a(type_name)
    }

    pub fn check_cast(&self, type_name: &str) -> Result<()> {
        if self.is_a(type_name) {
            Ok(())
        } else {
            Err(DevModelError::TypeMismatch {
                name: self.type_name().to_string(),
                expected: type_name.to_string(),
            })
        }
    }

    /// Returns the state block of type `T` contributed by some type in this object's chain.
    pub fn state<T: Any>(&self) -> Option<Rc<T>> {
        self.0
            .layers
            .iter()
            .find_map(|layer| layer.clone().downcast::<T>().ok())
    }

    pub fn refcount(&self) -> u32 {
        self.0.refcount.get()
    }

    pub fn inc_ref(&self) {
        self.0.refcount.set(self.0.refcount.get() + 1);
    }

    pub fn dec_ref(&self) {
        let count = self.0.refcount.get();
        assert!(
            count > 0,
            "reference count underflow on `{}`",
            self.type_name()
        );
        self.0.refcount.set(count - 1);
    }

    pub fn parent(&self) -> Option<Object> {
        self.0.parent.borrow().as_ref().and_then(|p| p.upgrade()).map(Object)
    }

    pub(crate) fn set_parent(&self, parent: Option<&Object>) {
        *self.0.parent.borrow_mut() = parent.map(|p| Rc::downgrade(&p.0));
    }

    pub fn downgrade(&self) -> WeakObject {
        WeakObject(Rc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.0.lifecycle.get()
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.0.lifecycle.set(lifecycle);
    }

    pub fn is_live(&self) -> bool {
        self.lifecycle() == Lifecycle::Live
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Object {}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({} @ {:p})", self.type_name(), Rc::as_ptr(&self.0))
    }
}
