//! The machine context.
//!
//! [`DeviceModel`] owns everything that is machine-wide: the type registry, the composition root,
//! the main system bus, hot-plug bookkeeping, global property defaults, the reset handler list and
//! the snapshot section registry. Every framework operation takes it explicitly.

use std::cell::{Cell, OnceCell, RefCell};

use aero_io_snapshot::io::state::SnapshotRegistry;
use aero_platform::reset::{ResetHandlers, ResetKind, ResetLatch};

use crate::bus::{bus_type_info, system_bus_type_info, Bus};
use crate::device::device_type_info;
use crate::error::{DevModelError, Result};
use crate::globals::{DeviceModelConfig, GlobalProperty};
use crate::object::{Lifecycle, Object};
use crate::pin::pin_type_info;
use crate::types::{TypeInfo, TypeRegistry};
use crate::{TYPE_CONTAINER, TYPE_OBJECT};

pub struct DeviceModel {
    types: TypeRegistry,
    root: OnceCell<Object>,
    main_bus: OnceCell<Bus>,
    hotplug: Cell<bool>,
    hot_added: Cell<bool>,
    hot_removed: Cell<bool>,
    globals: RefCell<Vec<GlobalProperty>>,
    reset_handlers: ResetHandlers,
    reset_latch: ResetLatch,
    snapshots: SnapshotRegistry,
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_types() -> [TypeInfo; 6] {
    [
        TypeInfo {
            is_abstract: true,
            ..TypeInfo::new(TYPE_OBJECT, None)
        },
        TypeInfo::new(TYPE_CONTAINER, Some(TYPE_OBJECT)),
        device_type_info(),
        bus_type_info(),
        system_bus_type_info(),
        pin_type_info(),
    ]
}

impl DeviceModel {
    pub fn new() -> Self {
        let model = Self {
            types: TypeRegistry::new(),
            root: OnceCell::new(),
            main_bus: OnceCell::new(),
            hotplug: Cell::new(false),
            hot_added: Cell::new(false),
            hot_removed: Cell::new(false),
            globals: RefCell::new(Vec::new()),
            reset_handlers: ResetHandlers::new(),
            reset_latch: ResetLatch::new(),
            snapshots: SnapshotRegistry::new(),
        };
        for info in builtin_types() {
            if let Err(err) = model.types.register(info) {
                unreachable!("builtin type registered twice: {err}");
            }
        }
        model
    }

    pub fn with_config(config: DeviceModelConfig) -> Self {
        let model = Self::new();
        model.register_globals(config.globals);
        model
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn register_type(&self, info: TypeInfo) -> Result<()> {
        self.types.register(info)
    }

    /// Whether `type_name` is a registered type.
    pub fn exists(&self, type_name: &str) -> bool {
        self.types.contains(type_name)
    }

    /// Instantiates `type_name`: allocates one state block per type in the chain that declares
    /// one, then runs the instance initializers from the root type down.
    pub fn new_object(&self, type_name: &str) -> Result<Object> {
        let info = self
            .types
            .lookup(type_name)
            .ok_or_else(|| DevModelError::UnknownType(type_name.to_string()))?;
        if info.is_abstract {
            return Err(DevModelError::AbstractType(type_name.to_string()));
        }
        let class = self.types.class(type_name)?;
        let chain = self.types.chain(type_name)?;

        let layers = chain
            .iter()
            .filter_map(|t| t.instance_state.map(|new_state| new_state()))
            .collect();
        let obj = Object::with_layers(class, layers);
        for t in &chain {
            if let Some(init) = t.instance_init {
                init(self, &obj)?;
            }
        }
        Ok(obj)
    }

    /// Drops the creation reference and finalizes `obj`.
    ///
    /// Finalizers run from the leaf type up; the first error is returned but the remaining
    /// finalizers and the property teardown still run. Deleting an object that is already being
    /// (or has been) finalized does nothing.
    pub fn delete(&self, obj: &Object) -> Result<()> {
        if !obj.is_live() {
            return Ok(());
        }
        obj.set_lifecycle(Lifecycle::Finalizing);
        obj.dec_ref();

        let mut result = Ok(());
        for type_name in obj.class().ancestry() {
            let finalize = self
                .types
                .lookup(type_name)
                .and_then(|t| t.instance_finalize);
            if let Some(finalize) = finalize {
                if let Err(err) = finalize(self, obj) {
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        obj.property_del_all(self);
        obj.set_lifecycle(Lifecycle::Finalized);
        result
    }

    /// The root container every canonical path starts from.
    pub fn root(&self) -> Object {
        self.root
            .get_or_init(|| {
                self.new_object(TYPE_CONTAINER)
                    .unwrap_or_else(|err| panic!("failed to create the root container: {err}"))
            })
            .clone()
    }

    /// The default bus, created on first use and attached to the root as `sysbus`.
    pub fn main_system_bus(&self) -> Bus {
        if let Some(bus) = self.main_bus.get() {
            return bus.clone();
        }
        let bus = self
            .main_bus_create()
            .unwrap_or_else(|err| panic!("failed to create the main system bus: {err}"));
        self.main_bus.get_or_init(|| bus).clone()
    }

    pub(crate) fn is_main_system_bus(&self, bus: &Bus) -> bool {
        self.main_bus.get().is_some_and(|main| main == bus)
    }

    /// From now on every new device counts as hot-plugged.
    pub fn machine_creation_done(&self) {
        self.hotplug.set(true);
    }

    pub fn hotplug_enabled(&self) -> bool {
        self.hotplug.get()
    }

    /// Whether any device was hot-added or hot-removed since boot.
    pub fn machine_modified(&self) -> bool {
        self.hot_added.get() || self.hot_removed.get()
    }

    pub(crate) fn mark_hot_added(&self) {
        self.hot_added.set(true);
    }

    pub(crate) fn mark_hot_removed(&self) {
        self.hot_removed.set(true);
    }

    pub fn register_global(&self, global: GlobalProperty) {
        self.globals.borrow_mut().push(global);
    }

    pub fn register_globals(&self, globals: impl IntoIterator<Item = GlobalProperty>) {
        self.globals.borrow_mut().extend(globals);
    }

    pub fn globals(&self) -> Vec<GlobalProperty> {
        self.globals.borrow().clone()
    }

    pub fn reset_handlers(&self) -> &ResetHandlers {
        &self.reset_handlers
    }

    /// Latch devices report reset requests into; see [`DeviceModel::service_reset_request`].
    pub fn reset_latch(&self) -> &ResetLatch {
        &self.reset_latch
    }

    pub fn snapshots(&self) -> &SnapshotRegistry {
        &self.snapshots
    }

    /// Resets the main system bus tree, then runs every registered reset handler.
    pub fn reset_machine(&self) {
        self.main_system_bus().reset_all();
        self.reset_handlers.run();
    }

    /// Consumes a pending reset request. A system reset is carried out here; the request kind is
    /// returned either way.
    pub fn service_reset_request(&self) -> Option<ResetKind> {
        let kind = self.reset_latch.take()?;
        tracing::debug!(?kind, "servicing reset request");
        if kind == ResetKind::System {
            self.reset_machine();
        }
        Some(kind)
    }
}
