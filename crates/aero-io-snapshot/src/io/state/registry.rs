use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::{SnapshotError, SnapshotHeader, SnapshotResult, VmStateDescription};

/// A unit of state the registry can save and restore.
pub trait SnapshotSection {
    fn section_name(&self) -> &str;
    fn version_id(&self) -> u16;
    fn save(&self) -> Vec<u8>;
    fn load(&self, bytes: &[u8]) -> SnapshotResult<()>;
}

/// Binds a static descriptor to the state it serializes.
pub struct VmStateSection<T: 'static> {
    vmsd: &'static VmStateDescription<T>,
    opaque: T,
}

impl<T: 'static> VmStateSection<T> {
    pub fn new(vmsd: &'static VmStateDescription<T>, opaque: T) -> Self {
        Self { vmsd, opaque }
    }

    pub fn opaque(&self) -> &T {
        &self.opaque
    }
}

impl<T: 'static> SnapshotSection for VmStateSection<T> {
    fn section_name(&self) -> &str {
        self.vmsd.name
    }

    fn version_id(&self) -> u16 {
        self.vmsd.version_id
    }

    fn save(&self) -> Vec<u8> {
        self.vmsd.save(&self.opaque)
    }

    fn load(&self, bytes: &[u8]) -> SnapshotResult<()> {
        self.vmsd.load(&self.opaque, bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(u64);

/// One saved section as produced by [`SnapshotRegistry::save_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedSection {
    pub name: String,
    pub instance_id: u32,
    pub version_id: u16,
    pub bytes: Vec<u8>,
}

struct Entry {
    id: SectionId,
    name: String,
    instance_id: u32,
    alias_id: Option<u32>,
    required_for_version: u16,
    section: Rc<dyn SnapshotSection>,
}

impl Entry {
    fn matches(&self, saved: &SavedSection) -> bool {
        if self.name != saved.name {
            return false;
        }
        if self.instance_id == saved.instance_id {
            return true;
        }
        // Streams written before the section got its current instance numbering refer to it by
        // the alias id.
        self.alias_id == Some(saved.instance_id) && saved.version_id < self.required_for_version
    }
}

/// Machine-wide list of snapshot sections, in registration order.
#[derive(Default)]
pub struct SnapshotRegistry {
    entries: RefCell<Vec<Entry>>,
    next_id: Cell<u64>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance_id: Option<u32>, section: Rc<dyn SnapshotSection>) -> SectionId {
        self.register_with_alias(instance_id, section, None, 0)
    }

    /// Registers `section`. `None` for `instance_id` picks the next free id for the section
    /// name.
    pub fn register_with_alias(
        &self,
        instance_id: Option<u32>,
        section: Rc<dyn SnapshotSection>,
        alias_id: Option<u32>,
        required_for_version: u16,
    ) -> SectionId {
        let name = section.section_name().to_string();
        let id = SectionId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        let mut entries = self.entries.borrow_mut();
        let instance_id = instance_id.unwrap_or_else(|| {
            entries
                .iter()
                .filter(|e| e.name == name)
                .map(|e| e.instance_id + 1)
                .max()
                .unwrap_or(0)
        });
        tracing::debug!(section = %name, instance_id, ?alias_id, "registered snapshot section");
        entries.push(Entry {
            id,
            name,
            instance_id,
            alias_id,
            required_for_version,
            section,
        });
        id
    }

    pub fn unregister(&self, id: SectionId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.borrow().iter().any(|e| e.name == name)
    }

    pub fn instance_id(&self, id: SectionId) -> Option<u32> {
        self.entries
            .borrow()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.instance_id)
    }

    pub fn save_all(&self) -> Vec<SavedSection> {
        let sections: Vec<_> = self
            .entries
            .borrow()
            .iter()
            .map(|e| (e.name.clone(), e.instance_id, e.section.clone()))
            .collect();

        sections
            .into_iter()
            .map(|(name, instance_id, section)| SavedSection {
                name,
                instance_id,
                version_id: section.version_id(),
                bytes: section.save(),
            })
            .collect()
    }

    pub fn load_all(&self, saved: &[SavedSection]) -> SnapshotResult<()> {
        for s in saved {
            let version_id = SnapshotHeader::parse(&s.bytes)?.0.device_version.major;
            let wanted = SavedSection {
                version_id,
                ..s.clone()
            };
            let section = self
                .entries
                .borrow()
                .iter()
                .find(|e| e.matches(&wanted))
                .map(|e| e.section.clone())
                .ok_or_else(|| SnapshotError::UnknownSection {
                    section: s.name.clone(),
                    instance_id: s.instance_id,
                })?;
            section.load(&s.bytes)?;
        }
        Ok(())
    }
}
