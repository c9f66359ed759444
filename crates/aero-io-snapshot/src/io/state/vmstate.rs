//! Declarative snapshot descriptors.
//!
//! A [`VmStateDescription`] names a section, carries its version window and lists the persistent
//! fields of a device in a fixed order. Each field is stored under tag `index + 1` of a regular
//! [`SnapshotWriter`] blob, so descriptors and hand-written [`super::IoSnapshot`] impls share one
//! wire format.

use super::{SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmFieldKind {
    U8,
    U16,
    U32,
    U64,
}

/// One persistent field. `get`/`set` go through the opaque state the descriptor is bound to.
pub struct VmStateField<T: ?Sized> {
    pub name: &'static str,
    pub kind: VmFieldKind,
    pub get: fn(&T) -> u64,
    pub set: fn(&T, u64),
}

pub struct VmStateDescription<T: ?Sized + 'static> {
    pub name: &'static str,
    pub device_id: [u8; 4],
    pub version_id: u16,
    pub minimum_version_id: u16,
    pub minimum_version_id_old: u16,
    pub fields: &'static [VmStateField<T>],
    /// Runs after every field was applied; receives the version found in the blob.
    pub post_load: Option<fn(&T, u16) -> SnapshotResult<()>>,
}

impl<T: ?Sized + 'static> VmStateDescription<T> {
    pub fn version(&self) -> SnapshotVersion {
        SnapshotVersion::new(self.version_id, 0)
    }

    pub fn save(&self, opaque: &T) -> Vec<u8> {
        let mut w = SnapshotWriter::new(self.device_id, self.version());
        for (tag, field) in (1u16..).zip(self.fields) {
            let v = (field.get)(opaque);
            match field.kind {
                VmFieldKind::U8 => w.field_u8(tag, v as u8),
                VmFieldKind::U16 => w.field_u16(tag, v as u16),
                VmFieldKind::U32 => w.field_u32(tag, v as u32),
                VmFieldKind::U64 => w.field_u64(tag, v),
            }
        }
        w.finish()
    }

    /// Decodes every field before touching `opaque`, so a rejected blob leaves state unchanged.
    pub fn load(&self, opaque: &T, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, self.device_id)?;
        let version = r.header().device_version.major;
        self.check_version(version)?;

        let mut values = Vec::with_capacity(self.fields.len());
        for (tag, field) in (1u16..).zip(self.fields) {
            let v = match field.kind {
                VmFieldKind::U8 => r.u8(tag)?.map(u64::from),
                VmFieldKind::U16 => r.u16(tag)?.map(u64::from),
                VmFieldKind::U32 => r.u32(tag)?.map(u64::from),
                VmFieldKind::U64 => r.u64(tag)?,
            };
            values.push(v.ok_or(SnapshotError::MissingField(field.name))?);
        }

        for (field, v) in self.fields.iter().zip(values) {
            (field.set)(opaque, v);
        }
        tracing::debug!(section = self.name, version, "loaded snapshot section");

        match self.post_load {
            Some(post_load) => post_load(opaque, version),
            None => Ok(()),
        }
    }

    fn check_version(&self, version: u16) -> SnapshotResult<()> {
        if version > self.version_id {
            return Err(SnapshotError::VersionTooNew {
                section: self.name.to_string(),
                version,
                supported: self.version_id,
            });
        }
        // No legacy loader is wired up, so anything below the current minimum is refused even
        // when it falls inside the old window.
        if version < self.minimum_version_id {
            return Err(SnapshotError::VersionTooOld {
                section: self.name.to_string(),
                version,
                minimum: self.minimum_version_id.min(self.minimum_version_id_old),
            });
        }
        Ok(())
    }
}
