//! Canonical paths through the composition tree.
//!
//! A path is a `/`-separated list of property names starting at the root container. Absolute
//! paths (`/a/b`) follow `child<>` and `link<>` properties from the root; partial paths (`b`)
//! match anywhere in the tree as long as the match is unique.

use crate::model::DeviceModel;
use crate::object::Object;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathLookup {
    Found(Object),
    NotFound,
    /// A partial path matched more than one object.
    Ambiguous,
}

impl PathLookup {
    pub fn found(self) -> Option<Object> {
        match self {
            Self::Found(obj) => Some(obj),
            Self::NotFound | Self::Ambiguous => None,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Ambiguous)
    }
}

fn resolve_abs(start: &Object, parts: &[&str]) -> Option<Object> {
    let mut cur = start.clone();
    for part in parts.iter().filter(|p| !p.is_empty()) {
        let prop = cur.property_find(part)?;
        cur = match prop.child() {
            Some(child) => child.clone(),
            None => prop.link_target()?,
        };
    }
    Some(cur)
}

fn resolve_partial(parent: &Object, parts: &[&str]) -> PathLookup {
    let mut found = resolve_abs(parent, parts);
    for (_, child) in parent.child_properties() {
        match resolve_partial(&child, parts) {
            PathLookup::Ambiguous => return PathLookup::Ambiguous,
            PathLookup::Found(obj) => {
                if found.is_some() {
                    return PathLookup::Ambiguous;
                }
                found = Some(obj);
            }
            PathLookup::NotFound => {}
        }
    }
    found.map_or(PathLookup::NotFound, PathLookup::Found)
}

impl DeviceModel {
    /// Path of `obj` from the root.
    ///
    /// Panics if `obj` is not attached to the tree; every live object reachable by the caller
    /// must have exactly one owning `child<>` edge.
    pub fn canonical_path(&self, obj: &Object) -> String {
        let root = self.root();
        let mut segments = Vec::new();
        let mut cur = obj.clone();
        while !cur.ptr_eq(&root) {
            let parent = cur.parent().unwrap_or_else(|| {
                panic!("`{}` is not attached to the composition tree", cur.type_name())
            });
            let name = parent
                .child_properties()
                .into_iter()
                .find(|(_, child)| child.ptr_eq(&cur))
                .map(|(name, _)| name)
                .unwrap_or_else(|| {
                    panic!(
                        "`{}` has no child property for `{}`",
                        parent.type_name(),
                        cur.type_name()
                    )
                });
            segments.push(name);
            cur = parent;
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    pub fn resolve_path(&self, path: &str) -> PathLookup {
        let root = self.root();
        if path.is_empty() {
            return PathLookup::Found(root);
        }
        let parts: Vec<&str> = path.split('/').collect();
        if parts[0].is_empty() {
            resolve_abs(&root, &parts[1..]).map_or(PathLookup::NotFound, PathLookup::Found)
        } else {
            resolve_partial(&root, &parts)
        }
    }
}
