//! Memory regions with MMIO dispatch.
//!
//! A region is either an I/O region backed by an [`MmioHandler`] or a container that routes
//! accesses to subregions mapped at offsets inside it. Subregions added with
//! [`MemoryRegion::add_subregion`] may not overlap each other; those added with
//! [`MemoryRegion::add_subregion_overlap`] carry a priority and may shadow other mappings.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

pub trait MmioHandler {
    fn read(&mut self, offset: u64, size: usize) -> u64;
    fn write(&mut self, offset: u64, size: usize, value: u64);
}

enum RegionKind {
    Io(RefCell<Box<dyn MmioHandler>>),
    Container {
        subregions: RefCell<Vec<Subregion>>,
        next_seq: Cell<u64>,
    },
}

struct RegionInner {
    name: String,
    size: u64,
    mapped: Cell<bool>,
    kind: RegionKind,
}

struct Subregion {
    offset: u64,
    priority: i32,
    may_overlap: bool,
    seq: u64,
    region: MemoryRegion,
}

impl Subregion {
    fn end_exclusive(&self) -> u128 {
        u128::from(self.offset) + u128::from(self.region.size())
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.offset && u128::from(addr) < self.end_exclusive()
    }
}

/// Cheaply cloneable handle to a region; clones refer to the same region.
#[derive(Clone)]
pub struct MemoryRegion(Rc<RegionInner>);

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("name", &self.0.name)
            .field("size", &self.0.size)
            .field("container", &self.is_container())
            .finish()
    }
}

fn float_high(size: usize) -> u64 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        4 => 0xFFFF_FFFF,
        _ => u64::MAX,
    }
}

fn size_mask(size: usize) -> u64 {
    float_high(size)
}

impl MemoryRegion {
    pub fn new_io(name: impl Into<String>, size: u64, handler: impl MmioHandler + 'static) -> Self {
        Self(Rc::new(RegionInner {
            name: name.into(),
            size,
            mapped: Cell::new(false),
            kind: RegionKind::Io(RefCell::new(Box::new(handler))),
        }))
    }

    pub fn new_container(name: impl Into<String>, size: u64) -> Self {
        Self(Rc::new(RegionInner {
            name: name.into(),
            size,
            mapped: Cell::new(false),
            kind: RegionKind::Container {
                subregions: RefCell::new(Vec::new()),
                next_seq: Cell::new(0),
            },
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn size(&self) -> u64 {
        self.0.size
    }

    pub fn is_container(&self) -> bool {
        matches!(self.0.kind, RegionKind::Container { .. })
    }

    pub fn is_mapped(&self) -> bool {
        self.0.mapped.get()
    }

    pub fn ptr_eq(&self, other: &MemoryRegion) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Maps `region` at `offset`. Panics if it collides with another non-overlapping mapping.
    pub fn add_subregion(&self, offset: u64, region: &MemoryRegion) {
        self.insert_subregion(offset, region, 0, false);
    }

    /// Maps `region` at `offset` with `priority`; higher priorities shadow lower ones and equal
    /// priorities resolve to the most recent mapping.
    pub fn add_subregion_overlap(&self, offset: u64, region: &MemoryRegion, priority: i32) {
        self.insert_subregion(offset, region, priority, true);
    }

    fn insert_subregion(&self, offset: u64, region: &MemoryRegion, priority: i32, may_overlap: bool) {
        let RegionKind::Container {
            subregions,
            next_seq,
        } = &self.0.kind
        else {
            panic!("memory region `{}` is not a container", self.0.name);
        };
        assert!(
            !region.is_mapped(),
            "memory region `{}` is already mapped",
            region.name()
        );
        assert!(!region.ptr_eq(self), "memory region mapped into itself");

        let new = Subregion {
            offset,
            priority,
            may_overlap,
            seq: next_seq.get(),
            region: region.clone(),
        };
        next_seq.set(new.seq + 1);

        let mut subs = subregions.borrow_mut();
        if !may_overlap {
            for other in subs.iter().filter(|s| !s.may_overlap) {
                let disjoint = new.end_exclusive() <= u128::from(other.offset)
                    || other.end_exclusive() <= u128::from(new.offset);
                assert!(
                    disjoint,
                    "overlapping memory regions in `{}`: new `{}` at {:#x}..{:#x}, existing `{}` at {:#x}..{:#x}",
                    self.0.name,
                    region.name(),
                    new.offset,
                    new.end_exclusive(),
                    other.region.name(),
                    other.offset,
                    other.end_exclusive(),
                );
            }
        }

        // Dispatch order: highest priority first, newest first among equals.
        let idx = subs.partition_point(|s| (s.priority, s.seq) > (new.priority, new.seq));
        subs.insert(idx, new);
        region.0.mapped.set(true);
        tracing::debug!(
            container = %self.0.name,
            region = %region.name(),
            offset,
            priority,
            "mapped memory region"
        );
    }

    /// Unmaps `region`. Returns `false` if it was not mapped here.
    pub fn del_subregion(&self, region: &MemoryRegion) -> bool {
        let RegionKind::Container { subregions, .. } = &self.0.kind else {
            return false;
        };
        let mut subs = subregions.borrow_mut();
        let Some(idx) = subs.iter().position(|s| s.region.ptr_eq(region)) else {
            return false;
        };
        subs.remove(idx);
        region.0.mapped.set(false);
        true
    }

    fn route(&self, addr: u64) -> Option<(MemoryRegion, u64)> {
        let RegionKind::Container { subregions, .. } = &self.0.kind else {
            return None;
        };
        subregions
            .borrow()
            .iter()
            .find(|s| s.contains(addr))
            .map(|s| (s.region.clone(), addr - s.offset))
    }

    pub fn read(&self, addr: u64, size: usize) -> u64 {
        // Zero-sized accesses are no-ops.
        if size == 0 {
            return 0;
        }
        if !matches!(size, 1 | 2 | 4 | 8) || addr >= self.0.size {
            return float_high(size);
        }
        match &self.0.kind {
            RegionKind::Io(handler) => handler.borrow_mut().read(addr, size) & size_mask(size),
            RegionKind::Container { .. } => match self.route(addr) {
                Some((region, offset)) => region.read(offset, size),
                None => float_high(size),
            },
        }
    }

    pub fn write(&self, addr: u64, size: usize, value: u64) {
        if size == 0 || !matches!(size, 1 | 2 | 4 | 8) || addr >= self.0.size {
            return;
        }
        match &self.0.kind {
            RegionKind::Io(handler) => {
                handler
                    .borrow_mut()
                    .write(addr, size, value & size_mask(size));
            }
            RegionKind::Container { .. } => {
                if let Some((region, offset)) = self.route(addr) {
                    region.write(offset, size, value);
                }
            }
        }
    }

    pub fn read_u8(&self, addr: u64) -> u8 {
        self.read(addr, 1) as u8
    }

    pub fn write_u8(&self, addr: u64, value: u8) {
        self.write(addr, 1, u64::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recording {
        log: Rc<RefCell<Vec<(u64, usize, Option<u64>)>>>,
        value: u64,
    }

    impl MmioHandler for Recording {
        fn read(&mut self, offset: u64, size: usize) -> u64 {
            self.log.borrow_mut().push((offset, size, None));
            self.value
        }

        fn write(&mut self, offset: u64, size: usize, value: u64) {
            self.log.borrow_mut().push((offset, size, Some(value)));
        }
    }

    fn recording(value: u64) -> (Recording, Rc<RefCell<Vec<(u64, usize, Option<u64>)>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        (
            Recording {
                log: log.clone(),
                value,
            },
            log,
        )
    }

    #[test]
    fn container_routes_relative_offsets() {
        let (dev, log) = recording(0xAB);
        let io = MemoryRegion::new_container("io", 0x1_0000);
        let win = MemoryRegion::new_io("win", 8, dev);
        io.add_subregion(0x60, &win);

        assert_eq!(io.read_u8(0x64), 0xAB);
        io.write_u8(0x60, 0x12);
        assert_eq!(
            log.borrow().as_slice(),
            &[(4, 1, None), (0, 1, Some(0x12))]
        );
    }

    #[test]
    fn unmapped_reads_float_high() {
        let io = MemoryRegion::new_container("io", 0x1_0000);
        assert_eq!(io.read(0x80, 1), 0xFF);
        assert_eq!(io.read(0x80, 2), 0xFFFF);
        assert_eq!(io.read(0x80, 4), 0xFFFF_FFFF);
        assert_eq!(io.read(0x80, 8), u64::MAX);
        assert_eq!(io.read(0x80, 0), 0);
        assert_eq!(io.read(0x80, 3), 0xFFFF_FFFF_FFFF_FFFF);
    }

    #[test]
    fn handler_results_are_masked_to_access_size() {
        let (dev, _log) = recording(0x1234_5678);
        let r = MemoryRegion::new_io("r", 4, dev);
        assert_eq!(r.read(0, 1), 0x78);
        assert_eq!(r.read(0, 2), 0x5678);
    }

    #[test]
    fn overlap_priority_and_recency_pick_the_winner() {
        let (low, _) = recording(1);
        let (high, _) = recording(2);
        let (newer, _) = recording(3);
        let io = MemoryRegion::new_container("io", 0x100);
        let low = MemoryRegion::new_io("low", 0x10, low);
        let high = MemoryRegion::new_io("high", 0x10, high);
        let newer = MemoryRegion::new_io("newer", 0x10, newer);

        io.add_subregion(0x00, &low);
        io.add_subregion_overlap(0x08, &high, 1);
        assert_eq!(io.read_u8(0x04), 1);
        assert_eq!(io.read_u8(0x08), 2);

        io.add_subregion_overlap(0x08, &newer, 1);
        assert_eq!(io.read_u8(0x08), 3);

        assert!(io.del_subregion(&newer));
        assert!(!io.del_subregion(&newer));
        assert_eq!(io.read_u8(0x08), 2);
    }

    #[test]
    #[should_panic(expected = "overlapping memory regions")]
    fn non_overlapping_mappings_reject_collisions() {
        let (a, _) = recording(0);
        let (b, _) = recording(0);
        let io = MemoryRegion::new_container("io", 0x100);
        io.add_subregion(0x00, &MemoryRegion::new_io("a", 0x10, a));
        io.add_subregion(0x0F, &MemoryRegion::new_io("b", 0x10, b));
    }

    #[test]
    fn nested_containers_compose_offsets() {
        let (dev, log) = recording(0x5A);
        let sys = MemoryRegion::new_container("system", 0x1_0000_0000);
        let bank = MemoryRegion::new_container("bank", 0x1000);
        bank.add_subregion(0x100, &MemoryRegion::new_io("dev", 0x10, dev));
        sys.add_subregion(0xFEE0_0000, &bank);

        assert_eq!(sys.read_u8(0xFEE0_0104), 0x5A);
        assert_eq!(log.borrow().as_slice(), &[(4, 1, None)]);
    }
}
