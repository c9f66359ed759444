//! Interrupt line plumbing shared by device models and board code.

use std::cell::Cell;
use std::rc::Rc;

/// A level-sensitive interrupt input.
pub trait IrqLine {
    fn set_level(&self, level: bool);
}

impl<T: IrqLine + ?Sized> IrqLine for Rc<T> {
    fn set_level(&self, level: bool) {
        (**self).set_level(level);
    }
}

/// Remembers the level driven onto it and counts transitions.
///
/// Board code uses this as the terminal sink of a line (e.g. the A20 gate); tests use it to
/// observe what a device drove.
#[derive(Debug, Clone, Default)]
pub struct LevelLatch {
    level: Rc<Cell<bool>>,
    transitions: Rc<Cell<u64>>,
}

impl LevelLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> bool {
        self.level.get()
    }

    pub fn transitions(&self) -> u64 {
        self.transitions.get()
    }
}

impl IrqLine for LevelLatch {
    fn set_level(&self, level: bool) {
        if self.level.replace(level) != level {
            self.transitions.set(self.transitions.get() + 1);
        }
    }
}

/// The A20 gate is just a latched line; the memory bus samples it.
pub type A20GateHandle = LevelLatch;

pub const ISA_IRQ_COUNT: usize = 16;

/// The sixteen legacy ISA interrupt inputs.
#[derive(Debug, Clone, Default)]
pub struct IsaIrqLines {
    lines: [LevelLatch; ISA_IRQ_COUNT],
}

impl IsaIrqLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle driving ISA input `irq`.
    pub fn pin(&self, irq: u8) -> Rc<dyn IrqLine> {
        Rc::new(self.line(irq).clone())
    }

    pub fn line(&self, irq: u8) -> &LevelLatch {
        let idx = usize::from(irq);
        assert!(idx < ISA_IRQ_COUNT, "ISA IRQ {irq} out of range");
        &self.lines[idx]
    }

    pub fn level(&self, irq: u8) -> bool {
        self.line(irq).level()
    }
}
