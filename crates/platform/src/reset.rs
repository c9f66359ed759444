use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Reset request kind emitted by chipset devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Reset the CPU core(s) while leaving device state intact (warm reset).
    Cpu,
    /// Full system reset (CPU + devices + firmware re-entry).
    System,
}

/// Sink for reset requests coming from device models (e.g. the 8042 output port).
///
/// Devices never reset the machine from inside an access handler. They report the request here
/// and the machine loop applies it between accesses.
pub trait PlatformResetSink {
    fn request_reset(&mut self, kind: ResetKind);
}

impl<F> PlatformResetSink for F
where
    F: FnMut(ResetKind),
{
    fn request_reset(&mut self, kind: ResetKind) {
        self(kind);
    }
}

/// A cloneable reset request latch bridging device requests into the machine loop.
///
/// The latch stores at most one pending request. If several arrive before the machine consumes
/// it, [`ResetKind::System`] wins over [`ResetKind::Cpu`]. The number of requests is counted
/// separately so callers can tell repeated requests apart.
#[derive(Debug, Clone, Default)]
pub struct ResetLatch {
    pending: Rc<Cell<Option<ResetKind>>>,
    requests: Rc<Cell<u64>>,
}

impl ResetLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peek(&self) -> Option<ResetKind> {
        self.pending.get()
    }

    pub fn take(&self) -> Option<ResetKind> {
        self.pending.take()
    }

    pub fn clear(&self) {
        self.pending.set(None);
    }

    /// Total requests observed since creation.
    pub fn request_count(&self) -> u64 {
        self.requests.get()
    }

    fn set_pending(&self, kind: ResetKind) {
        let next = match (self.pending.get(), kind) {
            (Some(ResetKind::System), _) | (_, ResetKind::System) => ResetKind::System,
            _ => ResetKind::Cpu,
        };
        self.pending.set(Some(next));
        self.requests.set(self.requests.get() + 1);
    }
}

impl PlatformResetSink for ResetLatch {
    fn request_reset(&mut self, kind: ResetKind) {
        self.set_pending(kind);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResetHandlerId(u64);

/// Ordered list of callbacks run on every machine reset.
#[derive(Default)]
pub struct ResetHandlers {
    handlers: RefCell<Vec<(ResetHandlerId, Rc<dyn Fn()>)>>,
    next_id: Cell<u64>,
}

impl ResetHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: impl Fn() + 'static) -> ResetHandlerId {
        let id = ResetHandlerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.handlers.borrow_mut().push((id, Rc::new(handler)));
        id
    }

    pub fn unregister(&self, id: ResetHandlerId) -> bool {
        let mut handlers = self.handlers.borrow_mut();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.borrow().is_empty()
    }

    /// Runs every handler in registration order. Handlers may register or unregister others;
    /// changes apply from the next run.
    pub fn run(&self) {
        let snapshot: Vec<_> = self
            .handlers
            .borrow()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in snapshot {
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_request_wins_and_is_counted() {
        let latch = ResetLatch::new();
        let mut sink: Box<dyn PlatformResetSink> = Box::new(latch.clone());
        sink.request_reset(ResetKind::Cpu);
        sink.request_reset(ResetKind::System);
        sink.request_reset(ResetKind::Cpu);

        assert_eq!(latch.peek(), Some(ResetKind::System));
        assert_eq!(latch.request_count(), 3);
        assert_eq!(latch.take(), Some(ResetKind::System));
        assert_eq!(latch.take(), None);
    }

    #[test]
    fn handlers_run_in_order_and_can_be_removed() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let handlers = ResetHandlers::new();
        let a = handlers.register({
            let order = order.clone();
            move || order.borrow_mut().push('a')
        });
        handlers.register({
            let order = order.clone();
            move || order.borrow_mut().push('b')
        });

        handlers.run();
        assert!(handlers.unregister(a));
        assert!(!handlers.unregister(a));
        handlers.run();

        assert_eq!(order.borrow().as_slice(), &['a', 'b', 'b']);
        assert_eq!(handlers.len(), 1);
    }
}
