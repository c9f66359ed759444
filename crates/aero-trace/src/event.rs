use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// A named trace point. Its id is its index in the owning [`TraceEvents`] table.
pub struct TraceEvent {
    name: &'static str,
    enabled: AtomicBool,
}

impl fmt::Debug for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceEvent")
            .field("name", &self.name)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl TraceEvent {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

/// The fixed table of trace points a program declares. Every event starts disabled.
#[derive(Debug, Default)]
pub struct TraceEvents {
    events: Vec<TraceEvent>,
}

impl TraceEvents {
    pub fn new(names: &[&'static str]) -> Self {
        Self {
            events: names
                .iter()
                .map(|&name| TraceEvent {
                    name,
                    enabled: AtomicBool::new(false),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&TraceEvent> {
        usize::try_from(id).ok().and_then(|i| self.events.get(i))
    }

    pub fn id(&self, name: &str) -> Option<u64> {
        self.events
            .iter()
            .position(|e| e.name == name)
            .map(|i| i as u64)
    }

    pub fn is_enabled(&self, id: u64) -> bool {
        self.get(id).is_some_and(TraceEvent::is_enabled)
    }

    /// Enables or disables every event matching `pattern`, which is either an exact name or a
    /// prefix followed by `*`. Returns how many events matched.
    pub fn set_enabled(&self, pattern: &str, enabled: bool) -> usize {
        let matches = |name: &str| match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == pattern,
        };
        let mut count = 0;
        for event in self.events.iter().filter(|e| matches(e.name)) {
            event.set_enabled(enabled);
            count += 1;
        }
        if count == 0 {
            tracing::warn!(pattern, "no trace event matches");
        }
        count
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &TraceEvent)> {
        (0u64..).zip(self.events.iter())
    }
}
