//! Observer trait and implementations.

use std::sync::{Arc, Mutex};

use super::ReportEvent;
use crate::utils::lock;

/// Trait for receiving report events from the bus.
///
/// # Design Rules
///
/// - `on_event()` runs on the bus dispatcher; it must be fast and must not block
/// - A panic inside `on_event()` is caught and logged; other observers still run
/// - Delivery is best-effort and in-process only
pub trait ReportObserver: Send + Sync {
    /// Handle a single event.
    fn on_event(&self, event: &ReportEvent);

    /// Name used in logs when this observer misbehaves.
    fn name(&self) -> &str {
        "observer"
    }
}

impl<F> ReportObserver for F
where
    F: Fn(&ReportEvent) + Send + Sync,
{
    fn on_event(&self, event: &ReportEvent) {
        self(event)
    }

    fn name(&self) -> &str {
        "closure"
    }
}

/// No-op observer for contexts that only need a registration slot.
#[derive(Clone, Default)]
pub struct NoOpObserver;

impl ReportObserver for NoOpObserver {
    fn on_event(&self, _event: &ReportEvent) {}
}

/// Recording observer for testing - collects delivered events.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<ReportEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    pub fn events(&self) -> Vec<ReportEvent> {
        lock(&self.events).clone()
    }

    /// Clears collected events.
    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    /// Returns the number of collected events.
    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    /// Returns true if no events have been collected.
    pub fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }
}

impl ReportObserver for RecordingObserver {
    fn on_event(&self, event: &ReportEvent) {
        lock(&self.events).push(event.clone());
    }

    fn name(&self) -> &str {
        "recording"
    }
}
