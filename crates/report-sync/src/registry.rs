//! Subscription registry: `report_id -> ordered observer set`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::events::ReportObserver;

/// Synthetic key whose observers receive events for every report.
pub const GLOBAL_REPORT_ID: &str = "global";

/// Identifier of one registration, returned by `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Registration {
    id: ObserverId,
    observer: Arc<dyn ReportObserver>,
}

/// Keyed fan-out table. A report key exists only while it has observers.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_id: u64,
    reports: HashMap<String, Vec<Registration>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observer. Registering the same `Arc` twice for a report
    /// returns the existing id instead of adding a second entry.
    pub fn register(&mut self, report_id: &str, observer: Arc<dyn ReportObserver>) -> ObserverId {
        let entries = self.reports.entry(report_id.to_string()).or_default();
        if let Some(existing) = entries
            .iter()
            .find(|r| std::ptr::addr_eq(Arc::as_ptr(&r.observer), Arc::as_ptr(&observer)))
        {
            return existing.id;
        }

        self.next_id += 1;
        let id = ObserverId(self.next_id);
        entries.push(Registration { id, observer });
        id
    }

    /// Removes an observer and returns how many remain for the report.
    ///
    /// Returns `None` when the registration was already gone.
    pub fn unregister(&mut self, report_id: &str, id: ObserverId) -> Option<usize> {
        let entries = self.reports.get_mut(report_id)?;
        let before = entries.len();
        entries.retain(|r| r.id != id);
        if entries.len() == before {
            return None;
        }

        let remaining = entries.len();
        if remaining == 0 {
            self.reports.remove(report_id);
        }
        Some(remaining)
    }

    /// Observers to notify for an event on `report_id`: the report's own
    /// observers in registration order, then the global ones.
    pub fn observers_for(&self, report_id: &str) -> Vec<Arc<dyn ReportObserver>> {
        let mut observers: Vec<Arc<dyn ReportObserver>> = self
            .reports
            .get(report_id)
            .map(|entries| entries.iter().map(|r| r.observer.clone()).collect())
            .unwrap_or_default();

        if report_id != GLOBAL_REPORT_ID {
            if let Some(global) = self.reports.get(GLOBAL_REPORT_ID) {
                observers.extend(global.iter().map(|r| r.observer.clone()));
            }
        }
        observers
    }

    pub fn observer_count(&self, report_id: &str) -> usize {
        self.reports.get(report_id).map_or(0, Vec::len)
    }

    /// Report ids with at least one observer, excluding the global key.
    pub fn report_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .reports
            .keys()
            .filter(|id| id.as_str() != GLOBAL_REPORT_ID)
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn total_observers(&self) -> usize {
        self.reports.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.reports.clear();
    }
}
