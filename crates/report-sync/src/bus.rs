//! Event bus: single FIFO dispatch queue over the subscription registry.
//!
//! Producers (feed forwarders, presence channels, manual triggers) call
//! [`EventBus::dispatch`], which only enqueues. One dispatcher task drains the
//! queue in production order and delivers each event to the report's
//! observers, then to the global observers. A panicking observer is logged
//! and skipped; the remaining observers still receive the event.

use std::sync::{Arc, Mutex};

use log::{debug, error};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{ReportEvent, ReportObserver};
use crate::registry::{ObserverId, SubscriptionRegistry};
use crate::utils::{lock, run_isolated};

/// Cloneable handle to the dispatch queue and its observer registry.
#[derive(Clone)]
pub struct EventBus {
    sender: mpsc::UnboundedSender<ReportEvent>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
}

impl EventBus {
    /// Creates the bus and spawns its dispatcher on the current tokio runtime.
    pub(crate) fn start() -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        let worker = tokio::spawn(dispatch_loop(receiver, registry.clone()));
        debug!("Report event bus dispatcher started");
        (Self { sender, registry }, worker)
    }

    /// Enqueues an event for delivery. Never blocks.
    pub fn dispatch(&self, event: ReportEvent) {
        if let Err(e) = self.sender.send(event) {
            error!(
                "Dropped event for report '{}': dispatcher is gone",
                e.0.report_id()
            );
        }
    }

    pub(crate) fn register(&self, report_id: &str, observer: Arc<dyn ReportObserver>) -> ObserverId {
        lock(&self.registry).register(report_id, observer)
    }

    pub(crate) fn unregister(&self, report_id: &str, id: ObserverId) -> Option<usize> {
        lock(&self.registry).unregister(report_id, id)
    }

    pub(crate) fn observer_count(&self, report_id: &str) -> usize {
        lock(&self.registry).observer_count(report_id)
    }

    pub(crate) fn total_observers(&self) -> usize {
        lock(&self.registry).total_observers()
    }

    pub(crate) fn report_ids(&self) -> Vec<String> {
        lock(&self.registry).report_ids()
    }

    pub(crate) fn clear(&self) {
        lock(&self.registry).clear();
    }
}

async fn dispatch_loop(
    mut receiver: mpsc::UnboundedReceiver<ReportEvent>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
) {
    while let Some(event) = receiver.recv().await {
        deliver(&registry, &event);
    }
    debug!("Report event bus dispatcher shutting down");
}

/// Delivers one event. The observer list is snapshotted so observers may
/// subscribe or unsubscribe from inside `on_event` without deadlocking.
fn deliver(registry: &Mutex<SubscriptionRegistry>, event: &ReportEvent) {
    let observers = lock(registry).observers_for(event.report_id());
    for observer in observers {
        run_isolated(observer.name(), || observer.on_event(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{RecordingObserver, UpdateEvent};
    use crate::registry::GLOBAL_REPORT_ID;
    use serde_json::Map;
    use std::time::Duration;

    fn opened(report_id: &str) -> ReportEvent {
        ReportEvent::Update(UpdateEvent::view_opened(report_id, None, Map::new()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_reaches_report_and_global_observers() {
        let (bus, _worker) = EventBus::start();
        let report = RecordingObserver::new();
        let other = RecordingObserver::new();
        let global = RecordingObserver::new();
        bus.register("R1", Arc::new(report.clone()));
        bus.register("R2", Arc::new(other.clone()));
        bus.register(GLOBAL_REPORT_ID, Arc::new(global.clone()));

        bus.dispatch(opened("R1"));
        bus.dispatch(opened("R1"));
        settle().await;

        assert_eq!(report.len(), 2);
        assert!(other.is_empty());
        assert_eq!(global.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_observer_does_not_block_others() {
        let (bus, _worker) = EventBus::start();
        let after = RecordingObserver::new();
        bus.register("R1", Arc::new(|_: &ReportEvent| panic!("observer failure")));
        bus.register("R1", Arc::new(after.clone()));

        bus.dispatch(opened("R1"));
        bus.dispatch(opened("R1"));
        settle().await;

        assert_eq!(after.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_preserves_production_order() {
        let (bus, _worker) = EventBus::start();
        let observer = RecordingObserver::new();
        bus.register("R1", Arc::new(observer.clone()));

        for i in 0..20 {
            let mut metadata = Map::new();
            metadata.insert("seq".to_string(), i.into());
            bus.dispatch(ReportEvent::Update(UpdateEvent::view_opened("R1", None, metadata)));
        }
        settle().await;

        let seqs: Vec<i64> = observer
            .events()
            .iter()
            .map(|e| match e {
                ReportEvent::Update(UpdateEvent {
                    payload: crate::events::UpdatePayload::ViewOpened { metadata },
                    ..
                }) => metadata["seq"].as_i64().unwrap(),
                _ => panic!("Expected ViewOpened"),
            })
            .collect();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_observer_receives_nothing() {
        let (bus, _worker) = EventBus::start();
        let observer = RecordingObserver::new();
        let id = bus.register("R1", Arc::new(observer.clone()));
        assert_eq!(bus.unregister("R1", id), Some(0));

        bus.dispatch(opened("R1"));
        settle().await;
        assert!(observer.is_empty());
    }
}
