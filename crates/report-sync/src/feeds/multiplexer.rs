//! Change feed multiplexer.
//!
//! Keeps at most one upstream subscription per (report, resource) pair no
//! matter how many views observe the report. Each subscription runs in its
//! own forwarder task that opens the feed, parks the feed handle in the
//! bookkeeping map, and turns notifications into `DataChange` events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use super::traits::{ChangeFeed, ChangeFeedProvider, FeedHandle};
use crate::bus::EventBus;
use crate::events::{ReportEvent, UpdateEvent};
use crate::utils::lock;

/// Bookkeeping for one (report, resource) subscription.
struct FeedWatch {
    /// Distinguishes this watch from a later one for the same pair.
    token: u64,
    /// Set once the upstream feed is established.
    handle: Option<Box<dyn FeedHandle>>,
    task: JoinHandle<()>,
}

type WatchMap = HashMap<String, HashMap<String, FeedWatch>>;

pub(crate) struct ChangeFeedMultiplexer {
    provider: Arc<dyn ChangeFeedProvider>,
    bus: EventBus,
    watches: Arc<Mutex<WatchMap>>,
    next_token: AtomicU64,
}

impl ChangeFeedMultiplexer {
    pub fn new(provider: Arc<dyn ChangeFeedProvider>, bus: EventBus) -> Self {
        Self {
            provider,
            bus,
            watches: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(1),
        }
    }

    /// Opens an upstream subscription for every resource not yet watched for
    /// this report. Returns how many new subscriptions were started.
    pub fn ensure_watching(&self, report_id: &str, resources: &[String]) -> usize {
        let mut watches = lock(&self.watches);
        let report = watches.entry(report_id.to_string()).or_default();

        let mut started = 0;
        for resource in resources {
            if report.contains_key(resource) {
                continue;
            }
            let token = self.next_token.fetch_add(1, Ordering::Relaxed);
            let task = tokio::spawn(run_feed(
                self.provider.clone(),
                self.bus.clone(),
                self.watches.clone(),
                report_id.to_string(),
                resource.clone(),
                token,
            ));
            report.insert(
                resource.clone(),
                FeedWatch {
                    token,
                    handle: None,
                    task,
                },
            );
            started += 1;
        }

        if report.is_empty() {
            watches.remove(report_id);
        }
        if started > 0 {
            debug!(
                "Started {} change feed(s) for report '{}'",
                started, report_id
            );
        }
        started
    }

    /// Closes every upstream subscription of a report.
    ///
    /// Only the coordinator calls this, and only once the report's observer
    /// set is empty.
    pub fn release(&self, report_id: &str) -> usize {
        let Some(feeds) = lock(&self.watches).remove(report_id) else {
            return 0;
        };

        let count = feeds.len();
        for (resource, watch) in feeds {
            close_watch(watch);
            debug!("Closed change feed '{}' for report '{}'", resource, report_id);
        }
        info!("Released {} change feed(s) for report '{}'", count, report_id);
        count
    }

    /// Closes every upstream subscription of every report.
    pub fn release_all(&self) -> usize {
        let all = std::mem::take(&mut *lock(&self.watches));
        let mut count = 0;
        for feeds in all.into_values() {
            for watch in feeds.into_values() {
                close_watch(watch);
                count += 1;
            }
        }
        count
    }

    pub fn watched_resources(&self, report_id: &str) -> Vec<String> {
        let mut resources: Vec<String> = lock(&self.watches)
            .get(report_id)
            .map(|feeds| feeds.keys().cloned().collect())
            .unwrap_or_default();
        resources.sort();
        resources
    }

    /// Number of established upstream subscriptions across all reports.
    pub fn open_feed_count(&self) -> usize {
        lock(&self.watches)
            .values()
            .flat_map(|feeds| feeds.values())
            .filter(|watch| watch.handle.is_some())
            .count()
    }
}

fn close_watch(watch: FeedWatch) {
    watch.task.abort();
    if let Some(handle) = watch.handle {
        handle.close();
    }
}

/// Removes the watch for a pair if it still belongs to `token`.
fn forget(watches: &Mutex<WatchMap>, report_id: &str, resource: &str, token: u64) -> Option<FeedWatch> {
    let mut watches = lock(watches);
    let report = watches.get_mut(report_id)?;
    if report.get(resource).map(|w| w.token) != Some(token) {
        return None;
    }
    let watch = report.remove(resource);
    if report.is_empty() {
        watches.remove(report_id);
    }
    watch
}

async fn run_feed(
    provider: Arc<dyn ChangeFeedProvider>,
    bus: EventBus,
    watches: Arc<Mutex<WatchMap>>,
    report_id: String,
    resource: String,
    token: u64,
) {
    let ChangeFeed {
        mut notifications,
        handle,
    } = match provider.open(&resource).await {
        Ok(feed) => feed,
        Err(err) => {
            warn!("Report '{}' running degraded: {}", report_id, err);
            forget(&watches, &report_id, &resource, token);
            bus.dispatch(ReportEvent::Degraded {
                report_id,
                error: err.to_string(),
            });
            return;
        }
    };

    {
        let mut guard = lock(&watches);
        match guard
            .get_mut(&report_id)
            .and_then(|feeds| feeds.get_mut(&resource))
        {
            Some(watch) if watch.token == token => watch.handle = Some(handle),
            _ => {
                debug!(
                    "Report '{}' released while '{}' was opening; closing feed",
                    report_id, resource
                );
                handle.close();
                return;
            }
        }
    }
    info!("Watching '{}' for report '{}'", resource, report_id);

    while let Some(notification) = notifications.next().await {
        bus.dispatch(ReportEvent::Update(UpdateEvent::data_change(
            &report_id,
            &resource,
            notification.change_type,
            notification.record,
        )));
    }

    debug!(
        "Change feed '{}' for report '{}' ended upstream",
        resource, report_id
    );
    if let Some(watch) = forget(&watches, &report_id, &resource, token) {
        if let Some(handle) = watch.handle {
            handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChangeType, RecordingObserver, UpdatePayload};
    use crate::memory::InMemoryChangeFeed;
    use serde_json::json;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn resources(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_watching_skips_known_resources() {
        let provider = InMemoryChangeFeed::new();
        let (bus, _worker) = EventBus::start();
        let mux = ChangeFeedMultiplexer::new(Arc::new(provider.clone()), bus);

        assert_eq!(mux.ensure_watching("R1", &resources(&["b", "a"])), 2);
        assert_eq!(mux.ensure_watching("R1", &resources(&["a", "c"])), 1);
        assert_eq!(mux.ensure_watching("R2", &resources(&["a"])), 1);
        settle().await;

        assert_eq!(mux.watched_resources("R1"), vec!["a", "b", "c"]);
        assert_eq!(provider.open_calls("a"), 2);
        assert_eq!(mux.open_feed_count(), 4);
        assert_eq!(provider.open_handles(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_become_data_change_events() {
        let provider = InMemoryChangeFeed::new();
        let (bus, _worker) = EventBus::start();
        let observer = RecordingObserver::new();
        bus.register("R1", Arc::new(observer.clone()));
        let mux = ChangeFeedMultiplexer::new(Arc::new(provider.clone()), bus);

        mux.ensure_watching("R1", &resources(&["transactions"]));
        settle().await;
        provider.emit("transactions", ChangeType::Delete, json!({ "id": 9 }));
        settle().await;

        let events = observer.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ReportEvent::Update(UpdateEvent {
                report_id,
                payload:
                    UpdatePayload::DataChange {
                        resource,
                        change_type,
                        record,
                    },
                ..
            }) => {
                assert_eq!(report_id, "R1");
                assert_eq!(resource, "transactions");
                assert_eq!(*change_type, ChangeType::Delete);
                assert_eq!(record["id"], 9);
            }
            other => panic!("Expected DataChange, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_only_touches_one_report() {
        let provider = InMemoryChangeFeed::new();
        let (bus, _worker) = EventBus::start();
        let mux = ChangeFeedMultiplexer::new(Arc::new(provider.clone()), bus);

        mux.ensure_watching("R1", &resources(&["a", "b"]));
        mux.ensure_watching("R2", &resources(&["a"]));
        settle().await;

        assert_eq!(mux.release("R1"), 2);
        assert_eq!(mux.release("R1"), 0);
        assert_eq!(provider.open_handles(), 1);
        assert_eq!(provider.subscriber_count("a"), 1);

        assert_eq!(mux.release_all(), 1);
        assert_eq!(provider.open_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_dispatches_degraded_and_forgets() {
        let provider = InMemoryChangeFeed::new();
        provider.fail_resource("journal");
        let (bus, _worker) = EventBus::start();
        let observer = RecordingObserver::new();
        bus.register("R1", Arc::new(observer.clone()));
        let mux = ChangeFeedMultiplexer::new(Arc::new(provider.clone()), bus);

        mux.ensure_watching("R1", &resources(&["journal"]));
        settle().await;

        assert!(mux.watched_resources("R1").is_empty());
        assert!(matches!(
            observer.events().as_slice(),
            [ReportEvent::Degraded { error, .. }] if error.contains("journal")
        ));

        // a later subscriber retries
        mux.ensure_watching("R1", &resources(&["journal"]));
        settle().await;
        assert_eq!(provider.open_calls("journal"), 2);
    }
}
