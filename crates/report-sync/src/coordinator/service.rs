//! The coordinator facade.

use std::sync::{Arc, Mutex, Weak};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::config::CoordinatorConfig;
use crate::errors::Result;
use crate::events::{ReportEvent, ReportObserver, UpdateEvent};
use crate::feeds::{ChangeFeedMultiplexer, ChangeFeedProvider};
use crate::identity::{IdentityResolver, IdentityService};
use crate::presence::{MembershipChannelProvider, PresenceMember, PresenceTracker};
use crate::registry::{ObserverId, GLOBAL_REPORT_ID};
use crate::utils::lock;

/// What a subscription should set up for its report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeOptions {
    pub report_id: String,
    #[serde(default)]
    pub watched_resources: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_change_watch: bool,
    #[serde(default = "default_true")]
    pub enable_presence: bool,
}

fn default_true() -> bool {
    true
}

impl SubscribeOptions {
    pub fn new(report_id: impl Into<String>) -> Self {
        Self {
            report_id: report_id.into(),
            watched_resources: Vec::new(),
            enable_change_watch: true,
            enable_presence: true,
        }
    }

    pub fn watching<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.watched_resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_change_watch(mut self, enabled: bool) -> Self {
        self.enable_change_watch = enabled;
        self
    }

    pub fn with_presence(mut self, enabled: bool) -> Self {
        self.enable_presence = enabled;
        self
    }
}

/// Counters describing what the coordinator currently holds open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    /// Reports with at least one observer.
    pub reports: usize,
    /// Observers across all reports, global ones included.
    pub observers: usize,
    pub open_feeds: usize,
    pub open_presence_channels: usize,
}

pub(crate) struct CoordinatorInner {
    bus: EventBus,
    dispatcher: JoinHandle<()>,
    feeds: ChangeFeedMultiplexer,
    presence: PresenceTracker,
    identity: Arc<IdentityService>,
    config: CoordinatorConfig,
    /// Serializes subscribe and unsubscribe so the observer count and the
    /// upstream handles never disagree.
    lifecycle: Mutex<()>,
}

impl CoordinatorInner {
    fn unsubscribe(&self, report_id: &str, id: ObserverId) {
        let _guard = lock(&self.lifecycle);
        match self.bus.unregister(report_id, id) {
            Some(0) if report_id != GLOBAL_REPORT_ID => {
                let feeds = self.feeds.release(report_id);
                self.presence.leave(report_id);
                info!(
                    "Last observer left report '{}'; released {} feed(s)",
                    report_id, feeds
                );
            }
            Some(remaining) => debug!(
                "Observer left report '{}', {} remaining",
                report_id, remaining
            ),
            None => {}
        }
    }
}

impl Drop for CoordinatorInner {
    fn drop(&mut self) {
        self.feeds.release_all();
        self.presence.leave_all();
        self.dispatcher.abort();
    }
}

/// Process-wide entry point for report synchronization.
///
/// Cheap to clone; all clones share the same bus, feeds and presence rooms.
/// Construct one at the application's composition root and hand clones to
/// whatever opens reports. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct ReportSyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ReportSyncCoordinator {
    pub fn new(
        feeds: Arc<dyn ChangeFeedProvider>,
        membership: Arc<dyn MembershipChannelProvider>,
        identity: Option<Arc<dyn IdentityResolver>>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        config.validate()?;

        let (bus, dispatcher) = EventBus::start();
        let identity = Arc::new(IdentityService::new(identity));
        let inner = CoordinatorInner {
            feeds: ChangeFeedMultiplexer::new(feeds, bus.clone()),
            presence: PresenceTracker::new(
                membership,
                identity.clone(),
                bus.clone(),
                config.heartbeat_interval,
            ),
            bus,
            dispatcher,
            identity,
            config,
            lifecycle: Mutex::new(()),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Registers an observer for a report.
    ///
    /// Opens any missing change feeds and the presence channel, then
    /// announces a `ViewOpened` event for the report. Collaborator failures
    /// surface later as `Degraded` events, never as an error here.
    pub fn subscribe(
        &self,
        options: SubscribeOptions,
        observer: Arc<dyn ReportObserver>,
    ) -> Subscription {
        let report_id = options.report_id;
        let id = {
            let _guard = lock(&self.inner.lifecycle);
            let id = self.inner.bus.register(&report_id, observer);
            if report_id != GLOBAL_REPORT_ID {
                if options.enable_change_watch && !options.watched_resources.is_empty() {
                    self.inner
                        .feeds
                        .ensure_watching(&report_id, &options.watched_resources);
                }
                if options.enable_presence {
                    self.inner.presence.join(&report_id);
                }
            }
            id
        };

        if report_id != GLOBAL_REPORT_ID {
            let user_id = self.inner.identity.cached().map(|identity| identity.user_id);
            self.inner.bus.dispatch(ReportEvent::Update(UpdateEvent::view_opened(
                &report_id,
                user_id,
                Map::new(),
            )));
        }
        debug!("Observer subscribed to report '{}'", report_id);

        Subscription {
            coordinator: Arc::downgrade(&self.inner),
            report_id,
            id,
            active: true,
        }
    }

    /// Registers an observer for every report.
    pub fn subscribe_global(&self, observer: Arc<dyn ReportObserver>) -> Subscription {
        self.subscribe(SubscribeOptions::new(GLOBAL_REPORT_ID), observer)
    }

    /// Dispatches a manual refresh on behalf of the current user. This is the
    /// only event that passes the `manual` sync mode.
    pub async fn trigger_manual_update(&self, report_id: &str, metadata: Option<Map<String, Value>>) {
        let identity = self.inner.identity.resolve().await;
        let mut metadata = metadata.unwrap_or_default();
        metadata.insert("manual".to_string(), Value::Bool(true));
        debug!(
            "Manual update of report '{}' by '{}'",
            report_id, identity.user_id
        );
        self.inner.bus.dispatch(ReportEvent::Update(UpdateEvent::manual(
            report_id,
            identity.user_id,
            metadata,
        )));
    }

    /// Dispatches a refresh requested by a consumer's own interval schedule.
    pub fn request_scheduled_refresh(&self, report_id: &str, metadata: Option<Map<String, Value>>) {
        self.inner.bus.dispatch(ReportEvent::Update(UpdateEvent::scheduled(
            report_id,
            metadata.unwrap_or_default(),
        )));
    }

    /// Called by the host when the application returns to the foreground.
    /// Every open report receives a fresh `ViewOpened`.
    pub fn on_application_foreground(&self) {
        let user_id = self.inner.identity.cached().map(|identity| identity.user_id);
        let reports = self.inner.bus.report_ids();
        for report_id in &reports {
            let mut metadata = Map::new();
            metadata.insert("source".to_string(), Value::from("foreground"));
            self.inner.bus.dispatch(ReportEvent::Update(UpdateEvent::view_opened(
                report_id,
                user_id.clone(),
                metadata,
            )));
        }
        debug!("Application foregrounded; reopened {} report(s)", reports.len());
    }

    /// Called by the host before exit. Closes every upstream handle and
    /// drops every observer; outstanding `Subscription`s become no-ops.
    pub fn on_application_shutdown(&self) {
        let _guard = lock(&self.inner.lifecycle);
        let feeds = self.inner.feeds.release_all();
        let rooms = self.inner.presence.leave_all();
        self.inner.bus.clear();
        info!(
            "Report sync shut down: closed {} feed(s) and {} presence channel(s)",
            feeds, rooms
        );
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            reports: self.inner.bus.report_ids().len(),
            observers: self.inner.bus.total_observers(),
            open_feeds: self.inner.feeds.open_feed_count(),
            open_presence_channels: self.inner.presence.open_channel_count(),
        }
    }

    pub fn observer_count(&self, report_id: &str) -> usize {
        self.inner.bus.observer_count(report_id)
    }

    /// Current roster of a report's presence room.
    pub fn roster(&self, report_id: &str) -> Vec<PresenceMember> {
        self.inner.presence.roster(report_id)
    }

    pub fn watched_resources(&self, report_id: &str) -> Vec<String> {
        self.inner.feeds.watched_resources(report_id)
    }

    pub(crate) fn heartbeat(&self, report_id: &str) {
        self.inner.presence.heartbeat(report_id);
    }
}

/// Registration returned by `subscribe`. Unsubscribes when dropped.
///
/// When the last observer of a report goes away, the report's change feeds
/// and presence channel are closed.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    coordinator: Weak<CoordinatorInner>,
    report_id: String,
    id: ObserverId,
    active: bool,
}

impl Subscription {
    pub fn report_id(&self) -> &str {
        &self.report_id
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(inner) = self.coordinator.upgrade() {
            inner.unsubscribe(&self.report_id, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
