//! `RealtimeReport`: one consumer view attached to the coordinator.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use super::service::{ReportSyncCoordinator, SubscribeOptions, Subscription};
use crate::constants::VOLUME_WINDOW;
use crate::errors::{Result, SyncError};
use crate::policy::{
    ConsumerObserver, ConsumerSyncState, ConsumerTimings, PauseReason, PolicyInput,
    SyncConsumer, SyncControlSettings, SyncHandlers, SyncMode, SyncStateSnapshot,
};

/// Configuration of a single report view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeReportConfig {
    pub report_id: String,
    #[serde(default)]
    pub watched_resources: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_change_watch: bool,
    #[serde(default = "default_true")]
    pub enable_presence: bool,
    /// Debounce of the pending indicator; the coordinator default when unset.
    #[serde(default)]
    pub update_interval_ms: Option<u64>,
    #[serde(default)]
    pub sync_control: SyncControlSettings,
}

fn default_true() -> bool {
    true
}

impl RealtimeReportConfig {
    pub fn new(report_id: impl Into<String>) -> Self {
        Self {
            report_id: report_id.into(),
            watched_resources: Vec::new(),
            enable_change_watch: true,
            enable_presence: true,
            update_interval_ms: None,
            sync_control: SyncControlSettings::default(),
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

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval_ms = Some(u64::try_from(interval.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_sync_control(mut self, settings: SyncControlSettings) -> Self {
        self.sync_control = settings;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.report_id.trim().is_empty() {
            return Err(SyncError::invalid_config("reportId must not be empty"));
        }
        if self.update_interval_ms == Some(0) {
            return Err(SyncError::invalid_config(
                "updateIntervalMs must be greater than zero",
            ));
        }
        self.sync_control.validate()
    }

    fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions::new(self.report_id.clone())
            .watching(self.watched_resources.iter().cloned())
            .with_change_watch(self.enable_change_watch)
            .with_presence(self.enable_presence)
    }
}

/// A report view kept in sync through the coordinator.
///
/// Dropping it (or calling [`RealtimeReport::detach`]) unsubscribes, cancels
/// its timers and, if it was the report's last view, closes the report's
/// upstream feeds and presence channel.
pub struct RealtimeReport {
    coordinator: ReportSyncCoordinator,
    consumer: Arc<SyncConsumer>,
    subscription: Option<Subscription>,
}

impl RealtimeReport {
    /// Attaches a new view. Only an invalid configuration is an error;
    /// collaborator failures show up in the view's state.
    pub fn attach(
        coordinator: &ReportSyncCoordinator,
        config: RealtimeReportConfig,
        handlers: SyncHandlers,
    ) -> Result<Self> {
        config.validate()?;

        let defaults = coordinator.config();
        let timings = ConsumerTimings {
            update_interval: config
                .update_interval_ms
                .map_or(defaults.update_interval, Duration::from_millis),
            view_opened_delay: defaults.view_opened_delay,
            volume_window: VOLUME_WINDOW,
            monitor_tick: defaults.monitor_tick,
            activity_threshold: defaults.activity_threshold,
        };

        let consumer = SyncConsumer::new(
            &config.report_id,
            config.sync_control.clone(),
            timings,
            handlers,
        );
        consumer.start_monitors();

        let subscription = coordinator.subscribe(
            config.subscribe_options(),
            Arc::new(ConsumerObserver::new(&consumer)),
        );

        Ok(Self {
            coordinator: coordinator.clone(),
            consumer,
            subscription: Some(subscription),
        })
    }

    pub fn report_id(&self) -> &str {
        self.consumer.report_id()
    }

    pub fn state(&self) -> SyncStateSnapshot {
        self.consumer.snapshot()
    }

    /// Full machine state, including the volume window.
    pub fn sync_state(&self) -> ConsumerSyncState {
        self.consumer.state()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<SyncStateSnapshot> {
        self.consumer.subscribe_state()
    }

    pub async fn trigger_manual_update(&self, metadata: Option<Map<String, Value>>) {
        self.coordinator
            .trigger_manual_update(self.report_id(), metadata)
            .await;
    }

    /// Asks for a refresh from the view's own interval schedule.
    pub fn request_scheduled_refresh(&self, metadata: Option<Map<String, Value>>) {
        self.coordinator
            .request_scheduled_refresh(self.report_id(), metadata);
    }

    /// Pauses the view. A blank reason is replaced by a default one.
    pub fn pause_sync(&self, reason: impl Into<String>) {
        self.consumer
            .apply(PolicyInput::Pause(PauseReason::manual(reason)));
    }

    pub fn resume_sync(&self) {
        self.consumer.apply(PolicyInput::Resume);
    }

    pub fn change_sync_mode(&self, mode: SyncMode) {
        self.consumer.apply(PolicyInput::ChangeMode(mode));
    }

    /// Records a key press, pointer move or scroll in this view.
    pub fn record_user_activity(&self) {
        self.consumer.apply(PolicyInput::UserActivity);
        self.coordinator.heartbeat(self.report_id());
    }

    pub fn detach(self) {}
}

impl Drop for RealtimeReport {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.consumer.shutdown();
    }
}
