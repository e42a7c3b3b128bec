//! Sync policy domain types.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::constants::{DEFAULT_MANUAL_PAUSE_REASON, USER_ACTIVITY_PAUSE_REASON};
use crate::errors::{Result, SyncError};
use crate::events::UpdateEvent;
use crate::presence::PresenceMember;

// =============================================================================
// Sync Mode
// =============================================================================

/// Policy gate controlling whether automatic events may reach a consumer.
///
/// Modes only change through an explicit `change_sync_mode` call; the engine
/// never transitions between them on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Every allowed event may trigger a refresh.
    #[default]
    Realtime,
    /// Only explicit manual triggers refresh.
    Manual,
    /// Label for consumers that schedule their own interval refreshes.
    Interval,
    /// Label for consumers that refresh when the user goes idle.
    Idle,
    /// Nothing refreshes.
    Off,
}

impl SyncMode {
    /// Returns true if events other than manual triggers may pass the gate.
    pub fn allows_automatic(&self) -> bool {
        matches!(self, SyncMode::Realtime | SyncMode::Interval | SyncMode::Idle)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Realtime => write!(f, "realtime"),
            SyncMode::Manual => write!(f, "manual"),
            SyncMode::Interval => write!(f, "interval"),
            SyncMode::Idle => write!(f, "idle"),
            SyncMode::Off => write!(f, "off"),
        }
    }
}

/// What caused an event, for allow-list filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    DataChange,
    UserAction,
    PageFocus,
    Manual,
    Interval,
}

// =============================================================================
// Pause Reason
// =============================================================================

/// Why a consumer is paused. A paused consumer always has exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseReason {
    /// Requested through `pause_sync`.
    Manual(String),
    /// The volume monitor measured more updates per minute than allowed.
    HighVolume { rate: u32, limit: u32 },
    /// The user-activity monitor detected recent activity.
    UserActivity,
}

impl PauseReason {
    /// Creates a manual reason, substituting a default for blank text.
    pub fn manual(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if reason.trim().is_empty() {
            PauseReason::Manual(DEFAULT_MANUAL_PAUSE_REASON.to_string())
        } else {
            PauseReason::Manual(reason)
        }
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::Manual(reason) => write!(f, "{}", reason),
            PauseReason::HighVolume { rate, limit } => write!(
                f,
                "High update volume: {} updates/min exceeds limit of {}",
                rate, limit
            ),
            PauseReason::UserActivity => write!(f, "{}", USER_ACTIVITY_PAUSE_REASON),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Window in which automatic refreshes are allowed when
/// `business_hours_only` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusinessHours {
    /// First hour (inclusive, 0-23) of the window.
    pub start_hour: u32,
    /// Last hour (exclusive, 1-24) of the window.
    pub end_hour: u32,
    /// Offset of the business timezone from UTC.
    pub utc_offset_minutes: i32,
    pub weekdays_only: bool,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 18,
            utc_offset_minutes: 0,
            weekdays_only: true,
        }
    }
}

impl BusinessHours {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        let local = at.with_timezone(&offset);
        if self.weekdays_only && matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let hour = local.hour();
        hour >= self.start_hour && hour < self.end_hour
    }
}

/// Per-consumer policy configuration, fixed for the subscription lifetime.
///
/// Only the sync mode and the pause overlay change afterwards, through the
/// explicit controls on `RealtimeReport`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncControlSettings {
    pub mode: SyncMode,
    pub pause_on_high_volume: bool,
    pub max_updates_per_minute: Option<u32>,
    pub pause_on_user_activity: bool,
    /// `None` allows every trigger.
    pub allowed_triggers: Option<HashSet<TriggerKind>>,
    pub business_hours_only: bool,
    pub business_hours: BusinessHours,
    /// Coalesce this many data changes into one callback.
    pub batch_size: Option<u32>,
}

impl Default for SyncControlSettings {
    fn default() -> Self {
        Self {
            mode: SyncMode::Realtime,
            pause_on_high_volume: false,
            max_updates_per_minute: None,
            pause_on_user_activity: false,
            allowed_triggers: None,
            business_hours_only: false,
            business_hours: BusinessHours::default(),
            batch_size: None,
        }
    }
}

impl SyncControlSettings {
    pub fn allows(&self, trigger: TriggerKind) -> bool {
        self.allowed_triggers
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&trigger))
    }

    /// The volume limit, if volume-based auto-pause is fully configured.
    pub fn volume_limit(&self) -> Option<u32> {
        if self.pause_on_high_volume {
            self.max_updates_per_minute
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_updates_per_minute == Some(0) {
            return Err(SyncError::invalid_config(
                "maxUpdatesPerMinute must be greater than zero",
            ));
        }
        if self.batch_size == Some(0) {
            return Err(SyncError::invalid_config(
                "batchSize must be greater than zero",
            ));
        }
        let hours = &self.business_hours;
        if hours.start_hour >= hours.end_hour || hours.end_hour > 24 {
            return Err(SyncError::invalid_config(format!(
                "business hours {}-{} are not a valid window",
                hours.start_hour, hours.end_hour
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Consumer State
// =============================================================================

/// Data changes held back while a batch fills up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingBatch {
    pub count: u32,
    pub latest: Option<UpdateEvent>,
}

/// State of one consumer's policy machine.
///
/// Values are produced fresh by `transition`; the runtime swaps them in
/// whole.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSyncState {
    pub sync_mode: SyncMode,
    pub pause: Option<PauseReason>,
    pub is_connected: bool,
    pub last_update_at: Option<DateTime<Utc>>,
    pub pending_update: bool,
    pub error: Option<String>,
    pub active_users: Vec<PresenceMember>,
    pub update_count: u64,
    /// Arrival instants inside the volume window, oldest first.
    pub update_window: VecDeque<Instant>,
    pub avg_updates_per_minute: u32,
    pub last_user_activity_at: Option<Instant>,
    pub batch: PendingBatch,
    /// Bumped on every event; a pending timer only clears the indicator if
    /// no newer event restarted it.
    pub(crate) pending_generation: u64,
    /// Latest view-opened refresh waiting for its delay to elapse.
    pub(crate) delayed_refresh: Option<UpdateEvent>,
    pub(crate) delayed_generation: u64,
}

impl ConsumerSyncState {
    pub fn new(sync_mode: SyncMode) -> Self {
        Self {
            sync_mode,
            pause: None,
            is_connected: false,
            last_update_at: None,
            pending_update: false,
            error: None,
            active_users: Vec::new(),
            update_count: 0,
            update_window: VecDeque::new(),
            avg_updates_per_minute: 0,
            last_user_activity_at: None,
            batch: PendingBatch::default(),
            pending_generation: 0,
            delayed_refresh: None,
            delayed_generation: 0,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_some()
    }

    pub fn pause_reason(&self) -> Option<String> {
        self.pause.as_ref().map(ToString::to_string)
    }
}

/// Observable state handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateSnapshot {
    pub is_connected: bool,
    pub active_users: Vec<PresenceMember>,
    pub last_update_at: Option<DateTime<Utc>>,
    pub pending_update: bool,
    pub error: Option<String>,
    pub sync_mode: SyncMode,
    pub is_paused: bool,
    pub pause_reason: Option<String>,
    pub update_count: u64,
    pub avg_updates_per_minute: u32,
}

impl From<&ConsumerSyncState> for SyncStateSnapshot {
    fn from(state: &ConsumerSyncState) -> Self {
        Self {
            is_connected: state.is_connected,
            active_users: state.active_users.clone(),
            last_update_at: state.last_update_at,
            pending_update: state.pending_update,
            error: state.error.clone(),
            sync_mode: state.sync_mode,
            is_paused: state.is_paused(),
            pause_reason: state.pause_reason(),
            update_count: state.update_count,
            avg_updates_per_minute: state.avg_updates_per_minute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let settings: SyncControlSettings = serde_json::from_str(
            r#"{ "mode": "manual", "pauseOnHighVolume": true, "maxUpdatesPerMinute": 30,
                 "allowedTriggers": ["manual", "page_focus"] }"#,
        )
        .unwrap();

        assert_eq!(settings.mode, SyncMode::Manual);
        assert_eq!(settings.volume_limit(), Some(30));
        assert!(settings.allows(TriggerKind::Manual));
        assert!(!settings.allows(TriggerKind::DataChange));
        assert!(!settings.pause_on_user_activity);
        assert_eq!(settings.batch_size, None);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_only_gating_modes_block_automatic_triggers() {
        assert!(SyncMode::Realtime.allows_automatic());
        assert!(SyncMode::Interval.allows_automatic());
        assert!(SyncMode::Idle.allows_automatic());
        assert!(!SyncMode::Manual.allows_automatic());
        assert!(!SyncMode::Off.allows_automatic());
    }

    #[test]
    fn test_unset_allow_list_allows_everything() {
        let settings = SyncControlSettings::default();
        for trigger in [
            TriggerKind::DataChange,
            TriggerKind::UserAction,
            TriggerKind::PageFocus,
            TriggerKind::Manual,
            TriggerKind::Interval,
        ] {
            assert!(settings.allows(trigger));
        }
    }

    #[test]
    fn test_volume_limit_requires_both_flags() {
        let settings = SyncControlSettings {
            max_updates_per_minute: Some(10),
            ..Default::default()
        };
        assert_eq!(settings.volume_limit(), None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_batch = SyncControlSettings {
            batch_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            zero_batch.validate(),
            Err(SyncError::InvalidConfig(_))
        ));

        let inverted_hours = SyncControlSettings {
            business_hours: BusinessHours {
                start_hour: 18,
                end_hour: 9,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(inverted_hours.validate().is_err());
    }

    #[test]
    fn test_manual_pause_reason_is_never_blank() {
        assert_eq!(
            PauseReason::manual("  ").to_string(),
            DEFAULT_MANUAL_PAUSE_REASON
        );
        assert_eq!(PauseReason::manual("month-end close").to_string(), "month-end close");
        assert!(PauseReason::HighVolume { rate: 31, limit: 30 }
            .to_string()
            .contains("31 updates/min"));
    }

    #[test]
    fn test_business_hours_window() {
        let hours = BusinessHours::default();
        // 2024-03-13 is a Wednesday
        let wednesday_morning = Utc.with_ymd_and_hms(2024, 3, 13, 10, 0, 0).unwrap();
        let wednesday_night = Utc.with_ymd_and_hms(2024, 3, 13, 22, 0, 0).unwrap();
        let saturday_morning = Utc.with_ymd_and_hms(2024, 3, 16, 10, 0, 0).unwrap();
        assert!(hours.contains(wednesday_morning));
        assert!(!hours.contains(wednesday_night));
        assert!(!hours.contains(saturday_morning));

        let shifted = BusinessHours {
            utc_offset_minutes: -5 * 60,
            ..Default::default()
        };
        // 13:00 UTC is 08:00 at UTC-5
        let early = Utc.with_ymd_and_hms(2024, 3, 13, 13, 0, 0).unwrap();
        assert!(!shifted.contains(early));
    }

    #[test]
    fn test_snapshot_mirrors_pause() {
        let mut state = ConsumerSyncState::new(SyncMode::Realtime);
        state.pause = Some(PauseReason::UserActivity);
        let snapshot = SyncStateSnapshot::from(&state);
        assert!(snapshot.is_paused);
        assert_eq!(snapshot.pause_reason.as_deref(), Some(USER_ACTIVITY_PAUSE_REASON));
    }
}
