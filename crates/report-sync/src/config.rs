//! Coordinator timings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_UPDATE_INTERVAL, MONITOR_TICK, PRESENCE_HEARTBEAT_INTERVAL, USER_ACTIVITY_THRESHOLD,
    VIEW_OPENED_DELAY,
};
use crate::errors::{Result, SyncError};

/// Process-wide timings shared by every report the coordinator serves.
///
/// `update_interval` is only the default; a `RealtimeReportConfig` may carry
/// its own debounce length. The volume window is not configurable: it is
/// always `VOLUME_WINDOW`, so the measured count is a per-minute rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinatorConfig {
    pub update_interval: Duration,
    pub view_opened_delay: Duration,
    pub monitor_tick: Duration,
    pub activity_threshold: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            view_opened_delay: VIEW_OPENED_DELAY,
            monitor_tick: MONITOR_TICK,
            activity_threshold: USER_ACTIVITY_THRESHOLD,
            heartbeat_interval: PRESENCE_HEARTBEAT_INTERVAL,
        }
    }
}

impl CoordinatorConfig {
    /// Reads overrides from `REPORT_SYNC_*_MS` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let read = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => parse_millis(key, &raw),
            }
        };

        let config = Self {
            update_interval: read("REPORT_SYNC_UPDATE_INTERVAL_MS", defaults.update_interval)?,
            view_opened_delay: read("REPORT_SYNC_VIEW_OPENED_DELAY_MS", defaults.view_opened_delay)?,
            monitor_tick: read("REPORT_SYNC_MONITOR_TICK_MS", defaults.monitor_tick)?,
            activity_threshold: read(
                "REPORT_SYNC_ACTIVITY_THRESHOLD_MS",
                defaults.activity_threshold,
            )?,
            heartbeat_interval: read(
                "REPORT_SYNC_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("updateInterval", self.update_interval),
            ("monitorTick", self.monitor_tick),
            ("activityThreshold", self.activity_threshold),
        ];
        for (name, value) in required {
            if value.is_zero() {
                return Err(SyncError::invalid_config(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| SyncError::invalid_config(format!("{}='{}': {}", key, raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(config.update_interval, Duration::from_millis(1500));
        assert_eq!(config.view_opened_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_overrides() {
        let config = CoordinatorConfig::from_lookup(lookup_from(&[
            ("REPORT_SYNC_UPDATE_INTERVAL_MS", "250"),
            ("REPORT_SYNC_MONITOR_TICK_MS", " 500 "),
        ]))
        .unwrap();
        assert_eq!(config.update_interval, Duration::from_millis(250));
        assert_eq!(config.monitor_tick, Duration::from_millis(500));
    }

    #[test]
    fn test_volume_window_is_not_overridable() {
        let config = CoordinatorConfig::from_lookup(lookup_from(&[(
            "REPORT_SYNC_VOLUME_WINDOW_MS",
            "5000",
        )]))
        .unwrap();
        assert_eq!(config, CoordinatorConfig::default());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let garbage = CoordinatorConfig::from_lookup(lookup_from(&[(
            "REPORT_SYNC_UPDATE_INTERVAL_MS",
            "a second",
        )]));
        assert!(matches!(garbage, Err(SyncError::InvalidConfig(msg)) if msg.contains("UPDATE_INTERVAL")));

        let zero = CoordinatorConfig::from_lookup(lookup_from(&[("REPORT_SYNC_MONITOR_TICK_MS", "0")]));
        assert!(zero.is_err());
    }
}
