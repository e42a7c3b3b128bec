use std::time::Duration;

use ledgerline_report_sync::CoordinatorConfig;

pub struct Config {
    pub coordinator: CoordinatorConfig,
    /// Change notifications emitted during the simulated burst.
    pub burst_size: u32,
    pub burst_interval: Duration,
    pub max_updates_per_minute: u32,
    pub run_for: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let coordinator = CoordinatorConfig::from_env()?;
        let burst_size: u32 = std::env::var("SYNC_MONITOR_BURST_SIZE")
            .unwrap_or_else(|_| "45".into())
            .parse()
            .unwrap_or(45);
        let burst_interval_ms: u64 = std::env::var("SYNC_MONITOR_BURST_INTERVAL_MS")
            .unwrap_or_else(|_| "100".into())
            .parse()
            .unwrap_or(100);
        let max_updates_per_minute: u32 = std::env::var("SYNC_MONITOR_MAX_UPDATES_PER_MINUTE")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .unwrap_or(30);
        let run_secs: u64 = std::env::var("SYNC_MONITOR_RUN_SECS")
            .unwrap_or_else(|_| "12".into())
            .parse()
            .unwrap_or(12);
        Ok(Self {
            coordinator,
            burst_size,
            burst_interval: Duration::from_millis(burst_interval_ms),
            max_updates_per_minute: max_updates_per_minute.max(1),
            run_for: Duration::from_secs(run_secs),
        })
    }
}
