use std::sync::Arc;

use chrono::Utc;
use ledgerline_report_sync::memory::{InMemoryChangeFeed, InMemoryMembership, StaticIdentity};
use ledgerline_report_sync::presence::room_key;
use ledgerline_report_sync::{
    ChangeType, PresenceMember, RealtimeReport, RealtimeReportConfig, ReportSyncCoordinator,
    SyncControlSettings, SyncHandlers, SyncMode,
};
use serde_json::json;
use tokio::time::sleep;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

pub fn init_tracing() {
    let log_format =
        std::env::var("REPORT_SYNC_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if log_format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init();
    }
}

pub struct Collaborators {
    pub feeds: InMemoryChangeFeed,
    pub membership: InMemoryMembership,
}

pub fn build_coordinator(config: &Config) -> anyhow::Result<(ReportSyncCoordinator, Collaborators)> {
    let feeds = InMemoryChangeFeed::new();
    let membership = InMemoryMembership::new();
    let coordinator = ReportSyncCoordinator::new(
        Arc::new(feeds.clone()),
        Arc::new(membership.clone()),
        Some(Arc::new(StaticIdentity::new(
            "controller",
            Some("Controller".to_string()),
        ))),
        config.coordinator,
    )?;
    Ok((coordinator, Collaborators { feeds, membership }))
}

fn logging_handlers(view: &'static str) -> SyncHandlers {
    SyncHandlers::new()
        .on_data_change(move |event| {
            tracing::info!(view, kind = ?event.kind(), "refresh");
        })
        .on_user_update(move |users| {
            tracing::info!(view, viewers = users.len(), "roster changed");
        })
        .on_sync_paused(move |reason| tracing::warn!(view, reason, "sync paused"))
        .on_sync_resumed(move || tracing::info!(view, "sync resumed"))
}

/// Opens a realtime ledger view and a manual trial-balance view, replays a
/// burst of journal postings and a remote viewer, then logs final state.
pub async fn run_simulation(
    config: &Config,
    coordinator: &ReportSyncCoordinator,
    collaborators: &Collaborators,
) -> anyhow::Result<()> {
    let ledger = RealtimeReport::attach(
        coordinator,
        RealtimeReportConfig::new("general-ledger")
            .watching(["journal_entries", "accounts"])
            .with_sync_control(SyncControlSettings {
                pause_on_high_volume: true,
                max_updates_per_minute: Some(config.max_updates_per_minute),
                ..Default::default()
            }),
        logging_handlers("general-ledger"),
    )?;
    let trial_balance = RealtimeReport::attach(
        coordinator,
        RealtimeReportConfig::new("trial-balance")
            .watching(["journal_entries"])
            .with_sync_control(SyncControlSettings {
                mode: SyncMode::Manual,
                ..Default::default()
            }),
        logging_handlers("trial-balance"),
    )?;

    let mut states = ledger.subscribe_state();
    let watcher = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            tracing::debug!(
                pending = state.pending_update,
                paused = state.is_paused,
                rate = state.avg_updates_per_minute,
                "general-ledger state"
            );
        }
    });

    collaborators.membership.join(
        &room_key("general-ledger"),
        PresenceMember::new("auditor", Some("Auditor".to_string()), Utc::now()),
    );

    for n in 0..config.burst_size {
        collaborators.feeds.emit(
            "journal_entries",
            ChangeType::Insert,
            json!({ "entryId": n, "amount": "125.00" }),
        );
        sleep(config.burst_interval).await;
    }

    trial_balance
        .trigger_manual_update(Some(serde_json::Map::from_iter([(
            "reason".to_string(),
            json!("period close"),
        )])))
        .await;

    sleep(config.coordinator.update_interval).await;
    if ledger.state().is_paused {
        ledger.resume_sync();
    }

    tracing::info!(
        ledger = %serde_json::to_string(&ledger.state())?,
        trial_balance = %serde_json::to_string(&trial_balance.state())?,
        stats = ?coordinator.stats(),
        "final state"
    );

    ledger.detach();
    trial_balance.detach();
    watcher.abort();
    Ok(())
}
