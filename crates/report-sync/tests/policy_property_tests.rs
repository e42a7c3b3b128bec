//! Property-based tests for the sync policy machine.
//!
//! Random input sequences are fed through the pure transition function with
//! a simulated clock, checking the state invariants after every step.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use ledgerline_report_sync::constants::{USER_ACTIVITY_THRESHOLD, VOLUME_WINDOW};
use ledgerline_report_sync::policy::{
    transition, ConsumerSyncState, Effect, PauseReason, PolicyContext, PolicyInput,
    SyncControlSettings, SyncMode,
};
use ledgerline_report_sync::{ChangeType, UpdateEvent};
use proptest::prelude::*;
use serde_json::{json, Map};
use tokio::time::Instant;

// =============================================================================
// Generators
// =============================================================================

fn arb_mode() -> impl Strategy<Value = SyncMode> {
    prop_oneof![
        Just(SyncMode::Realtime),
        Just(SyncMode::Manual),
        Just(SyncMode::Interval),
        Just(SyncMode::Idle),
        Just(SyncMode::Off),
    ]
}

fn arb_input() -> impl Strategy<Value = PolicyInput> {
    prop_oneof![
        6 => Just(PolicyInput::Event(UpdateEvent::data_change(
            "R1",
            "transactions",
            ChangeType::Insert,
            json!({ "id": 1 }),
        ))),
        1 => Just(PolicyInput::Event(UpdateEvent::manual(
            "R1",
            "u1".to_string(),
            Map::new(),
        ))),
        1 => Just(PolicyInput::Event(UpdateEvent::view_opened("R1", None, Map::new()))),
        1 => "[a-z ]{0,12}".prop_map(|reason| PolicyInput::Pause(PauseReason::manual(reason))),
        1 => Just(PolicyInput::Resume),
        1 => arb_mode().prop_map(PolicyInput::ChangeMode),
        2 => Just(PolicyInput::VolumeTick),
        2 => Just(PolicyInput::ActivityTick),
        1 => Just(PolicyInput::UserActivity),
        1 => (0u64..5).prop_map(PolicyInput::PendingElapsed),
    ]
}

/// Inputs paired with the simulated delay before each one, in milliseconds.
fn arb_schedule() -> impl Strategy<Value = Vec<(u64, PolicyInput)>> {
    proptest::collection::vec((0u64..20_000, arb_input()), 1..120)
}

fn arb_settings() -> impl Strategy<Value = SyncControlSettings> {
    (
        arb_mode(),
        any::<bool>(),
        proptest::option::of(1u32..40),
        any::<bool>(),
    )
        .prop_map(|(mode, pause_on_high_volume, max, pause_on_user_activity)| {
            SyncControlSettings {
                mode,
                pause_on_high_volume,
                max_updates_per_minute: max,
                pause_on_user_activity,
                ..Default::default()
            }
        })
}

fn run(
    settings: &SyncControlSettings,
    schedule: Vec<(u64, PolicyInput)>,
    mut check: impl FnMut(&ConsumerSyncState, &[Effect], Instant),
) {
    let start = Instant::now();
    let mut now = start;
    let mut state = ConsumerSyncState::new(settings.mode);
    for (delay_ms, input) in schedule {
        now += Duration::from_millis(delay_ms);
        let ctx = PolicyContext {
            settings,
            now,
            wall_clock: Utc.with_ymd_and_hms(2024, 3, 13, 10, 0, 0).unwrap(),
            volume_window: VOLUME_WINDOW,
            activity_threshold: USER_ACTIVITY_THRESHOLD,
        };
        let next = transition(&state, input, &ctx);
        check(&next.state, &next.effects, now);
        state = next.state;
    }
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// The volume window never holds an arrival older than the window width,
    /// and the reported rate always equals its length.
    #[test]
    fn prop_volume_window_never_holds_stale_entries(
        settings in arb_settings(),
        schedule in arb_schedule(),
    ) {
        run(&settings, schedule, |state, _, now| {
            for arrival in &state.update_window {
                assert!(now.saturating_duration_since(*arrival) <= VOLUME_WINDOW);
            }
            assert_eq!(state.avg_updates_per_minute as usize, state.update_window.len());
        });
    }

    /// A paused consumer always carries a non-empty reason.
    #[test]
    fn prop_paused_implies_reason(
        settings in arb_settings(),
        schedule in arb_schedule(),
    ) {
        run(&settings, schedule, |state, _, _| {
            if state.is_paused() {
                let reason = state.pause_reason().unwrap_or_default();
                assert!(!reason.trim().is_empty());
            }
        });
    }

    /// Nothing reaches the data-change callback while paused or off.
    #[test]
    fn prop_no_invocation_while_paused_or_off(
        settings in arb_settings(),
        schedule in arb_schedule(),
    ) {
        run(&settings, schedule, |state, effects, _| {
            let invoked = effects.iter().any(|e| matches!(e, Effect::InvokeDataChange(_)));
            if invoked {
                assert!(!state.is_paused());
                assert_ne!(state.sync_mode, SyncMode::Off);
            }
        });
    }

    /// Pause notifications only happen on the unpaused-to-paused edge.
    #[test]
    fn prop_at_most_one_pause_notification_per_step(
        settings in arb_settings(),
        schedule in arb_schedule(),
    ) {
        run(&settings, schedule, |state, effects, _| {
            let paused = effects.iter().filter(|e| matches!(e, Effect::NotifyPaused(_))).count();
            assert!(paused <= 1);
            if paused == 1 {
                assert!(state.is_paused());
            }
        });
    }
}
