//! Pure transition function of the per-consumer policy machine.
//!
//! `transition(state, input, ctx)` returns the next state plus the side
//! effects the runtime must perform. Nothing here touches timers or
//! callbacks, so the table below is testable without a runtime:
//!
//! ```text
//! Event        → connected, pending (restart timer), volume window, gates, route
//! PendingElapsed(gen)  → pending = false, flush batch   (only if gen is current)
//! DelayedRefresh(gen)  → invoke data change for the latest ViewOpened
//! Pause / Resume       → pause overlay, notify on edges only
//! VolumeTick           → prune window, auto-pause above the limit
//! ActivityTick         → pause / resume on the activity-derived reason
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::model::{ConsumerSyncState, PauseReason, SyncControlSettings, SyncMode, TriggerKind};
use crate::events::{UpdateEvent, UpdatePayload};
use crate::presence::PresenceMember;

/// Input to the policy machine.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyInput {
    Event(UpdateEvent),
    /// A collaborator for this report failed.
    Degraded(String),
    /// The pending-indicator timer started for this generation fired.
    PendingElapsed(u64),
    /// The view-opened delay started for this generation fired.
    DelayedRefresh(u64),
    Pause(PauseReason),
    Resume,
    ChangeMode(SyncMode),
    VolumeTick,
    ActivityTick,
    /// The user pressed a key, moved the pointer or scrolled.
    UserActivity,
}

/// Clock readings and configuration a transition is evaluated against.
#[derive(Debug, Clone)]
pub struct PolicyContext<'a> {
    pub settings: &'a SyncControlSettings,
    pub now: Instant,
    pub wall_clock: DateTime<Utc>,
    pub volume_window: Duration,
    pub activity_threshold: Duration,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Cancel the pending-indicator timer and start it again for `gen`.
    RestartPendingTimer(u64),
    InvokeDataChange(UpdateEvent),
    /// Cancel the view-opened delay and start it again for `gen`.
    ScheduleDelayedRefresh(u64),
    InvokeUserUpdate(Vec<PresenceMember>),
    NotifyPaused(String),
    NotifyResumed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: ConsumerSyncState,
    pub effects: Vec<Effect>,
}

/// Trigger kind used for allow-list filtering.
pub fn classify(event: &UpdateEvent) -> TriggerKind {
    match event.payload {
        UpdatePayload::DataChange { .. } => TriggerKind::DataChange,
        UpdatePayload::PresenceSync { .. } | UpdatePayload::PresenceDiff { .. } => {
            TriggerKind::UserAction
        }
        UpdatePayload::ManualRefresh { .. } => TriggerKind::Manual,
        UpdatePayload::ScheduledRefresh { .. } => TriggerKind::Interval,
        UpdatePayload::ViewOpened { .. } => TriggerKind::PageFocus,
    }
}

pub fn transition(
    state: &ConsumerSyncState,
    input: PolicyInput,
    ctx: &PolicyContext<'_>,
) -> Transition {
    let mut next = state.clone();
    let mut effects = Vec::new();
    prune_window(&mut next, ctx);

    match input {
        PolicyInput::Event(event) => on_event(&mut next, &mut effects, event, ctx),
        PolicyInput::Degraded(error) => {
            next.is_connected = false;
            next.error = Some(error);
        }
        PolicyInput::PendingElapsed(generation) => {
            if generation == next.pending_generation {
                next.pending_update = false;
                let batch = std::mem::take(&mut next.batch);
                if let Some(latest) = batch.latest {
                    if gates_open(&next, TriggerKind::DataChange, ctx) {
                        effects.push(Effect::InvokeDataChange(latest));
                    }
                }
            }
        }
        PolicyInput::DelayedRefresh(generation) => {
            if generation == next.delayed_generation {
                if let Some(event) = next.delayed_refresh.take() {
                    if gates_open(&next, TriggerKind::PageFocus, ctx) {
                        effects.push(Effect::InvokeDataChange(event));
                    }
                }
            }
        }
        PolicyInput::Pause(reason) => {
            let was_paused = next.is_paused();
            let text = reason.to_string();
            next.pause = Some(reason);
            if !was_paused {
                effects.push(Effect::NotifyPaused(text));
            }
        }
        PolicyInput::Resume => {
            if next.pause.take().is_some() {
                effects.push(Effect::NotifyResumed);
            }
        }
        PolicyInput::ChangeMode(mode) => next.sync_mode = mode,
        PolicyInput::VolumeTick => check_volume(&mut next, &mut effects, ctx),
        PolicyInput::ActivityTick => check_activity(&mut next, &mut effects, ctx),
        PolicyInput::UserActivity => next.last_user_activity_at = Some(ctx.now),
    }

    Transition {
        state: next,
        effects,
    }
}

fn on_event(
    state: &mut ConsumerSyncState,
    effects: &mut Vec<Effect>,
    event: UpdateEvent,
    ctx: &PolicyContext<'_>,
) {
    state.is_connected = true;
    state.last_update_at = Some(event.timestamp);
    state.error = None;

    state.pending_update = true;
    state.pending_generation += 1;
    effects.push(Effect::RestartPendingTimer(state.pending_generation));

    // The synthetic view-opened event is lifecycle, not upstream volume.
    if !matches!(event.payload, UpdatePayload::ViewOpened { .. }) {
        state.update_count += 1;
        state.update_window.push_back(ctx.now);
    }
    prune_window(state, ctx);
    check_volume(state, effects, ctx);

    if let UpdatePayload::PresenceSync { active_users } = &event.payload {
        state.active_users = active_users.clone();
    }

    let trigger = classify(&event);
    if !ctx.settings.allows(trigger) || !gates_open(state, trigger, ctx) {
        return;
    }

    match event.payload {
        UpdatePayload::DataChange { .. } => match ctx.settings.batch_size {
            Some(size) if size > 1 => {
                state.batch.count += 1;
                state.batch.latest = Some(event);
                if state.batch.count >= size {
                    if let Some(latest) = std::mem::take(&mut state.batch).latest {
                        effects.push(Effect::InvokeDataChange(latest));
                    }
                }
            }
            _ => effects.push(Effect::InvokeDataChange(event)),
        },
        UpdatePayload::PresenceSync { active_users } => {
            effects.push(Effect::InvokeUserUpdate(active_users));
        }
        // Diffs only feed the roster through the next sync.
        UpdatePayload::PresenceDiff { .. } => {}
        UpdatePayload::ManualRefresh { .. } | UpdatePayload::ScheduledRefresh { .. } => {
            effects.push(Effect::InvokeDataChange(event));
        }
        UpdatePayload::ViewOpened { .. } => {
            state.delayed_generation += 1;
            state.delayed_refresh = Some(event);
            effects.push(Effect::ScheduleDelayedRefresh(state.delayed_generation));
        }
    }
}

/// Mode, pause and business-hours gates. Manual triggers bypass the
/// business-hours window but never the pause overlay.
fn gates_open(state: &ConsumerSyncState, trigger: TriggerKind, ctx: &PolicyContext<'_>) -> bool {
    if state.sync_mode == SyncMode::Off {
        return false;
    }
    if !state.sync_mode.allows_automatic() && trigger != TriggerKind::Manual {
        return false;
    }
    if state.is_paused() {
        return false;
    }
    if ctx.settings.business_hours_only
        && trigger != TriggerKind::Manual
        && !ctx.settings.business_hours.contains(ctx.wall_clock)
    {
        return false;
    }
    true
}

fn prune_window(state: &mut ConsumerSyncState, ctx: &PolicyContext<'_>) {
    while let Some(&oldest) = state.update_window.front() {
        if ctx.now.saturating_duration_since(oldest) > ctx.volume_window {
            state.update_window.pop_front();
        } else {
            break;
        }
    }
    state.avg_updates_per_minute = u32::try_from(state.update_window.len()).unwrap_or(u32::MAX);
}

fn check_volume(state: &mut ConsumerSyncState, effects: &mut Vec<Effect>, ctx: &PolicyContext<'_>) {
    let Some(limit) = ctx.settings.volume_limit() else {
        return;
    };
    let rate = state.avg_updates_per_minute;
    if rate > limit && !state.is_paused() {
        let reason = PauseReason::HighVolume { rate, limit };
        effects.push(Effect::NotifyPaused(reason.to_string()));
        state.pause = Some(reason);
    }
}

/// Pauses while the user was active within the threshold and resumes once
/// they go quiet, but only if the pause came from this monitor.
fn check_activity(
    state: &mut ConsumerSyncState,
    effects: &mut Vec<Effect>,
    ctx: &PolicyContext<'_>,
) {
    if !ctx.settings.pause_on_user_activity {
        return;
    }
    let active = state
        .last_user_activity_at
        .is_some_and(|at| ctx.now.saturating_duration_since(at) < ctx.activity_threshold);

    if active && !state.is_paused() {
        let reason = PauseReason::UserActivity;
        effects.push(Effect::NotifyPaused(reason.to_string()));
        state.pause = Some(reason);
    } else if !active && state.pause == Some(PauseReason::UserActivity) {
        state.pause = None;
        effects.push(Effect::NotifyResumed);
    }
}
