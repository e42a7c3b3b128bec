//! Runtime half of the policy engine.
//!
//! A `SyncConsumer` owns one `ConsumerSyncState`, feeds every input through
//! [`transition`], swaps the new state in and then performs the requested
//! effects outside the state lock. Timers only hold a `Weak` reference, so a
//! dropped consumer never keeps its timers alive and vice versa.
//!
//! Inputs come from the bus dispatcher, timer tasks, the monitor and direct
//! calls, possibly on different worker threads. They all go through one
//! inbox: the first caller to find it idle drains it, running transitions and
//! their effects in arrival order, while later callers only enqueue. A
//! consumer's callbacks therefore never overlap, and an input sent from
//! inside a callback runs after that callback returns.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::machine::{transition, Effect, PolicyContext, PolicyInput, Transition};
use super::model::{ConsumerSyncState, SyncControlSettings, SyncStateSnapshot};
use crate::events::{ReportEvent, ReportObserver, UpdateEvent};
use crate::presence::PresenceMember;
use crate::utils::{lock, run_isolated};

pub type DataChangeHandler = Arc<dyn Fn(&UpdateEvent) + Send + Sync>;
pub type UserUpdateHandler = Arc<dyn Fn(&[PresenceMember]) + Send + Sync>;
pub type PausedHandler = Arc<dyn Fn(&str) + Send + Sync>;
pub type ResumedHandler = Arc<dyn Fn() + Send + Sync>;

/// Consumer callbacks. Every handler is optional.
///
/// ```ignore
/// let handlers = SyncHandlers::new()
///     .on_data_change(|event| refresh_report(event))
///     .on_sync_paused(|reason| show_banner(reason));
/// ```
#[derive(Clone, Default)]
pub struct SyncHandlers {
    data_change: Option<DataChangeHandler>,
    user_update: Option<UserUpdateHandler>,
    sync_paused: Option<PausedHandler>,
    sync_resumed: Option<ResumedHandler>,
}

impl SyncHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_data_change(mut self, f: impl Fn(&UpdateEvent) + Send + Sync + 'static) -> Self {
        self.data_change = Some(Arc::new(f));
        self
    }

    pub fn on_user_update(
        mut self,
        f: impl Fn(&[PresenceMember]) + Send + Sync + 'static,
    ) -> Self {
        self.user_update = Some(Arc::new(f));
        self
    }

    pub fn on_sync_paused(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.sync_paused = Some(Arc::new(f));
        self
    }

    pub fn on_sync_resumed(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.sync_resumed = Some(Arc::new(f));
        self
    }
}

/// Durations a consumer runs with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConsumerTimings {
    pub update_interval: Duration,
    pub view_opened_delay: Duration,
    pub volume_window: Duration,
    pub monitor_tick: Duration,
    pub activity_threshold: Duration,
}

/// Restartable timers, tagged with the generation they were started for.
#[derive(Default)]
struct ConsumerTimers {
    pending: Option<(u64, JoinHandle<()>)>,
    delayed_refresh: Option<(u64, JoinHandle<()>)>,
    monitor: Option<JoinHandle<()>>,
}

impl ConsumerTimers {
    fn abort_all(&mut self) {
        let restartable = [self.pending.take(), self.delayed_refresh.take()]
            .into_iter()
            .flatten()
            .map(|(_, timer)| timer);
        for timer in restartable.chain(self.monitor.take()) {
            timer.abort();
        }
    }
}

/// Inputs waiting for the draining caller.
#[derive(Default)]
struct Inbox {
    queue: VecDeque<PolicyInput>,
    draining: bool,
}

/// Clears the draining flag if a drain loop unwinds.
struct DrainGuard<'a> {
    inbox: &'a Mutex<Inbox>,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.inbox).draining = false;
        }
    }
}

pub(crate) struct SyncConsumer {
    report_id: String,
    settings: SyncControlSettings,
    timings: ConsumerTimings,
    handlers: SyncHandlers,
    inbox: Mutex<Inbox>,
    state: Mutex<ConsumerSyncState>,
    snapshots: watch::Sender<SyncStateSnapshot>,
    timers: Mutex<ConsumerTimers>,
    closed: AtomicBool,
}

impl SyncConsumer {
    pub fn new(
        report_id: &str,
        settings: SyncControlSettings,
        timings: ConsumerTimings,
        handlers: SyncHandlers,
    ) -> Arc<Self> {
        let state = ConsumerSyncState::new(settings.mode);
        let (snapshots, _) = watch::channel(SyncStateSnapshot::from(&state));
        Arc::new(Self {
            report_id: report_id.to_string(),
            settings,
            timings,
            handlers,
            inbox: Mutex::new(Inbox::default()),
            state: Mutex::new(state),
            snapshots,
            timers: Mutex::new(ConsumerTimers::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn report_id(&self) -> &str {
        &self.report_id
    }

    pub fn state(&self) -> ConsumerSyncState {
        lock(&self.state).clone()
    }

    pub fn snapshot(&self) -> SyncStateSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncStateSnapshot> {
        self.snapshots.subscribe()
    }

    /// Queues one input. If no other caller is draining the inbox, drains it
    /// here: each input is run through the machine and its effects performed
    /// before the next one starts.
    pub fn apply(self: &Arc<Self>, input: PolicyInput) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        {
            let mut inbox = lock(&self.inbox);
            inbox.queue.push_back(input);
            if inbox.draining {
                return;
            }
            inbox.draining = true;
        }

        let mut guard = DrainGuard {
            inbox: &self.inbox,
            armed: true,
        };
        loop {
            let next = {
                let mut inbox = lock(&self.inbox);
                let input = inbox
                    .queue
                    .pop_front()
                    .filter(|_| !self.closed.load(Ordering::Acquire));
                match input {
                    Some(input) => input,
                    None => {
                        inbox.draining = false;
                        guard.armed = false;
                        return;
                    }
                }
            };
            for effect in self.step(next) {
                self.perform(effect);
            }
        }
    }

    /// Runs one transition under the state lock and publishes the snapshot.
    fn step(&self, input: PolicyInput) -> Vec<Effect> {
        let mut state = lock(&self.state);
        let ctx = PolicyContext {
            settings: &self.settings,
            now: Instant::now(),
            wall_clock: Utc::now(),
            volume_window: self.timings.volume_window,
            activity_threshold: self.timings.activity_threshold,
        };
        let Transition {
            state: next,
            effects,
        } = transition(&state, input, &ctx);
        *state = next;

        let snapshot = SyncStateSnapshot::from(&*state);
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
        effects
    }

    fn perform(self: &Arc<Self>, effect: Effect) {
        match effect {
            Effect::RestartPendingTimer(generation) => {
                let timer = self.spawn_after(
                    self.timings.update_interval,
                    PolicyInput::PendingElapsed(generation),
                );
                restart_timer(&mut lock(&self.timers).pending, generation, timer);
            }
            Effect::ScheduleDelayedRefresh(generation) => {
                let timer = self.spawn_after(
                    self.timings.view_opened_delay,
                    PolicyInput::DelayedRefresh(generation),
                );
                restart_timer(&mut lock(&self.timers).delayed_refresh, generation, timer);
            }
            Effect::InvokeDataChange(event) => {
                if let Some(handler) = &self.handlers.data_change {
                    run_isolated("on_data_change", || handler(&event));
                }
            }
            Effect::InvokeUserUpdate(users) => {
                if let Some(handler) = &self.handlers.user_update {
                    run_isolated("on_user_update", || handler(users.as_slice()));
                }
            }
            Effect::NotifyPaused(reason) => {
                info!("Sync paused for report '{}': {}", self.report_id, reason);
                if let Some(handler) = &self.handlers.sync_paused {
                    run_isolated("on_sync_paused", || handler(&reason));
                }
            }
            Effect::NotifyResumed => {
                info!("Sync resumed for report '{}'", self.report_id);
                if let Some(handler) = &self.handlers.sync_resumed {
                    run_isolated("on_sync_resumed", || handler());
                }
            }
        }
    }

    fn spawn_after(self: &Arc<Self>, delay: Duration, input: PolicyInput) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(consumer) = weak.upgrade() {
                consumer.apply(input);
            }
        })
    }

    /// Starts the periodic volume and activity checks.
    pub fn start_monitors(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let tick = self.timings.monitor_tick;
        let watch_activity = self.settings.pause_on_user_activity;
        let monitor = tokio::spawn(run_monitor(weak, tick, watch_activity));
        if let Some(previous) = lock(&self.timers).monitor.replace(monitor) {
            previous.abort();
        }
    }

    /// Cancels every timer. Inputs arriving afterwards are ignored.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.inbox).queue.clear();
        lock(&self.timers).abort_all();
        debug!("Sync consumer for report '{}' shut down", self.report_id);
    }
}

impl Drop for SyncConsumer {
    fn drop(&mut self) {
        lock(&self.timers).abort_all();
    }
}

/// Stores `timer` unless a newer generation already holds the slot.
fn restart_timer(slot: &mut Option<(u64, JoinHandle<()>)>, generation: u64, timer: JoinHandle<()>) {
    if matches!(slot, Some((current, _)) if *current > generation) {
        timer.abort();
        return;
    }
    if let Some((_, previous)) = slot.replace((generation, timer)) {
        previous.abort();
    }
}

async fn run_monitor(consumer: Weak<SyncConsumer>, tick: Duration, watch_activity: bool) {
    let mut interval = time::interval_at(Instant::now() + tick, tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(consumer) = consumer.upgrade() else {
            break;
        };
        consumer.apply(PolicyInput::VolumeTick);
        if watch_activity {
            consumer.apply(PolicyInput::ActivityTick);
        }
    }
}

/// Bus observer that forwards a report's events into its consumer.
pub(crate) struct ConsumerObserver {
    consumer: Weak<SyncConsumer>,
}

impl ConsumerObserver {
    pub fn new(consumer: &Arc<SyncConsumer>) -> Self {
        Self {
            consumer: Arc::downgrade(consumer),
        }
    }
}

impl ReportObserver for ConsumerObserver {
    fn on_event(&self, event: &ReportEvent) {
        let Some(consumer) = self.consumer.upgrade() else {
            return;
        };
        let input = match event {
            ReportEvent::Update(update) => PolicyInput::Event(update.clone()),
            ReportEvent::Degraded { error, .. } => PolicyInput::Degraded(error.clone()),
        };
        consumer.apply(input);
    }

    fn name(&self) -> &str {
        "sync_consumer"
    }
}
