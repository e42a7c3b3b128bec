//! Presence tracker.
//!
//! Opens at most one membership channel per report and keeps a live roster
//! from its signals:
//!
//! ```text
//! Sync(state)   → roster = roster_from_state(state) → PresenceSync { active_users }
//! Join(members) → upsert each                        → PresenceDiff { Join, user }
//! Leave(members)→ remove each                        → PresenceDiff { Leave, user }
//! ```
//!
//! The tracker is the only writer of a roster; consumers receive copies
//! through the bus. Once a channel is established the local viewer announces
//! itself exactly once on that channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::model::{
    remove_member, roster_from_state, upsert_member, MembershipSignal, PresenceAction,
    PresenceMember,
};
use super::traits::{MembershipChannel, MembershipChannelProvider, MembershipHandle};
use crate::bus::EventBus;
use crate::constants::PRESENCE_ROOM_PREFIX;
use crate::events::{ReportEvent, UpdateEvent};
use crate::identity::IdentityService;
use crate::utils::lock;

/// Room key of the membership channel for a report.
pub fn room_key(report_id: &str) -> String {
    format!("{}{}", PRESENCE_ROOM_PREFIX, report_id)
}

struct PresenceRoom {
    token: u64,
    handle: Option<Arc<dyn MembershipHandle>>,
    task: JoinHandle<()>,
    roster: Vec<PresenceMember>,
    /// The local viewer, once announced.
    local_member: Option<PresenceMember>,
    last_heartbeat: Option<Instant>,
}

type RoomMap = HashMap<String, PresenceRoom>;

/// Shared pieces a channel task needs.
#[derive(Clone)]
struct ChannelContext {
    provider: Arc<dyn MembershipChannelProvider>,
    identity: Arc<IdentityService>,
    bus: EventBus,
    rooms: Arc<Mutex<RoomMap>>,
}

pub(crate) struct PresenceTracker {
    ctx: ChannelContext,
    next_token: AtomicU64,
    heartbeat_interval: Duration,
}

impl PresenceTracker {
    pub fn new(
        provider: Arc<dyn MembershipChannelProvider>,
        identity: Arc<IdentityService>,
        bus: EventBus,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            ctx: ChannelContext {
                provider,
                identity,
                bus,
                rooms: Arc::new(Mutex::new(HashMap::new())),
            },
            next_token: AtomicU64::new(1),
            heartbeat_interval,
        }
    }

    /// Starts the membership channel for a report unless one already exists.
    pub fn join(&self, report_id: &str) -> bool {
        let mut rooms = lock(&self.ctx.rooms);
        if rooms.contains_key(report_id) {
            return false;
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(run_channel(self.ctx.clone(), report_id.to_string(), token));
        rooms.insert(
            report_id.to_string(),
            PresenceRoom {
                token,
                handle: None,
                task,
                roster: Vec::new(),
                local_member: None,
                last_heartbeat: None,
            },
        );
        true
    }

    /// Tears down the membership channel of a report.
    pub fn leave(&self, report_id: &str) -> bool {
        let Some(room) = lock(&self.ctx.rooms).remove(report_id) else {
            return false;
        };
        close_room(room);
        info!("Left presence channel for report '{}'", report_id);
        true
    }

    pub fn leave_all(&self) -> usize {
        let rooms = std::mem::take(&mut *lock(&self.ctx.rooms));
        let count = rooms.len();
        for room in rooms.into_values() {
            close_room(room);
        }
        count
    }

    pub fn roster(&self, report_id: &str) -> Vec<PresenceMember> {
        lock(&self.ctx.rooms)
            .get(report_id)
            .map(|room| room.roster.clone())
            .unwrap_or_default()
    }

    /// Number of established membership channels.
    pub fn open_channel_count(&self) -> usize {
        lock(&self.ctx.rooms)
            .values()
            .filter(|room| room.handle.is_some())
            .count()
    }

    /// Refreshes the local viewer's `last_activity_at` in the room, at most
    /// once per heartbeat interval.
    pub fn heartbeat(&self, report_id: &str) {
        let now = Instant::now();
        let (handle, member) = {
            let mut rooms = lock(&self.ctx.rooms);
            let Some(room) = rooms.get_mut(report_id) else {
                return;
            };
            let (Some(handle), Some(member)) = (room.handle.clone(), room.local_member.as_mut())
            else {
                return;
            };
            if room
                .last_heartbeat
                .is_some_and(|t| now.duration_since(t) < self.heartbeat_interval)
            {
                return;
            }
            member.touch(Utc::now());
            room.last_heartbeat = Some(now);
            (handle, member.clone())
        };

        let report_id = report_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = handle.track(&member).await {
                debug!("Presence heartbeat for report '{}' failed: {}", report_id, e);
            }
        });
    }
}

fn close_room(room: PresenceRoom) {
    room.task.abort();
    if let Some(handle) = room.handle {
        handle.close();
    }
}

/// Runs `f` on the room if it still belongs to `token`.
fn with_room<R>(
    rooms: &Mutex<RoomMap>,
    report_id: &str,
    token: u64,
    f: impl FnOnce(&mut PresenceRoom) -> R,
) -> Option<R> {
    let mut rooms = lock(rooms);
    match rooms.get_mut(report_id) {
        Some(room) if room.token == token => Some(f(room)),
        _ => None,
    }
}

fn forget(rooms: &Mutex<RoomMap>, report_id: &str, token: u64) -> Option<PresenceRoom> {
    let mut rooms = lock(rooms);
    if rooms.get(report_id).map(|r| r.token) != Some(token) {
        return None;
    }
    rooms.remove(report_id)
}

async fn run_channel(ctx: ChannelContext, report_id: String, token: u64) {
    let room = room_key(&report_id);
    let MembershipChannel {
        mut signals,
        handle,
    } = match ctx.provider.open(&room).await {
        Ok(channel) => channel,
        Err(err) => {
            warn!("Presence disabled for report '{}': {}", report_id, err);
            forget(&ctx.rooms, &report_id, token);
            return;
        }
    };

    let handle: Arc<dyn MembershipHandle> = Arc::from(handle);
    let attached = with_room(&ctx.rooms, &report_id, token, |room| {
        room.handle = Some(handle.clone());
    });
    if attached.is_none() {
        debug!(
            "Report '{}' released while presence channel was opening",
            report_id
        );
        handle.close();
        return;
    }
    debug!("Presence channel '{}' established", room);

    announce(&ctx, &handle, &report_id, token).await;

    while let Some(signal) = signals.next().await {
        apply_signal(&ctx, &report_id, token, signal);
    }

    debug!("Presence channel '{}' ended upstream", room);
    if let Some(room) = forget(&ctx.rooms, &report_id, token) {
        if let Some(handle) = room.handle {
            handle.close();
        }
    }
}

async fn announce(
    ctx: &ChannelContext,
    handle: &Arc<dyn MembershipHandle>,
    report_id: &str,
    token: u64,
) {
    let identity = ctx.identity.resolve().await;
    let member = PresenceMember::new(identity.user_id, identity.display_name, Utc::now());

    match handle.track(&member).await {
        Ok(()) => {
            info!(
                "Announced presence of '{}' on report '{}'",
                member.user_id, report_id
            );
            with_room(&ctx.rooms, report_id, token, |room| {
                room.local_member = Some(member);
                room.last_heartbeat = Some(Instant::now());
            });
        }
        Err(e) => warn!("Failed to announce presence on report '{}': {}", report_id, e),
    }
}

fn apply_signal(ctx: &ChannelContext, report_id: &str, token: u64, signal: MembershipSignal) {
    let events = with_room(&ctx.rooms, report_id, token, |room| match signal {
        MembershipSignal::Sync(state) => {
            room.roster = roster_from_state(&state);
            vec![UpdateEvent::presence_sync(report_id, room.roster.clone())]
        }
        MembershipSignal::Join(members) => members
            .into_iter()
            .map(|member| {
                upsert_member(&mut room.roster, &member);
                UpdateEvent::presence_diff(report_id, PresenceAction::Join, member)
            })
            .collect(),
        MembershipSignal::Leave(members) => members
            .into_iter()
            .map(|member| {
                remove_member(&mut room.roster, &member.user_id);
                UpdateEvent::presence_diff(report_id, PresenceAction::Leave, member)
            })
            .collect(),
    });

    for event in events.unwrap_or_default() {
        ctx.bus.dispatch(ReportEvent::Update(event));
    }
}
