//! In-memory collaborators.
//!
//! Used by tests and by the sync-monitor demo. Every double counts open calls
//! and live handles so callers can assert the dedup and teardown invariants
//! directly.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::errors::{Result, SyncError};
use crate::events::ChangeType;
use crate::feeds::{ChangeFeed, ChangeFeedProvider, ChangeNotification, FeedHandle};
use crate::identity::IdentityResolver;
use crate::presence::{
    MembershipChannel, MembershipChannelProvider, MembershipHandle, MembershipSignal,
    PresenceMember,
};
use crate::utils::lock;

// =============================================================================
// Change Feed
// =============================================================================

#[derive(Default)]
struct FeedState {
    subscribers: HashMap<String, Vec<(usize, mpsc::UnboundedSender<ChangeNotification>)>>,
    open_calls: HashMap<String, usize>,
    open_handles: usize,
    failing: HashSet<String>,
}

/// Change-feed provider backed by in-process channels.
#[derive(Clone, Default)]
pub struct InMemoryChangeFeed {
    state: Arc<Mutex<FeedState>>,
    next_id: Arc<AtomicUsize>,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every future `open` of `resource` fail.
    pub fn fail_resource(&self, resource: &str) {
        lock(&self.state).failing.insert(resource.to_string());
    }

    /// Sends a change to every open subscription on `resource`. Returns the
    /// number of subscriptions reached.
    pub fn emit(&self, resource: &str, change_type: ChangeType, record: Value) -> usize {
        let state = lock(&self.state);
        let Some(subscribers) = state.subscribers.get(resource) else {
            return 0;
        };
        subscribers
            .iter()
            .filter(|(_, sender)| {
                sender
                    .send(ChangeNotification::new(change_type, record.clone()))
                    .is_ok()
            })
            .count()
    }

    pub fn open_calls(&self, resource: &str) -> usize {
        lock(&self.state)
            .open_calls
            .get(resource)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_open_calls(&self) -> usize {
        lock(&self.state).open_calls.values().sum()
    }

    /// Handles returned by `open` that have not been closed yet.
    pub fn open_handles(&self) -> usize {
        lock(&self.state).open_handles
    }

    pub fn subscriber_count(&self, resource: &str) -> usize {
        lock(&self.state)
            .subscribers
            .get(resource)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl ChangeFeedProvider for InMemoryChangeFeed {
    async fn open(&self, resource: &str) -> Result<ChangeFeed> {
        let mut state = lock(&self.state);
        *state.open_calls.entry(resource.to_string()).or_default() += 1;
        if state.failing.contains(resource) {
            return Err(SyncError::feed_open(resource, "resource unavailable"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        state
            .subscribers
            .entry(resource.to_string())
            .or_default()
            .push((id, sender));
        state.open_handles += 1;

        Ok(ChangeFeed {
            notifications: Box::pin(UnboundedReceiverStream::new(receiver)),
            handle: Box::new(InMemoryFeedHandle {
                id,
                resource: resource.to_string(),
                state: self.state.clone(),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

struct InMemoryFeedHandle {
    id: usize,
    resource: String,
    state: Arc<Mutex<FeedState>>,
    closed: AtomicBool,
}

impl FeedHandle for InMemoryFeedHandle {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = lock(&self.state);
        if let Some(subscribers) = state.subscribers.get_mut(&self.resource) {
            subscribers.retain(|(id, _)| *id != self.id);
        }
        state.open_handles = state.open_handles.saturating_sub(1);
    }
}

impl Drop for InMemoryFeedHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Membership Channel
// =============================================================================

#[derive(Default)]
struct Room {
    subscribers: Vec<(usize, mpsc::UnboundedSender<MembershipSignal>)>,
    members: HashMap<String, Vec<PresenceMember>>,
}

impl Room {
    fn broadcast(&mut self, signal: MembershipSignal) {
        self.subscribers
            .retain(|(_, sender)| sender.send(signal.clone()).is_ok());
    }

    fn broadcast_sync(&mut self) {
        let state = self.members.clone();
        self.broadcast(MembershipSignal::Sync(state));
    }
}

#[derive(Default)]
struct MembershipState {
    rooms: HashMap<String, Room>,
    open_calls: HashMap<String, usize>,
    open_handles: usize,
    track_calls: usize,
    failing: HashSet<String>,
}

/// Membership provider backed by in-process channels.
///
/// Each `open` receives the current room state as an initial `Sync`.
#[derive(Clone, Default)]
pub struct InMemoryMembership {
    state: Arc<Mutex<MembershipState>>,
    next_id: Arc<AtomicUsize>,
}

impl InMemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_room(&self, room_key: &str) {
        lock(&self.state).failing.insert(room_key.to_string());
    }

    /// A remote viewer joins: relays `Join` followed by `Sync`.
    pub fn join(&self, room_key: &str, member: PresenceMember) {
        let mut state = lock(&self.state);
        let room = state.rooms.entry(room_key.to_string()).or_default();
        room.members
            .entry(member.user_id.clone())
            .or_default()
            .push(member.clone());
        room.broadcast(MembershipSignal::Join(vec![member]));
        room.broadcast_sync();
    }

    /// A remote viewer leaves: relays `Leave` followed by `Sync`.
    pub fn leave(&self, room_key: &str, user_id: &str) {
        let mut state = lock(&self.state);
        let Some(room) = state.rooms.get_mut(room_key) else {
            return;
        };
        if let Some(entries) = room.members.remove(user_id) {
            room.broadcast(MembershipSignal::Leave(entries));
        }
        room.broadcast_sync();
    }

    /// Relays a raw signal without touching the room state.
    pub fn send_signal(&self, room_key: &str, signal: MembershipSignal) {
        if let Some(room) = lock(&self.state).rooms.get_mut(room_key) {
            room.broadcast(signal);
        }
    }

    /// Relays the current room state.
    pub fn sync(&self, room_key: &str) {
        if let Some(room) = lock(&self.state).rooms.get_mut(room_key) {
            room.broadcast_sync();
        }
    }

    pub fn members(&self, room_key: &str) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.state)
            .rooms
            .get(room_key)
            .map(|room| room.members.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn open_calls(&self, room_key: &str) -> usize {
        lock(&self.state)
            .open_calls
            .get(room_key)
            .copied()
            .unwrap_or(0)
    }

    pub fn open_handles(&self) -> usize {
        lock(&self.state).open_handles
    }

    pub fn track_calls(&self) -> usize {
        lock(&self.state).track_calls
    }
}

#[async_trait]
impl MembershipChannelProvider for InMemoryMembership {
    async fn open(&self, room_key: &str) -> Result<MembershipChannel> {
        let mut state = lock(&self.state);
        *state.open_calls.entry(room_key.to_string()).or_default() += 1;
        if state.failing.contains(room_key) {
            return Err(SyncError::presence_channel(room_key, "room unavailable"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let room = state.rooms.entry(room_key.to_string()).or_default();
        // A fresh subscriber starts from the current room state.
        let _ = sender.send(MembershipSignal::Sync(room.members.clone()));
        room.subscribers.push((id, sender));
        state.open_handles += 1;

        Ok(MembershipChannel {
            signals: Box::pin(UnboundedReceiverStream::new(receiver)),
            handle: Box::new(InMemoryMembershipHandle {
                id,
                room_key: room_key.to_string(),
                state: self.state.clone(),
                tracked: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

struct InMemoryMembershipHandle {
    id: usize,
    room_key: String,
    state: Arc<Mutex<MembershipState>>,
    /// User id this handle tracks, if any.
    tracked: Mutex<Option<String>>,
    closed: AtomicBool,
}

#[async_trait]
impl MembershipHandle for InMemoryMembershipHandle {
    async fn track(&self, member: &PresenceMember) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::presence_channel(&self.room_key, "channel closed"));
        }
        let mut state = lock(&self.state);
        state.track_calls += 1;
        let room = state.rooms.entry(self.room_key.clone()).or_default();
        let is_new = room
            .members
            .insert(member.user_id.clone(), vec![member.clone()])
            .is_none();
        if is_new {
            room.broadcast(MembershipSignal::Join(vec![member.clone()]));
        }
        room.broadcast_sync();
        *lock(&self.tracked) = Some(member.user_id.clone());
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let tracked = lock(&self.tracked).take();
        let mut state = lock(&self.state);
        state.open_handles = state.open_handles.saturating_sub(1);
        let Some(room) = state.rooms.get_mut(&self.room_key) else {
            return;
        };
        room.subscribers.retain(|(id, _)| *id != self.id);
        if let Some(entries) = tracked.and_then(|user_id| room.members.remove(&user_id)) {
            room.broadcast(MembershipSignal::Leave(entries));
            room.broadcast_sync();
        }
    }
}

impl Drop for InMemoryMembershipHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Identity
// =============================================================================

/// Identity resolver returning a fixed user, or failing when it has none.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user_id: Option<String>,
    display_name: Option<String>,
}

impl StaticIdentity {
    pub fn new(user_id: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            display_name,
        }
    }

    /// A resolver whose every call fails, like a signed-out session.
    pub fn signed_out() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentity {
    async fn current_user_id(&self) -> Result<String> {
        self.user_id
            .clone()
            .ok_or_else(|| SyncError::identity("no signed-in user"))
    }

    async fn current_display_name(&self) -> Result<Option<String>> {
        Ok(self.display_name.clone())
    }
}
