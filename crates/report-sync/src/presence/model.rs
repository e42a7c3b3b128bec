//! Presence domain types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One user viewing a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMember {
    pub user_id: String,
    pub display_name: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl PresenceMember {
    /// Creates a member that joined (and was last active) at `now`.
    pub fn new(user_id: impl Into<String>, display_name: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name,
            joined_at: now,
            last_activity_at: now,
        }
    }

    /// Records activity, never moving `last_activity_at` before `joined_at`.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_activity_at = at.max(self.joined_at).max(self.last_activity_at);
    }
}

/// Direction of a single presence change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Join,
    Leave,
}

/// Signal relayed by a membership channel.
#[derive(Debug, Clone)]
pub enum MembershipSignal {
    /// Members that just joined the room.
    Join(Vec<PresenceMember>),
    /// Members that just left the room.
    Leave(Vec<PresenceMember>),
    /// Full room state, keyed by presence key. One key may carry several
    /// entries (for example one per open tab).
    Sync(HashMap<String, Vec<PresenceMember>>),
}

/// Builds the roster from a full membership state.
///
/// Entries are deduplicated by user id (keeping the earliest join and the
/// latest activity) and ordered by join time.
pub fn roster_from_state(state: &HashMap<String, Vec<PresenceMember>>) -> Vec<PresenceMember> {
    let mut by_user: HashMap<&str, PresenceMember> = HashMap::new();
    for member in state.values().flatten() {
        by_user
            .entry(member.user_id.as_str())
            .and_modify(|existing| merge_member(existing, member))
            .or_insert_with(|| normalized(member));
    }

    let mut roster: Vec<PresenceMember> = by_user.into_values().collect();
    roster.sort_by(|a, b| {
        a.joined_at
            .cmp(&b.joined_at)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    roster
}

/// Inserts or refreshes a member in a roster.
pub(crate) fn upsert_member(roster: &mut Vec<PresenceMember>, member: &PresenceMember) {
    match roster.iter_mut().find(|m| m.user_id == member.user_id) {
        Some(existing) => merge_member(existing, member),
        None => roster.push(normalized(member)),
    }
}

/// Removes a member from a roster. Returns true if it was present.
pub(crate) fn remove_member(roster: &mut Vec<PresenceMember>, user_id: &str) -> bool {
    let before = roster.len();
    roster.retain(|m| m.user_id != user_id);
    roster.len() != before
}

fn merge_member(existing: &mut PresenceMember, incoming: &PresenceMember) {
    existing.joined_at = existing.joined_at.min(incoming.joined_at);
    existing.last_activity_at = existing.last_activity_at.max(incoming.last_activity_at);
    if incoming.display_name.is_some() {
        existing.display_name = incoming.display_name.clone();
    }
    existing.last_activity_at = existing.last_activity_at.max(existing.joined_at);
}

/// Copy of a relayed member with `last_activity_at` raised to `joined_at`.
fn normalized(member: &PresenceMember) -> PresenceMember {
    let mut member = member.clone();
    member.last_activity_at = member.last_activity_at.max(member.joined_at);
    member
}
