//! Update event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::presence::{PresenceAction, PresenceMember};

/// Coarse classification of an update, as seen by report consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    UserUpdate,
    DataChange,
    ViewOpened,
}

/// Kind of change reported by an upstream change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

/// Typed payload of an update event.
///
/// The variant determines the event's [`UpdateKind`]; consumers match on the
/// payload instead of inspecting free-form metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdatePayload {
    /// A watched resource changed upstream.
    DataChange {
        resource: String,
        change_type: ChangeType,
        record: Value,
    },

    /// Full roster after a membership sync.
    PresenceSync { active_users: Vec<PresenceMember> },

    /// A single viewer joined or left.
    PresenceDiff {
        action: PresenceAction,
        user: PresenceMember,
    },

    /// Explicit refresh requested by a user.
    ManualRefresh {
        #[serde(default)]
        metadata: Map<String, Value>,
    },

    /// Refresh requested by the consumer's own interval scheduling.
    ScheduledRefresh {
        #[serde(default)]
        metadata: Map<String, Value>,
    },

    /// A view of the report was opened or brought back to the foreground.
    ViewOpened {
        #[serde(default)]
        metadata: Map<String, Value>,
    },
}

/// One normalized occurrence, immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEvent {
    pub report_id: String,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: UpdatePayload,
}

impl UpdateEvent {
    fn new(report_id: &str, user_id: Option<String>, payload: UpdatePayload) -> Self {
        Self {
            report_id: report_id.to_string(),
            user_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Creates a DataChange event for a watched resource.
    pub fn data_change(
        report_id: &str,
        resource: &str,
        change_type: ChangeType,
        record: Value,
    ) -> Self {
        Self::new(
            report_id,
            None,
            UpdatePayload::DataChange {
                resource: resource.to_string(),
                change_type,
                record,
            },
        )
    }

    /// Creates a roster event after a membership sync.
    pub fn presence_sync(report_id: &str, active_users: Vec<PresenceMember>) -> Self {
        Self::new(report_id, None, UpdatePayload::PresenceSync { active_users })
    }

    /// Creates a join/leave event for a single viewer.
    pub fn presence_diff(report_id: &str, action: PresenceAction, user: PresenceMember) -> Self {
        Self::new(
            report_id,
            Some(user.user_id.clone()),
            UpdatePayload::PresenceDiff { action, user },
        )
    }

    /// Creates a manual refresh event on behalf of `user_id`.
    pub fn manual(report_id: &str, user_id: String, metadata: Map<String, Value>) -> Self {
        Self::new(
            report_id,
            Some(user_id),
            UpdatePayload::ManualRefresh { metadata },
        )
    }

    /// Creates a refresh event driven by the consumer's interval schedule.
    pub fn scheduled(report_id: &str, metadata: Map<String, Value>) -> Self {
        Self::new(report_id, None, UpdatePayload::ScheduledRefresh { metadata })
    }

    /// Creates a ViewOpened event.
    pub fn view_opened(
        report_id: &str,
        user_id: Option<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self::new(report_id, user_id, UpdatePayload::ViewOpened { metadata })
    }

    pub fn kind(&self) -> UpdateKind {
        match self.payload {
            UpdatePayload::DataChange { .. } => UpdateKind::DataChange,
            UpdatePayload::PresenceSync { .. }
            | UpdatePayload::PresenceDiff { .. }
            | UpdatePayload::ManualRefresh { .. }
            | UpdatePayload::ScheduledRefresh { .. } => UpdateKind::UserUpdate,
            UpdatePayload::ViewOpened { .. } => UpdateKind::ViewOpened,
        }
    }

    /// True for events produced by an explicit manual trigger.
    pub fn is_manual(&self) -> bool {
        matches!(self.payload, UpdatePayload::ManualRefresh { .. })
    }
}

/// Envelope carried by the event bus.
#[derive(Clone, Debug)]
pub enum ReportEvent {
    /// A normalized update for a report.
    Update(UpdateEvent),

    /// A collaborator failed; the report keeps running without that source.
    Degraded { report_id: String, error: String },
}

impl ReportEvent {
    pub fn report_id(&self) -> &str {
        match self {
            ReportEvent::Update(event) => &event.report_id,
            ReportEvent::Degraded { report_id, .. } => report_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_follows_payload() {
        let change = UpdateEvent::data_change("R1", "transactions", ChangeType::Insert, json!({}));
        assert_eq!(change.kind(), UpdateKind::DataChange);
        assert!(!change.is_manual());

        let manual = UpdateEvent::manual("R1", "u1".to_string(), Map::new());
        assert_eq!(manual.kind(), UpdateKind::UserUpdate);
        assert!(manual.is_manual());
        assert_eq!(manual.user_id.as_deref(), Some("u1"));

        let opened = UpdateEvent::view_opened("R1", None, Map::new());
        assert_eq!(opened.kind(), UpdateKind::ViewOpened);
    }

    #[test]
    fn test_data_change_serialization() {
        let event = UpdateEvent::data_change(
            "R1",
            "transactions",
            ChangeType::Update,
            json!({ "id": 7, "amount": "12.50" }),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"reportId\":\"R1\""));
        assert!(json.contains("data_change"));

        let deserialized: UpdateEvent = serde_json::from_str(&json).unwrap();
        match deserialized.payload {
            UpdatePayload::DataChange {
                resource,
                change_type,
                record,
            } => {
                assert_eq!(resource, "transactions");
                assert_eq!(change_type, ChangeType::Update);
                assert_eq!(record["id"], 7);
            }
            _ => panic!("Expected DataChange"),
        }
    }

    #[test]
    fn test_unknown_change_type_deserializes() {
        let change: ChangeType = serde_json::from_str("\"truncate\"").unwrap();
        assert_eq!(change, ChangeType::Unknown);
    }

    #[test]
    fn test_report_event_report_id() {
        let degraded = ReportEvent::Degraded {
            report_id: "R2".to_string(),
            error: "down".to_string(),
        };
        assert_eq!(degraded.report_id(), "R2");
    }
}
