use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::events::ChangeType;

/// One change notification from an upstream feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub change_type: ChangeType,
    pub record: Value,
}

impl ChangeNotification {
    pub fn new(change_type: ChangeType, record: Value) -> Self {
        Self {
            change_type,
            record,
        }
    }
}

/// Closes an upstream subscription. `close()` must be idempotent.
pub trait FeedHandle: Send + Sync {
    fn close(&self);
}

/// An established upstream subscription: its notification stream plus the
/// handle that tears it down.
pub struct ChangeFeed {
    pub notifications: BoxStream<'static, ChangeNotification>,
    pub handle: Box<dyn FeedHandle>,
}

/// Trait for upstream change-feed backends.
#[async_trait]
pub trait ChangeFeedProvider: Send + Sync {
    /// Opens a subscription to changes on `resource`.
    async fn open(&self, resource: &str) -> Result<ChangeFeed>;
}
