use async_trait::async_trait;
use futures::stream::BoxStream;

use super::model::{MembershipSignal, PresenceMember};
use crate::errors::Result;

/// Control side of an open membership channel.
#[async_trait]
pub trait MembershipHandle: Send + Sync {
    /// Publishes (or refreshes) the local viewer's presence in the room.
    async fn track(&self, member: &PresenceMember) -> Result<()>;

    /// Leaves the room. Must be idempotent.
    fn close(&self);
}

/// An established membership channel: the signal stream plus its handle.
pub struct MembershipChannel {
    pub signals: BoxStream<'static, MembershipSignal>,
    pub handle: Box<dyn MembershipHandle>,
}

/// Trait for membership (presence) backends.
#[async_trait]
pub trait MembershipChannelProvider: Send + Sync {
    /// Opens the channel for a room key.
    async fn open(&self, room_key: &str) -> Result<MembershipChannel>;
}
