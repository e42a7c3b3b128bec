//! Presence module.
//!
//! - **Models** (`model.rs`) - `PresenceMember`, membership signals, roster helpers
//! - **Traits** (`traits.rs`) - the membership channel collaborator contract
//! - **Tracker** (`tracker.rs`) - one channel per report, live roster, self-announce

mod model;
mod tracker;
mod traits;

pub use model::{roster_from_state, MembershipSignal, PresenceAction, PresenceMember};
pub(crate) use tracker::PresenceTracker;
pub use tracker::room_key;
pub use traits::{MembershipChannel, MembershipChannelProvider, MembershipHandle};
