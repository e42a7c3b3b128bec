//! Change feed module.
//!
//! - **Traits** (`traits.rs`) - the upstream change-feed collaborator contract
//! - **Multiplexer** (`multiplexer.rs`) - at most one upstream subscription per
//!   (report, resource) pair, forwarding normalized events into the bus

mod multiplexer;
mod traits;

pub(crate) use multiplexer::ChangeFeedMultiplexer;
pub use traits::{ChangeFeed, ChangeFeedProvider, ChangeNotification, FeedHandle};
