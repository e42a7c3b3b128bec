//! Ledgerline Report Sync - real-time coordination for report views.
//!
//! Many independently opened report views subscribe to change notifications
//! from a shared backend. This crate multiplexes those subscriptions, tracks
//! who is viewing which report, and decides per view whether and when the
//! view's refresh callback runs.
//!
//! # Architecture
//!
//! ```text
//!  ChangeFeedProvider        MembershipChannelProvider
//!         │                            │
//!         ▼                            ▼
//!  ChangeFeedMultiplexer        PresenceTracker
//!  (one feed per report,        (one channel per report,
//!   resource pair)               roster + self-announce)
//!         │                            │
//!         └──────────► EventBus ◄──────┘
//!                  (single FIFO queue,
//!                   report + "global" fan-out)
//!                         │
//!            ┌────────────┼────────────┐
//!            ▼            ▼            ▼
//!       SyncConsumer SyncConsumer  global observers
//!       (policy state machine per RealtimeReport)
//! ```
//!
//! - **Events** (`events/`) - `UpdateEvent`, typed payloads and the observer trait
//! - **Registry / Bus** (`registry.rs`, `bus.rs`) - keyed fan-out with panic isolation
//! - **Feeds** (`feeds/`) - change-feed collaborator trait and the multiplexer
//! - **Presence** (`presence/`) - membership collaborator trait, roster and tracker
//! - **Policy** (`policy/`) - sync modes, pause overlay, volume and activity monitors
//! - **Coordinator** (`coordinator/`) - `ReportSyncCoordinator` and `RealtimeReport`
//!
//! Nothing here persists events or guarantees delivery; it is a best-effort,
//! in-process layer. It decides *whether/when* to call back, never *what* a
//! refresh does.

pub mod config;
pub mod constants;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod feeds;
pub mod identity;
pub mod memory;
pub mod policy;
pub mod presence;

mod bus;
mod registry;
mod utils;

pub use bus::EventBus;
pub use config::CoordinatorConfig;
pub use coordinator::{
    CoordinatorStats, RealtimeReport, RealtimeReportConfig, ReportSyncCoordinator,
    SubscribeOptions, Subscription,
};
pub use errors::{Result, SyncError};
pub use events::{
    ChangeType, ReportEvent, ReportObserver, UpdateEvent, UpdateKind, UpdatePayload,
};
pub use identity::{Identity, IdentityResolver};
pub use policy::{
    ConsumerSyncState, PauseReason, SyncControlSettings, SyncHandlers, SyncMode,
    SyncStateSnapshot, TriggerKind,
};
pub use presence::{PresenceAction, PresenceMember};
pub use registry::{ObserverId, GLOBAL_REPORT_ID};
