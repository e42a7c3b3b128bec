//! Sync policy engine.
//!
//! Decides per consumer whether and when a bus event reaches the consumer's
//! callbacks.
//!
//! - **Model** (`model.rs`) - sync modes, pause reasons, settings and state
//! - **Machine** (`machine.rs`) - the pure `transition(state, input) -> (state, effects)`
//! - **Consumer** (`consumer.rs`) - timers, handlers and state snapshots around the machine
//!
//! Mode is a gate, never an automatic transition. The pause overlay sits on
//! top of every mode:
//!
//! ```text
//!            off ─► nothing
//!         manual ─► ManualRefresh only
//! realtime/interval/idle ─► allow-list ─► pause overlay ─► business hours ─► callback
//! ```

mod consumer;
mod machine;
mod model;

pub(crate) use consumer::{ConsumerObserver, ConsumerTimings, SyncConsumer};
pub use consumer::{
    DataChangeHandler, PausedHandler, ResumedHandler, SyncHandlers, UserUpdateHandler,
};
pub use machine::{classify, transition, Effect, PolicyContext, PolicyInput, Transition};
pub use model::{
    BusinessHours, ConsumerSyncState, PauseReason, PendingBatch, SyncControlSettings, SyncMode,
    SyncStateSnapshot, TriggerKind,
};
