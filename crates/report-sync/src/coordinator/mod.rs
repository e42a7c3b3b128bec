//! Coordinator facade.
//!
//! - **Service** (`service.rs`) - `ReportSyncCoordinator`, subscriptions and lifecycle hooks
//! - **Report** (`report.rs`) - `RealtimeReport`, a consumer view with its own policy state
//!
//! ```text
//! subscribe(options, observer)
//!   1. register observer on the bus
//!   2. ensure change feeds for the watched resources
//!   3. join the presence room
//!   4. dispatch ViewOpened
//!   → Subscription (drop = unregister; last one out releases feeds + room)
//! ```

mod report;
mod service;


pub use report::{RealtimeReport, RealtimeReportConfig};
pub use service::{CoordinatorStats, ReportSyncCoordinator, SubscribeOptions, Subscription};
