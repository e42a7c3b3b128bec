//! Report events module.
//!
//! Provides the event vocabulary shared by every component and the observer
//! trait through which the bus delivers events.

mod observer;
mod update_event;

pub use observer::*;
pub use update_event::*;
