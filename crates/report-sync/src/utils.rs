use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};

use log::warn;

use crate::errors::SyncError;

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// Consumer callbacks never run while one of these locks is held, so a
/// poisoned lock only means a panic interrupted bookkeeping that is still
/// structurally valid.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs a consumer callback, converting a panic into a logged `Callback` error.
pub(crate) fn run_isolated<F: FnOnce()>(name: &str, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let err = SyncError::callback(name, panic_message(payload.as_ref()));
            warn!("{}", err);
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
