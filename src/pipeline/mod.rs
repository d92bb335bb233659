// Reconciliation pipeline: per-record processing, batch orchestration and sync

pub mod batch;
pub mod processing;
pub mod state;
pub mod sync;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
