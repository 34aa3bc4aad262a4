use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, carrying on with the inner value if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
