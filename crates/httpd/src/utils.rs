//! Utility macros and functions shared by the codecs, the request context and
//! the dispatchers.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// A macro for early returns with an error if a condition is not met.
///
/// This is similar to the `assert!` macro, but returns an error instead of panicking.
///
/// # Example
///
/// ```ignore
/// ensure!(headers.len() < max_headers, ParseError::too_many_headers(max_headers));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;

/// Locks a mutex, turning poisoning into a panic.
///
/// A poisoned lock means another thread panicked while mutating connection or
/// pool state, which is an invariant violation rather than a recoverable error.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => panic!("lock poisoned: {poisoned}"),
    }
}

/// Waits on a condition variable, see [`lock`] for poisoning.
pub(crate) fn wait<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    match cv.wait(guard) {
        Ok(guard) => guard,
        Err(poisoned) => panic!("lock poisoned: {poisoned}"),
    }
}

/// Waits on a condition variable for at most `timeout`.
pub(crate) fn wait_timeout<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>, timeout: Duration) -> MutexGuard<'a, T> {
    match cv.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(poisoned) => panic!("lock poisoned: {poisoned}"),
    }
}
