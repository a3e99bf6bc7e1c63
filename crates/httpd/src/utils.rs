//! Macros and helpers shared by the server modules.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Returns `Err($error)` from the enclosing function unless `$predicate` holds.
///
/// ```ignore
/// ensure!(config.thread_num > 0, ServerError::invalid_config("thread_num must be > 0"));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

/// Invokes a `libc` function and turns a `-1` return value into `io::Error::last_os_error()`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe, reason = "some callers are already inside an unsafe block")]
        // SAFETY: every call site passes descriptors it owns and pointers to live locals.
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use ensure;
pub(crate) use syscall;

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Guarded structures in this crate stay consistent across a panicking holder.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
