//! Helper utilities

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Define an `impl From<fromty> for toty` that wraps its input as
/// `toty::variant(Arc::new(e))`
macro_rules! define_from_for_arc {
    { $fromty:ty => $toty:ty [$variant:ident] } => {
        impl From<$fromty> for $toty {
            fn from(e: $fromty) -> $toty {
                Self::$variant(std::sync::Arc::new(e))
            }
        }
    };
}

pub(crate) use define_from_for_arc;

/// Lock `m`, ignoring poison.
///
/// Only for mutexes whose contents a panic can't leave half-updated, so
/// that a poisoned lock is still safe to use.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
