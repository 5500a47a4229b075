//! Portable timing and synchronization primitives shared by the ferry runtime.
//!
//! Everything here reads the monotonic clock. Absolute deadlines are always computed from
//! [`Time::now`], never from the wall clock, so adjusting the system time cannot stretch or
//! shrink a timeout.

pub mod thread;
pub mod time;

pub use thread::condition::Condition;
pub use thread::mutex::{Mutex, MutexGuard};
pub use time::Time;

use thiserror::Error;

/// Failure of an underlying OS primitive.
///
/// The guard that was held when the failure was observed is handed back, so the mutex stays
/// locked from the caller's point of view.
#[derive(Error)]
#[error("synchronization primitive failed: the lock was poisoned")]
pub struct Error<G> {
    guard: G,
}

impl<G> Error<G> {
    #[inline]
    pub(crate) fn new(guard: G) -> Self {
        Error { guard }
    }

    /// Recover the still-held guard.
    #[inline]
    pub fn into_guard(self) -> G {
        self.guard
    }
}

impl<G> std::fmt::Debug for Error<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Error").finish_non_exhaustive()
    }
}
