//! Condition variable with absolute-deadline timed waits.
use std::sync::Condvar;

use super::mutex::MutexGuard;
use crate::time::Time;
use crate::Error;

pub type WaitResult<'a, T> = Result<MutexGuard<'a, T>, Error<MutexGuard<'a, T>>>;

/// Result of a timed wait: the re-acquired guard and whether the deadline passed.
pub type TimedWaitResult<'a, T> =
    Result<(MutexGuard<'a, T>, bool), Error<MutexGuard<'a, T>>>;

#[derive(Debug, Default)]
pub struct Condition {
    inner: Condvar,
}

impl Condition {
    #[inline]
    pub const fn new() -> Self {
        Condition {
            inner: Condvar::new(),
        }
    }

    /// Wake one waiter. Callers signal with the associated mutex held.
    #[inline]
    pub fn signal(&self) {
        self.inner.notify_one();
    }

    /// Wake all waiters.
    #[inline]
    pub fn broadcast(&self) {
        self.inner.notify_all();
    }

    /// Block until signaled. May wake spuriously.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> WaitResult<'a, T> {
        self.inner
            .wait(guard)
            .map_err(|poisoned| Error::new(poisoned.into_inner()))
    }

    /// Block until signaled or until `timeout_ms` milliseconds after the call.
    ///
    /// The deadline is fixed when the call is made. The returned flag is true when the
    /// deadline has passed.
    pub fn timed_wait<'a, T>(&self, guard: MutexGuard<'a, T>, timeout_ms: u64) -> TimedWaitResult<'a, T> {
        let deadline = Time::now() + Time::from_millis(timeout_ms);
        self.wait_until(guard, deadline)
    }

    /// Block until signaled or until the monotonic clock reaches `deadline`.
    pub fn wait_until<'a, T>(&self, guard: MutexGuard<'a, T>, deadline: Time) -> TimedWaitResult<'a, T> {
        let remaining = deadline - Time::now();
        if remaining.is_zero() {
            return Ok((guard, true));
        }
        match self.inner.wait_timeout(guard, remaining.as_duration()) {
            Ok((guard, _)) => Ok((guard, !Time::now().less(&deadline))),
            Err(poisoned) => Err(Error::new(poisoned.into_inner().0)),
        }
    }

    /// Wait while `condition` holds, for at most `timeout_ms` milliseconds in total.
    ///
    /// Spurious wakeups re-wait only for what is left until the original deadline.
    pub fn timed_wait_while<'a, T, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        timeout_ms: u64,
        mut condition: F,
    ) -> TimedWaitResult<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        let deadline = Time::now() + Time::from_millis(timeout_ms);
        while condition(&mut *guard) {
            let (g, timed_out) = self.wait_until(guard, deadline)?;
            guard = g;
            if timed_out {
                let still = condition(&mut *guard);
                return Ok((guard, still));
            }
        }
        Ok((guard, false))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::thread::mutex::Mutex;

    #[test]
    fn timed_wait_expires() {
        let m = Mutex::new(());
        let c = Condition::new();
        let start = Time::now();
        let (_g, timed_out) = c.timed_wait(m.lock(), 20).unwrap();
        assert!(timed_out);
        assert!(!(Time::now() - start).less(&Time::from_millis(20)));
    }

    #[test]
    fn signal_wakes_waiter() {
        let shared = Arc::new((Mutex::new(false), Condition::new()));
        let waker = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                let (m, c) = &*shared;
                let mut ready = m.lock();
                *ready = true;
                c.signal();
            })
        };
        let (m, c) = &*shared;
        let (guard, timed_out) = c
            .timed_wait_while(m.lock(), 5000, |ready| !*ready)
            .unwrap();
        assert!(*guard);
        assert!(!timed_out);
        drop(guard);
        waker.join().unwrap();
    }

    #[test]
    fn broadcast_wakes_all() {
        let shared = Arc::new((Mutex::new(0u32), Condition::new()));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    let (m, c) = &*shared;
                    let (g, timed_out) = c.timed_wait_while(m.lock(), 5000, |gen| *gen == 0).unwrap();
                    assert!(!timed_out);
                    *g
                })
            })
            .collect();
        std::thread::sleep(std::time::Duration::from_millis(20));
        {
            let (m, c) = &*shared;
            *m.lock() = 1;
            c.broadcast();
        }
        for w in waiters {
            assert_eq!(w.join().unwrap(), 1);
        }
    }
}
