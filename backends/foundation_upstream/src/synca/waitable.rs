// Implements a predicate-wait primitive usable across threads.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How long a pumping wait sleeps on the condition variable before it gives
/// the caller's pump another turn.
pub const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// `WaitableState` pairs a piece of state with the `Condvar` used to announce
/// changes to it.
///
/// The event loop thread mutates the state through [`Self::update`], which
/// notifies every waiter once the closure returns. Test threads block in one of
/// the `wait_*` methods until their predicate holds or the timeout elapses.
/// Waiters always re-check the predicate under the lock, so a notification that
/// lands before a waiter goes to sleep is never lost.
#[derive(Debug, Default)]
pub struct WaitableState<T> {
    /// The condition variable used to wake waiting threads.
    event: Condvar,

    /// The guarded state, only ever read or written with this lock held.
    lock: Mutex<T>,
}

impl<T> WaitableState<T> {
    #[must_use]
    pub fn new(state: T) -> Self {
        Self {
            event: Condvar::new(),
            lock: Mutex::new(state),
        }
    }

    fn guard(&self) -> MutexGuard<'_, T> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Mutates the state under the lock then wakes every waiter.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.guard();
        let result = mutate(&mut guard);
        drop(guard);

        self.event.notify_all();
        result
    }

    /// Reads the state under the lock.
    pub fn read<R>(&self, inspect: impl FnOnce(&T) -> R) -> R {
        let guard = self.guard();
        inspect(&guard)
    }

    /// Wakes every waiter without touching the state.
    pub fn notify(&self) {
        self.event.notify_all();
    }

    /// Blocks until `predicate` holds or `timeout` elapses.
    ///
    /// Returns whether the predicate was satisfied.
    pub fn wait_until(&self, timeout: Duration, mut predicate: impl FnMut(&T) -> bool) -> bool {
        self.wait_then(timeout, &mut predicate, |_| ()).is_some()
    }

    /// Blocks until `predicate` holds then runs `then` under the same lock
    /// acquisition, so nothing can slip in between the check and the action.
    ///
    /// Returns `None` if `timeout` elapsed first.
    pub fn wait_then<R>(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&T) -> bool,
        then: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let guard = self.guard();
        let (mut guard, _) = match self
            .event
            .wait_timeout_while(guard, timeout, |state| !predicate(&*state))
        {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };

        if predicate(&guard) {
            Some(then(&mut guard))
        } else {
            None
        }
    }

    /// Like [`Self::wait_then`] but calls `pump` between short condition
    /// waits.
    ///
    /// A test thread that owns a client event loop uses this to keep that loop
    /// turning while it waits for the server side, otherwise the client would
    /// never flush the bytes the server is waiting on.
    pub fn wait_pumping_then<R>(
        &self,
        timeout: Duration,
        mut pump: impl FnMut(),
        mut predicate: impl FnMut(&T) -> bool,
        then: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let deadline = Instant::now() + timeout;
        loop {
            pump();

            let guard = self.guard();
            let now = Instant::now();
            let slice = deadline.saturating_duration_since(now).min(PUMP_INTERVAL);

            let (mut guard, _) = match self
                .event
                .wait_timeout_while(guard, slice, |state| !predicate(&*state))
            {
                Ok(result) => result,
                Err(poisoned) => poisoned.into_inner(),
            };

            if predicate(&guard) {
                return Some(then(&mut guard));
            }

            if Instant::now() >= deadline {
                return None;
            }
        }
    }

    /// Pumping variant of [`Self::wait_until`].
    pub fn wait_pumping(
        &self,
        timeout: Duration,
        pump: impl FnMut(),
        predicate: impl FnMut(&T) -> bool,
    ) -> bool {
        self.wait_pumping_then(timeout, pump, predicate, |_| ())
            .is_some()
    }
}
