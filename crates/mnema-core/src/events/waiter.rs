//! # Waiter Primitives
//!
//! One-shot blocking waits over an event subscription, with an optional
//! predicate. A waiter is armed at construction; the first matching event
//! (for a condition waiter: the first match accepted by the predicate)
//! resolves it, whether or not a thread is already blocked in `wait`.
//!
//! Destroying the owning context cancels its waiters; a cancelled wait
//! reports a timeout.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::bus::EventSubscription;

// =============================================================================
// SHARED WAIT STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Pending,
    Resolved,
    Cancelled,
}

/// State cell shared between a waiter, its subscription delegate, and the
/// owning context (for cancellation).
pub(crate) struct WaitCell {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl WaitCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WaitState::Pending),
            cond: Condvar::new(),
        })
    }

    /// Mark the waiter as resolved. Later resolutions and cancellations are
    /// no-ops; the first transition wins.
    pub(crate) fn resolve(&self) {
        let mut state = self.state.lock();
        if *state == WaitState::Pending {
            *state = WaitState::Resolved;
            self.cond.notify_all();
        }
    }

    /// Cancel a pending waiter; its `wait` reports a timeout.
    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock();
        if *state == WaitState::Pending {
            *state = WaitState::Cancelled;
            self.cond.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match *state {
                WaitState::Resolved => return true,
                WaitState::Cancelled => return false,
                WaitState::Pending => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return *state == WaitState::Resolved;
                    }
                }
            }
        }
    }
}

// =============================================================================
// WAITERS
// =============================================================================

/// Resolves on the first event matching its subscription.
pub struct EventWaiter {
    cell: Arc<WaitCell>,
    _subscription: EventSubscription,
}

/// Resolves on the first matching event accepted by its predicate; other
/// matches are ignored.
pub struct ConditionWaiter {
    cell: Arc<WaitCell>,
    _subscription: EventSubscription,
}

macro_rules! waiter_impl {
    ($name:ident) => {
        impl $name {
            pub(crate) fn new(cell: Arc<WaitCell>, subscription: EventSubscription) -> Self {
                Self {
                    cell,
                    _subscription: subscription,
                }
            }

            /// Block the calling thread up to `timeout_ms`; true on
            /// resolution, false on timeout or cancellation.
            #[must_use]
            pub fn wait(&self, timeout_ms: u64) -> bool {
                self.cell.wait(Duration::from_millis(timeout_ms))
            }

            /// [`Self::wait`] with callbacks: exactly one of `on_success` /
            /// `on_timeout` runs, after the outcome is known.
            pub fn wait_with(
                &self,
                timeout_ms: u64,
                on_success: impl FnOnce(),
                on_timeout: impl FnOnce(),
            ) -> bool {
                let resolved = self.wait(timeout_ms);
                if resolved {
                    on_success();
                } else {
                    on_timeout();
                }
                resolved
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name)).finish_non_exhaustive()
            }
        }
    };
}

waiter_impl!(EventWaiter);
waiter_impl!(ConditionWaiter);

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_before_wait_returns_true() {
        let cell = WaitCell::new();
        cell.resolve();
        assert!(cell.wait(Duration::from_millis(1)));
    }

    #[test]
    fn timeout_returns_false() {
        let cell = WaitCell::new();
        let started = Instant::now();
        assert!(!cell.wait(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cancel_unblocks_with_false() {
        let cell = WaitCell::new();
        let waiter_cell = Arc::clone(&cell);
        let handle = std::thread::spawn(move || waiter_cell.wait(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(10));
        cell.cancel();
        assert!(!handle.join().expect("join"));
    }

    #[test]
    fn resolution_from_another_thread_unblocks() {
        let cell = WaitCell::new();
        let resolver = Arc::clone(&cell);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            resolver.resolve();
        });
        assert!(cell.wait(Duration::from_secs(5)));
        handle.join().expect("join");
    }

    #[test]
    fn first_transition_wins() {
        let cell = WaitCell::new();
        cell.resolve();
        cell.cancel();
        assert!(cell.wait(Duration::from_millis(1)));
    }
}
