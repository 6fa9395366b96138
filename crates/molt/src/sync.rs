//! Countdown gates for lifecycle coordination.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A one-shot countdown barrier: `n` arrivals release every waiter.
///
/// Used twice by the lifecycle: once to learn that every server task has
/// finished acquiring its listener, and once (the served gate) to learn
/// that every server has either started accepting or never will.
pub(crate) struct Countdown {
    count: AtomicUsize,
    notify: Notify,
}

impl Countdown {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    /// Records one arrival. Must be called at most `count` times.
    pub(crate) fn arrive(&self) {
        let prev = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "countdown released more times than its count");
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Waits until every arrival has been recorded.
    pub(crate) async fn wait(&self) {
        let mut notified = std::pin::pin!(self.notify.notified());
        loop {
            // Register interest before checking the count, otherwise an
            // arrival between the check and the await is lost.
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }
}

/// An at-most-once arrival handle on a [`Countdown`].
///
/// Fired explicitly by the first accept on a listener, or implicitly on
/// drop for the paths where the server never reaches accepting (failed
/// bind, aborted startup, serve error before the first connection).
pub(crate) struct ServedToken {
    fired: AtomicBool,
    gate: Arc<Countdown>,
}

impl ServedToken {
    pub(crate) fn new(gate: Arc<Countdown>) -> Self {
        Self {
            fired: AtomicBool::new(false),
            gate,
        }
    }

    pub(crate) fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.gate.arrive();
        }
    }
}

impl Drop for ServedToken {
    fn drop(&mut self) {
        self.fire();
    }
}
