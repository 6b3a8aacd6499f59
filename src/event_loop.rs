//! Event-loop-source integration.
//!
//! The spec describes [`crate::fiber::Scheduler`] as something a host event
//! loop drives via three hooks rather than something that owns a loop of its
//! own: `prepare` (how long the host may block before this source needs
//! attention again), `check` (is it actually ready right now), `dispatch`
//! (run the pending work). [`EventSource`] is that three-hook interface,
//! implemented here for `Scheduler` itself; a host application embeds a
//! `Scheduler` into whatever loop it already runs (libev, tokio's reactor,
//! a raw epoll loop) by calling these three methods from the matching
//! phases of that loop.

use std::time::Duration;

use crate::fiber::Scheduler;

/// A source of work for a host event loop.
pub trait EventSource {
    /// How long the host loop may block waiting for external events before
    /// checking this source again. `None` means this source has nothing
    /// pending and is content to wait indefinitely for an external wakeup
    /// (e.g. an [`crate::fiber::unpark`] from another thread).
    fn prepare(&self) -> Option<Duration>;

    /// Called once the host loop wakes (from a timeout or an external
    /// event). Returns whether this source actually has work to run.
    fn check(&self) -> bool;

    /// Runs one full pass of whatever work is pending.
    fn dispatch(&self);
}

impl EventSource for Scheduler {
    fn prepare(&self) -> Option<Duration> {
        if self.is_ready_to_dispatch() {
            Some(Duration::ZERO)
        } else {
            None
        }
    }

    fn check(&self) -> bool {
        self.is_ready_to_dispatch()
    }

    fn dispatch(&self) {
        self.drain_ready();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Builder;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn prepare_reports_infinite_wait_with_nothing_ready() {
        let scheduler = Scheduler::new();
        assert_eq!(EventSource::prepare(&scheduler), None);
        assert!(!EventSource::check(&scheduler));
    }

    #[test]
    fn dispatch_returns_without_blocking_on_a_parked_fiber() {
        let scheduler = Scheduler::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        Builder::new()
            .spawn_on(&scheduler, move || {
                ran2.store(true, Ordering::SeqCst);
                // Parks waiting for an `unpark` that never comes in this
                // test — a host loop's `dispatch` must still return rather
                // than blocking the way `Scheduler::dispatch` would.
                crate::fiber::park();
            })
            .unwrap();
        assert!(EventSource::check(&scheduler));
        EventSource::dispatch(&scheduler);
        assert!(ran.load(Ordering::SeqCst));
        assert!(!EventSource::check(&scheduler));
        assert_eq!(EventSource::prepare(&scheduler), None);
    }
}
