//! Deadline-based timeouts, built entirely out of ordinary fibers and
//! futures — there's no OS timer or signal involved.
//!
//! Each [`crate::fiber::Scheduler`] gets at most one background fiber (the
//! "timer wheel") that tracks every outstanding deadline on that scheduler
//! in a min-heap and completes futures as their time comes. The wheel fiber
//! is spawned lazily on first use and exits once nothing is left to track,
//! rather than sitting idle forever and keeping [`crate::fiber::Scheduler::dispatch`]
//! from ever reporting the scheduler quiescent.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::clock;
use crate::error::Error;
use crate::fiber::{self, Builder, Scheduler};
use crate::future::Future;

struct Pending {
    deadline_usec: u64,
    future: Future<()>,
    epoch: Arc<AtomicU64>,
    epoch_at_register: u64,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_usec == other.deadline_usec
    }
}
impl Eq for Pending {}
impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline_usec.cmp(&other.deadline_usec)
    }
}

struct WheelState {
    pending: BinaryHeap<Reverse<Pending>>,
    driving: bool,
}

struct Wheel {
    state: Mutex<WheelState>,
}

impl Wheel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WheelState {
                pending: BinaryHeap::new(),
                driving: false,
            }),
        })
    }

    fn register(wheel: &Arc<Self>, scheduler: &Scheduler, pending: Pending) {
        let mut state = wheel.state.lock().unwrap();
        state.pending.push(Reverse(pending));
        if !state.driving {
            state.driving = true;
            drop(state);
            let wheel = wheel.clone();
            let _ = Builder::new()
                .name("timeout-wheel")
                .spawn_on(scheduler, move || wheel.run());
        }
    }

    fn run(self: Arc<Self>) {
        loop {
            let top = {
                let state = self.state.lock().unwrap();
                state.pending.peek().map(|Reverse(p)| {
                    (p.deadline_usec, p.future.clone(), p.epoch.clone(), p.epoch_at_register)
                })
            };
            let Some((deadline, future, epoch, epoch_at_register)) = top else {
                let mut state = self.state.lock().unwrap();
                if state.pending.is_empty() {
                    state.driving = false;
                    return;
                }
                continue;
            };
            // A `postpone_until` call bumps the epoch, making this entry
            // stale (a fresher one for the same timer is already queued);
            // an externally completed future needs no timeout at all.
            // Either way, drop it without waiting out its deadline.
            let stale = epoch.load(Ordering::SeqCst) != epoch_at_register;
            let already_done = future.status() != crate::future::Status::Pending;
            if stale || already_done {
                self.state.lock().unwrap().pending.pop();
                continue;
            }
            if clock::monotonic_usec() >= deadline {
                if let Some(Reverse(p)) = self.state.lock().unwrap().pending.pop() {
                    p.future.complete(Err(Error::TimedOut));
                }
            } else {
                // No OS timer backs this loop, so re-check on a short,
                // throttled cadence rather than busy-spinning at full CPU.
                std::thread::sleep(std::time::Duration::from_millis(1));
                fiber::yield_now();
            }
        }
    }
}

// Keyed by `Scheduler::identity`, not by OS thread: a fiber can be spawned
// on any `Scheduler` its owner built, so the wheel has to live alongside
// whichever scheduler actually dispatches the fiber registering a timeout,
// not the calling thread's default one.
static WHEELS: Lazy<Mutex<HashMap<usize, Arc<Wheel>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn wheel_for_scheduler(scheduler: &Scheduler) -> Arc<Wheel> {
    let mut wheels = WHEELS.lock().unwrap();
    wheels.entry(scheduler.identity()).or_insert_with(Wheel::new).clone()
}

/// A handle to a single outstanding deadline.
pub struct Timer {
    future: Future<()>,
    epoch: Arc<AtomicU64>,
    wheel: Arc<Wheel>,
    scheduler: Scheduler,
}

impl Timer {
    /// The future that resolves with `Ok(())` if [`Future::complete`] is
    /// called on it from elsewhere before the deadline, or rejects with
    /// [`Error::TimedOut`] once the deadline passes.
    pub fn future(&self) -> Future<()> {
        self.future.clone()
    }

    /// Moves this timer's deadline to `monotonic_usec`, invalidating the
    /// original one. If the original deadline has already fired, this is a
    /// harmless no-op — [`Future::complete`] is idempotent.
    pub fn postpone_until(&self, monotonic_usec: u64) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        Wheel::register(
            &self.wheel,
            &self.scheduler,
            Pending {
                deadline_usec: monotonic_usec,
                future: self.future.clone(),
                epoch: self.epoch.clone(),
                epoch_at_register: epoch,
            },
        );
    }
}

/// Entry points for creating [`Timer`]s, grouped the way the spec's
/// `new_deadline`/`new_msec`/`new_seconds`/`new_usec` constructors are.
pub struct Timeout;

impl Timeout {
    /// A timer that fires at an absolute point on [`clock::monotonic_usec`]'s
    /// timebase.
    ///
    /// # Panics
    /// Panics if called outside a fiber — the timer wheel is spawned on
    /// whichever scheduler is actually running the calling fiber, so there
    /// has to be one.
    pub fn new_deadline(monotonic_usec: u64) -> Timer {
        let scheduler =
            fiber::current_scheduler().expect("Timeout::new_deadline called outside a fiber");
        let wheel = wheel_for_scheduler(&scheduler);
        let epoch = Arc::new(AtomicU64::new(0));
        let future = Future::new_pending();
        Wheel::register(
            &wheel,
            &scheduler,
            Pending {
                deadline_usec: monotonic_usec,
                future: future.clone(),
                epoch: epoch.clone(),
                epoch_at_register: 0,
            },
        );
        Timer {
            future,
            epoch,
            wheel,
            scheduler,
        }
    }

    pub fn new_usec(usec: u64) -> Timer {
        Self::new_deadline(clock::monotonic_usec().saturating_add(usec))
    }

    pub fn new_msec(msec: u64) -> Timer {
        Self::new_usec(msec.saturating_mul(1_000))
    }

    pub fn new_seconds(seconds: f64) -> Timer {
        Self::new_usec((seconds.max(0.0) * 1_000_000.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{Builder, Scheduler};
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    fn with_frozen_clock<R>(f: impl FnOnce() -> R) -> R {
        fn frozen() -> Instant {
            thread_local! {
                static START: Instant = Instant::now();
            }
            START.with(|s| *s)
        }
        clock::set_clock_source(Some(frozen));
        let result = f();
        clock::set_clock_source(None);
        result
    }

    #[test]
    fn timer_rejects_with_timed_out_once_due() {
        with_frozen_clock(|| {
            let scheduler = Scheduler::new();
            let result = Arc::new(Mutex::new(None));
            let result2 = result.clone();
            Builder::new()
                .spawn_on(&scheduler, move || {
                    // Deadline in the past relative to the frozen clock, so
                    // the wheel fires it on its very first check.
                    let timer = Timeout::new_deadline(0);
                    *result2.lock().unwrap() = Some(fiber::await_future(&timer.future()));
                })
                .unwrap();
            scheduler.dispatch();
            assert!(matches!(
                result.lock().unwrap().take(),
                Some(Err(Error::TimedOut))
            ));
        });
    }

    #[test]
    fn externally_resolved_future_wins_over_timeout() {
        let scheduler = Scheduler::new();
        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        Builder::new()
            .spawn_on(&scheduler, move || {
                let timer = Timeout::new_seconds(60.0);
                let future = timer.future();
                future.complete(Ok(()));
                *result2.lock().unwrap() = Some(fiber::await_future(&future));
            })
            .unwrap();
        scheduler.dispatch();
        assert_eq!(result.lock().unwrap().take(), Some(Ok(())));
    }

    #[test]
    fn postponed_timer_does_not_fire_at_original_deadline() {
        with_frozen_clock(|| {
            let scheduler = Scheduler::new();
            let status = Arc::new(Mutex::new(None));
            let status2 = status.clone();
            Builder::new()
                .spawn_on(&scheduler, move || {
                    let timer = Timeout::new_deadline(0);
                    // Postpone far into the future before the wheel fiber
                    // gets a chance to run at all.
                    timer.postpone_until(u64::MAX);
                    fiber::yield_now();
                    fiber::yield_now();
                    let future = timer.future();
                    let was_still_pending = future.status() == crate::future::Status::Pending;
                    // Resolve manually instead of waiting out a u64::MAX
                    // deadline, so the wheel fiber (and `dispatch`) can
                    // observe the channel drained and exit.
                    future.complete(Ok(()));
                    *status2.lock().unwrap() = Some(was_still_pending);
                })
                .unwrap();
            scheduler.dispatch();
            assert_eq!(*status.lock().unwrap(), Some(true));
        });
    }
}
