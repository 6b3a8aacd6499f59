//! Monotonic clock access.
//!
//! The scheduler's timer-wheel fiber (see [`crate::fiber::timeout`]) and the
//! `Timeout` future are the only consumers of this module; everything else
//! in the crate is clock-agnostic. Kept separate (rather than inlined into
//! `fiber::timeout`) because a host embedding this crate's scheduler next to
//! its own event loop will frequently want to substitute its own clock
//! source — see [`set_clock_source`].

use std::cell::Cell;
use std::time::Instant;

thread_local! {
    static CLOCK_SOURCE: Cell<Option<fn() -> Instant>> = Cell::new(None);
}

/// Returns the current monotonic time, in whichever timebase the scheduler
/// driving the calling fiber uses. Defaults to [`Instant::now`].
pub fn monotonic() -> Instant {
    CLOCK_SOURCE.with(|c| c.get()).map_or_else(Instant::now, |f| f())
}

/// Overrides the monotonic clock source for the calling thread. Intended for
/// tests that need to fast-forward virtual time; real deployments should
/// leave this unset.
pub fn set_clock_source(source: Option<fn() -> Instant>) {
    CLOCK_SOURCE.with(|c| c.set(source));
}

/// Microseconds since an unspecified monotonic epoch. Matches the spec's
/// `new_deadline(monotonic_usec)` argument unit.
pub fn monotonic_usec() -> u64 {
    // Anchored to process start so the numbers stay small and don't depend
    // on the host's boot time.
    static START: once_cell::sync::Lazy<Instant> = once_cell::sync::Lazy::new(Instant::now);
    monotonic().saturating_duration_since(*START).as_micros() as u64
}
