//! The future graph: an eventual value or error, with listener-based
//! completion and a small set of combinators for composing futures.
//!
//! This is **not** [`std::future::Future`] — there is no `poll`, no
//! `Context`, no waker. A [`Future`] here is a handle to a value that
//! starts `PENDING` and transitions exactly once to `RESOLVED` or
//! `REJECTED`; interested parties register a listener closure that runs
//! synchronously the moment the transition happens (or immediately, if the
//! future is already terminal by the time they register).
//!
//! [`fiber::await_future`](crate::fiber::await_future) is the bridge between
//! this world and cooperative scheduling: it registers a listener that wakes
//! the awaiting fiber, then parks.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;

/// The three states a [`Future`] can be in. `Pending` is the only
/// non-terminal state; once a future becomes `Resolved` or `Rejected` it
/// never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Resolved,
    Rejected,
}

type Outcome<T> = Result<T, Error>;
type Listener<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

enum State<T> {
    Pending(Vec<Listener<T>>),
    Terminal(Outcome<T>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

/// A read-side handle to an eventual value or error.
///
/// Cloning a `Future` is cheap (it's a reference-counted handle to shared
/// state, the way `Rc`/`Arc` work) and all clones observe the same
/// completion.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Future<T>
where
    T: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future").field("status", &self.status()).finish()
    }
}

impl<T> Future<T>
where
    T: Clone + Send + 'static,
{
    /// A pending future with no terminal value yet.
    pub fn new_pending() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending(Vec::new())),
            }),
        }
    }

    /// An already-resolved future.
    pub fn new_resolved(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Terminal(Ok(value))),
            }),
        }
    }

    /// An already-rejected future.
    pub fn new_rejected(error: Error) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Terminal(Err(error))),
            }),
        }
    }

    /// Attempts the single legal `PENDING -> terminal` transition.
    ///
    /// Returns `true` if this call performed the transition, `false` if the
    /// future was already terminal (in which case `outcome` is discarded —
    /// completion never fails observably, per spec; double-completing a
    /// [`Promise`] is a programmer error that is diagnosed via a `log::warn!`
    /// but never corrupts state).
    ///
    /// Listeners are detached from the future *before* being invoked, so a
    /// listener that registers another listener on the same (now-terminal)
    /// future doesn't reenter this function's lock.
    pub fn complete(&self, outcome: Outcome<T>) -> bool {
        let listeners = {
            let mut guard = self.shared.state.lock().unwrap();
            match &mut *guard {
                State::Terminal(_) => return false,
                State::Pending(_) => {
                    let old = mem::replace(&mut *guard, State::Terminal(outcome.clone()));
                    match old {
                        State::Pending(listeners) => listeners,
                        State::Terminal(_) => unreachable!(),
                    }
                }
            }
        };
        for listener in listeners {
            listener(outcome.clone());
        }
        true
    }

    /// Registers `cb` to run exactly once, when this future becomes
    /// terminal. If the future is already terminal, `cb` runs synchronously
    /// before this call returns.
    pub fn add_listener<F>(&self, cb: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let outcome = {
            let mut guard = self.shared.state.lock().unwrap();
            match &mut *guard {
                State::Pending(listeners) => {
                    listeners.push(Box::new(cb));
                    return;
                }
                State::Terminal(outcome) => outcome.clone(),
            }
        };
        cb(outcome);
    }

    pub fn status(&self) -> Status {
        match &*self.shared.state.lock().unwrap() {
            State::Pending(_) => Status::Pending,
            State::Terminal(Ok(_)) => Status::Resolved,
            State::Terminal(Err(_)) => Status::Rejected,
        }
    }

    pub fn value(&self) -> Option<T> {
        match &*self.shared.state.lock().unwrap() {
            State::Terminal(Ok(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<Error> {
        match &*self.shared.state.lock().unwrap() {
            State::Terminal(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// When `src` becomes terminal, `dst` is completed with the same
    /// outcome. If `src` is already terminal, propagation happens
    /// synchronously. Cycles across `chain` edges are forbidden by
    /// construction; this crate never builds one internally.
    pub fn chain(src: &Future<T>, dst: &Future<T>) {
        let dst = dst.clone();
        src.add_listener(move |outcome| {
            dst.complete(outcome);
        });
    }

    /// Classic monadic bind: when `self` resolves, `f` runs with the value
    /// and its returned future determines the new future's outcome. If
    /// `self` rejects, the rejection propagates without running `f`.
    pub fn then<U, F>(&self, f: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        let out = Future::new_pending();
        let out2 = out.clone();
        self.add_listener(move |outcome| match outcome {
            Ok(v) => Future::chain(&f(v), &out2),
            Err(e) => {
                out2.complete(Err(e));
            }
        });
        out
    }

    /// Like [`then`](Self::then), but `f` returns a plain value instead of
    /// another future.
    pub fn map<U, F>(&self, f: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then(move |v| Future::new_resolved(f(v)))
    }

    /// Symmetric to [`then`](Self::then) for the rejection path: when `self`
    /// rejects, `f` runs with the error and its returned future determines
    /// the new future's outcome. If `self` resolves, the value propagates
    /// without running `f`.
    pub fn catch<F>(&self, f: F) -> Future<T>
    where
        F: FnOnce(Error) -> Future<T> + Send + 'static,
    {
        let out = Future::new_pending();
        let out2 = out.clone();
        self.add_listener(move |outcome| match outcome {
            Ok(v) => {
                out2.complete(Ok(v));
            }
            Err(e) => Future::chain(&f(e), &out2),
        });
        out
    }

    /// Like [`catch`](Self::catch), but `f` returns a plain (possibly
    /// different) error instead of a recovery future.
    pub fn map_err<F>(&self, f: F) -> Future<T>
    where
        F: FnOnce(Error) -> Error + Send + 'static,
    {
        self.catch(move |e| Future::new_rejected(f(e)))
    }

    /// Resolves once every future in `futures` has resolved, with the
    /// values in the same order as the input. If one or more reject, the
    /// combinator waits for every future to terminate (so side effects of
    /// the others still happen) and then rejects with the earliest (by
    /// input index) rejection, wrapped in [`Error::DependencyFailed`].
    pub fn all(futures: Vec<Future<T>>) -> Future<Vec<T>> {
        let n = futures.len();
        if n == 0 {
            return Future::new_resolved(Vec::new());
        }
        let state: Arc<Mutex<(Vec<Option<T>>, Option<(usize, Error)>)>> =
            Arc::new(Mutex::new((vec![None; n], None)));
        let remaining = Arc::new(AtomicUsize::new(n));
        let out = Future::new_pending();
        for (i, fut) in futures.into_iter().enumerate() {
            let state = state.clone();
            let remaining = remaining.clone();
            let out = out.clone();
            fut.add_listener(move |outcome| {
                {
                    let mut g = state.lock().unwrap();
                    match outcome {
                        Ok(v) => g.0[i] = Some(v),
                        Err(e) => {
                            if g.1.as_ref().map_or(true, |(j, _)| i < *j) {
                                g.1 = Some((i, e));
                            }
                        }
                    }
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let mut g = state.lock().unwrap();
                    if let Some((_, e)) = g.1.take() {
                        out.complete(Err(e.into_dependency_failed()));
                    } else {
                        let vals = g.0.iter_mut().map(|v| v.take().unwrap()).collect();
                        out.complete(Ok(vals));
                    }
                }
            });
        }
        out
    }

    /// Like [`all`](Self::all), but short-circuits: rejects as soon as the
    /// first dependency rejects, without waiting for the rest to terminate.
    /// Resolves with ordered values only if every future resolves.
    pub fn all_race(futures: Vec<Future<T>>) -> Future<Vec<T>> {
        let n = futures.len();
        if n == 0 {
            return Future::new_resolved(Vec::new());
        }
        let values: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; n]));
        let remaining = Arc::new(AtomicUsize::new(n));
        let out = Future::new_pending();
        for (i, fut) in futures.into_iter().enumerate() {
            let values = values.clone();
            let remaining = remaining.clone();
            let out = out.clone();
            fut.add_listener(move |outcome| match outcome {
                Ok(v) => {
                    let done = {
                        let mut g = values.lock().unwrap();
                        g[i] = Some(v);
                        remaining.fetch_sub(1, Ordering::AcqRel) == 1
                    };
                    if done {
                        let mut g = values.lock().unwrap();
                        let vals = g.iter_mut().map(|v| v.take().unwrap()).collect();
                        out.complete(Ok(vals));
                    }
                }
                Err(e) => {
                    out.complete(Err(e.into_dependency_failed()));
                }
            });
        }
        out
    }

    /// Resolves with the first future to resolve; rejections are swallowed
    /// unless *every* dependency rejects, in which case `any` rejects with
    /// the last-observed rejection wrapped in [`Error::DependencyFailed`].
    pub fn any(futures: Vec<Future<T>>) -> Future<T> {
        if futures.is_empty() {
            return Future::new_rejected(Error::DependencyFailed(Box::new(Error::Cancelled(
                Arc::from("any() called with no candidate futures"),
            ))));
        }
        let remaining = Arc::new(AtomicUsize::new(futures.len()));
        let last_err: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let out = Future::new_pending();
        for fut in futures {
            let remaining = remaining.clone();
            let last_err = last_err.clone();
            let out = out.clone();
            fut.add_listener(move |outcome| match outcome {
                Ok(v) => {
                    out.complete(Ok(v));
                }
                Err(e) => {
                    *last_err.lock().unwrap() = Some(e);
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let e = last_err.lock().unwrap().take().unwrap();
                        out.complete(Err(e.into_dependency_failed()));
                    }
                }
            });
        }
        out
    }

    /// Resolves or rejects with whichever future in `futures` terminates
    /// first, regardless of whether it resolved or rejected.
    pub fn first(futures: Vec<Future<T>>) -> Future<T> {
        let out = Future::new_pending();
        for fut in futures {
            let out = out.clone();
            fut.add_listener(move |outcome| {
                out.complete(outcome);
            });
        }
        out
    }
}

/// An externally completable [`Future`]. Distinguished from a plain
/// `Future` only by exposing `resolve`/`reject` instead of `complete`; all
/// other invariants (exactly-once completion, listener ordering) are
/// identical.
pub struct Promise<T> {
    future: Future<T>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            future: self.future.clone(),
        }
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            future: Future::new_pending(),
        }
    }

    /// The read-side handle backed by this promise.
    pub fn future(&self) -> Future<T> {
        self.future.clone()
    }

    pub fn resolve(&self, value: T) {
        if !self.future.complete(Ok(value)) {
            log::warn!(target: "cofiber", "promise resolved after it was already terminal");
        }
    }

    pub fn reject(&self, error: Error) {
        if !self.future.complete(Err(error)) {
            log::warn!(target: "cofiber", "promise rejected after it was already terminal");
        }
    }
}

impl<T> Default for Promise<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn new_resolved_has_value() {
        let f = Future::new_resolved(42);
        assert_eq!(f.status(), Status::Resolved);
        assert_eq!(f.value(), Some(42));
    }

    #[test]
    fn promise_double_resolve_keeps_first_value() {
        let p = Promise::new();
        p.resolve(1);
        p.resolve(2);
        assert_eq!(p.future().value(), Some(1));
    }

    #[test]
    fn chain_propagates_value() {
        let a = Future::new_pending();
        let b = Future::new_pending();
        Future::chain(&a, &b);
        a.complete(Ok(7));
        assert_eq!(b.status(), Status::Resolved);
        assert_eq!(b.value(), Some(7));
    }

    #[test]
    fn listener_on_terminal_future_runs_immediately() {
        let f = Future::new_resolved(9);
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        f.add_listener(move |outcome| {
            *seen2.lock().unwrap() = Some(outcome);
        });
        assert_eq!(*seen.lock().unwrap(), Some(Ok(9)));
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let f: Future<i32> = Future::new_pending();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            f.add_listener(move |_| order.lock().unwrap().push(i));
        }
        f.complete(Ok(0));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn then_chains_to_another_future() {
        let f = Future::new_resolved(2);
        let g = f.then(|v| Future::new_resolved(v * 10));
        assert_eq!(g.value(), Some(20));
    }

    #[test]
    fn then_propagates_rejection_without_running_callback() {
        let f: Future<i32> = Future::new_rejected(Error::TimedOut);
        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();
        let g = f.then(move |v| {
            *ran2.lock().unwrap() = true;
            Future::new_resolved(v)
        });
        assert_eq!(g.status(), Status::Rejected);
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn catch_recovers_from_rejection() {
        let f: Future<i32> = Future::new_rejected(Error::TimedOut);
        let g = f.catch(|_| Future::new_resolved(-1));
        assert_eq!(g.value(), Some(-1));
    }

    #[test]
    fn all_resolves_in_order() {
        let futures = vec![
            Future::new_resolved(1),
            Future::new_resolved(2),
            Future::new_resolved(3),
        ];
        let out = Future::all(futures);
        assert_eq!(out.value(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn all_rejects_with_earliest_index_error() {
        let futures = vec![
            Future::new_rejected(Error::ChannelClosed),
            Future::new_resolved(2),
            Future::new_rejected(Error::TimedOut),
        ];
        let out = Future::all(futures);
        assert_eq!(out.status(), Status::Rejected);
        match out.error().unwrap() {
            Error::DependencyFailed(e) => assert_eq!(*e, Error::ChannelClosed),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn all_race_short_circuits() {
        let a: Future<i32> = Future::new_pending();
        let b: Future<i32> = Future::new_rejected(Error::TimedOut);
        let out = Future::all_race(vec![a.clone(), b]);
        assert_eq!(out.status(), Status::Rejected);
        // a is never resolved; out must still have rejected already.
        let _ = a;
    }

    #[test]
    fn any_resolves_with_first_success() {
        let futures = vec![
            Future::new_rejected(Error::TimedOut),
            Future::new_resolved(5),
        ];
        let out = Future::any(futures);
        assert_eq!(out.value(), Some(5));
    }

    #[test]
    fn any_rejects_only_if_all_reject() {
        let futures: Vec<Future<i32>> =
            vec![Future::new_rejected(Error::TimedOut), Future::new_rejected(Error::ChannelClosed)];
        let out = Future::any(futures);
        assert_eq!(out.status(), Status::Rejected);
    }

    #[test]
    fn first_returns_whichever_terminates_first() {
        let futures = vec![Future::new_rejected(Error::TimedOut), Future::new_resolved(1)];
        let out = Future::first(futures);
        // Both are already terminal; first listener registered (index 0) wins
        // the race to complete `out`.
        assert_eq!(out.status(), Status::Rejected);
    }
}
