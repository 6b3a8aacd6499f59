//! Cooperative fibers and the scheduler that runs them.
//!
//! A fiber is a unit of work with its own mmap'd stack ([`stack::Stack`])
//! that cooperates with its siblings purely by choosing when to yield —
//! there is no preemption, and a fiber that never yields starves every
//! other fiber on the same [`Scheduler`]. Switching between fibers is
//! a handful of register moves ([`context::swap`]); everything above that
//! (queues, wake-ups, the dispatch loop) is plain safe Rust guarded by
//! [`mutex::ReentrantLock`].
//!
//! Fibers belong to exactly one OS thread for their whole lifetime — the
//! scheduler that spawned them is the one that runs them. A [`Future`]
//! completing on a different thread, or another thread calling
//! [`unpark`], still needs to be able to mark a fiber runnable again; that
//! path only ever touches the ready queue and a wake flag, never the raw
//! stack/context state, which is why it's safe without the fiber itself
//! being `Send`.

pub mod channel;
pub mod context;
pub mod mutex;
pub mod stack;
pub mod timeout;

use std::any::Any;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::error::Error;
use crate::future::{Future, Promise};
use context::Context;
use mutex::ReentrantLock;
use stack::Stack;

pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Identifies a fiber within the scheduler that owns it. Not unique across
/// schedulers; only meaningful paired with a [`Scheduler`] handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ready,
    Running,
    Waiting,
    Dead,
}

struct Slot {
    name: Option<Arc<str>>,
    ctx: Context,
    // Kept alive for as long as the fiber might still run; dropped (and the
    // guard page unmapped) once the slot is reaped after the fiber reports
    // `Dead`.
    _stack: Stack,
    status: Status,
    /// Set by `unpark` when it races a fiber that hasn't reached `park` yet;
    /// consumed by `park`, which then returns immediately without a context
    /// switch. Without this, a wake-up that arrives between a listener's
    /// registration and the fiber's `park()` call would be lost forever.
    wake_pending: bool,
}

struct State {
    // Boxed so that growing the `Vec` (e.g. a concurrent spawn on another
    // thread) only ever moves an 8-byte pointer, never the `Slot` itself —
    // `run_once`/`park_current`/`yield_current` hold a raw pointer into a
    // `Slot`'s `Context` across a lock release, and that pointer must stay
    // valid no matter what else happens to this `Vec` in the meantime.
    slots: Vec<Option<Box<Slot>>>,
    ready: VecDeque<FiberId>,
    current: Option<FiberId>,
}

impl State {
    fn alloc(&mut self, slot: Slot) -> FiberId {
        let slot = Some(Box::new(slot));
        for (i, s) in self.slots.iter_mut().enumerate() {
            if s.is_none() {
                *s = slot;
                return FiberId(i as u64);
            }
        }
        self.slots.push(slot);
        FiberId((self.slots.len() - 1) as u64)
    }

    fn slot(&self, id: FiberId) -> &Slot {
        self.slots[id.0 as usize].as_deref().expect("dead fiber id reused")
    }

    fn slot_mut(&mut self, id: FiberId) -> &mut Slot {
        self.slots[id.0 as usize].as_deref_mut().expect("dead fiber id reused")
    }
}

/// The scheduling context an OS thread runs its fibers on. Cheap to clone
/// (an `Arc` handle); every clone refers to the same queues.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

struct Shared {
    state: ReentrantLock<State>,
    /// Held for the whole duration of [`Scheduler::dispatch`]. `outside` is
    /// only sound as a single shared `Context` if exactly one OS thread is
    /// ever inside `dispatch` for a given scheduler at a time; this turns a
    /// second, concurrent `dispatch` call (a misuse of the API, not
    /// something that can legitimately happen) into a panic instead of
    /// silent register-state corruption.
    dispatching: StdMutex<()>,
    /// The dispatch loop's own execution context, i.e. "control flow when
    /// no fiber is running". Only ever read or written by the OS thread
    /// that owns this scheduler, from inside [`Scheduler::dispatch`] and
    /// the fibers it switches into — never touched by another thread, even
    /// though `Shared` as a whole is `Arc`-shared for wake-ups.
    outside: UnsafeCell<Context>,
    parked: StdMutex<bool>,
    wake_cvar: Condvar,
}

// `outside` is confined to the scheduler's owning OS thread by convention
// (see the field doc); every other field is a real synchronization
// primitive.
unsafe impl Sync for Shared {}

thread_local! {
    static THREAD_SCHEDULER: Scheduler = Scheduler::new();
    static CURRENT_FIBER: std::cell::Cell<Option<FiberId>> = std::cell::Cell::new(None);
    // A fiber can run on any `Scheduler` its owner built with `Scheduler::new`,
    // not just `THREAD_SCHEDULER` — `current`/`park`/`yield_now` need to know
    // which one is actually driving the fiber that's calling them.
    static CURRENT_SCHEDULER: std::cell::RefCell<Option<Scheduler>> = std::cell::RefCell::new(None);
}

static PROCESS_DEFAULT: Lazy<Scheduler> = Lazy::new(Scheduler::new);

impl Scheduler {
    /// Creates a fresh, empty scheduler — the spec's `fiber_scheduler_new()`.
    /// Most callers want [`Scheduler::thread_default`] or
    /// [`Scheduler::default`] instead so fibers stay confined to a single,
    /// already-known OS thread; `new` is for hosts managing their own pool
    /// of scheduler instances (and for tests that want isolation from
    /// whatever else runs on the same OS thread).
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: ReentrantLock::new(State {
                    slots: Vec::new(),
                    ready: VecDeque::new(),
                    current: None,
                }),
                dispatching: StdMutex::new(()),
                outside: UnsafeCell::new(Context::empty()),
                parked: StdMutex::new(false),
                wake_cvar: Condvar::new(),
            }),
        }
    }

    /// The scheduler bound to the calling OS thread, created lazily on
    /// first access.
    pub fn thread_default() -> Scheduler {
        THREAD_SCHEDULER.with(|s| s.clone())
    }

    /// A process-wide scheduler shared by every thread that doesn't ask for
    /// its own. Most hosts embedding this crate alongside their own event
    /// loop want [`thread_default`](Self::thread_default) instead, so
    /// fibers never have to be woken across threads at all.
    pub fn default() -> Scheduler {
        PROCESS_DEFAULT.clone()
    }

    /// Schedules `f` to run as a fresh fiber with default settings and
    /// immediately returns. Equivalent to
    /// `Builder::new().spawn(f)` with the join handle discarded; useful for
    /// fire-and-forget work.
    pub fn push<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = Builder::new().spawn_on(self, move || {
            f();
        });
    }

    /// Runs ready fibers until none are left runnable and none are waiting
    /// on something that could make them ready again. Returns as soon as
    /// the scheduler is idle; callers that only ever spawn fire-and-forget
    /// work typically call this in a loop around their own event source
    /// polling.
    pub fn dispatch(&self) {
        let _driving = self
            .shared
            .dispatching
            .try_lock()
            .expect("two OS threads called Scheduler::dispatch on the same scheduler at once");
        loop {
            let next = {
                let mut state = self.shared.state.lock();
                state.ready.pop_front()
            };
            let Some(id) = next else {
                if !self.has_outstanding_work() {
                    return;
                }
                self.park_thread();
                continue;
            };
            self.run_once(id);
        }
    }

    /// Blocks until every fiber has finished, including ones spawned after
    /// this call by fibers it runs.
    pub fn run_to_completion(&self) {
        self.dispatch();
    }

    /// Runs every fiber currently in the ready queue exactly once, then
    /// returns without blocking — even if fibers remain `Waiting`.
    ///
    /// This is the hook a host event loop calls from its own `dispatch`
    /// phase, one full drain per pass, rather than `dispatch`'s loop-until-
    /// quiescent behavior (which is meant for a thread dedicated to running
    /// this scheduler standalone).
    pub fn drain_ready(&self) {
        let _driving = self
            .shared
            .dispatching
            .try_lock()
            .expect("two OS threads called Scheduler::dispatch on the same scheduler at once");
        loop {
            let next = {
                let mut state = self.shared.state.lock();
                state.ready.pop_front()
            };
            let Some(id) = next else {
                return;
            };
            self.run_once(id);
        }
    }

    /// `true` if a fiber is ready to run right now, i.e. a host loop should
    /// call [`Scheduler::drain_ready`] without blocking for external events
    /// first.
    pub fn is_ready_to_dispatch(&self) -> bool {
        !self.shared.state.lock().ready.is_empty()
    }

    fn has_outstanding_work(&self) -> bool {
        let state = self.shared.state.lock();
        state
            .slots
            .iter()
            .any(|s| matches!(s, Some(slot) if slot.status != Status::Dead))
    }

    fn park_thread(&self) {
        let mut parked = self.shared.parked.lock().unwrap();
        *parked = true;
        // A spurious-wake-tolerant short wait: this scheduler has no
        // outstanding timers of its own (that's `fiber::timeout`'s job,
        // running as an ordinary fiber), so there's nothing to compute a
        // precise deadline from here.
        let (guard, _timeout) = self
            .shared
            .wake_cvar
            .wait_timeout(parked, Duration::from_millis(50))
            .unwrap();
        parked = guard;
        *parked = false;
    }

    /// The name given to [`Builder::name`] for the fiber currently running
    /// on this scheduler, if any and if it was named. Used for logging.
    pub fn current_name(&self) -> Option<Arc<str>> {
        let state = self.shared.state.lock();
        state.current.and_then(|id| state.slot(id).name.clone())
    }

    /// Identifies this scheduler's underlying `Shared` allocation, stable
    /// for as long as any clone of it is alive. Used to key per-scheduler
    /// side tables (e.g. [`timeout`]'s timer wheel registry) without
    /// requiring `Scheduler` itself to be hashable.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    fn run_once(&self, id: FiberId) {
        {
            let mut state = self.shared.state.lock();
            state.current = Some(id);
            state.slot_mut(id).status = Status::Running;
            crate::trace_ctx!("fiber {:?} ({:?}) running", id, state.slot(id).name);
        }
        CURRENT_FIBER.with(|c| c.set(Some(id)));
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(self.clone()));
        let fiber_ctx: *const Context = {
            let state = self.shared.state.lock();
            &state.slot(id).ctx as *const Context
        };
        unsafe {
            context::swap(self.shared.outside.get(), fiber_ctx);
        }
        CURRENT_FIBER.with(|c| c.set(None));
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = None);
        let mut state = self.shared.state.lock();
        state.current = None;
        match state.slot(id).status {
            Status::Dead => {
                state.slots[id.0 as usize] = None;
            }
            Status::Ready => state.ready.push_back(id),
            Status::Running => {
                // Treat a fiber that returned control without calling
                // `yield_now`/`park` (shouldn't happen through this crate's
                // public API) as a plain yield rather than losing it.
                state.slot_mut(id).status = Status::Ready;
                state.ready.push_back(id);
            }
            Status::Waiting => {}
        }
    }

    /// Suspends the calling fiber, to be resumed by a later [`unpark`].
    /// Must be called from within a fiber running on this scheduler.
    fn park_current(&self) {
        let id = CURRENT_FIBER
            .with(|c| c.get())
            .expect("fiber::park called outside a fiber");
        let fiber_ctx: *mut Context = {
            let mut state = self.shared.state.lock();
            let slot = state.slot_mut(id);
            if slot.wake_pending {
                slot.wake_pending = false;
                crate::trace_ctx!("fiber {:?} ({:?}) park skipped, wake already pending", id, slot.name);
                return;
            }
            slot.status = Status::Waiting;
            crate::trace_ctx!("fiber {:?} ({:?}) parking", id, slot.name);
            &mut slot.ctx as *mut Context
        };
        unsafe {
            context::swap(fiber_ctx, self.shared.outside.get());
        }
    }

    /// Voluntarily yields the calling fiber back to the scheduler, which
    /// re-queues it as ready immediately. Must be called from within a
    /// fiber running on this scheduler.
    fn yield_current(&self) {
        let id = CURRENT_FIBER
            .with(|c| c.get())
            .expect("fiber::yield_now called outside a fiber");
        let fiber_ctx: *mut Context = {
            let mut state = self.shared.state.lock();
            let slot = state.slot_mut(id);
            crate::trace_ctx!("fiber {:?} ({:?}) yielding", id, slot.name);
            &mut slot.ctx as *mut Context
        };
        unsafe {
            context::swap(fiber_ctx, self.shared.outside.get());
        }
    }

    fn unpark(&self, id: FiberId) {
        let mut state = self.shared.state.lock();
        if state.slots[id.0 as usize].is_none() {
            return;
        }
        let slot = state.slot_mut(id);
        match slot.status {
            Status::Waiting => {
                slot.status = Status::Ready;
                let name = slot.name.clone();
                state.ready.push_back(id);
                crate::trace_ctx!("fiber {:?} ({:?}) unparked", id, name);
            }
            Status::Dead => {}
            Status::Ready | Status::Running => slot.wake_pending = true,
        }
        drop(state);
        let mut parked = self.shared.parked.lock().unwrap();
        if *parked {
            *parked = false;
            self.shared.wake_cvar.notify_all();
        }
    }

    fn finish_current(&self, id: FiberId) -> *const Context {
        let mut state = self.shared.state.lock();
        let slot = state.slot_mut(id);
        crate::trace_ctx!("fiber {:?} ({:?}) exiting", id, slot.name);
        slot.status = Status::Dead;
        self.shared.outside.get() as *const Context
    }
}

/// A handle used to wake a specific parked fiber from anywhere, including a
/// different OS thread than the one that owns the fiber's scheduler.
#[derive(Clone)]
pub struct FiberHandle {
    scheduler: Scheduler,
    id: FiberId,
}

/// Wakes the fiber described by `handle`. Idempotent and safe to call any
/// number of times, from any thread, even after the fiber has already
/// finished (in which case it's a no-op).
pub fn unpark(handle: &FiberHandle) {
    handle.scheduler.unpark(handle.id);
}

/// Returns the scheduler actually driving the calling fiber, or `None` if
/// called from outside any fiber (e.g. directly from the thread driving
/// [`Scheduler::dispatch`]).
///
/// This is not necessarily [`Scheduler::thread_default`] — a fiber spawned
/// with [`Builder::spawn_on`] onto an explicitly constructed `Scheduler`
/// runs under that scheduler, whatever OS thread happens to dispatch it.
/// Anything that needs to spawn helper fibers alongside the calling one
/// (like [`timeout`]'s timer wheel) must resolve the scheduler this way
/// rather than assuming the thread default.
pub fn current_scheduler() -> Option<Scheduler> {
    CURRENT_SCHEDULER.with(|c| c.borrow().clone())
}

/// Returns a handle to the currently running fiber, or `None` if called
/// from outside any fiber (e.g. directly from the thread driving
/// [`Scheduler::dispatch`]).
pub fn current() -> Option<FiberHandle> {
    let scheduler = current_scheduler()?;
    CURRENT_FIBER.with(|c| c.get()).map(|id| FiberHandle { scheduler, id })
}

/// Suspends the calling fiber until some other code calls [`unpark`] with
/// this fiber's handle.
///
/// # Panics
/// Panics if called outside a fiber.
pub fn park() {
    current_scheduler()
        .expect("fiber::park called outside a fiber")
        .park_current();
}

/// Voluntarily yields the calling fiber, giving other ready fibers a turn.
///
/// # Panics
/// Panics if called outside a fiber.
pub fn yield_now() {
    current_scheduler()
        .expect("fiber::yield_now called outside a fiber")
        .yield_current();
}

/// Blocks the calling fiber until `future` becomes terminal, returning its
/// outcome. This is the bridge between the future graph and the scheduler:
/// internally it registers a listener that unparks this fiber, then parks.
///
/// # Panics
/// Panics if called outside a fiber.
pub fn await_future<T>(future: &Future<T>) -> Result<T, Error>
where
    T: Clone + Send + 'static,
{
    let handle = current().expect("fiber::await_future called outside a fiber");
    let outcome = Arc::new(StdMutex::new(None));
    let outcome2 = outcome.clone();
    let handle2 = handle.clone();
    future.add_listener(move |result| {
        *outcome2.lock().unwrap() = Some(result);
        unpark(&handle2);
    });
    loop {
        if let Some(result) = outcome.lock().unwrap().take() {
            return result;
        }
        park();
    }
}

/// Configures and spawns a new fiber.
pub struct Builder {
    name: Option<Arc<str>>,
    stack_size: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            name: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Spawns `f` on the calling thread's default scheduler.
    pub fn spawn<F, T>(self, f: F) -> crate::error::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        self.spawn_on(&Scheduler::thread_default(), f)
    }

    /// Spawns `f` on a specific scheduler (not necessarily the calling
    /// thread's own — the fiber will only ever run on the OS thread that
    /// eventually calls `dispatch` on that scheduler).
    pub fn spawn_on<F, T>(self, scheduler: &Scheduler, f: F) -> crate::error::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        let stack = Stack::new(self.stack_size)?;
        let promise = Promise::new();
        let future = promise.future();

        let start = Box::new(Start {
            entry: Box::new(f),
            promise,
            scheduler: scheduler.clone(),
            id: AtomicU64::new(0),
        });
        let arg = Box::into_raw(start) as usize;
        let stack_top = stack.top();
        let ctx = unsafe { Context::new(stack_top, trampoline::<T>, arg) };

        let slot = Slot {
            name: self.name.clone(),
            ctx,
            _stack: stack,
            status: Status::Ready,
            wake_pending: false,
        };
        let id = {
            let mut state = scheduler.shared.state.lock();
            let id = state.alloc(slot);
            state.ready.push_back(id);
            id
        };
        // The trampoline needs its own fiber id to report completion;
        // stash it in the boxed `Start` it will reclaim on first run.
        unsafe {
            let start = &*(arg as *const Start<T>);
            start.id.store(id.0, Ordering::Relaxed);
        }
        scheduler.unpark_for_spawn();

        Ok(JoinHandle {
            future,
            name: self.name,
        })
    }
}

impl Scheduler {
    /// Nudges a parked dispatch loop after a new fiber becomes ready, the
    /// same way [`unpark`] does for a resumed one.
    fn unpark_for_spawn(&self) {
        let mut parked = self.shared.parked.lock().unwrap();
        if *parked {
            *parked = false;
            self.shared.wake_cvar.notify_all();
        }
    }
}

struct Start<T> {
    entry: Box<dyn FnOnce() -> T + Send>,
    promise: Promise<T>,
    scheduler: Scheduler,
    id: AtomicU64,
}

extern "C" fn trampoline<T>(arg: usize) -> !
where
    T: Clone + Send + 'static,
{
    let start = unsafe { Box::from_raw(arg as *mut Start<T>) };
    let Start {
        entry,
        promise,
        scheduler,
        id,
    } = *start;
    let fiber_id = FiberId(id.load(Ordering::Relaxed));
    CURRENT_FIBER.with(|c| c.set(Some(fiber_id)));

    match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(value) => promise.resolve(value),
        Err(payload) => promise.reject(Error::Cancelled(panic_message(&payload))),
    }

    let outside = scheduler.finish_current(fiber_id);
    let fiber_ctx: *mut Context = {
        let mut state = scheduler.shared.state.lock();
        &mut state.slot_mut(fiber_id).ctx as *mut Context
    };
    unsafe {
        context::swap(fiber_ctx, outside);
    }
    unreachable!("a dead fiber's context was resumed");
}

fn panic_message(payload: &Box<dyn Any + Send>) -> Arc<str> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        Arc::from(*s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        Arc::from(s.as_str())
    } else {
        Arc::from("fiber panicked with a non-string payload")
    }
}

/// A handle to a spawned fiber's eventual return value.
pub struct JoinHandle<T> {
    future: Future<T>,
    name: Option<Arc<str>>,
}

impl<T> JoinHandle<T>
where
    T: Clone + Send + 'static,
{
    /// Blocks the calling fiber until the spawned one finishes, returning
    /// its value or, if it panicked, `Err(Error::Cancelled(..))`.
    ///
    /// # Panics
    /// Panics if called outside a fiber — use [`future`](Self::future) and
    /// a scheduler's `dispatch` loop instead when joining from plain OS
    /// thread code.
    pub fn join(self) -> Result<T, Error> {
        await_future(&self.future)
    }

    /// The underlying future, for code that wants to compose joins with
    /// other futures instead of blocking immediately.
    pub fn future(&self) -> Future<T> {
        self.future.clone()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn two_fibers_interleave_on_yield() {
        let scheduler = Scheduler::new();
        let order = Arc::new(StdMutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        Builder::new()
            .spawn_on(&scheduler, move || {
                o1.lock().unwrap().push("a1");
                yield_now();
                o1.lock().unwrap().push("a2");
            })
            .unwrap();
        Builder::new()
            .spawn_on(&scheduler, move || {
                o2.lock().unwrap().push("b1");
                yield_now();
                o2.lock().unwrap().push("b2");
            })
            .unwrap();
        scheduler.dispatch();
        assert_eq!(*order.lock().unwrap(), vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn join_handle_returns_value() {
        let scheduler = Scheduler::new();
        let handle = Builder::new().spawn_on(&scheduler, || 1 + 1).unwrap();
        let joined = Arc::new(AtomicU32::new(0));
        let joined2 = joined.clone();
        Builder::new()
            .spawn_on(&scheduler, move || {
                let v = handle.join().unwrap();
                joined2.store(v as u32, Ordering::SeqCst);
            })
            .unwrap();
        scheduler.dispatch();
        assert_eq!(joined.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_fiber_rejects_join_with_cancelled() {
        let scheduler = Scheduler::new();
        let handle: JoinHandle<i32> = Builder::new()
            .spawn_on(&scheduler, || panic!("boom"))
            .unwrap();
        let result = Arc::new(StdMutex::new(None));
        let result2 = result.clone();
        Builder::new()
            .spawn_on(&scheduler, move || {
                *result2.lock().unwrap() = Some(handle.join());
            })
            .unwrap();
        scheduler.dispatch();
        let outcome = result.lock().unwrap().take().unwrap();
        match outcome {
            Err(Error::Cancelled(_)) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[test]
    fn park_and_unpark_from_another_thread() {
        let scheduler = Scheduler::new();
        let woke = Arc::new(AtomicU32::new(0));
        let woke2 = woke.clone();
        let handle_slot = Arc::new(StdMutex::new(None));
        let handle_slot2 = handle_slot.clone();
        Builder::new()
            .spawn_on(&scheduler, move || {
                *handle_slot2.lock().unwrap() = current();
                park();
                woke2.store(1, Ordering::SeqCst);
            })
            .unwrap();

        // Run the scheduler on a background thread while we wait for the
        // fiber to publish its handle and park, then wake it from here.
        let scheduler2 = scheduler.clone();
        let runner = std::thread::spawn(move || scheduler2.dispatch());
        let fiber_handle = loop {
            if let Some(h) = handle_slot.lock().unwrap().clone() {
                break h;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        std::thread::sleep(Duration::from_millis(5));
        unpark(&fiber_handle);
        runner.join().unwrap();
        assert_eq!(woke.load(Ordering::SeqCst), 1);
    }
}
