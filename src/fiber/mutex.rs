//! A mutex that the same thread can lock more than once without
//! deadlocking itself.
//!
//! [`FiberScheduler`](super::FiberScheduler) needs this for its `rec_mutex`:
//! dispatch can call back into scheduler methods (spawning a fiber from a
//! completion listener, for instance) while already holding the lock that
//! protects its ready/waiting queues. A plain [`std::sync::Mutex`] would
//! deadlock the first time that happened.
//!
//! Unlike `tarantool`'s single-threaded `Latch` (safe there only because
//! Tarantool's fiber loop never has two OS threads contending on the same
//! latch at once), this crate's futures and fibers are explicitly
//! cross-thread: a future can be completed, and a fiber marked runnable,
//! from any OS thread. So the non-owning case here really does block on a
//! real [`std::sync::Mutex`], not spin-yield cooperatively.

use std::cell::{Cell, UnsafeCell};
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

/// A recursive mutex: the thread currently holding the lock may acquire it
/// again without blocking; the protected data is released once the
/// outermost guard is dropped.
pub struct ReentrantLock<T> {
    gate: Mutex<()>,
    owner: Mutex<Option<ThreadId>>,
    depth: Cell<u32>,
    data: UnsafeCell<T>,
}

// `gate` being held is what actually makes the `data` access exclusive;
// `depth`/`owner` bookkeeping only ever happens while this thread (or no
// thread) holds `gate`, which is enough to make sharing across threads
// sound despite the non-atomic `Cell`.
unsafe impl<T: Send> Sync for ReentrantLock<T> {}

pub struct ReentrantLockGuard<'a, T> {
    lock: &'a ReentrantLock<T>,
    // `None` for a nested acquisition, which must not release `gate` when
    // dropped; `Some` holds the real guard for the outermost acquisition.
    _gate: Option<MutexGuard<'a, ()>>,
}

impl<T> ReentrantLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            gate: Mutex::new(()),
            owner: Mutex::new(None),
            depth: Cell::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, blocking if another thread holds it. If the
    /// calling thread already holds it, returns immediately with a nested
    /// guard.
    pub fn lock(&self) -> ReentrantLockGuard<'_, T> {
        let me = thread::current().id();
        if *self.owner.lock().unwrap() == Some(me) {
            self.depth.set(self.depth.get() + 1);
            return ReentrantLockGuard {
                lock: self,
                _gate: None,
            };
        }
        let gate = self.gate.lock().unwrap();
        *self.owner.lock().unwrap() = Some(me);
        self.depth.set(1);
        ReentrantLockGuard {
            lock: self,
            _gate: Some(gate),
        }
    }
}

impl<T> Deref for ReentrantLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safe: `gate` (held directly by the outermost guard, or
        // transitively by an enclosing nested guard on this same thread)
        // guarantees no other thread can be inside `lock()` or holding a
        // guard right now.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for ReentrantLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for ReentrantLockGuard<'_, T> {
    fn drop(&mut self) {
        let depth = self.lock.depth.get() - 1;
        self.lock.depth.set(depth);
        if depth == 0 {
            *self.lock.owner.lock().unwrap() = None;
        }
        // `self._gate`, if `Some`, releases `gate` right after this only
        // for the outermost acquisition.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn nested_lock_on_same_thread_does_not_deadlock() {
        let lock = ReentrantLock::new(0);
        let outer = lock.lock();
        {
            let mut inner = lock.lock();
            *inner += 1;
        }
        assert_eq!(*outer, 1);
    }

    #[test]
    fn blocks_across_threads_until_released() {
        let lock = Arc::new(ReentrantLock::new(0));
        let guard = lock.lock();
        let lock2 = lock.clone();
        let handle = thread::spawn(move || {
            let mut g = lock2.lock();
            *g += 1;
        });
        thread::sleep(std::time::Duration::from_millis(20));
        drop(guard);
        handle.join().unwrap();
        assert_eq!(*lock.lock(), 1);
    }
}
