//! Asynchronous I/O as a collaborator interface.
//!
//! This crate owns no kernel AIO facility of its own — the spec describes
//! the AIO backend only through its interface, the way `tarantool`'s own
//! `coio` module sits on top of the *host* Tarantool event loop rather than
//! implementing epoll/io_uring itself. [`AioContext`] is that interface:
//! `read`/`write` return ordinary [`Future`]s that some external completion
//! source resolves.
//!
//! The [`sync_io`] submodule is a minimal reference implementation, gated
//! behind the `sync_aio` feature, useful for tests and single-fiber demos: it
//! runs each request on a blocking OS thread and resolves the future when
//! that thread finishes. A real deployment is expected to supply its own
//! [`AioContext`] backed by whatever the host event loop actually offers.

use crate::future::Future;

/// A source of asynchronous read/write completions.
///
/// Implementations are expected to be cheap to clone (or otherwise shareable
/// across fibers) and to drive their underlying completion mechanism from
/// the same event loop as the [`crate::fiber::Scheduler`] the returned
/// futures are awaited on.
pub trait AioContext: Send + Sync {
    /// Opaque per-context state; `()` is enough for backends that need none.
    type Context;

    /// Creates a new context for subsequent `read`/`write` calls.
    fn create_context(&self) -> Self::Context;

    /// Reads up to `buf.len()` bytes from `fd` at `offset`. Resolves with the
    /// number of bytes read (`0` at EOF).
    fn read(
        &self,
        ctx: &Self::Context,
        fd: std::os::unix::io::RawFd,
        buf: Vec<u8>,
        offset: u64,
    ) -> Future<(Vec<u8>, usize)>;

    /// Writes `buf` to `fd` at `offset`. Resolves with the number of bytes
    /// written.
    fn write(
        &self,
        ctx: &Self::Context,
        fd: std::os::unix::io::RawFd,
        buf: Vec<u8>,
        offset: u64,
    ) -> Future<usize>;
}

/// A blocking-thread-backed [`AioContext`], good enough for tests and small
/// single-fiber programs; real deployments should prefer a backend that
/// actually integrates with their event loop instead of burning an OS thread
/// per request.
#[cfg(feature = "sync_aio")]
pub mod sync_io {
    use super::AioContext;
    use crate::error::Error;
    use crate::future::{Future, Promise};
    use std::os::unix::io::RawFd;

    /// See the [module-level docs](super).
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SyncIo;

    impl AioContext for SyncIo {
        type Context = ();

        fn create_context(&self) {}

        fn read(&self, _ctx: &(), fd: RawFd, mut buf: Vec<u8>, offset: u64) -> Future<(Vec<u8>, usize)> {
            let promise = Promise::new();
            let future = promise.future();
            std::thread::spawn(move || {
                let result = pread(fd, &mut buf, offset).map(|n| (buf, n));
                match result {
                    Ok(pair) => promise.resolve(pair),
                    Err(err) => promise.reject(err),
                }
            });
            future
        }

        fn write(&self, _ctx: &(), fd: RawFd, buf: Vec<u8>, offset: u64) -> Future<usize> {
            let promise = Promise::new();
            let future = promise.future();
            std::thread::spawn(move || match pwrite(fd, &buf, offset) {
                Ok(n) => promise.resolve(n),
                Err(err) => promise.reject(err),
            });
            future
        }
    }

    fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let n = unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            Err(Error::other(std::io::Error::last_os_error()))
        } else {
            Ok(n as usize)
        }
    }

    fn pwrite(fd: RawFd, buf: &[u8], offset: u64) -> Result<usize, Error> {
        let n = unsafe {
            libc::pwrite(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            Err(Error::other(std::io::Error::last_os_error()))
        } else {
            Ok(n as usize)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::fiber::{self, Builder, Scheduler};
        use std::io::Write;
        use std::os::unix::io::AsRawFd;
        use std::sync::{Arc, Mutex};

        #[test]
        fn round_trips_through_a_temp_file() {
            let mut file = tempfile_like();
            file.write_all(b"hello aio").unwrap();
            file.flush().unwrap();

            let scheduler = Scheduler::new();
            let result = Arc::new(Mutex::new(None));
            let result2 = result.clone();
            let fd = file.as_raw_fd();
            Builder::new()
                .spawn_on(&scheduler, move || {
                    let io = SyncIo;
                    let ctx = io.create_context();
                    let buf = vec![0u8; 5];
                    let future = io.read(&ctx, fd, buf, 0);
                    *result2.lock().unwrap() = Some(fiber::await_future(&future));
                })
                .unwrap();
            scheduler.dispatch();
            let (buf, n) = result.lock().unwrap().take().unwrap().unwrap();
            assert_eq!(n, 5);
            assert_eq!(&buf[..n], b"hello");
        }

        fn tempfile_like() -> std::fs::File {
            let path = std::env::temp_dir().join(format!(
                "cofiber-aio-test-{}-{:?}",
                std::process::id(),
                std::thread::current().id()
            ));
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .unwrap()
        }
    }
}
