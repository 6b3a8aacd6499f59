//! A small structured-concurrency core: [futures](future), cooperatively
//! scheduled [fibers](fiber), and a bounded [channel](fiber::channel) of
//! futures for producer/consumer handoff between them.
//!
//! - [Futures](future): an eventual value or error, completed once, with
//!   listener-based continuation — the write side is [`future::Promise`].
//! - [Fibers](fiber): user-space-stack coroutines cooperatively scheduled by
//!   a [`fiber::Scheduler`], switching stacks with a hand-written assembly
//!   primitive rather than relying on `std::future::Future`/an executor.
//! - [Channels](fiber::channel): a bounded FIFO of futures, including
//!   rendezvous (capacity-0) handoff, that pairs queued sends with queued
//!   receives rather than blocking a fiber directly.
//! - [Timeouts](fiber::timeout): deadlines serviced entirely by fibers and
//!   futures, with no OS timer involved.
//! - [Logging](log) (see <https://docs.rs/log/>)
//! - [Error handling](error)
//!
//! ### Collaborator interfaces
//!
//! [`aio::AioContext`] and [`event_loop::EventSource`] describe how this
//! crate's core expects to be wired into a host application's I/O backend
//! and event loop, respectively, without this crate owning either. A
//! reference `AioContext` is available behind the `sync_aio` feature.
//!
//! ### Features
//!
//! - `sync_aio` — enables [`aio::sync_io`], a blocking-thread-backed
//!   reference [`aio::AioContext`] for tests and small single-fiber
//!   programs.

pub mod aio;
pub mod clock;
pub mod error;
pub mod event_loop;
pub mod fiber;
pub mod future;
pub mod log;

pub use error::{Error, ErrorDomain, Result};
pub use event_loop::EventSource;
pub use fiber::{Builder, FiberHandle, FiberId, JoinHandle, Scheduler};
pub use future::{Future, Promise, Status};
