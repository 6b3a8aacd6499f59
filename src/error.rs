//! Error handling utils.
//!
//! Every operation in this crate that can fail reports the failure as a
//! rejected [`Future`](crate::future::Future) rather than by unwinding the
//! stack. The payload carried by a rejection is always an [`Error`]: a
//! tagged `{domain, code, message}` triple, the way the spec's error
//! taxonomy describes it.
//!
//! User callbacks (the closures passed to [`Future::then`](crate::future::Future::then)
//! and friends) can fail with any error that implements
//! [`std::error::Error`] + [`Send`] + [`Sync`]; such errors are wrapped in
//! [`Error::Other`].

use std::fmt;
use std::sync::Arc;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The domain a tagged error belongs to, mirroring the `domain` field of the
/// spec's `{domain, code, message}` error triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorDomain {
    /// Errors originating from a [`Channel`](crate::fiber::channel::Channel).
    Channel,
    /// Errors originating from a [`Timeout`](crate::fiber::timeout::Timeout).
    Timeout,
    /// Errors produced by future combinators (`all`, `any`, `first`, ...).
    Combinator,
    /// Errors produced by the fiber scheduler itself.
    Scheduler,
    /// Errors propagated verbatim from user code.
    User,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Channel => "channel",
            Self::Timeout => "timeout",
            Self::Combinator => "combinator",
            Self::Scheduler => "scheduler",
            Self::User => "user",
        };
        f.write_str(s)
    }
}

/// Represents all error cases that can be carried by a rejected future.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The channel was closed for sending or receiving before this
    /// operation could complete. See `Channel::close_send`/`close_receive`.
    #[error("channel closed")]
    ChannelClosed,

    /// A [`Timeout`](crate::fiber::timeout::Timeout) future rejected because
    /// its deadline was reached before it was resolved from elsewhere.
    #[error("timed out")]
    TimedOut,

    /// A combinator (`all`, `first`, `all_race`) propagated the first
    /// rejection it observed from one of its dependencies.
    #[error("dependency failed: {0}")]
    DependencyFailed(Box<Error>),

    /// The fiber's entry function unwound (panicked) instead of returning.
    #[error("fiber panicked: {0}")]
    Cancelled(Arc<str>),

    /// Any other error, usually propagated from a user-supplied callback.
    #[error("{0}")]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Error>();
};

impl Error {
    /// Construct an [`Error::Other`] from any compatible error type.
    #[inline]
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Arc::new(error))
    }

    /// The `domain` component of the spec's `{domain, code, message}` triple.
    pub fn domain(&self) -> ErrorDomain {
        match self {
            Self::ChannelClosed => ErrorDomain::Channel,
            Self::TimedOut => ErrorDomain::Timeout,
            Self::DependencyFailed(_) => ErrorDomain::Combinator,
            Self::Cancelled(_) => ErrorDomain::Scheduler,
            Self::Other(_) => ErrorDomain::User,
        }
    }

    /// The `code` component of the spec's `{domain, code, message}` triple.
    /// A short, stable, machine-comparable identifier for the variant.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ChannelClosed => "CHANNEL_CLOSED",
            Self::TimedOut => "TIMED_OUT",
            Self::DependencyFailed(_) => "DEPENDENCY_FAILED",
            Self::Cancelled(_) => "CANCELLED",
            Self::Other(_) => "OTHER",
        }
    }

    /// Wrap `self` as the cause of a combinator's `DEPENDENCY_FAILED` error.
    pub fn into_dependency_failed(self) -> Self {
        match self {
            already @ Self::DependencyFailed(_) => already,
            other => Self::DependencyFailed(Box::new(other)),
        }
    }
}

impl PartialEq for Error {
    /// Compares by `(domain, code)`, since the wrapped causes (arbitrary
    /// trait objects, panics captured as strings) generally aren't
    /// comparable for equality.
    fn eq(&self, other: &Self) -> bool {
        self.domain() == other.domain() && self.code() == other.code()
    }
}
