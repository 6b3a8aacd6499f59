//! Logging utils. See the ["log" crate documentation](https://docs.rs/log/)
//! for the general API; this module only adds conventions this crate's own
//! code follows when emitting diagnostics.
//!
//! The scheduler, fiber lifecycle transitions and channel pairing steps all
//! log through the `log` facade at `trace`/`debug` level. This crate never
//! installs a logger itself — like any library, it leaves that decision to
//! the host application (see [`log::set_logger`]).
//!
//! Example:
//! ```no_run
//! use cofiber::log::ModuleLogger;
//! static LOGGER: ModuleLogger = ModuleLogger::new();
//! log::set_logger(&LOGGER).unwrap();
//! log::set_max_level(log::LevelFilter::Debug);
//! ```

use log::{Level, Log, Metadata, Record};

/// A minimal [`Log`] implementation that writes to stderr, prefixed with the
/// record's target. Mainly useful for examples and tests; production hosts
/// are expected to install their own logger (`env_logger`, `tracing-log`,
/// etc.) since this crate only ever calls into the `log` facade.
pub struct ModuleLogger {
    max_level: Level,
}

impl ModuleLogger {
    /// Create a logger that passes through everything up to [`Level::Trace`].
    #[inline]
    pub const fn new() -> Self {
        Self {
            max_level: Level::Trace,
        }
    }

    /// Create a logger that filters out anything less severe than `level`.
    #[inline]
    pub const fn with_max_level(level: Level) -> Self {
        Self { max_level: level }
    }
}

impl Default for ModuleLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for ModuleLogger {
    #[inline]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "[{level} {target}] {args}",
                level = record.level(),
                target = record.target(),
                args = record.args(),
            );
        }
    }

    fn flush(&self) {}
}

/// Fires a `trace!`-level log line tagged with the scheduler/fiber context.
/// Used internally by the scheduler dispatch loop; exposed so that
/// downstream code building on this crate can match its own diagnostics to
/// the same shape.
#[macro_export]
macro_rules! trace_ctx {
    ($($arg:tt)+) => {
        ::log::trace!(target: "cofiber", $($arg)+)
    };
}
