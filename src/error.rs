//! Error handling utils.
//!
//! Every fallible routine of the crate returns [`Error`] through the
//! crate-wide [`Result`] alias. The runtime distinguishes *recoverable*
//! conditions (a depleted pool, an expired timeout, a cancelled fiber) from
//! *programmer errors* (suspending inside a critical section, installing two
//! fiber waiters on one descriptor direction, driving the reactor from the
//! wrong thread). The former travel as `Err` values; the latter panic with a
//! diagnostic, since no caller can meaningfully continue past them.

use std::fmt::{self, Display, Formatter};
use std::io;

/// A specialized [`Result`] type for the crate
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A fixed-capacity pool (fiber records, timer entries, deferred tasks,
    /// descriptor contexts) has no free slot left.
    #[error("{0} pool is depleted")]
    PoolDepleted(&'static str),

    /// A timer deadline lies beyond the total span of the time queue.
    /// Shorten the interval or re-arm the timer in stages.
    #[error("timer deadline is too far ahead of the time queue span")]
    TooFarAhead,

    /// A suspension's timeout fired before the fiber was resumed.
    #[error("operation timed out")]
    Timeout,

    /// The fiber was woken by [`throw_in`] or is being torn down by
    /// [`kill`].
    ///
    /// [`throw_in`]: crate::fiber::throw_in
    /// [`kill`]: crate::fiber::kill
    #[error("fiber was interrupted")]
    Interrupted,

    /// An error injected into this fiber by another fiber via
    /// [`throw_in`](crate::fiber::throw_in), carrying the original message.
    #[error("{0}")]
    Injected(Box<str>),

    /// A closure deferred to the worker thread pool panicked. Wraps the
    /// panic message captured on the worker.
    #[error("deferred task failed: {message}")]
    DeferredTaskFailed {
        message: Box<str>,
        location: Option<Box<str>>,
    },

    /// An operation was attempted before [`reactor::open`] or after
    /// [`reactor::close`].
    ///
    /// [`reactor::open`]: crate::reactor::open
    /// [`reactor::close`]: crate::reactor::close
    #[error("reactor is not open on this thread")]
    ReactorClosed,

    /// `defer_to_thread` was called on a reactor opened with
    /// `thread_pool_workers = 0`.
    #[error("the worker thread pool is disabled")]
    ThreadPoolDisabled,

    #[error("io error: {0}")]
    IO(#[from] io::Error),

    /// This should only be used if the error doesn't fall into one of the
    /// above categories.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    #[inline(always)]
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::PoolDepleted(_) => "PoolDepleted",
            Self::TooFarAhead => "TooFarAhead",
            Self::Timeout => "Timeout",
            Self::Interrupted => "Interrupted",
            Self::Injected(_) => "Injected",
            Self::DeferredTaskFailed { .. } => "DeferredTaskFailed",
            Self::ReactorClosed => "ReactorClosed",
            Self::ThreadPoolDisabled => "ThreadPoolDisabled",
            Self::IO(_) => "IO",
            Self::Other(_) => "Other",
        }
    }

    /// `true` for [`Error::Timeout`].
    #[inline(always)]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

////////////////////////////////////////////////////////////////////////////////
// DeferredPanic
////////////////////////////////////////////////////////////////////////////////

/// Structured info about a panic captured on a worker thread, converted into
/// [`Error::DeferredTaskFailed`] when the requesting fiber resumes.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeferredPanic {
    pub message: String,
    pub location: Option<String>,
}

impl DeferredPanic {
    pub(crate) fn into_error(self) -> Error {
        Error::DeferredTaskFailed {
            message: self.message.into_boxed_str(),
            location: self.location.map(String::into_boxed_str),
        }
    }
}

impl Display for DeferredPanic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{} at {}", self.message, loc),
            None => write!(f, "{}", self.message),
        }
    }
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_names() {
        assert_eq!(Error::Timeout.variant_name(), "Timeout");
        assert_eq!(Error::PoolDepleted("fiber").variant_name(), "PoolDepleted");
        assert_eq!(
            Error::from(io::Error::from(io::ErrorKind::WouldBlock)).variant_name(),
            "IO"
        );
    }

    #[test]
    fn display() {
        assert_eq!(Error::Timeout.to_string(), "operation timed out");
        assert_eq!(
            Error::PoolDepleted("timer entry").to_string(),
            "timer entry pool is depleted"
        );
    }
}
