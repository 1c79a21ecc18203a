//! Error and outcome types shared by every stream object, accepter and
//! transport provider.

use std::io;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A failed stream or accepter operation.
///
/// Expected outcomes of bounded or interruptible waits are not errors; those
/// are reported through [`Outcome`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An allocation or resource reservation failed.
    #[error("out of memory")]
    NoMem,

    /// The operation is not valid in the object's current lifecycle state.
    #[error("operation not permitted in the current state")]
    NotReady,

    /// The transport, or the registered event interface, lacks the requested
    /// capability.
    #[error("operation not supported")]
    NotSupported,

    /// A lookup, or an indexed control query, ran past the last entry.
    #[error("not found")]
    NotFound,

    /// An argument or transport string was malformed.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// The object was closed locally before the operation completed.
    #[error("closed locally before the operation completed")]
    LocalClosed,

    /// The remote end closed the connection.
    #[error("remote end closed the connection")]
    RemoteClosed,

    /// A user callback failed in a way the dispatcher had to contain.
    #[error("application callback failed")]
    AppError,

    /// The native transport reported an I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// A copy of this error, for handing the same failure to more than one
    /// receiver. I/O errors keep their kind, OS code and message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::NoMem => Self::NoMem,
            Self::NotReady => Self::NotReady,
            Self::NotSupported => Self::NotSupported,
            Self::NotFound => Self::NotFound,
            Self::Invalid(msg) => Self::Invalid(msg.clone()),
            Self::LocalClosed => Self::LocalClosed,
            Self::RemoteClosed => Self::RemoteClosed,
            Self::AppError => Self::AppError,
            Self::Io(e) => Self::Io(match e.raw_os_error() {
                Some(code) => io::Error::from_raw_os_error(code),
                None => io::Error::new(e.kind(), e.to_string()),
            }),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

#[cfg(not(windows))]
impl From<rustix::io::Errno> for Error {
    fn from(errno: rustix::io::Errno) -> Self {
        Self::Io(errno.into())
    }
}

/// The result of a blocking call that may stop early without failing.
///
/// Callers use this to tell "the operation did not complete" apart from "the
/// operation failed". Neither `TimedOut` nor `Interrupted` changes the
/// object's state, so the same call may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Outcome<T> {
    /// The operation completed with a value.
    Ready(T),
    /// The timeout expired first.
    TimedOut,
    /// An interruption was posted to the waiter.
    Interrupted,
}

impl<T> Outcome<T> {
    /// Maps the ready value, leaving the other outcomes untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Ready(v) => Outcome::Ready(f(v)),
            Self::TimedOut => Outcome::TimedOut,
            Self::Interrupted => Outcome::Interrupted,
        }
    }

    /// Returns the ready value, if any.
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(v) => Some(v),
            _ => None,
        }
    }

    /// Returns `true` for [`Outcome::TimedOut`].
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    /// Returns `true` for [`Outcome::Interrupted`].
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}
