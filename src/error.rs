//! Structured error taxonomy.
//!
//! Every fallible operation in this crate returns [`Error`] rather than a bare
//! `std::io::Error` or `nix::Error`. The point is that an errno alone rarely tells a
//! caller enough to react sensibly (keep retrying? wait and rebind? give up?), so the
//! errno is classified into the taxonomy a caller actually wants to match on, and the
//! syscall name plus the path/fd it was issued against are kept alongside it.

use nix::errno::Errno;
use std::fmt;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Where an OS-level error was raised, for inclusion in the error message.
#[derive(Debug, Clone)]
pub enum Context {
    Path(PathBuf),
    Fd(i32),
    Description(String),
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Context::Path(p) => write!(f, "{}", p.display()),
            Context::Fd(fd) => write!(f, "fd {fd}"),
            Context::Description(d) => write!(f, "{d}"),
        }
    }
}

/// Structured error returned by this crate.
///
/// Variants `PermissionDenied` through `OsOther` classify an `errno` into the
/// taxonomy callers actually want to match on; `StateError`, `DescriptorError`
/// and `Cancelled` are non-errno errors internal to this crate's own state
/// machines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("permission denied: {syscall} on {context}: {source}")]
    PermissionDenied { syscall: &'static str, context: Context, source: Errno },

    #[error("not found: {syscall} on {context}: {source}")]
    NotFound { syscall: &'static str, context: Context, source: Errno },

    #[error("busy: {syscall} on {context}: {source}")]
    Busy { syscall: &'static str, context: Context, source: Errno },

    #[error("resource exhausted: {syscall} on {context}: {source}")]
    ResourceExhaustion { syscall: &'static str, context: Context, source: Errno },

    #[error("protocol error: {syscall} on {context}: {source}")]
    ProtocolError { syscall: &'static str, context: Context, source: Errno },

    #[error("invalid argument: {syscall} on {context}: {source}")]
    InvalidArgument { syscall: &'static str, context: Context, source: Errno },

    #[error("{syscall} on {context}: {source}")]
    OsOther { syscall: &'static str, context: Context, source: Errno },

    #[error("illegal use: {0}")]
    StateError(String),

    #[error("descriptor error: {0}")]
    DescriptorError(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("{0}")]
    Exhausted(String),
}

impl Error {
    /// Builds a structured OS error from a raw errno, classifying it
    pub fn from_errno(errno: Errno, syscall: &'static str, context: Context) -> Self {
        use Errno::*;
        match errno {
            EPERM | EACCES | EROFS => Error::PermissionDenied { syscall, context, source: errno },
            ENOENT | ENODEV | ESRCH => Error::NotFound { syscall, context, source: errno },
            EBUSY | EEXIST => Error::Busy { syscall, context, source: errno },
            ENOMEM | ENOSPC | EMFILE | ENOBUFS | EDQUOT => {
                Error::ResourceExhaustion { syscall, context, source: errno }
            }
            EPROTO | EBADMSG | EPIPE => Error::ProtocolError { syscall, context, source: errno },
            EINVAL => Error::InvalidArgument { syscall, context, source: errno },
            other => Error::OsOther { syscall, context, source: other },
        }
    }

    pub fn from_last_errno(syscall: &'static str, context: Context) -> Self {
        Self::from_errno(Errno::last(), syscall, context)
    }

    /// Whether the underlying errno is transient and a caller may retry (EAGAIN,
    /// EWOULDBLOCK, EINTR). Workers handle this internally; `bind()` does not.
    pub fn is_retryable(&self) -> bool {
        self.raw_errno().map(|e| matches!(e, Errno::EAGAIN | Errno::EWOULDBLOCK | Errno::EINTR)).unwrap_or(false)
    }

    /// Whether the underlying errno is EBUSY/EEXIST, which the ConfigFS assembler
    /// retries a bounded number of times before giving up.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy { .. })
    }

    /// Whether this is a halted-endpoint condition (EPIPE), recoverable via
    /// `clear_halt()`.
    pub fn is_halted(&self) -> bool {
        matches!(self, Error::ProtocolError { source: Errno::EPIPE, .. })
    }

    /// Whether the target (device, path, interface) does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether the underlying errno is a permission failure (EPERM/EACCES/EROFS).
    pub fn is_permission(&self) -> bool {
        matches!(self, Error::PermissionDenied { .. })
    }

    /// Whether the system is out of some resource (memory, fds, disk quota).
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Error::ResourceExhaustion { .. })
    }

    /// Whether the underlying errno reflects a network-level failure. None of this
    /// crate's own syscalls are network syscalls, but `OsOther` can still carry one
    /// when a caller's own fd (e.g. a TCP socket layered above a gadget function)
    /// surfaces through the same `From<std::io::Error>` path.
    pub fn is_network(&self) -> bool {
        self.raw_errno()
            .map(|e| {
                matches!(
                    e,
                    Errno::ECONNRESET
                        | Errno::ECONNREFUSED
                        | Errno::ECONNABORTED
                        | Errno::ENETDOWN
                        | Errno::ENETUNREACH
                        | Errno::ENETRESET
                        | Errno::EHOSTUNREACH
                        | Errno::ETIMEDOUT
                )
            })
            .unwrap_or(false)
    }

    pub fn raw_errno(&self) -> Option<Errno> {
        match self {
            Error::PermissionDenied { source, .. }
            | Error::NotFound { source, .. }
            | Error::Busy { source, .. }
            | Error::ResourceExhaustion { source, .. }
            | Error::ProtocolError { source, .. }
            | Error::InvalidArgument { source, .. }
            | Error::OsOther { source, .. } => Some(*source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let errno = match err.raw_os_error() {
            Some(code) => Errno::from_i32(code),
            None => Errno::UnknownErrno,
        };
        Error::from_errno(errno, "io", Context::Description(err.to_string()))
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::from_errno(errno, "syscall", Context::Description(String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(errno: Errno) -> Error {
        Error::from_errno(errno, "test", Context::Description(String::new()))
    }

    #[test]
    fn classification_predicates_match_their_variants() {
        assert!(err(Errno::ENOENT).is_not_found());
        assert!(err(Errno::EACCES).is_permission());
        assert!(err(Errno::ENOMEM).is_resource_exhaustion());
        assert!(err(Errno::ECONNRESET).is_network());
        assert!(!err(Errno::ENOENT).is_network());
    }

    #[test]
    fn exhausted_is_not_classified_as_any_errno_predicate() {
        let e = Error::Exhausted("cap reached".into());
        assert!(!e.is_not_found());
        assert!(!e.is_permission());
        assert!(!e.is_resource_exhaustion());
        assert!(!e.is_network());
        assert!(e.raw_errno().is_none());
    }
}
