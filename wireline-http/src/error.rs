use std::fmt;

use thiserror::Error;

use crate::method::Method;

/// A source location carried by every error for diagnostics across wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub file: &'static str,
    pub module: &'static str,
    pub line: u32,
}

impl Location {
    pub const fn new(file: &'static str, module: &'static str, line: u32) -> Location {
        Location { file, module, line }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} - {}", self.file, self.line, self.module)
    }
}

/// Capture the current source location.
#[macro_export]
macro_rules! here {
    () => {
        $crate::Location::new(file!(), module_path!(), line!())
    };
}

/// Errors produced by the HTTP engine.
#[derive(Debug, Error)]
pub enum Error {
    /// URI parse failure.
    #[error("malformed uri: {reason} [{location}]")]
    MalformedUri { reason: String, location: Location },

    /// The transport cannot issue the requested method.
    #[error("http method not supported: {method} [{location}]")]
    HttpMethodNotSupported { method: Method, location: Location },

    /// `execute`/`async_execute` called on a request that is not ready.
    #[error("request is already active [{location}]")]
    AlreadyActive { location: Location },

    /// Operation on a transport handle that was released back to the pool.
    #[error("handle has been abandoned [{location}]")]
    HandleHasBeenAbandoned { location: Location },

    /// DNS resolution failed.
    #[error("could not resolve host {host}: {reason} [{location}]")]
    CouldNotResolveHost {
        host: String,
        reason: String,
        location: Location,
    },

    /// TCP connect failed on every resolved address.
    #[error("could not connect to {host}: {reason} [{location}]")]
    CouldNotConnect {
        host: String,
        reason: String,
        location: Location,
    },

    /// Overall deadline, pool-acquire wait, or low-speed threshold exceeded.
    #[error("operation timed out: {reason} [{location}]")]
    OperationTimedOut { reason: String, location: Location },

    /// TLS handshake failure not attributable to the certificate.
    #[error("ssl connect error: {reason} [{location}]")]
    SslConnectError { reason: String, location: Location },

    /// The server certificate did not verify against the host name.
    #[error("peer failed verification: {reason} [{location}]")]
    PeerFailedVerification { reason: String, location: Location },

    /// The server certificate chain itself is bad.
    #[error("ssl certificate problem: {reason} [{location}]")]
    SslCertProblem { reason: String, location: Location },

    /// The user aborted from a progress callback or stopped the client.
    #[error("aborted by callback [{location}]")]
    AbortedByCallback { location: Location },

    /// Codec rejected its input.
    #[error("bad content encoding: {reason} [{location}]")]
    BadContentEncoding { reason: String, location: Location },

    /// Catch-all transport error carrying a description.
    #[error("{description} [{location}]")]
    Http {
        description: String,
        location: Location,
    },
}

impl Error {
    /// The source location the error was raised at.
    pub fn location(&self) -> Location {
        match self {
            Error::MalformedUri { location, .. }
            | Error::HttpMethodNotSupported { location, .. }
            | Error::AlreadyActive { location }
            | Error::HandleHasBeenAbandoned { location }
            | Error::CouldNotResolveHost { location, .. }
            | Error::CouldNotConnect { location, .. }
            | Error::OperationTimedOut { location, .. }
            | Error::SslConnectError { location, .. }
            | Error::PeerFailedVerification { location, .. }
            | Error::SslCertProblem { location, .. }
            | Error::AbortedByCallback { location }
            | Error::BadContentEncoding { location, .. }
            | Error::Http { location, .. } => *location,
        }
    }

    /// Whether this is a timeout-class failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::OperationTimedOut { .. })
    }
}
