use std::io;

use thiserror::Error;

/// Errors returned by the wireline reactor.
#[derive(Debug, Error)]
pub enum Error {
    /// io_uring setup or operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Ring setup failed (e.g., invalid configuration).
    #[error("ring setup: {0}")]
    RingSetup(String),
    /// Socket table is full.
    #[error("socket limit reached")]
    SocketLimitReached,
    /// Operation on an fd that was never registered (or already removed).
    #[error("unknown socket")]
    UnknownSocket,
}
