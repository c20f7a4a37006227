//! wireline — readiness event loop for high-concurrency network clients.
//!
//! A [`Reactor`] multiplexes many non-blocking sockets and a single
//! replaceable deadline timer on an io_uring instance used in readiness
//! mode (one-shot poll operations rather than completion-mode I/O). The
//! transport layer that owns the sockets plugs in through [`EventHandler`]
//! and performs the actual reads and writes itself when told a socket is
//! ready.
//!
//! `run()` can be entered by any number of worker threads. One of them at a
//! time waits on the ring; the rest execute dispatched closures and deliver
//! queued readiness events, so completion work is spread over whichever
//! workers are free.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wireline::{Config, EventHandler, Reactor, Ready};
//!
//! struct Transport;
//!
//! impl EventHandler for Transport {
//!     fn socket_ready(&self, fd: std::os::fd::RawFd, ready: Ready) {
//!         // read/write the socket, then re-arm:
//!         // reactor.watch(fd, Interest::Readable)
//!         let _ = (fd, ready);
//!     }
//!     fn timer_expired(&self) {}
//! }
//!
//! fn main() -> Result<(), wireline::Error> {
//!     let reactor = Arc::new(Reactor::new(Config::default())?);
//!     let transport = Arc::new(Transport);
//!     let transport_dyn: Arc<dyn EventHandler> = transport.clone();
//!     let weak: std::sync::Weak<dyn EventHandler> = Arc::downgrade(&transport_dyn);
//!     reactor.set_handler(weak);
//!     reactor.run()
//! }
//! ```
//!
//! # Platform
//!
//! Linux 5.6+ (io_uring with `PollAdd`, `Timeout`, and `AsyncCancel`).

pub(crate) mod completion;
pub(crate) mod ring;

pub mod config;
pub mod error;
pub mod metrics;
pub mod reactor;

/// Runtime configuration.
pub use config::Config;
/// Builder for [`Config`] with `build()` validation.
pub use config::ConfigBuilder;
/// Reactor errors.
pub use error::Error;
/// Sink for readiness and timer events.
pub use reactor::EventHandler;
/// Socket interest: which readiness to wait for.
pub use reactor::Interest;
/// The event loop.
pub use reactor::Reactor;
/// Readiness bitmask delivered to the handler.
pub use reactor::Ready;
