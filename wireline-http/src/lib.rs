//! wireline-http — an HTTP/1.1 client engine on the wireline reactor.
//!
//! The engine issues requests over TCP (plain or TLS via rustls), pools
//! and reuses transports process-wide, and exposes both synchronous
//! (blocking) and asynchronous (event-driven) execution with streaming
//! bodies, progress callbacks, pause/resume, low-speed aborts, and
//! basic/digest authentication.
//!
//! # Synchronous
//!
//! ```rust,no_run
//! use wireline_http::{Client, Configuration, Next};
//!
//! fn main() -> Result<(), wireline_http::Error> {
//!     let client = Client::new()?;
//!     let config = Configuration::from_uri_as_string("http://example.org/get");
//!     let response = client.get(&config)?.execute(|_| Next::ContinueOperation)?;
//!     assert_eq!(response.status.code(), 200);
//!     Ok(())
//! }
//! ```
//!
//! # Asynchronous
//!
//! ```rust,no_run
//! use wireline_http::{Client, Configuration, Handler};
//!
//! fn main() -> Result<(), wireline_http::Error> {
//!     let client = std::sync::Arc::new(Client::new()?);
//!     let worker = {
//!         let client = client.clone();
//!         std::thread::spawn(move || client.run())
//!     };
//!
//!     let config = Configuration::from_uri_as_string("http://example.org/get");
//!     client.get(&config)?.async_execute(
//!         Handler::new()
//!             .on_response(|response| println!("{}", response.status))
//!             .on_error(|error| eprintln!("{error}")),
//!     )?;
//!
//!     client.stop();
//!     worker.join().unwrap()?;
//!     Ok(())
//! }
//! ```

mod auth;
mod engine;
mod md5;
mod transfer;

pub mod client;
pub mod codec;
pub mod content_type;
pub mod error;
pub mod header;
pub mod method;
pub mod metrics;
pub mod pool;
pub mod request;
pub mod response;
pub mod status;
pub mod timings;
pub mod uri;

/// Username and password for basic & digest authentication.
pub use auth::Credentials;
/// The client façade.
pub use client::{
    AuthenticationHandlers, Client, ClientBuilder, Configuration, SpeedOptions, SslOptions,
};
/// Known content types.
pub use content_type::ContentType;
/// Error taxonomy and source locations.
pub use error::{Error, Location};
/// Case-insensitive multi-valued header map.
pub use header::Header;
/// HTTP request methods.
pub use method::Method;
/// The bounded transport pool.
pub use pool::Pool;
/// Request state machines and their callback types.
pub use request::{Handler, Next, Progress, Request, State, StreamingRequest, Transferred};
/// An HTTP response.
pub use response::Response;
/// HTTP status codes.
pub use status::Status;
/// Aggregate and per-transfer timings.
pub use timings::{Statistics, Timings, TransferTimings};
/// Callback type producing credentials for a challenged request.
pub use transfer::AuthenticationHandler;
/// RFC 3986 URI value type and builder.
pub use uri::{Authority, Host, Uri, UriBuilder};
