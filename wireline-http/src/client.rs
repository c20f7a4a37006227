//! The client façade: request construction by method, reactor control,
//! aggregate timings, and codec helpers.

use std::io::Read;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use wireline::Reactor;

use crate::codec;
use crate::content_type::ContentType;
use crate::engine::Engine;
use crate::error::Error;
use crate::header::Header;
use crate::here;
use crate::method::Method;
use crate::pool::{Pool, DEFAULT_ACQUIRE_WAIT};
use crate::request::{Request, RequestCore, StreamingRequest};
use crate::timings::Timings;
use crate::transfer::{AuthenticationHandler, BodySource, Callbacks, Options, Transfer};
use crate::uri::Uri;

/// The default User-Agent sent when the request header has none.
pub const USER_AGENT: &str = concat!("wireline/", env!("CARGO_PKG_VERSION"));

/// TLS verification options. Both default on; disabling either is an
/// explicit per-request choice.
#[derive(Debug, Clone)]
pub struct SslOptions {
    pub verify_peer: bool,
    pub verify_host: bool,
}

impl Default for SslOptions {
    fn default() -> Self {
        SslOptions {
            verify_peer: true,
            verify_host: true,
        }
    }
}

/// Credential callbacks for challenged requests.
#[derive(Clone, Default)]
pub struct AuthenticationHandlers {
    /// Invoked on a 401 from the origin.
    pub for_http: Option<AuthenticationHandler>,
    /// Invoked on a 407 from a proxy.
    pub for_proxy: Option<AuthenticationHandler>,
}

/// Minimum-throughput thresholds: abort when below `limit` bytes/second
/// for `duration`.
#[derive(Debug, Clone)]
pub struct SpeedOptions {
    pub limit: u64,
    pub duration: Duration,
}

impl Default for SpeedOptions {
    fn default() -> Self {
        SpeedOptions {
            limit: 1,
            duration: Duration::from_secs(30),
        }
    }
}

/// All options for creating a request.
#[derive(Clone, Default)]
pub struct Configuration {
    /// Target resource in string form.
    pub uri: String,
    /// Custom header fields added to the request.
    pub header: Header,
    pub ssl: SslOptions,
    pub authentication_handler: AuthenticationHandlers,
    pub speed: SpeedOptions,
}

impl Configuration {
    /// A configuration for `uri` with everything else at defaults.
    pub fn from_uri_as_string(uri: impl Into<String>) -> Configuration {
        Configuration {
            uri: uri.into(),
            ..Configuration::default()
        }
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    pool: Option<Arc<Pool>>,
    acquire_timeout: Duration,
    reactor_config: wireline::Config,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            pool: None,
            acquire_timeout: DEFAULT_ACQUIRE_WAIT,
            reactor_config: wireline::Config::default(),
        }
    }
}

impl ClientBuilder {
    pub fn new() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Use an isolated pool instead of the process-wide one.
    pub fn pool(mut self, pool: Arc<Pool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// How long request creation waits for a free pooled transport.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn reactor_config(mut self, config: wireline::Config) -> Self {
        self.reactor_config = config;
        self
    }

    pub fn build(self) -> Result<Client, Error> {
        let reactor = Arc::new(Reactor::new(self.reactor_config).map_err(|e| Error::Http {
            description: format!("reactor setup: {e}"),
            location: here!(),
        })?);
        let engine = Engine::new(reactor.clone());
        Ok(Client {
            reactor,
            engine,
            pool: self.pool.unwrap_or_else(Pool::shared),
            acquire_timeout: self.acquire_timeout,
        })
    }
}

/// An HTTP client: a reactor, the engine driving in-flight transfers, and
/// a (usually shared) transport pool.
///
/// `execute` works without any running reactor thread; `async_execute`
/// requires at least one thread inside [`run`](Client::run).
pub struct Client {
    reactor: Arc<Reactor>,
    engine: Arc<Engine>,
    pool: Arc<Pool>,
    acquire_timeout: Duration,
}

impl Client {
    /// A client over the process-wide pool.
    pub fn new() -> Result<Client, Error> {
        ClientBuilder::new().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Run the reactor on the calling thread until [`stop`](Client::stop).
    /// Call from as many worker threads as desired.
    pub fn run(&self) -> Result<(), Error> {
        self.reactor.run().map_err(|e| Error::Http {
            description: format!("reactor: {e}"),
            location: here!(),
        })
    }

    /// Abort all in-flight requests (they finish with `AbortedByCallback`)
    /// and make every `run()` return.
    pub fn stop(&self) {
        self.engine.abort_all();
        self.reactor.stop();
    }

    /// Timing statistics over all requests completed by this client.
    pub fn timings(&self) -> Timings {
        self.engine.timings()
    }

    // ── Request constructors ────────────────────────────────────────

    pub fn get(&self, config: &Configuration) -> Result<Request, Error> {
        Ok(Request::new(self.build_core(
            Method::Get,
            config,
            BodySource::Empty,
            None,
        )?))
    }

    pub fn head(&self, config: &Configuration) -> Result<Request, Error> {
        Ok(Request::new(self.build_core(
            Method::Head,
            config,
            BodySource::Empty,
            None,
        )?))
    }

    pub fn del(&self, config: &Configuration) -> Result<Request, Error> {
        Ok(Request::new(self.build_core(
            Method::Del,
            config,
            BodySource::Empty,
            None,
        )?))
    }

    /// POST an in-memory payload with the given content type.
    pub fn post(
        &self,
        config: &Configuration,
        payload: impl Into<Bytes>,
        content_type: &str,
    ) -> Result<Request, Error> {
        Ok(Request::new(self.build_core(
            Method::Post,
            config,
            BodySource::Buffer(payload.into()),
            Some(content_type),
        )?))
    }

    /// POST from a reader. `size` is the declared Content-Length; `None`
    /// selects chunked transfer encoding.
    pub fn post_stream(
        &self,
        config: &Configuration,
        payload: impl Read + Send + 'static,
        size: Option<u64>,
    ) -> Result<Request, Error> {
        Ok(Request::new(self.build_core(
            Method::Post,
            config,
            BodySource::Reader {
                reader: Box::new(payload),
                len: size,
            },
            None,
        )?))
    }

    /// PUT from a reader. `size` is the declared Content-Length; `None`
    /// selects chunked transfer encoding.
    pub fn put(
        &self,
        config: &Configuration,
        payload: impl Read + Send + 'static,
        size: Option<u64>,
    ) -> Result<Request, Error> {
        Ok(Request::new(self.build_core(
            Method::Put,
            config,
            BodySource::Reader {
                reader: Box::new(payload),
                len: size,
            },
            None,
        )?))
    }

    /// POST key/value pairs as `application/x-www-form-urlencoded`, each
    /// side URL-escaped, in the given order.
    pub fn post_form(
        &self,
        config: &Configuration,
        values: &[(&str, &str)],
    ) -> Result<Request, Error> {
        self.post(
            config,
            form_encode(values),
            ContentType::X_WWW_FORM_URLENCODED,
        )
    }

    // ── Streaming twins ─────────────────────────────────────────────

    pub fn streaming_get(&self, config: &Configuration) -> Result<StreamingRequest, Error> {
        Ok(StreamingRequest::new(self.build_core(
            Method::Get,
            config,
            BodySource::Empty,
            None,
        )?))
    }

    pub fn streaming_head(&self, config: &Configuration) -> Result<StreamingRequest, Error> {
        Ok(StreamingRequest::new(self.build_core(
            Method::Head,
            config,
            BodySource::Empty,
            None,
        )?))
    }

    pub fn streaming_del(&self, config: &Configuration) -> Result<StreamingRequest, Error> {
        Ok(StreamingRequest::new(self.build_core(
            Method::Del,
            config,
            BodySource::Empty,
            None,
        )?))
    }

    pub fn streaming_post(
        &self,
        config: &Configuration,
        payload: impl Into<Bytes>,
        content_type: &str,
    ) -> Result<StreamingRequest, Error> {
        Ok(StreamingRequest::new(self.build_core(
            Method::Post,
            config,
            BodySource::Buffer(payload.into()),
            Some(content_type),
        )?))
    }

    pub fn streaming_post_stream(
        &self,
        config: &Configuration,
        payload: impl Read + Send + 'static,
        size: Option<u64>,
    ) -> Result<StreamingRequest, Error> {
        Ok(StreamingRequest::new(self.build_core(
            Method::Post,
            config,
            BodySource::Reader {
                reader: Box::new(payload),
                len: size,
            },
            None,
        )?))
    }

    pub fn streaming_put(
        &self,
        config: &Configuration,
        payload: impl Read + Send + 'static,
        size: Option<u64>,
    ) -> Result<StreamingRequest, Error> {
        Ok(StreamingRequest::new(self.build_core(
            Method::Put,
            config,
            BodySource::Reader {
                reader: Box::new(payload),
                len: size,
            },
            None,
        )?))
    }

    pub fn streaming_post_form(
        &self,
        config: &Configuration,
        values: &[(&str, &str)],
    ) -> Result<StreamingRequest, Error> {
        self.streaming_post(
            config,
            form_encode(values),
            ContentType::X_WWW_FORM_URLENCODED,
        )
    }

    // ── Codecs ──────────────────────────────────────────────────────

    /// Percent-encode everything outside the unreserved set.
    pub fn url_escape(&self, input: &str) -> String {
        codec::url_escape(input.as_bytes())
    }

    /// Invert [`url_escape`](Client::url_escape).
    pub fn url_unescape(&self, input: &str) -> Vec<u8> {
        codec::url_unescape(input)
    }

    pub fn base64_encode(&self, input: impl AsRef<[u8]>) -> String {
        codec::base64_encode(input.as_ref())
    }

    pub fn base64_decode(&self, input: &str) -> Result<Vec<u8>, Error> {
        codec::base64_decode(input)
    }

    /// Canonical string form of a URI.
    pub fn uri_to_string(&self, uri: &Uri) -> String {
        uri.to_string()
    }

    // ── Internals ───────────────────────────────────────────────────

    fn build_core(
        &self,
        method: Method,
        config: &Configuration,
        body: BodySource,
        content_type: Option<&str>,
    ) -> Result<RequestCore, Error> {
        let uri = Uri::from_string(&config.uri)?;

        let transport = self
            .pool
            .acquire_or_wait_for(self.acquire_timeout)
            .ok_or_else(|| Error::OperationTimedOut {
                reason: "timed out waiting for a pooled transport".into(),
                location: here!(),
            })?;

        let mut header = config.header.clone();
        if let Some(content_type) = content_type {
            if !header.has("Content-Type") {
                header.set("Content-Type", content_type);
            }
        }

        let options = Options {
            method,
            uri,
            header,
            body,
            verify_peer: config.ssl.verify_peer,
            verify_host: config.ssl.verify_host,
            http_credentials: config.authentication_handler.for_http.clone(),
            proxy_credentials: config.authentication_handler.for_proxy.clone(),
            low_speed_limit: config.speed.limit,
            low_speed_duration: config.speed.duration,
            timeout: None,
            user_agent: USER_AGENT.to_string(),
        };

        let paused = Arc::new(AtomicBool::new(false));
        let transfer = Transfer::new(transport, options, Callbacks::default(), paused.clone());
        Ok(RequestCore::new(transfer, paused, self.engine.clone()))
    }
}

fn form_encode(values: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for (i, (key, value)) in values.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(&codec::url_escape(key.as_bytes()));
        out.push('=');
        out.push_str(&codec::url_escape(value.as_bytes()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_encoding_escapes_both_sides_in_order() {
        assert_eq!(form_encode(&[("test", "test")]), "test=test");
        assert_eq!(
            form_encode(&[("hello there", "good bye"), ("happy", "sad")]),
            "hello%20there=good%20bye&happy=sad"
        );
        assert_eq!(form_encode(&[]), "");
    }

    #[test]
    fn configuration_defaults() {
        let config = Configuration::from_uri_as_string("http://example.org");
        assert_eq!(config.uri, "http://example.org");
        assert!(config.ssl.verify_peer);
        assert!(config.ssl.verify_host);
        assert_eq!(config.speed.limit, 1);
        assert_eq!(config.speed.duration, Duration::from_secs(30));
        assert!(config.header.is_empty());
    }

    #[test]
    fn malformed_uri_fails_request_creation() {
        let client = Client::builder()
            .pool(Pool::new(2))
            .build()
            .expect("client");
        let config = Configuration::from_uri_as_string("http://bad host/");
        let err = client.get(&config).err().expect("creation should fail");
        assert!(matches!(err, Error::MalformedUri { .. }));
    }

    #[test]
    fn uri_to_string_is_canonical() {
        let client = Client::builder()
            .pool(Pool::new(2))
            .build()
            .expect("client");
        let uri = Uri::with_base("http://banana.fruit")
            .unwrap()
            .path_component("my")
            .path_component("endpoint")
            .query_pair("hello there", "good bye")
            .query_pair("happy", "sad")
            .build();
        assert_eq!(
            client.uri_to_string(&uri),
            "http://banana.fruit/my/endpoint?hello%20there=good%20bye&happy=sad"
        );
    }
}
