//! The process-wide transport pool and the shared session cache.
//!
//! The pool bounds the number of live transports; acquisition waits on a
//! condition variable when the bound is reached. Every transport carries an
//! `Arc` of the shared cache (DNS entries, TLS client configs with their
//! in-memory resumption state, cookies), which therefore outlives every
//! live transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::transfer::Conn;

/// Engine default pool capacity.
pub const DEFAULT_CAPACITY: usize = 100;

/// Default wait for a free transport before the request fails with a
/// timeout.
pub const DEFAULT_ACQUIRE_WAIT: Duration = Duration::from_millis(1);

const DNS_TTL: Duration = Duration::from_secs(60);

// ── Session cache ───────────────────────────────────────────────────

struct DnsEntry {
    addrs: Vec<SocketAddr>,
    expires: Instant,
}

struct Cookie {
    host: String,
    name: String,
    value: String,
}

/// Shared across every transport of a pool: resolved addresses, TLS client
/// configurations (rustls keeps its session resumption cache inside the
/// config), and cookies.
pub(crate) struct SessionCache {
    dns: Mutex<HashMap<(String, u16), DnsEntry>>,
    tls_configs: Mutex<HashMap<(bool, bool), Arc<rustls::ClientConfig>>>,
    cookies: Mutex<Vec<Cookie>>,
}

impl SessionCache {
    fn new() -> SessionCache {
        SessionCache {
            dns: Mutex::new(HashMap::new()),
            tls_configs: Mutex::new(HashMap::new()),
            cookies: Mutex::new(Vec::new()),
        }
    }

    pub fn lookup_dns(&self, host: &str, port: u16) -> Option<Vec<SocketAddr>> {
        let dns = self.dns.lock().unwrap();
        let entry = dns.get(&(host.to_string(), port))?;
        if entry.expires < Instant::now() {
            return None;
        }
        Some(entry.addrs.clone())
    }

    pub fn store_dns(&self, host: &str, port: u16, addrs: Vec<SocketAddr>) {
        let mut dns = self.dns.lock().unwrap();
        dns.insert(
            (host.to_string(), port),
            DnsEntry {
                addrs,
                expires: Instant::now() + DNS_TTL,
            },
        );
    }

    /// The TLS client config for the given verification flags, built on
    /// first use and cached so resumption tickets are shared.
    pub fn client_config(&self, verify_peer: bool, verify_host: bool) -> Arc<rustls::ClientConfig> {
        let mut configs = self.tls_configs.lock().unwrap();
        configs
            .entry((verify_peer, verify_host))
            .or_insert_with(|| build_client_config(verify_peer, verify_host))
            .clone()
    }

    /// Record the `name=value` part of a `Set-Cookie` line for `host`.
    pub fn store_cookie(&self, host: &str, set_cookie: &str) {
        let pair = set_cookie.split(';').next().unwrap_or("");
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return;
        }
        let mut cookies = self.cookies.lock().unwrap();
        cookies.retain(|c| !(c.host == host && c.name == name));
        cookies.push(Cookie {
            host: host.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    /// The `Cookie` header value for `host`, if any cookies are stored.
    pub fn cookie_header(&self, host: &str) -> Option<String> {
        let cookies = self.cookies.lock().unwrap();
        let mut out = String::new();
        for cookie in cookies.iter().filter(|c| c.host == host) {
            if !out.is_empty() {
                out.push_str("; ");
            }
            out.push_str(&cookie.name);
            out.push('=');
            out.push_str(&cookie.value);
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

fn webpki_roots_store() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

fn build_client_config(verify_peer: bool, verify_host: bool) -> Arc<rustls::ClientConfig> {
    let mut config = if !verify_peer {
        // No chain verification at all; host verification is moot.
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
            .with_no_client_auth()
    } else if !verify_host {
        let inner = rustls::client::WebPkiServerVerifier::builder(Arc::new(webpki_roots_store()))
            .build()
            .expect("webpki verifier construction cannot fail with non-empty roots");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoHostVerification { inner }))
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .with_root_certificates(webpki_roots_store())
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::client::WebPkiServerVerifier;
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{CertificateError, DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any certificate. Selected by `ssl.verify_peer = false`.
    #[derive(Debug)]
    pub(super) struct NoVerification {
        provider: Arc<CryptoProvider>,
    }

    impl NoVerification {
        pub fn new() -> NoVerification {
            NoVerification {
                provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
            }
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    /// Verifies the chain but tolerates a host-name mismatch. Selected by
    /// `ssl.verify_host = false`.
    #[derive(Debug)]
    pub(super) struct NoHostVerification {
        pub inner: Arc<WebPkiServerVerifier>,
    }

    impl ServerCertVerifier for NoHostVerification {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            match self.inner.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Err(Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                    Ok(ServerCertVerified::assertion())
                }
                Err(Error::InvalidCertificate(CertificateError::NotValidForNameContext {
                    ..
                })) => Ok(ServerCertVerified::assertion()),
                other => other,
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            self.inner.verify_tls12_signature(message, cert, dss)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            self.inner.verify_tls13_signature(message, cert, dss)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.inner.supported_verify_schemes()
        }
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// A reusable transport handle: the shared cache plus, between exchanges,
/// the kept-alive connection of the previous one.
pub struct Transport {
    pub(crate) cache: Arc<SessionCache>,
    pool: Weak<Pool>,
    pub(crate) conn: Option<Conn>,
}

impl Transport {
    fn new(cache: Arc<SessionCache>, pool: Weak<Pool>) -> Transport {
        Transport {
            cache,
            pool,
            conn: None,
        }
    }

    /// Reset per-request state on reuse. Options live in the transfer,
    /// which is rebuilt for every request; the kept-alive connection and
    /// the shared cache survive deliberately.
    fn reset(&mut self) {}

    /// Return this transport to its pool.
    pub(crate) fn release(self: Box<Self>) {
        if let Some(pool) = self.pool.upgrade() {
            pool.push_idle(self);
        }
        // With the pool gone the drop below balances the live count.
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // Only reached when a transport dies outside the idle list (panic
        // unwind, engine teardown). Free the capacity it held.
        if let Some(pool) = self.pool.upgrade() {
            pool.note_transport_dropped();
        }
    }
}

// ── Pool ────────────────────────────────────────────────────────────

struct PoolInner {
    idle: Vec<Box<Transport>>,
    live: usize,
}

/// A bounded pool of reusable transports with a shared session cache.
pub struct Pool {
    inner: Mutex<PoolInner>,
    available: Condvar,
    capacity: usize,
    cache: Arc<SessionCache>,
    self_weak: Weak<Pool>,
}

impl Pool {
    /// Create an isolated pool with the given capacity.
    pub fn new(capacity: usize) -> Arc<Pool> {
        Arc::new_cyclic(|weak| Pool {
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                live: 0,
            }),
            available: Condvar::new(),
            capacity,
            cache: Arc::new(SessionCache::new()),
            self_weak: weak.clone(),
        })
    }

    /// The process-wide pool, created lazily on first use.
    pub fn shared() -> Arc<Pool> {
        static SHARED: OnceLock<Arc<Pool>> = OnceLock::new();
        SHARED.get_or_init(|| Pool::new(DEFAULT_CAPACITY)).clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().live
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().unwrap().idle.len()
    }

    pub(crate) fn cache(&self) -> Arc<SessionCache> {
        self.cache.clone()
    }

    /// Acquire a transport: pop an idle one, create a fresh one below
    /// capacity, or wait up to `timeout` for a release. `None` on timeout;
    /// the caller fails the request with a timeout error.
    pub fn acquire_or_wait_for(&self, timeout: Duration) -> Option<Box<Transport>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(mut transport) = inner.idle.pop() {
                transport.reset();
                return Some(transport);
            }
            if inner.live < self.capacity {
                inner.live += 1;
                return Some(Box::new(Transport::new(
                    self.cache.clone(),
                    self.self_weak.clone(),
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                crate::metrics::POOL_ACQUIRE_TIMEOUTS.increment();
                return None;
            }
            // Re-check on spurious wake-ups.
            let (guard, _) = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
    }

    fn push_idle(&self, transport: Box<Transport>) {
        let mut inner = self.inner.lock().unwrap();
        inner.idle.push(transport);
        self.available.notify_one();
    }

    fn note_transport_dropped(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.live = inner.live.saturating_sub(1);
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_up_to_capacity() {
        let pool = Pool::new(2);
        let a = pool.acquire_or_wait_for(Duration::from_millis(1)).unwrap();
        let b = pool.acquire_or_wait_for(Duration::from_millis(1)).unwrap();
        assert_eq!(pool.live_count(), 2);
        assert!(pool.acquire_or_wait_for(Duration::from_millis(5)).is_none());
        a.release();
        b.release();
    }

    #[test]
    fn release_wakes_a_waiter() {
        let pool = Pool::new(1);
        let held = pool.acquire_or_wait_for(Duration::from_millis(1)).unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire_or_wait_for(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        held.release();

        let reacquired = waiter.join().unwrap();
        assert!(reacquired.is_some());
        assert_eq!(pool.live_count(), 1);
        reacquired.unwrap().release();
    }

    #[test]
    fn dropping_a_transport_frees_capacity() {
        let pool = Pool::new(1);
        let transport = pool.acquire_or_wait_for(Duration::from_millis(1)).unwrap();
        drop(transport);
        assert_eq!(pool.live_count(), 0);
        assert!(pool
            .acquire_or_wait_for(Duration::from_millis(1))
            .is_some());
    }

    #[test]
    fn reuse_prefers_idle_transports() {
        let pool = Pool::new(4);
        let transport = pool.acquire_or_wait_for(Duration::from_millis(1)).unwrap();
        transport.release();
        assert_eq!(pool.idle_count(), 1);
        let _again = pool.acquire_or_wait_for(Duration::from_millis(1)).unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn cookies_round_trip_per_host() {
        let cache = SessionCache::new();
        cache.store_cookie("example.org", "session=abc123; Path=/; HttpOnly");
        cache.store_cookie("example.org", "theme=dark");
        cache.store_cookie("other.org", "session=zzz");

        let header = cache.cookie_header("example.org").unwrap();
        assert!(header.contains("session=abc123"));
        assert!(header.contains("theme=dark"));
        assert!(!header.contains("zzz"));
        assert!(cache.cookie_header("missing.org").is_none());
    }

    #[test]
    fn cookie_overwrites_same_name() {
        let cache = SessionCache::new();
        cache.store_cookie("h", "k=1");
        cache.store_cookie("h", "k=2");
        assert_eq!(cache.cookie_header("h").unwrap(), "k=2");
    }

    #[test]
    fn dns_cache_round_trips() {
        let cache = SessionCache::new();
        assert!(cache.lookup_dns("example.org", 80).is_none());
        let addrs: Vec<SocketAddr> = vec!["93.184.216.34:80".parse().unwrap()];
        cache.store_dns("example.org", 80, addrs.clone());
        assert_eq!(cache.lookup_dns("example.org", 80).unwrap(), addrs);
        assert!(cache.lookup_dns("example.org", 443).is_none());
    }
}
