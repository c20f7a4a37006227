//! The per-exchange transfer state machine.
//!
//! A [`Transfer`] owns one HTTP/1.1 exchange end to end: resolve, connect,
//! TLS handshake, request emission, response parsing. `drive(ready)` has no
//! reactor knowledge; it consumes a readiness hint and reports the next
//! interest and deadline, so the same machine is driven by the engine
//! (async) and by a blocking poll loop (sync).

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use wireline::{Interest, Ready};

use crate::auth::{self, Credentials};
use crate::error::Error;
use crate::header::Header;
use crate::here;
use crate::method::Method;
use crate::metrics;
use crate::pool::Transport;
use crate::request::{Next, Progress, Transferred};
use crate::status::Status;
use crate::timings::TransferTimings;
use crate::uri::{Host, Uri};

const READ_CHUNK: usize = 16 * 1024;
const BODY_CHUNK: usize = 16 * 1024;

/// Callback invoked to obtain credentials for a challenged request.
pub type AuthenticationHandler = Arc<dyn Fn(&str) -> Credentials + Send + Sync>;

/// Where the request body comes from.
pub(crate) enum BodySource {
    Empty,
    Buffer(Bytes),
    Reader {
        reader: Box<dyn Read + Send>,
        /// Declared size; `None` selects chunked transfer encoding.
        len: Option<u64>,
    },
}

impl BodySource {
    fn len(&self) -> Option<u64> {
        match self {
            BodySource::Empty => Some(0),
            BodySource::Buffer(data) => Some(data.len() as u64),
            BodySource::Reader { len, .. } => *len,
        }
    }

    /// Whether the body can be sent a second time (auth replay).
    fn is_replayable(&self) -> bool {
        !matches!(self, BodySource::Reader { .. })
    }
}

/// Everything configured on the handle before execution.
pub(crate) struct Options {
    pub method: Method,
    pub uri: Uri,
    pub header: Header,
    pub body: BodySource,
    pub verify_peer: bool,
    pub verify_host: bool,
    pub http_credentials: Option<AuthenticationHandler>,
    pub proxy_credentials: Option<AuthenticationHandler>,
    /// Abort when throughput stays below `low_speed_limit` B/s for
    /// `low_speed_duration`.
    pub low_speed_limit: u64,
    pub low_speed_duration: Duration,
    pub timeout: Option<Duration>,
    pub user_agent: String,
}

/// The five per-handle callbacks (the read side is the body source).
#[derive(Default)]
pub(crate) struct Callbacks {
    pub on_progress: Option<Box<dyn FnMut(&Progress) -> Next + Send>>,
    pub on_write_data: Option<Box<dyn FnMut(&[u8]) -> usize + Send>>,
    pub on_write_header: Option<Box<dyn FnMut(&[u8]) -> usize + Send>>,
    pub on_finished: Option<Box<dyn FnOnce(Result<Status, Error>) + Send>>,
}

/// A live connection, possibly kept alive across exchanges.
pub(crate) struct Conn {
    stream: TcpStream,
    tls: Option<Box<rustls::ClientConnection>>,
    key: (bool, String, u16),
}

impl Conn {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Connecting,
    TlsHandshake,
    SendRequest,
    RecvStatus,
    RecvHeaders,
    RecvBody,
    /// Consuming the body of a 401/407 before replaying with credentials.
    DrainAuthBody,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkDecoder {
    Size,
    Data { remaining: u64 },
    DataCrlf,
    Trailer,
    Done,
}

#[derive(Default)]
struct RespState {
    status_code: u16,
    status: Option<Status>,
    in_interim: bool,
    saw_first_byte: bool,
    content_length: Option<u64>,
    chunked: bool,
    chunk: Option<ChunkDecoder>,
    connection_close: bool,
    close_delimited: bool,
    no_body: bool,
    body_received: u64,
    challenges: Vec<String>,
}

#[derive(Default, Clone, Copy)]
struct TimingMarks {
    start: Option<Instant>,
    resolved: Option<Instant>,
    connected: Option<Instant>,
    app_connect: Option<Instant>,
    pre_transfer: Option<Instant>,
    first_byte: Option<Instant>,
}

/// What `drive` wants next.
pub(crate) enum DriveStatus {
    Continue {
        interest: Interest,
        deadline: Option<Instant>,
    },
    Finished,
}

enum Step {
    Blocked(Interest),
    Again,
    Complete(Status),
}

pub(crate) struct Transfer {
    transport: Option<Box<Transport>>,
    opts: Options,
    callbacks: Callbacks,
    paused: Arc<AtomicBool>,

    phase: Phase,
    conn: Option<Conn>,
    reused_conn: bool,
    retried_conn: bool,
    allow_reuse: bool,

    addrs: Vec<SocketAddr>,
    addr_idx: usize,

    out_buf: Vec<u8>,
    out_pos: usize,
    body_sent: u64,
    body_done: bool,
    stage: Vec<u8>,
    stage_pos: usize,
    last_chunk_staged: bool,

    in_buf: Vec<u8>,
    scratch: Vec<u8>,
    resp: RespState,

    auth_attempted: bool,
    pending_auth: Option<(&'static str, String)>,

    deadline: Option<Instant>,
    window_start: Option<Instant>,
    window_bytes: u64,
    total_bytes: u64,
    was_paused: bool,

    dl_now: u64,
    ul_now: u64,

    timing: TimingMarks,
    timings_out: TransferTimings,
    finished: Option<Result<Status, Error>>,
}

impl Transfer {
    pub fn new(
        transport: Box<Transport>,
        opts: Options,
        callbacks: Callbacks,
        paused: Arc<AtomicBool>,
    ) -> Transfer {
        Transfer {
            transport: Some(transport),
            opts,
            callbacks,
            paused,
            phase: Phase::Start,
            conn: None,
            reused_conn: false,
            retried_conn: false,
            allow_reuse: true,
            addrs: Vec::new(),
            addr_idx: 0,
            out_buf: Vec::with_capacity(512),
            out_pos: 0,
            body_sent: 0,
            body_done: false,
            stage: Vec::new(),
            stage_pos: 0,
            last_chunk_staged: false,
            in_buf: Vec::new(),
            scratch: vec![0u8; READ_CHUNK],
            resp: RespState::default(),
            auth_attempted: false,
            pending_auth: None,
            deadline: None,
            window_start: None,
            window_bytes: 0,
            total_bytes: 0,
            was_paused: false,
            dl_now: 0,
            ul_now: 0,
            timing: TimingMarks::default(),
            timings_out: TransferTimings::default(),
            finished: None,
        }
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.conn.as_ref().map(Conn::fd)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// End the transfer as aborted (client stop, reactor removal).
    pub fn abort(&mut self) {
        if self.finished.is_none() {
            self.finish(Err(Error::AbortedByCallback { location: here!() }));
        }
    }

    pub fn take_timings(&self) -> TransferTimings {
        self.timings_out
    }

    pub fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }

    /// Overall deadline. `None` waits forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.opts.timeout = timeout;
    }

    /// Low-speed abort threshold. A limit of 0 disables the check.
    pub fn set_low_speed(&mut self, limit: u64, duration: Duration) {
        self.opts.low_speed_limit = limit;
        self.opts.low_speed_duration = duration;
    }

    /// Take the stored outcome (sync execution path).
    pub fn take_result(&mut self) -> Result<Status, Error> {
        self.finished.take().unwrap_or_else(|| {
            Err(Error::Http {
                description: "transfer produced no result".into(),
                location: here!(),
            })
        })
    }

    /// Invoke the finished callback exactly once with the stored result.
    pub fn notify_finished(&mut self) {
        let result = self
            .finished
            .take()
            .unwrap_or_else(|| Err(Error::AbortedByCallback { location: here!() }));
        if let Some(on_finished) = self.callbacks.on_finished.take() {
            on_finished(result);
        }
    }

    /// Return the pooled transport (and any kept-alive connection) home.
    pub fn release_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.release();
        }
    }

    /// Advance the exchange. `ready` is the readiness hint that woke us;
    /// an empty hint is a timer or kick.
    pub fn drive(&mut self, ready: Ready) -> DriveStatus {
        if self.finished.is_some() {
            return DriveStatus::Finished;
        }

        if self.timing.start.is_none() {
            let now = Instant::now();
            self.timing.start = Some(now);
            self.deadline = self.opts.timeout.map(|t| now + t);
            metrics::REQUESTS_STARTED.increment();
        }

        if self.paused.load(Ordering::SeqCst) {
            self.was_paused = true;
            return DriveStatus::Continue {
                interest: Interest::None,
                deadline: self.deadline,
            };
        }
        if self.was_paused {
            // Time spent paused does not count against the speed window.
            self.was_paused = false;
            if self.window_start.is_some() {
                self.window_start = Some(Instant::now());
                self.window_bytes = self.total_bytes;
            }
        }

        let now = Instant::now();
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                self.finish(Err(Error::OperationTimedOut {
                    reason: "transfer deadline exceeded".into(),
                    location: here!(),
                }));
                return DriveStatus::Finished;
            }
        }
        if let Err(e) = self.check_low_speed(now) {
            self.finish(Err(e));
            return DriveStatus::Finished;
        }

        let mut ready = ready;
        loop {
            let step = self.step(ready);
            ready = Ready::empty();
            match step {
                Ok(Step::Blocked(interest)) => {
                    if let Err(e) = self.report_progress() {
                        self.finish(Err(e));
                        return DriveStatus::Finished;
                    }
                    // A pause request from the progress callback lands here.
                    let interest = if self.paused.load(Ordering::SeqCst) {
                        Interest::None
                    } else {
                        interest
                    };
                    return DriveStatus::Continue {
                        interest,
                        deadline: self.next_deadline(),
                    };
                }
                Ok(Step::Again) => continue,
                Ok(Step::Complete(status)) => {
                    if let Err(e) = self.report_progress() {
                        self.finish(Err(e));
                        return DriveStatus::Finished;
                    }
                    self.finish(Ok(status));
                    return DriveStatus::Finished;
                }
                Err(e) => {
                    self.finish(Err(e));
                    return DriveStatus::Finished;
                }
            }
        }
    }

    // ── Phase steps ─────────────────────────────────────────────────

    fn step(&mut self, ready: Ready) -> Result<Step, Error> {
        match self.phase {
            Phase::Start => self.step_start(),
            Phase::Connecting => self.step_connecting(ready),
            Phase::TlsHandshake => self.step_tls_handshake(),
            Phase::SendRequest => self.step_send_request(),
            Phase::RecvStatus | Phase::RecvHeaders => self.step_recv_headers(),
            Phase::RecvBody | Phase::DrainAuthBody => self.step_recv_body(),
            Phase::Done => Ok(Step::Blocked(Interest::None)),
        }
    }

    fn step_start(&mut self) -> Result<Step, Error> {
        let scheme = self.opts.uri.scheme.clone().unwrap_or_default();
        if scheme != "http" && scheme != "https" {
            return Err(Error::Http {
                description: format!("unsupported scheme {scheme:?}"),
                location: here!(),
            });
        }
        let https = scheme == "https";
        let host = match self.opts.uri.host_str() {
            Some(host) => host.to_string(),
            None => {
                return Err(Error::MalformedUri {
                    reason: "request uri has no host".into(),
                    location: here!(),
                })
            }
        };
        let port = self.opts.uri.port_or_default();
        let key = (https, host.clone(), port);

        // Reuse the kept-alive connection when it matches the target.
        if self.allow_reuse {
            if let Some(conn) = self
                .transport
                .as_mut()
                .and_then(|t| t.conn.take_if(|c| c.key == key))
            {
                let now = Instant::now();
                self.timing.resolved = Some(now);
                self.timing.connected = Some(now);
                self.timing.app_connect = Some(now);
                self.conn = Some(conn);
                self.reused_conn = true;
                self.build_request();
                self.phase = Phase::SendRequest;
                return Ok(Step::Again);
            }
        }

        self.addrs = self.resolve(&host, port)?;
        self.addr_idx = 0;
        self.timing.resolved = Some(Instant::now());
        self.connect_next(&host)?;
        Ok(Step::Blocked(Interest::Writable))
    }

    fn resolve(&mut self, host: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
        // IP literals skip the resolver entirely.
        if let Some(authority) = &self.opts.uri.authority {
            match &authority.host {
                Host::Ipv4(text) | Host::IpLiteral(text) => {
                    if let Ok(ip) = text.parse::<IpAddr>() {
                        return Ok(vec![SocketAddr::new(ip, port)]);
                    }
                    return Err(Error::CouldNotResolveHost {
                        host: host.to_string(),
                        reason: "unresolvable IP literal".into(),
                        location: here!(),
                    });
                }
                Host::Name(_) => {}
            }
        }

        let cache = self.transport.as_ref().map(|t| t.cache.clone());
        if let Some(addrs) = cache.as_ref().and_then(|c| c.lookup_dns(host, port)) {
            return Ok(addrs);
        }

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::CouldNotResolveHost {
                host: host.to_string(),
                reason: e.to_string(),
                location: here!(),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(Error::CouldNotResolveHost {
                host: host.to_string(),
                reason: "no addresses".into(),
                location: here!(),
            });
        }
        if let Some(cache) = cache {
            cache.store_dns(host, port, addrs.clone());
        }
        Ok(addrs)
    }

    fn connect_next(&mut self, host: &str) -> Result<(), Error> {
        loop {
            let Some(&addr) = self.addrs.get(self.addr_idx) else {
                return Err(Error::CouldNotConnect {
                    host: host.to_string(),
                    reason: "no address accepted the connection".into(),
                    location: here!(),
                });
            };
            self.addr_idx += 1;
            match open_socket(addr) {
                Ok(stream) => {
                    let https = self.opts.uri.is_https();
                    let port = self.opts.uri.port_or_default();
                    self.conn = Some(Conn {
                        stream,
                        tls: None,
                        key: (https, host.to_string(), port),
                    });
                    self.phase = Phase::Connecting;
                    return Ok(());
                }
                Err(e) => {
                    log::debug!("connect to {addr} failed early: {e}");
                    continue;
                }
            }
        }
    }

    fn step_connecting(&mut self, ready: Ready) -> Result<Step, Error> {
        if !ready.is_writable() && !ready.is_error() && !ready.is_readable() {
            return Ok(Step::Blocked(Interest::Writable));
        }
        let conn = self.conn.as_ref().expect("connecting without a socket");
        match connect_result(conn.fd()) {
            Ok(()) => {
                self.timing.connected = Some(Instant::now());
                if self.opts.uri.is_https() {
                    self.start_tls()?;
                    self.phase = Phase::TlsHandshake;
                } else {
                    self.timing.app_connect = self.timing.connected;
                    self.build_request();
                    self.phase = Phase::SendRequest;
                }
                Ok(Step::Again)
            }
            Err(e) => {
                log::debug!("connect failed: {e}");
                let host = self.conn.take().map(|c| c.key.1).unwrap_or_default();
                if self.addr_idx < self.addrs.len() {
                    self.connect_next(&host)?;
                    Ok(Step::Blocked(Interest::Writable))
                } else {
                    Err(Error::CouldNotConnect {
                        host,
                        reason: e.to_string(),
                        location: here!(),
                    })
                }
            }
        }
    }

    fn start_tls(&mut self) -> Result<(), Error> {
        let host = self.opts.uri.host_str().unwrap_or_default().to_string();
        let config = self
            .transport
            .as_ref()
            .expect("transport present before release")
            .cache
            .client_config(self.opts.verify_peer, self.opts.verify_host);
        let server_name = rustls::pki_types::ServerName::try_from(host.clone()).map_err(|e| {
            Error::SslConnectError {
                reason: format!("invalid server name {host:?}: {e}"),
                location: here!(),
            }
        })?;
        let tls = rustls::ClientConnection::new(config, server_name).map_err(|e| {
            Error::SslConnectError {
                reason: e.to_string(),
                location: here!(),
            }
        })?;
        self.conn
            .as_mut()
            .expect("socket present for tls start")
            .tls = Some(Box::new(tls));
        Ok(())
    }

    fn step_tls_handshake(&mut self) -> Result<Step, Error> {
        let outcome = {
            let conn = self.conn.as_mut().expect("handshake without a socket");
            let tls = conn.tls.as_mut().expect("handshake without tls state");
            pump_handshake(tls, &mut conn.stream)?
        };
        match outcome {
            Handshake::Complete => {
                self.timing.app_connect = Some(Instant::now());
                self.build_request();
                self.phase = Phase::SendRequest;
                Ok(Step::Again)
            }
            Handshake::Blocked(interest) => Ok(Step::Blocked(interest)),
        }
    }

    fn step_send_request(&mut self) -> Result<Step, Error> {
        if self.timing.pre_transfer.is_none() {
            self.timing.pre_transfer = Some(Instant::now());
            self.window_start = Some(Instant::now());
            self.window_bytes = self.total_bytes;
        }

        // Request head first.
        while self.out_pos < self.out_buf.len() {
            let conn = self.conn.as_mut().expect("send without a socket");
            match write_some(conn, &self.out_buf[self.out_pos..]) {
                Ok(0) => return self.handle_dead_connection("send"),
                Ok(n) => {
                    self.out_pos += n;
                    self.note_bytes(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Step::Blocked(Interest::Writable))
                }
                Err(e) if is_connection_reset(&e) => return self.handle_dead_connection("send"),
                Err(e) => {
                    return Err(Error::Http {
                        description: format!("send failed: {e}"),
                        location: here!(),
                    })
                }
            }
        }

        // Then the body.
        while !self.body_done {
            if self.stage_pos >= self.stage.len() {
                self.stage.clear();
                self.stage_pos = 0;
                if !self.fill_body_stage()? {
                    break;
                }
            }
            let conn = self.conn.as_mut().expect("send without a socket");
            match write_some(conn, &self.stage[self.stage_pos..]) {
                Ok(0) => return self.handle_dead_connection("send body"),
                Ok(n) => {
                    self.stage_pos += n;
                    self.note_bytes(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Step::Blocked(Interest::Writable))
                }
                Err(e) if is_connection_reset(&e) => {
                    return self.handle_dead_connection("send body")
                }
                Err(e) => {
                    return Err(Error::Http {
                        description: format!("send failed: {e}"),
                        location: here!(),
                    })
                }
            }
        }

        self.phase = Phase::RecvStatus;
        Ok(Step::Again)
    }

    /// Stage the next block of body bytes. Returns false when the body is
    /// fully staged and sent.
    fn fill_body_stage(&mut self) -> Result<bool, Error> {
        let mut staged_ul: usize = 0;
        match &mut self.opts.body {
            BodySource::Empty => {
                self.body_done = true;
                return Ok(false);
            }
            BodySource::Buffer(data) => {
                if self.body_sent >= data.len() as u64 {
                    self.body_done = true;
                    return Ok(false);
                }
                let start = self.body_sent as usize;
                let end = (start + BODY_CHUNK).min(data.len());
                self.stage.extend_from_slice(&data[start..end]);
                staged_ul = end - start;
            }
            BodySource::Reader { reader, len } => match *len {
                Some(total) => {
                    if self.body_sent >= total {
                        self.body_done = true;
                        return Ok(false);
                    }
                    let want = ((total - self.body_sent) as usize).min(BODY_CHUNK);
                    let mut block = vec![0u8; want];
                    let n = read_full(reader, &mut block).map_err(|e| Error::Http {
                        description: format!("body read failed: {e}"),
                        location: here!(),
                    })?;
                    if n == 0 {
                        return Err(Error::Http {
                            description: "body source ended before its declared size".into(),
                            location: here!(),
                        });
                    }
                    self.stage.extend_from_slice(&block[..n]);
                    staged_ul = n;
                }
                None => {
                    if self.last_chunk_staged {
                        self.body_done = true;
                        return Ok(false);
                    }
                    let mut block = vec![0u8; BODY_CHUNK];
                    let n = read_full(reader, &mut block).map_err(|e| Error::Http {
                        description: format!("body read failed: {e}"),
                        location: here!(),
                    })?;
                    if n == 0 {
                        self.stage.extend_from_slice(b"0\r\n\r\n");
                        self.last_chunk_staged = true;
                    } else {
                        self.stage
                            .extend_from_slice(format!("{n:x}\r\n").as_bytes());
                        self.stage.extend_from_slice(&block[..n]);
                        self.stage.extend_from_slice(b"\r\n");
                        staged_ul = n;
                    }
                }
            },
        }
        self.body_sent += staged_ul as u64;
        self.ul_now += staged_ul as u64;
        Ok(true)
    }

    fn step_recv_headers(&mut self) -> Result<Step, Error> {
        loop {
            while let Some(line_end) = find_crlf(&self.in_buf) {
                let line: Vec<u8> = self.in_buf.drain(..line_end + 2).collect();
                match self.phase {
                    Phase::RecvStatus => self.consume_status_line(&line)?,
                    Phase::RecvHeaders => {
                        if let Some(step) = self.consume_header_line(&line)? {
                            return Ok(step);
                        }
                    }
                    _ => unreachable!("header loop outside header phases"),
                }
                if self.phase == Phase::RecvBody || self.phase == Phase::DrainAuthBody {
                    return Ok(Step::Again);
                }
            }

            match self.read_plaintext() {
                Ok(0) => {
                    if self.can_retry_stale_connection() {
                        return self.handle_dead_connection("recv");
                    }
                    return Err(Error::Http {
                        description: "connection closed before response headers".into(),
                        location: here!(),
                    });
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Step::Blocked(self.recv_interest()))
                }
                Err(e) if is_connection_reset(&e) && self.can_retry_stale_connection() => {
                    return self.handle_dead_connection("recv");
                }
                Err(e) => {
                    return Err(Error::Http {
                        description: format!("recv failed: {e}"),
                        location: here!(),
                    })
                }
            }
        }
    }

    fn consume_status_line(&mut self, line: &[u8]) -> Result<(), Error> {
        if self.timing.first_byte.is_none() {
            self.timing.first_byte = Some(Instant::now());
        }
        self.resp.saw_first_byte = true;
        self.emit_header_line(line)?;

        let text = String::from_utf8_lossy(line);
        let mut parts = text.split_whitespace();
        let version = parts.next().unwrap_or("");
        let code: u16 = parts
            .next()
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| Error::Http {
                description: format!("malformed status line {:?}", text.trim_end()),
                location: here!(),
            })?;
        if !version.starts_with("HTTP/1.") {
            return Err(Error::Http {
                description: format!("unsupported protocol version {version:?}"),
                location: here!(),
            });
        }

        if (100..200).contains(&code) {
            // Interim response: swallow its header block, then expect the
            // real status line.
            self.resp.in_interim = true;
            self.phase = Phase::RecvHeaders;
            return Ok(());
        }

        self.resp.status_code = code;
        self.resp.status = Some(Status::from_code(code).ok_or_else(|| Error::Http {
            description: format!("unrecognized status code {code}"),
            location: here!(),
        })?);
        self.phase = Phase::RecvHeaders;
        Ok(())
    }

    /// Returns Some(step) when the header block ends and the phase moves on.
    fn consume_header_line(&mut self, line: &[u8]) -> Result<Option<Step>, Error> {
        if line == b"\r\n" {
            if self.resp.in_interim {
                self.resp.in_interim = false;
                self.phase = Phase::RecvStatus;
                return Ok(None);
            }
            return self.end_of_headers().map(Some);
        }

        self.emit_header_line(line)?;

        if let Some((key, value)) = Header::parse_line(line) {
            let canonical = Header::canonicalize_key(&key);
            match canonical.as_str() {
                "Content-Length" => {
                    let length = value.parse::<u64>().map_err(|_| Error::Http {
                        description: format!("bad content-length {value:?}"),
                        location: here!(),
                    })?;
                    self.resp.content_length = Some(length);
                }
                "Transfer-Encoding" => {
                    if value
                        .split(',')
                        .any(|v| v.trim().eq_ignore_ascii_case("chunked"))
                    {
                        self.resp.chunked = true;
                    }
                }
                "Connection" => {
                    if value
                        .split(',')
                        .any(|v| v.trim().eq_ignore_ascii_case("close"))
                    {
                        self.resp.connection_close = true;
                    }
                }
                "Set-Cookie" => {
                    if let (Some(transport), Some(host)) =
                        (self.transport.as_ref(), self.opts.uri.host_str())
                    {
                        transport.cache.store_cookie(host, &value);
                    }
                }
                "Www-Authenticate" | "Proxy-Authenticate" => {
                    self.resp.challenges.push(value);
                }
                _ => {}
            }
        }
        Ok(None)
    }

    fn end_of_headers(&mut self) -> Result<Step, Error> {
        let code = self.resp.status_code;

        // Challenge replay happens at most once, and only for replayable
        // bodies; otherwise the 401/407 is the final response.
        let handler = match code {
            401 => self.opts.http_credentials.clone(),
            407 => self.opts.proxy_credentials.clone(),
            _ => None,
        };
        let replaying = if let Some(handler) = handler {
            !self.auth_attempted
                && self.opts.body.is_replayable()
                && self.prepare_auth_replay(code, handler)
        } else {
            false
        };

        // Work out the body framing either way: a challenged response's
        // body still has to be consumed before the connection can be reused.
        self.resp.no_body = self.opts.method == Method::Head
            || code == 204
            || code == 304
            || (100..200).contains(&code);
        if self.resp.chunked {
            self.resp.chunk = Some(ChunkDecoder::Size);
        } else if !self.resp.no_body && self.resp.content_length.is_none() {
            self.resp.close_delimited = true;
        }

        if replaying {
            if self.resp.no_body || self.resp.content_length == Some(0) {
                return self.restart_for_auth();
            }
            self.phase = Phase::DrainAuthBody;
            return Ok(Step::Again);
        }

        if self.resp.no_body || self.resp.content_length == Some(0) {
            return Ok(Step::Complete(self.finish_exchange()?));
        }
        self.phase = Phase::RecvBody;
        Ok(Step::Again)
    }

    fn prepare_auth_replay(&mut self, code: u16, handler: AuthenticationHandler) -> bool {
        let challenges: Vec<_> = self
            .resp
            .challenges
            .iter()
            .filter_map(|v| auth::parse_challenge(v))
            .collect();
        let Some(challenge) = auth::pick(&challenges) else {
            return false;
        };
        let uri_text = self.opts.uri.to_string();
        let credentials = handler(&uri_text);
        let target = self.opts.uri.request_target();
        let value = auth::authorization(
            challenge,
            &credentials,
            self.opts.method.token(),
            &target,
        );
        let header_name = if code == 407 {
            "Proxy-Authorization"
        } else {
            "Authorization"
        };
        self.pending_auth = Some((header_name, value));
        self.auth_attempted = true;
        metrics::AUTH_REPLAYS.increment();
        true
    }

    fn restart_for_auth(&mut self) -> Result<Step, Error> {
        let close = self.resp.connection_close || self.resp.close_delimited;
        self.resp = RespState::default();
        self.out_pos = 0;
        self.body_sent = 0;
        self.body_done = false;
        self.stage.clear();
        self.stage_pos = 0;
        self.last_chunk_staged = false;
        self.in_buf.clear();

        if close || self.conn.is_none() {
            self.conn = None;
            self.allow_reuse = false;
            self.phase = Phase::Start;
        } else {
            self.build_request();
            self.phase = Phase::SendRequest;
        }
        Ok(Step::Again)
    }

    fn step_recv_body(&mut self) -> Result<Step, Error> {
        loop {
            // Decode whatever is buffered.
            if let Some(step) = self.decode_body_buffered()? {
                return Ok(step);
            }

            match self.read_plaintext() {
                Ok(0) => {
                    if self.resp.close_delimited {
                        return self.body_complete();
                    }
                    return Err(Error::Http {
                        description: "connection closed mid-body".into(),
                        location: here!(),
                    });
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Step::Blocked(self.recv_interest()))
                }
                Err(e) => {
                    return Err(Error::Http {
                        description: format!("recv failed: {e}"),
                        location: here!(),
                    })
                }
            }
        }
    }

    /// Decode body bytes already in `in_buf`. Returns Some when the body
    /// (and therefore the exchange or the auth drain) completes.
    fn decode_body_buffered(&mut self) -> Result<Option<Step>, Error> {
        if self.resp.chunked {
            return self.decode_chunked();
        }

        if let Some(total) = self.resp.content_length {
            if !self.in_buf.is_empty() {
                let remaining = (total - self.resp.body_received) as usize;
                let take = remaining.min(self.in_buf.len());
                let piece: Vec<u8> = self.in_buf.drain(..take).collect();
                self.deliver_body(&piece)?;
            }
            if self.resp.body_received >= total {
                return self.body_complete().map(Some);
            }
            return Ok(None);
        }

        // Close-delimited: everything buffered is body.
        if !self.in_buf.is_empty() {
            let piece: Vec<u8> = self.in_buf.drain(..).collect();
            self.deliver_body(&piece)?;
        }
        Ok(None)
    }

    fn decode_chunked(&mut self) -> Result<Option<Step>, Error> {
        loop {
            let state = self.resp.chunk.expect("chunk decoder armed");
            match state {
                ChunkDecoder::Size => {
                    let Some(line_end) = find_crlf(&self.in_buf) else {
                        return Ok(None);
                    };
                    let line: Vec<u8> = self.in_buf.drain(..line_end + 2).collect();
                    let text = std::str::from_utf8(&line[..line_end])
                        .map_err(|_| self.chunk_error())?;
                    // Chunk extensions (";key=value") are ignored.
                    let size_hex = text.split(';').next().unwrap_or("").trim();
                    let size =
                        u64::from_str_radix(size_hex, 16).map_err(|_| self.chunk_error())?;
                    self.resp.chunk = Some(if size == 0 {
                        ChunkDecoder::Trailer
                    } else {
                        ChunkDecoder::Data { remaining: size }
                    });
                }
                ChunkDecoder::Data { remaining } => {
                    if self.in_buf.is_empty() {
                        return Ok(None);
                    }
                    let take = (remaining as usize).min(self.in_buf.len());
                    let piece: Vec<u8> = self.in_buf.drain(..take).collect();
                    self.deliver_body(&piece)?;
                    let left = remaining - take as u64;
                    self.resp.chunk = Some(if left == 0 {
                        ChunkDecoder::DataCrlf
                    } else {
                        ChunkDecoder::Data { remaining: left }
                    });
                }
                ChunkDecoder::DataCrlf => {
                    if self.in_buf.len() < 2 {
                        return Ok(None);
                    }
                    if &self.in_buf[..2] != b"\r\n" {
                        return Err(self.chunk_error());
                    }
                    self.in_buf.drain(..2);
                    self.resp.chunk = Some(ChunkDecoder::Size);
                }
                ChunkDecoder::Trailer => {
                    let Some(line_end) = find_crlf(&self.in_buf) else {
                        return Ok(None);
                    };
                    let line: Vec<u8> = self.in_buf.drain(..line_end + 2).collect();
                    if line == b"\r\n" {
                        self.resp.chunk = Some(ChunkDecoder::Done);
                    }
                    // Trailer fields are consumed and dropped.
                }
                ChunkDecoder::Done => return self.body_complete().map(Some),
            }
        }
    }

    fn chunk_error(&self) -> Error {
        Error::Http {
            description: "malformed chunked encoding".into(),
            location: here!(),
        }
    }

    fn body_complete(&mut self) -> Result<Step, Error> {
        if self.phase == Phase::DrainAuthBody {
            return self.restart_for_auth();
        }
        Ok(Step::Complete(self.finish_exchange()?))
    }

    /// The exchange is over; keep the connection if it is reusable.
    fn finish_exchange(&mut self) -> Result<Status, Error> {
        let status = self.resp.status.ok_or_else(|| Error::Http {
            description: "response finished without a status".into(),
            location: here!(),
        })?;
        let reusable = !self.resp.connection_close && !self.resp.close_delimited;
        if reusable {
            if let (Some(conn), Some(transport)) = (self.conn.take(), self.transport.as_mut()) {
                transport.conn = Some(conn);
            }
        } else {
            self.conn = None;
        }
        self.phase = Phase::Done;
        Ok(status)
    }

    fn deliver_body(&mut self, piece: &[u8]) -> Result<(), Error> {
        if piece.is_empty() {
            return Ok(());
        }
        self.resp.body_received += piece.len() as u64;
        self.note_bytes(piece.len());
        if self.phase == Phase::DrainAuthBody {
            return Ok(());
        }
        self.dl_now += piece.len() as u64;
        metrics::BYTES_RECEIVED.add(piece.len() as u64);
        if let Some(on_write_data) = &mut self.callbacks.on_write_data {
            let consumed = on_write_data(piece);
            if consumed != piece.len() {
                return Err(Error::Http {
                    description: "data callback did not consume the chunk".into(),
                    location: here!(),
                });
            }
        }
        Ok(())
    }

    fn emit_header_line(&mut self, line: &[u8]) -> Result<(), Error> {
        if self.phase == Phase::DrainAuthBody {
            return Ok(());
        }
        if let Some(on_write_header) = &mut self.callbacks.on_write_header {
            let consumed = on_write_header(line);
            if consumed != line.len() {
                return Err(Error::Http {
                    description: "header callback did not consume the line".into(),
                    location: here!(),
                });
            }
        }
        Ok(())
    }

    // ── Connection plumbing ─────────────────────────────────────────

    /// A reused keep-alive connection died before yielding any response
    /// byte: retry once on a fresh connection.
    fn can_retry_stale_connection(&self) -> bool {
        self.reused_conn && !self.retried_conn && !self.resp.saw_first_byte
    }

    fn handle_dead_connection(&mut self, what: &str) -> Result<Step, Error> {
        if !self.can_retry_stale_connection() {
            return Err(Error::Http {
                description: format!("connection closed during {what}"),
                location: here!(),
            });
        }
        log::debug!("stale keep-alive connection, retrying fresh");
        self.retried_conn = true;
        self.reused_conn = false;
        self.allow_reuse = false;
        self.conn = None;
        self.out_pos = 0;
        self.body_sent = 0;
        self.body_done = false;
        self.stage.clear();
        self.stage_pos = 0;
        self.last_chunk_staged = false;
        self.in_buf.clear();
        self.resp = RespState::default();
        self.phase = Phase::Start;
        Ok(Step::Again)
    }

    fn read_plaintext(&mut self) -> io::Result<usize> {
        let conn = self.conn.as_mut().expect("recv without a socket");
        let n = match &mut conn.tls {
            None => conn.stream.read(&mut self.scratch)?,
            Some(tls) => read_some_tls(tls, &mut conn.stream, &mut self.scratch)?,
        };
        self.in_buf.extend_from_slice(&self.scratch[..n]);
        Ok(n)
    }

    fn recv_interest(&self) -> Interest {
        let wants_write = self
            .conn
            .as_ref()
            .and_then(|c| c.tls.as_ref())
            .is_some_and(|tls| tls.wants_write());
        if wants_write {
            Interest::Both
        } else {
            Interest::Readable
        }
    }

    // ── Request emission ────────────────────────────────────────────

    fn build_request(&mut self) {
        self.out_buf.clear();
        self.out_pos = 0;

        let target = self.opts.uri.request_target();
        self.out_buf
            .extend_from_slice(self.opts.method.token().as_bytes());
        self.out_buf.push(b' ');
        self.out_buf.extend_from_slice(target.as_bytes());
        self.out_buf.extend_from_slice(b" HTTP/1.1\r\n");

        if !self.opts.header.has("Host") {
            if let Some(authority) = &self.opts.uri.authority {
                let mut host = authority.host.to_string();
                if let Some(port) = authority.port {
                    let default = if self.opts.uri.is_https() { 443 } else { 80 };
                    if port != default {
                        host.push_str(&format!(":{port}"));
                    }
                }
                self.out_buf.extend_from_slice(b"Host: ");
                self.out_buf.extend_from_slice(host.as_bytes());
                self.out_buf.extend_from_slice(b"\r\n");
            }
        }
        if !self.opts.header.has("User-Agent") {
            self.out_buf.extend_from_slice(b"User-Agent: ");
            self.out_buf
                .extend_from_slice(self.opts.user_agent.as_bytes());
            self.out_buf.extend_from_slice(b"\r\n");
        }
        if !self.opts.header.has("Accept") {
            self.out_buf.extend_from_slice(b"Accept: */*\r\n");
        }

        let body_headers_needed = !matches!(self.opts.body, BodySource::Empty)
            || matches!(self.opts.method, Method::Post | Method::Put);
        if body_headers_needed {
            match self.opts.body.len() {
                Some(len) if !self.opts.header.has("Content-Length") => {
                    self.out_buf
                        .extend_from_slice(format!("Content-Length: {len}\r\n").as_bytes());
                }
                None if !self.opts.header.has("Transfer-Encoding") => {
                    self.out_buf
                        .extend_from_slice(b"Transfer-Encoding: chunked\r\n");
                }
                _ => {}
            }
        }

        if let Some((name, value)) = &self.pending_auth {
            self.out_buf.extend_from_slice(name.as_bytes());
            self.out_buf.extend_from_slice(b": ");
            self.out_buf.extend_from_slice(value.as_bytes());
            self.out_buf.extend_from_slice(b"\r\n");
        }

        if !self.opts.header.has("Cookie") {
            if let (Some(transport), Some(host)) =
                (self.transport.as_ref(), self.opts.uri.host_str())
            {
                if let Some(cookies) = transport.cache.cookie_header(host) {
                    self.out_buf.extend_from_slice(b"Cookie: ");
                    self.out_buf.extend_from_slice(cookies.as_bytes());
                    self.out_buf.extend_from_slice(b"\r\n");
                }
            }
        }

        self.opts.header.write_wire(&mut self.out_buf);
        self.out_buf.extend_from_slice(b"\r\n");
    }

    // ── Progress / speed / timings ──────────────────────────────────

    fn report_progress(&mut self) -> Result<(), Error> {
        let Some(on_progress) = &mut self.callbacks.on_progress else {
            return Ok(());
        };
        let dl_total = match self.resp.content_length {
            Some(total) => total as f64,
            None => -1.0,
        };
        let ul_total = match self.opts.body.len() {
            Some(total) => total as f64,
            None => -1.0,
        };
        let progress = Progress {
            download: Transferred {
                current: self.dl_now as f64,
                total: dl_total,
            },
            upload: Transferred {
                current: self.ul_now as f64,
                total: ul_total,
            },
        };
        match on_progress(&progress) {
            Next::ContinueOperation => Ok(()),
            Next::AbortOperation => Err(Error::AbortedByCallback { location: here!() }),
        }
    }

    /// Account transferred bytes (either direction) for the speed window.
    fn note_bytes(&mut self, n: usize) {
        self.total_bytes += n as u64;
    }

    fn check_low_speed(&mut self, now: Instant) -> Result<(), Error> {
        if self.opts.low_speed_limit == 0 {
            return Ok(());
        }
        let Some(window_start) = self.window_start else {
            return Ok(());
        };
        let elapsed = now.duration_since(window_start);
        if elapsed < self.opts.low_speed_duration {
            return Ok(());
        }
        let bytes = self.total_bytes - self.window_bytes;
        let speed = bytes as f64 / elapsed.as_secs_f64();
        if speed < self.opts.low_speed_limit as f64 {
            return Err(Error::OperationTimedOut {
                reason: format!(
                    "transfer speed {speed:.0} B/s below limit {} B/s for {:?}",
                    self.opts.low_speed_limit, self.opts.low_speed_duration
                ),
                location: here!(),
            });
        }
        // Rate was acceptable over this window; slide it.
        self.window_start = Some(now);
        self.window_bytes = self.total_bytes;
        Ok(())
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let speed_deadline = if self.opts.low_speed_limit > 0 {
            self.window_start.map(|s| s + self.opts.low_speed_duration)
        } else {
            None
        };
        match (self.deadline, speed_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn finish(&mut self, result: Result<Status, Error>) {
        let now = Instant::now();
        let start = self.timing.start.unwrap_or(now);
        let resolved = self.timing.resolved.unwrap_or(start);
        let connected = self.timing.connected.unwrap_or(resolved);
        let app_connect = self.timing.app_connect.unwrap_or(connected);
        let pre_transfer = self.timing.pre_transfer.unwrap_or(app_connect);
        let first_byte = self.timing.first_byte.unwrap_or(pre_transfer);
        self.timings_out = TransferTimings {
            name_look_up: resolved.duration_since(start).as_secs_f64(),
            connect: connected.duration_since(resolved).as_secs_f64(),
            app_connect: app_connect.duration_since(connected).as_secs_f64(),
            pre_transfer: pre_transfer.duration_since(app_connect).as_secs_f64(),
            start_transfer: first_byte.duration_since(pre_transfer).as_secs_f64(),
            total: now.duration_since(start).as_secs_f64(),
        };

        if result.is_err() {
            // Never pool a connection in an unknown state.
            self.conn = None;
            metrics::REQUESTS_FAILED.increment();
        } else {
            metrics::REQUESTS_COMPLETED.increment();
        }
        self.phase = Phase::Done;
        self.finished = Some(result);
    }
}

// ── Socket helpers ──────────────────────────────────────────────────

fn is_connection_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

/// Create a non-blocking socket and begin connecting to `addr`.
fn open_socket(addr: SocketAddr) -> io::Result<TcpStream> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);

    let ret =
        unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            unsafe { libc::close(fd) };
            return Err(err);
        }
    }

    Ok(unsafe { TcpStream::from_raw_fd(fd) })
}

/// Write a SocketAddr into a sockaddr_storage, return the address length.
fn socket_addr_to_sockaddr(addr: SocketAddr, storage: &mut libc::sockaddr_storage) -> u32 {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as u32
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as u32
        }
    }
}

/// Check the outcome of a non-blocking connect.
fn connect_result(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

enum Handshake {
    Complete,
    Blocked(Interest),
}

/// Pump the TLS handshake until it completes or the socket blocks.
fn pump_handshake(
    tls: &mut rustls::ClientConnection,
    stream: &mut TcpStream,
) -> Result<Handshake, Error> {
    loop {
        while tls.wants_write() {
            match tls.write_tls(stream) {
                Ok(0) => {
                    return Err(Error::SslConnectError {
                        reason: "connection closed during handshake".into(),
                        location: here!(),
                    })
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Handshake::Blocked(Interest::Writable))
                }
                Err(e) => {
                    return Err(Error::SslConnectError {
                        reason: e.to_string(),
                        location: here!(),
                    })
                }
            }
        }

        if !tls.is_handshaking() {
            return Ok(Handshake::Complete);
        }

        match tls.read_tls(stream) {
            Ok(0) => {
                return Err(Error::SslConnectError {
                    reason: "connection closed during handshake".into(),
                    location: here!(),
                })
            }
            Ok(_) => {
                if let Err(e) = tls.process_new_packets() {
                    // Push out any pending alert before surfacing the error.
                    let _ = tls.write_tls(stream);
                    return Err(map_tls_error(e));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let interest = if tls.wants_write() {
                    Interest::Both
                } else {
                    Interest::Readable
                };
                return Ok(Handshake::Blocked(interest));
            }
            Err(e) => {
                return Err(Error::SslConnectError {
                    reason: e.to_string(),
                    location: here!(),
                })
            }
        }
    }
}

/// Write plaintext through the connection, TLS or not. At most one staged
/// block of ciphertext is left buffered in rustls when the socket blocks.
fn write_some(conn: &mut Conn, buf: &[u8]) -> io::Result<usize> {
    match &mut conn.tls {
        None => {
            let n = conn.stream.write(buf)?;
            metrics::BYTES_SENT.add(n as u64);
            Ok(n)
        }
        Some(tls) => {
            flush_tls(tls, &mut conn.stream)?;
            let n = tls.writer().write(buf)?;
            match flush_tls(tls, &mut conn.stream) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            metrics::BYTES_SENT.add(n as u64);
            Ok(n)
        }
    }
}

fn flush_tls(
    tls: &mut rustls::ClientConnection,
    stream: &mut TcpStream,
) -> io::Result<()> {
    while tls.wants_write() {
        match tls.write_tls(stream) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(_) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read decrypted plaintext. 0 means EOF (clean close_notify or a torn
/// connection at a message boundary, which HTTP treats the same way).
fn read_some_tls(
    tls: &mut rustls::ClientConnection,
    stream: &mut TcpStream,
    scratch: &mut [u8],
) -> io::Result<usize> {
    loop {
        match tls.reader().read(scratch) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
            Err(e) => return Err(e),
        }
        match tls.read_tls(stream)? {
            0 => return Ok(0),
            _ => {
                tls.process_new_packets()
                    .map_err(|e| io::Error::other(e.to_string()))?;
                if tls.wants_write() {
                    // Best effort; pending output retries on the next write.
                    let _ = tls.write_tls(stream);
                }
            }
        }
    }
}

fn read_full(reader: &mut (impl Read + ?Sized), buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn map_tls_error(e: rustls::Error) -> Error {
    match &e {
        rustls::Error::InvalidCertificate(cert_error) => match cert_error {
            rustls::CertificateError::NotValidForName => Error::PeerFailedVerification {
                reason: e.to_string(),
                location: here!(),
            },
            rustls::CertificateError::NotValidForNameContext { .. } => {
                Error::PeerFailedVerification {
                    reason: e.to_string(),
                    location: here!(),
                }
            }
            _ => Error::SslCertProblem {
                reason: e.to_string(),
                location: here!(),
            },
        },
        _ => Error::SslConnectError {
            reason: e.to_string(),
            location: here!(),
        },
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_crlf_positions() {
        assert_eq!(find_crlf(b"abc\r\ndef"), Some(3));
        assert_eq!(find_crlf(b"\r\n"), Some(0));
        assert_eq!(find_crlf(b"abc"), None);
        assert_eq!(find_crlf(b"abc\r"), None);
    }

    #[test]
    fn body_source_lengths() {
        assert_eq!(BodySource::Empty.len(), Some(0));
        assert_eq!(BodySource::Buffer(Bytes::from_static(b"abc")).len(), Some(3));
        let reader = BodySource::Reader {
            reader: Box::new(io::empty()),
            len: None,
        };
        assert_eq!(reader.len(), None);
        assert!(!reader.is_replayable());
        assert!(BodySource::Empty.is_replayable());
    }

    #[test]
    fn read_full_collects_across_short_reads() {
        struct TwoByteReads(Vec<u8>);
        impl Read for TwoByteReads {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let n = self.0.len().min(2).min(buf.len());
                let rest = self.0.split_off(n);
                buf[..n].copy_from_slice(&self.0);
                self.0 = rest;
                Ok(n)
            }
        }
        let mut reader = TwoByteReads(b"abcdefg".to_vec());
        let mut buf = [0u8; 16];
        let n = read_full(&mut reader, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abcdefg");
    }
}
