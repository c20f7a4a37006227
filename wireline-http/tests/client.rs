//! Integration tests: the full client against scripted HTTP servers on the
//! loopback interface.
//!
//! Each test stands up a `std::net::TcpListener`, speaks just enough
//! HTTP/1.1 to exercise the engine, and asserts on what the client sent
//! and what it delivered back.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use wireline_http::{
    Client, Configuration, Credentials, Error, Handler, Next, Pool, State,
};

// ── Server scaffolding ──────────────────────────────────────────────

/// Spawn a server that runs `handler` once per accepted connection.
fn spawn_server<F>(handler: F) -> SocketAddr
where
    F: Fn(TcpStream) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let handler = handler.clone();
            thread::spawn(move || handler(stream));
        }
    });
    addr
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Read one request: the head as text plus the content-length body.
fn read_request(stream: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
        match stream.read(&mut tmp) {
            Ok(0) => return None,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
            Err(_) => return None,
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end + 4]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        match stream.read(&mut tmp) {
            Ok(0) => break,
            Ok(n) => body.extend_from_slice(&tmp[..n]),
            Err(_) => break,
        }
    }
    body.truncate(content_length);
    Some((head, body))
}

fn write_response(stream: &mut TcpStream, status: &str, body: &[u8]) {
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
    let _ = stream.flush();
}

/// The `Done` transition happens when the completion closure unwinds, a
/// moment after the handler fires; give it a beat.
fn assert_done_soon(state: impl Fn() -> State) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while state() != State::Done {
        assert!(Instant::now() < deadline, "request never reached Done");
        thread::sleep(Duration::from_millis(5));
    }
}

fn test_client() -> Client {
    Client::builder()
        .pool(Pool::new(8))
        .acquire_timeout(Duration::from_millis(100))
        .build()
        .expect("client setup")
}

fn config_for(addr: SocketAddr, path: &str) -> Configuration {
    Configuration::from_uri_as_string(format!("http://{addr}{path}"))
}

// ── Synchronous basics ──────────────────────────────────────────────

#[test]
fn get_delivers_status_header_and_body() {
    let addr = spawn_server(|mut stream| {
        if read_request(&mut stream).is_some() {
            write_response(&mut stream, "200 OK", b"hello world");
        }
    });

    let client = test_client();
    let response = client
        .get(&config_for(addr, "/get"))
        .unwrap()
        .execute(|_| Next::ContinueOperation)
        .unwrap();

    assert_eq!(response.status.code(), 200);
    assert_eq!(&response.body[..], b"hello world");
    assert!(response.header.has_value("Content-Type", "text/plain"));
}

#[test]
fn custom_headers_reach_the_wire() {
    let seen = Arc::new(Mutex::new(String::new()));
    let seen_server = seen.clone();
    let addr = spawn_server(move |mut stream| {
        if let Some((head, _)) = read_request(&mut stream) {
            *seen_server.lock().unwrap() = head;
            write_response(&mut stream, "200 OK", b"ok");
        }
    });

    let client = test_client();
    let mut config = config_for(addr, "/headers");
    config.header.add("Test1", "42");
    config.header.add("Test2", "43");
    config.header.add("Empty", "");

    let response = client
        .get(&config)
        .unwrap()
        .execute(|_| Next::ContinueOperation)
        .unwrap();
    assert_eq!(response.status.code(), 200);

    let head = seen.lock().unwrap().clone();
    assert!(head.starts_with("GET /headers HTTP/1.1\r\n"));
    assert!(head.contains("Test1: 42\r\n"));
    assert!(head.contains("Test2: 43\r\n"));
    // The empty value survives as an empty string.
    assert!(head.contains("Empty: \r\n"));
    assert!(head.contains(&format!("Host: {}\r\n", addr.ip())) || head.contains("Host: "));
}

#[test]
fn delete_uses_its_own_request_line_token() {
    let seen = Arc::new(Mutex::new(String::new()));
    let seen_server = seen.clone();
    let addr = spawn_server(move |mut stream| {
        if let Some((head, _)) = read_request(&mut stream) {
            *seen_server.lock().unwrap() = head;
            write_response(&mut stream, "200 OK", b"");
        }
    });

    let client = test_client();
    client
        .del(&config_for(addr, "/delete"))
        .unwrap()
        .execute(|_| Next::ContinueOperation)
        .unwrap();

    assert!(seen.lock().unwrap().starts_with("DELETE /delete HTTP/1.1\r\n"));
}

#[test]
fn form_post_is_url_encoded_with_the_right_content_type() {
    let seen = Arc::new(Mutex::new((String::new(), Vec::new())));
    let seen_server = seen.clone();
    let addr = spawn_server(move |mut stream| {
        if let Some((head, body)) = read_request(&mut stream) {
            *seen_server.lock().unwrap() = (head, body);
            write_response(&mut stream, "200 OK", b"ok");
        }
    });

    let client = test_client();
    let response = client
        .post_form(&config_for(addr, "/post"), &[("test", "test")])
        .unwrap()
        .execute(|_| Next::ContinueOperation)
        .unwrap();
    assert_eq!(response.status.code(), 200);

    let (head, body) = seen.lock().unwrap().clone();
    assert_eq!(body, b"test=test");
    assert!(head.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
    assert!(head.contains("Content-Length: 9\r\n"));
}

#[test]
fn head_response_has_no_body() {
    let addr = spawn_server(|mut stream| {
        if read_request(&mut stream).is_some() {
            // A HEAD response advertises a length but sends no body.
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n");
        }
    });

    let client = test_client();
    let response = client
        .head(&config_for(addr, "/"))
        .unwrap()
        .execute(|_| Next::ContinueOperation)
        .unwrap();
    assert_eq!(response.status.code(), 200);
    assert!(response.body.is_empty());
    assert!(response.header.has_value("Content-Length", "5"));
}

#[test]
fn chunked_responses_are_reassembled() {
    let addr = spawn_server(|mut stream| {
        if read_request(&mut stream).is_some() {
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n1\r\n \r\n5\r\nworld\r\n0\r\n\r\n",
            );
        }
    });

    let client = test_client();
    let response = client
        .get(&config_for(addr, "/chunked"))
        .unwrap()
        .execute(|_| Next::ContinueOperation)
        .unwrap();
    assert_eq!(response.status.code(), 200);
    assert_eq!(&response.body[..], b"hello world");
}

// ── Upload paths ────────────────────────────────────────────────────

#[test]
fn large_put_declares_and_sends_the_full_size() {
    const SIZE: usize = 1024 * 1024;

    let seen = Arc::new(Mutex::new((String::new(), 0usize)));
    let seen_server = seen.clone();
    let addr = spawn_server(move |mut stream| {
        if let Some((head, body)) = read_request(&mut stream) {
            *seen_server.lock().unwrap() = (head, body.len());
            write_response(&mut stream, "200 OK", b"stored");
        }
    });

    let payload = vec![0xABu8; SIZE];
    let max_uploaded = Arc::new(Mutex::new(0.0f64));
    let progress_max = max_uploaded.clone();

    let client = test_client();
    let response = client
        .put(
            &config_for(addr, "/put"),
            std::io::Cursor::new(payload),
            Some(SIZE as u64),
        )
        .unwrap()
        .execute(move |progress| {
            let mut max = progress_max.lock().unwrap();
            if progress.upload.current > *max {
                *max = progress.upload.current;
            }
            Next::ContinueOperation
        })
        .unwrap();

    assert_eq!(response.status.code(), 200);
    let (head, received) = seen.lock().unwrap().clone();
    assert!(head.contains(&format!("Content-Length: {SIZE}\r\n")));
    assert_eq!(received, SIZE);
    assert_eq!(*max_uploaded.lock().unwrap(), SIZE as f64);
}

#[test]
fn chunked_upload_when_size_is_unknown() {
    let seen = Arc::new(Mutex::new(String::new()));
    let seen_server = seen.clone();
    let addr = spawn_server(move |mut stream| {
        // Read until the terminating chunk rather than trusting a length.
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        while find_subslice(&buf, b"0\r\n\r\n").is_none() {
            match stream.read(&mut tmp) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
                Err(_) => break,
            }
        }
        *seen_server.lock().unwrap() = String::from_utf8_lossy(&buf).into_owned();
        write_response(&mut stream, "200 OK", b"ok");
    });

    let client = test_client();
    let response = client
        .post_stream(
            &config_for(addr, "/post"),
            std::io::Cursor::new(b"streamed payload".to_vec()),
            None,
        )
        .unwrap()
        .execute(|_| Next::ContinueOperation)
        .unwrap();

    assert_eq!(response.status.code(), 200);
    let seen = seen.lock().unwrap().clone();
    assert!(seen.contains("Transfer-Encoding: chunked\r\n"));
    assert!(seen.contains("streamed payload"));
    assert!(seen.ends_with("0\r\n\r\n"));
}

// ── Authentication ──────────────────────────────────────────────────

#[test]
fn basic_auth_challenge_is_answered_once() {
    let requests = Arc::new(Mutex::new(Vec::<String>::new()));
    let requests_server = requests.clone();
    let addr = spawn_server(move |mut stream| {
        // One connection may carry both the challenged and the replayed
        // request (keep-alive).
        while let Some((head, _)) = read_request(&mut stream) {
            let authorized = head.contains("Authorization: ");
            requests_server.lock().unwrap().push(head);
            if authorized {
                write_response(&mut stream, "200 OK", b"{\"authenticated\": true}");
            } else {
                let _ = stream.write_all(
                    b"HTTP/1.1 401 Unauthorized\r\n\
                      Www-Authenticate: Basic realm=\"Fake Realm\"\r\n\
                      Content-Length: 0\r\n\r\n",
                );
            }
        }
    });

    let client = test_client();
    let mut config = config_for(addr, "/basic-auth/user/passwd");
    config.authentication_handler.for_http = Some(Arc::new(|_uri: &str| Credentials {
        username: "user".into(),
        password: "passwd".into(),
    }));

    let response = client
        .get(&config)
        .unwrap()
        .execute(|_| Next::ContinueOperation)
        .unwrap();

    assert_eq!(response.status.code(), 200);
    assert_eq!(&response.body[..], b"{\"authenticated\": true}");

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].contains("Authorization: "));
    // "user:passwd" in base64.
    assert!(requests[1].contains("Authorization: Basic dXNlcjpwYXNzd2Q=\r\n"));
}

#[test]
fn digest_is_preferred_over_basic() {
    let authorization = Arc::new(Mutex::new(String::new()));
    let authorization_server = authorization.clone();
    let addr = spawn_server(move |mut stream| {
        while let Some((head, _)) = read_request(&mut stream) {
            if let Some(line) = head
                .lines()
                .find(|line| line.starts_with("Authorization: "))
            {
                *authorization_server.lock().unwrap() = line.to_string();
                write_response(&mut stream, "200 OK", b"in");
            } else {
                let _ = stream.write_all(
                    b"HTTP/1.1 401 Unauthorized\r\n\
                      Www-Authenticate: Basic realm=\"r\"\r\n\
                      Www-Authenticate: Digest realm=\"r\", nonce=\"abc\", qop=\"auth\"\r\n\
                      Content-Length: 0\r\n\r\n",
                );
            }
        }
    });

    let client = test_client();
    let mut config = config_for(addr, "/digest");
    config.authentication_handler.for_http = Some(Arc::new(|_: &str| Credentials {
        username: "user".into(),
        password: "passwd".into(),
    }));

    let response = client
        .get(&config)
        .unwrap()
        .execute(|_| Next::ContinueOperation)
        .unwrap();
    assert_eq!(response.status.code(), 200);

    let authorization = authorization.lock().unwrap();
    assert!(authorization.contains("Digest username=\"user\""));
    assert!(authorization.contains("nonce=\"abc\""));
    assert!(authorization.contains("qop=auth"));
    assert!(authorization.contains("uri=\"/digest\""));
}

// ── Streaming ───────────────────────────────────────────────────────

#[test]
fn streaming_delivers_chunks_without_accumulating() {
    let addr = spawn_server(|mut stream| {
        if read_request(&mut stream).is_some() {
            write_response(&mut stream, "200 OK", b"stream me please");
        }
    });

    let client = test_client();
    let chunks = Arc::new(Mutex::new(Vec::<u8>::new()));
    let sink = chunks.clone();

    let response = client
        .streaming_get(&config_for(addr, "/stream"))
        .unwrap()
        .execute(
            |_| Next::ContinueOperation,
            move |data| sink.lock().unwrap().extend_from_slice(data),
        )
        .unwrap();

    assert_eq!(response.status.code(), 200);
    // Status and header arrive; the body does not accumulate.
    assert!(response.body.is_empty());
    assert_eq!(chunks.lock().unwrap().as_slice(), b"stream me please");
}

#[test]
fn pause_and_resume_do_not_corrupt_the_body() {
    // 64 KiB served in small delayed writes so the pause lands mid-body.
    const CHUNK: usize = 1024;
    const CHUNKS: usize = 64;

    let body: Vec<u8> = (0..CHUNK * CHUNKS).map(|i| (i % 251) as u8).collect();
    let served = body.clone();
    let addr = spawn_server(move |mut stream| {
        if read_request(&mut stream).is_some() {
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", served.len());
            let _ = stream.write_all(head.as_bytes());
            for chunk in served.chunks(CHUNK) {
                if stream.write_all(chunk).is_err() {
                    return;
                }
                thread::sleep(Duration::from_millis(2));
            }
        }
    });

    let client = Arc::new(test_client());
    let worker = {
        let client = client.clone();
        thread::spawn(move || client.run())
    };

    let chunks = Arc::new(Mutex::new(Vec::<u8>::new()));
    let sink = chunks.clone();
    let (done_tx, done_rx) = mpsc::channel::<Result<u16, Error>>();
    let err_tx = done_tx.clone();

    let request = client
        .streaming_get(&config_for(addr, "/big"))
        .unwrap();
    request
        .async_execute(
            Handler::new()
                .on_response(move |response| {
                    done_tx.send(Ok(response.status.code())).unwrap();
                })
                .on_error(move |error| {
                    let _ = err_tx.send(Err(error));
                }),
            move |data| sink.lock().unwrap().extend_from_slice(data),
        )
        .unwrap();

    // Let roughly half the body through, pause, then resume.
    while chunks.lock().unwrap().len() < body.len() / 2 {
        thread::sleep(Duration::from_millis(5));
    }
    request.pause();
    thread::sleep(Duration::from_millis(100));
    request.resume();

    let status = done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("request completed")
        .expect("request succeeded");
    assert_eq!(status, 200);
    assert_eq!(chunks.lock().unwrap().as_slice(), &body[..]);
    assert_done_soon(|| request.state());

    client.stop();
    worker.join().unwrap().unwrap();
}

// ── Deadlines and aborts ────────────────────────────────────────────

#[test]
fn low_speed_transfers_are_aborted() {
    // Drip ~5 bytes per second against a 1 MB/s floor over 2 s.
    let addr = spawn_server(|mut stream| {
        if read_request(&mut stream).is_some() {
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000000\r\n\r\n");
            for _ in 0..60 {
                if stream.write_all(b"x").is_err() {
                    return;
                }
                thread::sleep(Duration::from_millis(200));
            }
        }
    });

    let client = Arc::new(test_client());
    let worker = {
        let client = client.clone();
        thread::spawn(move || client.run())
    };

    let (err_tx, err_rx) = mpsc::channel();
    let request = client.get(&config_for(addr, "/slow")).unwrap();
    request
        .abort_request_if(1_000_000, Duration::from_secs(2))
        .unwrap();
    request
        .async_execute(
            Handler::new()
                .on_response(|response| panic!("unexpected success: {}", response.status))
                .on_error(move |error| err_tx.send(error).unwrap()),
        )
        .unwrap();

    let error = err_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("request should fail");
    assert!(error.is_timeout(), "expected a timeout-class error, got {error}");
    assert_done_soon(|| request.state());

    client.stop();
    worker.join().unwrap().unwrap();
}

#[test]
fn overall_timeout_applies() {
    // Accept the connection, never respond.
    let addr = spawn_server(|mut stream| {
        let _ = read_request(&mut stream);
        thread::sleep(Duration::from_secs(30));
    });

    let client = test_client();
    let request = client.get(&config_for(addr, "/stall")).unwrap();
    request.set_timeout(150).unwrap();

    let started = Instant::now();
    let error = request
        .execute(|_| Next::ContinueOperation)
        .err()
        .expect("request should time out");
    assert!(error.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(request.state(), State::Done);
}

#[test]
fn progress_callback_can_abort() {
    let addr = spawn_server(|mut stream| {
        if read_request(&mut stream).is_some() {
            write_response(&mut stream, "200 OK", b"will never be seen fully");
        }
    });

    let client = test_client();
    let error = client
        .get(&config_for(addr, "/abort"))
        .unwrap()
        .execute(|_| Next::AbortOperation)
        .err()
        .expect("callback abort should fail the request");
    assert!(matches!(error, Error::AbortedByCallback { .. }));
}

#[test]
fn execute_twice_is_already_active() {
    let addr = spawn_server(|mut stream| {
        if read_request(&mut stream).is_some() {
            write_response(&mut stream, "200 OK", b"once");
        }
    });

    let client = test_client();
    let request = client.get(&config_for(addr, "/once")).unwrap();
    request.execute(|_| Next::ContinueOperation).unwrap();
    assert_eq!(request.state(), State::Done);

    let error = request
        .execute(|_| Next::ContinueOperation)
        .err()
        .expect("second execute must fail");
    assert!(matches!(error, Error::AlreadyActive { .. }));
}

// ── Failures ────────────────────────────────────────────────────────

#[test]
fn connection_refused_is_could_not_connect() {
    // Bind and drop to get a port nothing listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let client = test_client();
    let error = client
        .get(&config_for(addr, "/"))
        .unwrap()
        .execute(|_| Next::ContinueOperation)
        .err()
        .expect("connect should fail");
    assert!(matches!(error, Error::CouldNotConnect { .. }));
}

#[test]
fn unresolvable_host_is_could_not_resolve() {
    let client = test_client();
    let config = Configuration::from_uri_as_string("http://does-not-exist.invalid/");
    let error = client
        .get(&config)
        .unwrap()
        .execute(|_| Next::ContinueOperation)
        .err()
        .expect("resolution should fail");
    assert!(matches!(error, Error::CouldNotResolveHost { .. }));
}

// ── Pooling and reuse ───────────────────────────────────────────────

#[test]
fn keep_alive_connections_are_reused() {
    let connections = Arc::new(AtomicUsize::new(0));
    let connections_server = connections.clone();
    let addr = spawn_server(move |mut stream| {
        connections_server.fetch_add(1, Ordering::SeqCst);
        while let Some(_request) = read_request(&mut stream) {
            write_response(&mut stream, "200 OK", b"hi");
        }
    });

    let client = test_client();
    for _ in 0..3 {
        let response = client
            .get(&config_for(addr, "/reuse"))
            .unwrap()
            .execute(|_| Next::ContinueOperation)
            .unwrap();
        assert_eq!(response.status.code(), 200);
    }

    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[test]
fn pool_capacity_bounds_live_transports() {
    let addr = spawn_server(|mut stream| {
        if read_request(&mut stream).is_some() {
            write_response(&mut stream, "200 OK", b"ok");
        }
    });

    let pool = Pool::new(2);
    let client = Client::builder()
        .pool(pool.clone())
        .acquire_timeout(Duration::from_millis(20))
        .build()
        .unwrap();

    let config = config_for(addr, "/");
    let first = client.get(&config).unwrap();
    let second = client.get(&config).unwrap();
    assert_eq!(pool.live_count(), 2);

    // The third acquisition cannot be satisfied while both are held.
    let error = client.get(&config).err().expect("pool should be exhausted");
    assert!(error.is_timeout());

    // Releasing one (by completing it) frees capacity again.
    first.execute(|_| Next::ContinueOperation).unwrap();
    assert!(client.get(&config).is_ok());
    drop(second);
}

#[test]
fn timings_accumulate_over_completed_requests() {
    let addr = spawn_server(|mut stream| {
        while let Some(_request) = read_request(&mut stream) {
            write_response(&mut stream, "200 OK", b"timed");
        }
    });

    let client = test_client();
    for _ in 0..2 {
        client
            .get(&config_for(addr, "/timed"))
            .unwrap()
            .execute(|_| Next::ContinueOperation)
            .unwrap();
    }

    let timings = client.timings();
    assert!(timings.total.mean > 0.0);
    assert!(timings.total.min <= timings.total.max);
    assert!(timings.total.max < 60.0);
}

// ── Async completion plumbing ───────────────────────────────────────

#[test]
fn async_execute_routes_response_to_handler() {
    let addr = spawn_server(|mut stream| {
        if read_request(&mut stream).is_some() {
            write_response(&mut stream, "200 OK", b"async body");
        }
    });

    let client = Arc::new(test_client());
    let worker = {
        let client = client.clone();
        thread::spawn(move || client.run())
    };

    let (tx, rx) = mpsc::channel();
    let request = client.get(&config_for(addr, "/async")).unwrap();
    request
        .async_execute(
            Handler::new()
                .on_response(move |response| {
                    tx.send((response.status.code(), response.body.to_vec()))
                        .unwrap();
                })
                .on_error(|error| panic!("unexpected error: {error}")),
        )
        .unwrap();

    let (status, body) = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("async completion");
    assert_eq!(status, 200);
    assert_eq!(body, b"async body");
    assert_done_soon(|| request.state());

    client.stop();
    worker.join().unwrap().unwrap();
}

#[test]
fn stop_aborts_in_flight_requests() {
    // A server that accepts and stalls keeps the request in flight.
    let addr = spawn_server(|mut stream| {
        let _ = read_request(&mut stream);
        thread::sleep(Duration::from_secs(30));
    });

    let client = Arc::new(test_client());
    let worker = {
        let client = client.clone();
        thread::spawn(move || client.run())
    };

    let (err_tx, err_rx) = mpsc::channel();
    let request = client.get(&config_for(addr, "/stall")).unwrap();
    request
        .async_execute(
            Handler::new()
                .on_response(|_| panic!("must not complete"))
                .on_error(move |error| err_tx.send(error).unwrap()),
        )
        .unwrap();

    thread::sleep(Duration::from_millis(100));
    client.stop();

    let error = err_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("stop should fail the request");
    assert!(matches!(error, Error::AbortedByCallback { .. }));
    assert_done_soon(|| request.state());

    worker.join().unwrap().unwrap();
}
