//! `Request` and `StreamingRequest`: the user-facing state machines over a
//! pooled transfer.
//!
//! The lifecycle is `Ready → Active → Done`; the `Done` transition happens
//! on every exit path via a drop guard. Synchronous execution drives the
//! transfer on the calling thread with a poll loop; asynchronous execution
//! hands it to the engine and routes completion into the handler.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use wireline::{Interest, Ready};

use crate::engine::Engine;
use crate::error::Error;
use crate::header::Header;
use crate::here;
use crate::response::Response;
use crate::transfer::{DriveStatus, Transfer};

/// The states a request can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Idle, awaiting execution.
    Ready,
    /// Actively being executed.
    Active,
    /// Execution has finished (successfully or not).
    Done,
}

const STATE_READY: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_DONE: u8 = 2;

/// One direction of transfer progress. `total` is negative when unknown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transferred {
    pub current: f64,
    pub total: f64,
}

/// Byte counts reported to the progress handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub download: Transferred,
    pub upload: Transferred,
}

/// Return value of a progress handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    ContinueOperation,
    AbortOperation,
}

/// Callbacks for asynchronous execution.
#[derive(Default)]
pub struct Handler {
    pub(crate) on_progress: Option<Box<dyn FnMut(&Progress) -> Next + Send>>,
    pub(crate) on_response: Option<Box<dyn FnOnce(Response) + Send>>,
    pub(crate) on_error: Option<Box<dyn FnOnce(Error) + Send>>,
}

impl Handler {
    pub fn new() -> Handler {
        Handler::default()
    }

    pub fn on_response(mut self, f: impl FnOnce(Response) + Send + 'static) -> Self {
        self.on_response = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl FnMut(&Progress) -> Next + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }
}

/// Forces the `Done` transition on every exit path, including panics.
struct StateGuard {
    state: Arc<AtomicU8>,
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        self.state.store(STATE_DONE, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Context {
    header: Header,
    body: Vec<u8>,
}

pub(crate) struct RequestCore {
    state: Arc<AtomicU8>,
    transfer: Mutex<Option<Transfer>>,
    paused: Arc<AtomicBool>,
    engine: Arc<Engine>,
    engine_id: Mutex<Option<(usize, u64)>>,
}

impl RequestCore {
    pub fn new(transfer: Transfer, paused: Arc<AtomicBool>, engine: Arc<Engine>) -> RequestCore {
        RequestCore {
            state: Arc::new(AtomicU8::new(STATE_READY)),
            transfer: Mutex::new(Some(transfer)),
            paused,
            engine,
            engine_id: Mutex::new(None),
        }
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::SeqCst) {
            STATE_READY => State::Ready,
            STATE_ACTIVE => State::Active,
            _ => State::Done,
        }
    }

    /// Atomically transition `Ready → Active`.
    fn begin(&self) -> Result<StateGuard, Error> {
        self.state
            .compare_exchange(
                STATE_READY,
                STATE_ACTIVE,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| Error::AlreadyActive { location: here!() })?;
        Ok(StateGuard {
            state: self.state.clone(),
        })
    }

    fn with_ready_transfer(
        &self,
        f: impl FnOnce(&mut Transfer),
    ) -> Result<(), Error> {
        if self.state() != State::Ready {
            return Err(Error::AlreadyActive { location: here!() });
        }
        let mut slot = self.transfer.lock().unwrap();
        let transfer = slot
            .as_mut()
            .ok_or(Error::HandleHasBeenAbandoned { location: here!() })?;
        f(transfer);
        Ok(())
    }

    fn set_timeout(&self, ms: u64) -> Result<(), Error> {
        // A count that cannot be represented clamps to "wait forever"
        // rather than wrapping to something short.
        let timeout = if ms > i64::MAX as u64 {
            None
        } else {
            Some(Duration::from_millis(ms))
        };
        self.with_ready_transfer(|t| t.set_timeout(timeout))
    }

    fn abort_request_if(&self, limit: u64, duration: Duration) -> Result<(), Error> {
        self.with_ready_transfer(|t| t.set_low_speed(limit, duration))
    }

    /// Wire the common callbacks: header parsing into the context, body
    /// bytes to the data handler and/or accumulator.
    fn wire(
        transfer: &mut Transfer,
        context: &Arc<Mutex<Context>>,
        mut data_handler: Option<Box<dyn FnMut(&[u8]) + Send>>,
        accumulate: bool,
        progress: Option<Box<dyn FnMut(&Progress) -> Next + Send>>,
    ) {
        let callbacks = transfer.callbacks_mut();
        callbacks.on_progress = progress;

        let ctx = context.clone();
        callbacks.on_write_data = Some(Box::new(move |data: &[u8]| {
            // The data handler sees every chunk before accumulation.
            if let Some(handler) = &mut data_handler {
                handler(data);
            }
            if accumulate {
                ctx.lock().unwrap().body.extend_from_slice(data);
            }
            data.len()
        }));

        let ctx = context.clone();
        callbacks.on_write_header = Some(Box::new(move |line: &[u8]| {
            if let Some((key, value)) = Header::parse_line(line) {
                ctx.lock().unwrap().header.add(&key, value);
            }
            line.len()
        }));
    }

    fn execute(
        &self,
        progress: Option<Box<dyn FnMut(&Progress) -> Next + Send>>,
        data_handler: Option<Box<dyn FnMut(&[u8]) + Send>>,
        accumulate: bool,
    ) -> Result<Response, Error> {
        let _guard = self.begin()?;
        let mut transfer = self
            .transfer
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::HandleHasBeenAbandoned { location: here!() })?;

        let context = Arc::new(Mutex::new(Context::default()));
        Self::wire(&mut transfer, &context, data_handler, accumulate, progress);

        drive_blocking(&mut transfer);

        let result = transfer.take_result();
        self.engine.record_timings(&transfer.take_timings());
        transfer.release_transport();

        let status = result?;
        let mut context = context.lock().unwrap();
        Ok(Response {
            status,
            header: std::mem::take(&mut context.header),
            body: Bytes::from(std::mem::take(&mut context.body)),
        })
    }

    fn async_execute(
        &self,
        handler: Handler,
        data_handler: Option<Box<dyn FnMut(&[u8]) + Send>>,
        accumulate: bool,
    ) -> Result<(), Error> {
        let guard = self.begin()?;
        let mut transfer = self
            .transfer
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::HandleHasBeenAbandoned { location: here!() })?;

        let context = Arc::new(Mutex::new(Context::default()));
        Self::wire(
            &mut transfer,
            &context,
            data_handler,
            accumulate,
            handler.on_progress,
        );

        let on_response = handler.on_response;
        let on_error = handler.on_error;
        let completion_context = context.clone();
        transfer.callbacks_mut().on_finished = Some(Box::new(move |result| {
            // Owning the guard here makes `Done` unconditional once the
            // engine reports completion.
            let _guard = guard;
            match result {
                Ok(status) => {
                    if let Some(on_response) = on_response {
                        let mut context = completion_context.lock().unwrap();
                        on_response(Response {
                            status,
                            header: std::mem::take(&mut context.header),
                            body: Bytes::from(std::mem::take(&mut context.body)),
                        });
                    }
                }
                Err(error) => {
                    if let Some(on_error) = on_error {
                        on_error(error);
                    }
                }
            }
        }));

        let (id, token) = self.engine.insert(transfer);
        *self.engine_id.lock().unwrap() = Some((id, token));
        self.engine.start(id);
        Ok(())
    }

    /// Pause I/O. Marshalled to the reactor via `dispatch` so it cannot
    /// race the engine's own driving.
    fn pause(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        if let Some((id, token)) = *self.engine_id.lock().unwrap() {
            let engine = self.engine.clone();
            self.engine
                .reactor()
                .dispatch(move || engine.set_paused(id, token, paused));
        }
        // Synchronous executions read the shared flag directly.
    }
}

/// Drive a transfer to completion on the calling thread.
fn drive_blocking(transfer: &mut Transfer) {
    let mut ready = Ready::empty();
    loop {
        match transfer.drive(ready) {
            DriveStatus::Finished => return,
            DriveStatus::Continue { interest, deadline } => {
                ready = wait_ready(transfer, interest, deadline);
            }
        }
    }
}

/// Block until the socket is ready, the deadline is near, or a pause tick
/// elapses. Waits are sliced so cross-thread pause/resume is noticed.
fn wait_ready(transfer: &Transfer, interest: Interest, deadline: Option<Instant>) -> Ready {
    const SLICE_MS: i32 = 200;

    let budget_ms = deadline
        .map(|d| {
            d.saturating_duration_since(Instant::now())
                .as_millis()
                .min(SLICE_MS as u128) as i32
        })
        .unwrap_or(SLICE_MS);

    let events: i16 = match interest {
        Interest::Readable => libc::POLLIN,
        Interest::Writable => libc::POLLOUT,
        Interest::Both => libc::POLLIN | libc::POLLOUT,
        Interest::None => 0,
    };

    match transfer.fd() {
        Some(fd) if events != 0 => {
            let mut pollfd = libc::pollfd {
                fd,
                events,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pollfd, 1, budget_ms) };
            if rc > 0 {
                Ready::from_poll_revents(pollfd.revents)
            } else {
                Ready::empty()
            }
        }
        _ => {
            let ms = (budget_ms.max(1) as u64).min(50);
            std::thread::sleep(Duration::from_millis(ms));
            Ready::empty()
        }
    }
}

// ── Public request types ────────────────────────────────────────────

/// A request whose response body is accumulated and returned whole.
pub struct Request {
    core: RequestCore,
}

impl Request {
    pub(crate) fn new(core: RequestCore) -> Request {
        Request { core }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        self.core.state()
    }

    /// Overall transfer deadline in milliseconds, set before execution.
    /// A value too large for the platform clamps to "wait forever".
    pub fn set_timeout(&self, ms: u64) -> Result<(), Error> {
        self.core.set_timeout(ms)
    }

    /// Abort if throughput stays below `limit` bytes/second for `duration`.
    pub fn abort_request_if(&self, limit: u64, duration: Duration) -> Result<(), Error> {
        self.core.abort_request_if(limit, duration)
    }

    /// Synchronously execute, blocking the calling thread.
    pub fn execute(
        &self,
        progress: impl FnMut(&Progress) -> Next + Send + 'static,
    ) -> Result<Response, Error> {
        self.core.execute(Some(Box::new(progress)), None, true)
    }

    /// Asynchronously execute; completion goes to the handler. The client's
    /// reactor must be running.
    pub fn async_execute(&self, handler: Handler) -> Result<(), Error> {
        self.core.async_execute(handler, None, true)
    }

    /// Stop reading and writing. Safe from any thread.
    pub fn pause(&self) {
        self.core.pause(true);
    }

    /// Re-enable reading and writing. Safe from any thread.
    pub fn resume(&self) {
        self.core.pause(false);
    }
}

/// A request that hands body chunks to a data handler as they arrive
/// instead of accumulating them.
pub struct StreamingRequest {
    core: RequestCore,
}

impl StreamingRequest {
    pub(crate) fn new(core: RequestCore) -> StreamingRequest {
        StreamingRequest { core }
    }

    pub fn state(&self) -> State {
        self.core.state()
    }

    pub fn set_timeout(&self, ms: u64) -> Result<(), Error> {
        self.core.set_timeout(ms)
    }

    pub fn abort_request_if(&self, limit: u64, duration: Duration) -> Result<(), Error> {
        self.core.abort_request_if(limit, duration)
    }

    /// Synchronously execute. Every body chunk goes to `data_handler` in
    /// arrival order, exactly once; `response.body` stays empty.
    pub fn execute(
        &self,
        progress: impl FnMut(&Progress) -> Next + Send + 'static,
        data_handler: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<Response, Error> {
        self.core
            .execute(Some(Box::new(progress)), Some(Box::new(data_handler)), false)
    }

    /// Asynchronously execute with a data handler.
    pub fn async_execute(
        &self,
        handler: Handler,
        data_handler: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<(), Error> {
        self.core
            .async_execute(handler, Some(Box::new(data_handler)), false)
    }

    pub fn pause(&self) {
        self.core.pause(true);
    }

    pub fn resume(&self) {
        self.core.pause(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_guard_forces_done() {
        let state = Arc::new(AtomicU8::new(STATE_ACTIVE));
        {
            let _guard = StateGuard {
                state: state.clone(),
            };
        }
        assert_eq!(state.load(Ordering::SeqCst), STATE_DONE);
    }

    #[test]
    fn state_guard_forces_done_on_panic() {
        let state = Arc::new(AtomicU8::new(STATE_ACTIVE));
        let state2 = state.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = StateGuard { state: state2 };
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(state.load(Ordering::SeqCst), STATE_DONE);
    }
}
