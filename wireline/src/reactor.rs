use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::{Condvar, Mutex, Weak};

use slab::Slab;

use crate::completion::{OpTag, UserData};
use crate::config::Config;
use crate::error::Error;
use crate::metrics;
use crate::ring::Ring;

/// Which readiness a watched socket waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Wait until the socket is readable.
    Readable,
    /// Wait until the socket is writable.
    Writable,
    /// Wait for either direction.
    Both,
    /// Keep the socket registered but wait for nothing.
    None,
}

impl Interest {
    fn poll_mask(self) -> u32 {
        match self {
            Interest::Readable => libc::POLLIN as u32,
            Interest::Writable => libc::POLLOUT as u32,
            Interest::Both => (libc::POLLIN | libc::POLLOUT) as u32,
            Interest::None => 0,
        }
    }
}

/// Readiness bitmask delivered to [`EventHandler::socket_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    /// The socket is readable (or at EOF).
    pub const IN: Ready = Ready(0b001);
    /// The socket is writable.
    pub const OUT: Ready = Ready(0b010);
    /// The socket is in an error state.
    pub const ERR: Ready = Ready(0b100);

    /// An empty readiness set.
    pub fn empty() -> Ready {
        Ready(0)
    }

    pub fn is_readable(self) -> bool {
        self.0 & Ready::IN.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Ready::OUT.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Ready::ERR.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Build a readiness set from a `poll(2)` revents mask.
    pub fn from_poll_revents(revents: i16) -> Ready {
        let mut ready = Ready::empty();
        if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            ready = ready | Ready::IN;
        }
        if revents & libc::POLLOUT != 0 {
            ready = ready | Ready::OUT;
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            ready = ready | Ready::ERR;
        }
        ready
    }
}

impl std::ops::BitOr for Ready {
    type Output = Ready;
    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

/// Sink for reactor events. Implemented by the transport layer.
///
/// Poll registrations are one-shot: after a `socket_ready` delivery the
/// handler re-arms the fd with [`Reactor::watch`] if it wants more events.
pub trait EventHandler: Send + Sync {
    /// A watched socket became ready.
    fn socket_ready(&self, fd: RawFd, ready: Ready);
    /// The pending deadline timer fired.
    fn timer_expired(&self);
}

enum Event {
    Socket { fd: RawFd, ready: Ready },
    Timer,
}

type Task = Box<dyn FnOnce() + Send>;

enum Work {
    Task(Task),
    Event(Event),
    Poll,
}

struct SocketEntry {
    fd: RawFd,
    interest: Interest,
    /// user_data of the in-flight PollAdd, if any.
    armed: Option<UserData>,
}

enum PendingOp {
    PollAdd { fd: RawFd, mask: u32, ud: UserData },
    Timeout { generation: u32 },
    Cancel { target: UserData },
}

struct State {
    stopped: bool,
    /// A thread currently owns the ring wait.
    poller: bool,
    handler: Option<Weak<dyn EventHandler>>,
    tasks: VecDeque<Task>,
    events: VecDeque<Event>,
    sockets: Slab<SocketEntry>,
    by_fd: HashMap<RawFd, usize>,
    /// SQEs queued for the next ring owner to submit.
    pending: Vec<PendingOp>,
    /// Monotonic generation for stale-CQE detection.
    next_generation: u32,
    /// Timespec storage for in-flight timeout ops, keyed by generation.
    /// Boxed so the address stays valid until the CQE arrives.
    timer_live: HashMap<u32, Box<io_uring::types::Timespec>>,
    /// Generation of the armed, still-wanted timer.
    timer_current: Option<u32>,
    wake_armed: bool,
    wake_buf: Box<[u8; 8]>,
}

/// A cooperative event loop multiplexing socket readiness and one deadline
/// timer.
///
/// All mutations go through a single internal mutex. `run()` may be entered
/// by any number of worker threads; one at a time blocks on the ring while
/// the others execute dispatched closures and deliver queued events.
pub struct Reactor {
    state: Mutex<State>,
    cv: Condvar,
    ring: Mutex<Ring>,
    wakefd: RawFd,
    max_sockets: usize,
}

impl Reactor {
    /// Create a reactor with the given configuration.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let wakefd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakefd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let ring = match Ring::setup(&config) {
            Ok(ring) => ring,
            Err(e) => {
                unsafe { libc::close(wakefd) };
                return Err(Error::Io(e));
            }
        };

        Ok(Reactor {
            state: Mutex::new(State {
                stopped: false,
                poller: false,
                handler: None,
                tasks: VecDeque::new(),
                events: VecDeque::new(),
                sockets: Slab::with_capacity(64),
                by_fd: HashMap::new(),
                pending: Vec::new(),
                next_generation: 0,
                timer_live: HashMap::new(),
                timer_current: None,
                wake_armed: false,
                wake_buf: Box::new([0u8; 8]),
            }),
            cv: Condvar::new(),
            ring: Mutex::new(ring),
            wakefd,
            max_sockets: config.max_sockets as usize,
        })
    }

    /// Install the event handler. The reactor holds a weak reference so the
    /// transport and the reactor can own each other without leaking.
    pub fn set_handler(&self, handler: Weak<dyn EventHandler>) {
        let mut st = self.state.lock().unwrap();
        st.handler = Some(handler);
    }

    /// Register `fd` (or update its registration) with the given interest.
    ///
    /// Registrations are one-shot: after the readiness event is delivered
    /// the fd stays known to the reactor but unarmed until the next
    /// `watch()`. `Interest::None` clears the armed poll without forgetting
    /// the fd.
    pub fn watch(&self, fd: RawFd, interest: Interest) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();
        let idx = match st.by_fd.get(&fd) {
            Some(&idx) => idx,
            None => {
                if st.sockets.len() >= self.max_sockets {
                    return Err(Error::SocketLimitReached);
                }
                let idx = st.sockets.insert(SocketEntry {
                    fd,
                    interest: Interest::None,
                    armed: None,
                });
                st.by_fd.insert(fd, idx);
                idx
            }
        };

        // Retire any in-flight poll before arming the new one.
        if let Some(old) = st.sockets[idx].armed.take() {
            st.pending.push(PendingOp::Cancel { target: old });
        }

        st.sockets[idx].interest = interest;
        if interest != Interest::None {
            st.next_generation = st.next_generation.wrapping_add(1);
            let ud = UserData::encode(OpTag::Poll, idx as u32, st.next_generation);
            st.sockets[idx].armed = Some(ud);
            st.pending.push(PendingOp::PollAdd {
                fd,
                mask: interest.poll_mask(),
                ud,
            });
        }

        self.kick(&mut st);
        Ok(())
    }

    /// Deregister `fd` entirely, cancelling any in-flight poll.
    pub fn unwatch(&self, fd: RawFd) {
        let mut st = self.state.lock().unwrap();
        if let Some(idx) = st.by_fd.remove(&fd) {
            let entry = st.sockets.remove(idx);
            if let Some(old) = entry.armed {
                st.pending.push(PendingOp::Cancel { target: old });
            }
            self.kick(&mut st);
        }
    }

    /// Arm the deadline timer `ms` milliseconds from now, replacing any
    /// previously armed deadline. A deadline of 0 fires on the next loop
    /// turn (from dispatch context, never re-entrantly from the caller).
    pub fn set_timer(&self, ms: u64) {
        let mut st = self.state.lock().unwrap();
        self.cancel_timer_locked(&mut st);

        if ms == 0 {
            st.events.push_back(Event::Timer);
            metrics::TIMER_FIRED.increment();
        } else {
            st.next_generation = st.next_generation.wrapping_add(1);
            let generation = st.next_generation;
            let ts = Box::new(
                io_uring::types::Timespec::new()
                    .sec(ms / 1000)
                    .nsec((ms % 1000) as u32 * 1_000_000),
            );
            st.timer_live.insert(generation, ts);
            st.timer_current = Some(generation);
            st.pending.push(PendingOp::Timeout { generation });
        }

        self.kick(&mut st);
    }

    /// Cancel the pending deadline timer, if any.
    pub fn clear_timer(&self) {
        let mut st = self.state.lock().unwrap();
        self.cancel_timer_locked(&mut st);
        self.kick(&mut st);
    }

    fn cancel_timer_locked(&self, st: &mut State) {
        if let Some(generation) = st.timer_current.take() {
            st.pending.push(PendingOp::Cancel {
                target: UserData::encode(OpTag::Timer, 0, generation),
            });
        }
    }

    /// Post a closure to be executed by a thread inside `run()`.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        let mut st = self.state.lock().unwrap();
        st.tasks.push_back(Box::new(task));
        self.kick(&mut st);
    }

    /// Make every `run()` return.
    pub fn stop(&self) {
        let mut st = self.state.lock().unwrap();
        st.stopped = true;
        self.kick(&mut st);
    }

    /// Whether `stop()` has been called.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    /// Run the event loop on the calling thread until [`stop`](Self::stop).
    ///
    /// Multiple threads may call `run()` concurrently; together they act as
    /// a pool executing readiness callbacks and dispatched closures.
    pub fn run(&self) -> Result<(), Error> {
        loop {
            let work = {
                let mut st = self.state.lock().unwrap();
                loop {
                    if st.stopped {
                        self.cv.notify_all();
                        return Ok(());
                    }
                    if let Some(task) = st.tasks.pop_front() {
                        break Work::Task(task);
                    }
                    if let Some(event) = st.events.pop_front() {
                        break Work::Event(event);
                    }
                    if !st.poller {
                        st.poller = true;
                        break Work::Poll;
                    }
                    st = self.cv.wait(st).unwrap();
                }
            };

            match work {
                Work::Task(task) => {
                    metrics::DISPATCH_EXECUTED.increment();
                    task();
                }
                Work::Event(event) => self.deliver(event),
                Work::Poll => {
                    let result = self.poll_once();
                    {
                        let mut st = self.state.lock().unwrap();
                        st.poller = false;
                    }
                    self.cv.notify_all();
                    result?;
                }
            }
        }
    }

    /// One ring turn: flush queued SQEs, wait for a completion if there is
    /// nothing else to do, then translate CQEs into queued events.
    fn poll_once(&self) -> Result<(), Error> {
        let mut ring = self.ring.lock().unwrap();

        let should_wait = {
            let mut st = self.state.lock().unwrap();
            if !st.wake_armed {
                let buf = st.wake_buf.as_mut_ptr();
                ring.submit_eventfd_read(self.wakefd, buf, UserData::encode(OpTag::Wake, 0, 0))?;
                st.wake_armed = true;
            }
            Self::flush_pending(&mut st, &mut ring)?;
            !st.stopped && st.tasks.is_empty() && st.events.is_empty()
        };

        if should_wait {
            ring.submit_and_wait()?;
        } else {
            ring.flush()?;
        }

        let mut cqes = Vec::new();
        ring.drain_completions(&mut cqes);
        drop(ring);

        if !cqes.is_empty() {
            let mut st = self.state.lock().unwrap();
            for (raw, result) in cqes {
                Self::process_cqe(&mut st, UserData(raw), result);
            }
        }
        Ok(())
    }

    fn flush_pending(st: &mut State, ring: &mut Ring) -> Result<(), io::Error> {
        let ops = std::mem::take(&mut st.pending);
        for op in ops {
            match op {
                PendingOp::PollAdd { fd, mask, ud } => ring.submit_poll_add(fd, mask, ud)?,
                PendingOp::Timeout { generation } => {
                    if let Some(ts) = st.timer_live.get(&generation) {
                        let ptr: *const io_uring::types::Timespec = &**ts;
                        ring.submit_timeout(ptr, UserData::encode(OpTag::Timer, 0, generation))?;
                    }
                }
                PendingOp::Cancel { target } => {
                    ring.submit_async_cancel(target, UserData::encode(OpTag::Cancel, 0, 0))?
                }
            }
        }
        Ok(())
    }

    fn process_cqe(st: &mut State, ud: UserData, result: i32) {
        match ud.tag() {
            Some(OpTag::Wake) => {
                st.wake_armed = false;
                metrics::WAKEUPS.increment();
            }
            Some(OpTag::Poll) => {
                let idx = ud.token() as usize;
                let Some(entry) = st.sockets.get_mut(idx) else {
                    return;
                };
                if entry.armed != Some(ud) {
                    // Superseded or cancelled registration.
                    return;
                }
                entry.armed = None;
                if result == -libc::ECANCELED {
                    return;
                }
                let ready = if result < 0 {
                    Ready::ERR
                } else {
                    Ready::from_poll_revents(result as i16)
                };
                st.events.push_back(Event::Socket {
                    fd: entry.fd,
                    ready,
                });
            }
            Some(OpTag::Timer) => {
                let generation = ud.generation();
                st.timer_live.remove(&generation);
                if st.timer_current == Some(generation) {
                    st.timer_current = None;
                    if result == -libc::ETIME || result >= 0 {
                        st.events.push_back(Event::Timer);
                        metrics::TIMER_FIRED.increment();
                    }
                }
            }
            Some(OpTag::Cancel) | None => {}
        }
    }

    fn deliver(&self, event: Event) {
        let handler = {
            let st = self.state.lock().unwrap();
            st.handler.as_ref().and_then(|weak| weak.upgrade())
        };
        let Some(handler) = handler else {
            log::debug!("event dropped: no handler installed");
            return;
        };
        metrics::EVENTS_DELIVERED.increment();
        match event {
            Event::Socket { fd, ready } => handler.socket_ready(fd, ready),
            Event::Timer => handler.timer_expired(),
        }
    }

    /// Wake the current ring owner (if any) and any parked workers.
    fn kick(&self, st: &mut State) {
        self.cv.notify_all();
        if st.poller {
            let val: u64 = 1;
            unsafe {
                libc::write(self.wakefd, &val as *const u64 as *const libc::c_void, 8);
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakefd);
        }
    }
}
