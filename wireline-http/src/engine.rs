//! The multiplexing engine: owns every in-flight transfer, plugs them into
//! the reactor, and drains completions.
//!
//! Registry mutations happen under one mutex; the aggregate timings live
//! under their own so `Client::timings()` never contends with user
//! callbacks. `notify_finished` always runs outside the registry lock.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use slab::Slab;
use wireline::{EventHandler, Reactor, Ready};

use crate::timings::{Timings, TimingsAccumulator, TransferTimings};
use crate::transfer::{DriveStatus, Transfer};

struct Entry {
    transfer: Transfer,
    token: u64,
    fd: Option<RawFd>,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct Registry {
    entries: Slab<Entry>,
    by_fd: HashMap<RawFd, usize>,
    next_token: u64,
}

pub(crate) struct Engine {
    reactor: Arc<Reactor>,
    registry: Mutex<Registry>,
    timings: Mutex<TimingsAccumulator>,
}

impl Engine {
    pub fn new(reactor: Arc<Reactor>) -> Arc<Engine> {
        let engine = Arc::new(Engine {
            reactor,
            registry: Mutex::new(Registry::default()),
            timings: Mutex::new(TimingsAccumulator::default()),
        });
        let engine_dyn: Arc<dyn EventHandler> = engine.clone();
        let weak: Weak<dyn EventHandler> = Arc::downgrade(&engine_dyn);
        engine.reactor.set_handler(weak);
        engine
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Register a transfer without driving it yet. The returned (id, token)
    /// pair addresses it for pause/resume.
    pub fn insert(&self, transfer: Transfer) -> (usize, u64) {
        let mut reg = self.registry.lock().unwrap();
        reg.next_token += 1;
        let token = reg.next_token;
        let id = reg.entries.insert(Entry {
            transfer,
            token,
            fd: None,
            deadline: None,
        });
        (id, token)
    }

    /// First drive of a registered transfer.
    pub fn start(&self, id: usize) {
        let mut finished = Vec::new();
        {
            let mut reg = self.registry.lock().unwrap();
            self.drive_locked(&mut reg, id, Ready::empty(), &mut finished);
            self.update_timer(&reg);
        }
        self.complete(finished);
    }

    /// Pause or resume a transfer, then re-drive so its interest updates.
    /// Runs on a reactor worker via `dispatch`.
    pub fn set_paused(&self, id: usize, token: u64, paused: bool) {
        let mut finished = Vec::new();
        {
            let mut reg = self.registry.lock().unwrap();
            match reg.entries.get_mut(id) {
                Some(entry) if entry.token == token => entry.transfer.set_paused(paused),
                _ => return, // completed (or slot reused) in the meantime
            }
            self.drive_locked(&mut reg, id, Ready::empty(), &mut finished);
            self.update_timer(&reg);
        }
        self.complete(finished);
    }

    /// Abort every in-flight transfer (client stop).
    pub fn abort_all(&self) {
        let mut finished = Vec::new();
        {
            let mut reg = self.registry.lock().unwrap();
            let ids: Vec<usize> = reg.entries.iter().map(|(id, _)| id).collect();
            for id in ids {
                if let Some(entry) = reg.entries.get_mut(id) {
                    entry.transfer.abort();
                }
                self.drive_locked(&mut reg, id, Ready::empty(), &mut finished);
            }
            self.update_timer(&reg);
        }
        self.complete(finished);
    }

    pub fn record_timings(&self, timings: &TransferTimings) {
        self.timings.lock().unwrap().record(timings);
    }

    pub fn timings(&self) -> Timings {
        self.timings.lock().unwrap().snapshot()
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.registry.lock().unwrap().entries.len()
    }

    /// Drive one transfer, apply its interest and deadline, and move it to
    /// `finished` when it completes.
    fn drive_locked(
        &self,
        reg: &mut Registry,
        id: usize,
        ready: Ready,
        finished: &mut Vec<Transfer>,
    ) {
        let Some(entry) = reg.entries.get_mut(id) else {
            return;
        };
        let old_fd = entry.fd;

        if let DriveStatus::Continue { interest, deadline } = entry.transfer.drive(ready) {
            entry.deadline = deadline;
            let new_fd = entry.transfer.fd();
            if old_fd != new_fd {
                if let Some(fd) = old_fd {
                    reg.by_fd.remove(&fd);
                    self.reactor.unwatch(fd);
                }
                if let Some(fd) = new_fd {
                    reg.by_fd.insert(fd, id);
                }
                entry.fd = new_fd;
            }
            if let Some(fd) = new_fd {
                if let Err(e) = self.reactor.watch(fd, interest) {
                    log::warn!("watch failed for fd {fd}: {e}");
                    entry.transfer.abort();
                }
            }
        }

        if reg
            .entries
            .get(id)
            .is_some_and(|entry| entry.transfer.is_finished())
        {
            let entry = reg.entries.remove(id);
            if let Some(fd) = entry.fd {
                reg.by_fd.remove(&fd);
                self.reactor.unwatch(fd);
            }
            self.timings
                .lock()
                .unwrap()
                .record(&entry.transfer.take_timings());
            finished.push(entry.transfer);
        }
    }

    /// Invoke finished callbacks and release transports, outside the
    /// registry lock.
    fn complete(&self, finished: Vec<Transfer>) {
        for mut transfer in finished {
            transfer.notify_finished();
            transfer.release_transport();
        }
    }

    /// Point the reactor timer at the earliest transfer deadline.
    fn update_timer(&self, reg: &Registry) {
        let next = reg.entries.iter().filter_map(|(_, e)| e.deadline).min();
        match next {
            Some(deadline) => {
                let ms = deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis() as u64;
                self.reactor.set_timer(ms);
            }
            None => self.reactor.clear_timer(),
        }
    }
}

impl EventHandler for Engine {
    fn socket_ready(&self, fd: RawFd, ready: Ready) {
        let mut finished = Vec::new();
        {
            let mut reg = self.registry.lock().unwrap();
            if let Some(&id) = reg.by_fd.get(&fd) {
                self.drive_locked(&mut reg, id, ready, &mut finished);
            }
            self.update_timer(&reg);
        }
        self.complete(finished);
    }

    fn timer_expired(&self) {
        let now = Instant::now();
        let mut finished = Vec::new();
        {
            let mut reg = self.registry.lock().unwrap();
            let due: Vec<usize> = reg
                .entries
                .iter()
                .filter(|(_, entry)| entry.deadline.is_some_and(|d| d <= now))
                .map(|(id, _)| id)
                .collect();
            for id in due {
                self.drive_locked(&mut reg, id, Ready::empty(), &mut finished);
            }
            self.update_timer(&reg);
        }
        self.complete(finished);
    }
}
