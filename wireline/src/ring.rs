use std::io;
use std::os::fd::RawFd;

use io_uring::types::Fd;
use io_uring::{opcode, squeue, IoUring};

use crate::completion::UserData;
use crate::config::Config;

/// Wrapper around IoUring providing high-level SQE submission helpers.
///
/// The reactor uses the ring in readiness mode only: one-shot `PollAdd`
/// per socket interest, `Timeout` for the deadline timer, `AsyncCancel`
/// to retire superseded operations, and a `Read` on an eventfd so other
/// threads can interrupt `submit_and_wait`.
pub struct Ring {
    ring: IoUring,
}

impl Ring {
    /// Create and configure the io_uring instance.
    pub fn setup(config: &Config) -> io::Result<Self> {
        let cq_entries = config
            .sq_entries
            .checked_mul(4)
            .unwrap_or(config.sq_entries);

        let mut builder = IoUring::builder();
        builder.setup_cqsize(cq_entries);
        let ring = builder.build(config.sq_entries)?;
        Ok(Ring { ring })
    }

    /// Submit a one-shot poll for the given fd and poll mask.
    pub fn submit_poll_add(
        &mut self,
        fd: RawFd,
        mask: u32,
        user_data: UserData,
    ) -> io::Result<()> {
        let entry = opcode::PollAdd::new(Fd(fd), mask)
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit a timeout SQE. The timespec must remain valid until the CQE
    /// arrives (fire or cancel).
    pub fn submit_timeout(
        &mut self,
        timespec: *const io_uring::types::Timespec,
        user_data: UserData,
    ) -> io::Result<()> {
        let entry = opcode::Timeout::new(timespec)
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit an async cancel targeting a specific user_data value.
    pub fn submit_async_cancel(&mut self, target: UserData, user_data: UserData) -> io::Result<()> {
        let entry = opcode::AsyncCancel::new(target.raw())
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit an eventfd read (8 bytes).
    pub fn submit_eventfd_read(
        &mut self,
        eventfd: RawFd,
        buf: *mut u8,
        user_data: UserData,
    ) -> io::Result<()> {
        let entry = opcode::Read::new(Fd(eventfd), buf, 8)
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit all pending SQEs and wait for at least one CQE.
    pub fn submit_and_wait(&self) -> io::Result<()> {
        self.ring.submitter().submit_and_wait(1)?;
        Ok(())
    }

    /// Submit pending SQEs without waiting.
    pub fn flush(&self) -> io::Result<()> {
        self.ring.submit()?;
        Ok(())
    }

    /// Drain all available CQEs into `out` as (user_data, result) pairs.
    pub fn drain_completions(&mut self, out: &mut Vec<(u64, i32)>) {
        for cqe in self.ring.completion() {
            out.push((cqe.user_data(), cqe.result()));
        }
    }

    /// Push an SQE to the submission queue.
    ///
    /// # Safety
    /// The SQE must reference valid memory for the lifetime of the operation.
    unsafe fn push_sqe(&mut self, entry: squeue::Entry) -> io::Result<()> {
        // Try to push; if SQ is full, submit first to make room.
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                if self.ring.submission().push(&entry).is_err() {
                    crate::metrics::SQE_SUBMIT_FAILURES.increment();
                    return Err(io::Error::other("SQ still full after submit"));
                }
            }
        }
        Ok(())
    }
}
