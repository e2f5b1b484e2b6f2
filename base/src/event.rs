// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::mem;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

use libc::c_void;

use crate::errno_result;
use crate::Result;

/// Result of [`Event::wait_timeout`].
#[derive(PartialEq, Eq, Debug)]
pub enum EventWaitResult {
    /// The event was signaled and its count was cleared.
    Signaled,
    /// The timeout elapsed first.
    TimedOut,
}

/// An eventfd (man 2 eventfd). Writes signal the event; reads wait for a signal and clear it.
///
/// The vhost-user frontend hands these over as per-queue *kick* (driver to device) and *call*
/// (device to driver) notifiers.
#[derive(Debug)]
pub struct Event {
    fd: OwnedFd,
}

impl Event {
    /// Creates a new eventfd with a count of zero.
    pub fn new() -> Result<Event> {
        // SAFETY:
        // eventfd only allocates a descriptor for our process; the error case is handled.
        let ret = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if ret < 0 {
            return errno_result();
        }
        // SAFETY:
        // `ret` is a fresh descriptor owned by nobody else.
        Ok(Event {
            fd: unsafe { OwnedFd::from_raw_fd(ret) },
        })
    }

    /// Adds one to the event count.
    pub fn signal(&self) -> Result<()> {
        let v: u64 = 1;
        // SAFETY:
        // We own the fd and pass a pointer and size that describe `v` exactly.
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &v as *const u64 as *const c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret <= 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Blocks until the count is non-zero, then returns it and resets it to zero.
    pub fn wait(&self) -> Result<u64> {
        let mut buf: u64 = 0;
        // SAFETY:
        // We own the fd and pass a pointer and size that describe `buf` exactly.
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut buf as *mut u64 as *mut c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret <= 0 {
            return errno_result();
        }
        Ok(buf)
    }

    /// Like [`Event::wait`] but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<EventWaitResult> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ts = libc::timespec {
            tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        // SAFETY:
        // ppoll only writes `pfd`, which lives on our stack; the return value is checked.
        let ret = unsafe { libc::ppoll(&mut pfd, 1, &ts, ptr::null()) };
        if ret < 0 {
            return errno_result();
        }
        if pfd.revents == 0 {
            return Ok(EventWaitResult::TimedOut);
        }
        self.wait()?;
        Ok(EventWaitResult::Signaled)
    }

    /// Duplicates the descriptor. Both instances share one kernel counter.
    pub fn try_clone(&self) -> Result<Event> {
        Ok(Event {
            fd: self.fd.try_clone()?,
        })
    }
}

impl AsRawFd for Event {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<OwnedFd> for Event {
    fn from(fd: OwnedFd) -> Self {
        Event { fd }
    }
}
