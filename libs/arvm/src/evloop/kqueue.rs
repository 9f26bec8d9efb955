// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Darwin/BSD poller, backed by kqueue.
//!
//! Read and write filters are registered as a pair when a descriptor first
//! gains pending events and dropped together when its queues drain.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::evloop::event::{RawDesc, Ready};

const MAX_EVENTS: usize = 64;

#[derive(Debug)]
pub struct Poller {
    kq: RawFd,
}

// === impl Poller ===

impl Poller {
    pub fn new() -> io::Result<Self> {
        // Safety: plain syscall
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { kq })
    }

    fn change(&self, fd: RawDesc, flags: u16) -> io::Result<()> {
        let mut changes: [libc::kevent; 2] =
            // Safety: kevent is plain old data, zeroes are a valid value
            unsafe { std::mem::zeroed() };

        for (change, filter) in changes
            .iter_mut()
            .zip([libc::EVFILT_READ, libc::EVFILT_WRITE])
        {
            change.ident = usize::try_from(fd).unwrap_or(0);
            change.filter = filter;
            change.flags = flags;
        }

        // Safety: the change list is valid for two entries
        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                2,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn add(&self, fd: RawDesc) -> io::Result<()> {
        self.change(fd, libc::EV_ADD)
    }

    pub fn delete(&self, fd: RawDesc) -> io::Result<()> {
        self.change(fd, libc::EV_DELETE)
    }

    pub fn wait(&self, timeout_ms: u64, out: &mut Vec<Ready>) -> io::Result<()> {
        // Safety: kevent is plain old data, zeroes are a valid value
        let mut events: [libc::kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        let ts = libc::timespec {
            tv_sec: i64::try_from(timeout_ms / 1000).unwrap_or(i64::MAX),
            tv_nsec: i64::try_from((timeout_ms % 1000) * 1_000_000).unwrap_or(0),
        };

        // Safety: the event buffer is valid for MAX_EVENTS entries
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                events.as_mut_ptr(),
                i32::try_from(MAX_EVENTS).expect("MAX_EVENTS fits i32"),
                &ts,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        for event in events.iter().take(usize::try_from(n).unwrap_or(0)) {
            let fd = RawDesc::try_from(event.ident).unwrap_or(-1);
            let err = event.flags & (libc::EV_ERROR | libc::EV_EOF) != 0;

            out.push(Ready {
                fd,
                readable: err || event.filter == libc::EVFILT_READ,
                writable: err || event.filter == libc::EVFILT_WRITE,
            });
        }

        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // Safety: kq is owned by this poller
        unsafe { libc::close(self.kq) };
    }
}
