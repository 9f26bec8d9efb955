// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Linux poller, backed by epoll.
//!
//! Registration is level-triggered for both directions; the loop's own
//! queue bookkeeping decides which direction to drain.

use std::io;
use std::os::unix::io::RawFd;

use crate::evloop::event::{RawDesc, Ready};

const MAX_EVENTS: usize = 64;

#[expect(clippy::cast_sign_loss, reason = "epoll flag constants are positive")]
const INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP) as u32;
#[expect(clippy::cast_sign_loss, reason = "epoll flag constants are positive")]
const READABLE: u32 = libc::EPOLLIN as u32;
#[expect(clippy::cast_sign_loss, reason = "epoll flag constants are positive")]
const WRITABLE: u32 = libc::EPOLLOUT as u32;
#[expect(clippy::cast_sign_loss, reason = "epoll flag constants are positive")]
const ERROR: u32 = (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;

#[derive(Debug)]
pub struct Poller {
    epfd: RawFd,
}

// === impl Poller ===

impl Poller {
    pub fn new() -> io::Result<Self> {
        // Safety: plain syscall, no pointers involved
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { epfd })
    }

    pub fn add(&self, fd: RawDesc) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: INTEREST,
            u64: u64::from(fd.cast_unsigned()),
        };

        // Safety: epfd and fd are live descriptors, ev outlives the call
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawDesc) -> io::Result<()> {
        // Safety: a null event pointer is allowed for EPOLL_CTL_DEL
        let rc =
            unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn wait(&self, timeout_ms: u64, out: &mut Vec<Ready>) -> io::Result<()> {
        // Safety: epoll_event is plain old data, zeroes are a valid value
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        let timeout = i32::try_from(timeout_ms).unwrap_or(i32::MAX);

        // Safety: the events buffer is valid for MAX_EVENTS entries
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                i32::try_from(MAX_EVENTS).expect("MAX_EVENTS fits i32"),
                timeout,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        for event in events.iter().take(usize::try_from(n).unwrap_or(0)) {
            #[expect(clippy::cast_possible_truncation, reason = "fd stored in the low half")]
            #[expect(clippy::cast_possible_wrap, reason = "fd round-trips through u64")]
            let fd = event.u64 as RawDesc;

            let flags = event.events;
            let err = flags & ERROR != 0;

            out.push(Ready {
                fd,
                // an error or hangup wakes both directions so the callbacks
                // observe it through their syscall
                readable: err || flags & READABLE != 0,
                writable: err || flags & WRITABLE != 0,
            });
        }

        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // Safety: epfd is owned by this poller
        unsafe { libc::close(self.epfd) };
    }
}
