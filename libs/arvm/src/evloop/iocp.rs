// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Windows poller.
//!
//! Readiness is emulated with `WSAPoll` over the registered socket set so
//! the loop core can stay identical across platforms.
//!
//! TODO: replace the WSAPoll emulation with a real completion port
//! (CreateIoCompletionPort + WSARecv/WSASend overlapped submissions and
//! AcceptEx for listeners) once the socket natives carry OVERLAPPED state.

use std::io;
use std::sync::Mutex;

use windows_sys::Win32::Networking::WinSock::{
    POLLERR, POLLHUP, POLLRDNORM, POLLWRNORM, SOCKET_ERROR, WSAPOLLFD, WSAPoll,
};

use crate::evloop::event::{RawDesc, Ready};

#[derive(Debug)]
pub struct Poller {
    sockets: Mutex<Vec<RawDesc>>,
}

// === impl Poller ===

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            sockets: Mutex::new(Vec::new()),
        })
    }

    pub fn add(&self, fd: RawDesc) -> io::Result<()> {
        let mut sockets = self.sockets.lock().unwrap();
        if !sockets.contains(&fd) {
            sockets.push(fd);
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawDesc) -> io::Result<()> {
        self.sockets.lock().unwrap().retain(|s| *s != fd);
        Ok(())
    }

    pub fn wait(&self, timeout_ms: u64, out: &mut Vec<Ready>) -> io::Result<()> {
        let sockets = self.sockets.lock().unwrap().clone();
        if sockets.is_empty() {
            std::thread::sleep(std::time::Duration::from_millis(timeout_ms.min(50)));
            return Ok(());
        }

        let mut fds: Vec<WSAPOLLFD> = sockets
            .iter()
            .map(|fd| WSAPOLLFD {
                fd: usize::try_from(*fd).unwrap_or(0),
                events: POLLRDNORM | POLLWRNORM,
                revents: 0,
            })
            .collect();

        let timeout = i32::try_from(timeout_ms).unwrap_or(i32::MAX);

        // Safety: fds is a live buffer of initialized WSAPOLLFD entries
        let n = unsafe {
            WSAPoll(
                fds.as_mut_ptr(),
                u32::try_from(fds.len()).unwrap_or(0),
                timeout,
            )
        };
        if n == SOCKET_ERROR {
            return Err(io::Error::last_os_error());
        }

        for pollfd in &fds {
            if pollfd.revents == 0 {
                continue;
            }

            let err = pollfd.revents & (POLLERR | POLLHUP) != 0;
            out.push(Ready {
                fd: RawDesc::try_from(pollfd.fd).unwrap_or(-1),
                readable: err || pollfd.revents & POLLRDNORM != 0,
                writable: err || pollfd.revents & POLLWRNORM != 0,
            });
        }

        Ok(())
    }
}
