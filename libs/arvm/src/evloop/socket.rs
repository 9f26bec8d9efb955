// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Non-blocking TCP sockets.
//!
//! Sockets are the canonical event-loop initiators: every operation either
//! completes immediately against the non-blocking descriptor or registers
//! an [`Event`] and parks the calling fiber. Completion callbacks run on
//! the loop thread and perform the actual transfer when the descriptor
//! signals readiness.
//!
//! Addresses are numeric (`"127.0.0.1"`, `"::1"`); name resolution blocks
//! and has no place on the loop thread.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, LazyLock};

use crate::object::typeinfo::{TypeHandle, TypeInfo};
use crate::object::{ObjRef, Object, OpResult, Payload, error};

pub static SOCKET_TYPE: LazyLock<TypeHandle> = LazyLock::new(|| {
    let mut typ = TypeInfo::builtin("socket");
    typ.repr = Some(|obj| {
        let Payload::Socket(socket) = obj.payload() else {
            unreachable!("socket repr on non-socket payload")
        };
        Ok(format!("<socket fd={}>", socket.raw()))
    });
    Arc::new(typ)
});

pub struct Socket {
    /// Raw descriptor; -1 once closed.
    fd: AtomicI32,
}

// === impl Socket ===

impl Socket {
    pub fn raw(&self) -> i32 {
        self.fd.load(Ordering::Acquire)
    }

    /// Descriptor for an operation, failing on a closed socket.
    pub fn descriptor(&self) -> OpResult<i32> {
        match self.raw() {
            -1 => Err(error::os_error(
                libc_ebadf(),
                "operation on a closed socket",
            )),
            fd => Ok(fd),
        }
    }

    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd != -1 {
            sys_close(fd);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

pub fn socket_obj(fd: i32) -> ObjRef {
    Object::new(
        Arc::clone(&SOCKET_TYPE),
        Payload::Socket(Socket {
            fd: AtomicI32::new(fd),
        }),
    )
}

pub fn as_socket(obj: &ObjRef) -> OpResult<&Socket> {
    match obj.payload() {
        Payload::Socket(socket) => Ok(socket),
        _ => Err(error::type_error(format!(
            "expected 'socket', got '{}'",
            obj.type_name()
        ))),
    }
}

fn libc_ebadf() -> i32 {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            libc::EBADF
        } else {
            9
        }
    }
}

fn sys_close(fd: i32) {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            // Safety: the descriptor was owned by this socket
            unsafe { libc::close(fd) };
        } else {
            let _ = fd;
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub use unix::*;
    } else {
        pub use fallback::*;
    }
}

#[cfg(unix)]
mod unix {
    use std::net::{IpAddr, SocketAddr};
    use std::sync::Arc;

    use super::{as_socket, socket_obj};
    use crate::evloop::event::{Direction, Event, EventBuffer, EventStatus};
    use crate::object::{ObjRef, bytes, error, integer, nil, string};
    use crate::vm::native::{NativeCtx, NativeOutcome, NativeResult};

    /// Initial `recv_all` chunk; doubled on every full read.
    const RECV_ALL_CHUNK: usize = 4096;

    fn last_errno() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    fn would_block(errno: i32) -> bool {
        errno == libc::EWOULDBLOCK || errno == libc::EAGAIN || errno == libc::EINTR
    }

    /// A fresh non-blocking, close-on-exec TCP socket for `addr`.
    fn new_socket(addr: &SocketAddr) -> Result<i32, ObjRef> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };

        // Safety: plain syscall
        let fd = unsafe {
            libc::socket(
                family,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(error::os_error(last_errno(), "socket"));
        }
        Ok(fd)
    }

    /// Encode a socket address for the kernel.
    fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
        // Safety: sockaddr_storage is plain old data, zeroes are valid
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: u16::try_from(libc::AF_INET).unwrap_or(2),
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                // Safety: sockaddr_in fits in sockaddr_storage
                unsafe {
                    std::ptr::write(std::ptr::from_mut(&mut storage).cast::<libc::sockaddr_in>(), sin);
                }
                size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: u16::try_from(libc::AF_INET6).unwrap_or(10),
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: v6.scope_id(),
                };
                // Safety: sockaddr_in6 fits in sockaddr_storage
                unsafe {
                    std::ptr::write(
                        std::ptr::from_mut(&mut storage).cast::<libc::sockaddr_in6>(),
                        sin6,
                    );
                }
                size_of::<libc::sockaddr_in6>()
            }
        };

        (storage, libc::socklen_t::try_from(len).unwrap_or(0))
    }

    fn parse_addr(addr: &ObjRef, port: &ObjRef) -> Result<SocketAddr, ObjRef> {
        let host = string::expect_str(addr, "socket address")?;
        let port = integer::expect_int(port, "socket port")?;

        let ip: IpAddr = host.parse().map_err(|_| {
            error::value_error(format!("invalid numeric address '{host}'"))
        })?;
        let port = u16::try_from(port)
            .map_err(|_| error::value_error(format!("invalid port {port}")))?;

        Ok(SocketAddr::new(ip, port))
    }

    // completion callbacks, run on the loop thread

    fn recv_cb(event: &mut Event) -> EventStatus {
        let fd = event.fd;
        let want = event.buffer.want;
        event.buffer.data.resize(want, 0);

        // Safety: the buffer is live and sized to `want`
        let n = unsafe {
            libc::recv(
                fd,
                event.buffer.data.as_mut_ptr().cast(),
                want,
                0,
            )
        };

        if n < 0 {
            let errno = last_errno();
            if would_block(errno) {
                return EventStatus::Again;
            }
            return EventStatus::Complete(Err(error::os_error(errno, "recv")));
        }

        let n = usize::try_from(n).unwrap_or(0);
        event.buffer.data.truncate(n);
        EventStatus::Complete(Ok(bytes::bytes(std::mem::take(&mut event.buffer.data))))
    }

    /// Streaming read: double the chunk on every full read, publish the
    /// accumulated bytes on the first short read or end of stream.
    fn recv_all_cb(event: &mut Event) -> EventStatus {
        let fd = event.fd;

        loop {
            let want = event.buffer.want;
            let filled = event.buffer.data.len();
            event.buffer.data.resize(filled + want, 0);

            // Safety: the tail of the buffer is live and sized to `want`
            let n = unsafe {
                libc::recv(
                    fd,
                    event.buffer.data[filled..].as_mut_ptr().cast(),
                    want,
                    0,
                )
            };

            if n < 0 {
                event.buffer.data.truncate(filled);
                let errno = last_errno();
                if would_block(errno) {
                    return EventStatus::Again;
                }
                return EventStatus::Complete(Err(error::os_error(errno, "recv")));
            }

            let n = usize::try_from(n).unwrap_or(0);
            event.buffer.data.truncate(filled + n);

            if n == want {
                // the kernel had at least a full chunk: grow and continue
                event.buffer.want = want * 2;
                continue;
            }

            // short read or end of stream: publish what accumulated
            let mut data = std::mem::take(&mut event.buffer.data);
            data.shrink_to_fit();
            return EventStatus::Complete(Ok(bytes::bytes(data)));
        }
    }

    fn send_cb(event: &mut Event) -> EventStatus {
        let fd = event.fd;

        while event.buffer.off < event.buffer.data.len() {
            let remaining = &event.buffer.data[event.buffer.off..];

            // Safety: remaining is a live slice
            let n = unsafe {
                libc::send(
                    fd,
                    remaining.as_ptr().cast(),
                    remaining.len(),
                    libc::MSG_NOSIGNAL,
                )
            };

            if n < 0 {
                let errno = last_errno();
                if would_block(errno) {
                    return EventStatus::Again;
                }
                return EventStatus::Complete(Err(error::os_error(errno, "send")));
            }

            event.buffer.off += usize::try_from(n).unwrap_or(0);
        }

        let sent = i64::try_from(event.buffer.off).unwrap_or(0);
        EventStatus::Complete(Ok(integer::integer(sent)))
    }

    fn accept_cb(event: &mut Event) -> EventStatus {
        // Safety: plain syscall with null address output
        let fd = unsafe {
            libc::accept4(
                event.fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd < 0 {
            let errno = last_errno();
            if would_block(errno) {
                return EventStatus::Again;
            }
            return EventStatus::Complete(Err(error::os_error(errno, "accept")));
        }

        EventStatus::Complete(Ok(socket_obj(fd)))
    }

    fn connect_cb(event: &mut Event) -> EventStatus {
        let mut err: i32 = 0;
        let mut len = libc::socklen_t::try_from(size_of::<i32>()).unwrap_or(4);

        // Safety: err/len are live outputs
        let rc = unsafe {
            libc::getsockopt(
                event.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                std::ptr::from_mut(&mut err).cast(),
                &mut len,
            )
        };

        if rc < 0 {
            return EventStatus::Complete(Err(error::os_error(last_errno(), "connect")));
        }
        if err != 0 {
            return EventStatus::Complete(Err(error::os_error(err, "connect")));
        }

        EventStatus::Complete(Ok(Arc::clone(&event.initiator)))
    }

    // natives

    /// `io.listen(addr, port)`: bound, listening, non-blocking socket.
    pub fn native_listen(
        _ctx: &mut NativeCtx<'_>,
        args: &[ObjRef],
        _kwargs: Option<&ObjRef>,
    ) -> NativeResult {
        let addr = parse_addr(&args[0], &args[1])?;
        let fd = new_socket(&addr)?;
        let (storage, len) = sockaddr_of(&addr);

        let one: i32 = 1;
        // Safety: `one` is a live i32
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                std::ptr::from_ref(&one).cast(),
                libc::socklen_t::try_from(size_of::<i32>()).unwrap_or(4),
            );
        }

        // Safety: storage/len describe a valid sockaddr
        let rc = unsafe { libc::bind(fd, std::ptr::from_ref(&storage).cast(), len) };
        if rc < 0 {
            let err = error::os_error(last_errno(), "bind");
            super::sys_close(fd);
            return Err(err);
        }

        // Safety: plain syscall
        let rc = unsafe { libc::listen(fd, 128) };
        if rc < 0 {
            let err = error::os_error(last_errno(), "listen");
            super::sys_close(fd);
            return Err(err);
        }

        Ok(NativeOutcome::Value(socket_obj(fd)))
    }

    /// `io.connect(addr, port)`: suspends until the connection completes.
    pub fn native_connect(
        ctx: &mut NativeCtx<'_>,
        args: &[ObjRef],
        _kwargs: Option<&ObjRef>,
    ) -> NativeResult {
        let addr = parse_addr(&args[0], &args[1])?;
        let fd = new_socket(&addr)?;
        let (storage, len) = sockaddr_of(&addr);

        // Safety: storage/len describe a valid sockaddr
        let rc = unsafe { libc::connect(fd, std::ptr::from_ref(&storage).cast(), len) };
        let sock = socket_obj(fd);

        if rc == 0 {
            return Ok(NativeOutcome::Value(sock));
        }

        let errno = last_errno();
        if errno != libc::EINPROGRESS {
            return Err(error::os_error(errno, "connect"));
        }

        ctx.rt.evloop.submit(Event {
            fiber: Arc::clone(ctx.fiber),
            initiator: Arc::clone(&sock),
            aux: None,
            buffer: EventBuffer::default(),
            callback: connect_cb,
            direction: Direction::Out,
            fd,
        });
        Ok(NativeOutcome::Suspend)
    }

    /// `io.accept(listener)`: suspends until a peer connects.
    pub fn native_accept(
        ctx: &mut NativeCtx<'_>,
        args: &[ObjRef],
        _kwargs: Option<&ObjRef>,
    ) -> NativeResult {
        let socket = as_socket(&args[0])?;
        let fd = socket.descriptor()?;

        ctx.rt.evloop.submit(Event {
            fiber: Arc::clone(ctx.fiber),
            initiator: Arc::clone(&args[0]),
            aux: None,
            buffer: EventBuffer::default(),
            callback: accept_cb,
            direction: Direction::In,
            fd,
        });
        Ok(NativeOutcome::Suspend)
    }

    /// `io.recv(socket, n)`: up to `n` bytes, empty at end of stream.
    pub fn native_recv(
        ctx: &mut NativeCtx<'_>,
        args: &[ObjRef],
        _kwargs: Option<&ObjRef>,
    ) -> NativeResult {
        let socket = as_socket(&args[0])?;
        let fd = socket.descriptor()?;
        let want = integer::expect_int(&args[1], "recv length")?;
        let want = usize::try_from(want)
            .map_err(|_| error::value_error("negative recv length".to_string()))?;

        ctx.rt.evloop.submit(Event {
            fiber: Arc::clone(ctx.fiber),
            initiator: Arc::clone(&args[0]),
            aux: None,
            buffer: EventBuffer {
                data: Vec::new(),
                want,
                off: 0,
            },
            callback: recv_cb,
            direction: Direction::In,
            fd,
        });
        Ok(NativeOutcome::Suspend)
    }

    /// `io.recv_all(socket)`: accumulate until the stream pauses or ends.
    pub fn native_recv_all(
        ctx: &mut NativeCtx<'_>,
        args: &[ObjRef],
        _kwargs: Option<&ObjRef>,
    ) -> NativeResult {
        let socket = as_socket(&args[0])?;
        let fd = socket.descriptor()?;

        ctx.rt.evloop.submit(Event {
            fiber: Arc::clone(ctx.fiber),
            initiator: Arc::clone(&args[0]),
            aux: None,
            buffer: EventBuffer {
                data: Vec::new(),
                want: RECV_ALL_CHUNK,
                off: 0,
            },
            callback: recv_all_cb,
            direction: Direction::In,
            fd,
        });
        Ok(NativeOutcome::Suspend)
    }

    /// `io.send(socket, data)`: suspends until the whole buffer is written,
    /// returns the byte count.
    pub fn native_send(
        ctx: &mut NativeCtx<'_>,
        args: &[ObjRef],
        _kwargs: Option<&ObjRef>,
    ) -> NativeResult {
        let socket = as_socket(&args[0])?;
        let fd = socket.descriptor()?;

        let mut data = Vec::new();
        crate::object::buffer_read(&args[1], &mut |view| data.extend_from_slice(view))?;

        ctx.rt.evloop.submit(Event {
            fiber: Arc::clone(ctx.fiber),
            initiator: Arc::clone(&args[0]),
            aux: None,
            buffer: EventBuffer {
                data,
                want: 0,
                off: 0,
            },
            callback: send_cb,
            direction: Direction::Out,
            fd,
        });
        Ok(NativeOutcome::Suspend)
    }

    /// `io.close(socket)`.
    pub fn native_close(
        _ctx: &mut NativeCtx<'_>,
        args: &[ObjRef],
        _kwargs: Option<&ObjRef>,
    ) -> NativeResult {
        let socket = as_socket(&args[0])?;
        socket.close();
        Ok(NativeOutcome::Value(nil::nil()))
    }

    /// `io.port(socket)`: the locally bound port.
    pub fn native_port(
        _ctx: &mut NativeCtx<'_>,
        args: &[ObjRef],
        _kwargs: Option<&ObjRef>,
    ) -> NativeResult {
        let socket = as_socket(&args[0])?;
        let fd = socket.descriptor()?;

        // Safety: storage/len are live outputs sized for any address family
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = libc::socklen_t::try_from(size_of::<libc::sockaddr_storage>()).unwrap_or(0);

        // Safety: storage/len describe a valid output buffer
        let rc = unsafe {
            libc::getsockname(fd, std::ptr::from_mut(&mut storage).cast(), &mut len)
        };
        if rc < 0 {
            return Err(error::os_error(last_errno(), "getsockname"));
        }

        let port = match i32::from(storage.ss_family) {
            family if family == libc::AF_INET => {
                // Safety: the kernel wrote a sockaddr_in for AF_INET
                let sin = unsafe {
                    std::ptr::read(std::ptr::from_ref(&storage).cast::<libc::sockaddr_in>())
                };
                u16::from_be(sin.sin_port)
            }
            family if family == libc::AF_INET6 => {
                // Safety: the kernel wrote a sockaddr_in6 for AF_INET6
                let sin6 = unsafe {
                    std::ptr::read(std::ptr::from_ref(&storage).cast::<libc::sockaddr_in6>())
                };
                u16::from_be(sin6.sin6_port)
            }
            _ => 0,
        };

        Ok(NativeOutcome::Value(integer::integer(i64::from(port))))
    }
}

#[cfg(not(unix))]
mod fallback {
    use crate::object::{ObjRef, error};
    use crate::vm::native::{NativeCtx, NativeResult};

    macro_rules! unsupported {
        ($($name:ident),*) => {
            $(pub fn $name(
                _ctx: &mut NativeCtx<'_>,
                _args: &[ObjRef],
                _kwargs: Option<&ObjRef>,
            ) -> NativeResult {
                Err(error::error_new(
                    error::KIND_NOT_IMPLEMENTED,
                    "socket support is not available on this platform".to_string(),
                ))
            })*
        };
    }

    unsupported!(
        native_listen,
        native_connect,
        native_accept,
        native_recv,
        native_recv_all,
        native_send,
        native_close,
        native_port
    );
}
