// src/conn.rs
//! The connection control block and its coroutine body. The block
//! lives at the top of the connection's arena; the body runs one
//! request/response exchange against blocking-style `recv`/`send` that
//! suspend on would-block and are resumed by reactor events.

use crate::coroutine::{Coroutine, join_ptr};
use crate::error::{MazurkaError, MazurkaResult};
use crate::http::Response;
use crate::list::{Linked, ListLink};
use crate::parser::RequestParser;
use crate::reactor::IoSource;
use crate::server::Server;
use crate::syscalls;
use libc::c_int;
use std::os::unix::io::RawFd;
use tracing::debug;

/// Read granularity of the exchange loop.
pub const RECV_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// The coroutine holds the CPU.
    Running,
    /// Suspended inside `recv`, waiting for readability.
    WaitingRead,
    /// Suspended inside `send`, waiting for writability.
    WaitingWrite,
    /// The body returned; the connection awaits the reaper.
    Closing,
}

pub struct Connection {
    fd: RawFd,
    status: Status,
    cancelled: bool,
    stack_size: usize,
    server: *mut Server,
    link: ListLink<Connection>,
    co: Coroutine,
}

/// Coroutine entry: run the exchange, then hand the CPU back for good.
extern "C" fn exchange_entry(hi: c_int, lo: c_int) {
    let conn = join_ptr(hi, lo) as *mut Connection;
    unsafe {
        (*conn).run();
        (*conn).co.finish();
    }
}

impl Connection {
    pub(crate) fn new(server: *mut Server, fd: RawFd, stack_size: usize) -> Self {
        Self {
            fd,
            status: Status::Running,
            cancelled: false,
            stack_size,
            server,
            link: ListLink::new(),
            co: Coroutine::new(),
        }
    }

    /// Arm the coroutine on the arena stack. Must run after the control
    /// block has reached its final address.
    pub(crate) unsafe fn prime(&mut self, stack_lo: *mut u8, stack_len: usize) {
        let arg = self as *mut Connection as *mut libc::c_void;
        unsafe {
            self.co.prime(stack_lo, stack_len, exchange_entry, arg);
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Mark the connection for teardown; the next resume fails out of
    /// its suspended I/O call.
    pub(crate) fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Enter the coroutine. Returns once the body suspends or finishes.
    pub(crate) fn resume(&mut self) {
        debug_assert!(self.status != Status::Closing);
        debug_assert!(!self.co.finished());
        self.status = Status::Running;
        unsafe { self.co.transfer_in() };
    }

    /// Record the wait reason, give up the CPU, and check for
    /// cancellation once control comes back.
    fn suspend(&mut self, status: Status) -> MazurkaResult<()> {
        self.status = status;
        unsafe { self.co.transfer_out() };
        if self.cancelled {
            return Err(MazurkaError::Cancelled);
        }
        Ok(())
    }

    /// Blocking-style receive. Retries the read after every resume, so
    /// a return of 0 always means the peer closed.
    fn recv(&mut self, buf: &mut [u8]) -> MazurkaResult<usize> {
        loop {
            match syscalls::recv(self.fd, buf)? {
                Some(n) => return Ok(n),
                None => self.suspend(Status::WaitingRead)?,
            }
        }
    }

    /// Blocking-style send of the whole buffer.
    fn send(&mut self, buf: &[u8]) -> MazurkaResult<()> {
        let mut sent = 0;
        while sent < buf.len() {
            match syscalls::send(self.fd, &buf[sent..])? {
                Some(0) => return Err(MazurkaError::PeerClosed),
                Some(n) => sent += n,
                None => self.suspend(Status::WaitingWrite)?,
            }
        }
        Ok(())
    }

    /// The coroutine body. Always ends by queueing the connection for
    /// the reaper; the arena must never be torn down from in here.
    fn run(&mut self) {
        if let Err(err) = self.exchange() {
            debug!(fd = self.fd, error = %err, "connection exchange failed");
        }
        self.status = Status::Closing;
        let server = self.server;
        let me = self as *mut Connection;
        unsafe { (*server).move_to_closing(me) };
    }

    fn exchange(&mut self) -> MazurkaResult<()> {
        let mut parser = RequestParser::new();
        let mut buf = [0u8; RECV_CHUNK];
        while !parser.is_complete() {
            let n = self.recv(&mut buf)?;
            if n == 0 {
                return Err(MazurkaError::PeerClosed);
            }
            parser.feed(&buf[..n])?;
        }

        let request = parser.into_request()?;
        let mut response = Response::new();
        let server = unsafe { &*self.server };
        match server.router().lookup(&request.url) {
            Some(handler) => {
                if !handler(&request, &mut response) {
                    response = Response::with_status(500);
                }
            }
            // no handler: the fresh response already carries the
            // fallback 200 with an empty body
            None => {}
        }

        let wire = response.serialize();
        self.send(&wire)
    }
}

impl IoSource for Connection {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn on_readable(&mut self) -> MazurkaResult<()> {
        debug_assert!(self.status != Status::Running);
        if self.status == Status::WaitingRead {
            self.resume();
        }
        Ok(())
    }

    fn on_writable(&mut self) -> MazurkaResult<()> {
        debug_assert!(self.status != Status::Running);
        if self.status == Status::WaitingWrite {
            self.resume();
        }
        Ok(())
    }
}

impl Linked for Connection {
    fn link(&self) -> &ListLink<Self> {
        &self.link
    }
    fn link_mut(&mut self) -> &mut ListLink<Self> {
        &mut self.link
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.fd >= 0 {
            syscalls::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::unix::io::IntoRawFd;
    use std::ptr;

    #[test]
    fn fresh_connection_state() {
        let fd = File::open("/dev/null").unwrap().into_raw_fd();
        let conn = Connection::new(ptr::null_mut(), fd, 64 * 1024);
        assert_eq!(conn.status(), Status::Running);
        assert_eq!(conn.stack_size(), 64 * 1024);
        assert!(!conn.link().is_linked());
    }

    #[test]
    fn hooks_ignore_mismatched_wait_state() {
        let fd = File::open("/dev/null").unwrap().into_raw_fd();
        let mut conn = Connection::new(ptr::null_mut(), fd, 64 * 1024);
        // unprimed coroutine: a resume here would be fatal, so the hook
        // must not take it
        conn.status = Status::WaitingWrite;
        conn.on_readable().unwrap();
        assert_eq!(conn.status(), Status::WaitingWrite);

        conn.status = Status::Closing;
        conn.on_readable().unwrap();
        conn.on_writable().unwrap();
        assert_eq!(conn.status(), Status::Closing);
    }
}
