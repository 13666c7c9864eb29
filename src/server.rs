// src/server.rs
//! The listener: accepts clients, gives each one an arena-backed
//! coroutine, and owns the two lifecycle lists. Connections move from
//! `active` to `closing` when their body returns and are torn down by
//! the per-tick reaper, strictly after control has left their stack.

use crate::arena;
use crate::conn::Connection;
use crate::error::MazurkaResult;
use crate::list::List;
use crate::reactor::{IoSource, READABLE, Reactor, TickSource, WRITABLE};
use crate::router::Router;
use crate::syscalls;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;
use tracing::{debug, info};

/// Per-connection coroutine stack size, rounded up to whole pages.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

pub struct Server {
    fd: RawFd,
    reactor: *const Reactor,
    router: Router,
    active: List<Connection>,
    closing: List<Connection>,
    stack_size: usize,
}

impl Server {
    /// Listen on a UNIX socket path. A stale socket file at the path is
    /// removed first.
    pub fn bind_unix(path: &Path, router: Router) -> MazurkaResult<Self> {
        let fd = syscalls::listen_unix(path)?;
        info!(path = %path.display(), "listening on unix socket");
        Ok(Self::from_fd(fd, router))
    }

    /// Listen on an IPv4 TCP port (0 picks an ephemeral one).
    pub fn bind_tcp(port: u16, router: Router) -> MazurkaResult<Self> {
        let fd = syscalls::listen_tcp(port)?;
        let port = syscalls::local_port(fd)?;
        info!(port, "listening on tcp");
        Ok(Self::from_fd(fd, router))
    }

    fn from_fd(fd: RawFd, router: Router) -> Self {
        Self {
            fd,
            reactor: ptr::null(),
            router,
            active: List::new(),
            closing: List::new(),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Override the per-connection stack size.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes.max(syscalls::page_size());
        self
    }

    pub fn local_port(&self) -> MazurkaResult<u16> {
        syscalls::local_port(self.fd)
    }

    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    pub fn active_connections(&self) -> usize {
        self.active.len()
    }

    pub fn closing_connections(&self) -> usize {
        self.closing.len()
    }

    /// Register with the reactor: readable events drive the accept
    /// loop, ticks drive the reaper.
    ///
    /// # Safety
    ///
    /// `self` must not move or drop while attached; `reactor` must
    /// outlive the attachment.
    pub unsafe fn attach(&mut self, reactor: &Reactor) -> MazurkaResult<()> {
        self.reactor = reactor;
        unsafe {
            reactor.subscribe_io(self as *mut Server as *mut dyn IoSource, READABLE)?;
            reactor.subscribe_tick(self as *mut Server as *mut dyn TickSource)?;
        }
        Ok(())
    }

    fn admit(&mut self, client: RawFd) -> MazurkaResult<()> {
        let me = self as *mut Server;
        let conn = unsafe { arena::allocate(me, client, self.stack_size) }?;
        unsafe {
            self.active.push_back(conn);
            let reactor = &*self.reactor;
            if let Err(err) = reactor.subscribe_io(conn as *mut dyn IoSource, READABLE | WRITABLE) {
                self.active.unlink(conn);
                arena::deallocate(conn);
                return Err(err);
            }
            // run the exchange up to its first suspension; with a
            // silent client that is the first empty read
            (*conn).resume();
        }
        Ok(())
    }

    /// Move a connection whose body has returned onto the closing list.
    /// Teardown waits for the reaper: the caller is still executing on
    /// the connection's own stack.
    pub(crate) unsafe fn move_to_closing(&mut self, conn: *mut Connection) {
        unsafe {
            self.active.unlink(conn);
            self.closing.push_back(conn);
        }
    }

    fn reap(&mut self) {
        while let Some(conn) = unsafe { self.closing.pop_front() } {
            unsafe {
                if !self.reactor.is_null()
                    && let Err(err) = (*self.reactor).unsubscribe_io(&*conn)
                {
                    debug!(error = %err, "reaped connection was not subscribed");
                }
                arena::deallocate(conn);
            }
        }
        debug_assert!(self.closing.is_empty());
    }

    /// Graceful shutdown after the reactor has stopped: wake every
    /// in-flight connection into its cancellation path, reap the lot,
    /// and detach from the reactor.
    pub fn drain(&mut self) {
        while let Some(conn) = self.active.front() {
            unsafe {
                (*conn).cancel();
                (*conn).resume();
            }
        }
        self.reap();

        if !self.reactor.is_null() {
            let reactor = unsafe { &*self.reactor };
            let _ = reactor.unsubscribe_io(&*self);
            reactor.unsubscribe_tick(&*self);
            self.reactor = ptr::null();
        }
    }
}

impl IoSource for Server {
    fn fd(&self) -> RawFd {
        self.fd
    }

    /// Accept until the queue is drained. Any error other than
    /// would-block is fatal to the listener and surfaces from the
    /// reactor loop.
    fn on_readable(&mut self) -> MazurkaResult<()> {
        loop {
            match syscalls::accept(self.fd)? {
                Some(client) => self.admit(client)?,
                None => break,
            }
        }
        Ok(())
    }

    fn on_writable(&mut self) -> MazurkaResult<()> {
        Ok(())
    }
}

impl TickSource for Server {
    fn on_tick(&mut self) {
        self.reap();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        syscalls::close(self.fd);
    }
}
