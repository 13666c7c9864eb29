// src/reactor.rs
//! The event loop: one edge-triggered epoll instance, a descriptor →
//! source registry, and an insertion-ordered list of per-iteration tick
//! subscribers. Everything runs on the thread that calls `run`; the
//! only cross-thread surface is the stop flag.

use crate::error::{MazurkaError, MazurkaResult};
use crate::syscalls::Epoll;
use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;

pub const READABLE: u32 = 0b01;
pub const WRITABLE: u32 = 0b10;

const MAX_EVENTS: usize = 64;
const WAIT_TIMEOUT_MS: i32 = 50;

/// A descriptor-owning event source. The descriptor must stay open
/// while the source is subscribed.
pub trait IoSource {
    fn fd(&self) -> RawFd;
    /// A hook error is fatal to the event loop and surfaces from `run`.
    fn on_readable(&mut self) -> MazurkaResult<()>;
    fn on_writable(&mut self) -> MazurkaResult<()>;
}

/// Fires once per loop iteration, after all I/O events.
pub trait TickSource {
    fn on_tick(&mut self);
}

#[derive(Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

pub struct Reactor {
    epoll: Epoll,
    running: Arc<AtomicBool>,
    io: RefCell<HashMap<RawFd, *mut dyn IoSource>>,
    ticks: RefCell<Vec<*mut dyn TickSource>>,
}

impl Reactor {
    pub fn new() -> MazurkaResult<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
            running: Arc::new(AtomicBool::new(false)),
            io: RefCell::new(HashMap::new()),
            ticks: RefCell::new(Vec::new()),
        })
    }

    /// Register an I/O source, edge-triggered, for the interest mask
    /// (`READABLE | WRITABLE`). Registering a descriptor twice fails.
    ///
    /// # Safety
    ///
    /// `source` must stay valid (and its address stable) until it is
    /// unsubscribed.
    pub unsafe fn subscribe_io(&self, source: *mut dyn IoSource, interest: u32) -> MazurkaResult<()> {
        let fd = unsafe { (*source).fd() };
        let mut io = self.io.borrow_mut();
        if io.contains_key(&fd) {
            return Err(MazurkaError::AlreadySubscribed(fd));
        }

        let mut events = 0u32;
        if interest & READABLE != 0 {
            events |= libc::EPOLLIN as u32;
        }
        if interest & WRITABLE != 0 {
            events |= libc::EPOLLOUT as u32;
        }

        self.epoll.add(fd, fd as u64, events)?;
        io.insert(fd, source);
        Ok(())
    }

    /// Remove an I/O source. Fails if the descriptor is not registered.
    pub fn unsubscribe_io(&self, source: &dyn IoSource) -> MazurkaResult<()> {
        let fd = source.fd();
        let mut io = self.io.borrow_mut();
        if io.remove(&fd).is_none() {
            return Err(MazurkaError::NotSubscribed(fd));
        }
        self.epoll.delete(fd)?;
        Ok(())
    }

    /// Append a tick subscriber. Duplicates are rejected.
    ///
    /// # Safety
    ///
    /// `sub` must stay valid (and its address stable) until it is
    /// unsubscribed.
    pub unsafe fn subscribe_tick(&self, sub: *mut dyn TickSource) -> MazurkaResult<()> {
        let mut ticks = self.ticks.borrow_mut();
        if ticks.iter().any(|&t| t as *mut () == sub as *mut ()) {
            return Err(MazurkaError::TickPresent);
        }
        ticks.push(sub);
        Ok(())
    }

    /// Remove a tick subscriber; reports whether it was present.
    pub fn unsubscribe_tick(&self, sub: &dyn TickSource) -> bool {
        let addr = sub as *const dyn TickSource as *const ();
        let mut ticks = self.ticks.borrow_mut();
        let before = ticks.len();
        ticks.retain(|&t| t as *const () != addr);
        ticks.len() != before
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Cooperative halt: the loop exits after the iteration in flight.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// The event loop. Per iteration: wait up to 64 events for at most
    /// 50 ms, dispatch each event's hooks (read before write), then run
    /// every tick subscriber in subscription order. Interrupted waits
    /// retry; any other wait error, or a hook error, ends the loop.
    pub fn run(&self) -> MazurkaResult<()> {
        self.running.store(true, Ordering::Release);

        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };

        while self.running.load(Ordering::Acquire) {
            let n = match self.epoll.wait(&mut events, WAIT_TIMEOUT_MS) {
                Ok(n) => n,
                Err(err) if err.is_interrupted() => continue,
                Err(err) => {
                    error!(error = %err, "event wait failed");
                    return Err(err);
                }
            };

            for ev in &events[..n] {
                let fd = ev.u64 as RawFd;
                let bits = ev.events;

                let source = { self.io.borrow().get(&fd).copied() };
                let Some(source) = source else { continue };

                if bits & libc::EPOLLIN as u32 != 0 {
                    unsafe { (*source).on_readable()? };
                }
                if bits & libc::EPOLLOUT as u32 != 0 {
                    // the read hook may have dropped the registration
                    let still = { self.io.borrow().get(&fd).copied() };
                    if still.map(|s| s as *mut ()) == Some(source as *mut ()) {
                        unsafe { (*source).on_writable()? };
                    }
                }
            }

            let ticks: Vec<*mut dyn TickSource> = self.ticks.borrow().clone();
            for sub in ticks {
                unsafe { (*sub).on_tick() };
            }
        }

        Ok(())
    }
}
