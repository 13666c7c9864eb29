// src/syscalls.rs
use crate::error::{MazurkaError, MazurkaResult};
use libc::{c_int, c_void, socklen_t};
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;

/// Listen queue depth for both socket families.
pub const LISTEN_BACKLOG: c_int = 128;

// ---- Socket Operations ----

/// Create a non-blocking, close-on-exec UNIX stream listener at `path`.
/// A pre-existing socket file at the path is removed before bind.
pub fn listen_unix(path: &Path) -> MazurkaResult<RawFd> {
    let bytes = path.as_os_str().as_bytes();

    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    if bytes.len() >= addr.sun_path.len() {
        return Err(MazurkaError::PathTooLong(path.display().to_string()));
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    unsafe {
        ptr::copy_nonoverlapping(
            bytes.as_ptr() as *const libc::c_char,
            addr.sun_path.as_mut_ptr(),
            bytes.len(),
        );
    }

    // unlink a stale socket left by a previous run
    let cpath = CString::new(bytes.to_vec())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    unsafe {
        libc::unlink(cpath.as_ptr());
    }

    unsafe {
        let fd = libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, LISTEN_BACKLOG) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Create a non-blocking, close-on-exec IPv4 TCP listener on `port`
/// (any address). Port 0 asks the kernel for an ephemeral port.
pub fn listen_tcp(port: u16) -> MazurkaResult<RawFd> {
    unsafe {
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, LISTEN_BACKLOG) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Local port of a bound IPv4 socket.
pub fn local_port(fd: RawFd) -> MazurkaResult<u16> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of_val(&sin) as socklen_t;
        if libc::getsockname(fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(u16::from_be(sin.sin_port))
    }
}

/// Accept one pending connection. The client socket comes back
/// non-blocking and close-on-exec. `None` means the accept queue is
/// drained (EAGAIN/EWOULDBLOCK).
pub fn accept(listen_fd: RawFd) -> MazurkaResult<Option<RawFd>> {
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(fd))
        }
    }
}

/// Non-blocking receive. `None` means would-block; `Some(0)` means the
/// peer closed its end.
pub fn recv(fd: RawFd, buf: &mut [u8]) -> MazurkaResult<Option<usize>> {
    unsafe {
        let n = libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0);
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(n as usize))
        }
    }
}

/// Non-blocking send of as much of `buf` as the kernel will take.
/// `None` means would-block. MSG_NOSIGNAL turns a dead peer into EPIPE
/// instead of SIGPIPE.
pub fn send(fd: RawFd, buf: &[u8]) -> MazurkaResult<Option<usize>> {
    unsafe {
        let n = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        );
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(n as usize))
        }
    }
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll Operations ----

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> MazurkaResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Register a descriptor. Registration is always edge-triggered
    /// (EPOLLET): consumers drain until would-block.
    pub fn add(&self, fd: RawFd, token: u64, events: u32) -> MazurkaResult<()> {
        let mut event = libc::epoll_event {
            events: events | libc::EPOLLET as u32,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> MazurkaResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Wait for events. EINTR surfaces as an interrupted-kind error so
    /// the caller can decide to retry the wait.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> MazurkaResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                return Err(io::Error::last_os_error().into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Memory Mapping ----

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Reserve an anonymous, private, read-write mapping of `len` bytes.
pub fn map_anon(len: usize) -> MazurkaResult<*mut u8> {
    unsafe {
        let mem = libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(mem as *mut u8)
    }
}

/// Strip all access from `[addr, addr + len)`.
pub fn protect_none(addr: *mut u8, len: usize) -> MazurkaResult<()> {
    unsafe {
        if libc::mprotect(addr as *mut c_void, len, libc::PROT_NONE) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

pub fn unmap(addr: *mut u8, len: usize) {
    unsafe {
        let rc = libc::munmap(addr as *mut c_void, len);
        debug_assert_eq!(rc, 0);
    }
}
