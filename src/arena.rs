// src/arena.rs
//! Per-connection memory arena: one anonymous mapping carved into
//! `[guard page | coroutine stack | control block]`, low to high. The
//! guard page sits immediately below the downward-growing stack so an
//! overflow faults instead of corrupting neighbouring memory, and the
//! control block sits at a fixed offset so its address and the mapping
//! base are mutually recoverable.

use crate::conn::Connection;
use crate::error::MazurkaResult;
use crate::server::Server;
use crate::syscalls;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

fn round_up(n: usize, page: usize) -> usize {
    (n + page - 1) & !(page - 1)
}

/// Carve a fresh arena and construct the connection control block
/// inside it, with the coroutine primed on the arena stack.
///
/// # Safety
///
/// `server` must stay valid for the connection's lifetime. The caller
/// owns `fd` and hands it over to the connection.
pub unsafe fn allocate(
    server: *mut Server,
    fd: RawFd,
    stack_bytes: usize,
) -> MazurkaResult<*mut Connection> {
    let page = syscalls::page_size();
    let stack = round_up(stack_bytes, page);
    let total = round_up(page + stack + mem::size_of::<Connection>(), page);

    let base = syscalls::map_anon(total)?;
    if let Err(err) = syscalls::protect_none(base, page) {
        syscalls::unmap(base, total);
        return Err(err);
    }

    unsafe {
        let conn = base.add(page + stack) as *mut Connection;
        ptr::write(conn, Connection::new(server, fd, stack));
        (*conn).prime(base.add(page), stack);
        Ok(conn)
    }
}

/// Destroy the control block (closing the client descriptor) and unmap
/// the whole arena.
///
/// # Safety
///
/// `conn` must come from `allocate` and its coroutine must not be
/// running: the stack being unmapped here is the coroutine's own.
pub unsafe fn deallocate(conn: *mut Connection) {
    let page = syscalls::page_size();
    unsafe {
        let stack = (*conn).stack_size();
        let total = round_up(page + stack + mem::size_of::<Connection>(), page);
        let base = (conn as *mut u8).sub(page + stack);
        ptr::drop_in_place(conn);
        syscalls::unmap(base, total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::{Coroutine, join_ptr};
    use libc::{c_int, c_void};
    use std::fs::File;
    use std::os::unix::io::IntoRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const STACK: usize = 256 * 1024;

    fn devnull() -> RawFd {
        File::open("/dev/null").unwrap().into_raw_fd()
    }

    fn maps() -> String {
        std::fs::read_to_string("/proc/self/maps").unwrap()
    }

    #[test]
    fn guard_page_is_inaccessible() {
        let conn = unsafe { allocate(ptr::null_mut(), devnull(), STACK) }.unwrap();
        let page = syscalls::page_size();
        let stack = unsafe { (*conn).stack_size() };
        assert_eq!(stack, STACK);

        let base = conn as usize - stack - page;
        let guard = format!("{:x}-{:x} ---p", base, base + page);
        assert!(
            maps().contains(&guard),
            "no inaccessible page at {base:#x}"
        );

        unsafe { deallocate(conn) };
    }

    #[test]
    fn control_block_sits_above_the_stack() {
        let conn = unsafe { allocate(ptr::null_mut(), devnull(), 64 * 1024) }.unwrap();
        let page = syscalls::page_size();
        let stack = unsafe { (*conn).stack_size() };

        assert_eq!(stack % page, 0);
        assert_eq!((conn as usize - stack - page) % page, 0);
        assert_eq!(conn as usize % mem::align_of::<Connection>(), 0);

        unsafe { deallocate(conn) };
    }

    #[test]
    fn allocate_deallocate_returns_memory() {
        let before = maps().lines().count();
        for _ in 0..50 {
            let conn = unsafe { allocate(ptr::null_mut(), devnull(), 64 * 1024) }.unwrap();
            unsafe { deallocate(conn) };
        }
        let after = maps().lines().count();
        assert!(after <= before + 8, "mappings leaked: {before} -> {after}");
    }

    // ---- guard page fault, observed from a forked child ----

    static GUARD_LO: AtomicUsize = AtomicUsize::new(0);
    static GUARD_HI: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn on_segv(_sig: c_int, info: *mut libc::siginfo_t, _uc: *mut c_void) {
        let addr = unsafe { (*info).si_addr() } as usize;
        let lo = GUARD_LO.load(Ordering::Relaxed);
        let hi = GUARD_HI.load(Ordering::Relaxed);
        if addr >= lo && addr < hi {
            unsafe { libc::_exit(42) }
        }
        unsafe { libc::_exit(43) }
    }

    #[allow(unconditional_recursion)]
    fn chew_stack(n: u64) -> u64 {
        let mut pad = [0u8; 256];
        pad[0] = n as u8;
        let pad = std::hint::black_box(pad);
        pad[0] as u64 + chew_stack(n + 1)
    }

    struct Overflow {
        co: Coroutine,
    }

    extern "C" fn overflow_entry(hi: c_int, lo: c_int) {
        let ov = join_ptr(hi, lo) as *mut Overflow;
        std::hint::black_box(chew_stack(0));
        unsafe { (*ov).co.finish() }
    }

    #[test]
    fn stack_overflow_faults_inside_the_guard_page() {
        // Everything that allocates happens before fork; the child only
        // installs the handler and runs the coroutine.
        let page = syscalls::page_size();
        let stack = 16 * page;
        let base = syscalls::map_anon(page + stack).unwrap();
        syscalls::protect_none(base, page).unwrap();
        GUARD_LO.store(base as usize, Ordering::Relaxed);
        GUARD_HI.store(base as usize + page, Ordering::Relaxed);

        let alt = syscalls::map_anon(libc::SIGSTKSZ).unwrap();

        let mut ov = Box::new(Overflow {
            co: Coroutine::new(),
        });
        let arg = &mut *ov as *mut Overflow as *mut c_void;
        unsafe {
            ov.co.prime(base.add(page), stack, overflow_entry, arg);
        }

        unsafe {
            let child = libc::fork();
            assert!(child >= 0, "fork failed");
            if child == 0 {
                let ss = libc::stack_t {
                    ss_sp: alt as *mut c_void,
                    ss_flags: 0,
                    ss_size: libc::SIGSTKSZ,
                };
                libc::sigaltstack(&ss, ptr::null_mut());

                let mut sa: libc::sigaction = mem::zeroed();
                let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) = on_segv;
                sa.sa_sigaction = handler as usize;
                sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
                libc::sigaction(libc::SIGSEGV, &sa, ptr::null_mut());

                ov.co.transfer_in();
                libc::_exit(44);
            }

            let mut status = 0;
            libc::waitpid(child, &mut status, 0);
            assert!(libc::WIFEXITED(status), "child did not exit cleanly");
            assert_eq!(
                libc::WEXITSTATUS(status),
                42,
                "fault address was not inside the guard page"
            );
        }

        syscalls::unmap(base, page + stack);
        syscalls::unmap(alt, libc::SIGSTKSZ);
    }
}
