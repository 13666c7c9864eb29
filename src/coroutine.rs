// src/coroutine.rs
//! Symmetric stackful coroutine on top of the glibc ucontext family.
//! The two endpoints are the caller (whoever invokes `transfer_in`) and
//! the callee (the entry function running on its own stack).

use libc::{c_int, c_void, ucontext_t};
use std::mem;
use std::ptr;

/// Entry point of a coroutine. The two ints carry a pointer split in
/// half, because makecontext only forwards int-sized arguments.
pub type Entry = extern "C" fn(c_int, c_int);

pub fn split_ptr(p: *mut c_void) -> (c_int, c_int) {
    let v = p as usize as u64;
    ((v >> 32) as c_int, v as u32 as c_int)
}

pub fn join_ptr(hi: c_int, lo: c_int) -> *mut c_void {
    (((hi as u32 as u64) << 32) | (lo as u32 as u64)) as usize as *mut c_void
}

pub struct Coroutine {
    caller: ucontext_t,
    callee: ucontext_t,
    finished: bool,
}

impl Coroutine {
    /// An unprimed coroutine. `prime` must run before the first
    /// `transfer_in`.
    pub fn new() -> Self {
        Self {
            caller: unsafe { mem::zeroed() },
            callee: unsafe { mem::zeroed() },
            finished: false,
        }
    }

    /// Arm the callee context: the first `transfer_in` enters `entry`
    /// on the stack `[stack_lo, stack_lo + stack_len)` with `arg`
    /// reassembled from the two int halves.
    ///
    /// # Safety
    ///
    /// `self` must already sit at its final address and must not move
    /// afterwards (getcontext links the context to in-struct FPU state).
    /// The stack memory must stay mapped for the coroutine's lifetime.
    pub unsafe fn prime(&mut self, stack_lo: *mut u8, stack_len: usize, entry: Entry, arg: *mut c_void) {
        unsafe {
            let rc = libc::getcontext(&mut self.callee);
            debug_assert_eq!(rc, 0);

            self.callee.uc_stack.ss_sp = stack_lo as *mut c_void;
            self.callee.uc_stack.ss_size = stack_len;
            self.callee.uc_stack.ss_flags = 0;
            self.callee.uc_link = ptr::null_mut();

            let (hi, lo) = split_ptr(arg);
            let entry: extern "C" fn() = mem::transmute(entry);
            libc::makecontext(&mut self.callee, entry, 2, hi, lo);
        }
    }

    /// Caller side: enter the coroutine. Returns when the callee
    /// transfers out or finishes.
    ///
    /// # Safety
    ///
    /// Must be called from outside the coroutine; the coroutine must be
    /// primed and not finished.
    pub unsafe fn transfer_in(&mut self) {
        debug_assert!(!self.finished);
        unsafe {
            let rc = libc::swapcontext(&mut self.caller, &self.callee);
            debug_assert_eq!(rc, 0);
        }
    }

    /// Callee side: give the CPU back to the caller. Returns when the
    /// caller transfers in again.
    ///
    /// # Safety
    ///
    /// Must be called from inside the coroutine.
    pub unsafe fn transfer_out(&mut self) {
        unsafe {
            let rc = libc::swapcontext(&mut self.callee, &self.caller);
            debug_assert_eq!(rc, 0);
        }
    }

    /// Callee side: terminal transfer back to the caller. The coroutine
    /// must never be entered again.
    ///
    /// # Safety
    ///
    /// Must be called from inside the coroutine, as its last action.
    pub unsafe fn finish(&mut self) -> ! {
        self.finished = true;
        unsafe {
            libc::setcontext(&self.caller);
        }
        unreachable!("setcontext returned");
    }

    pub fn finished(&self) -> bool {
        self.finished
    }
}

impl Default for Coroutine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ctx {
        co: Coroutine,
        step: u32,
    }

    extern "C" fn yield_twice(hi: c_int, lo: c_int) {
        let ctx = join_ptr(hi, lo) as *mut Ctx;
        unsafe {
            (*ctx).step = 1;
            (*ctx).co.transfer_out();
            (*ctx).step = 2;
            (*ctx).co.transfer_out();
            (*ctx).step = 3;
            (*ctx).co.finish();
        }
    }

    extern "C" fn run_straight(hi: c_int, lo: c_int) {
        let ctx = join_ptr(hi, lo) as *mut Ctx;
        unsafe {
            (*ctx).step = 42;
            (*ctx).co.finish();
        }
    }

    fn primed(entry: Entry) -> (Box<Ctx>, Box<[u8]>) {
        let mut ctx = Box::new(Ctx {
            co: Coroutine::new(),
            step: 0,
        });
        let mut stack = vec![0u8; 64 * 1024].into_boxed_slice();
        let arg = &mut *ctx as *mut Ctx as *mut c_void;
        unsafe {
            ctx.co.prime(stack.as_mut_ptr(), stack.len(), entry, arg);
        }
        (ctx, stack)
    }

    #[test]
    fn primed_but_not_started() {
        let (ctx, _stack) = primed(yield_twice);
        assert_eq!(ctx.step, 0);
        assert!(!ctx.co.finished());
    }

    #[test]
    fn transfers_alternate_between_endpoints() {
        let (mut ctx, _stack) = primed(yield_twice);

        unsafe { ctx.co.transfer_in() };
        assert_eq!(ctx.step, 1);
        assert!(!ctx.co.finished());

        unsafe { ctx.co.transfer_in() };
        assert_eq!(ctx.step, 2);
        assert!(!ctx.co.finished());

        unsafe { ctx.co.transfer_in() };
        assert_eq!(ctx.step, 3);
        assert!(ctx.co.finished());
    }

    #[test]
    fn body_may_finish_on_first_entry() {
        let (mut ctx, _stack) = primed(run_straight);
        unsafe { ctx.co.transfer_in() };
        assert_eq!(ctx.step, 42);
        assert!(ctx.co.finished());
    }

    #[test]
    fn pointer_split_round_trips() {
        let p = 0x7f12_3456_789a_bcde_usize as *mut c_void;
        let (hi, lo) = split_ptr(p);
        assert_eq!(join_ptr(hi, lo), p);
    }
}
