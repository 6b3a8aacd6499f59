//! Raw stack-switching primitive.
//!
//! Every other fiber module goes through [`Context::new`] and [`swap`] —
//! nothing else in the crate touches an `asm!` block. The trick is the same
//! on both architectures this module supports: a [`Context`] is just the
//! callee-saved registers plus a stack pointer; `swap` stores the caller's
//! registers into one `Context` and loads another's, finishing with the
//! architecture's "return" instruction so control resumes wherever the
//! target context last yielded (or, the first time, at a small trampoline
//! that calls the fiber's entry point).

use std::arch::{asm, global_asm};

/// A suspended execution context.
pub struct Context {
    regs: arch::Registers,
}

impl Context {
    /// An empty context used as the save target for the very first `swap`
    /// performed by a thread — it describes "whatever is currently running"
    /// and is only ever written to, never resumed from directly.
    pub fn empty() -> Self {
        Self {
            regs: arch::Registers::default(),
        }
    }

    /// Builds a context that, when first swapped into, calls
    /// `entry(arg)` running on `stack_top`.
    ///
    /// # Safety
    /// `stack_top` must be 16-byte aligned and the start of a region of
    /// writable memory large enough for the fiber's needs that outlives the
    /// returned `Context`. `entry` must never return normally — fiber
    /// bodies terminate by falling into the scheduler's trampoline, not by
    /// `ret`urning to whoever last swapped into them.
    pub unsafe fn new(stack_top: *mut u8, entry: extern "C" fn(usize) -> !, arg: usize) -> Self {
        Self {
            regs: arch::init(stack_top, entry, arg),
        }
    }
}

/// Saves the currently running context's registers into `*from`, loads
/// `*to`'s, and resumes execution there. Returns (on the now-suspended
/// original context) only once some later `swap` targets `from` again.
///
/// # Safety
/// `to` must point at a [`Context`] produced by [`Context::new`] that
/// hasn't already been resumed and then abandoned, or at a context this
/// same call stack has previously suspended. `from` must be valid for
/// writes for the duration of the call.
pub unsafe fn swap(from: *mut Context, to: *const Context) {
    arch::swap(&mut (*from).regs, &(*to).regs);
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::*;

    #[repr(C)]
    #[derive(Default)]
    pub struct Registers {
        rsp: u64,
        rbp: u64,
        rbx: u64,
        r12: u64,
        r13: u64,
        r14: u64,
        r15: u64,
    }

    global_asm!(
        ".global cofiber_trampoline_x86_64",
        "cofiber_trampoline_x86_64:",
        "mov rdi, r13",
        "jmp r12",
    );

    extern "C" {
        fn cofiber_trampoline_x86_64();
    }

    pub unsafe fn init(stack_top: *mut u8, entry: extern "C" fn(usize) -> !, arg: usize) -> Registers {
        // `ret`, at the end of `swap`, pops a return address off of `rsp`
        // and jumps to it. For that to land on the trampoline with the
        // stack in the state a normal `call` would have left it, the slot
        // holding the trampoline's address must itself sit at a
        // 16-byte-aligned address (see the SysV ABI's stack alignment
        // rule, worked backwards from `call`'s effect on `rsp`).
        let sp = (stack_top as u64 - 16) & !0xf;
        unsafe {
            *(sp as *mut u64) = cofiber_trampoline_x86_64 as u64;
        }
        Registers {
            rsp: sp,
            rbp: 0,
            rbx: 0,
            r12: entry as u64,
            r13: arg as u64,
            r14: 0,
            r15: 0,
        }
    }

    pub unsafe fn swap(from: *mut Registers, to: *const Registers) {
        asm!(
            "mov [rdi + 0], rsp",
            "mov [rdi + 8], rbp",
            "mov [rdi + 16], rbx",
            "mov [rdi + 24], r12",
            "mov [rdi + 32], r13",
            "mov [rdi + 40], r14",
            "mov [rdi + 48], r15",
            "mov rsp, [rsi + 0]",
            "mov rbp, [rsi + 8]",
            "mov rbx, [rsi + 16]",
            "mov r12, [rsi + 24]",
            "mov r13, [rsi + 32]",
            "mov r14, [rsi + 40]",
            "mov r15, [rsi + 48]",
            "ret",
            in("rdi") from,
            in("rsi") to,
            options(noreturn),
        );
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::*;

    #[repr(C)]
    #[derive(Default)]
    pub struct Registers {
        sp: u64,
        lr: u64,
        fp: u64,
        x19: u64,
        x20: u64,
        x21: u64,
        x22: u64,
        x23: u64,
        x24: u64,
        x25: u64,
        x26: u64,
        x27: u64,
        x28: u64,
    }

    global_asm!(
        ".global cofiber_trampoline_aarch64",
        "cofiber_trampoline_aarch64:",
        "mov x0, x20",
        "br x19",
    );

    extern "C" {
        fn cofiber_trampoline_aarch64();
    }

    pub unsafe fn init(stack_top: *mut u8, entry: extern "C" fn(usize) -> !, arg: usize) -> Registers {
        let sp = (stack_top as u64) & !0xf;
        Registers {
            sp,
            lr: cofiber_trampoline_aarch64 as u64,
            fp: 0,
            x19: entry as u64,
            x20: arg as u64,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
        }
    }

    pub unsafe fn swap(from: *mut Registers, to: *const Registers) {
        asm!(
            "mov x9, sp",
            "str x9, [x0, #0]",
            "str x30, [x0, #8]",
            "str x29, [x0, #16]",
            "str x19, [x0, #24]",
            "str x20, [x0, #32]",
            "str x21, [x0, #40]",
            "str x22, [x0, #48]",
            "str x23, [x0, #56]",
            "str x24, [x0, #64]",
            "str x25, [x0, #72]",
            "str x26, [x0, #80]",
            "str x27, [x0, #88]",
            "str x28, [x0, #96]",
            "ldr x9, [x1, #0]",
            "mov sp, x9",
            "ldr x30, [x1, #8]",
            "ldr x29, [x1, #16]",
            "ldr x19, [x1, #24]",
            "ldr x20, [x1, #32]",
            "ldr x21, [x1, #40]",
            "ldr x22, [x1, #48]",
            "ldr x23, [x1, #56]",
            "ldr x24, [x1, #64]",
            "ldr x25, [x1, #72]",
            "ldr x26, [x1, #80]",
            "ldr x27, [x1, #88]",
            "ldr x28, [x1, #96]",
            "ret",
            in("x0") from,
            in("x1") to,
            options(noreturn),
        );
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("cofiber's fiber module needs an asm-level context switch for this target_arch");

#[cfg(all(test, any(target_arch = "x86_64", target_arch = "aarch64")))]
mod tests {
    use super::*;
    use crate::fiber::stack::Stack;
    use std::sync::atomic::{AtomicU32, Ordering};

    static SEEN: AtomicU32 = AtomicU32::new(0);
    static mut RETURN_CTX: *mut Context = std::ptr::null_mut();

    extern "C" fn record_and_return(arg: usize) -> ! {
        SEEN.store(arg as u32, Ordering::SeqCst);
        unsafe {
            let ret = RETURN_CTX;
            let mut here = Context::empty();
            swap(&mut here, ret);
        }
        unreachable!("fiber context resumed after handing control back");
    }

    #[test]
    fn swap_runs_entry_and_returns() {
        SEEN.store(0, Ordering::SeqCst);
        let stack = Stack::new(256 * 1024).unwrap();
        let fiber_ctx = unsafe { Context::new(stack.top(), record_and_return, 77) };
        let mut caller_ctx = Context::empty();
        unsafe {
            RETURN_CTX = &mut caller_ctx as *mut Context;
            swap(&mut caller_ctx, &fiber_ctx);
        }
        assert_eq!(SEEN.load(Ordering::SeqCst), 77);
    }
}
