//! Machine context switch.
//!
//! The switch primitive pushes the callee-saved registers of the suspending
//! context onto its own stack, stores the resulting stack pointer, loads the
//! target's saved stack pointer, pops the mirrored registers and returns.
//! No calling convention is assumed beyond pointer-sized stack slots, and
//! because every switch happens on the reactor thread no memory ordering
//! beyond the SysV call ABI is needed.
//!
//! A fresh stack is seeded so that the first switch into it "returns" into
//! the trampoline below. The trampoline recovers the fiber's slot index
//! from a seeded register and tail-calls the crate's fiber wrapper, which
//! never returns: it loops, so a recycled fiber slot reuses the same
//! trampoline without being seeded a second time.
//!
//! x86-64 SysV only. The frame on a suspended stack, from the saved stack
//! pointer upward:
//!
//! ```text
//! sp + 0x00: r15      sp + 0x20: rbx
//! sp + 0x08: r14      sp + 0x28: rbp
//! sp + 0x10: r13      sp + 0x30: return address
//! sp + 0x18: r12
//! ```

#[cfg(not(all(target_arch = "x86_64", unix)))]
compile_error!("the fiber context switch is implemented for x86-64 POSIX only");

use crate::fiber::fiber_entry_raw;

core::arch::global_asm! {
    r#"
    .text
    .balign 16
    .globl __weft_switch
__weft_switch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov rsp, rsi
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

    .balign 16
    .globl __weft_trampoline
__weft_trampoline:
    // Entered by the `ret` of __weft_switch the first time a seeded stack
    // is switched to. RSP now points at the stack top, which init_frame
    // left 16-byte aligned, so the call below lands with proper ABI
    // alignment. R12 carries the fiber slot index from the seeded frame.
    mov rdi, r12
    call {entry}
    // The wrapper never returns.
    ud2
    "#,
    entry = sym fiber_entry_raw,
}

extern "C" {
    /// Suspends the context identified by `*save` and resumes the one whose
    /// stack pointer is `to`. Returns when somebody switches back.
    ///
    /// Opaque to the compiler by virtue of being an external symbol, so no
    /// register state leaks across the switch.
    fn __weft_switch(save: *mut usize, to: usize);
}

/// Performs a context switch.
///
/// # Safety
///
/// `save` must point at the stack-pointer cell of the currently running
/// context and `to` must be a stack pointer previously produced by
/// [`init_frame`] or stored by an earlier switch. No borrows of reactor
/// state may be live across the call.
#[inline(always)]
pub(crate) unsafe fn switch(save: *mut usize, to: usize) {
    __weft_switch(save, to);
}

/// Seeds an initial frame on a fresh stack so that the first switch into it
/// enters the trampoline with `fiber_index` in R12. Returns the stack
/// pointer to switch to.
///
/// # Safety
///
/// `top` must be the 16-byte-aligned top of a writable stack region with at
/// least 7 pointer-sized slots available.
pub(crate) unsafe fn init_frame(top: usize, fiber_index: usize) -> usize {
    debug_assert_eq!(top % 16, 0);
    let mut sp = top;

    let mut push = |value: usize| {
        sp -= std::mem::size_of::<usize>();
        (sp as *mut usize).write(value);
    };

    extern "C" {
        fn __weft_trampoline();
    }

    // Mirror of the frame __weft_switch pops: return address first, then
    // the six callee-saved registers in push order.
    push(__weft_trampoline as usize); // ret target
    push(0); // rbp
    push(0); // rbx
    push(fiber_index); // r12
    push(0); // r13
    push(0); // r14
    push(0); // r15
    sp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        // 7 slots below the top, r12 seeded with the index
        let mut buf = vec![0usize; 16];
        let top = unsafe { buf.as_mut_ptr().add(16) } as usize;
        let top = top & !15;
        let sp = unsafe { init_frame(top, 42) };
        assert_eq!(top - sp, 7 * std::mem::size_of::<usize>());
        let slots = unsafe { std::slice::from_raw_parts(sp as *const usize, 7) };
        // r15, r14, r13, r12, rbx, rbp, ret
        assert_eq!(slots[3], 42);
        assert_ne!(slots[6], 0);
    }
}
