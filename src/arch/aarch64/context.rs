//! Kernel context switch for AArch64

use super::super::Context;
use core::arch::{asm, global_asm};

global_asm!(
    ".pushsection .text.monokern_context, \"ax\"",
    // x0 = from, x1 = to
    ".global monokern_switch_context",
    ".p2align 4",
    "monokern_switch_context:",
    "    sub sp, sp, #160",
    "    stp x19, x20, [sp, #0]",
    "    stp x21, x22, [sp, #16]",
    "    stp x23, x24, [sp, #32]",
    "    stp x25, x26, [sp, #48]",
    "    stp x27, x28, [sp, #64]",
    "    stp x29, x30, [sp, #80]",
    "    stp d8, d9, [sp, #96]",
    "    stp d10, d11, [sp, #112]",
    "    stp d12, d13, [sp, #128]",
    "    stp d14, d15, [sp, #144]",
    "    mov x9, sp",
    "    str x9, [x0]",
    "    adr x9, 2f",
    "    str x9, [x0, #8]",
    "    ldr x9, [x1]",
    "    mov sp, x9",
    "    ldr x9, [x1, #8]",
    "    br x9",
    "2:",
    "    ldp d14, d15, [sp, #144]",
    "    ldp d12, d13, [sp, #128]",
    "    ldp d10, d11, [sp, #112]",
    "    ldp d8, d9, [sp, #96]",
    "    ldp x29, x30, [sp, #80]",
    "    ldp x27, x28, [sp, #64]",
    "    ldp x25, x26, [sp, #48]",
    "    ldp x23, x24, [sp, #32]",
    "    ldp x21, x22, [sp, #16]",
    "    ldp x19, x20, [sp, #0]",
    "    add sp, sp, #160",
    "    ret",
    "",
    // x0 = to
    ".global monokern_jump_context",
    ".p2align 4",
    "monokern_jump_context:",
    "    ldr x9, [x0]",
    "    mov sp, x9",
    "    ldr x9, [x0, #8]",
    "    br x9",
    "",
    // Frame laid out by initial_context: [entry, arg]
    ".global monokern_thread_trampoline",
    ".p2align 4",
    "monokern_thread_trampoline:",
    "    ldp x9, x0, [sp], #16",
    "    mov x29, xzr",
    "    mov x30, xzr",
    "    blr x9",
    "    brk #0",
    ".popsection",
);

extern "C" {
    fn monokern_switch_context(from: *mut Context, to: *const Context);
    fn monokern_jump_context(to: *const Context) -> !;
    fn monokern_thread_trampoline();
}

#[inline(always)]
pub unsafe fn switch_context(from: *mut Context, to: *const Context) {
    monokern_switch_context(from, to)
}

#[inline(always)]
pub unsafe fn jump_context(to: *const Context) -> ! {
    monokern_jump_context(to)
}

pub fn trampoline_address() -> usize {
    monokern_thread_trampoline as usize
}

#[inline(always)]
pub fn stack_pointer() -> usize {
    let sp: usize;
    unsafe {
        asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp
}
