//! Kernel context switch for x86_64

use super::super::Context;
use core::arch::{asm, global_asm};

global_asm!(
    ".pushsection .text.monokern_context, \"ax\"",
    // rdi = from, rsi = to
    ".global monokern_switch_context",
    ".p2align 4",
    "monokern_switch_context:",
    "    push rbp",
    "    push rbx",
    "    push r12",
    "    push r13",
    "    push r14",
    "    push r15",
    "    mov [rdi], rsp",
    "    lea rax, [rip + 2f]",
    "    mov [rdi + 8], rax",
    "    mov rsp, [rsi]",
    "    jmp qword ptr [rsi + 8]",
    "2:",
    "    pop r15",
    "    pop r14",
    "    pop r13",
    "    pop r12",
    "    pop rbx",
    "    pop rbp",
    "    ret",
    "",
    // rdi = to
    ".global monokern_jump_context",
    ".p2align 4",
    "monokern_jump_context:",
    "    mov rsp, [rdi]",
    "    jmp qword ptr [rdi + 8]",
    "",
    // Frame laid out by initial_context: [entry, arg]
    ".global monokern_thread_trampoline",
    ".p2align 4",
    "monokern_thread_trampoline:",
    "    pop rax",
    "    pop rdi",
    "    xor ebp, ebp",
    "    call rax",
    "    ud2",
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
        asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp
}
