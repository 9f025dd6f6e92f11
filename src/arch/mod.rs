//! Architecture-specific code for monokern
//!
//! The only machine state the scheduler core manages itself is the kernel
//! execution context of a thread: its stack pointer and resume address. The
//! per-architecture modules provide the raw switch primitive; everything above
//! this module handles contexts as opaque [`Context`] values.

#[cfg(target_arch = "aarch64")]
mod aarch64;

#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
use aarch64 as imp;

#[cfg(target_arch = "x86_64")]
use x86_64 as imp;

/// Saved kernel execution context of a thread
///
/// Callee-saved registers live on the thread's own stack below `sp`; resuming
/// the context is a jump to `ip` with `sp` loaded, never a return up the
/// original call chain.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    /// Saved stack pointer
    pub sp: usize,
    /// Resume address
    pub ip: usize,
}

/// First function a new thread runs, receives the word stored in its frame
pub type EntryFn = extern "C" fn(usize) -> !;

/// Stack alignment required at every function entry boundary
pub const STACK_ALIGN: usize = 16;

/// Build the context a never-run thread is dispatched with
///
/// # Safety
///
/// `stack_top` must be the one-past-the-end address of a writable stack of at
/// least 32 bytes owned by the thread.
pub unsafe fn initial_context(stack_top: *mut u8, entry: EntryFn, arg: usize) -> Context {
    let top = (stack_top as usize) & !(STACK_ALIGN - 1);
    let frame = (top - 2 * core::mem::size_of::<usize>()) as *mut usize;
    frame.write(entry as usize);
    frame.add(1).write(arg);
    Context {
        sp: frame as usize,
        ip: imp::trampoline_address(),
    }
}

/// Save the running context into `from` and dispatch `to`
///
/// Returns when some later switch dispatches `from` again.
///
/// # Safety
///
/// Both pointers must be valid for the whole call, `to` must hold a context
/// produced by [`initial_context`] or a previous switch, and interrupts must be
/// disabled.
#[inline(always)]
pub unsafe fn switch_context(from: *mut Context, to: *const Context) {
    imp::switch_context(from, to)
}

/// Dispatch `to` without saving anything
///
/// # Safety
///
/// Same requirements as [`switch_context`]; the current stack is abandoned.
#[inline(always)]
pub unsafe fn jump_to(to: *const Context) -> ! {
    imp::jump_context(to)
}

/// Current stack pointer
#[inline(always)]
pub fn stack_pointer() -> usize {
    imp::stack_pointer()
}
