//! x86_64 architecture support for monokern
//!
//! System V calling convention: rbx, rbp and r12-r15 are callee-saved and are
//! the only registers a cooperative switch has to preserve.

mod context;

pub use context::*;
