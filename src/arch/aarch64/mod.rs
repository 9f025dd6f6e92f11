//! AArch64 architecture support for monokern
//!
//! AAPCS64: x19-x29, the link register and d8-d15 survive a call and are the
//! registers a cooperative switch preserves.

mod context;

pub use context::*;
