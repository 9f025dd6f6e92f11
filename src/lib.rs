//! monokern - the core of a small single-CPU kernel
//!
//! This crate provides a preemptive round-robin scheduler with real context
//! switches, kernel threads and their state machine, identity-keyed
//! semaphores, and the UNIX process lifecycle (fork, exec, exit, wait) with
//! the process-level state around it: credentials, sessions and process
//! groups, signals, pipes and descriptor tables.
//!
//! The machine is reached only through [`platform::Platform`] and executables
//! only through [`kern::exec::ImageLoader`]; an embedding kernel provides
//! both and calls [`kern::Kernel::boot`].

#![cfg_attr(not(test), no_std)]
// Kernel-appropriate clippy configuration
// Hardware register code often uses explicit bit shifts for documentation
#![allow(clippy::identity_op)]

// Standard library replacement for no_std
extern crate alloc;

// Core types
pub mod config;
pub mod error;
pub mod types;

// Machine layer
pub mod arch;
pub mod console;
pub mod platform;

// Subsystems
pub mod kern;
pub mod vm;

#[cfg(test)]
pub(crate) mod testing;

pub use config::KernelConfig;
pub use error::{KernResult, KernelError};
pub use kern::Kernel;
pub use platform::Platform;

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "monokern";
