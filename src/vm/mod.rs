//! Per-process virtual memory
//!
//! A process owns exactly one [`AddressSpace`]. It is duplicated in full on
//! fork, emptied on exec and destroyed only once no thread of the process can
//! run on it anymore.

pub mod address_space;

pub use address_space::{AddressSpace, Region, VmProt};
