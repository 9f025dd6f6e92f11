//! Common types used across monokern
//!
//! This module defines shared identifier types to avoid circular dependencies
//! between the scheduler, threads and processes.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Create a new thread ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ThreadId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// Process identifier
///
/// Signed like `pid_t`, negative values only ever appear as `kill`
/// arguments naming a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(pub i32);

impl Pid {
    /// Owner of threads that belong to no process (the idle thread)
    pub const KERNEL: Pid = Pid(0);
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// Identity of a semaphore, the key blocked threads are queued under
///
/// Derived from the semaphore's address, so a semaphore must not move while
/// anything is blocked on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemaphoreId(pub usize);

impl SemaphoreId {
    /// Identity of the object at `addr`
    pub fn of<T>(addr: &T) -> Self {
        SemaphoreId(addr as *const T as usize)
    }
}
