//! Scheduling Primitives - Block/Unblock and Timed Sleep
//!
//! A [`Semaphore`] is a rendezvous point rather than a permit counter: its
//! only state is whether any thread is waiting on it. Threads block keyed on
//! the semaphore's identity and are all released together by `unblock`.
//!
//! Callers re-check their condition after `block` returns; a release only
//! means the condition may have changed.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::kern::scheduler::Scheduler;
use crate::types::SemaphoreId;

// ============================================================================
// Semaphore
// ============================================================================

/// Identity-keyed wait point
///
/// The identity is the semaphore's address, so it must stay in place (inside
/// an `Arc` or a pinned owner) while threads are blocked on it.
#[derive(Debug, Default)]
pub struct Semaphore {
    blocked: AtomicBool,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            blocked: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SemaphoreId {
        SemaphoreId::of(self)
    }

    /// Whether any thread may be blocked on this semaphore
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub(crate) fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Release);
    }

    /// Suspend the calling thread until the next `unblock`
    pub fn block(&self, scheduler: &Scheduler) {
        scheduler.block_current_thread(self);
    }

    /// Release every thread blocked here
    ///
    /// No-op without waiters. Safe from interrupt handlers.
    pub fn unblock(&self, scheduler: &Scheduler) {
        if self.is_blocked() {
            scheduler.unblock_threads(self);
        }
    }
}

// ============================================================================
// Timed sleep
// ============================================================================

/// Put the calling thread to sleep for `ms` milliseconds
pub fn thread_sleep(scheduler: &Scheduler, ms: u64) {
    let wake_time = scheduler.platform().ms_since_boot().saturating_add(ms);
    scheduler.set_current_thread_sleeping(wake_time);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    #[test]
    fn test_identity_follows_address() {
        let a = Box::new(Semaphore::new());
        let b = Box::new(Semaphore::new());
        assert_eq!(a.id(), a.id());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_unblock_without_waiters_is_noop() {
        let kernel = crate::testing::boot();
        let semaphore = Semaphore::new();
        assert!(!semaphore.is_blocked());
        semaphore.unblock(&kernel.scheduler);
        semaphore.unblock(&kernel.scheduler);
        assert!(!semaphore.is_blocked());
        assert!(kernel.scheduler.blocked_threads().is_empty());
    }
}
