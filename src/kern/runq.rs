//! Run Queue Management
//!
//! The three queues every live thread is in exactly one of:
//!
//! - *Active*: runnable threads in round-robin order. The running thread stays
//!   in Active, marked by the cursor.
//! - *Sleeping*: threads waiting for a wake time, ascending by wake time.
//! - *Blocked*: threads waiting on a semaphore, FIFO per semaphore.
//!
//! Queues hold thread ids only; thread control blocks live in the scheduler's
//! arena. Storage for every queue is reserved when a thread is admitted, so
//! moving a thread between queues never allocates.

use alloc::vec::Vec;

use crate::error::KernResult;
use crate::types::{SemaphoreId, ThreadId};

// ============================================================================
// Queue Entries
// ============================================================================

/// A thread waiting for its wake time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepEntry {
    pub thread_id: ThreadId,
    /// Absolute wake time in milliseconds since boot
    pub wake_time: u64,
}

/// A thread waiting on a semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    pub thread_id: ThreadId,
    pub semaphore: SemaphoreId,
}

/// Which queue a thread is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Active,
    Sleeping,
    Blocked,
}

// ============================================================================
// Run Queues
// ============================================================================

/// Active, Sleeping and Blocked queues of the scheduler
#[derive(Debug, Default)]
pub struct RunQueues {
    active: Vec<ThreadId>,
    /// Index of the running thread in `active`, `None` while idling
    current: Option<usize>,
    sleeping: Vec<SleepEntry>,
    blocked: Vec<BlockEntry>,
    /// Threads admitted and not yet removed
    admitted: usize,
}

impl RunQueues {
    pub const fn new() -> Self {
        Self {
            active: Vec::new(),
            current: None,
            sleeping: Vec::new(),
            blocked: Vec::new(),
            admitted: 0,
        }
    }

    /// Add a thread at the back of Active
    ///
    /// Reserves room for the thread in every queue first, so a failure leaves
    /// the queues untouched.
    pub fn admit(&mut self, thread_id: ThreadId) -> KernResult<()> {
        let needed = self.admitted + 1;
        self.active.try_reserve(needed.saturating_sub(self.active.len()))?;
        self.sleeping.try_reserve(needed.saturating_sub(self.sleeping.len()))?;
        self.blocked.try_reserve(needed.saturating_sub(self.blocked.len()))?;
        self.active.push(thread_id);
        self.admitted = needed;
        Ok(())
    }

    /// Running thread, `None` while the idle thread runs
    pub fn current(&self) -> Option<ThreadId> {
        self.current.map(|index| self.active[index])
    }

    /// Step the cursor to the next Active thread, wrapping at the end
    ///
    /// From idle the cursor starts at the front.
    pub fn advance(&mut self) -> Option<ThreadId> {
        self.current = match self.current {
            _ if self.active.is_empty() => None,
            Some(index) if index + 1 < self.active.len() => Some(index + 1),
            _ => Some(0),
        };
        self.current()
    }

    /// Take the running thread out of Active and move the cursor to the
    /// thread that followed it
    pub fn remove_current(&mut self) -> Option<ThreadId> {
        let index = self.current?;
        let thread_id = self.active.remove(index);
        self.current = if self.active.is_empty() {
            None
        } else if index < self.active.len() {
            Some(index)
        } else {
            Some(0)
        };
        Some(thread_id)
    }

    /// Move the running thread to Sleeping
    ///
    /// A new entry goes in front of entries with the same wake time.
    pub fn sleep_current(&mut self, wake_time: u64) -> Option<ThreadId> {
        let thread_id = self.remove_current()?;
        let position = self
            .sleeping
            .iter()
            .position(|entry| wake_time <= entry.wake_time)
            .unwrap_or(self.sleeping.len());
        self.sleeping.insert(position, SleepEntry { thread_id, wake_time });
        Some(thread_id)
    }

    /// Move the running thread to Blocked under `semaphore`
    pub fn block_current(&mut self, semaphore: SemaphoreId) -> Option<ThreadId> {
        let thread_id = self.remove_current()?;
        self.blocked.push(BlockEntry { thread_id, semaphore });
        Some(thread_id)
    }

    /// Move every sleeper whose wake time is due to the back of Active
    pub fn wake_due(&mut self, now: u64) -> usize {
        let due = self
            .sleeping
            .iter()
            .take_while(|entry| entry.wake_time <= now)
            .count();
        for entry in self.sleeping.drain(..due) {
            self.active.push(entry.thread_id);
        }
        due
    }

    /// Move every thread blocked on `semaphore` to the back of Active, in the
    /// order they blocked
    pub fn unblock(&mut self, semaphore: SemaphoreId) -> usize {
        let mut moved = 0;
        let mut index = 0;
        while index < self.blocked.len() {
            if self.blocked[index].semaphore == semaphore {
                let entry = self.blocked.remove(index);
                self.active.push(entry.thread_id);
                moved += 1;
            } else {
                index += 1;
            }
        }
        moved
    }

    /// Move a Sleeping or Blocked thread back to Active
    pub fn make_active(&mut self, thread_id: ThreadId) -> bool {
        if let Some(index) = self.sleeping.iter().position(|e| e.thread_id == thread_id) {
            self.sleeping.remove(index);
        } else if let Some(index) = self.blocked.iter().position(|e| e.thread_id == thread_id) {
            self.blocked.remove(index);
        } else {
            return false;
        }
        self.active.push(thread_id);
        true
    }

    /// Drop every queued thread matching `doomed`, except the running one
    ///
    /// Scans Blocked, then Sleeping, then Active. Returns how many were
    /// removed.
    pub fn purge(&mut self, mut doomed: impl FnMut(ThreadId) -> bool) -> usize {
        let before = self.blocked.len() + self.sleeping.len() + self.active.len();

        self.blocked.retain(|entry| !doomed(entry.thread_id));
        self.sleeping.retain(|entry| !doomed(entry.thread_id));

        let current = self.current();
        let mut index = 0;
        while index < self.active.len() {
            let thread_id = self.active[index];
            if Some(thread_id) != current && doomed(thread_id) {
                self.active.remove(index);
                if let Some(cursor) = self.current.as_mut() {
                    if index < *cursor {
                        *cursor -= 1;
                    }
                }
            } else {
                index += 1;
            }
        }

        let removed = before - (self.blocked.len() + self.sleeping.len() + self.active.len());
        self.admitted -= removed;
        removed
    }

    /// Account for a thread that left the queues through `remove_current`
    pub fn forget(&mut self) {
        self.admitted -= 1;
    }

    pub fn find(&self, thread_id: ThreadId) -> Option<QueueKind> {
        if self.active.contains(&thread_id) {
            Some(QueueKind::Active)
        } else if self.sleeping.iter().any(|e| e.thread_id == thread_id) {
            Some(QueueKind::Sleeping)
        } else if self.blocked.iter().any(|e| e.thread_id == thread_id) {
            Some(QueueKind::Blocked)
        } else {
            None
        }
    }

    pub fn active(&self) -> &[ThreadId] {
        &self.active
    }

    pub fn sleeping(&self) -> &[SleepEntry] {
        &self.sleeping
    }

    pub fn blocked(&self) -> &[BlockEntry] {
        &self.blocked
    }

    pub fn admitted(&self) -> usize {
        self.admitted
    }

    pub fn is_blocked_on(&self, semaphore: SemaphoreId) -> bool {
        self.blocked.iter().any(|e| e.semaphore == semaphore)
    }
}
