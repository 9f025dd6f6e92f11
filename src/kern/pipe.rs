//! Anonymous pipes
//!
//! A pipe is a byte buffer shared by its read and write ends. Readers block
//! on the pipe's semaphore while the buffer is empty and at least one write
//! end is still open; the last write end closing turns an empty buffer into
//! end-of-file.

use alloc::collections::VecDeque;
use spin::Mutex;

use crate::error::KernResult;
use crate::kern::sched_prim::Semaphore;
use crate::kern::scheduler::Scheduler;

struct PipeBuffer {
    bytes: VecDeque<u8>,
    /// Open write-end descriptors
    writers: usize,
}

pub struct Pipe {
    buffer: Mutex<PipeBuffer>,
    semaphore: Semaphore,
}

impl Pipe {
    /// Pipe with no write ends yet; descriptors register themselves
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(PipeBuffer {
                bytes: VecDeque::new(),
                writers: 0,
            }),
            semaphore: Semaphore::new(),
        }
    }

    /// Read up to `buf.len()` bytes, blocking while the pipe is empty
    ///
    /// Returns 0 once the pipe is empty and no write end remains.
    pub fn read(&self, scheduler: &Scheduler, buf: &mut [u8]) -> KernResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut buffer = self.buffer.lock();
                if !buffer.bytes.is_empty() {
                    let count = buf.len().min(buffer.bytes.len());
                    for (dst, src) in buf.iter_mut().zip(buffer.bytes.drain(..count)) {
                        *dst = src;
                    }
                    return Ok(count);
                }
                if buffer.writers == 0 {
                    return Ok(0);
                }
            }
            self.semaphore.block(scheduler);
        }
    }

    /// Append `data` and wake blocked readers
    pub fn write(&self, scheduler: &Scheduler, data: &[u8]) -> KernResult<usize> {
        {
            let mut buffer = self.buffer.lock();
            buffer.bytes.try_reserve(data.len())?;
            buffer.bytes.extend(data.iter().copied());
        }
        self.semaphore.unblock(scheduler);
        Ok(data.len())
    }

    pub(crate) fn add_writer(&self) {
        self.buffer.lock().writers += 1;
    }

    /// Drop one write end; the last one wakes readers to see end-of-file
    pub(crate) fn close_writing(&self, scheduler: &Scheduler) {
        let remaining = {
            let mut buffer = self.buffer.lock();
            debug_assert!(buffer.writers > 0, "pipe writer count underflow");
            buffer.writers = buffer.writers.saturating_sub(1);
            buffer.writers
        };
        if remaining == 0 {
            self.semaphore.unblock(scheduler);
        }
    }

    pub fn writers(&self) -> usize {
        self.buffer.lock().writers
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}
