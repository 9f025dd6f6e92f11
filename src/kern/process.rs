//! Process Management
//!
//! A process owns an address space, a descriptor table, credentials and one
//! or more threads. Threads refer back to their process weakly; the registry
//! and in-flight syscalls hold the strong references.
//!
//! Lock order: a process lock may be held while taking the scheduler lock,
//! never the other way round, and no process lock is held across a context
//! switch.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};
use spin::{Mutex, MutexGuard};

use crate::error::KernResult;
use crate::kern::credentials::Credentials;
use crate::kern::fd_table::FdTable;
use crate::kern::sched_prim::Semaphore;
use crate::kern::signal::{Signal, SignalHandlers, SignalSet};
use crate::types::{Pid, ThreadId};
use crate::vm::AddressSpace;

// ============================================================================
// Exit status
// ============================================================================

/// Build a wait status from an exit status and a terminating signal
pub const fn encode_exit_code(status: i32, signal: Option<Signal>) -> i32 {
    let signal = match signal {
        Some(signal) => signal.number() as i32,
        None => 0,
    };
    ((status & 0xff) << 8) | (signal & 0x7f)
}

/// Exit bookkeeping of one process
#[derive(Debug, Default)]
pub struct ExitStatus {
    /// Wait status, fixed by the first exit request
    pub code: i32,
    /// An exit has been requested
    pub exiting: bool,
    /// Cleanup has started; `code` is final and waiters may return
    pub exited: bool,
    /// Threads blocked in `wait` on this process
    pub waiters: Vec<ThreadId>,
}

// ============================================================================
// Process
// ============================================================================

/// Mutable per-process state, guarded by the process lock
pub struct ProcessInner {
    pub parent: Pid,
    pub sid: Pid,
    pub pgrp: Pid,
    pub credentials: Credentials,
    pub address_space: AddressSpace,
    /// Live threads in creation order
    pub threads: Vec<ThreadId>,
    pub fds: FdTable,
    pub cwd: String,
    pub signal_handlers: SignalHandlers,
    /// Signals sent to the process as a whole
    pub pending_signals: SignalSet,
    pub has_called_exec: bool,
    pub exit: ExitStatus,
}

pub struct Process {
    pid: Pid,
    inner: Mutex<ProcessInner>,
    exit_semaphore: Semaphore,
}

impl Process {
    /// New process without threads
    ///
    /// When both `sid` and `pgrp` are 0 the process leads a new session and a
    /// new group.
    pub fn new(
        pid: Pid,
        parent: Pid,
        sid: Pid,
        pgrp: Pid,
        credentials: Credentials,
        fds: FdTable,
    ) -> Arc<Process> {
        let (sid, pgrp) = if sid == Pid(0) && pgrp == Pid(0) {
            (pid, pid)
        } else {
            (sid, pgrp)
        };
        Arc::new(Process {
            pid,
            inner: Mutex::new(ProcessInner {
                parent,
                sid,
                pgrp,
                credentials,
                address_space: AddressSpace::new(),
                threads: Vec::new(),
                fds,
                cwd: String::from("/"),
                signal_handlers: SignalHandlers::new(),
                pending_signals: SignalSet::empty(),
                has_called_exec: false,
                exit: ExitStatus::default(),
            }),
            exit_semaphore: Semaphore::new(),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Take the process lock
    pub fn lock(&self) -> MutexGuard<'_, ProcessInner> {
        self.inner.lock()
    }

    pub fn exit_semaphore(&self) -> &Semaphore {
        &self.exit_semaphore
    }

    pub fn parent(&self) -> Pid {
        self.lock().parent
    }

    pub fn sid(&self) -> Pid {
        self.lock().sid
    }

    pub fn pgrp(&self) -> Pid {
        self.lock().pgrp
    }

    pub fn is_session_leader(&self) -> bool {
        self.sid() == self.pid
    }

    pub fn credentials(&self) -> Credentials {
        self.lock().credentials
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.lock().threads.clone()
    }

    pub fn thread_count(&self) -> usize {
        self.lock().threads.len()
    }

    pub fn add_thread(&self, id: ThreadId) -> KernResult<()> {
        let mut inner = self.lock();
        inner.threads.try_reserve(1)?;
        inner.threads.push(id);
        Ok(())
    }

    /// Forget thread `id`; returns true if it was the last one
    pub fn remove_thread(&self, id: ThreadId) -> bool {
        let mut inner = self.lock();
        inner.threads.retain(|&thread| thread != id);
        inner.threads.is_empty()
    }

    /// Record an exit request; only the first request sets the code
    ///
    /// Returns false if the process was already exiting.
    pub fn request_exit(&self, status: i32, signal: Option<Signal>) -> bool {
        let mut inner = self.lock();
        if inner.exit.exiting {
            return false;
        }
        inner.exit.exiting = true;
        inner.exit.code = encode_exit_code(status, signal);
        true
    }

    pub fn is_exiting(&self) -> bool {
        self.lock().exit.exiting
    }

    pub fn has_exited(&self) -> bool {
        self.lock().exit.exited
    }

    pub fn exit_code(&self) -> i32 {
        self.lock().exit.code
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process").field("pid", &self.pid).finish()
    }
}

// ============================================================================
// Process registry
// ============================================================================

/// Registry of live processes, ordered by pid
pub struct ProcessTable {
    processes: Mutex<Vec<Arc<Process>>>,
    next_pid: AtomicI32,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            processes: Mutex::new(Vec::new()),
            next_pid: AtomicI32::new(1),
        }
    }

    pub fn allocate_pid(&self) -> Pid {
        Pid(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, process: &Arc<Process>) -> KernResult<()> {
        let mut processes = self.processes.lock();
        processes.try_reserve(1)?;
        let index = processes.partition_point(|p| p.pid() < process.pid());
        processes.insert(index, process.clone());
        Ok(())
    }

    pub fn unregister(&self, pid: Pid) -> Option<Arc<Process>> {
        let mut processes = self.processes.lock();
        let index = processes.binary_search_by_key(&pid, |p| p.pid()).ok()?;
        Some(processes.remove(index))
    }

    pub fn find(&self, pid: Pid) -> Option<Arc<Process>> {
        let processes = self.processes.lock();
        let index = processes.binary_search_by_key(&pid, |p| p.pid()).ok()?;
        Some(processes[index].clone())
    }

    /// Snapshot of the registered processes
    ///
    /// Callers iterate the snapshot so that no registry lock is held while
    /// process locks are taken.
    pub fn snapshot(&self) -> Vec<Arc<Process>> {
        self.processes.lock().clone()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Process>)) {
        for process in self.snapshot() {
            f(&process);
        }
    }

    pub fn for_each_in_session(&self, sid: Pid, mut f: impl FnMut(&Arc<Process>)) {
        self.for_each(|process| {
            if process.sid() == sid {
                f(process);
            }
        });
    }

    pub fn len(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(table: &ProcessTable, sid: Pid, pgrp: Pid) -> Arc<Process> {
        let pid = table.allocate_pid();
        Process::new(pid, Pid(0), sid, pgrp, Credentials::root(), FdTable::new(4).unwrap())
    }

    #[test]
    fn test_new_session_leader() {
        let table = ProcessTable::new();
        let leader = process(&table, Pid(0), Pid(0));
        assert_eq!(leader.pid(), Pid(1));
        assert_eq!(leader.sid(), Pid(1));
        assert_eq!(leader.pgrp(), Pid(1));
        assert!(leader.is_session_leader());

        let member = process(&table, leader.sid(), leader.pgrp());
        assert_eq!(member.sid(), Pid(1));
        assert!(!member.is_session_leader());
        assert_eq!(member.lock().cwd, "/");
    }

    #[test]
    fn test_registry_lookup() {
        let table = ProcessTable::new();
        let a = process(&table, Pid(0), Pid(0));
        let b = process(&table, Pid(0), Pid(0));
        table.register(&b).unwrap();
        table.register(&a).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.find(a.pid()).unwrap().pid(), a.pid());

        let pids: Vec<Pid> = table.snapshot().iter().map(|p| p.pid()).collect();
        assert_eq!(pids, [a.pid(), b.pid()]);

        assert!(table.unregister(a.pid()).is_some());
        assert!(table.find(a.pid()).is_none());
        assert!(table.unregister(a.pid()).is_none());
    }

    #[test]
    fn test_for_each_in_session() {
        let table = ProcessTable::new();
        let leader = process(&table, Pid(0), Pid(0));
        let member = process(&table, leader.pid(), leader.pid());
        let other = process(&table, Pid(0), Pid(0));
        for p in [&leader, &member, &other] {
            table.register(p).unwrap();
        }

        let mut seen = Vec::new();
        table.for_each_in_session(leader.pid(), |p| seen.push(p.pid()));
        assert_eq!(seen, [leader.pid(), member.pid()]);
    }

    #[test]
    fn test_thread_membership() {
        let table = ProcessTable::new();
        let p = process(&table, Pid(0), Pid(0));
        p.add_thread(ThreadId(10)).unwrap();
        p.add_thread(ThreadId(11)).unwrap();
        assert!(!p.remove_thread(ThreadId(10)));
        assert_eq!(p.thread_ids(), [ThreadId(11)]);
        assert!(p.remove_thread(ThreadId(11)));
    }

    #[test]
    fn test_first_exit_wins() {
        let table = ProcessTable::new();
        let p = process(&table, Pid(0), Pid(0));
        assert!(p.request_exit(3, None));
        assert!(!p.request_exit(0, Some(Signal::KILL)));
        assert_eq!(p.exit_code(), 3 << 8);
        assert!(p.is_exiting());
        assert!(!p.has_exited());
    }

    #[test]
    fn test_exit_code_encoding() {
        assert_eq!(encode_exit_code(0x1ff, None), 0xff00);
        assert_eq!(encode_exit_code(0, Some(Signal::SEGV)), 11);
    }
}
