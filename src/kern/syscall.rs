//! System call implementations
//!
//! Each `sys_*` method runs on the calling thread with interrupts enabled and
//! acts on the current process. Argument decoding and the trap frame belong
//! to the embedding kernel's entry code; pointers have already been copied in
//! by the time these run.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::convert::Infallible;

use crate::error::{KernResult, KernelError};
use crate::kern::credentials::Credentials;
use crate::kern::exec::{self, ExecImage};
use crate::kern::fd_table::FdTable;
use crate::kern::process::{ExitStatus, Process, ProcessInner};
use crate::kern::sched_prim::thread_sleep;
use crate::kern::signal::{Signal, SignalDelivery, SignalHandler, SignalSet};
use crate::kern::startup::{absolute_path_of, Kernel};
use crate::kern::thread::{Thread, UserFrame};
use crate::types::Pid;
use crate::vm::AddressSpace;

// ============================================================================
// Wait status helpers
// ============================================================================

pub const fn wexitstatus(status: i32) -> i32 {
    (status >> 8) & 0xff
}

pub const fn wtermsig(status: i32) -> i32 {
    status & 0x7f
}

pub const fn wifexited(status: i32) -> bool {
    wtermsig(status) == 0
}

pub const fn wifsignaled(status: i32) -> bool {
    let signal = wtermsig(status);
    signal != 0 && signal != 0x7f
}

impl Kernel {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Duplicate the calling process
    ///
    /// The child gets a full copy of the address space and descriptor table
    /// and one thread that resumes at (`sp`, `ip`) in userspace with 0 as the
    /// syscall result. Returns the child's pid to the parent.
    pub fn sys_fork(&self, sp: usize, ip: usize) -> KernResult<Pid> {
        let parent = self.current_process()?;

        let child = {
            let inner = parent.lock();
            let address_space = inner.address_space.try_clone()?;
            let fds = inner.fds.try_clone()?;
            let child = Process::new(
                self.processes.allocate_pid(),
                parent.pid(),
                inner.sid,
                inner.pgrp,
                inner.credentials,
                fds,
            );
            let mut child_inner = child.lock();
            child_inner.address_space = address_space;
            child_inner.cwd.clear();
            child_inner.cwd.push_str(&inner.cwd);
            child_inner.signal_handlers = inner.signal_handlers.clone();
            drop(child_inner);
            child
        };

        let built = match self
            .scheduler
            .with_current_thread(|thread| thread.clone(&child, sp, ip))
        {
            Some(thread) => thread.and_then(|thread| self.register_forked(&child, thread)),
            None => Err(KernelError::NoSuchProcess),
        };
        if let Err(err) = built {
            log::warn!("fork of {} failed: {}", parent.pid(), err);
            child.lock().fds.close_all(&self.scheduler);
            return Err(err);
        }

        log::debug!("{} forked {}", parent.pid(), child.pid());
        Ok(child.pid())
    }

    fn register_forked(&self, child: &Arc<Process>, thread: Box<Thread>) -> KernResult<()> {
        self.processes.register(child)?;
        if let Err(err) = self.admit(child, thread) {
            self.processes.unregister(child.pid());
            return Err(err);
        }
        Ok(())
    }

    /// Replace the calling process's image with `path`
    ///
    /// Only returns on failure. Errors found while loading leave the caller
    /// untouched; once the old image is being torn down any failure kills the
    /// process with SIGKILL.
    pub fn sys_exec(&self, path: &str, argv: &[&str], envp: &[&str]) -> KernResult<Infallible> {
        let process = self.current_process()?;
        let (credentials, path) = {
            let inner = process.lock();
            if inner.threads.len() != 1 {
                return Err(KernelError::NotSupported);
            }
            if path.is_empty() {
                return Err(KernelError::NotFound);
            }
            (inner.credentials, absolute_path_of(&inner.cwd, path)?)
        };
        let argv = exec::copy_strings(argv)?;
        let envp = exec::copy_strings(envp)?;
        let image = self
            .loader()
            .load(&credentials, &path)
            .and_then(|image| image.validate(self.config()).map(|()| image))
            .inspect_err(|err| log::warn!("exec {} in {}: {}", path, process.pid(), err))?;

        // Point of no return
        let frame = match self.replace_image(&process, &image, &argv, &envp) {
            Ok(frame) => frame,
            Err(err) => {
                log::error!("exec {} in {} failed after teardown: {}", path, process.pid(), err);
                self.request_process_exit(&process, 0, Some(Signal::KILL));
                drop((process, image, argv, envp, path));
                self.exit_current_thread()
            }
        };
        log::debug!("{} exec {}", process.pid(), path);
        self.scheduler.with_current_thread(|thread| thread.setup_exec(frame));
        drop((process, image, argv, envp, path));
        self.platform().enter_userspace(&frame)
    }

    fn replace_image(
        &self,
        process: &Process,
        image: &ExecImage,
        argv: &[String],
        envp: &[String],
    ) -> KernResult<UserFrame> {
        let mut inner = process.lock();
        inner.fds.close_cloexec(&self.scheduler);
        inner.address_space.clear();

        let space = &mut inner.address_space;
        image.map_into(space)?;
        let sp = exec::map_user_stack(space, self.config())?;
        let args = exec::write_arguments(space, argv, envp)?;

        inner.signal_handlers.reset();
        inner.has_called_exec = true;
        Ok(UserFrame {
            ip: image.entry,
            sp,
            return_value: 0,
            argc: args.argc,
            argv: args.argv,
            envp: args.envp,
        })
    }

    /// Terminate the calling process with exit status `status`
    pub fn sys_exit(&self, status: i32) -> ! {
        self.exit_current_process(status, None)
    }

    /// Block until process `pid` has exited; returns its pid and wait status
    pub fn sys_wait(&self, pid: Pid, options: i32) -> KernResult<(Pid, i32)> {
        if options != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let target = self.processes.find(pid).ok_or(KernelError::NoChild)?;
        let me = self.current_process()?;
        if Arc::ptr_eq(&target, &me) {
            return Err(KernelError::InvalidArgument);
        }
        drop(me);

        let id = self.current_thread_id();
        loop {
            {
                let mut inner = target.lock();
                let exit: &mut ExitStatus = &mut inner.exit;
                if exit.exited {
                    exit.waiters.retain(|&waiter| waiter != id);
                    return Ok((pid, exit.code));
                }
                if !exit.waiters.contains(&id) {
                    exit.waiters.try_reserve(1)?;
                    exit.waiters.push(id);
                }
            }
            target.exit_semaphore().block(&self.scheduler);
        }
    }

    pub fn sys_sleep(&self, ms: u64) {
        thread_sleep(&self.scheduler, ms);
    }

    // ========================================================================
    // Signals
    // ========================================================================

    /// Send `signal` to a process (`pid > 0`) or a process group (`pid < -1`)
    ///
    /// Signal 0 only checks that a target exists.
    pub fn sys_kill(&self, pid: i32, signal: i32) -> KernResult<()> {
        if pid == 0 || pid == -1 {
            return Err(KernelError::NotSupported);
        }
        let signal = match signal {
            0 => None,
            number => Some(Signal::new(number)?),
        };

        let current = self.current_process().ok();
        if let (Some(current), Some(signal)) = (&current, signal) {
            if current.pid() == Pid(pid) {
                return self.raise_on_current(signal);
            }
        }

        let targets: Vec<Arc<Process>> = if pid > 0 {
            self.processes.find(Pid(pid)).into_iter().collect()
        } else {
            let group = Pid(-pid);
            let mut members = Vec::new();
            self.processes.for_each(|process| {
                if process.pgrp() == group {
                    members.push(process.clone());
                }
            });
            members
        };
        if targets.is_empty() {
            return Err(KernelError::NoSuchProcess);
        }
        let Some(signal) = signal else {
            return Ok(());
        };
        let mut includes_caller = false;
        for target in &targets {
            self.send_signal(target, signal);
            includes_caller |= current.as_ref().is_some_and(|c| Arc::ptr_eq(c, target));
        }
        // Exit requests skip the calling thread, so it has to see the
        // signal itself
        if includes_caller && signal == Signal::KILL {
            self.raise_on_current(signal)?;
        }
        Ok(())
    }

    fn send_signal(&self, target: &Process, signal: Signal) {
        if signal == Signal::KILL {
            self.request_process_exit(target, 0, Some(signal));
            return;
        }
        let mut inner = target.lock();
        if !inner.signal_handlers.is_ignored(signal) {
            inner.pending_signals.add(signal);
        }
    }

    /// Send `signal` to the calling thread
    pub fn sys_raise(&self, signal: i32) -> KernResult<()> {
        self.raise_on_current(Signal::new(signal)?)
    }

    fn raise_on_current(&self, signal: Signal) -> KernResult<()> {
        self.scheduler
            .with_current_thread(|thread| thread.add_signal(signal))
            .ok_or(KernelError::NoSuchProcess)
    }

    /// Install a disposition; returns the previous one
    pub fn sys_signal(&self, signal: i32, handler: SignalHandler) -> KernResult<SignalHandler> {
        let signal = Signal::new(signal)?;
        let process = self.current_process()?;
        let previous = process.lock().signal_handlers.set(signal, handler)?;
        Ok(previous)
    }

    /// Act on pending signals before returning to userspace
    ///
    /// Ignored signals are discarded and default-fatal ones end the process.
    /// Returns the first signal with a user handler, if any.
    pub fn deliver_pending_signals(&self) -> Option<SignalDelivery> {
        let process = self.current_process().ok()?;
        loop {
            let signal = self
                .scheduler
                .with_current_thread(|thread| thread.take_signal())
                .flatten()
                .or_else(|| process.lock().pending_signals.take_lowest())?;

            let (handler, ignored) = {
                let inner = process.lock();
                (inner.signal_handlers.get(signal), inner.signal_handlers.is_ignored(signal))
            };
            match handler {
                SignalHandler::Handler(address) => {
                    return Some(SignalDelivery {
                        signal,
                        handler: address,
                    })
                }
                _ if ignored => continue,
                _ => {
                    log::debug!("{} killed by {}", process.pid(), signal);
                    drop(process);
                    self.exit_current_process(0, Some(signal))
                }
            }
        }
    }

    /// Check that `[addr, addr + len)` is mapped in the calling process
    ///
    /// A bad range pends SIGSEGV on the calling thread.
    pub fn validate_user_range(&self, addr: usize, len: usize) -> KernResult<()> {
        let process = self.current_process()?;
        let mapped = process.lock().address_space.contains_range(addr, len);
        if mapped {
            return Ok(());
        }
        let _ = self.raise_on_current(Signal::SEGV);
        Err(KernelError::Fault)
    }

    pub fn pending_signals(&self) -> KernResult<SignalSet> {
        Ok(self.current_process()?.lock().pending_signals)
    }

    // ========================================================================
    // Identity
    // ========================================================================

    pub fn sys_getpid(&self) -> KernResult<Pid> {
        Ok(self.current_process()?.pid())
    }

    pub fn sys_getppid(&self) -> KernResult<Pid> {
        Ok(self.current_process()?.parent())
    }

    pub fn sys_getsid(&self) -> KernResult<Pid> {
        Ok(self.current_process()?.sid())
    }

    fn with_credentials<R>(
        &self,
        f: impl FnOnce(&mut Credentials) -> KernResult<R>,
    ) -> KernResult<R> {
        let process = self.current_process()?;
        let mut inner = process.lock();
        f(&mut inner.credentials)
    }

    pub fn sys_getuid(&self) -> KernResult<u32> {
        self.with_credentials(|c| Ok(c.ruid()))
    }

    pub fn sys_geteuid(&self) -> KernResult<u32> {
        self.with_credentials(|c| Ok(c.euid()))
    }

    pub fn sys_getgid(&self) -> KernResult<u32> {
        self.with_credentials(|c| Ok(c.rgid()))
    }

    pub fn sys_getegid(&self) -> KernResult<u32> {
        self.with_credentials(|c| Ok(c.egid()))
    }

    pub fn sys_setuid(&self, uid: i64) -> KernResult<()> {
        self.with_credentials(|c| c.set_uid(uid))
    }

    pub fn sys_setgid(&self, gid: i64) -> KernResult<()> {
        self.with_credentials(|c| c.set_gid(gid))
    }

    pub fn sys_seteuid(&self, uid: i64) -> KernResult<()> {
        self.with_credentials(|c| c.set_euid(uid))
    }

    pub fn sys_setegid(&self, gid: i64) -> KernResult<()> {
        self.with_credentials(|c| c.set_egid(gid))
    }

    pub fn sys_setreuid(&self, ruid: i64, euid: i64) -> KernResult<()> {
        self.with_credentials(|c| c.set_reuid(ruid, euid))
    }

    pub fn sys_setregid(&self, rgid: i64, egid: i64) -> KernResult<()> {
        self.with_credentials(|c| c.set_regid(rgid, egid))
    }

    // ========================================================================
    // Sessions and process groups
    // ========================================================================

    /// Move process `pid` (0: caller) into group `pgid` (0: its own pid)
    pub fn sys_setpgid(&self, pid: i32, pgid: i32) -> KernResult<()> {
        if pgid < 0 {
            return Err(KernelError::InvalidArgument);
        }
        let me = self.current_process()?;
        let sid = me.sid();
        let pid = if pid == 0 { me.pid() } else { Pid(pid) };
        let pgid = if pgid == 0 { pid } else { Pid(pgid) };

        if pid != pgid {
            let mut group_exists = false;
            self.processes.for_each_in_session(sid, |process| {
                group_exists |= process.pgrp() == pgid;
            });
            if !group_exists {
                return Err(KernelError::PermissionDenied);
            }
        }

        if pid == me.pid() {
            if me.is_session_leader() {
                return Err(KernelError::PermissionDenied);
            }
            me.lock().pgrp = pgid;
            return Ok(());
        }

        let target = self.processes.find(pid).ok_or(KernelError::NoSuchProcess)?;
        let mut inner = target.lock();
        if inner.parent != me.pid() {
            Err(KernelError::NoSuchProcess)
        } else if inner.sid == target.pid() {
            Err(KernelError::PermissionDenied)
        } else if inner.has_called_exec {
            Err(KernelError::AccessDenied)
        } else if inner.sid != sid {
            Err(KernelError::PermissionDenied)
        } else {
            inner.pgrp = pgid;
            Ok(())
        }
    }

    pub fn sys_getpgid(&self, pid: i32) -> KernResult<Pid> {
        let me = self.current_process()?;
        if pid == 0 || Pid(pid) == me.pid() {
            return Ok(me.pgrp());
        }
        let sid = me.sid();
        let target = self.processes.find(Pid(pid)).ok_or(KernelError::NoSuchProcess)?;
        let inner = target.lock();
        if inner.sid != sid {
            return Err(KernelError::PermissionDenied);
        }
        Ok(inner.pgrp)
    }

    // ========================================================================
    // Working directory
    // ========================================================================

    pub fn sys_getcwd(&self) -> KernResult<String> {
        let process = self.current_process()?;
        let inner = process.lock();
        let mut cwd = String::new();
        cwd.try_reserve_exact(inner.cwd.len())?;
        cwd.push_str(&inner.cwd);
        Ok(cwd)
    }

    /// Change directory; existence is checked by the filesystem layer
    pub fn sys_setcwd(&self, path: &str) -> KernResult<()> {
        if path.is_empty() {
            return Err(KernelError::NotFound);
        }
        let process = self.current_process()?;
        let mut inner = process.lock();
        inner.cwd = absolute_path_of(&inner.cwd, path)?;
        Ok(())
    }

    // ========================================================================
    // Descriptors
    // ========================================================================

    fn with_fds<R>(&self, f: impl FnOnce(&mut FdTable) -> KernResult<R>) -> KernResult<R> {
        let process = self.current_process()?;
        let mut inner = process.lock();
        f(&mut inner.fds)
    }

    pub fn sys_pipe(&self) -> KernResult<[i32; 2]> {
        self.with_fds(FdTable::pipe)
    }

    /// Read from `fd`; may block, so the process lock is not held meanwhile
    pub fn sys_read(&self, fd: i32, buf: &mut [u8]) -> KernResult<usize> {
        let description = self.with_fds(|fds| fds.description(fd))?;
        description.read(&self.scheduler, buf)
    }

    pub fn sys_write(&self, fd: i32, data: &[u8]) -> KernResult<usize> {
        let description = self.with_fds(|fds| fds.description(fd))?;
        description.write(&self.scheduler, data)
    }

    pub fn sys_close(&self, fd: i32) -> KernResult<()> {
        self.with_fds(|fds| fds.close(&self.scheduler, fd))
    }

    pub fn sys_dup(&self, fd: i32) -> KernResult<i32> {
        self.with_fds(|fds| fds.dup(fd))
    }

    pub fn sys_dup2(&self, old_fd: i32, new_fd: i32) -> KernResult<i32> {
        self.with_fds(|fds| fds.dup2(&self.scheduler, old_fd, new_fd))
    }

    /// Address space of the calling process, for the trap layer's copy
    /// helpers
    pub fn with_address_space<R>(&self, f: impl FnOnce(&mut AddressSpace) -> R) -> KernResult<R> {
        let process = self.current_process()?;
        let mut inner = process.lock();
        Ok(f(&mut inner.address_space))
    }

    pub fn with_current_process<R>(&self, f: impl FnOnce(&mut ProcessInner) -> R) -> KernResult<R> {
        let process = self.current_process()?;
        let mut inner = process.lock();
        Ok(f(&mut inner))
    }
}
