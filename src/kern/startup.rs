//! Kernel Startup and Thread Lifecycle
//!
//! [`Kernel`] is the context object that ties the scheduler, the process
//! registry and the executable loader together. The embedding kernel boots
//! one at startup and hands it to its interrupt and syscall entry points.
//!
//! Every thread begins in [`thread_entry`] and ends in
//! [`Kernel::exit_current_thread`].

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::KernelConfig;
use crate::console;
use crate::error::{KernResult, KernelError};
use crate::kern::credentials::Credentials;
use crate::kern::exec::{self, ImageLoader};
use crate::kern::fd_table::FdTable;
use crate::kern::process::{Process, ProcessTable};
use crate::kern::scheduler::Scheduler;
use crate::kern::signal::Signal;
use crate::kern::thread::{Launch, LaunchAction, Thread, UserFrame};
use crate::platform::Platform;
use crate::types::{Pid, ThreadId};
use crate::vm::AddressSpace;

// ============================================================================
// Kernel
// ============================================================================

pub struct Kernel {
    pub scheduler: Scheduler,
    pub processes: ProcessTable,
    loader: &'static dyn ImageLoader,
    config: KernelConfig,
}

impl Kernel {
    /// Bring up the core: logger, scheduler and an empty process registry
    ///
    /// The kernel lives for the rest of the system's life.
    pub fn boot(
        platform: &'static dyn Platform,
        loader: &'static dyn ImageLoader,
        config: KernelConfig,
    ) -> KernResult<&'static Kernel> {
        console::init_logger(config.log_level);
        let scheduler = Scheduler::new(platform, config)?;
        let kernel = Box::leak(Box::new(Kernel {
            scheduler,
            processes: ProcessTable::new(),
            loader,
            config,
        }));
        log::info!(
            "monokern {} up, kernel stacks {} KiB",
            crate::VERSION,
            config.kernel_stack_size / 1024
        );
        Ok(kernel)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn platform(&self) -> &'static dyn Platform {
        self.scheduler.platform()
    }

    pub(crate) fn loader(&self) -> &'static dyn ImageLoader {
        self.loader
    }

    /// Run threads until none remain
    pub fn run(&'static self) {
        self.scheduler.run();
    }

    /// Run threads forever
    pub fn start(&'static self) -> ! {
        self.scheduler.start()
    }

    /// How every thread of this kernel is started
    fn launch(&'static self) -> Launch {
        Launch {
            entry: thread_entry,
            arg: self as *const Kernel as usize,
        }
    }

    // ========================================================================
    // Process creation
    // ========================================================================

    /// New, unregistered process without threads
    pub fn create_process(
        &self,
        credentials: Credentials,
        parent: Pid,
        sid: Pid,
        pgrp: Pid,
    ) -> KernResult<Arc<Process>> {
        let fds = FdTable::new(self.config.max_open_files)?;
        let pid = self.processes.allocate_pid();
        Ok(Process::new(pid, parent, sid, pgrp, credentials, fds))
    }

    /// Registered root process for kernel threads
    pub fn create_kernel_process(&self) -> KernResult<Arc<Process>> {
        let process = self.create_process(Credentials::root(), Pid(0), Pid(0), Pid(0))?;
        self.processes.register(&process)?;
        log::debug!("created kernel process {}", process.pid());
        Ok(process)
    }

    /// Start a kernel thread running `entry` inside `process`
    pub fn spawn_kernel_thread<F>(&'static self, process: &Arc<Process>, entry: F) -> KernResult<ThreadId>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = Thread::create_kernel(
            entry,
            process,
            self.config.kernel_stack_size,
            self.launch(),
        )
        .inspect_err(|err| log::warn!("kernel thread for {}: {}", process.pid(), err))?;
        self.admit(process, thread)
    }

    /// Add a fully built thread to its process and to the scheduler
    pub(crate) fn admit(&self, process: &Process, thread: Box<Thread>) -> KernResult<ThreadId> {
        let id = thread.id();
        process.add_thread(id)?;
        self.scheduler.add_thread(thread).inspect_err(|_| {
            process.remove_thread(id);
        })
    }

    /// Load `path` and start it as a new session leader with argv `[path]`
    pub fn create_userspace_process(
        &'static self,
        credentials: Credentials,
        path: &str,
    ) -> KernResult<Arc<Process>> {
        let image = self
            .loader
            .load(&credentials, path)
            .and_then(|image| image.validate(&self.config).map(|()| image))
            .inspect_err(|err| log::warn!("loading {}: {}", path, err))?;

        let process = self.create_process(credentials, Pid(0), Pid(0), Pid(0))?;
        let frame = {
            let mut inner = process.lock();
            let space = &mut inner.address_space;
            image.map_into(space)?;
            let sp = exec::map_user_stack(space, &self.config)?;
            let argv = exec::copy_strings(&[path])?;
            let args = exec::write_arguments(space, &argv, &[])?;
            UserFrame {
                ip: image.entry,
                sp,
                return_value: 0,
                argc: args.argc,
                argv: args.argv,
                envp: args.envp,
            }
        };

        let thread = Thread::create_userspace(
            &process,
            frame,
            self.config.kernel_stack_size,
            self.launch(),
        )?;
        self.processes.register(&process)?;
        if let Err(err) = self.admit(&process, thread) {
            self.processes.unregister(process.pid());
            return Err(err);
        }
        log::debug!("started {} from {}", process.pid(), path);
        Ok(process)
    }

    // ========================================================================
    // Current context
    // ========================================================================

    /// Process of the running thread
    pub fn current_process(&self) -> KernResult<Arc<Process>> {
        self.scheduler
            .with_current_thread(|thread| thread.process())
            .flatten()
            .ok_or(KernelError::NoSuchProcess)
    }

    pub fn current_thread_id(&self) -> ThreadId {
        match self.scheduler.current_thread_id() {
            Some(id) => id,
            None => panic!("no thread context"),
        }
    }

    // ========================================================================
    // Exit
    // ========================================================================

    /// Ask `process` to exit with `status` or `signal`
    ///
    /// Every thread other than the caller is marked Terminating and leaves at
    /// its next dispatch.
    pub fn request_process_exit(&self, process: &Process, status: i32, signal: Option<Signal>) {
        if process.request_exit(status, signal) {
            log::debug!(
                "{} exiting, status {} signal {:?}",
                process.pid(),
                status,
                signal.map(Signal::number)
            );
        }
        let current = self.scheduler.current_thread_id();
        for id in process.thread_ids() {
            if Some(id) != current {
                self.scheduler.terminate_thread(id);
            }
        }
    }

    /// Exit the calling process
    pub fn exit_current_process(&self, status: i32, signal: Option<Signal>) -> ! {
        if let Ok(process) = self.current_process() {
            self.request_process_exit(&process, status, signal);
        }
        self.exit_current_thread()
    }

    /// End the calling thread
    ///
    /// The last thread of a process runs the process cleanup and tears the
    /// whole process down.
    pub fn exit_current_thread(&self) -> ! {
        self.scheduler.begin_exit_current();
        let id = self.current_thread_id();

        let Ok(process) = self.current_process() else {
            self.scheduler.set_current_thread_done()
        };
        if !process.remove_thread(id) {
            drop(process);
            self.scheduler.set_current_thread_done()
        }

        let space = self.cleanup_process(&process);
        drop(process);
        self.scheduler.set_current_process_done(Some(space))
    }

    /// Runs on the last thread of `process`
    fn cleanup_process(&self, process: &Process) -> AddressSpace {
        self.processes.unregister(process.pid());
        process.lock().exit.exited = true;

        // Waiters have to see the exit before the process goes away
        loop {
            let mut inner = process.lock();
            inner.exit.waiters.retain(|&id| self.scheduler.thread_exists(id));
            if inner.exit.waiters.is_empty() {
                break;
            }
            drop(inner);
            process.exit_semaphore().unblock(&self.scheduler);
            self.scheduler.yield_now();
        }

        let mut inner = process.lock();
        inner.fds.close_all(&self.scheduler);
        log::debug!("{} exited with status {:#x}", process.pid(), inner.exit.code);
        core::mem::take(&mut inner.address_space)
    }
}

// ============================================================================
// Thread entry
// ============================================================================

/// First code every non-idle thread runs; `arg` is the kernel
pub(crate) extern "C" fn thread_entry(arg: usize) -> ! {
    // SAFETY: `Kernel::launch` stores the address of the leaked kernel
    let kernel = unsafe { &*(arg as *const Kernel) };
    kernel.scheduler.finish_switch();
    kernel.platform().enable_interrupts();

    match kernel.scheduler.launch_action() {
        LaunchAction::Kernel(entry) => {
            entry();
            kernel.exit_current_thread()
        }
        LaunchAction::User(frame) => kernel.platform().enter_userspace(&frame),
        LaunchAction::Exit => kernel.exit_current_thread(),
    }
}

/// Absolute, normalised form of `path` relative to `cwd`
///
/// `.` and empty components are dropped and `..` removes the previous
/// component; `..` at the root stays at the root.
pub fn absolute_path_of(cwd: &str, path: &str) -> KernResult<String> {
    let mut components: Vec<&str> = Vec::new();
    let relative = if path.starts_with('/') { "" } else { cwd };
    for component in relative.split('/').chain(path.split('/')) {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            name => {
                components.try_reserve(1)?;
                components.push(name);
            }
        }
    }

    let mut out = String::new();
    out.try_reserve(components.iter().map(|c| c.len() + 1).sum::<usize>().max(1))?;
    for component in &components {
        out.push('/');
        out.push_str(component);
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}
