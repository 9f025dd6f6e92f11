//! Thread Management
//!
//! Threads are the unit of execution. A thread belongs to exactly one
//! process for its whole life, owns its kernel stack and carries the saved
//! context the scheduler switches through.
//!
//! A thread never frees its own stack: once it is done the scheduler parks it
//! and whichever thread runs next reclaims it.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::NonNull;

use crate::arch::{self, Context, EntryFn, STACK_ALIGN};
use crate::error::{KernResult, KernelError};
use crate::kern::process::Process;
use crate::kern::signal::{Signal, SignalSet};
use crate::types::{Pid, ThreadId};

/// Smallest stack a thread may be created with
pub const MIN_STACK_SIZE: usize = 4096;

// ============================================================================
// Thread State
// ============================================================================

/// Lifecycle of a thread
///
/// `NotStarted -> Executing -> Terminating -> Exiting -> (reclaimed)`.
/// Terminating is only a request; the thread reaches its exit path the next
/// time it is dispatched and is Exiting from then on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Initial frame prepared, never dispatched
    NotStarted,
    /// Has run at least once, context valid while suspended
    Executing,
    /// Owner asked for termination, not yet observed
    Terminating,
    /// Running its exit path
    Exiting,
}

impl ThreadState {
    pub fn is_terminating(self) -> bool {
        matches!(self, ThreadState::Terminating | ThreadState::Exiting)
    }
}

// ============================================================================
// Launch
// ============================================================================

/// Function and argument the architecture trampoline starts a thread with
#[derive(Clone, Copy)]
pub struct Launch {
    pub entry: EntryFn,
    pub arg: usize,
}

impl fmt::Debug for Launch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Launch")
            .field("entry", &(self.entry as usize))
            .field("arg", &self.arg)
            .finish()
    }
}

/// Kernel-mode thread body
pub type KernelEntry = Box<dyn FnOnce() + Send + 'static>;

/// User-mode register state a thread enters userspace with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserFrame {
    pub ip: usize,
    pub sp: usize,
    /// Value of the syscall return register, 0 in a forked child
    pub return_value: usize,
    pub argc: usize,
    pub argv: usize,
    pub envp: usize,
}

pub(crate) enum ThreadBody {
    Kernel(Option<KernelEntry>),
    User(UserFrame),
    Idle,
}

/// What a thread does when the trampoline hands it control
pub enum LaunchAction {
    Kernel(KernelEntry),
    User(UserFrame),
    Exit,
}

// ============================================================================
// Stack
// ============================================================================

/// Kernel stack owned by one thread
pub struct Stack {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the stack is plain memory exclusively owned by its thread
unsafe impl Send for Stack {}

impl Stack {
    pub fn new(size: usize) -> KernResult<Stack> {
        if size < MIN_STACK_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let layout =
            Layout::from_size_align(size, STACK_ALIGN).map_err(|_| KernelError::InvalidArgument)?;
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr)
            .map(|base| Stack { base, layout })
            .ok_or(KernelError::OutOfMemory)
    }

    pub fn bottom(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn top(&self) -> usize {
        self.bottom() + self.layout.size()
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Whether `sp` is a stack pointer value inside this stack
    pub fn contains(&self, sp: usize) -> bool {
        sp > self.bottom() && sp <= self.top()
    }

    fn top_ptr(&self) -> *mut u8 {
        // SAFETY: one past the end of the allocation
        unsafe { self.base.as_ptr().add(self.layout.size()) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: allocated in Stack::new with the same layout
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stack({:#x}..{:#x})", self.bottom(), self.top())
    }
}

// ============================================================================
// Thread
// ============================================================================

/// A schedulable thread
pub struct Thread {
    id: ThreadId,
    pid: Pid,
    process: Weak<Process>,
    state: ThreadState,
    stack: Stack,
    /// Written through raw pointers by the context switch
    context: UnsafeCell<Context>,
    launch: Launch,
    body: ThreadBody,
    signals: SignalSet,
}

impl Thread {
    fn new(
        process: Weak<Process>,
        pid: Pid,
        stack_size: usize,
        launch: Launch,
        body: ThreadBody,
    ) -> KernResult<Box<Thread>> {
        let stack = Stack::new(stack_size)?;
        let mut thread = Box::new(Thread {
            id: ThreadId::new(),
            pid,
            process,
            state: ThreadState::NotStarted,
            stack,
            context: UnsafeCell::new(Context::default()),
            launch,
            body,
            signals: SignalSet::empty(),
        });
        thread.write_initial_frame();
        Ok(thread)
    }

    /// Kernel thread of `process` that runs `entry` on first dispatch
    pub fn create_kernel<F>(
        entry: F,
        process: &Arc<Process>,
        stack_size: usize,
        launch: Launch,
    ) -> KernResult<Box<Thread>>
    where
        F: FnOnce() + Send + 'static,
    {
        Thread::new(
            Arc::downgrade(process),
            process.pid(),
            stack_size,
            launch,
            ThreadBody::Kernel(Some(Box::new(entry))),
        )
    }

    /// Thread of `process` that enters userspace with `frame`
    pub fn create_userspace(
        process: &Arc<Process>,
        frame: UserFrame,
        stack_size: usize,
        launch: Launch,
    ) -> KernResult<Box<Thread>> {
        Thread::new(
            Arc::downgrade(process),
            process.pid(),
            stack_size,
            launch,
            ThreadBody::User(frame),
        )
    }

    /// Idle thread, owned by no process
    ///
    /// Its frame is written by [`Thread::prepare_launch`] once the scheduler
    /// has a stable address.
    pub(crate) fn create_idle(stack_size: usize) -> KernResult<Box<Thread>> {
        extern "C" fn unset(_: usize) -> ! {
            panic!("idle thread dispatched before launch was prepared");
        }
        Thread::new(
            Weak::new(),
            Pid::KERNEL,
            stack_size,
            Launch {
                entry: unset,
                arg: 0,
            },
            ThreadBody::Idle,
        )
    }

    /// Fork-style copy: a new user thread bound to `process` that resumes at
    /// (`sp`, `ip`) in userspace and sees 0 as the syscall result
    pub fn clone(&self, process: &Arc<Process>, sp: usize, ip: usize) -> KernResult<Box<Thread>> {
        let mut frame = match &self.body {
            ThreadBody::User(frame) => *frame,
            _ => UserFrame::default(),
        };
        frame.sp = sp;
        frame.ip = ip;
        frame.return_value = 0;
        Thread::create_userspace(process, frame, self.stack.size(), self.launch)
    }

    fn write_initial_frame(&mut self) {
        // SAFETY: the stack is owned by this thread and not in use
        let ctx = unsafe { arch::initial_context(self.stack.top_ptr(), self.launch.entry, self.launch.arg) };
        *self.context.get_mut() = ctx;
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Owning process, `None` once it has been dropped or for the idle thread
    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn is_userspace(&self) -> bool {
        matches!(self.body, ThreadBody::User(_))
    }

    pub fn user_frame(&self) -> Option<UserFrame> {
        match &self.body {
            ThreadBody::User(frame) => Some(*frame),
            _ => None,
        }
    }

    /// Saved context, meaningful only while the thread is suspended
    pub fn saved_context(&self) -> Context {
        // SAFETY: only the scheduler writes it, with interrupts disabled
        unsafe { *self.context.get() }
    }

    pub(crate) fn set_saved_context(&mut self, ctx: Context) {
        *self.context.get_mut() = ctx;
    }

    pub(crate) fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    pub(crate) fn set_started(&mut self) {
        debug_assert_eq!(self.state, ThreadState::NotStarted);
        self.state = ThreadState::Executing;
    }

    /// Request termination; returns false if already on its way out
    pub(crate) fn set_terminating(&mut self) -> bool {
        match self.state {
            ThreadState::NotStarted | ThreadState::Executing => {
                self.state = ThreadState::Terminating;
                true
            }
            ThreadState::Terminating | ThreadState::Exiting => false,
        }
    }

    pub(crate) fn set_exiting(&mut self) {
        self.state = ThreadState::Exiting;
    }

    /// Point the thread at its exit path on a fresh frame
    ///
    /// Whatever was on its stack is abandoned. Must not be called on the
    /// thread that is currently executing.
    pub(crate) fn prepare_exit(&mut self) {
        debug_assert_eq!(self.state, ThreadState::Terminating);
        self.write_initial_frame();
        self.state = ThreadState::Exiting;
    }

    /// Rewrite the initial frame to start at `launch`
    ///
    /// Used for the idle thread, whose stack is abandoned each time the
    /// scheduler stops.
    pub(crate) fn prepare_launch(&mut self, launch: Launch) {
        self.launch = launch;
        self.state = ThreadState::NotStarted;
        self.write_initial_frame();
    }

    pub(crate) fn take_launch_action(&mut self) -> LaunchAction {
        if self.state == ThreadState::Exiting {
            return LaunchAction::Exit;
        }
        match &mut self.body {
            ThreadBody::Kernel(entry) => entry.take().map_or(LaunchAction::Exit, LaunchAction::Kernel),
            ThreadBody::User(frame) => LaunchAction::User(*frame),
            ThreadBody::Idle => panic!("idle thread launched through the thread trampoline"),
        }
    }

    /// Replace the user frame after a successful exec
    pub(crate) fn setup_exec(&mut self, frame: UserFrame) {
        self.body = ThreadBody::User(frame);
    }

    pub fn add_signal(&mut self, signal: Signal) {
        self.signals.add(signal);
    }

    pub fn take_signal(&mut self) -> Option<Signal> {
        self.signals.take_lowest()
    }

    pub fn has_pending_signals(&self) -> bool {
        !self.signals.is_empty()
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("stack", &self.stack)
            .finish()
    }
}
