//! Preemptive round-robin scheduler
//!
//! The scheduler owns every live thread and the three queues they move
//! between (see [`RunQueues`]). The timer interrupt and explicit suspension
//! calls are the only points where the CPU changes hands.
//!
//! Switching follows a fixed protocol:
//!
//! 1. interrupts are disabled and the state lock is taken,
//! 2. the queues are updated and the next thread is selected,
//! 3. the lock is released, interrupts stay disabled,
//! 4. the raw context switch runs; nothing allocates, locks or logs between
//!    saving the outgoing context and loading the incoming one,
//! 5. whichever thread resumes calls [`Scheduler::finish_switch`], which frees
//!    anything the previous thread left behind.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use crate::arch::{self, Context};
use crate::config::KernelConfig;
use crate::error::KernResult;
use crate::kern::runq::{BlockEntry, QueueKind, RunQueues, SleepEntry};
use crate::kern::sched_prim::Semaphore;
use crate::kern::thread::{Launch, LaunchAction, Thread, ThreadState};
use crate::platform::{InterruptGuard, Platform};
use crate::types::{Pid, ThreadId};
use crate::vm::AddressSpace;

// ============================================================================
// Thread Arena
// ============================================================================

/// Owner of every live thread control block, sorted by thread id
///
/// Threads are boxed so their saved contexts keep a stable address while the
/// vector reorganises.
#[derive(Default)]
struct ThreadArena {
    threads: Vec<Box<Thread>>,
}

impl ThreadArena {
    fn position(&self, id: ThreadId) -> Result<usize, usize> {
        self.threads.binary_search_by_key(&id, |thread| thread.id())
    }

    fn reserve(&mut self) -> KernResult<()> {
        self.threads.try_reserve(1)?;
        Ok(())
    }

    /// Insert into reserved storage
    fn insert(&mut self, thread: Box<Thread>) {
        match self.position(thread.id()) {
            Ok(_) => panic!("{} admitted twice", thread.id()),
            Err(index) => self.threads.insert(index, thread),
        }
    }

    fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.position(id).ok().map(|index| &*self.threads[index])
    }

    fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.position(id).ok().map(move |index| &mut *self.threads[index])
    }

    fn remove(&mut self, id: ThreadId) -> Option<Box<Thread>> {
        self.position(id).ok().map(|index| self.threads.remove(index))
    }

    fn len(&self) -> usize {
        self.threads.len()
    }
}

// ============================================================================
// Scheduler State
// ============================================================================

/// Whose context the CPU is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Executing {
    /// The caller of [`Scheduler::run`], before the first and after the last
    /// dispatch
    Boot,
    Idle,
    Thread(ThreadId),
}

struct SchedState {
    threads: ThreadArena,
    queues: RunQueues,
    /// Never queued, dispatched whenever Active is empty
    idle: Box<Thread>,
    executing: Executing,
    /// Done thread waiting for the next thread to free it
    zombie: Option<Box<Thread>>,
    /// Address space of a finished process, freed like `zombie`
    zombie_space: Option<AddressSpace>,
    running: bool,
}

impl SchedState {
    fn current_thread(&self) -> Option<&Thread> {
        match self.executing {
            Executing::Thread(id) => self.threads.get(id),
            _ => None,
        }
    }

    fn current_thread_mut(&mut self) -> Option<&mut Thread> {
        match self.executing {
            Executing::Thread(id) => self.threads.get_mut(id),
            _ => None,
        }
    }

    fn current_id(&self) -> ThreadId {
        match self.executing {
            Executing::Thread(id) => id,
            other => panic!("no thread is executing ({:?})", other),
        }
    }
}

/// Saved context of the code that called [`Scheduler::run`]
struct BootContext(UnsafeCell<Context>);

// SAFETY: only touched by the context switch with interrupts disabled
unsafe impl Sync for BootContext {}

/// What the selection step decided
enum Dispatch {
    /// Selected thread is already executing
    Stay,
    /// Save into `from` and load `to`
    Switch { from: *mut Context, to: *const Context },
    /// Load `to`, the current stack is abandoned
    Jump { to: *const Context },
}

// ============================================================================
// Scheduler
// ============================================================================

/// The single-CPU scheduler
pub struct Scheduler {
    platform: &'static dyn Platform,
    config: KernelConfig,
    state: Mutex<SchedState>,
    boot: BootContext,
    /// Millisecond of the last timer-driven reschedule
    last_reschedule: AtomicU64,
}

impl Scheduler {
    /// Create an empty scheduler and its idle thread
    pub fn new(platform: &'static dyn Platform, config: KernelConfig) -> KernResult<Scheduler> {
        let idle = Thread::create_idle(config.kernel_stack_size)?;
        Ok(Scheduler {
            platform,
            config,
            state: Mutex::new(SchedState {
                threads: ThreadArena::default(),
                queues: RunQueues::new(),
                idle,
                executing: Executing::Boot,
                zombie: None,
                zombie_space: None,
                running: false,
            }),
            boot: BootContext(UnsafeCell::new(Context::default())),
            last_reschedule: AtomicU64::new(0),
        })
    }

    pub fn platform(&self) -> &'static dyn Platform {
        self.platform
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Admit a fully built thread at the back of Active
    ///
    /// Safe with interrupts disabled. On failure the thread is dropped and
    /// nothing was queued.
    pub fn add_thread(&self, thread: Box<Thread>) -> KernResult<ThreadId> {
        let id = thread.id();
        let _guard = InterruptGuard::new(self.platform);
        let mut state = self.state.lock();
        state.threads.reserve()?;
        state.queues.admit(id)?;
        state.threads.insert(thread);
        Ok(id)
    }

    // ========================================================================
    // Run loop
    // ========================================================================

    /// Dispatch threads until none remain, then return
    ///
    /// The calling context is parked while threads run and resumes once the
    /// idle thread finds the arena empty.
    pub fn run(&self) {
        let _guard = InterruptGuard::new(self.platform);
        let mut state = self.state.lock();
        assert!(!state.running, "scheduler is already running");
        if state.threads.len() == 0 {
            return;
        }
        state.running = true;
        state.executing = Executing::Boot;
        let launch = Launch {
            entry: idle_entry,
            arg: self as *const Scheduler as usize,
        };
        state.idle.prepare_launch(launch);
        state.queues.advance();
        self.dispatch(state);
        // Back on the boot context: every thread is gone
    }

    /// Boot entry that never returns
    ///
    /// When the last thread exits the CPU parks in the idle loop.
    pub fn start(&self) -> ! {
        self.run();
        loop {
            self.platform.enable_interrupts();
            self.platform.wait_for_interrupt();
        }
    }

    /// Timer interrupt entry point
    ///
    /// Must run with interrupts disabled while the timer line is in service.
    /// Repeated calls within one millisecond do nothing after the first.
    pub fn reschedule(&self) {
        assert!(
            !self.platform.interrupts_enabled(),
            "reschedule with interrupts enabled"
        );
        let irq = self.config.timer_irq;
        assert!(
            self.platform.is_in_service(irq),
            "reschedule outside the timer interrupt"
        );
        self.platform.eoi(irq);

        let now = self.platform.ms_since_boot();
        if now <= self.last_reschedule.load(Ordering::Relaxed) {
            return;
        }
        self.last_reschedule.store(now, Ordering::Relaxed);

        let mut state = self.state.lock();
        if !state.running {
            return;
        }
        state.queues.wake_due(now);
        state.queues.advance();
        self.dispatch(state);
    }

    /// Give up the CPU to the next Active thread without a timer tick
    pub fn yield_now(&self) {
        let _guard = InterruptGuard::new(self.platform);
        let mut state = self.state.lock();
        if !state.running {
            return;
        }
        state.queues.wake_due(self.platform.ms_since_boot());
        state.queues.advance();
        self.dispatch(state);
    }

    /// Preempt the idle thread if something became runnable
    pub fn reschedule_if_idling(&self) {
        assert!(
            !self.platform.interrupts_enabled(),
            "reschedule_if_idling with interrupts enabled"
        );
        let mut state = self.state.lock();
        if state.executing != Executing::Idle || state.queues.active().is_empty() {
            return;
        }
        state.queues.advance();
        self.dispatch(state);
    }

    // ========================================================================
    // Suspension
    // ========================================================================

    /// Suspend the current thread until `wake_time` (milliseconds since boot)
    pub fn set_current_thread_sleeping(&self, wake_time: u64) {
        assert!(
            self.platform.interrupts_enabled(),
            "sleeping with interrupts disabled"
        );
        self.platform.disable_interrupts();

        let mut state = self.state.lock();
        let id = state.current_id();
        let slept = state.queues.sleep_current(wake_time);
        assert_eq!(slept, Some(id), "current thread not in Active");
        self.dispatch(state);

        self.platform.enable_interrupts();
    }

    /// Suspend the current thread until `semaphore` is unblocked
    pub fn block_current_thread(&self, semaphore: &Semaphore) {
        assert!(
            self.platform.interrupts_enabled(),
            "blocking with interrupts disabled"
        );
        self.platform.disable_interrupts();

        let mut state = self.state.lock();
        let id = state.current_id();
        let blocked = state.queues.block_current(semaphore.id());
        assert_eq!(blocked, Some(id), "current thread not in Active");
        semaphore.set_blocked(true);
        self.dispatch(state);

        self.platform.enable_interrupts();
    }

    /// Move every thread blocked on `semaphore` back to Active
    ///
    /// Callable from any context, including interrupt handlers.
    pub fn unblock_threads(&self, semaphore: &Semaphore) -> usize {
        let _guard = InterruptGuard::new(self.platform);
        let mut state = self.state.lock();
        let moved = state.queues.unblock(semaphore.id());
        semaphore.set_blocked(false);
        moved
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Mark thread `id` Terminating
    ///
    /// A Sleeping or Blocked thread is moved back to Active so it reaches its
    /// exit path at its next dispatch. Returns false if the thread is unknown
    /// or already on its way out.
    pub fn terminate_thread(&self, id: ThreadId) -> bool {
        let _guard = InterruptGuard::new(self.platform);
        let mut state = self.state.lock();
        let Some(thread) = state.threads.get_mut(id) else {
            return false;
        };
        if !thread.set_terminating() {
            return false;
        }
        if matches!(
            state.queues.find(id),
            Some(QueueKind::Sleeping | QueueKind::Blocked)
        ) {
            state.queues.make_active(id);
        }
        true
    }

    /// Mark the current thread as running its exit path
    pub fn begin_exit_current(&self) {
        let _guard = InterruptGuard::new(self.platform);
        let mut state = self.state.lock();
        if let Some(thread) = state.current_thread_mut() {
            thread.set_exiting();
        }
    }

    /// Remove and free the current thread, then dispatch the next one
    pub fn set_current_thread_done(&self) -> ! {
        assert!(
            self.platform.interrupts_enabled(),
            "thread done with interrupts disabled"
        );
        self.platform.disable_interrupts();
        let state = self.state.lock();
        self.retire_current(state)
    }

    /// Tear down the current thread's whole process
    ///
    /// Every other thread of the same process is purged from the queues and
    /// freed. `space` is released only after the CPU has left this thread.
    pub fn set_current_process_done(&self, space: Option<AddressSpace>) -> ! {
        assert!(
            self.platform.interrupts_enabled(),
            "process done with interrupts disabled"
        );
        self.platform.disable_interrupts();

        let doomed = {
            let mut state = self.state.lock();
            let current = state.current_id();
            let pid = state
                .threads
                .get(current)
                .map(Thread::pid)
                .unwrap_or(Pid::KERNEL);

            let SchedState { threads, queues, .. } = &mut *state;
            queues.purge(|id| id != current && threads.get(id).is_some_and(|t| t.pid() == pid));

            let mut doomed = Vec::new();
            let mut index = 0;
            while index < threads.threads.len() {
                let thread = &threads.threads[index];
                if thread.id() != current && thread.pid() == pid {
                    doomed.push(threads.threads.remove(index));
                } else {
                    index += 1;
                }
            }
            doomed
        };
        // Purged threads never run again, their stacks are not in use
        drop(doomed);

        let mut state = self.state.lock();
        debug_assert!(state.zombie_space.is_none());
        state.zombie_space = space;
        self.retire_current(state)
    }

    fn retire_current(&self, mut state: MutexGuard<'_, SchedState>) -> ! {
        let id = state.current_id();
        let removed = state.queues.remove_current();
        assert_eq!(removed, Some(id), "current thread not in Active");
        state.queues.forget();

        let thread = state.threads.remove(id);
        assert!(state.zombie.is_none(), "previous zombie not reaped");
        state.zombie = thread;

        match self.select(&mut state) {
            Dispatch::Switch { to, .. } | Dispatch::Jump { to } => {
                drop(state);
                // SAFETY: interrupts are disabled and `to` belongs to a
                // suspended thread that stays alive until it runs
                unsafe { arch::jump_to(to) }
            }
            Dispatch::Stay => unreachable!("retired thread selected again"),
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Choose the thread at the queue cursor (idle if none) and prepare it
    fn select(&self, state: &mut SchedState) -> Dispatch {
        let target = match state.queues.current() {
            Some(id) => Executing::Thread(id),
            None => Executing::Idle,
        };
        let previous = state.executing;

        let mut jump = false;
        if let Executing::Thread(id) = target {
            let thread = state
                .threads
                .get_mut(id)
                .unwrap_or_else(|| panic!("{} queued but not in the arena", id));
            match thread.state() {
                ThreadState::NotStarted => thread.set_started(),
                ThreadState::Terminating => {
                    // Its exit path starts on a fresh frame of its own stack
                    thread.prepare_exit();
                    jump = target == previous;
                }
                ThreadState::Executing | ThreadState::Exiting => {}
            }
        } else if state.idle.state() == ThreadState::NotStarted {
            state.idle.set_started();
        }

        if target == previous && !jump {
            return Dispatch::Stay;
        }

        let to = self.context_of(state, target) as *const Context;
        state.executing = target;
        if jump {
            return Dispatch::Jump { to };
        }
        let from = match previous {
            Executing::Thread(id) if state.threads.get(id).is_none() => {
                // Retired thread, its context is never needed again
                return Dispatch::Jump { to };
            }
            other => self.context_of(state, other),
        };
        Dispatch::Switch { from, to }
    }

    fn context_of(&self, state: &SchedState, who: Executing) -> *mut Context {
        match who {
            Executing::Boot => self.boot.0.get(),
            Executing::Idle => state.idle.context_ptr(),
            Executing::Thread(id) => state
                .threads
                .get(id)
                .map(Thread::context_ptr)
                .unwrap_or_else(|| panic!("{} has no context", id)),
        }
    }

    /// Select and switch; returns once the current context is dispatched
    /// again
    fn dispatch(&self, mut state: MutexGuard<'_, SchedState>) {
        match self.select(&mut state) {
            Dispatch::Stay => {}
            Dispatch::Switch { from, to } => {
                drop(state);
                // SAFETY: interrupts are disabled, both contexts belong to
                // threads that stay alive across the switch
                unsafe { arch::switch_context(from, to) };
                self.finish_switch();
            }
            Dispatch::Jump { to } => {
                drop(state);
                // SAFETY: as above; the current stack is abandoned
                unsafe { arch::jump_to(to) }
            }
        }
    }

    /// Second half of every switch, run by the incoming context
    ///
    /// Checks the stack pointer is inside the incoming thread's stack and
    /// frees whatever the outgoing thread left behind. Runs with interrupts
    /// disabled, so it must not log: the console lock may belong to the
    /// thread that was just preempted.
    pub(crate) fn finish_switch(&self) {
        let (zombie, space) = {
            let mut state = self.state.lock();
            let sp = arch::stack_pointer();
            let stack = match state.executing {
                Executing::Thread(id) => state.threads.get(id).map(Thread::stack),
                Executing::Idle => Some(state.idle.stack()),
                Executing::Boot => None,
            };
            if let Some(stack) = stack {
                assert!(stack.contains(sp), "resumed outside its stack: sp {:#x}, {:?}", sp, stack);
            }
            (state.zombie.take(), state.zombie_space.take())
        };
        drop(zombie);
        drop(space);
    }

    // ========================================================================
    // Idle
    // ========================================================================

    fn idle_loop(&self) -> ! {
        loop {
            self.platform.disable_interrupts();
            let mut state = self.state.lock();
            if state.threads.len() == 0 {
                state.running = false;
                state.executing = Executing::Boot;
                let to = self.boot.0.get() as *const Context;
                drop(state);
                // SAFETY: the boot context was saved by `run`, interrupts
                // are disabled
                unsafe { arch::jump_to(to) }
            }
            drop(state);
            self.platform.enable_interrupts();
            self.platform.wait_for_interrupt();
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Running thread, `None` while idling or before [`Scheduler::run`]
    pub fn current_thread_id(&self) -> Option<ThreadId> {
        let _guard = InterruptGuard::new(self.platform);
        match self.state.lock().executing {
            Executing::Thread(id) => Some(id),
            _ => None,
        }
    }

    pub fn current_pid(&self) -> Option<Pid> {
        let _guard = InterruptGuard::new(self.platform);
        self.state.lock().current_thread().map(Thread::pid)
    }

    pub fn is_idle(&self) -> bool {
        let _guard = InterruptGuard::new(self.platform);
        self.state.lock().executing == Executing::Idle
    }

    /// Run `f` on the current thread's control block
    pub fn with_current_thread<R>(&self, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
        let _guard = InterruptGuard::new(self.platform);
        let mut state = self.state.lock();
        state.current_thread_mut().map(f)
    }

    pub fn with_thread<R>(&self, id: ThreadId, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
        let _guard = InterruptGuard::new(self.platform);
        let mut state = self.state.lock();
        state.threads.get_mut(id).map(f)
    }

    /// Consume what the current thread should do on first dispatch
    pub(crate) fn launch_action(&self) -> LaunchAction {
        let _guard = InterruptGuard::new(self.platform);
        let mut state = self.state.lock();
        match state.current_thread_mut() {
            Some(thread) => thread.take_launch_action(),
            None => panic!("thread trampoline entered without a current thread"),
        }
    }

    pub fn thread_state(&self, id: ThreadId) -> Option<ThreadState> {
        let _guard = InterruptGuard::new(self.platform);
        self.state.lock().threads.get(id).map(Thread::state)
    }

    pub fn thread_exists(&self, id: ThreadId) -> bool {
        let _guard = InterruptGuard::new(self.platform);
        self.state.lock().threads.get(id).is_some()
    }

    pub fn queue_of(&self, id: ThreadId) -> Option<QueueKind> {
        let _guard = InterruptGuard::new(self.platform);
        self.state.lock().queues.find(id)
    }

    /// Number of live threads, the idle thread excluded
    pub fn thread_count(&self) -> usize {
        let _guard = InterruptGuard::new(self.platform);
        self.state.lock().threads.len()
    }

    pub fn active_len(&self) -> usize {
        let _guard = InterruptGuard::new(self.platform);
        self.state.lock().queues.active().len()
    }

    pub fn active_threads(&self) -> Vec<ThreadId> {
        let _guard = InterruptGuard::new(self.platform);
        self.state.lock().queues.active().to_vec()
    }

    pub fn sleeping_threads(&self) -> Vec<SleepEntry> {
        let _guard = InterruptGuard::new(self.platform);
        self.state.lock().queues.sleeping().to_vec()
    }

    pub fn blocked_threads(&self) -> Vec<BlockEntry> {
        let _guard = InterruptGuard::new(self.platform);
        self.state.lock().queues.blocked().to_vec()
    }
}

/// First code the idle thread runs; `arg` is the scheduler
extern "C" fn idle_entry(arg: usize) -> ! {
    // SAFETY: `run` passes the address of the scheduler, which outlives it
    let scheduler = unsafe { &*(arg as *const Scheduler) };
    scheduler.finish_switch();
    scheduler.idle_loop()
}
