//! Test support: a simulated machine and loader
//!
//! [`MockPlatform`] models one CPU. Time only moves when a test calls
//! [`MockPlatform::advance`] or a timer tick fires, and a tick fires only
//! when a test asks for one or when the idle thread waits for an interrupt.
//! That keeps every schedule deterministic while the context switches are
//! real.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, Once};

use crate::config::KernelConfig;
use crate::error::{KernResult, KernelError};
use crate::kern::credentials::Credentials;
use crate::kern::exec::{ExecImage, ImageLoader, Segment};
use crate::kern::fd_table::FdTable;
use crate::kern::process::Process;
use crate::kern::startup::Kernel;
use crate::kern::thread::UserFrame;
use crate::platform::Platform;
use crate::types::Pid;
use crate::vm::VmProt;

/// Kernel stack size used by test kernels
pub const STACK_SIZE: usize = 256 * 1024;

/// Consecutive idle ticks after which a test is considered hung
const IDLE_TICK_LIMIT: u64 = 5_000_000;

type DeviceIrq = Box<dyn Fn() -> bool + Send + Sync>;

/// Stand-in for user code: runs on the thread that "entered userspace" and
/// returns the status it exits with
pub type UserProgram = Arc<dyn Fn(&'static Kernel, &UserFrame) -> i32 + Send + Sync>;

// ============================================================================
// Mock platform
// ============================================================================

pub struct MockPlatform {
    clock: AtomicU64,
    interrupts: AtomicBool,
    in_service: AtomicBool,
    eoi_count: AtomicUsize,
    idle_ticks: AtomicU64,
    device_irq: Mutex<Option<DeviceIrq>>,
    programs: Mutex<Vec<(usize, UserProgram)>>,
    entered: Mutex<Vec<UserFrame>>,
    kernel: Once<&'static Kernel>,
}

impl MockPlatform {
    /// Starts at time 0 with interrupts disabled, like a CPU out of reset
    pub fn new() -> Self {
        Self {
            clock: AtomicU64::new(0),
            interrupts: AtomicBool::new(false),
            in_service: AtomicBool::new(false),
            eoi_count: AtomicUsize::new(0),
            idle_ticks: AtomicU64::new(0),
            device_irq: Mutex::new(None),
            programs: Mutex::new(Vec::new()),
            entered: Mutex::new(Vec::new()),
            kernel: Once::new(),
        }
    }

    fn kernel(&self) -> &'static Kernel {
        match self.kernel.get() {
            Some(kernel) => kernel,
            None => panic!("mock platform used before boot"),
        }
    }

    pub fn eoi_count(&self) -> usize {
        self.eoi_count.load(Ordering::SeqCst)
    }

    /// Move the clock forward without an interrupt
    pub fn advance(&self, ms: u64) {
        self.clock.fetch_add(ms, Ordering::SeqCst);
    }

    /// Deliver a timer tick one millisecond after the current time
    pub fn fire_timer(&self) {
        self.advance(1);
        self.fire_timer_without_advance();
    }

    /// Deliver a timer tick without moving the clock
    pub fn fire_timer_without_advance(&self) {
        let was_enabled = self.interrupts_enabled();
        self.disable_interrupts();
        self.in_service.store(true, Ordering::SeqCst);
        self.kernel().scheduler.reschedule();
        if was_enabled {
            self.enable_interrupts();
        }
    }

    /// Interrupt source polled while the CPU idles, ahead of the timer
    ///
    /// Returning true means the device raised an interrupt; the timer does
    /// not tick for that wait.
    pub fn set_device_irq(&self, irq: impl Fn() -> bool + Send + Sync + 'static) {
        *self.device_irq.lock() = Some(Box::new(irq));
    }

    /// Run `program` whenever a thread enters userspace at `ip`
    pub fn on_user_entry(
        &self,
        ip: usize,
        program: impl Fn(&'static Kernel, &UserFrame) -> i32 + Send + Sync + 'static,
    ) {
        self.programs.lock().push((ip, Arc::new(program)));
    }

    /// Every frame passed to `enter_userspace`, oldest first
    pub fn entered_frames(&self) -> Vec<UserFrame> {
        self.entered.lock().clone()
    }

    fn program_at(&self, ip: usize) -> Option<UserProgram> {
        self.programs
            .lock()
            .iter()
            .find(|(at, _)| *at == ip)
            .map(|(_, program)| program.clone())
    }

    fn poll_device(&self) -> bool {
        match self.device_irq.lock().as_ref() {
            Some(irq) => irq(),
            None => false,
        }
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for MockPlatform {
    fn ms_since_boot(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn eoi(&self, _irq: u8) {
        self.in_service.store(false, Ordering::SeqCst);
        self.eoi_count.fetch_add(1, Ordering::SeqCst);
    }

    fn is_in_service(&self, _irq: u8) -> bool {
        self.in_service.load(Ordering::SeqCst)
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }

    fn disable_interrupts(&self) {
        self.interrupts.store(false, Ordering::SeqCst);
    }

    fn enable_interrupts(&self) {
        self.interrupts.store(true, Ordering::SeqCst);
    }

    fn wait_for_interrupt(&self) {
        let ticks = self.idle_ticks.fetch_add(1, Ordering::SeqCst);
        assert!(ticks < IDLE_TICK_LIMIT, "idle for {} ticks, schedule is stuck", ticks);

        if self.poll_device() {
            self.disable_interrupts();
            self.kernel().scheduler.reschedule_if_idling();
            self.enable_interrupts();
        } else {
            self.fire_timer();
        }
    }

    fn enter_userspace(&self, frame: &UserFrame) -> ! {
        self.entered.lock().push(*frame);
        let kernel = self.kernel();
        let status = match self.program_at(frame.ip) {
            Some(program) => program(kernel, frame),
            None => 0,
        };
        kernel.sys_exit(status)
    }
}

// ============================================================================
// Mock loader
// ============================================================================

/// Loader backed by a table of in-memory images
#[derive(Default)]
pub struct MockLoader {
    images: Mutex<Vec<(String, ExecImage)>>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, path: &str, image: ExecImage) {
        self.images.lock().push((String::from(path), image));
    }
}

impl ImageLoader for MockLoader {
    fn load(&self, _credentials: &Credentials, path: &str) -> KernResult<ExecImage> {
        self.images
            .lock()
            .iter()
            .find(|(at, _)| at == path)
            .map(|(_, image)| image.clone())
            .ok_or(KernelError::NotFound)
    }
}

/// Image with one small text segment around `entry`
pub fn image(entry: usize) -> ExecImage {
    ExecImage {
        entry,
        segments: vec![Segment {
            vaddr: entry & !0xfff,
            mem_size: 0x1000,
            prot: VmProt::READ.union(VmProt::EXECUTE),
            data: vec![0xcc; 16],
        }],
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A booted kernel together with its mock machine
#[derive(Clone, Copy)]
pub struct Harness {
    pub kernel: &'static Kernel,
    pub platform: &'static MockPlatform,
    pub loader: &'static MockLoader,
}

pub fn config() -> KernelConfig {
    KernelConfig::new()
        .with_kernel_stack_size(STACK_SIZE)
        .with_log_level(log::LevelFilter::Warn)
}

/// Boot a fresh kernel on a fresh mock machine
pub fn setup() -> Harness {
    setup_with(config())
}

pub fn setup_with(config: KernelConfig) -> Harness {
    let platform: &'static MockPlatform = Box::leak(Box::new(MockPlatform::new()));
    let loader: &'static MockLoader = Box::leak(Box::new(MockLoader::new()));
    let kernel = Kernel::boot(platform, loader, config).unwrap();
    platform.kernel.call_once(|| kernel);
    Harness {
        kernel,
        platform,
        loader,
    }
}

pub fn boot() -> &'static Kernel {
    setup().kernel
}

pub fn boot_mock() -> (&'static Kernel, &'static MockPlatform) {
    let harness = setup();
    (harness.kernel, harness.platform)
}

/// Unregistered process for tests that never run threads
pub fn dummy_process() -> Arc<Process> {
    static NEXT: AtomicI32 = AtomicI32::new(10_000);
    let pid = Pid(NEXT.fetch_add(1, Ordering::Relaxed));
    Process::new(pid, Pid(0), Pid(0), Pid(0), Credentials::root(), FdTable::new(8).unwrap())
}

// ============================================================================
// Trace log
// ============================================================================

/// Ordered record of events, shared between test threads
#[derive(Clone, Default)]
pub struct TraceLog(Arc<Mutex<Vec<&'static str>>>);

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: &'static str) {
        self.0.lock().push(event);
    }

    /// Drain the log
    pub fn take(&self) -> Vec<&'static str> {
        core::mem::take(&mut *self.0.lock())
    }
}
