//! Kernel configuration
//!
//! Tunables the embedding kernel hands to [`crate::kern::Kernel::boot`].

/// Page size used for user regions
pub const PAGE_SIZE: usize = 4096;

/// Upper bound (exclusive) for user and group ids
pub const MAX_ID: i64 = 1_000_000_000;

/// Default kernel stack size (in bytes)
pub const KERNEL_STACK_SIZE: usize = 64 * 1024;

/// Default user stack size (in bytes)
pub const USER_STACK_SIZE: usize = 64 * 1024;

/// Highest address of the initial user stack
pub const USER_STACK_TOP: usize = 0x0000_7fff_ffff_0000;

/// Default descriptor table size
pub const MAX_OPEN_FILES: usize = 64;

/// Runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Size of every thread's kernel stack
    pub kernel_stack_size: usize,
    /// Size of the user stack region mapped for new user processes
    pub user_stack_size: usize,
    /// Top of the user stack region
    pub user_stack_top: usize,
    /// Interrupt line of the scheduling timer
    pub timer_irq: u8,
    /// Descriptor slots per process
    pub max_open_files: usize,
    /// Level the console logger is installed with
    pub log_level: log::LevelFilter,
}

impl KernelConfig {
    /// Configuration with the default values
    pub const fn new() -> Self {
        Self {
            kernel_stack_size: KERNEL_STACK_SIZE,
            user_stack_size: USER_STACK_SIZE,
            user_stack_top: USER_STACK_TOP,
            timer_irq: 0,
            max_open_files: MAX_OPEN_FILES,
            log_level: log::LevelFilter::Info,
        }
    }

    pub const fn with_kernel_stack_size(mut self, size: usize) -> Self {
        self.kernel_stack_size = size;
        self
    }

    pub const fn with_user_stack_size(mut self, size: usize) -> Self {
        self.user_stack_size = size;
        self
    }

    pub const fn with_timer_irq(mut self, irq: u8) -> Self {
        self.timer_irq = irq;
        self
    }

    pub const fn with_max_open_files(mut self, count: usize) -> Self {
        self.max_open_files = count;
        self
    }

    pub const fn with_log_level(mut self, level: log::LevelFilter) -> Self {
        self.log_level = level;
        self
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
