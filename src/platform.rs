//! Platform seam
//!
//! The scheduler core never touches interrupt hardware or clocks directly.
//! Everything it needs from the machine goes through [`Platform`], which the
//! embedding kernel implements for its interrupt controller, timer and CPU.

use crate::kern::thread::UserFrame;

/// Services the scheduler consumes from the machine layer
pub trait Platform: Sync {
    /// Monotonic milliseconds since boot
    fn ms_since_boot(&self) -> u64;

    /// Acknowledge interrupt `irq` at the interrupt controller
    fn eoi(&self, irq: u8);

    /// Whether interrupt `irq` is currently being serviced
    fn is_in_service(&self, irq: u8) -> bool;

    /// Whether the CPU currently accepts maskable interrupts
    fn interrupts_enabled(&self) -> bool;

    fn disable_interrupts(&self);

    fn enable_interrupts(&self);

    /// Park the CPU until the next interrupt
    ///
    /// Called by the idle thread with interrupts enabled.
    fn wait_for_interrupt(&self);

    /// Drop to user mode with the given register frame
    fn enter_userspace(&self, frame: &UserFrame) -> !;
}

/// Critical section: interrupts stay disabled while the guard lives
///
/// The previous interrupt state is restored on drop, so guards nest.
pub struct InterruptGuard<'a> {
    platform: &'a dyn Platform,
    was_enabled: bool,
}

impl<'a> InterruptGuard<'a> {
    pub fn new(platform: &'a dyn Platform) -> Self {
        let was_enabled = platform.interrupts_enabled();
        platform.disable_interrupts();
        Self {
            platform,
            was_enabled,
        }
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        if self.was_enabled {
            self.platform.enable_interrupts();
        }
    }
}
