//! Signals
//!
//! Numbers follow the Linux/x86 layout. There is no job control, so the stop
//! and continue signals are delivered but their default action is to be
//! discarded.

use core::fmt;

use crate::error::{KernResult, KernelError};

// ============================================================================
// Signal Numbers
// ============================================================================

/// A valid signal number (1..=31)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(u8);

impl Signal {
    pub const HUP: Signal = Signal(1);
    pub const INT: Signal = Signal(2);
    pub const QUIT: Signal = Signal(3);
    pub const ILL: Signal = Signal(4);
    pub const TRAP: Signal = Signal(5);
    pub const ABRT: Signal = Signal(6);
    pub const BUS: Signal = Signal(7);
    pub const FPE: Signal = Signal(8);
    pub const KILL: Signal = Signal(9);
    pub const USR1: Signal = Signal(10);
    pub const SEGV: Signal = Signal(11);
    pub const USR2: Signal = Signal(12);
    pub const PIPE: Signal = Signal(13);
    pub const ALRM: Signal = Signal(14);
    pub const TERM: Signal = Signal(15);
    pub const CHLD: Signal = Signal(17);
    pub const CONT: Signal = Signal(18);
    pub const STOP: Signal = Signal(19);
    pub const TSTP: Signal = Signal(20);
    pub const URG: Signal = Signal(23);
    pub const WINCH: Signal = Signal(28);

    /// Highest signal number
    pub const MAX: u8 = 31;

    /// Validate a raw signal number
    pub fn new(number: i32) -> KernResult<Signal> {
        if (1..=Self::MAX as i32).contains(&number) {
            Ok(Signal(number as u8))
        } else {
            Err(KernelError::InvalidArgument)
        }
    }

    pub const fn number(self) -> u8 {
        self.0
    }

    /// Whether a handler may be installed for this signal
    pub const fn is_catchable(self) -> bool {
        self.0 != Self::KILL.0 && self.0 != Self::STOP.0
    }

    /// What happens when the signal arrives with the default handler
    pub fn default_action(self) -> DefaultAction {
        match self {
            Signal::CHLD | Signal::CONT | Signal::STOP | Signal::TSTP | Signal::URG
            | Signal::WINCH => DefaultAction::Ignore,
            _ => DefaultAction::Terminate,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "signal {}", self.0)
    }
}

/// Default disposition of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    Ignore,
}

// ============================================================================
// Pending Sets
// ============================================================================

/// Set of pending signals, bit n is signal n
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalSet(u32);

impl SignalSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn add(&mut self, signal: Signal) {
        self.0 |= 1 << signal.0;
    }

    pub fn remove(&mut self, signal: Signal) {
        self.0 &= !(1 << signal.0);
    }

    pub const fn contains(&self, signal: Signal) -> bool {
        self.0 & (1 << signal.0) != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Remove and return the lowest numbered pending signal
    pub fn take_lowest(&mut self) -> Option<Signal> {
        if self.0 == 0 {
            return None;
        }
        let signal = Signal(self.0.trailing_zeros() as u8);
        self.remove(signal);
        Some(signal)
    }
}

// ============================================================================
// Handler Table
// ============================================================================

/// Disposition installed for one signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalHandler {
    #[default]
    Default,
    Ignore,
    /// User-space handler entry address
    Handler(usize),
}

/// Per-process signal dispositions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalHandlers {
    table: [SignalHandler; Signal::MAX as usize + 1],
}

impl SignalHandlers {
    pub const fn new() -> Self {
        Self {
            table: [SignalHandler::Default; Signal::MAX as usize + 1],
        }
    }

    pub fn get(&self, signal: Signal) -> SignalHandler {
        self.table[signal.0 as usize]
    }

    /// Install `handler`, returning the previous disposition
    pub fn set(&mut self, signal: Signal, handler: SignalHandler) -> KernResult<SignalHandler> {
        if !signal.is_catchable() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(core::mem::replace(&mut self.table[signal.0 as usize], handler))
    }

    /// Exec semantics: every disposition goes back to default
    pub fn reset(&mut self) {
        self.table = [SignalHandler::Default; Signal::MAX as usize + 1];
    }

    /// Whether arrival of `signal` would be discarded
    pub fn is_ignored(&self, signal: Signal) -> bool {
        match self.get(signal) {
            SignalHandler::Ignore => true,
            SignalHandler::Default => signal.default_action() == DefaultAction::Ignore,
            SignalHandler::Handler(_) => false,
        }
    }
}

impl Default for SignalHandlers {
    fn default() -> Self {
        Self::new()
    }
}

/// What the return-to-user path has to do for a pending signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalDelivery {
    pub signal: Signal,
    pub handler: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_range() {
        assert_eq!(Signal::new(0), Err(KernelError::InvalidArgument));
        assert_eq!(Signal::new(32), Err(KernelError::InvalidArgument));
        assert_eq!(Signal::new(-3), Err(KernelError::InvalidArgument));
        assert_eq!(Signal::new(9), Ok(Signal::KILL));
    }

    #[test]
    fn test_default_actions() {
        assert_eq!(Signal::SEGV.default_action(), DefaultAction::Terminate);
        assert_eq!(Signal::TERM.default_action(), DefaultAction::Terminate);
        assert_eq!(Signal::CHLD.default_action(), DefaultAction::Ignore);
    }

    #[test]
    fn test_set_takes_lowest_first() {
        let mut set = SignalSet::empty();
        set.add(Signal::TERM);
        set.add(Signal::INT);
        assert!(set.contains(Signal::TERM));
        assert_eq!(set.take_lowest(), Some(Signal::INT));
        assert_eq!(set.take_lowest(), Some(Signal::TERM));
        assert_eq!(set.take_lowest(), None);
        assert!(set.is_empty());
    }

    #[test]
    fn test_handlers_kill_not_catchable() {
        let mut handlers = SignalHandlers::new();
        assert_eq!(
            handlers.set(Signal::KILL, SignalHandler::Ignore),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            handlers.set(Signal::USR1, SignalHandler::Handler(0x4000)),
            Ok(SignalHandler::Default)
        );
        assert_eq!(handlers.get(Signal::USR1), SignalHandler::Handler(0x4000));
        handlers.reset();
        assert_eq!(handlers.get(Signal::USR1), SignalHandler::Default);
    }

    #[test]
    fn test_is_ignored() {
        let mut handlers = SignalHandlers::new();
        assert!(handlers.is_ignored(Signal::CHLD));
        assert!(!handlers.is_ignored(Signal::TERM));
        handlers.set(Signal::TERM, SignalHandler::Ignore).unwrap();
        assert!(handlers.is_ignored(Signal::TERM));
    }
}
