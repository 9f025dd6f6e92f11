//! Console output for the monokern kernel
//!
//! Provides text output for kernel diagnostics and doubles as the sink behind
//! the `log` facade. On hardware bytes go to a memory-mapped UART; under test
//! they land in an in-memory buffer.

use core::fmt::{self, Write};
use spin::Mutex;

// QEMU virt machine UART base
#[cfg(not(test))]
const UART_BASE: usize = 0x0900_0000;

#[cfg(not(test))]
struct Uart {
    base: usize,
}

#[cfg(not(test))]
impl Uart {
    const fn new(base: usize) -> Self {
        Self { base }
    }

    unsafe fn putc(&self, c: u8) {
        let ptr = self.base as *mut u8;
        ptr.write_volatile(c);
    }
}

/// Console writer interface
pub struct Console {
    #[cfg(test)]
    buffer: heapless::String<1024>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            #[cfg(test)]
            buffer: heapless::String::new(),
        }
    }

    /// Write a byte to the console
    pub fn write_byte(&mut self, byte: u8) {
        #[cfg(test)]
        {
            // A full buffer drops output rather than failing the caller
            if byte.is_ascii() {
                let _ = self.buffer.push(byte as char);
            }
        }

        #[cfg(not(test))]
        unsafe {
            Uart::new(UART_BASE).putc(byte);
        }
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }

    /// Clear the console
    pub fn clear(&mut self) {
        #[cfg(test)]
        self.buffer.clear();
    }

    #[cfg(test)]
    pub fn contents(&self) -> &str {
        &self.buffer
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Initialize the console subsystem
pub fn init() {
    CONSOLE.lock().clear();
}

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    // Console writes are infallible
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Print macro for kernel use
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

// ============================================================================
// Logger
// ============================================================================

/// `log` sink writing `[LEVEL] target: message` lines to the console
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            print(format_args!(
                "[{:<5}] {}: {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Install the console as the global logger
///
/// Only the first call installs the sink, later calls just adjust the level.
pub fn init_logger(level: log::LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
