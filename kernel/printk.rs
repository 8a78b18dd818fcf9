//! Kernel console output
//!
//! All diagnostics go to the `0xE9` debug port. A process-wide IRQ-safe
//! output lock serializes writes so messages from different cores do not
//! interleave mid-line.

use ::core::fmt::{self, Write};

use crate::arch::IrqSpinlock;
use crate::arch::x86_64::io::outb;

/// Debug console port
const DEBUGCON_PORT: u16 = 0xE9;

/// Output lock - serializes all serial writes
static OUTPUT_LOCK: IrqSpinlock<()> = IrqSpinlock::new(());

struct DebugconWriter;

impl Write for DebugconWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            outb(DEBUGCON_PORT, byte);
        }
        Ok(())
    }
}

/// Write formatted output to the debug console (used by the macros)
pub fn print_fmt(args: fmt::Arguments) {
    let _guard = OUTPUT_LOCK.lock();
    let _ = DebugconWriter.write_fmt(args);
}

/// Write raw bytes to the debug console (terminal output path)
pub fn write_bytes(bytes: &[u8]) {
    let _guard = OUTPUT_LOCK.lock();
    for &byte in bytes {
        outb(DEBUGCON_PORT, byte);
    }
}

/// Print to the debug console
#[macro_export]
macro_rules! printk {
    ($($arg:tt)*) => {
        $crate::printk::print_fmt(format_args!($($arg)*))
    };
}

/// Print to the debug console with a trailing newline
#[macro_export]
macro_rules! printkln {
    () => {
        $crate::printk!("\n")
    };
    ($($arg:tt)*) => {
        $crate::printk::print_fmt(format_args!("{}\n", format_args!($($arg)*)))
    };
}
