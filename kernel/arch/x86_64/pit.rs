//! 8254 programmable interval timer
//!
//! Used exactly once, as the reference clock for calibrating the LAPIC
//! timer. Channel 0 is programmed with a reload value and sampled via
//! the latch command.

use super::io::{inb, outb};

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// PIT input frequency in Hz
pub const PIT_BASE_FREQUENCY: u64 = 1_193_182;

/// Channel 0, lobyte/hibyte access, mode 2 (rate generator), binary
const PIT_CMD_RATE_GENERATOR: u8 = 0x34;

/// Latch command for channel 0
const PIT_CMD_LATCH: u8 = 0x00;

/// Program channel 0 with a reload value
pub fn set_reload_value(value: u16) {
    outb(PIT_COMMAND, PIT_CMD_RATE_GENERATOR);
    outb(PIT_CHANNEL0, (value & 0xFF) as u8);
    outb(PIT_CHANNEL0, (value >> 8) as u8);
}

/// Latch and read the current channel 0 count
pub fn get_tick() -> u16 {
    outb(PIT_COMMAND, PIT_CMD_LATCH);
    let low = inb(PIT_CHANNEL0) as u16;
    let high = inb(PIT_CHANNEL0) as u16;
    high << 8 | low
}
