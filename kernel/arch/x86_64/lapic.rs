//! Local APIC and its timer
//!
//! Each core owns a `LocalApic` handle over the shared MMIO window. The
//! timer is calibrated once on the BSP against the PIT; application
//! processors reuse the stored base frequency. The scheduler reprograms
//! the timer every tick for the closest pending deadline.

use ::core::sync::atomic::{AtomicU64, Ordering};

use super::cpu::rdmsr;
use super::pit;
use crate::mm::higher_half;

/// IDT vector the timer fires on
pub const TIMER_VECTOR: u64 = 48;

/// MSR holding the LAPIC physical base
const IA32_APIC_BASE: u32 = 0x1B;

// Register offsets from the MMIO base
const REG_EOI: u64 = 0xB0;
const REG_SPURIOUS: u64 = 0xF0;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INITIAL_COUNT: u64 = 0x380;
const REG_TIMER_CURRENT_COUNT: u64 = 0x390;
const REG_TIMER_DIVIDE_CONFIG: u64 = 0x3E0;

/// LVT timer mask bit
const LVT_TIMER_MASKED: u32 = 1 << 16;

/// Timer mode field (bits 17..18)
const LVT_TIMER_MODE_SHIFT: u32 = 17;

/// Calibration sample length in LAPIC ticks
const CALIBRATION_TICKS: u64 = 0xFFFFF;

/// Calibrated timer base frequency in ticks per second, measured once
/// on the BSP and reused by every core
static TIMER_BASE_FREQUENCY: AtomicU64 = AtomicU64::new(0);

/// Timer delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    OneShot = 0,
    Periodic = 1,
}

/// Per-core handle to the local APIC
pub struct LocalApic {
    base: u64,
}

impl LocalApic {
    /// Locate this core's LAPIC through the higher half
    pub fn new() -> Self {
        let base_phys = rdmsr(IA32_APIC_BASE) & !0xFFF;
        Self {
            base: higher_half(base_phys),
        }
    }

    #[inline]
    fn read(&self, offset: u64) -> u32 {
        unsafe { ::core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write(&self, offset: u64, value: u32) {
        unsafe { ::core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    /// Software-enable the APIC with spurious vector 255 and select the
    /// divide-by-2 timer configuration used everywhere (calibration and
    /// normal operation must agree on the divider)
    pub fn activate(&self) {
        self.write(REG_SPURIOUS, 0x1FF);
        self.write(REG_TIMER_DIVIDE_CONFIG, 0);
    }

    /// Signal end-of-interrupt
    #[inline]
    pub fn send_eoi(&self) {
        self.write(REG_EOI, 0);
    }

    /// Select one-shot or periodic delivery
    pub fn set_timer_mode(&self, mode: TimerMode) {
        let mut lvt = self.read(REG_LVT_TIMER);
        lvt &= !(0b11 << LVT_TIMER_MODE_SHIFT);
        lvt |= (mode as u32) << LVT_TIMER_MODE_SHIFT;
        self.write(REG_LVT_TIMER, lvt);
    }

    /// Gate timer interrupt delivery
    pub fn set_timer_mask(&self, masked: bool) {
        let mut lvt = self.read(REG_LVT_TIMER);
        if masked {
            lvt |= LVT_TIMER_MASKED;
        } else {
            lvt &= !LVT_TIMER_MASKED;
        }
        self.write(REG_LVT_TIMER, lvt);
    }

    /// Route the timer at the scheduler vector, one-shot and unmasked
    pub fn route_timer(&self) {
        self.write(REG_LVT_TIMER, TIMER_VECTOR as u32);
    }

    /// Program the next timer fire `milliseconds` from now
    pub fn set_time_between_fires(&self, milliseconds: u64) {
        let base = TIMER_BASE_FREQUENCY.load(Ordering::Relaxed);
        debug_assert!(base > 0, "LAPIC timer not calibrated");
        let numerator = base * milliseconds;
        let mut reload = numerator / 1000;
        if numerator % 1000 > 500 {
            reload += 1;
        }
        self.write(REG_TIMER_INITIAL_COUNT, reload as u32);
    }

    /// Milliseconds left until the current interval expires
    pub fn time_remaining_ms(&self) -> u64 {
        let base = TIMER_BASE_FREQUENCY.load(Ordering::Relaxed);
        if base == 0 {
            return 0;
        }
        let current = self.read(REG_TIMER_CURRENT_COUNT) as u64;
        current * 1000 / base
    }

    /// Measure the timer base frequency against the PIT (BSP, once)
    ///
    /// The PIT reload is set to its maximum so it does not wrap while
    /// the LAPIC counts `CALIBRATION_TICKS` down to zero.
    pub fn calibrate_timer(&self) {
        // Masked one-shot at the timer vector while sampling
        self.write(REG_LVT_TIMER, LVT_TIMER_MASKED | TIMER_VECTOR as u32);

        pit::set_reload_value(u16::MAX);
        let initial_pit_tick = pit::get_tick();

        self.write(REG_TIMER_INITIAL_COUNT, CALIBRATION_TICKS as u32);
        while self.read(REG_TIMER_CURRENT_COUNT) != 0 {
            ::core::hint::spin_loop();
        }

        let end_pit_tick = pit::get_tick();
        self.write(REG_TIMER_INITIAL_COUNT, 0);

        let pit_delta = (initial_pit_tick - end_pit_tick) as u64;
        let base = CALIBRATION_TICKS / pit_delta * pit::PIT_BASE_FREQUENCY;
        TIMER_BASE_FREQUENCY.store(base, Ordering::SeqCst);
    }
}

impl Default for LocalApic {
    fn default() -> Self {
        Self::new()
    }
}
