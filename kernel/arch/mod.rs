//! Architecture support
//!
//! Only x86_64 is supported; the kernel boots via a Stivale2-style
//! handoff and relies on the LAPIC for per-core timer interrupts.

pub mod x86_64;

pub use x86_64::spinlock::IrqSpinlock;
