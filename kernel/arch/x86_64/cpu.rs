//! Per-core CPU state
//!
//! Each core's id lives in `IA32_TSC_AUX` (written during bring-up, read
//! on every `core_id()` call), and each core registers its scheduler in
//! a fixed slot table at initialization. The table is only written while
//! the core list is being built, so lookups afterwards are race-free.

use ::core::sync::atomic::{AtomicPtr, Ordering};

use crate::task::scheduler::Scheduler;

/// Upper bound on supported cores
pub const MAX_CPUS: usize = 32;

/// MSR holding the per-core id
const IA32_TSC_AUX: u32 = 0xC000_0103;

/// MSR holding the user-mode FS base (thread control block)
const IA32_FS_BASE: u32 = 0xC000_0100;

/// Per-core scheduler slots, indexed by core id
static SCHEDULERS: [AtomicPtr<Scheduler>; MAX_CPUS] =
    [const { AtomicPtr::new(::core::ptr::null_mut()) }; MAX_CPUS];

/// Read a model-specific register
#[inline]
pub fn rdmsr(msr: u32) -> u64 {
    #[cfg(not(test))]
    {
        let low: u32;
        let high: u32;
        unsafe {
            ::core::arch::asm!(
                "rdmsr",
                in("ecx") msr,
                out("eax") low,
                out("edx") high,
                options(nomem, nostack, preserves_flags)
            );
        }
        (high as u64) << 32 | low as u64
    }
    #[cfg(test)]
    {
        let _ = msr;
        0
    }
}

/// Write a model-specific register
#[inline]
pub fn wrmsr(msr: u32, value: u64) {
    #[cfg(not(test))]
    unsafe {
        ::core::arch::asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nomem, nostack, preserves_flags)
        );
    }
    #[cfg(test)]
    {
        let _ = (msr, value);
    }
}

/// Record this core's id so `core_id()` works from any context
pub fn set_core_id(id: u32) {
    wrmsr(IA32_TSC_AUX, id as u64);
}

/// This core's id
#[inline]
pub fn core_id() -> usize {
    rdmsr(IA32_TSC_AUX) as usize
}

/// Set the user-mode FS base (TCB pointer)
pub fn set_fs_base(addr: u64) {
    wrmsr(IA32_FS_BASE, addr);
}

/// Register this core's scheduler
pub fn install_scheduler(id: usize, scheduler: &'static mut Scheduler) {
    assert!(id < MAX_CPUS, "core id {} out of range", id);
    SCHEDULERS[id].store(scheduler, Ordering::SeqCst);
}

/// This core's scheduler
///
/// The returned reference is exclusively used by the owning core; other
/// cores reach tasks only through the shared queue.
pub fn scheduler() -> &'static mut Scheduler {
    let ptr = SCHEDULERS[core_id()].load(Ordering::SeqCst);
    assert!(!ptr.is_null(), "scheduler not installed on core {}", core_id());
    unsafe { &mut *ptr }
}

/// Enable SSE (user programs and the compiler assume it)
pub fn enable_sse() {
    #[cfg(not(test))]
    unsafe {
        ::core::arch::asm!(
            // CR0: clear EM (bit 2), set MP (bit 1)
            "mov {tmp}, cr0",
            "and {tmp}, -5",
            "or {tmp}, 2",
            "mov cr0, {tmp}",
            // CR4: set OSFXSR (bit 9) and OSXMMEXCPT (bit 10)
            "mov {tmp}, cr4",
            "or {tmp}, 0x600",
            "mov cr4, {tmp}",
            tmp = out(reg) _,
            options(nomem, nostack)
        );
    }
}

/// Enable interrupts on this core
#[inline]
pub fn enable_interrupts() {
    #[cfg(not(test))]
    unsafe {
        ::core::arch::asm!("sti", options(nomem, nostack));
    }
}

/// Halt until the next interrupt
#[inline]
pub fn halt() {
    #[cfg(not(test))]
    unsafe {
        ::core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}

/// Stop this core for good
pub fn halt_forever() -> ! {
    loop {
        #[cfg(not(test))]
        unsafe {
            ::core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
        #[cfg(test)]
        ::core::hint::spin_loop();
    }
}
