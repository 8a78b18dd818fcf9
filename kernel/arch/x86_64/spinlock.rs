//! IRQ-safe spinlock
//!
//! A spinlock that disables interrupts on the local core while held.
//! Because an interrupt handler may contend for the same lock (the task
//! queue is taken from the timer vector), plain spinning with interrupts
//! enabled would deadlock the moment a handler fires on a core that
//! already holds the lock. Acquisition therefore saves RFLAGS, executes
//! `cli`, and the guard restores the saved state on drop.

use ::core::cell::UnsafeCell;
use ::core::ops::{Deref, DerefMut};
use ::core::sync::atomic::{AtomicBool, Ordering};

pub struct IrqSpinlock<T> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: the lock provides mutual exclusion, so T can be sent/shared
// if it would be safe to send/share normally.
unsafe impl<T: Send> Send for IrqSpinlock<T> {}
unsafe impl<T: Send> Sync for IrqSpinlock<T> {}

impl<T> IrqSpinlock<T> {
    /// Create a new IRQ-safe spinlock
    pub const fn new(data: T) -> Self {
        Self {
            lock: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, disabling interrupts on the local core
    ///
    /// Returns a guard that releases the lock and restores the saved
    /// interrupt state on drop.
    #[inline]
    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        let saved_rflags = save_and_disable_irq();

        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            ::core::hint::spin_loop();
        }

        IrqSpinlockGuard {
            lock: self,
            saved_rflags,
        }
    }
}

pub struct IrqSpinlockGuard<'a, T> {
    lock: &'a IrqSpinlock<T>,
    saved_rflags: u64,
}

impl<T> Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: we hold the lock, so exclusive access is guaranteed
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the lock, so exclusive access is guaranteed
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqSpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.store(false, Ordering::Release);
        // Restore interrupt state last, after the lock is visible as free
        restore_irq(self.saved_rflags);
    }
}

/// Save RFLAGS and disable interrupts on the local core
#[inline]
fn save_and_disable_irq() -> u64 {
    #[cfg(all(target_arch = "x86_64", not(test)))]
    {
        let rflags: u64;
        unsafe {
            ::core::arch::asm!(
                "pushfq",
                "pop {}",
                "cli",
                out(reg) rflags,
                options(nomem, preserves_flags)
            );
        }
        rflags
    }
    #[cfg(any(not(target_arch = "x86_64"), test))]
    {
        0
    }
}

/// Restore a previously saved RFLAGS value (interrupt flag included)
#[inline]
fn restore_irq(saved_rflags: u64) {
    #[cfg(all(target_arch = "x86_64", not(test)))]
    {
        const RFLAGS_IF: u64 = 1 << 9;
        if saved_rflags & RFLAGS_IF != 0 {
            unsafe {
                ::core::arch::asm!("sti", options(nomem, nostack));
            }
        }
    }
    #[cfg(any(not(target_arch = "x86_64"), test))]
    {
        let _ = saved_rflags;
    }
}
