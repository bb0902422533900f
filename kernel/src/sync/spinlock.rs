//! IRQ-masking spinlock.
//!
//! Data that is also touched from interrupt handlers (the log ring is the
//! canonical example) must be locked with interrupts masked, otherwise an
//! IRQ arriving while the lock is held would deadlock on re-acquisition.
//! [`IrqSafeMutex::lock`] saves the interrupt mask state, masks IRQs,
//! takes the spinlock, and restores the saved state when the guard drops --
//! the `lock_irqsave` / `unlock_irqrestore` discipline.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::arch;

/// A spinlock whose critical sections run with IRQs masked.
pub struct IrqSafeMutex<T> {
    inner: Mutex<T>,
}

/// Guard for [`IrqSafeMutex`]. Restores the saved interrupt mask on drop,
/// after the spinlock itself has been released.
pub struct IrqSafeGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    saved_mask: u64,
}

impl<T> IrqSafeMutex<T> {
    /// Create a new IRQ-safe mutex wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Mask IRQs, acquire the lock, and return a guard that undoes both.
    pub fn lock(&self) -> IrqSafeGuard<'_, T> {
        let saved_mask = arch::irq_save_and_mask();
        IrqSafeGuard {
            guard: Some(self.inner.lock()),
            saved_mask,
        }
    }
}

impl<T> Deref for IrqSafeGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Invariant: `guard` is Some until drop.
        self.guard.as_ref().expect("IrqSafeGuard used after drop")
    }
}

impl<T> DerefMut for IrqSafeGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("IrqSafeGuard used after drop")
    }
}

impl<T> Drop for IrqSafeGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before unmasking, so no IRQ can observe the lock
        // held with interrupts enabled.
        self.guard.take();
        arch::irq_restore(self.saved_mask);
    }
}
