//! One-time global state without `static mut`.
//!
//! Kernel-wide singletons (the GIC instance, the device-tree handle, the IRQ
//! table) are constructed once by the boot composer and read through
//! accessors afterwards. [`GlobalState`] wraps a `spin::Mutex<Option<T>>` so
//! that the construction happens exactly once and every later access is
//! checked rather than assumed.

use spin::Mutex;

/// Mutex-protected global state with explicit one-time initialization.
pub struct GlobalState<T> {
    inner: Mutex<Option<T>>,
}

impl<T> GlobalState<T> {
    /// Create new uninitialized global state.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Initialize the global state.
    ///
    /// Returns `Err(value)` if the state was already initialized, handing
    /// the rejected value back to the caller.
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut lock = self.inner.lock();
        if lock.is_some() {
            Err(value)
        } else {
            *lock = Some(value);
            Ok(())
        }
    }

    /// Run a closure against a shared reference to the value, if initialized.
    pub fn with<R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        let lock = self.inner.lock();
        lock.as_ref().map(f)
    }

    /// Run a closure against a mutable reference to the value, if initialized.
    pub fn with_mut<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        let mut lock = self.inner.lock();
        lock.as_mut().map(f)
    }

    /// Whether `init` has already run.
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: The inner spin::Mutex serializes all access to the Option<T>, so
// the contained value is only ever reached by one context at a time.
// Transferring ownership is safe whenever T itself is Send.
unsafe impl<T: Send> Send for GlobalState<T> {}
// SAFETY: Shared references to GlobalState only reach T through the Mutex
// guard, which provides exclusive access. T therefore only needs Send.
unsafe impl<T: Send> Sync for GlobalState<T> {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn init_once_then_access() {
        let state: GlobalState<u32> = GlobalState::new();
        assert!(!state.is_initialized());
        assert!(state.with(|_| ()).is_none());

        assert!(state.init(7).is_ok());
        assert_eq!(state.with(|v| *v), Some(7));

        // Second init is rejected and returns the value.
        assert_eq!(state.init(9), Err(9));

        state.with_mut(|v| *v += 1);
        assert_eq!(state.with(|v| *v), Some(8));
    }
}
