//! Synchronization primitives.
//!
//! Two locking disciplines exist in this kernel (see the concurrency model):
//! plain spinlocks (`spin::Mutex`, used directly) for data never touched from
//! interrupt context, and [`IrqSafeMutex`] for data shared with IRQ handlers.
//! [`GlobalState`] provides one-time global initialization without
//! `static mut`.

pub mod once_lock;
pub mod spinlock;

pub use once_lock::GlobalState;
pub use spinlock::IrqSafeMutex;
