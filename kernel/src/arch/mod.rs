//! Architecture layer.
//!
//! The kernel targets AArch64 (EL1, QEMU virt); everything register- or
//! instruction-level lives under [`aarch64`] and is compiled only for the
//! bare-metal target. For host builds (unit tests on the development
//! machine, including AArch64 hosts) the same entry points compile to
//! inert stubs so the portable core -- allocators, trees, scheduler
//! accounting, parsers -- can be exercised off target.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub mod aarch64;

pub mod barriers;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod target {
    use super::aarch64;

    /// Save the interrupt mask state and mask IRQs. Returns the saved
    /// state for [`irq_restore`](super::irq_restore).
    pub fn irq_save_and_mask() -> u64 {
        aarch64::irq_save_and_mask()
    }

    /// Restore an interrupt mask state saved by `irq_save_and_mask`.
    pub fn irq_restore(saved: u64) {
        aarch64::irq_restore(saved)
    }

    /// Unmask IRQs.
    pub fn irq_enable() {
        aarch64::irq_enable()
    }

    /// Monotonic nanoseconds since boot, from the architected counter.
    pub fn now_ns() -> u64 {
        aarch64::timer::now_ns()
    }

    /// Reprogram the periodic timer for the next tick.
    pub fn timer_rearm() {
        aarch64::timer::rearm()
    }

    /// Invalidate the TLB for a virtual address range.
    pub fn tlb_flush_range(va: u64, size: u64) {
        aarch64::mmu::tlb_flush_range(va, size)
    }

    /// Address of the first-dispatch trampoline placed in a new task's PC.
    pub fn task_entry_trampoline_addr() -> u64 {
        aarch64::context::entry_trampoline_addr()
    }

    /// Address of the exit thunk placed in a new task's link register.
    pub fn task_exit_thunk_addr() -> u64 {
        aarch64::context::exit_thunk_addr()
    }

    /// Park the CPU until the next event.
    pub fn wait_for_event() {
        aarch64::wait_for_event()
    }
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
mod target {
    //! Host stubs: no interrupt masking, a fake monotonic clock, inert
    //! trampolines.

    use core::sync::atomic::{AtomicU64, Ordering};

    static FAKE_CLOCK_NS: AtomicU64 = AtomicU64::new(0);

    pub fn irq_save_and_mask() -> u64 {
        0
    }

    pub fn irq_restore(_saved: u64) {}

    pub fn irq_enable() {}

    /// Advances on every read so time never stands still in tests.
    pub fn now_ns() -> u64 {
        FAKE_CLOCK_NS.fetch_add(50_000, Ordering::Relaxed)
    }

    pub fn timer_rearm() {}

    pub fn tlb_flush_range(_va: u64, _size: u64) {}

    extern "C" fn entry_trampoline_stub() {}
    extern "C" fn exit_thunk_stub() {}

    pub fn task_entry_trampoline_addr() -> u64 {
        entry_trampoline_stub as usize as u64
    }

    pub fn task_exit_thunk_addr() -> u64 {
        exit_thunk_stub as usize as u64
    }

    pub fn wait_for_event() {}
}

pub use target::{
    irq_enable, irq_restore, irq_save_and_mask, now_ns, task_entry_trampoline_addr,
    task_exit_thunk_addr, timer_rearm, tlb_flush_range, wait_for_event,
};
