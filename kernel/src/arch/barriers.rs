//! Memory barriers.
//!
//! Centralizes barrier sequences so portable code does not scatter inline
//! assembly. Page-table and MMIO ordering on AArch64 needs DSB/ISB pairs;
//! on the host these collapse to compiler fences.

/// Full data synchronization barrier.
#[inline(always)]
pub fn data_sync() {
    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: `dsb sy` only orders memory accesses; no other effects.
        unsafe {
            core::arch::asm!("dsb sy", options(nostack, preserves_flags));
        }
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Instruction synchronization barrier: flush the pipeline so subsequent
/// instruction fetches observe preceding system-register and memory
/// effects.
#[inline(always)]
pub fn inst_sync() {
    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: `isb` flushes the pipeline; no memory or register effects.
        unsafe {
            core::arch::asm!("isb", options(nostack, preserves_flags));
        }
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// The post-edit sequence for translation-table updates: make the stores
/// visible, then resynchronize the instruction stream.
#[inline(always)]
pub fn data_sync_inst_sync() {
    data_sync();
    inst_sync();
}
