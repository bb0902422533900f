//! AArch64 (EL1) support for the QEMU virt machine.

pub mod boot;
pub mod context;
pub mod exception;
pub mod gic;
pub mod mmu;
pub mod serial;
pub mod timer;

use cortex_a::registers::{CurrentEL, DAIF};
use tock_registers::interfaces::{Readable, Writeable};

/// Save DAIF and mask IRQs. Pairs with [`irq_restore`].
pub fn irq_save_and_mask() -> u64 {
    let saved = DAIF.get();
    // SAFETY: `msr daifset, #2` only sets the IRQ mask bit.
    unsafe {
        core::arch::asm!("msr daifset, #2", options(nostack, preserves_flags));
    }
    saved
}

/// Restore a DAIF value saved by [`irq_save_and_mask`].
pub fn irq_restore(saved: u64) {
    DAIF.set(saved);
}

/// Unmask IRQs.
pub fn irq_enable() {
    // SAFETY: `msr daifclr, #2` only clears the IRQ mask bit.
    unsafe {
        core::arch::asm!("msr daifclr, #2", options(nostack, preserves_flags));
    }
}

/// Mask all of DAIF. Used on the panic path.
pub fn irq_mask_all() {
    // SAFETY: masks exception delivery; no other state is touched.
    unsafe {
        core::arch::asm!("msr daifset, #0xF", options(nostack, preserves_flags));
    }
}

/// Current exception level (0-3).
pub fn current_el() -> u64 {
    CurrentEL.read(CurrentEL::EL)
}

/// Wait for an event (idle-loop parking).
pub fn wait_for_event() {
    cortex_a::asm::wfe();
}

/// Wait for an interrupt (halt parking).
pub fn wait_for_interrupt() {
    cortex_a::asm::wfi();
}
