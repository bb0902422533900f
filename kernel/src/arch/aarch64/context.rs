//! Context switching and the task entry trampoline.
//!
//! [`CpuContext`] layout (defined with the scheduler) is the ABI here:
//! x0-x30 at offsets 0..248, then sp, pc, pstate. `switch_to` saves only
//! the callee-saved set plus sp/pc -- the caller-saved registers of a
//! voluntarily switching task are dead by the AAPCS64 contract. Preempted
//! tasks get their full register file captured by the trap entry instead.
//!
//! A new task's first dispatch lands in [`task_entry_trampoline`] with the
//! entry function and its arguments parked in x19-x22 by task creation;
//! returning from the entry function falls through to the exit thunk.

use crate::sched::task::CpuContext;

// Byte offsets into CpuContext, kept in sync with its #[repr(C)] layout.
// x[n] = n * 8, sp = 248, pc = 256.
core::arch::global_asm!(
    r#"
    .section .text
    .global __ferrite_switch_to
    .type __ferrite_switch_to, @function
__ferrite_switch_to:
    // x0 = prev context, x1 = next context.
    mov     x9, sp
    stp     x19, x20, [x0, #152]
    stp     x21, x22, [x0, #168]
    stp     x23, x24, [x0, #184]
    stp     x25, x26, [x0, #200]
    stp     x27, x28, [x0, #216]
    stp     x29, x30, [x0, #232]
    str     x9,  [x0, #248]
    str     x30, [x0, #256]        // resume at our return address

    .global __ferrite_load_context
    .type __ferrite_load_context, @function
__ferrite_load_context:
    // x1 = context to install (x0 is dead from here on).
    ldp     x19, x20, [x1, #152]
    ldp     x21, x22, [x1, #168]
    ldp     x23, x24, [x1, #184]
    ldp     x25, x26, [x1, #200]
    ldp     x27, x28, [x1, #216]
    ldp     x29, x30, [x1, #232]
    ldr     x9,  [x1, #248]
    mov     sp, x9
    ldr     x9,  [x1, #256]
    br      x9

    .global __ferrite_task_entry
    .type __ferrite_task_entry, @function
__ferrite_task_entry:
    // First dispatch of a fresh task: x19 = entry, x20-x22 = args,
    // x30 = exit thunk.
    mov     x0, x20
    mov     x1, x21
    mov     x2, x22
    blr     x19
    b       __ferrite_task_exit
"#
);

extern "C" {
    fn __ferrite_switch_to(prev: *mut CpuContext, next: *const CpuContext);
    fn __ferrite_load_context(dead: *mut CpuContext, next: *const CpuContext) -> !;
    fn __ferrite_task_entry();
}

/// Address a fresh task's PC is pointed at.
pub fn entry_trampoline_addr() -> u64 {
    __ferrite_task_entry as usize as u64
}

/// Address parked in a fresh task's link register as a safety net; the
/// trampoline also branches here when the entry function returns.
pub fn exit_thunk_addr() -> u64 {
    __ferrite_task_exit as usize as u64
}

/// Save the current callee-saved state into `prev` and resume `next`.
///
/// Returns (much later) when `prev` is scheduled again.
///
/// # Safety
///
/// Both pointers must reference live, stable `CpuContext` records; `next`
/// must describe a resumable task (valid sp/pc). Interrupt state is the
/// caller's concern.
pub unsafe fn switch_to(prev: *mut CpuContext, next: *const CpuContext) {
    // SAFETY: delegated to the contract above.
    unsafe { __ferrite_switch_to(prev, next) }
}

/// Install `next` without saving anything (the previous task is gone).
///
/// # Safety
///
/// `next` must describe a resumable task. Does not return.
pub unsafe fn load_context(next: *const CpuContext) -> ! {
    // SAFETY: delegated to the contract above; x0 is a dead scratch slot.
    unsafe { __ferrite_load_context(core::ptr::null_mut(), next) }
}

/// Exit path for tasks whose entry function returns.
#[no_mangle]
extern "C" fn __ferrite_task_exit() -> ! {
    crate::sched::exit_current(0);
    // exit_current installed another context; if it ever returns the
    // scheduler state is corrupt.
    panic!("exited task resumed");
}
