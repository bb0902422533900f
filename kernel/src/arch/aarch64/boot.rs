//! Boot stub and exception vectors.
//!
//! `_start` parks secondary CPUs, installs the boot stack, zeroes BSS,
//! points VBAR at the vector table and calls `kernel_main` with the
//! firmware's DTB pointer still in x0.
//!
//! The vector table saves the full register file as a trap frame matching
//! the `CpuContext` layout (x0-x30, sp, pc, pstate; 272 bytes) and hands a
//! pointer to it to the Rust handlers. On return the frame is replayed --
//! onto a *different* stack when the scheduler rewrote the frame to
//! another task -- and `eret` resumes whatever the frame now describes.

use core::arch::global_asm;

global_asm!(
    r#"
    .section ".text.boot"
    .global _start
_start:
    // Secondary CPUs sleep; this kernel is single-CPU.
    mrs     x1, mpidr_el1
    and     x1, x1, #0xFF
    cbz     x1, 2f
1:  wfe
    b       1b
2:
    mov     x19, x0                 // firmware DTB pointer
    ldr     x1, =_stack_top
    mov     sp, x1

    // Zero BSS.
    ldr     x1, =__bss_start
    ldr     x2, =__bss_end
3:  cmp     x1, x2
    b.hs    4f
    str     xzr, [x1], #8
    b       3b
4:
    ldr     x1, =exception_vector_table
    msr     vbar_el1, x1
    isb

    mov     x0, x19
    bl      kernel_main
5:  wfe                             // kernel_main never returns
    b       5b

    .section ".text"

    // Build a 272-byte CpuContext frame on the current stack.
    .macro TRAP_SAVE
    sub     sp, sp, #272
    stp     x0, x1,   [sp, #0]
    stp     x2, x3,   [sp, #16]
    stp     x4, x5,   [sp, #32]
    stp     x6, x7,   [sp, #48]
    stp     x8, x9,   [sp, #64]
    stp     x10, x11, [sp, #80]
    stp     x12, x13, [sp, #96]
    stp     x14, x15, [sp, #112]
    stp     x16, x17, [sp, #128]
    stp     x18, x19, [sp, #144]
    stp     x20, x21, [sp, #160]
    stp     x22, x23, [sp, #176]
    stp     x24, x25, [sp, #192]
    stp     x26, x27, [sp, #208]
    stp     x28, x29, [sp, #224]
    str     x30,      [sp, #240]
    add     x0, sp, #272            // interrupted SP
    str     x0,       [sp, #248]
    mrs     x0, elr_el1
    str     x0,       [sp, #256]
    mrs     x0, spsr_el1
    str     x0,       [sp, #264]
    mov     x0, sp                  // frame pointer for the handler
    .endm

    // Replay the (possibly rewritten) frame. The frame's sp field decides
    // which stack execution resumes on.
__trap_return:
    ldr     x9, [sp, #248]
    sub     x9, x9, #272
    mov     x10, sp
    mov     x11, #34                // 272 / 8
6:  ldr     x12, [x10], #8
    str     x12, [x9], #8
    subs    x11, x11, #1
    b.ne    6b
    sub     x9, x9, #272
    mov     sp, x9

    ldr     x0, [sp, #256]
    msr     elr_el1, x0
    ldr     x0, [sp, #264]
    msr     spsr_el1, x0
    ldp     x0, x1,   [sp, #0]
    ldp     x2, x3,   [sp, #16]
    ldp     x4, x5,   [sp, #32]
    ldp     x6, x7,   [sp, #48]
    ldp     x8, x9,   [sp, #64]
    ldp     x10, x11, [sp, #80]
    ldp     x12, x13, [sp, #96]
    ldp     x14, x15, [sp, #112]
    ldp     x16, x17, [sp, #128]
    ldp     x18, x19, [sp, #144]
    ldp     x20, x21, [sp, #160]
    ldp     x22, x23, [sp, #176]
    ldp     x24, x25, [sp, #192]
    ldp     x26, x27, [sp, #208]
    ldp     x28, x29, [sp, #224]
    ldr     x30,      [sp, #240]
    add     sp, sp, #272
    eret

__vec_sync:
    TRAP_SAVE
    bl      handle_sync_exception
    b       __trap_return

__vec_irq:
    TRAP_SAVE
    bl      handle_irq_exception
    b       __trap_return

__vec_fiq:
    TRAP_SAVE
    bl      handle_fiq_exception
    b       __trap_return

__vec_serror:
    TRAP_SAVE
    bl      handle_serror_exception
    b       __trap_return

__vec_unexpected:
    TRAP_SAVE
    bl      handle_serror_exception
7:  wfe
    b       7b

    // 16 entries, 128 bytes apart. Only the current-EL-with-SPx group is
    // expected to fire for this kernel.
    .align  11
    .global exception_vector_table
exception_vector_table:
    // Current EL with SP0
    .align 7
    b       __vec_unexpected
    .align 7
    b       __vec_unexpected
    .align 7
    b       __vec_unexpected
    .align 7
    b       __vec_unexpected
    // Current EL with SPx
    .align 7
    b       __vec_sync
    .align 7
    b       __vec_irq
    .align 7
    b       __vec_fiq
    .align 7
    b       __vec_serror
    // Lower EL, AArch64
    .align 7
    b       __vec_sync
    .align 7
    b       __vec_irq
    .align 7
    b       __vec_fiq
    .align 7
    b       __vec_serror
    // Lower EL, AArch32
    .align 7
    b       __vec_unexpected
    .align 7
    b       __vec_unexpected
    .align 7
    b       __vec_unexpected
    .align 7
    b       __vec_unexpected
"#
);
