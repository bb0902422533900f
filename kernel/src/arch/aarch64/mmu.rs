//! MMU bring-up and TLB/cache maintenance.
//!
//! Two translation roots: TTBR0 identity-maps the low half (device space
//! plus RAM) so physical addresses keep working during and after the
//! switch, and TTBR1 carries the higher-half kernel image mapping at
//! `KERNEL_VIRT_BASE + pa`. Enabling programs MAIR (device,
//! normal-non-cacheable, normal-cacheable), TCR (48-bit VAs, 4 KiB
//! granules both sides), both roots, and finally flips on MMU, data cache
//! and instruction cache in SCTLR.

use cortex_a::registers::{MAIR_EL1, SCTLR_EL1, TCR_EL1, TTBR0_EL1, TTBR1_EL1};
use tock_registers::interfaces::{Readable, Writeable};

use crate::{
    error::{KernelError, KernelResult},
    mm::{
        frame_allocator::FRAME_ALLOCATOR,
        page_table::{PageTableEditor, PteFlags, MAIR_IDX_DEVICE, MAIR_IDX_NORMAL},
        PhysAddr, VirtAddr, KERNEL_VIRT_BASE, PAGE_SIZE,
    },
};

/// Cache line size on this platform.
const CACHE_LINE: u64 = 64;

/// MAIR attribute encodings at the indices the page tables use:
/// slot 0 Device-nGnRnE, slot 1 normal non-cacheable, slot 2 normal
/// write-back cacheable.
const MAIR_VALUE: u64 = 0x00 | (0x44 << 8) | (0xFF << 16);

/// TCR: T0SZ = T1SZ = 16 (48-bit), TG0 = 4 KiB, TG1 = 4 KiB.
const TCR_VALUE: u64 = 16 | (16 << 16) | (2 << 30);

extern "C" {
    static _kernel_start: u8;
    static _kernel_end: u8;
}

/// Build the boot translation tables.
///
/// Returns editors for both roots; the TTBR1 editor is what the kernel VMM
/// adopts for all later mappings. Table memory is reached at its physical
/// address, which stays valid because TTBR0 keeps the identity map alive.
pub fn init() -> KernelResult<(PageTableEditor, PageTableEditor)> {
    let mut pmm = FRAME_ALLOCATOR.lock();

    let ttbr0_root = alloc_root(&mut pmm)?;
    let ttbr1_root = alloc_root(&mut pmm)?;

    // SAFETY: both roots are freshly zeroed frames, addressable 1:1 while
    // the MMU is off.
    let mut ttbr0 = unsafe { PageTableEditor::new(ttbr0_root, 0) };
    // SAFETY: as above.
    let mut ttbr1 = unsafe { PageTableEditor::new(ttbr1_root, 0) };

    let device = PteFlags::SH_INNER | PteFlags::attr_index(MAIR_IDX_DEVICE) | PteFlags::PXN;
    let normal = PteFlags::SH_INNER | PteFlags::attr_index(MAIR_IDX_NORMAL);

    // Identity map: first GiB as device space (UART, GIC), second GiB as
    // RAM.
    let mut pa = 0u64;
    while pa < 0x4000_0000 {
        ttbr0.map_page(VirtAddr::new(pa), PhysAddr::new(pa), device, &mut *pmm)?;
        pa += PAGE_SIZE;
    }
    while pa < 0x8000_0000 {
        ttbr0.map_page(VirtAddr::new(pa), PhysAddr::new(pa), normal, &mut *pmm)?;
        pa += PAGE_SIZE;
    }

    // Higher-half alias of the kernel image.
    // SAFETY: linker symbols; only their addresses are taken.
    let (kstart, kend) = unsafe {
        (
            &_kernel_start as *const u8 as u64,
            &_kernel_end as *const u8 as u64,
        )
    };
    let kstart = kstart & !(PAGE_SIZE - 1);
    let kend = (kend + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    ttbr1.map_region(PhysAddr::new(kstart), kend - kstart, normal, &mut *pmm)?;

    log::info!(
        "mmu: kernel {:#x}..{:#x} aliased at {:#x}",
        kstart,
        kend,
        KERNEL_VIRT_BASE + kstart
    );
    Ok((ttbr0, ttbr1))
}

fn alloc_root(
    pmm: &mut crate::mm::frame_allocator::BitmapFrameAllocator,
) -> KernelResult<PhysAddr> {
    let root = pmm.alloc_page().ok_or(KernelError::OutOfMemory {
        resource: "translation root",
    })?;
    // SAFETY: fresh frame, identity-addressable with the MMU off; a root
    // table must start out all-invalid.
    unsafe {
        core::ptr::write_bytes(root.as_u64() as *mut u8, 0, PAGE_SIZE as usize);
    }
    Ok(root)
}

/// Program MAIR/TCR/TTBRx and turn on the MMU and caches.
pub fn enable(ttbr0: PhysAddr, ttbr1: PhysAddr) {
    MAIR_EL1.set(MAIR_VALUE);
    TCR_EL1.set(TCR_VALUE);
    TTBR0_EL1.set(ttbr0.as_u64());
    TTBR1_EL1.set(ttbr1.as_u64());
    super::super::barriers::inst_sync();

    // M (MMU), C (data cache), I (instruction cache).
    let sctlr = SCTLR_EL1.get() | 1 | (1 << 2) | (1 << 12);
    SCTLR_EL1.set(sctlr);
    super::super::barriers::inst_sync();

    log::info!("mmu: enabled");
}

/// Relocate execution into the higher half: add the kernel-base offset to
/// the program counter with a PC-relative jump, then rebase the stack
/// pointer by the same amount.
///
/// # Safety
///
/// TTBR1 must already map the running image at `KERNEL_VIRT_BASE + pa`,
/// and the MMU must be enabled. Every subsequent frame pointer and return
/// address on this stack still refers to low addresses; callers must not
/// return through frames created before the switch.
pub unsafe fn switch_to_higher_half() {
    let offset = KERNEL_VIRT_BASE;
    // SAFETY: contract above; x9/x10 are scratch.
    unsafe {
        core::arch::asm!(
            "adr x9, 2f",
            "add x9, x9, {off}",
            "br  x9",
            "2:",
            "mov x10, sp",
            "add x10, x10, {off}",
            "mov sp, x10",
            off = in(reg) offset,
            out("x9") _,
            out("x10") _,
        );
    }
}

/// Invalidate the whole TLB (inner shareable).
pub fn tlb_flush_all() {
    // SAFETY: TLB maintenance sequence; affects translation caching only.
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vmalle1is",
            "dsb ish",
            "isb",
            options(nostack, preserves_flags)
        );
    }
}

/// Invalidate the TLB entry for one virtual address.
pub fn tlb_flush_page(va: u64) {
    let page = va >> 12;
    // SAFETY: TLB maintenance for one page; `vaae1is` takes VA[55:12].
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1is, {page}",
            "dsb ish",
            "isb",
            page = in(reg) page,
            options(nostack, preserves_flags)
        );
    }
}

/// Invalidate the TLB for a range, page by page, with one trailing
/// synchronization.
pub fn tlb_flush_range(va: u64, size: u64) {
    let mut addr = va & !(PAGE_SIZE - 1);
    let end = va + size;
    while addr < end {
        let page = addr >> 12;
        // SAFETY: per-page TLB invalidate; barriers follow the loop.
        unsafe {
            core::arch::asm!("tlbi vaae1is, {page}", page = in(reg) page,
                options(nostack, preserves_flags));
        }
        addr += PAGE_SIZE;
    }
    super::super::barriers::data_sync_inst_sync();
}

/// Clean and invalidate the data cache for a virtual range.
pub fn cache_flush_range(va: u64, size: u64) {
    let mut addr = va & !(CACHE_LINE - 1);
    let end = va + size;
    while addr < end {
        // SAFETY: DC CIVAC on a mapped address; data-cache maintenance only.
        unsafe {
            core::arch::asm!("dc civac, {addr}", addr = in(reg) addr,
                options(nostack, preserves_flags));
        }
        addr += CACHE_LINE;
    }
    super::super::barriers::data_sync();
}

/// Invalidate the instruction cache for a virtual range.
pub fn icache_invalidate_range(va: u64, size: u64) {
    let mut addr = va & !(CACHE_LINE - 1);
    let end = va + size;
    while addr < end {
        // SAFETY: IC IVAU on a mapped address; i-cache maintenance only.
        unsafe {
            core::arch::asm!("ic ivau, {addr}", addr = in(reg) addr,
                options(nostack, preserves_flags));
        }
        addr += CACHE_LINE;
    }
    super::super::barriers::data_sync_inst_sync();
}
