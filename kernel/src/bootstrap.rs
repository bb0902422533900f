//! Boot composer.
//!
//! Ordered bring-up of the kernel subsystems. The sequencing constraints
//! are the whole content of this module:
//!
//! 1. Logging first, so everything after it can speak.
//! 2. DTB before the PMM (the memory map comes from it) and before the
//!    UART rebase and GIC version choice.
//! 3. PMM before the MMU (page tables are physical frames).
//! 4. MMU and higher-half switch before the VMM adopts the TTBR1 editor.
//! 5. IRQ table and GIC before the timer; scheduler before interrupts are
//!    unmasked; unmasking last, after the demo workload exists.
//!
//! The boot thread of execution becomes the idle task (PID 0) and parks in
//! `wfe`.

#![cfg(all(target_arch = "aarch64", target_os = "none"))]

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    arch, dtb, irq, klog,
    mm::{frame_allocator::FRAME_ALLOCATOR, vmm::KERNEL_VMM, MemoryRegion, PAGE_SIZE},
    sched::{self, TaskArgs},
};

extern "C" {
    static _kernel_start: u8;
    static _kernel_end: u8;
    static stack_bottom: u8;
    static _stack_top: u8;
}

/// Scratch counters incremented by the demo workloads; fairness between
/// them is observable from the console.
pub static DEMO_COUNTERS: [AtomicU64; 2] = [AtomicU64::new(0), AtomicU64::new(0)];

extern "C" fn demo_worker(argc: usize, _argv: usize, _envp: usize) {
    let counter = &DEMO_COUNTERS[argc & 1];
    loop {
        counter.fetch_add(1, Ordering::Relaxed);
        core::hint::spin_loop();
    }
}

/// Kernel entry, called by the boot stub with the firmware DTB pointer.
pub fn run(dtb_ptr: u64) -> ! {
    // Raw console first; the log ring is not up yet.
    crate::kprintln!("ferrite: early boot, dtb={:#x}", dtb_ptr);

    klog::init();
    klog::logger::init();
    log::info!("ferrite {} booting", env!("CARGO_PKG_VERSION"));

    // Device tree: hardware discovery, with virt-machine fallbacks.
    if let Err(e) = dtb::init(dtb_ptr) {
        log::warn!("dtb: none found ({}), using fallbacks", e);
    }
    dtb::with_tree(|dt| dt.dump_info());
    if let Some(Ok(base)) = dtb::with_tree(|dt| dt.stdout_uart_base()) {
        arch::aarch64::serial::set_base(base);
    }

    // Physical memory.
    init_pmm();

    // Paging and the higher half.
    let (ttbr0, ttbr1) = match arch::aarch64::mmu::init() {
        Ok(editors) => editors,
        Err(e) => panic!("mmu init failed: {}", e),
    };
    arch::aarch64::mmu::enable(ttbr0.root(), ttbr1.root());
    // SAFETY: TTBR1 maps the image, the MMU is on, and we never return
    // through pre-switch stack frames (run() diverges).
    unsafe {
        arch::aarch64::mmu::switch_to_higher_half();
    }
    KERNEL_VMM.lock().attach_editor(ttbr1);

    // Interrupts and time.
    irq::init();
    let version = dtb::with_tree(|dt| dt.gic_version()).unwrap_or(dtb::GicVersion::V2);
    if let Err(e) = arch::aarch64::gic::init(
        version,
        arch::aarch64::gic::GICD_BASE,
        arch::aarch64::gic::GICC_BASE,
    ) {
        panic!("gic init failed: {}", e);
    }
    if let Err(e) = irq::init_timer() {
        panic!("timer init failed: {}", e);
    }

    // Tasks. The boot context becomes the idle task.
    sched::init();
    for idx in 0..2u64 {
        let args = TaskArgs {
            argc: idx,
            ..TaskArgs::default()
        };
        if sched::spawn(demo_worker, 0, args).is_none() {
            panic!("failed to spawn boot tasks");
        }
    }

    log::info!("boot complete, enabling interrupts");
    arch::irq_enable();

    // Idle loop: PID 0 never enters the run queue and yields the CPU
    // between interrupts.
    loop {
        arch::wait_for_event();
    }
}

/// Initialize the frame allocator from the DTB memory map (or fallbacks)
/// and reserve everything the kernel already depends on.
fn init_pmm() {
    let region = dtb::with_tree(|dt| dt.memory_region().ok())
        .flatten()
        .unwrap_or(dtb::FALLBACK_MEMORY);

    // SAFETY: linker symbols; only their addresses are taken.
    let (kstart, kend, sbottom, stop) = unsafe {
        (
            &_kernel_start as *const u8 as u64,
            &_kernel_end as *const u8 as u64,
            &stack_bottom as *const u8 as u64,
            &_stack_top as *const u8 as u64,
        )
    };

    let mut reserved = [MemoryRegion::new(0, 0); 64];
    let mut n = 0;
    let mut push = |r: MemoryRegion| {
        if n < reserved.len() {
            reserved[n] = r;
            n += 1;
        } else {
            log::warn!("pmm: reserved-range list full, dropping {:#x}", r.base);
        }
    };

    push(MemoryRegion::new(kstart, kend - kstart));
    push(MemoryRegion::new(sbottom, stop - sbottom));
    if let Some(blob) = dtb::blob_region() {
        push(blob);
    }
    // One page around the UART MMIO base.
    let uart_page = arch::aarch64::serial::base() & !(PAGE_SIZE - 1);
    push(MemoryRegion::new(uart_page, PAGE_SIZE));
    // Firmware compatibility: the first MiB of managed RAM.
    push(MemoryRegion::new(region.base, 0x10_0000));

    dtb::with_tree(|dt| {
        for r in dt.reserved_regions() {
            push(r);
        }
    });

    let mut pmm = FRAME_ALLOCATOR.lock();
    pmm.init(region, &reserved[..n]);
    log::info!(
        "pmm: managing {} pages ({} free) at {:#x}",
        pmm.total_pages(),
        pmm.free_pages_count(),
        region.base
    );
    if !pmm.check() {
        panic!("pmm self-check failed after init");
    }
}
