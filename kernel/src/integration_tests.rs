//! Cross-subsystem scenarios, run on the host.
//!
//! These tests wire several subsystems together the way the running kernel
//! does -- heap over VMM over PMM, scheduler under the syscall layer --
//! and check the end-to-end behavior rather than any single module's
//! contract.

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};

use crate::{
    mm::{
        frame_allocator::{BitmapFrameAllocator, FrameSource},
        page_table::PageTableEditor,
        vmalloc::Vmalloc,
        vmm::{MapAttrs, Vmm},
        MemoryRegion, PhysAddr, VirtAddr, PAGE_SIZE,
    },
    sched::{
        task::{CpuContext, TaskArgs},
        Scheduler,
    },
    syscall,
};

extern "C" fn noop_entry(_a: usize, _b: usize, _c: usize) {}

#[test]
fn bitmap_round_trip_one_gib() {
    // init with base=0x40000000, size=0x40000000, no reserved ranges.
    let mut pmm = Box::new(BitmapFrameAllocator::new());
    pmm.init(MemoryRegion::new(0x4000_0000, 0x4000_0000), &[]);
    assert_eq!(pmm.total_pages(), 262_144);

    let start_free = pmm.free_pages_count();
    let mut pages = Vec::new();
    for _ in 0..64 {
        pages.push(pmm.alloc_page().unwrap());
    }
    // 64 distinct, page-aligned frames inside the managed range.
    for (i, p) in pages.iter().enumerate() {
        assert!(p.is_page_aligned());
        assert!((0x4000_0000..0x8000_0000).contains(&p.as_u64()));
        assert!(!pages[..i].contains(p));
    }
    for p in &pages {
        pmm.free_page(*p);
    }
    assert_eq!(pmm.free_pages_count(), start_free);
    assert!(pmm.check());
}

#[test]
fn guarded_heap_reuses_freed_window() {
    let mut pmm = Box::new(BitmapFrameAllocator::new());
    pmm.init(MemoryRegion::new(0x4000_0000, 0x0100_0000), &[]);
    let mut vmm = Vmm::new();
    let mut heap = Vmalloc::new();
    let f0 = pmm.free_pages_count();

    let a = heap.alloc(&mut vmm, &mut pmm, 4096).unwrap();
    let b = heap.alloc(&mut vmm, &mut pmm, 8192).unwrap();
    let c = heap.alloc(&mut vmm, &mut pmm, 4096).unwrap();
    let f2 = pmm.free_pages_count();
    assert!(f2 < f0);

    heap.free(&mut vmm, &mut pmm, b, 8192);
    let d = heap.alloc(&mut vmm, &mut pmm, 8192).unwrap();
    assert_eq!(d, b);
    assert_eq!(pmm.free_pages_count(), f2);

    heap.free(&mut vmm, &mut pmm, a, 4096);
    heap.free(&mut vmm, &mut pmm, d, 8192);
    heap.free(&mut vmm, &mut pmm, c, 4096);
    assert_eq!(pmm.free_pages_count(), f0);
    assert!(pmm.check());
}

#[test]
fn overlap_rejection_literals() {
    let mut pmm = Box::new(BitmapFrameAllocator::new());
    pmm.init(MemoryRegion::new(0x4000_0000, 0x0010_0000), &[]);
    let mut vmm = Vmm::new();
    let rw = MapAttrs::R | MapAttrs::W;

    let p1 = pmm.alloc_pages(2).unwrap();
    let p2 = pmm.alloc_page().unwrap();

    vmm.map(VirtAddr::new(0xFFFF_FF80_8000_1000), p1, 8192, rw, &mut *pmm)
        .unwrap();
    let err = vmm.map(VirtAddr::new(0xFFFF_FF80_8000_2000), p2, 4096, rw, &mut *pmm);
    assert!(matches!(err, Err(crate::KernelError::Overlap { .. })));

    // The first mapping still resolves through virt_to_phys.
    assert_eq!(vmm.virt_to_phys(VirtAddr::new(0xFFFF_FF80_8000_1000)), p1);
    assert_eq!(
        vmm.virt_to_phys(VirtAddr::new(0xFFFF_FF80_8000_2000))
            .as_u64(),
        p1.as_u64() + 0x1000
    );
}

/// Backing store of real, page-aligned host memory acting as frames for
/// the page-table walker.
#[repr(C, align(4096))]
struct HostFrame([u8; 4096]);

struct HostFrames {
    frames: Vec<Box<HostFrame>>,
}

impl FrameSource for HostFrames {
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        self.frames.push(Box::new(HostFrame([0; 4096])));
        Some(PhysAddr::new(
            self.frames.last().unwrap().as_ref() as *const HostFrame as u64,
        ))
    }
}

#[test]
fn map_unmap_leaves_no_trace() {
    let mut frames = HostFrames { frames: Vec::new() };
    let root = frames.alloc_frame().unwrap();
    // SAFETY: host test frames are real zeroed memory at identity offset.
    let editor = unsafe { PageTableEditor::new(root, 0) };

    let mut vmm = Vmm::new();
    vmm.attach_editor(editor);

    let va = VirtAddr::new(0xFFFF_FF80_8004_0000);
    let pa = PhysAddr::new(0x4444_0000);
    let n = 4 * PAGE_SIZE;

    vmm.map(va, pa, n, MapAttrs::R | MapAttrs::W, &mut frames)
        .unwrap();
    // Pages resolve both through the VMA index and the tables.
    assert_eq!(
        vmm.virt_to_phys(VirtAddr::new(va.as_u64() + PAGE_SIZE))
            .as_u64(),
        pa.as_u64() + PAGE_SIZE
    );

    vmm.unmap(va, n).unwrap();
    assert_eq!(vmm.vma_count(), 0);
    // After unmap, the identity fallback answers: indistinguishable from
    // the state before the map.
    assert_eq!(vmm.virt_to_phys(va), PhysAddr::new(va.as_u64()));
}

#[test]
fn fair_scheduling_dispatch_ratio() {
    let mut s = Scheduler::new();
    s.init();
    let a = s
        .create_task(
            noop_entry,
            0,
            TaskArgs::default(),
            VirtAddr::new(0xFFFF_FF80_8200_0000),
        )
        .unwrap();
    let b = s
        .create_task(
            noop_entry,
            0,
            TaskArgs::default(),
            VirtAddr::new(0xFFFF_FF80_8300_0000),
        )
        .unwrap();

    // Drive preemption at 100 Hz for ten simulated seconds and count how
    // often each task holds the CPU at tick time.
    let mut frame = CpuContext::zeroed();
    let mut now = 0u64;
    let (mut on_a, mut on_b) = (0u64, 0u64);
    for _ in 0..1000 {
        now += 10_000_000;
        s.tick_preempt(&mut frame, now);
        match s.current().unwrap() {
            t if t == a => on_a += 1,
            t if t == b => on_b += 1,
            _ => {}
        }
    }
    let total = on_a + on_b;
    assert!(total >= 990, "idle held the CPU: {} ticks", total);
    // Within 10% of a 1:1 split.
    let (lo, hi) = if on_a < on_b { (on_a, on_b) } else { (on_b, on_a) };
    assert!(
        hi - lo <= total / 10,
        "unfair dispatch: {} vs {}",
        on_a,
        on_b
    );
}

#[test]
fn kill_self_via_syscall_keeps_system_alive() {
    let mut s = Scheduler::new();
    s.init();
    for _ in 0..3 {
        s.create_task(
            noop_entry,
            0,
            TaskArgs::default(),
            VirtAddr::new(0xFFFF_FF80_8400_0000),
        )
        .unwrap();
    }

    let mut frame = CpuContext::zeroed();
    s.schedule_preempt(&mut frame, 1_000);
    let running = s.current().unwrap();
    let pid = s.task(running).pid;

    // The running task asks to kill its own PID.
    frame.x[8] = syscall::SYS_KILL;
    frame.x[0] = pid as u64;
    syscall::handle_with(&mut s, &mut frame, 2_000);

    // Zombie, still findable; others keep running; nothing hangs.
    let zombie = s.find_by_pid(pid).unwrap();
    assert_eq!(s.task(zombie).state, crate::sched::task::TaskState::Zombie);
    let mut now = 2_000u64;
    let mut distinct = Vec::new();
    for _ in 0..50 {
        now += 10_000_000;
        s.tick_preempt(&mut frame, now);
        let cur = s.current().unwrap();
        assert_ne!(cur, zombie);
        if !distinct.contains(&cur) {
            distinct.push(cur);
        }
    }
    // The two survivors share the CPU.
    assert!(distinct.len() >= 2);
}
