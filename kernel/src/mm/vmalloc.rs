//! Guarded kernel heap (`vmalloc`).
//!
//! Every allocation is laid out as `[guard page | data pages | guard page]`
//! inside the dedicated window `[VMALLOC_START, VMALLOC_END)`. Data pages
//! are fresh physical frames mapped read-write, normal-cacheable and
//! privileged-execute-never; the guards are mapped with no write permission
//! and PXN so both overruns and stray instruction fetches fault.
//!
//! Virtual space is recycled through a free list backed by a static block
//! pool: allocation is a best-fit scan (ties broken by first encountered)
//! with a bump pointer extending the used region on a miss, and every free
//! re-inserts its range and then coalesces adjacent blocks to a fixpoint.
//!
//! A failure in the middle of an allocation unwinds completely: every page
//! and guard already mapped is unmapped and returned to the frame allocator
//! before `None` is reported.

use spin::Mutex;

use super::{
    frame_allocator::{BitmapFrameAllocator, FRAME_ALLOCATOR},
    pages_for,
    vmm::{MapAttrs, Vmm, KERNEL_VMM},
    VirtAddr, PAGE_SIZE, VMALLOC_END, VMALLOC_START,
};

/// One guard page on each side of every allocation.
pub const GUARD_SIZE: u64 = PAGE_SIZE;

/// Capacity of the static free-block pool.
const FREE_POOL_CAP: usize = 256;

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    va: u64,
    size: u64,
}

/// Allocator state: free blocks plus the bump pointer for untouched window
/// space.
pub struct Vmalloc {
    blocks: [Option<FreeBlock>; FREE_POOL_CAP],
    next: u64,
}

impl Vmalloc {
    /// Create an allocator with the whole window untouched.
    pub const fn new() -> Self {
        Self {
            blocks: [const { None }; FREE_POOL_CAP],
            next: VMALLOC_START,
        }
    }

    /// Allocate `size` bytes (rounded up to whole pages) with guard pages.
    ///
    /// Returns the virtual address of the first data byte, or `None` on
    /// exhaustion of the window, the frame allocator, or the VMA pool.
    pub fn alloc(
        &mut self,
        vmm: &mut Vmm,
        pmm: &mut BitmapFrameAllocator,
        size: u64,
    ) -> Option<VirtAddr> {
        if size == 0 {
            return None;
        }

        let pages = pages_for(size);
        let data_size = pages * PAGE_SIZE;
        let total_size = data_size + 2 * GUARD_SIZE;

        let base_va = self.find_free_space(total_size)?;
        let data_va = base_va + GUARD_SIZE;

        let guard_attrs = MapAttrs::PXN;
        let data_attrs = MapAttrs::R | MapAttrs::W | MapAttrs::NORMAL | MapAttrs::PXN;

        // Leading guard.
        let Some(guard1) = pmm.alloc_page() else {
            self.add_free_space(base_va, total_size);
            return None;
        };
        if vmm
            .map(
                VirtAddr::new(base_va),
                guard1,
                GUARD_SIZE,
                guard_attrs,
                &mut *pmm,
            )
            .is_err()
        {
            pmm.free_page(guard1);
            self.add_free_space(base_va, total_size);
            return None;
        }

        // Data pages, each backed by its own frame.
        for i in 0..pages {
            let va = VirtAddr::new(data_va + i * PAGE_SIZE);
            let page = pmm.alloc_page();
            let mapped = match page {
                Some(pa) => vmm.map(va, pa, PAGE_SIZE, data_attrs, &mut *pmm).is_ok(),
                None => false,
            };
            if !mapped {
                if let Some(pa) = page {
                    pmm.free_page(pa);
                }
                self.unwind(vmm, pmm, base_va, data_va, i);
                self.add_free_space(base_va, total_size);
                return None;
            }
        }

        // Trailing guard.
        let tail_va = VirtAddr::new(data_va + data_size);
        let guard2 = pmm.alloc_page();
        let mapped = match guard2 {
            Some(pa) => vmm
                .map(tail_va, pa, GUARD_SIZE, guard_attrs, &mut *pmm)
                .is_ok(),
            None => false,
        };
        if !mapped {
            if let Some(pa) = guard2 {
                pmm.free_page(pa);
            }
            self.unwind(vmm, pmm, base_va, data_va, pages);
            self.add_free_space(base_va, total_size);
            return None;
        }

        Some(VirtAddr::new(data_va))
    }

    /// Free an allocation made with the same `size`.
    pub fn free(&mut self, vmm: &mut Vmm, pmm: &mut BitmapFrameAllocator, va: VirtAddr, size: u64) {
        if va.as_u64() == 0 || size == 0 {
            return;
        }

        let pages = pages_for(size);
        let data_size = pages * PAGE_SIZE;
        let data_va = va.as_u64();
        let base_va = data_va - GUARD_SIZE;
        let total_size = data_size + 2 * GUARD_SIZE;

        for i in 0..pages {
            Self::release_page(vmm, pmm, data_va + i * PAGE_SIZE);
        }
        Self::release_page(vmm, pmm, base_va);
        Self::release_page(vmm, pmm, data_va + data_size);

        self.add_free_space(base_va, total_size);
    }

    /// Number of blocks currently on the free list.
    pub fn free_block_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    fn release_page(vmm: &mut Vmm, pmm: &mut BitmapFrameAllocator, va: u64) {
        let va = VirtAddr::new(va);
        if vmm.is_mapped(va) {
            let pa = vmm.virt_to_phys(va);
            if vmm.unmap(va, PAGE_SIZE).is_ok() {
                pmm.free_page(pa);
            }
        }
    }

    /// Undo a partially built allocation: `mapped_pages` data pages plus the
    /// leading guard.
    fn unwind(
        &mut self,
        vmm: &mut Vmm,
        pmm: &mut BitmapFrameAllocator,
        base_va: u64,
        data_va: u64,
        mapped_pages: u64,
    ) {
        for j in 0..mapped_pages {
            Self::release_page(vmm, pmm, data_va + j * PAGE_SIZE);
        }
        Self::release_page(vmm, pmm, base_va);
    }

    /// Best-fit search over the free list; on a miss, extend the used
    /// region with the bump pointer.
    fn find_free_space(&mut self, size: u64) -> Option<u64> {
        let mut best: Option<usize> = None;
        for (i, slot) in self.blocks.iter().enumerate() {
            if let Some(b) = slot {
                let better = match best {
                    Some(j) => self.blocks[j].map(|prev| b.size < prev.size).unwrap_or(true),
                    None => true,
                };
                if b.size >= size && better {
                    best = Some(i);
                }
            }
        }

        if let Some(i) = best {
            let mut b = self.blocks[i].take().expect("free block vanished");
            let va = b.va;
            if b.size > size {
                b.va += size;
                b.size -= size;
                self.blocks[i] = Some(b);
            }
            return Some(va);
        }

        if self.next + size > VMALLOC_END {
            return None;
        }
        let va = self.next;
        self.next += size;
        Some(va)
    }

    /// Insert `[va, va+size)` into the free list, then merge adjacent
    /// blocks until no pair remains mergeable.
    fn add_free_space(&mut self, va: u64, size: u64) {
        let Some(slot) = self.blocks.iter().position(|b| b.is_none()) else {
            // Pool exhausted: the virtual range leaks.
            log::warn!("vmalloc: free-block pool full, leaking {:#x}", va);
            return;
        };
        self.blocks[slot] = Some(FreeBlock { va, size });
        self.coalesce();
    }

    fn coalesce(&mut self) {
        loop {
            let mut merged = false;
            'outer: for i in 0..FREE_POOL_CAP {
                let Some(a) = self.blocks[i] else { continue };
                for j in 0..FREE_POOL_CAP {
                    if i == j {
                        continue;
                    }
                    let Some(b) = self.blocks[j] else { continue };
                    if a.va + a.size == b.va {
                        self.blocks[i] = Some(FreeBlock {
                            va: a.va,
                            size: a.size + b.size,
                        });
                        self.blocks[j] = None;
                        merged = true;
                        break 'outer;
                    }
                }
            }
            if !merged {
                return;
            }
        }
    }
}

impl Default for Vmalloc {
    fn default() -> Self {
        Self::new()
    }
}

/// Global heap state behind the kernel-wide lock order heap -> vmm -> pmm.
pub static KERNEL_HEAP: Mutex<Vmalloc> = Mutex::new(Vmalloc::new());

/// Allocate `size` bytes from the global kernel heap.
pub fn vmalloc(size: u64) -> Option<VirtAddr> {
    let mut heap = KERNEL_HEAP.lock();
    let mut vmm = KERNEL_VMM.lock();
    let mut pmm = FRAME_ALLOCATOR.lock();
    heap.alloc(&mut vmm, &mut pmm, size)
}

/// Return `size` bytes at `va` to the global kernel heap.
pub fn vfree(va: VirtAddr, size: u64) {
    let mut heap = KERNEL_HEAP.lock();
    let mut vmm = KERNEL_VMM.lock();
    let mut pmm = FRAME_ALLOCATOR.lock();
    heap.free(&mut vmm, &mut pmm, va, size)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate alloc;

    use alloc::boxed::Box;

    use super::super::MemoryRegion;
    use super::*;

    struct Fixture {
        heap: Vmalloc,
        vmm: Vmm,
        pmm: Box<BitmapFrameAllocator>,
    }

    impl Fixture {
        fn new(ram_pages: u64) -> Self {
            let mut pmm = Box::new(BitmapFrameAllocator::new());
            pmm.init(MemoryRegion::new(0x4000_0000, ram_pages * PAGE_SIZE), &[]);
            Self {
                heap: Vmalloc::new(),
                vmm: Vmm::new(),
                pmm,
            }
        }

        fn alloc(&mut self, size: u64) -> Option<VirtAddr> {
            self.heap.alloc(&mut self.vmm, &mut self.pmm, size)
        }

        fn free(&mut self, va: VirtAddr, size: u64) {
            self.heap.free(&mut self.vmm, &mut self.pmm, va, size)
        }
    }

    #[test]
    fn zero_size_returns_none() {
        let mut fx = Fixture::new(64);
        assert!(fx.alloc(0).is_none());
    }

    #[test]
    fn layout_has_guards_between_allocations() {
        let mut fx = Fixture::new(64);
        let a = fx.alloc(PAGE_SIZE).unwrap();
        let b = fx.alloc(PAGE_SIZE).unwrap();
        // First data page sits one guard past the window start.
        assert_eq!(a.as_u64(), VMALLOC_START + GUARD_SIZE);
        // a: [guard|page|guard] = 3 pages, then b's guard.
        assert_eq!(b.as_u64(), a.as_u64() + 3 * PAGE_SIZE);
        // Guards are mapped (fault-generating attrs), data is mapped R/W.
        assert!(fx.vmm.is_mapped(VirtAddr::new(a.as_u64() - PAGE_SIZE)));
        assert!(fx.vmm.is_mapped(a));
        assert!(fx.vmm.is_mapped(VirtAddr::new(a.as_u64() + PAGE_SIZE)));
    }

    #[test]
    fn guarded_heap_round_trip() {
        let mut fx = Fixture::new(256);
        let f0 = fx.pmm.free_pages_count();

        let a = fx.alloc(4096).unwrap();
        let b = fx.alloc(8192).unwrap();
        let c = fx.alloc(4096).unwrap();
        // a: 3 pages, b: 4 pages, c: 3 pages.
        assert_eq!(fx.pmm.free_pages_count(), f0 - 10);

        fx.free(b, 8192);
        // Freed virtual range is reused for an equal-size request.
        let d = fx.alloc(8192).unwrap();
        assert_eq!(d, b);

        fx.free(a, 4096);
        fx.free(d, 8192);
        fx.free(c, 4096);
        assert_eq!(fx.pmm.free_pages_count(), f0);
        assert!(fx.pmm.check());
        assert_eq!(fx.vmm.vma_count(), 0);
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_hole() {
        let mut fx = Fixture::new(256);
        // Create two holes: one of 6 pages (8 KiB data) and one of 3 pages
        // (4 KiB data), separated by live allocations.
        let big = fx.alloc(2 * PAGE_SIZE).unwrap(); // 4-page footprint
        let _keep1 = fx.alloc(PAGE_SIZE).unwrap();
        let small = fx.alloc(PAGE_SIZE).unwrap(); // 3-page footprint
        let _keep2 = fx.alloc(PAGE_SIZE).unwrap();
        fx.free(big, 2 * PAGE_SIZE);
        fx.free(small, PAGE_SIZE);

        // A 4 KiB request fits both holes; best fit picks the smaller one.
        let again = fx.alloc(PAGE_SIZE).unwrap();
        assert_eq!(again, small);
    }

    #[test]
    fn mid_allocation_oom_unwinds_completely() {
        // 3 free pages cannot satisfy guard + 2 data + guard.
        let mut fx = Fixture::new(3);
        let f0 = fx.pmm.free_pages_count();
        assert!(fx.alloc(2 * PAGE_SIZE).is_none());
        assert_eq!(fx.pmm.free_pages_count(), f0);
        assert_eq!(fx.vmm.vma_count(), 0);
        assert!(fx.pmm.check());

        // A smaller request still succeeds afterwards.
        assert!(fx.alloc(PAGE_SIZE).is_some());
    }

    #[test]
    fn coalesce_rebuilds_single_block() {
        let mut heap = Vmalloc::new();
        // Tile [base, base + 6 pages) out of order; the list must collapse
        // to exactly one block.
        let base = VMALLOC_START;
        heap.add_free_space(base + 2 * PAGE_SIZE, PAGE_SIZE);
        heap.add_free_space(base + 5 * PAGE_SIZE, PAGE_SIZE);
        heap.add_free_space(base, 2 * PAGE_SIZE);
        heap.add_free_space(base + 3 * PAGE_SIZE, 2 * PAGE_SIZE);
        assert_eq!(heap.free_block_count(), 1);
        let blk = heap.blocks.iter().flatten().next().unwrap();
        assert_eq!(blk.va, base);
        assert_eq!(blk.size, 6 * PAGE_SIZE);
    }

    #[test]
    fn freed_neighbours_coalesce() {
        let mut fx = Fixture::new(256);
        let a = fx.alloc(PAGE_SIZE).unwrap();
        let b = fx.alloc(PAGE_SIZE).unwrap();
        let c = fx.alloc(PAGE_SIZE).unwrap();
        fx.free(a, PAGE_SIZE);
        fx.free(c, PAGE_SIZE);
        assert_eq!(fx.heap.free_block_count(), 2);
        fx.free(b, PAGE_SIZE);
        // The middle range bridges the two outer ones.
        assert_eq!(fx.heap.free_block_count(), 1);
    }

    #[test]
    fn window_exhaustion_returns_none() {
        let mut heap = Vmalloc::new();
        // Consume the entire window via the bump pointer without touching
        // memory: ask find_free_space directly.
        let window = VMALLOC_END - VMALLOC_START;
        assert!(heap.find_free_space(window).is_some());
        assert!(heap.find_free_space(PAGE_SIZE).is_none());
    }
}
