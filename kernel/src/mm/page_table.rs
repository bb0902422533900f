//! AArch64 page-table editor.
//!
//! Four translation levels with 512 entries each; 48-bit virtual addresses
//! split 9+9+9+9+12. The editor operates on a root table by physical
//! address and reaches table memory through a configurable physical-to-
//! virtual offset (zero while the MMU is off or under an identity map, the
//! higher-half offset once paging is up). Intermediate tables are allocated
//! on demand from a [`FrameSource`]; unmapping clears leaves only and keeps
//! intermediate tables in place.
//!
//! Callers are responsible for TLB maintenance after edits (see
//! `arch::aarch64::mmu`).

use core::ptr;

use bitflags::bitflags;

use super::{frame_allocator::FrameSource, PhysAddr, VirtAddr, KERNEL_VIRT_BASE, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Entries per table at every level.
pub const TABLE_ENTRIES: usize = 512;

/// Output-address field of a descriptor, bits [47:12].
const PTE_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

bitflags! {
    /// AArch64 translation descriptor bits (the architectural subset this
    /// kernel uses).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Descriptor is valid.
        const VALID = 1 << 0;
        /// Points to a next-level table (levels 0-2).
        const TABLE = 1 << 1;
        /// Page descriptor (level 3; same bit position as TABLE).
        const PAGE = 1 << 1;
        /// AP[1]: accessible from EL0.
        const USER = 1 << 6;
        /// AP[2]: read-only.
        const RO = 1 << 7;
        /// Inner shareable.
        const SH_INNER = 3 << 8;
        /// Access flag; without it the first access faults.
        const AF = 1 << 10;
        /// Privileged execute-never.
        const PXN = 1 << 53;
        /// Unprivileged execute-never.
        const UXN = 1 << 54;
    }
}

/// MAIR attribute index for Device-nGnRnE memory.
pub const MAIR_IDX_DEVICE: u8 = 0;
/// MAIR attribute index for normal non-cacheable memory.
pub const MAIR_IDX_NORMAL_NC: u8 = 1;
/// MAIR attribute index for normal write-back cacheable memory.
pub const MAIR_IDX_NORMAL: u8 = 2;

impl PteFlags {
    /// Encode a MAIR attribute index (bits [4:2]).
    pub const fn attr_index(idx: u8) -> Self {
        Self::from_bits_retain((idx as u64 & 0x7) << 2)
    }
}

/// Editor over one 4-level page-table hierarchy.
///
/// Holds the root table's physical address plus the offset at which table
/// memory is addressable.
pub struct PageTableEditor {
    root: PhysAddr,
    phys_offset: u64,
}

impl PageTableEditor {
    /// Create an editor for the hierarchy rooted at `root`.
    ///
    /// # Safety
    ///
    /// `root` must point to a zero-initialized or well-formed table, and
    /// every physical table address reachable from it must be readable and
    /// writable at `pa + phys_offset` for the lifetime of the editor.
    pub unsafe fn new(root: PhysAddr, phys_offset: u64) -> Self {
        Self { root, phys_offset }
    }

    /// Physical address of the root table (for TTBR installation).
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Map the page containing `va` to the frame at `pa`.
    ///
    /// Intermediate tables are allocated from `frames` as needed; the leaf
    /// descriptor is written as `VALID | AF | PAGE | flags`. Re-mapping an
    /// existing leaf overwrites it.
    pub fn map_page(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        flags: PteFlags,
        frames: &mut dyn FrameSource,
    ) -> KernelResult<()> {
        let table = self.walk_alloc(va, frames)?;
        let idx = level_index(va.as_u64(), 3);
        let desc = (pa.as_u64() & PTE_ADDR_MASK)
            | (flags | PteFlags::VALID | PteFlags::AF | PteFlags::PAGE).bits();
        // SAFETY: `table` points at a live level-3 table per the editor's
        // construction contract; idx < 512 by masking. Volatile, because the
        // MMU reads these entries independently of the compiler's view.
        unsafe {
            ptr::write_volatile(table.add(idx), desc);
        }
        Ok(())
    }

    /// Clear the leaf for `va`, returning the physical address it mapped.
    ///
    /// Intermediate tables are left in place.
    pub fn unmap_page(&mut self, va: VirtAddr) -> KernelResult<PhysAddr> {
        let (table, idx) = self.walk_leaf(va)?;
        // SAFETY: `table` is a live level-3 table, idx < 512.
        let desc = unsafe { ptr::read_volatile(table.add(idx)) };
        if desc & PteFlags::VALID.bits() == 0 {
            return Err(KernelError::NotFound {
                resource: "mapping",
                id: va.as_u64(),
            });
        }
        // SAFETY: as above; clearing a leaf is always a valid edit.
        unsafe {
            ptr::write_volatile(table.add(idx), 0);
        }
        Ok(PhysAddr::new(desc & PTE_ADDR_MASK))
    }

    /// Rewrite the attribute bits of the leaf for `va`, preserving the
    /// mapped frame.
    pub fn update_attrs(&mut self, va: VirtAddr, flags: PteFlags) -> KernelResult<()> {
        let (table, idx) = self.walk_leaf(va)?;
        // SAFETY: `table` is a live level-3 table, idx < 512.
        let desc = unsafe { ptr::read_volatile(table.add(idx)) };
        if desc & PteFlags::VALID.bits() == 0 {
            return Err(KernelError::NotFound {
                resource: "mapping",
                id: va.as_u64(),
            });
        }
        let desc = (desc & PTE_ADDR_MASK)
            | (flags | PteFlags::VALID | PteFlags::AF | PteFlags::PAGE).bits();
        // SAFETY: as above.
        unsafe {
            ptr::write_volatile(table.add(idx), desc);
        }
        Ok(())
    }

    /// Map the physical range `[pa, pa+size)` at the higher-half alias
    /// `KERNEL_VIRT_BASE + pa`, page by page.
    pub fn map_region(
        &mut self,
        pa: PhysAddr,
        size: u64,
        flags: PteFlags,
        frames: &mut dyn FrameSource,
    ) -> KernelResult<()> {
        let start = super::align_down(pa.as_u64(), PAGE_SIZE);
        let end = super::align_up(pa.as_u64() + size, PAGE_SIZE);
        let mut off = 0;
        while start + off < end {
            self.map_page(
                VirtAddr::new(KERNEL_VIRT_BASE + start + off),
                PhysAddr::new(start + off),
                flags,
                frames,
            )?;
            off += PAGE_SIZE;
        }
        Ok(())
    }

    /// Software-walk `va` and return the physical address it maps to.
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let (table, idx) = self.walk_leaf(va).ok()?;
        // SAFETY: `table` is a live level-3 table, idx < 512.
        let desc = unsafe { ptr::read_volatile(table.add(idx)) };
        if desc & PteFlags::VALID.bits() == 0 {
            return None;
        }
        Some(PhysAddr::new(
            (desc & PTE_ADDR_MASK) | (va.as_u64() & (PAGE_SIZE - 1)),
        ))
    }

    /// Walk to the level-3 table for `va`, allocating missing intermediate
    /// tables. Returns a pointer to the level-3 table.
    fn walk_alloc(
        &mut self,
        va: VirtAddr,
        frames: &mut dyn FrameSource,
    ) -> KernelResult<*mut u64> {
        let mut table_pa = self.root.as_u64();
        for level in 0..3 {
            let table = self.table_ptr(table_pa);
            let idx = level_index(va.as_u64(), level);
            // SAFETY: `table` addresses a live table per the construction
            // contract; idx < 512 by masking.
            let entry = unsafe { ptr::read_volatile(table.add(idx)) };
            if entry & PteFlags::VALID.bits() == 0 {
                let frame = frames.alloc_frame().ok_or(KernelError::OutOfMemory {
                    resource: "page-table frames",
                })?;
                let next = self.table_ptr(frame.as_u64());
                // SAFETY: the frame was just handed out by the allocator and
                // is addressable at pa + phys_offset per the contract; a
                // fresh table must start out all-invalid.
                unsafe {
                    ptr::write_bytes(next, 0, TABLE_ENTRIES);
                }
                let desc =
                    (frame.as_u64() & PTE_ADDR_MASK) | (PteFlags::TABLE | PteFlags::VALID).bits();
                // SAFETY: as the read above.
                unsafe {
                    ptr::write_volatile(table.add(idx), desc);
                }
                table_pa = frame.as_u64();
            } else {
                table_pa = entry & PTE_ADDR_MASK;
            }
        }
        Ok(self.table_ptr(table_pa))
    }

    /// Walk to the level-3 table for `va` without allocating. Returns the
    /// table pointer and the leaf index.
    fn walk_leaf(&self, va: VirtAddr) -> KernelResult<(*mut u64, usize)> {
        let mut table_pa = self.root.as_u64();
        for level in 0..3 {
            let table = self.table_ptr(table_pa);
            let idx = level_index(va.as_u64(), level);
            // SAFETY: `table` addresses a live table; idx < 512.
            let entry = unsafe { ptr::read_volatile(table.add(idx)) };
            if entry & PteFlags::VALID.bits() == 0 {
                return Err(KernelError::NotFound {
                    resource: "page-table level",
                    id: va.as_u64(),
                });
            }
            table_pa = entry & PTE_ADDR_MASK;
        }
        Ok((self.table_ptr(table_pa), level_index(va.as_u64(), 3)))
    }

    fn table_ptr(&self, pa: u64) -> *mut u64 {
        (pa + self.phys_offset) as *mut u64
    }
}

/// Index into the level-`level` table for `va` (level 0 is the root).
pub fn level_index(va: u64, level: usize) -> usize {
    let shift = 39 - 9 * level;
    ((va >> shift) & 0x1FF) as usize
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate alloc;

    use alloc::{boxed::Box, vec::Vec};

    use super::*;

    /// Page-aligned backing store standing in for physical frames.
    #[repr(C, align(4096))]
    struct TestFrame([u8; 4096]);

    struct TestFrames {
        frames: Vec<Box<TestFrame>>,
    }

    impl TestFrames {
        fn new() -> Self {
            Self { frames: Vec::new() }
        }
    }

    impl FrameSource for TestFrames {
        fn alloc_frame(&mut self) -> Option<PhysAddr> {
            self.frames.push(Box::new(TestFrame([0; 4096])));
            let pa = self.frames.last().unwrap().as_ref() as *const TestFrame as u64;
            Some(PhysAddr::new(pa))
        }
    }

    fn editor(frames: &mut TestFrames) -> PageTableEditor {
        let root = frames.alloc_frame().unwrap();
        // SAFETY: test frames are real, zeroed host memory at offset 0.
        unsafe { PageTableEditor::new(root, 0) }
    }

    #[test]
    fn index_split_is_9_9_9_9() {
        let va = 0xFFFF_FF80_8004_3000u64;
        // Reassemble the address from its indices.
        let rebuilt = ((level_index(va, 0) as u64) << 39)
            | ((level_index(va, 1) as u64) << 30)
            | ((level_index(va, 2) as u64) << 21)
            | ((level_index(va, 3) as u64) << 12);
        assert_eq!(rebuilt, va & 0x0000_FFFF_FFFF_F000);
    }

    #[test]
    fn map_then_translate() {
        let mut frames = TestFrames::new();
        let mut ed = editor(&mut frames);

        let va = VirtAddr::new(0xFFFF_FF80_8000_1000);
        let pa = PhysAddr::new(0x4000_2000);
        ed.map_page(va, pa, PteFlags::attr_index(MAIR_IDX_NORMAL), &mut frames)
            .unwrap();

        assert_eq!(ed.translate(va), Some(pa));
        // Offsets within the page carry through.
        assert_eq!(
            ed.translate(VirtAddr::new(va.as_u64() + 0x123)),
            Some(PhysAddr::new(pa.as_u64() + 0x123))
        );
        // Neighbouring page is unmapped.
        assert_eq!(ed.translate(VirtAddr::new(va.as_u64() + 0x1000)), None);
        // Three intermediate tables were allocated beyond the root.
        assert_eq!(frames.frames.len(), 4);
    }

    #[test]
    fn unmap_clears_leaf_only() {
        let mut frames = TestFrames::new();
        let mut ed = editor(&mut frames);

        let va = VirtAddr::new(0xFFFF_FF80_8000_0000);
        let vb = VirtAddr::new(0xFFFF_FF80_8000_1000);
        ed.map_page(va, PhysAddr::new(0x1000), PteFlags::empty(), &mut frames)
            .unwrap();
        ed.map_page(vb, PhysAddr::new(0x2000), PteFlags::empty(), &mut frames)
            .unwrap();
        let tables_before = frames.frames.len();

        assert_eq!(ed.unmap_page(va).unwrap(), PhysAddr::new(0x1000));
        assert_eq!(ed.translate(va), None);
        // Sibling leaf in the same table survives; no table was freed or
        // allocated.
        assert_eq!(ed.translate(vb), Some(PhysAddr::new(0x2000)));
        assert_eq!(frames.frames.len(), tables_before);

        // Unmapping again reports the absence.
        assert!(ed.unmap_page(va).is_err());
    }

    #[test]
    fn remap_overwrites() {
        let mut frames = TestFrames::new();
        let mut ed = editor(&mut frames);
        let va = VirtAddr::new(0xFFFF_FF80_9000_0000);
        ed.map_page(va, PhysAddr::new(0x1000), PteFlags::empty(), &mut frames)
            .unwrap();
        ed.map_page(va, PhysAddr::new(0x5000), PteFlags::empty(), &mut frames)
            .unwrap();
        assert_eq!(ed.translate(va), Some(PhysAddr::new(0x5000)));
    }

    #[test]
    fn update_attrs_preserves_frame() {
        let mut frames = TestFrames::new();
        let mut ed = editor(&mut frames);
        let va = VirtAddr::new(0xFFFF_FF80_8000_3000);
        let pa = PhysAddr::new(0x7000);
        ed.map_page(va, pa, PteFlags::PXN, &mut frames).unwrap();
        ed.update_attrs(va, PteFlags::RO | PteFlags::PXN).unwrap();
        assert_eq!(ed.translate(va), Some(pa));

        // Attr update on an unmapped address is an error.
        assert!(ed
            .update_attrs(VirtAddr::new(0xFFFF_FF80_8888_0000), PteFlags::RO)
            .is_err());
    }

    #[test]
    fn map_region_uses_higher_half_alias() {
        let mut frames = TestFrames::new();
        let mut ed = editor(&mut frames);
        let pa = PhysAddr::new(0x4000_0000);
        ed.map_region(pa, 3 * PAGE_SIZE, PteFlags::attr_index(MAIR_IDX_NORMAL), &mut frames)
            .unwrap();
        for i in 0..3u64 {
            let va = VirtAddr::new(KERNEL_VIRT_BASE + 0x4000_0000 + i * PAGE_SIZE);
            assert_eq!(
                ed.translate(va),
                Some(PhysAddr::new(0x4000_0000 + i * PAGE_SIZE))
            );
        }
    }
}
