//! Kernel virtual memory manager.
//!
//! Tracks every kernel mapping as a VMA node in a red-black tree keyed on
//! `va_start` and drives the page-table editor for the actual translation
//! entries. Overlap rejection works off the tree: only the predecessor and
//! successor of a candidate range can collide with it.
//!
//! Early in boot (and in host tests) no page-table editor is attached; the
//! VMA tree then carries the mappings alone and [`Vmm::virt_to_phys`] falls
//! back to identity for addresses outside any VMA, which is exactly the
//! pre-paging behavior the rest of the kernel expects.
//!
//! VMA nodes come from the tree's fixed pool -- the VMM never calls back
//! into the allocators it underpins.

use bitflags::bitflags;
use spin::Mutex;

use super::{
    frame_allocator::FrameSource,
    page_table::{PageTableEditor, PteFlags, MAIR_IDX_DEVICE, MAIR_IDX_NORMAL, MAIR_IDX_NORMAL_NC},
    PhysAddr, VirtAddr, PAGE_SIZE,
};
use crate::{
    error::{KernelError, KernelResult},
    rbtree::RbTree,
};

/// Capacity of the VMA node pool.
pub const VMA_POOL_CAP: usize = 128;

bitflags! {
    /// Mapping attributes at the VMM level. Translated to architectural
    /// descriptor bits when the page tables are programmed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapAttrs: u32 {
        /// Readable.
        const R = 1 << 0;
        /// Writable.
        const W = 1 << 1;
        /// Executable (privileged).
        const X = 1 << 2;
        /// Device-nGnRnE memory.
        const DEVICE = 1 << 3;
        /// Normal, write-back cacheable memory.
        const NORMAL = 1 << 4;
        /// Unprivileged execute-never.
        const UXN = 1 << 5;
        /// Privileged execute-never.
        const PXN = 1 << 6;
    }
}

impl MapAttrs {
    /// Architectural descriptor bits for these attributes.
    pub fn to_pte_flags(self) -> PteFlags {
        let mut flags = PteFlags::SH_INNER;
        if !self.contains(Self::W) {
            flags |= PteFlags::RO;
        }
        if self.contains(Self::DEVICE) {
            flags |= PteFlags::attr_index(MAIR_IDX_DEVICE);
        } else if self.contains(Self::NORMAL) {
            flags |= PteFlags::attr_index(MAIR_IDX_NORMAL);
        } else {
            flags |= PteFlags::attr_index(MAIR_IDX_NORMAL_NC);
        }
        if self.contains(Self::UXN) {
            flags |= PteFlags::UXN;
        }
        if self.contains(Self::PXN) || !self.contains(Self::X) {
            flags |= PteFlags::PXN;
        }
        flags
    }
}

/// Payload of a VMA tree node; the key is `va_start`.
#[derive(Debug, Clone, Copy)]
struct VmaData {
    pa: u64,
    size: u64,
    attrs: MapAttrs,
}

/// Public view of one VMA, as yielded by [`Vmm::vmas`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    pub va: u64,
    pub pa: u64,
    pub size: u64,
    pub attrs: MapAttrs,
}

/// The kernel address-space manager.
pub struct Vmm {
    vmas: RbTree<u64, VmaData, VMA_POOL_CAP>,
    editor: Option<PageTableEditor>,
}

impl Vmm {
    /// Create an empty VMM with no page-table editor attached.
    pub const fn new() -> Self {
        Self {
            vmas: RbTree::new(),
            editor: None,
        }
    }

    /// Attach the page-table editor. From this point on, `map`, `unmap`
    /// and `protect` program the translation tables as well as the tree.
    pub fn attach_editor(&mut self, editor: PageTableEditor) {
        self.editor = Some(editor);
    }

    /// Map `[va, va+size)` to `[pa, pa+size)` with `attrs`.
    pub fn map(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        size: u64,
        attrs: MapAttrs,
        frames: &mut dyn FrameSource,
    ) -> KernelResult<()> {
        if size == 0 {
            return Err(KernelError::InvalidArgument {
                name: "size",
                value: "zero",
            });
        }
        if !va.is_page_aligned() || size % PAGE_SIZE != 0 {
            return Err(KernelError::Misaligned { addr: va.as_u64() });
        }
        if !pa.is_page_aligned() {
            return Err(KernelError::Misaligned { addr: pa.as_u64() });
        }

        let va = va.as_u64();
        let pa = pa.as_u64();

        // Only the predecessor and the successor can overlap the candidate.
        let pred = self.vmas.floor(&va);
        if let Some(p) = pred {
            if Self::overlaps(self.vmas.key(p), self.vmas.value(p).size, va, size) {
                return Err(KernelError::Overlap { va, size });
            }
        }
        let succ = match pred {
            Some(p) => self.vmas.successor(p),
            None => self.vmas.first(),
        };
        if let Some(s) = succ {
            if Self::overlaps(self.vmas.key(s), self.vmas.value(s).size, va, size) {
                return Err(KernelError::Overlap { va, size });
            }
        }

        let node = self
            .vmas
            .insert(va, VmaData { pa, size, attrs })
            .ok_or(KernelError::OutOfMemory {
                resource: "VMA nodes",
            })?;

        if let Some(editor) = self.editor.as_mut() {
            let pte = attrs.to_pte_flags();
            let mut off = 0;
            while off < size {
                if let Err(e) = editor.map_page(
                    VirtAddr::new(va + off),
                    PhysAddr::new(pa + off),
                    pte,
                    frames,
                ) {
                    // Unwind the partially programmed range and the node.
                    let mut back = 0;
                    while back < off {
                        let _ = editor.unmap_page(VirtAddr::new(va + back));
                        back += PAGE_SIZE;
                    }
                    self.vmas.remove(node);
                    return Err(e);
                }
                off += PAGE_SIZE;
            }
        }
        Ok(())
    }

    /// Remove the mapping that starts at `va` and spans exactly `size`.
    pub fn unmap(&mut self, va: VirtAddr, size: u64) -> KernelResult<()> {
        if size == 0 {
            return Err(KernelError::InvalidArgument {
                name: "size",
                value: "zero",
            });
        }
        if !va.is_page_aligned() || size % PAGE_SIZE != 0 {
            return Err(KernelError::Misaligned { addr: va.as_u64() });
        }

        let va = va.as_u64();
        let node = self
            .vmas
            .find(&va)
            .filter(|&n| self.vmas.value(n).size == size)
            .ok_or(KernelError::NotFound {
                resource: "VMA",
                id: va,
            })?;
        self.vmas.remove(node);

        if let Some(editor) = self.editor.as_mut() {
            let mut off = 0;
            while off < size {
                // A leaf may legitimately be absent if the VMA predates the
                // editor; clearing is best effort.
                let _ = editor.unmap_page(VirtAddr::new(va + off));
                off += PAGE_SIZE;
            }
            crate::arch::tlb_flush_range(va, size);
        }
        Ok(())
    }

    /// Rewrite the attributes of the mapping `[va, va+size)` (exact match).
    pub fn protect(&mut self, va: VirtAddr, size: u64, attrs: MapAttrs) -> KernelResult<()> {
        if size == 0 {
            return Err(KernelError::InvalidArgument {
                name: "size",
                value: "zero",
            });
        }
        if !va.is_page_aligned() || size % PAGE_SIZE != 0 {
            return Err(KernelError::Misaligned { addr: va.as_u64() });
        }

        let va = va.as_u64();
        let node = self
            .vmas
            .find(&va)
            .filter(|&n| self.vmas.value(n).size == size)
            .ok_or(KernelError::NotFound {
                resource: "VMA",
                id: va,
            })?;
        self.vmas.value_mut(node).attrs = attrs;

        if let Some(editor) = self.editor.as_mut() {
            let pte = attrs.to_pte_flags();
            let mut off = 0;
            while off < size {
                let _ = editor.update_attrs(VirtAddr::new(va + off), pte);
                off += PAGE_SIZE;
            }
            crate::arch::tlb_flush_range(va, size);
        }
        Ok(())
    }

    /// Translate a virtual address.
    ///
    /// If a VMA covers `va`, translate through its physical base; otherwise
    /// assume identity (early-boot behavior before any mapping exists).
    pub fn virt_to_phys(&self, va: VirtAddr) -> PhysAddr {
        let va = va.as_u64();
        if let Some(n) = self.vmas.floor(&va) {
            let start = self.vmas.key(n);
            let data = self.vmas.value(n);
            if va < start + data.size {
                return PhysAddr::new(data.pa + (va - start));
            }
        }
        PhysAddr::new(va)
    }

    /// Whether any VMA covers `va`.
    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        let va = va.as_u64();
        match self.vmas.floor(&va) {
            Some(n) => va < self.vmas.key(n) + self.vmas.value(n).size,
            None => false,
        }
    }

    /// Iterate the VMAs in address order.
    pub fn vmas(&self) -> VmaIter<'_> {
        VmaIter {
            vmm: self,
            cur: self.vmas.first(),
        }
    }

    /// Log every VMA, in address order.
    pub fn dump(&self) {
        for vma in self.vmas() {
            log::info!(
                "vma {:#x}..{:#x} -> {:#x} attrs={:?}",
                vma.va,
                vma.va + vma.size,
                vma.pa,
                vma.attrs
            );
        }
    }

    /// Number of live VMAs.
    pub fn vma_count(&self) -> usize {
        self.vmas.len()
    }

    fn overlaps(start: u64, size: u64, va: u64, len: u64) -> bool {
        !(va + len <= start || start + size <= va)
    }
}

impl Default for Vmm {
    fn default() -> Self {
        Self::new()
    }
}

/// In-order VMA iterator, see [`Vmm::vmas`].
pub struct VmaIter<'a> {
    vmm: &'a Vmm,
    cur: Option<u32>,
}

impl Iterator for VmaIter<'_> {
    type Item = Vma;

    fn next(&mut self) -> Option<Vma> {
        let id = self.cur?;
        self.cur = self.vmm.vmas.successor(id);
        let data = self.vmm.vmas.value(id);
        Some(Vma {
            va: self.vmm.vmas.key(id),
            pa: data.pa,
            size: data.size,
            attrs: data.attrs,
        })
    }
}

/// Global kernel VMM. The boot composer attaches the page-table editor once
/// the MMU tables exist.
pub static KERNEL_VMM: Mutex<Vmm> = Mutex::new(Vmm::new());

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;

    use super::*;

    /// Frame source for tests that never allocates (no editor attached).
    struct NoFrames;

    impl FrameSource for NoFrames {
        fn alloc_frame(&mut self) -> Option<PhysAddr> {
            None
        }
    }

    const RW: MapAttrs = MapAttrs::R.union(MapAttrs::W);

    fn map(vmm: &mut Vmm, va: u64, pa: u64, size: u64) -> KernelResult<()> {
        vmm.map(VirtAddr::new(va), PhysAddr::new(pa), size, RW, &mut NoFrames)
    }

    #[test]
    fn map_and_translate() {
        let mut vmm = Vmm::new();
        map(&mut vmm, 0xFFFF_FF80_8000_1000, 0x4000_0000, 0x2000).unwrap();

        let pa = vmm.virt_to_phys(VirtAddr::new(0xFFFF_FF80_8000_1800));
        assert_eq!(pa.as_u64(), 0x4000_0800);
        // Past the end of the VMA: identity fallback.
        let pa = vmm.virt_to_phys(VirtAddr::new(0xFFFF_FF80_8000_3000));
        assert_eq!(pa.as_u64(), 0xFFFF_FF80_8000_3000);
    }

    #[test]
    fn identity_fallback_with_empty_tree() {
        let vmm = Vmm::new();
        assert_eq!(vmm.virt_to_phys(VirtAddr::new(0x1234)).as_u64(), 0x1234);
        assert!(!vmm.is_mapped(VirtAddr::new(0x1234)));
    }

    #[test]
    fn rejects_bad_arguments() {
        let mut vmm = Vmm::new();
        assert!(matches!(
            map(&mut vmm, 0x1000, 0x2000, 0),
            Err(KernelError::InvalidArgument { .. })
        ));
        assert!(matches!(
            map(&mut vmm, 0x1001, 0x2000, 0x1000),
            Err(KernelError::Misaligned { .. })
        ));
        assert!(matches!(
            map(&mut vmm, 0x1000, 0x2001, 0x1000),
            Err(KernelError::Misaligned { .. })
        ));
        assert!(matches!(
            map(&mut vmm, 0x1000, 0x2000, 0x1234),
            Err(KernelError::Misaligned { .. })
        ));
    }

    #[test]
    fn overlap_rejected_both_sides() {
        let mut vmm = Vmm::new();
        map(&mut vmm, 0xFFFF_FF80_8000_1000, 0x10_0000, 0x2000).unwrap();

        // Tail collides with the existing mapping's head.
        assert!(matches!(
            map(&mut vmm, 0xFFFF_FF80_8000_0000, 0x20_0000, 0x2000),
            Err(KernelError::Overlap { .. })
        ));
        // Head collides with the existing mapping's tail.
        assert!(matches!(
            map(&mut vmm, 0xFFFF_FF80_8000_2000, 0x30_0000, 0x1000),
            Err(KernelError::Overlap { .. })
        ));
        // Fully inside.
        assert!(matches!(
            map(&mut vmm, 0xFFFF_FF80_8000_1000, 0x40_0000, 0x1000),
            Err(KernelError::Overlap { .. })
        ));
        // The original mapping still resolves.
        assert_eq!(
            vmm.virt_to_phys(VirtAddr::new(0xFFFF_FF80_8000_1000)).as_u64(),
            0x10_0000
        );
        assert_eq!(vmm.vma_count(), 1);

        // Adjacent on both sides is fine.
        map(&mut vmm, 0xFFFF_FF80_8000_0000, 0x50_0000, 0x1000).unwrap();
        map(&mut vmm, 0xFFFF_FF80_8000_3000, 0x60_0000, 0x1000).unwrap();
        assert_eq!(vmm.vma_count(), 3);
    }

    #[test]
    fn unmap_requires_exact_match() {
        let mut vmm = Vmm::new();
        map(&mut vmm, 0xFFFF_FF80_8000_1000, 0x10_0000, 0x2000).unwrap();

        // Wrong size.
        assert!(matches!(
            vmm.unmap(VirtAddr::new(0xFFFF_FF80_8000_1000), 0x1000),
            Err(KernelError::NotFound { .. })
        ));
        // Wrong start.
        assert!(matches!(
            vmm.unmap(VirtAddr::new(0xFFFF_FF80_8000_2000), 0x1000),
            Err(KernelError::NotFound { .. })
        ));
        // Exact match drops the VMA; map/unmap leaves no trace.
        vmm.unmap(VirtAddr::new(0xFFFF_FF80_8000_1000), 0x2000)
            .unwrap();
        assert_eq!(vmm.vma_count(), 0);
        assert!(!vmm.is_mapped(VirtAddr::new(0xFFFF_FF80_8000_1000)));
    }

    #[test]
    fn protect_rewrites_attrs() {
        let mut vmm = Vmm::new();
        map(&mut vmm, 0xFFFF_FF80_8000_1000, 0x10_0000, 0x1000).unwrap();
        vmm.protect(VirtAddr::new(0xFFFF_FF80_8000_1000), 0x1000, MapAttrs::R)
            .unwrap();
        let vma: Vec<Vma> = vmm.vmas().collect();
        assert_eq!(vma[0].attrs, MapAttrs::R);

        assert!(vmm
            .protect(VirtAddr::new(0xFFFF_FF80_8000_1000), 0x2000, MapAttrs::R)
            .is_err());
    }

    #[test]
    fn attrs_translate_to_descriptor_bits() {
        let pte = (MapAttrs::R | MapAttrs::W | MapAttrs::NORMAL | MapAttrs::PXN).to_pte_flags();
        assert!(pte.contains(PteFlags::PXN));
        assert!(!pte.contains(PteFlags::RO));
        assert!(pte.contains(PteFlags::SH_INNER));

        // Read-only mapping sets AP[2]; guard pages (PXN only) end up
        // read-only and privileged-execute-never.
        let pte = MapAttrs::PXN.to_pte_flags();
        assert!(pte.contains(PteFlags::RO));
        assert!(pte.contains(PteFlags::PXN));
    }

    #[test]
    fn dump_iterates_in_address_order() {
        let mut vmm = Vmm::new();
        for (i, va) in [0xFFFF_FF80_8000_5000u64, 0xFFFF_FF80_8000_1000, 0xFFFF_FF80_8000_3000]
            .into_iter()
            .enumerate()
        {
            map(&mut vmm, va, (i as u64 + 1) * 0x10_0000, 0x1000).unwrap();
        }
        let order: Vec<u64> = vmm.vmas().map(|v| v.va).collect();
        assert_eq!(
            order,
            [0xFFFF_FF80_8000_1000, 0xFFFF_FF80_8000_3000, 0xFFFF_FF80_8000_5000]
        );
    }
}
