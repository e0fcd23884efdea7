//! SV39 page tables
//!
//! Three-level tables with 4 KiB, 2 MiB, and 1 GiB mappings. An entry whose
//! R/W/X bits are all clear is an interior node; W-without-R is a reserved
//! encoding and is rejected everywhere. Interior nodes carry the U/G bits of
//! the mapping that created them and later mappings must agree.

use bitflags::bitflags;

use super::{phys_to_virt, FrameAllocator, PhysAddr, VirtAddr, FRAME_SIZE};
use crate::error::MmError;

bitflags! {
    /// SV39 page-table entry flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
        /// Not-present marker (software, top bit)
        const NP = 1 << 63;
    }
}

const PTE_PPN_SHIFT: u64 = 10;
const PTE_PPN_MASK: u64 = ((1u64 << 44) - 1) << PTE_PPN_SHIFT;
const PTE_RWX_MASK: u64 = PteFlags::R.bits() | PteFlags::W.bits() | PteFlags::X.bits();

/// Entries per table
pub const PTE_COUNT: usize = FRAME_SIZE / core::mem::size_of::<Pte>();

/// Leaf permission bits, independent of the U/G attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rwx(u8);

impl Rwx {
    pub const NONE: Rwx = Rwx(0b000);
    pub const R: Rwx = Rwx(0b001);
    pub const W: Rwx = Rwx(0b010);
    pub const X: Rwx = Rwx(0b100);
    pub const RO: Rwx = Rwx(0b001);
    pub const RW: Rwx = Rwx(0b011);
    pub const RX: Rwx = Rwx(0b101);
    pub const RWX: Rwx = Rwx(0b111);

    pub const fn new(r: bool, w: bool, x: bool) -> Self {
        Rwx((r as u8) | ((w as u8) << 1) | ((x as u8) << 2))
    }

    pub const fn readable(self) -> bool {
        self.0 & 0b001 != 0
    }

    pub const fn writable(self) -> bool {
        self.0 & 0b010 != 0
    }

    pub const fn executable(self) -> bool {
        self.0 & 0b100 != 0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// The reserved W-without-R encoding.
    pub const fn is_reserved(self) -> bool {
        self.writable() && !self.readable()
    }

    const fn pte_bits(self) -> u64 {
        (self.0 as u64) << 1
    }

    const fn from_pte_bits(bits: u64) -> Self {
        Rwx(((bits >> 1) & 0b111) as u8)
    }
}

/// Page sizes a leaf can map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size1G,
}

impl PageSize {
    pub const fn bytes(self) -> usize {
        match self {
            PageSize::Size4K => 0x1000,
            PageSize::Size2M => 0x20_0000,
            PageSize::Size1G => 0x4000_0000,
        }
    }

    /// Table level at which this size is a leaf (0 = last level).
    pub const fn level(self) -> usize {
        match self {
            PageSize::Size4K => 0,
            PageSize::Size2M => 1,
            PageSize::Size1G => 2,
        }
    }

    const fn from_level(level: usize) -> Self {
        match level {
            2 => PageSize::Size1G,
            1 => PageSize::Size2M,
            _ => PageSize::Size4K,
        }
    }
}

/// A single page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    fn new_leaf(pa: PhysAddr, rwx: Rwx, user: bool, global: bool) -> Self {
        let mut flags = PteFlags::V;
        if user {
            flags |= PteFlags::U;
        }
        if global {
            flags |= PteFlags::G;
        }
        let ppn = (pa.as_usize() as u64 >> 12) << PTE_PPN_SHIFT;
        Pte(flags.bits() | rwx.pte_bits() | (ppn & PTE_PPN_MASK))
    }

    fn new_table(pa: PhysAddr, user: bool, global: bool) -> Self {
        // Interior node: valid, rwx = 000, creator's U/G.
        let mut flags = PteFlags::V;
        if user {
            flags |= PteFlags::U;
        }
        if global {
            flags |= PteFlags::G;
        }
        let ppn = (pa.as_usize() as u64 >> 12) << PTE_PPN_SHIFT;
        Pte(flags.bits() | (ppn & PTE_PPN_MASK))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    pub fn is_present(self) -> bool {
        self.is_valid() && !self.flags().contains(PteFlags::NP)
    }

    /// Leaf iff any of R/W/X is set.
    pub fn is_leaf(self) -> bool {
        self.0 & PTE_RWX_MASK != 0
    }

    pub fn rwx(self) -> Rwx {
        Rwx::from_pte_bits(self.0)
    }

    pub fn is_user(self) -> bool {
        self.flags().contains(PteFlags::U)
    }

    pub fn is_global(self) -> bool {
        self.flags().contains(PteFlags::G)
    }

    pub fn phys_addr(self) -> PhysAddr {
        PhysAddr((((self.0 & PTE_PPN_MASK) >> PTE_PPN_SHIFT) << 12) as usize)
    }
}

/// Mask selecting which attributes `modify_flags` updates.
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModifyMask: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        const U = 1 << 3;
        const G = 1 << 4;
        const NP = 1 << 5;
    }
}

impl ModifyMask {
    pub const RWX: ModifyMask = ModifyMask::R.union(ModifyMask::W).union(ModifyMask::X);
}

/// One SV39 page table, identified by its root frame.
pub struct PageTable {
    root: PhysAddr,
}

impl PageTable {
    /// Allocate a zeroed root.
    pub fn new(alloc: &mut FrameAllocator) -> Result<Self, MmError> {
        let root = alloc.alloc_zeroed_frame().ok_or(MmError::OutOfMemory)?;
        Ok(Self { root })
    }

    /// Adopt an existing root frame (the boot page table).
    pub fn from_root(root: PhysAddr) -> Self {
        Self { root }
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    fn entries(pa: PhysAddr) -> *mut [Pte; PTE_COUNT] {
        phys_to_virt(pa) as *mut [Pte; PTE_COUNT]
    }

    fn read_entry(pa: PhysAddr, index: usize) -> Pte {
        // SAFETY: pa is a live page-table frame owned by this table; the
        // kernel alias maps it.
        unsafe { (*Self::entries(pa))[index] }
    }

    fn write_entry(pa: PhysAddr, index: usize, pte: Pte) {
        // SAFETY: as in read_entry; single-hart kernel, no concurrent walker.
        unsafe {
            (*Self::entries(pa))[index] = pte;
        }
    }

    /// Walk the tree for `vaddr`. Pure read: never allocates.
    pub fn query_page(&self, vaddr: VirtAddr) -> Option<(Pte, PageSize)> {
        let mut table = self.root;
        for level in (0..=2).rev() {
            let pte = Self::read_entry(table, vaddr.vpn(level));
            if !pte.is_present() {
                return None;
            }
            if pte.is_leaf() {
                return Some((pte, PageSize::from_level(level)));
            }
            if level == 0 {
                // rwx = 000 at the last level is a malformed table.
                return None;
            }
            table = pte.phys_addr();
        }
        None
    }

    /// Translate `vaddr` to its physical address plus the bytes remaining in
    /// the containing page. Used by the kernel↔user copy routines.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<(PhysAddr, usize)> {
        let (pte, size) = self.query_page(vaddr)?;
        let bytes = size.bytes();
        let offset = vaddr.as_usize() % bytes;
        Some((pte.phys_addr().offset(offset), bytes - offset))
    }

    /// Map one page of the given size.
    pub fn map_page(
        &mut self,
        alloc: &mut FrameAllocator,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        size: PageSize,
        rwx: Rwx,
        user: bool,
        global: bool,
    ) -> Result<(), MmError> {
        if rwx.is_reserved() {
            return Err(MmError::WriteWithoutRead);
        }
        debug_assert!(!rwx.is_none(), "mapping with empty permissions");
        if vaddr.as_usize() % size.bytes() != 0 {
            return Err(MmError::Unaligned { addr: vaddr.as_usize() });
        }
        if !paddr.is_aligned(size.bytes()) {
            return Err(MmError::Unaligned { addr: paddr.as_usize() });
        }

        let mut table = self.root;
        let mut level = 2;
        while level > size.level() {
            let index = vaddr.vpn(level);
            let mut pte = Self::read_entry(table, index);
            if !pte.is_valid() {
                let frame = alloc.alloc_zeroed_frame().ok_or(MmError::OutOfMemory)?;
                pte = Pte::new_table(frame, user, global);
                Self::write_entry(table, index, pte);
            } else if pte.is_leaf() {
                log::debug!(
                    "page_table: huge page at level {level} blocks {:#x}",
                    vaddr.as_usize()
                );
                return Err(MmError::HugePageInTheWay { vaddr: vaddr.as_usize() });
            }
            if pte.is_user() != user || pte.is_global() != global {
                return Err(MmError::FlagMismatch { vaddr: vaddr.as_usize() });
            }
            table = pte.phys_addr();
            level -= 1;
        }

        Self::write_entry(
            table,
            vaddr.vpn(size.level()),
            Pte::new_leaf(paddr, rwx, user, global),
        );
        Ok(())
    }

    /// Map a physically contiguous range. The range is page-aligned first;
    /// with `use_huge` the largest naturally aligned block is preferred at
    /// every step (1 GiB, then 2 MiB, then 4 KiB).
    #[allow(clippy::too_many_arguments)]
    pub fn map_range(
        &mut self,
        alloc: &mut FrameAllocator,
        vstart: VirtAddr,
        pstart: PhysAddr,
        size: usize,
        rwx: Rwx,
        user: bool,
        global: bool,
        use_huge: bool,
    ) -> Result<(), MmError> {
        let mut va = vstart.align_down(FRAME_SIZE).as_usize();
        let mut pa = pstart.align_down(FRAME_SIZE).as_usize();
        let mut remaining = VirtAddr(size).align_up(FRAME_SIZE).as_usize();

        while remaining > 0 {
            let step = if use_huge {
                Self::pick_size(va, pa, remaining)
            } else {
                PageSize::Size4K
            };
            self.map_page(alloc, VirtAddr(va), PhysAddr(pa), step, rwx, user, global)?;
            va += step.bytes();
            pa += step.bytes();
            remaining -= step.bytes();
        }
        Ok(())
    }

    fn pick_size(va: usize, pa: usize, remaining: usize) -> PageSize {
        for size in [PageSize::Size1G, PageSize::Size2M] {
            let bytes = size.bytes();
            if remaining >= bytes && va % bytes == 0 && pa % bytes == 0 {
                return size;
            }
        }
        PageSize::Size4K
    }

    /// Update the attribute bits selected by `mask` on the leaf mapping
    /// `vaddr`, preserving the rest. Returns the leaf's page size.
    pub fn modify_flags(
        &mut self,
        vaddr: VirtAddr,
        mask: ModifyMask,
        rwx: Rwx,
        user: bool,
        global: bool,
    ) -> Result<PageSize, MmError> {
        let mut table = self.root;
        for level in (0..=2).rev() {
            let index = vaddr.vpn(level);
            let pte = Self::read_entry(table, index);
            if !pte.is_valid() {
                return Err(MmError::Unmapped { vaddr: vaddr.as_usize() });
            }
            if pte.is_leaf() {
                let updated = Self::apply_mask(pte, mask, rwx, user, global)?;
                Self::write_entry(table, index, updated);
                return Ok(PageSize::from_level(level));
            }
            if level == 0 {
                return Err(MmError::Unmapped { vaddr: vaddr.as_usize() });
            }
            table = pte.phys_addr();
        }
        Err(MmError::Unmapped { vaddr: vaddr.as_usize() })
    }

    /// Apply `modify_flags` across a range, stepping by the size of each
    /// leaf encountered (the range may mix page sizes).
    pub fn modify_range_flags(
        &mut self,
        vstart: VirtAddr,
        size: usize,
        mask: ModifyMask,
        rwx: Rwx,
        user: bool,
        global: bool,
    ) -> Result<(), MmError> {
        let mut va = vstart.align_down(FRAME_SIZE).as_usize();
        let end = vstart.as_usize() + size;
        while va < end {
            let leaf = self.modify_flags(VirtAddr(va), mask, rwx, user, global)?;
            va = (va & !(leaf.bytes() - 1)) + leaf.bytes();
        }
        Ok(())
    }

    fn apply_mask(
        pte: Pte,
        mask: ModifyMask,
        rwx: Rwx,
        user: bool,
        global: bool,
    ) -> Result<Pte, MmError> {
        let mut raw = pte.raw();
        let rwx_mask = (((mask.contains(ModifyMask::R) as u64) << 1)
            | ((mask.contains(ModifyMask::W) as u64) << 2)
            | ((mask.contains(ModifyMask::X) as u64) << 3)) as u64;
        raw = (raw & !rwx_mask) | (rwx.pte_bits() & rwx_mask);
        if Pte(raw).rwx().is_reserved() {
            return Err(MmError::WriteWithoutRead);
        }
        if mask.contains(ModifyMask::U) {
            raw = (raw & !PteFlags::U.bits()) | ((user as u64) << 4);
        }
        if mask.contains(ModifyMask::G) {
            raw = (raw & !PteFlags::G.bits()) | ((global as u64) << 5);
        }
        if mask.contains(ModifyMask::NP) {
            raw |= PteFlags::NP.bits();
        }
        Ok(Pte(raw))
    }

    /// Copy every valid top-level entry of `other` into this table. Used to
    /// graft the kernel mappings into a fresh task root; the kernel's
    /// regions and a task's user regions occupy disjoint top-level slots.
    pub fn copy_root_entries_from(&mut self, other: PhysAddr) {
        for index in 0..PTE_COUNT {
            let pte = Self::read_entry(other, index);
            if pte.is_valid() && !Self::read_entry(self.root, index).is_valid() {
                Self::write_entry(self.root, index, pte);
            }
        }
    }

    /// Free every interior table frame, including the root. Leaf targets
    /// are owned elsewhere (VMA backing, kernel image), and subtrees shared
    /// with the kernel root (grafted by `copy_root_entries_from`) stay
    /// untouched.
    pub fn release(self, alloc: &mut FrameAllocator) {
        let kernel_root = super::kernel_root();
        for index in 0..PTE_COUNT {
            let pte = Self::read_entry(self.root, index);
            if !pte.is_valid() || pte.is_leaf() {
                continue;
            }
            if let Some(kroot) = kernel_root {
                if Self::read_entry(kroot, index) == pte {
                    continue;
                }
            }
            Self::release_table(alloc, pte.phys_addr(), 1);
        }
        alloc.free_frame(self.root);
    }

    fn release_table(alloc: &mut FrameAllocator, table: PhysAddr, level: usize) {
        if level > 0 {
            for index in 0..PTE_COUNT {
                let pte = Self::read_entry(table, index);
                if pte.is_valid() && !pte.is_leaf() {
                    Self::release_table(alloc, pte.phys_addr(), level - 1);
                }
            }
        }
        alloc.free_frame(table);
    }

    /// Point `satp` at this table (SV39, ASID 0).
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    pub fn switch_root(&self) {
        // SAFETY: the root frame holds a well-formed table that maps the
        // running kernel; changing satp is the documented way to install it.
        unsafe {
            riscv::register::satp::set(
                riscv::register::satp::Mode::Sv39,
                0,
                self.root.as_usize() >> 12,
            );
        }
        Self::flush_tlb();
    }

    /// Full TLB flush.
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    pub fn flush_tlb() {
        // SAFETY: sfence.vma with no operands invalidates all mappings.
        unsafe { core::arch::asm!("sfence.vma") };
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::buddy::test_support::TestArena;
    use super::*;

    fn setup() -> (TestArena, FrameAllocator) {
        let arena = TestArena::new(64, 64);
        let alloc = arena.allocator();
        (arena, alloc)
    }

    #[test]
    fn map_and_query_4k() {
        let (_arena, mut alloc) = setup();
        let mut pt = PageTable::new(&mut alloc).unwrap();
        let va = VirtAddr(0x4000_1000);
        let pa = PhysAddr(0x8000_2000);
        pt.map_page(&mut alloc, va, pa, PageSize::Size4K, Rwx::RW, true, false)
            .unwrap();

        let (pte, size) = pt.query_page(va).unwrap();
        assert_eq!(size, PageSize::Size4K);
        assert_eq!(pte.phys_addr(), pa);
        assert!(pte.rwx().readable() && pte.rwx().writable());
        assert!(!pte.rwx().executable());
        assert!(pte.is_user());
        assert!(pt.query_page(VirtAddr(0x4000_2000)).is_none());
    }

    #[test]
    fn query_never_allocates() {
        let (_arena, mut alloc) = setup();
        let pt = PageTable::new(&mut alloc).unwrap();
        let before = alloc.free_frames_total();
        assert!(pt.query_page(VirtAddr(0x5000_0000)).is_none());
        assert_eq!(alloc.free_frames_total(), before);
    }

    #[test]
    fn write_without_read_is_rejected() {
        let (_arena, mut alloc) = setup();
        let mut pt = PageTable::new(&mut alloc).unwrap();
        let err = pt
            .map_page(
                &mut alloc,
                VirtAddr(0x1000),
                PhysAddr(0x2000),
                PageSize::Size4K,
                Rwx::W,
                false,
                false,
            )
            .unwrap_err();
        assert_eq!(err, MmError::WriteWithoutRead);
    }

    #[test]
    fn superpages_map_at_their_level() {
        let (_arena, mut alloc) = setup();
        let mut pt = PageTable::new(&mut alloc).unwrap();

        pt.map_page(
            &mut alloc,
            VirtAddr(0x4000_0000),
            PhysAddr(0x8000_0000),
            PageSize::Size1G,
            Rwx::RX,
            false,
            true,
        )
        .unwrap();
        pt.map_page(
            &mut alloc,
            VirtAddr(0x8020_0000),
            PhysAddr(0x4020_0000),
            PageSize::Size2M,
            Rwx::RW,
            false,
            false,
        )
        .unwrap();

        let (pte, size) = pt.query_page(VirtAddr(0x4000_0000 + 0x12345)).unwrap();
        assert_eq!(size, PageSize::Size1G);
        assert!(pte.is_global());
        let (_, size) = pt.query_page(VirtAddr(0x8020_0000 + 0x1000)).unwrap();
        assert_eq!(size, PageSize::Size2M);
    }

    #[test]
    fn unaligned_superpage_is_rejected() {
        let (_arena, mut alloc) = setup();
        let mut pt = PageTable::new(&mut alloc).unwrap();
        let err = pt
            .map_page(
                &mut alloc,
                VirtAddr(0x10_0000),
                PhysAddr(0x20_0000),
                PageSize::Size2M,
                Rwx::RW,
                false,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, MmError::Unaligned { .. }));
    }

    #[test]
    fn huge_page_blocks_descent() {
        let (_arena, mut alloc) = setup();
        let mut pt = PageTable::new(&mut alloc).unwrap();
        pt.map_page(
            &mut alloc,
            VirtAddr(0x8000_0000),
            PhysAddr(0x8000_0000),
            PageSize::Size1G,
            Rwx::RW,
            false,
            false,
        )
        .unwrap();
        let err = pt
            .map_page(
                &mut alloc,
                VirtAddr(0x8000_1000),
                PhysAddr(0x1000),
                PageSize::Size4K,
                Rwx::RW,
                false,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, MmError::HugePageInTheWay { .. }));
    }

    #[test]
    fn interior_ug_mismatch_is_rejected() {
        let (_arena, mut alloc) = setup();
        let mut pt = PageTable::new(&mut alloc).unwrap();
        pt.map_page(
            &mut alloc,
            VirtAddr(0x4000_0000),
            PhysAddr(0x1000),
            PageSize::Size4K,
            Rwx::RW,
            true,
            false,
        )
        .unwrap();
        let err = pt
            .map_page(
                &mut alloc,
                VirtAddr(0x4000_1000),
                PhysAddr(0x2000),
                PageSize::Size4K,
                Rwx::RW,
                false,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, MmError::FlagMismatch { .. }));
    }

    #[test]
    fn map_range_resolves_contiguously() {
        let (_arena, mut alloc) = setup();
        let mut pt = PageTable::new(&mut alloc).unwrap();
        let vstart = 0x10_0000;
        let pstart = 0x5000_0000;
        pt.map_range(
            &mut alloc,
            VirtAddr(vstart),
            PhysAddr(pstart),
            6 * FRAME_SIZE,
            Rwx::RO,
            true,
            false,
            false,
        )
        .unwrap();

        for page in 0..6 {
            let va = VirtAddr(vstart + page * FRAME_SIZE + 0x123);
            let (pa, remaining) = pt.translate(va).unwrap();
            assert_eq!(pa.as_usize(), pstart + page * FRAME_SIZE + 0x123);
            assert_eq!(remaining, FRAME_SIZE - 0x123);
        }
    }

    #[test]
    fn map_range_huge_prefers_large_blocks() {
        let (_arena, mut alloc) = setup();
        let mut pt = PageTable::new(&mut alloc).unwrap();
        // 2 MiB aligned range of 2 MiB + 8 KiB: one superpage + two 4 K pages.
        pt.map_range(
            &mut alloc,
            VirtAddr(0x4000_0000),
            PhysAddr(0x8000_0000),
            PageSize::Size2M.bytes() + 2 * FRAME_SIZE,
            Rwx::RW,
            false,
            false,
            true,
        )
        .unwrap();

        let (_, size) = pt.query_page(VirtAddr(0x4000_0000)).unwrap();
        assert_eq!(size, PageSize::Size2M);
        let (_, size) = pt.query_page(VirtAddr(0x4020_0000)).unwrap();
        assert_eq!(size, PageSize::Size4K);
        let (_, size) = pt.query_page(VirtAddr(0x4020_1000)).unwrap();
        assert_eq!(size, PageSize::Size4K);
        assert!(pt.query_page(VirtAddr(0x4020_2000)).is_none());
    }

    #[test]
    fn modify_flags_touches_only_masked_bits() {
        let (_arena, mut alloc) = setup();
        let mut pt = PageTable::new(&mut alloc).unwrap();
        let va = VirtAddr(0x7000_0000);
        pt.map_page(&mut alloc, va, PhysAddr(0x3000), PageSize::Size4K, Rwx::RW, true, false)
            .unwrap();

        let size = pt
            .modify_flags(va, ModifyMask::RWX, Rwx::RO, false, false)
            .unwrap();
        assert_eq!(size, PageSize::Size4K);
        let (pte, _) = pt.query_page(va).unwrap();
        assert!(pte.rwx().readable());
        assert!(!pte.rwx().writable());
        // U untouched: mask did not include it.
        assert!(pte.is_user());
    }

    #[test]
    fn every_writable_entry_is_readable() {
        let (_arena, mut alloc) = setup();
        let mut pt = PageTable::new(&mut alloc).unwrap();
        for (i, rwx) in [Rwx::RW, Rwx::RO, Rwx::RX, Rwx::RWX].into_iter().enumerate() {
            pt.map_page(
                &mut alloc,
                VirtAddr(0x2000_0000 + i * FRAME_SIZE),
                PhysAddr(0x6000_0000 + i * FRAME_SIZE),
                PageSize::Size4K,
                rwx,
                false,
                false,
            )
            .unwrap();
        }
        for i in 0..4 {
            let (pte, _) = pt.query_page(VirtAddr(0x2000_0000 + i * FRAME_SIZE)).unwrap();
            if pte.rwx().writable() {
                assert!(pte.rwx().readable());
            }
        }
    }

    #[test]
    fn release_returns_all_table_frames() {
        let (_arena, mut alloc) = setup();
        let before = alloc.free_frames_total();
        let mut pt = PageTable::new(&mut alloc).unwrap();
        pt.map_range(
            &mut alloc,
            VirtAddr(0x1000_0000),
            PhysAddr(0x2000_0000),
            8 * FRAME_SIZE,
            Rwx::RW,
            true,
            false,
            false,
        )
        .unwrap();
        pt.release(&mut alloc);
        assert_eq!(alloc.free_frames_total(), before);
    }
}
