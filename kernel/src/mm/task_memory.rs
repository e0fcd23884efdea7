//! Per-task address spaces
//!
//! A `TaskMemory` couples one SV39 page table with the task's ordered VMA
//! list and owns the physical frames backing it. User ranges are demand
//! paged: the first touch of a VMA page faults, and the fault handler maps a
//! small window of fresh frames with the VMA's default permissions.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::buddy::MAX_ORDER;
use super::page_table::{PageSize, PageTable, Rwx};
use super::{phys_to_virt, FrameAllocator, PhysAddr, VirtAddr, FRAME_SIZE};
use crate::error::MmError;

/// Role of a virtual memory area; implies its default permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    Code,
    Data,
    Stack,
    Heap,
    Mmap,
    ShareRw,
    ShareRo,
    ShareRx,
    ShareRwx,
}

impl VmaKind {
    /// Default R/W/X for pages demand-mapped into this area.
    pub const fn default_rwx(self) -> Rwx {
        match self {
            VmaKind::Code => Rwx::RX,
            VmaKind::Data | VmaKind::Stack | VmaKind::Heap | VmaKind::Mmap | VmaKind::ShareRw => {
                Rwx::RW
            }
            VmaKind::ShareRo => Rwx::RO,
            VmaKind::ShareRx => Rwx::RX,
            VmaKind::ShareRwx => Rwx::RWX,
        }
    }
}

/// A half-open virtual range `[start, start + size)`.
#[derive(Debug, Clone, Copy)]
pub struct Vma {
    pub kind: VmaKind,
    pub start: VirtAddr,
    pub size: usize,
}

impl Vma {
    pub fn end(&self) -> usize {
        self.start.as_usize() + self.size
    }

    pub fn contains(&self, vaddr: VirtAddr) -> bool {
        let a = vaddr.as_usize();
        a >= self.start.as_usize() && a < self.end()
    }
}

/// Page-fault classification handed over by the trap core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultKind {
    InstructionFault,
    LoadFault,
    StoreFault,
    InstructionPage,
    LoadPage,
    StorePage,
}

impl PageFaultKind {
    fn is_store(self) -> bool {
        matches!(self, PageFaultKind::StoreFault | PageFaultKind::StorePage)
    }

    fn is_exec(self) -> bool {
        matches!(
            self,
            PageFaultKind::InstructionFault | PageFaultKind::InstructionPage
        )
    }
}

/// Frames demand-mapped per fault (the faulting page plus read-ahead),
/// clipped to the VMA end.
const FAULT_WINDOW_PAGES: usize = 4;

/// One task's address space: page table plus ordered VMA list.
pub struct TaskMemory {
    table: PageTable,
    /// VMAs keyed by start address; non-overlapping by construction.
    vmas: BTreeMap<usize, Vma>,
    /// Physical blocks owned by this address space.
    backing: Vec<(PhysAddr, usize)>,
}

impl TaskMemory {
    pub fn new(alloc: &mut FrameAllocator) -> Result<Self, MmError> {
        let mut table = PageTable::new(alloc)?;
        // The kernel must stay mapped while this task's table is active.
        if let Some(kroot) = super::kernel_root() {
            table.copy_root_entries_from(kroot);
        }
        Ok(Self {
            table,
            vmas: BTreeMap::new(),
            backing: Vec::new(),
        })
    }

    pub fn table(&self) -> &PageTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut PageTable {
        &mut self.table
    }

    /// Insert a VMA, keeping the list ordered and overlap-free. Both bounds
    /// must be page-aligned.
    pub fn add_vma(&mut self, kind: VmaKind, start: VirtAddr, size: usize) -> Result<(), MmError> {
        if start.as_usize() % FRAME_SIZE != 0 || size % FRAME_SIZE != 0 || size == 0 {
            return Err(MmError::Unaligned { addr: start.as_usize() });
        }
        let new_start = start.as_usize();
        let new_end = new_start + size;

        if let Some((_, prev)) = self.vmas.range(..=new_start).next_back() {
            if prev.end() > new_start {
                return Err(MmError::VmaOverlap { vaddr: new_start });
            }
        }
        if let Some((succ_start, _)) = self.vmas.range(new_start..).next() {
            if *succ_start < new_end {
                return Err(MmError::VmaOverlap { vaddr: new_start });
            }
        }

        self.vmas.insert(new_start, Vma { kind, start, size });
        Ok(())
    }

    /// Remove the VMA starting exactly at `start`. The descriptor goes away;
    /// already-mapped frames stay owned by the task until teardown.
    pub fn remove_vma(&mut self, start: VirtAddr) -> Result<(), MmError> {
        self.vmas
            .remove(&start.as_usize())
            .map(|_| ())
            .ok_or(MmError::NoVma { vaddr: start.as_usize() })
    }

    /// The VMA containing `vaddr`, if any.
    pub fn find_vma(&self, vaddr: VirtAddr) -> Option<&Vma> {
        let (_, vma) = self.vmas.range(..=vaddr.as_usize()).next_back()?;
        vma.contains(vaddr).then_some(vma)
    }

    pub fn vmas(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.values()
    }

    /// Allocate and map physical backing for `[vaddr, vaddr + pages * 4K)`.
    ///
    /// The range must sit inside one VMA. Backing is grabbed as the largest
    /// power-of-two blocks available, falling back to smaller orders under
    /// fragmentation.
    pub fn alloc_pages_for(
        &mut self,
        alloc: &mut FrameAllocator,
        vaddr: VirtAddr,
        pages: usize,
        rwx: Rwx,
        user: bool,
    ) -> Result<(), MmError> {
        let vma = *self
            .find_vma(vaddr)
            .ok_or(MmError::NoVma { vaddr: vaddr.as_usize() })?;
        if vaddr.as_usize() + pages * FRAME_SIZE > vma.end() {
            return Err(MmError::VmaOutOfBounds { vaddr: vaddr.as_usize() });
        }

        let mut va = vaddr.as_usize();
        let mut remaining = pages;
        while remaining > 0 {
            // Largest order that still fits the request.
            let mut order = (usize::BITS - 1 - remaining.leading_zeros()) as usize;
            order = order.min(MAX_ORDER);
            let mut block = alloc.alloc_order(order);
            while block.is_none() && order > 0 {
                order -= 1;
                block = alloc.alloc_order(order);
            }
            let Some(pa) = block else {
                log::error!("task_memory: no frames left for {va:#x} ({remaining} pages)");
                return Err(MmError::OutOfMemory);
            };

            let frames = 1usize << order;
            self.table.map_range(
                alloc,
                VirtAddr(va),
                pa,
                frames * FRAME_SIZE,
                rwx,
                user,
                false,
                false,
            )?;
            self.backing.push((pa, frames));
            va += frames * FRAME_SIZE;
            remaining -= frames;
        }
        Ok(())
    }

    /// Resolve a U-mode page fault at `vaddr`.
    ///
    /// `Ok(())` means the mapping was repaired and the instruction can
    /// retry; any `Err` means the faulting process must be terminated.
    pub fn handle_fault(
        &mut self,
        alloc: &mut FrameAllocator,
        vaddr: VirtAddr,
        kind: PageFaultKind,
    ) -> Result<(), MmError> {
        if let Some((pte, _)) = self.table.query_page(vaddr) {
            // Present page: a permission violation, never repaired here.
            let rwx = pte.rwx();
            if kind.is_store() && !rwx.writable() {
                log::info!("fault: write to read-only page {:#x}", vaddr.as_usize());
            } else if kind.is_exec() && !rwx.executable() {
                log::info!("fault: execute on data page {:#x}", vaddr.as_usize());
            } else {
                log::info!("fault: access violation at {:#x} ({kind:?})", vaddr.as_usize());
            }
            return Err(MmError::ProtectionFault { vaddr: vaddr.as_usize() });
        }

        let vma = match self.find_vma(vaddr) {
            Some(vma) => *vma,
            None => {
                log::info!("fault: {:#x} outside every VMA", vaddr.as_usize());
                return Err(MmError::NoVma { vaddr: vaddr.as_usize() });
            }
        };

        let page_start = vaddr.align_down(FRAME_SIZE);
        let to_end = (vma.end() - page_start.as_usize()) / FRAME_SIZE;
        let pages = FAULT_WINDOW_PAGES.min(to_end);
        self.alloc_pages_for(alloc, page_start, pages, vma.kind.default_rwx(), true)
    }

    /// Copy one VMA (descriptor and mapped contents) from `other` into this
    /// address space, backing it with fresh frames. Used by fork.
    pub fn clone_vma(
        &mut self,
        alloc: &mut FrameAllocator,
        other: &TaskMemory,
        vma: &Vma,
    ) -> Result<(), MmError> {
        self.add_vma(vma.kind, vma.start, vma.size)?;

        let mut va = vma.start.as_usize();
        while va < vma.end() {
            if let Some((pte, size)) = other.table.query_page(VirtAddr(va)) {
                debug_assert_eq!(size, PageSize::Size4K, "user mappings are 4K");
                let frame = alloc.alloc_frame().ok_or(MmError::OutOfMemory)?;
                // SAFETY: both frames are 4 KiB, owned by the respective
                // address spaces, and reachable through the kernel alias.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        phys_to_virt(pte.phys_addr()),
                        phys_to_virt(frame),
                        FRAME_SIZE,
                    );
                }
                self.table.map_page(
                    alloc,
                    VirtAddr(va),
                    frame,
                    PageSize::Size4K,
                    pte.rwx(),
                    pte.is_user(),
                    pte.is_global(),
                )?;
                self.backing.push((frame, 1));
            }
            va += FRAME_SIZE;
        }
        Ok(())
    }

    /// Deep-copy every VMA of `other` into this (fresh) address space.
    pub fn clone_from(&mut self, alloc: &mut FrameAllocator, other: &TaskMemory) -> Result<(), MmError> {
        let vmas: Vec<Vma> = other.vmas.values().copied().collect();
        for vma in &vmas {
            self.clone_vma(alloc, other, vma)?;
        }
        Ok(())
    }

    /// Return every owned frame (backing, then table) to the allocator.
    pub fn release(self, alloc: &mut FrameAllocator) {
        for (pa, frames) in self.backing {
            alloc.free_frames(pa, frames);
        }
        self.table.release(alloc);
    }
}
