//! Physical frame allocator
//!
//! Classic binary buddy over 4 KiB frames. Per-order free lists are intrusive
//! doubly-linked lists whose nodes live in the first bytes of each free page,
//! kept sorted by physical address; the allocator itself needs no metadata
//! beyond the list heads. Buddy identity is `addr XOR block_size`.
//!
//! The allocator runs in two phases. Before paging it dereferences free pages
//! through the boot identity mapping; `post_init` rewrites every stored
//! pointer to the kernel linear alias in one pass once `satp` has switched.

use spin::Mutex;

use super::{MemRegion, PhysAddr, RegionStatus, FRAME_SIZE};

/// Largest allocation order: 2^15 frames = 128 MiB.
pub const MAX_ORDER: usize = 15;

const fn block_frames(order: usize) -> usize {
    1 << order
}

const fn block_bytes(order: usize) -> usize {
    FRAME_SIZE << order
}

/// List node embedded in the first bytes of every free block.
#[repr(C)]
struct FreeNode {
    prev: *mut FreeNode,
    next: *mut FreeNode,
}

/// Binary buddy allocator over the machine's physical frames.
pub struct FrameAllocator {
    /// Per-order free lists, address-ordered.
    heads: [*mut FreeNode; MAX_ORDER + 1],
    /// Offset from a physical address to its dereferenceable alias.
    virt_offset: usize,
    /// Managed physical range, set at init. Frees outside it are fatal.
    range: Option<(usize, usize)>,
    migrated: bool,
}

// SAFETY: the embedded list nodes are reachable only through this allocator,
// and all access goes through the surrounding Mutex.
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            heads: [core::ptr::null_mut(); MAX_ORDER + 1],
            virt_offset: 0,
            range: None,
            migrated: false,
        }
    }

    fn node_at(&self, pa: usize) -> *mut FreeNode {
        (pa + self.virt_offset) as *mut FreeNode
    }

    fn node_pa(&self, node: *mut FreeNode) -> usize {
        node as usize - self.virt_offset
    }

    /// Seed the allocator from the boot memory map. `Reserved` regions are
    /// skipped; each `Free` region is split into the largest naturally
    /// aligned power-of-two blocks.
    pub fn init(&mut self, regions: &[MemRegion]) {
        let mut lo = usize::MAX;
        let mut hi = 0;
        for region in regions {
            if region.status != RegionStatus::Free {
                continue;
            }
            let start = VAlign::up(region.start.as_usize());
            let end = VAlign::down(region.start.as_usize() + region.size);
            if end <= start {
                continue;
            }
            lo = lo.min(start);
            hi = hi.max(end);
        }
        if hi > lo {
            self.range = Some((lo, hi));
        }

        for region in regions {
            if region.status != RegionStatus::Free {
                continue;
            }
            let start = VAlign::up(region.start.as_usize());
            let end = VAlign::down(region.start.as_usize() + region.size);
            if end <= start {
                continue;
            }
            self.add_range(start, (end - start) / FRAME_SIZE);
            log::debug!(
                "buddy: added free region [{start:#x}, {end:#x}), {} frames",
                (end - start) / FRAME_SIZE
            );
        }
    }

    /// Publish `frames` frames starting at `pa` as the largest aligned
    /// blocks that fit.
    fn add_range(&mut self, mut pa: usize, mut frames: usize) {
        while frames > 0 {
            let mut order = 0;
            while order < MAX_ORDER
                && block_frames(order + 1) <= frames
                && pa % block_bytes(order + 1) == 0
            {
                order += 1;
            }
            self.insert_free(pa, order);
            pa += block_bytes(order);
            frames -= block_frames(order);
        }
    }

    /// Allocate one frame.
    pub fn alloc_frame(&mut self) -> Option<PhysAddr> {
        self.alloc_frames(1)
    }

    /// Allocate `n` contiguous frames, rounded up to the next power of two.
    pub fn alloc_frames(&mut self, n: usize) -> Option<PhysAddr> {
        if n == 0 || n > block_frames(MAX_ORDER) {
            log::error!("buddy: invalid frame count {n}");
            return None;
        }
        self.alloc_order(frames_to_order(n))
    }

    /// Allocate a block of order `order`.
    pub fn alloc_order(&mut self, order: usize) -> Option<PhysAddr> {
        if order > MAX_ORDER {
            log::error!("buddy: order {order} out of range");
            return None;
        }

        let mut current = order;
        while current <= MAX_ORDER && self.heads[current].is_null() {
            current += 1;
        }
        if current > MAX_ORDER {
            log::error!("buddy: out of memory for order {order}");
            return None;
        }

        let pa = self.pop_front(current);
        // Split back down, releasing each upper half.
        while current > order {
            current -= 1;
            self.push_ordered(pa + block_bytes(current), current);
        }
        Some(PhysAddr(pa))
    }

    /// Allocate one zeroed frame.
    pub fn alloc_zeroed_frame(&mut self) -> Option<PhysAddr> {
        let pa = self.alloc_frame()?;
        // SAFETY: the frame was just handed out by the allocator and is not
        // yet visible to anyone else; its alias mapping is valid.
        unsafe {
            core::ptr::write_bytes(self.node_at(pa.as_usize()) as *mut u8, 0, FRAME_SIZE);
        }
        Some(pa)
    }

    /// Free one frame.
    pub fn free_frame(&mut self, pa: PhysAddr) {
        self.free_frames(pa, 1);
    }

    /// Free `n` contiguous frames previously allocated at `pa`. `n` is
    /// rounded exactly as in `alloc_frames`.
    ///
    /// Freeing an address outside the managed physical range, or one that is
    /// not frame-aligned, is a kernel bug and panics.
    pub fn free_frames(&mut self, pa: PhysAddr, n: usize) {
        let addr = pa.as_usize();
        let (lo, hi) = self
            .range
            .expect("buddy: free before init");
        if addr < lo || addr >= hi {
            panic!("buddy: freeing {addr:#x} outside physical range [{lo:#x}, {hi:#x})");
        }
        if addr % FRAME_SIZE != 0 {
            panic!("buddy: freeing unaligned address {addr:#x}");
        }
        if n == 0 || n > block_frames(MAX_ORDER) {
            panic!("buddy: freeing invalid frame count {n}");
        }
        self.insert_free(addr, frames_to_order(n));
    }

    /// Insert a free block, merging with its buddy as long as one is free.
    fn insert_free(&mut self, mut pa: usize, mut order: usize) {
        debug_assert!(pa % block_bytes(order) == 0);
        while order < MAX_ORDER {
            let buddy = pa ^ block_bytes(order);
            if !self.remove_if_present(buddy, order) {
                break;
            }
            pa = pa.min(buddy);
            order += 1;
        }
        self.push_ordered(pa, order);
    }

    /// Splice a block into the address-ordered list of its order.
    fn push_ordered(&mut self, pa: usize, order: usize) {
        let node = self.node_at(pa);
        let mut prev: *mut FreeNode = core::ptr::null_mut();
        let mut cur = self.heads[order];
        // SAFETY: list nodes live in free frames owned by this allocator and
        // are dereferenceable through the current alias offset.
        unsafe {
            while !cur.is_null() && self.node_pa(cur) < pa {
                prev = cur;
                cur = (*cur).next;
            }
            (*node).prev = prev;
            (*node).next = cur;
            if prev.is_null() {
                self.heads[order] = node;
            } else {
                (*prev).next = node;
            }
            if !cur.is_null() {
                (*cur).prev = node;
            }
        }
    }

    /// Unlink the block at `pa` from list `order` if it is free.
    fn remove_if_present(&mut self, pa: usize, order: usize) -> bool {
        let mut cur = self.heads[order];
        // SAFETY: same list-node reachability argument as push_ordered.
        unsafe {
            while !cur.is_null() {
                let cur_pa = self.node_pa(cur);
                if cur_pa == pa {
                    self.unlink(cur, order);
                    return true;
                }
                if cur_pa > pa {
                    return false;
                }
                cur = (*cur).next;
            }
        }
        false
    }

    /// Pop the lowest-address block from list `order`.
    fn pop_front(&mut self, order: usize) -> usize {
        let node = self.heads[order];
        debug_assert!(!node.is_null());
        // SAFETY: node is the list head, checked non-null by the caller.
        unsafe {
            self.unlink(node, order);
        }
        self.node_pa(node)
    }

    /// Unlink `node` from list `order`.
    ///
    /// # Safety
    /// `node` must currently be linked into list `order`.
    unsafe fn unlink(&mut self, node: *mut FreeNode, order: usize) {
        // SAFETY: per contract, node and its neighbours are live list nodes.
        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            if prev.is_null() {
                self.heads[order] = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
        }
    }

    /// One-shot migration of every stored list pointer from the identity
    /// mapping to the kernel alias at `offset`. Must run exactly once,
    /// immediately after the kernel page table is installed.
    pub fn post_init(&mut self, offset: usize) {
        assert!(!self.migrated, "buddy: post_init ran twice");
        self.migrated = true;
        if offset == 0 {
            return;
        }
        for order in 0..=MAX_ORDER {
            let head_pa = self.heads[order] as usize;
            if head_pa != 0 {
                self.heads[order] = (head_pa + offset) as *mut FreeNode;
            }
            let mut cur_pa = head_pa;
            while cur_pa != 0 {
                // Stored values are still physical; dereference through the
                // new alias, then rewrite in place.
                let node = (cur_pa + offset) as *mut FreeNode;
                // SAFETY: cur_pa is a free frame owned by this allocator and
                // the linear alias maps all managed physical memory.
                unsafe {
                    let next_pa = (*node).next as usize;
                    let prev_pa = (*node).prev as usize;
                    if next_pa != 0 {
                        (*node).next = (next_pa + offset) as *mut FreeNode;
                    }
                    if prev_pa != 0 {
                        (*node).prev = (prev_pa + offset) as *mut FreeNode;
                    }
                    cur_pa = next_pa;
                }
            }
        }
        self.virt_offset = offset;
    }

    /// Number of free blocks currently on list `order`.
    pub fn free_blocks(&self, order: usize) -> usize {
        let mut count = 0;
        let mut cur = self.heads[order];
        // SAFETY: walking live list nodes, read-only.
        unsafe {
            while !cur.is_null() {
                count += 1;
                cur = (*cur).next;
            }
        }
        count
    }

    /// Total free frames across all orders.
    pub fn free_frames_total(&self) -> usize {
        (0..=MAX_ORDER)
            .map(|order| self.free_blocks(order) * block_frames(order))
            .sum()
    }

    #[cfg(all(test, not(target_os = "none")))]
    fn blocks(&self, order: usize) -> alloc::vec::Vec<usize> {
        let mut out = alloc::vec::Vec::new();
        let mut cur = self.heads[order];
        // SAFETY: walking live list nodes, read-only.
        unsafe {
            while !cur.is_null() {
                out.push(self.node_pa(cur));
                cur = (*cur).next;
            }
        }
        out
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Smallest order whose block covers `n` frames.
fn frames_to_order(n: usize) -> usize {
    match n {
        1 => 0,
        2 => 1,
        3 | 4 => 2,
        _ => {
            let mut order = 3;
            while order < MAX_ORDER && block_frames(order) < n {
                order += 1;
            }
            order
        }
    }
}

/// Frame-granularity alignment helpers.
struct VAlign;

impl VAlign {
    fn up(addr: usize) -> usize {
        (addr + FRAME_SIZE - 1) & !(FRAME_SIZE - 1)
    }

    fn down(addr: usize) -> usize {
        addr & !(FRAME_SIZE - 1)
    }
}

lazy_static::lazy_static! {
    /// The machine's frame allocator.
    pub static ref FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod test_support {
    //! A page-aligned heap arena standing in for physical memory, so the
    //! allocator and page tables can be exercised on the host where the
    //! phys→virt offset is zero.

    use alloc::vec;
    use alloc::vec::Vec;

    use super::super::{MemRegion, PhysAddr, RegionStatus, FRAME_SIZE};
    use super::FrameAllocator;

    #[repr(C, align(4096))]
    #[derive(Clone)]
    pub struct Page(pub [u8; FRAME_SIZE]);

    pub struct TestArena {
        pages: Vec<Page>,
        base: usize,
        frames: usize,
    }

    impl TestArena {
        /// Arena exposing `frames` frames whose base is aligned to
        /// `align_frames` frames, for deterministic buddy orders.
        pub fn new(frames: usize, align_frames: usize) -> Self {
            let slack = align_frames.max(1);
            let pages = vec![Page([0u8; FRAME_SIZE]); frames + slack];
            let raw = pages.as_ptr() as usize;
            let align = slack * FRAME_SIZE;
            let base = (raw + align - 1) & !(align - 1);
            Self { pages, base, frames }
        }

        pub fn base(&self) -> usize {
            self.base
        }

        pub fn region(&self) -> MemRegion {
            MemRegion {
                start: PhysAddr(self.base),
                size: self.frames * FRAME_SIZE,
                status: RegionStatus::Free,
            }
        }

        pub fn allocator(&self) -> FrameAllocator {
            let mut alloc = FrameAllocator::new();
            alloc.init(&[self.region()]);
            alloc
        }

        /// Keep the borrow checker honest about arena lifetime.
        pub fn len(&self) -> usize {
            self.pages.len()
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::test_support::TestArena;
    use super::*;

    #[test]
    fn seeds_one_maximal_block() {
        let arena = TestArena::new(64, 64);
        let alloc = arena.allocator();
        assert_eq!(alloc.free_blocks(6), 1);
        assert_eq!(alloc.free_frames_total(), 64);
    }

    #[test]
    fn unaligned_region_splits_by_alignment() {
        // 6 frames starting on an odd frame boundary: 1 + 4 + 1 split
        // (or 1+1+4 depending on the base), never a single block.
        let arena = TestArena::new(8, 8);
        let mut alloc = FrameAllocator::new();
        alloc.init(&[super::super::MemRegion {
            start: super::super::PhysAddr(arena.base() + FRAME_SIZE),
            size: 6 * FRAME_SIZE,
            status: super::super::RegionStatus::Free,
        }]);
        assert_eq!(alloc.free_frames_total(), 6);
        for order in 0..=MAX_ORDER {
            for pa in alloc.blocks(order) {
                assert_eq!(pa % (FRAME_SIZE << order), 0, "order {order} misaligned");
            }
        }
    }

    #[test]
    fn alloc_splits_and_free_remerges() {
        let arena = TestArena::new(64, 64);
        let mut alloc = arena.allocator();

        let pa = alloc.alloc_frame().unwrap();
        assert_eq!(pa.as_usize(), arena.base());
        // One buddy released at every order below the split point.
        for order in 0..6 {
            assert_eq!(alloc.free_blocks(order), 1, "order {order}");
        }
        assert_eq!(alloc.free_blocks(6), 0);
        assert_eq!(alloc.free_frames_total(), 63);

        alloc.free_frame(pa);
        assert_eq!(alloc.free_blocks(6), 1);
        assert_eq!(alloc.free_frames_total(), 64);
    }

    #[test]
    fn buddies_merge_in_any_free_order() {
        let arena = TestArena::new(64, 64);
        let mut alloc = arena.allocator();

        let a = alloc.alloc_frames(2).unwrap();
        let b = alloc.alloc_frames(2).unwrap();
        assert_eq!(b.as_usize(), a.as_usize() + 2 * FRAME_SIZE);

        alloc.free_frames(a, 2);
        alloc.free_frames(b, 2);
        assert_eq!(alloc.free_blocks(6), 1);
    }

    #[test]
    fn no_two_buddies_coexist_on_a_list() {
        let arena = TestArena::new(64, 64);
        let mut alloc = arena.allocator();

        let mut held = alloc::vec::Vec::new();
        for _ in 0..16 {
            held.push(alloc.alloc_frame().unwrap());
        }
        for pa in held {
            alloc.free_frame(pa);
        }
        for order in 0..MAX_ORDER {
            let blocks = alloc.blocks(order);
            for &pa in &blocks {
                let buddy = pa ^ (FRAME_SIZE << order);
                assert!(!blocks.contains(&buddy), "buddies left unmerged at order {order}");
            }
        }
    }

    #[test]
    fn rounds_up_to_power_of_two() {
        let arena = TestArena::new(64, 64);
        let mut alloc = arena.allocator();
        let pa = alloc.alloc_frames(3).unwrap();
        // A 3-frame request consumes an order-2 block.
        assert_eq!(alloc.free_frames_total(), 60);
        alloc.free_frames(pa, 3);
        assert_eq!(alloc.free_frames_total(), 64);
    }

    #[test]
    fn oversized_request_fails() {
        let arena = TestArena::new(64, 64);
        let mut alloc = arena.allocator();
        assert!(alloc.alloc_frames((1 << MAX_ORDER) + 1).is_none());
        assert!(alloc.alloc_frames(0).is_none());
    }

    #[test]
    fn exhaustion_returns_none_and_recovers() {
        let arena = TestArena::new(8, 8);
        let mut alloc = arena.allocator();
        let a = alloc.alloc_frames(8).unwrap();
        assert!(alloc.alloc_frame().is_none());
        alloc.free_frames(a, 8);
        assert!(alloc.alloc_frame().is_some());
    }

    #[test]
    #[should_panic(expected = "outside physical range")]
    fn free_outside_range_is_fatal() {
        let arena = TestArena::new(8, 8);
        let mut alloc = arena.allocator();
        alloc.free_frame(PhysAddr(arena.base() + arena.len() * FRAME_SIZE * 2));
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn free_unaligned_is_fatal() {
        let arena = TestArena::new(8, 8);
        let mut alloc = arena.allocator();
        alloc.free_frame(PhysAddr(arena.base() + 1));
    }

    #[test]
    fn post_init_rewrites_every_pointer() {
        let arena = TestArena::new(16, 16);
        let mut alloc = arena.allocator();
        // Fragment the lists a little first.
        let a = alloc.alloc_frame().unwrap();
        let before: alloc::vec::Vec<(usize, alloc::vec::Vec<usize>)> = (0..=MAX_ORDER)
            .map(|order| (order, alloc.blocks(order)))
            .collect();

        const DELTA: usize = 0x4000_0000;
        alloc.post_init(DELTA);

        for (order, pas) in before {
            for (i, pa) in pas.iter().enumerate() {
                // The node still lives at the host address `pa`; its stored
                // neighbours must now carry the alias offset.
                let node = *pa as *const super::FreeNode;
                // SAFETY: pa is a free frame inside the live test arena.
                let (prev, next) = unsafe { ((*node).prev as usize, (*node).next as usize) };
                if i + 1 < pas.len() {
                    assert_eq!(next, pas[i + 1] + DELTA, "order {order} next");
                } else {
                    assert_eq!(next, 0);
                }
                if i > 0 {
                    assert_eq!(prev, pas[i - 1] + DELTA, "order {order} prev");
                } else {
                    assert_eq!(prev, 0);
                }
            }
        }
        // Allocator is unusable on the host after migration; drop it.
        let _ = a;
    }
}
