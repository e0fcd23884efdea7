//! CSpace accessor operations
//!
//! A `SpaceAccessor` payload points at exactly one CSpace. A capability to
//! it grants slot operations on that space under a per-group 4-bit window
//! (read / insert / remove / share) spanning all 1024 groups, plus a global
//! ALLOC bit in the basic word for free-slot discovery.

use super::object::Payload;
use super::system::CapSystem;
use super::{CapError, CapIdx, CapNodeId, CapResult, HolderId, SpaceRef, CGROUP_SLOTS, CSPACE_SIZE};

/// Bits of one group window.
pub const SLOT_READ: u64 = 0b0001;
pub const SLOT_INSERT: u64 = 0b0010;
pub const SLOT_REMOVE: u64 = 0b0100;
pub const SLOT_SHARE: u64 = 0b1000;

/// Window width per group.
pub const SLOT_BITS: usize = 4;

/// Extension bitmap: 4 bits × 1024 groups.
pub const BITMAP_WORDS: usize = CSPACE_SIZE * SLOT_BITS / 64;

/// Global permission: may call `alloc_slot`.
pub const ALLOC: u64 = 1 << 16;

/// Bit offset of a group's window in the extension bitmap.
pub const fn window_offset(group: u16) -> usize {
    group as usize * SLOT_BITS
}

impl CapSystem {
    /// Resolve `csa` in `holder` to the accessor node and its target space.
    fn resolve_csa(&self, holder: HolderId, csa: CapIdx) -> CapResult<(CapNodeId, SpaceRef)> {
        let cap = self.access(holder, csa)?;
        match self.payload(cap)? {
            Payload::SpaceAccessor(target) => Ok((cap, *target)),
            _ => Err(CapError::TypeNotMatched),
        }
    }

    fn check_window(&self, cap: CapNodeId, group: u16, required: u64) -> CapResult<()> {
        let node = self.node(cap)?;
        if !node.perm().imply_window(window_offset(group), SLOT_BITS, required) {
            log::debug!("csa: group {group} window denies {required:#b}");
            return Err(CapError::InsufficientPermissions);
        }
        Ok(())
    }

    /// Create a payload at `dst_idx` of the accessed space. Needs INSERT on
    /// the destination group.
    pub fn csa_create(
        &mut self,
        holder: HolderId,
        csa: CapIdx,
        dst_idx: CapIdx,
        payload: Payload,
    ) -> CapResult<CapNodeId> {
        let (cap, target) = self.resolve_csa(holder, csa)?;
        self.check_window(cap, dst_idx.group(), SLOT_INSERT)?;
        self.create_in(target, dst_idx, payload)
    }

    /// Clone the capability at `src_idx` of `src_space` into `dst_idx` of
    /// the accessed space. Needs INSERT on the destination group; the source
    /// capability must grant CLONE.
    pub fn csa_clone(
        &mut self,
        holder: HolderId,
        csa: CapIdx,
        dst_idx: CapIdx,
        src_space: SpaceRef,
        src_idx: CapIdx,
    ) -> CapResult<CapNodeId> {
        let (cap, target) = self.resolve_csa(holder, csa)?;
        self.check_window(cap, dst_idx.group(), SLOT_INSERT)?;
        let src = self.get(src_space, src_idx)?;
        self.clone_into(target, dst_idx, src, None)
    }

    /// Migrate the capability at `src_idx` of `src_space` into `dst_idx` of
    /// the accessed space. Needs INSERT on the destination group; the source
    /// capability must grant MIGRATE.
    pub fn csa_migrate(
        &mut self,
        holder: HolderId,
        csa: CapIdx,
        dst_idx: CapIdx,
        src_space: SpaceRef,
        src_idx: CapIdx,
    ) -> CapResult<()> {
        let (cap, target) = self.resolve_csa(holder, csa)?;
        self.check_window(cap, dst_idx.group(), SLOT_INSERT)?;
        let src = self.get(src_space, src_idx)?;
        self.migrate_into(target, dst_idx, src)
    }

    /// Remove (revoke) the capability at `idx` of the accessed space. Needs
    /// REMOVE on its group.
    pub fn csa_remove(&mut self, holder: HolderId, csa: CapIdx, idx: CapIdx) -> CapResult<()> {
        let (cap, target) = self.resolve_csa(holder, csa)?;
        self.check_window(cap, idx.group(), SLOT_REMOVE)?;
        self.remove_at(target, idx)
    }

    /// Read the capability at `idx` of the accessed space. Needs READ on its
    /// group.
    pub fn csa_get(&self, holder: HolderId, csa: CapIdx, idx: CapIdx) -> CapResult<CapNodeId> {
        let (cap, target) = self.resolve_csa(holder, csa)?;
        self.check_window(cap, idx.group(), SLOT_READ)?;
        self.get(target, idx)
    }

    /// Find a free slot in some group the accessor may insert into. Needs
    /// the global ALLOC bit. A linear scan, first fit.
    pub fn csa_alloc_slot(&mut self, holder: HolderId, csa: CapIdx) -> CapResult<CapIdx> {
        let (cap, target) = self.resolve_csa(holder, csa)?;
        let node = self.node(cap)?;
        if !node.perm().imply_basic(ALLOC) {
            log::debug!("csa: alloc_slot denied");
            return Err(CapError::InsufficientPermissions);
        }
        let perm = node.perm().clone();
        let space = self.cspace(target)?;

        for group in 0..CSPACE_SIZE as u16 {
            if perm.window(window_offset(group), SLOT_BITS) & SLOT_INSERT == 0 {
                continue;
            }
            if !space.has_group(group) {
                return Ok(CapIdx::major(group, 0));
            }
            let grp = space.group(group)?;
            if let Some(slot) = grp.lookup_free(None) {
                debug_assert!((slot as usize) < CGROUP_SLOTS);
                return Ok(CapIdx::major(group, slot));
            }
        }
        Err(CapError::SlotBusy)
    }
}
