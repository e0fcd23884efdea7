//! The capability arena and its operations
//!
//! `CapSystem` owns every holder, derivation-tree node, and payload, keyed
//! by integer ids. Create places a root with all permissions; clone derives
//! a child sharing the payload; migrate moves a node between slots (and
//! holders) atomically with respect to observers; remove revokes a whole
//! subtree across every holder it reaches.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::holder::CHolder;
use super::object::{testobj, Payload, PayloadType};
use super::permission::{basic, PermissionBits};
use super::space::CSpace;
use super::{
    csa, CapError, CapIdx, CapNodeId, CapResult, HolderId, PayloadId, SlotRef, SpaceClass,
    SpaceRef, CSPACE_SIZE,
};

/// One node of the derivation tree.
#[derive(Debug)]
pub struct CapNode {
    payload: PayloadId,
    /// The sole owner of the payload; destroying it destroys the payload.
    is_root: bool,
    perm: PermissionBits,
    /// Back-pointer to the containing slot.
    slot: SlotRef,
    parent: Option<CapNodeId>,
    children: Vec<CapNodeId>,
}

impl CapNode {
    pub fn perm(&self) -> &PermissionBits {
        &self.perm
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn slot(&self) -> SlotRef {
        self.slot
    }

    pub fn parent(&self) -> Option<CapNodeId> {
        self.parent
    }

    pub fn payload_id(&self) -> PayloadId {
        self.payload
    }
}

/// The kernel-wide capability state.
pub struct CapSystem {
    pub(super) holders: BTreeMap<HolderId, CHolder>,
    pub(super) nodes: BTreeMap<CapNodeId, CapNode>,
    pub(super) payloads: BTreeMap<PayloadId, Payload>,
    next_holder: u32,
    next_node: u32,
    next_payload: u32,
}

impl CapSystem {
    pub fn new() -> Self {
        Self {
            holders: BTreeMap::new(),
            nodes: BTreeMap::new(),
            payloads: BTreeMap::new(),
            // Holder id 0 is the "no sender" sentinel of receive spaces.
            next_holder: 1,
            next_node: 1,
            next_payload: 1,
        }
    }

    /// Create a holder with its root accessor capability over MAJOR space 0
    /// at slot (0, 0).
    pub fn create_holder(&mut self) -> HolderId {
        let id = HolderId(self.next_holder);
        self.next_holder += 1;
        self.holders.insert(id, CHolder::new(id));

        let target = SpaceRef::major(id, 0);
        let idx = CapIdx::major(0, 0);
        self.create_in(target, idx, Payload::SpaceAccessor(target))
            .expect("fresh holder has slot (0, 0) free");
        self.holders
            .get_mut(&id)
            .expect("just inserted")
            .set_csa_idx(idx);
        id
    }

    pub fn holder(&self, id: HolderId) -> CapResult<&CHolder> {
        self.holders.get(&id).ok_or(CapError::InvalidCapability)
    }

    pub fn holder_mut(&mut self, id: HolderId) -> CapResult<&mut CHolder> {
        self.holders.get_mut(&id).ok_or(CapError::InvalidCapability)
    }

    pub(super) fn cspace(&self, r: SpaceRef) -> CapResult<&CSpace> {
        self.holder(r.holder)?.cspace(r.class, r.index)
    }

    pub(super) fn cspace_mut(&mut self, r: SpaceRef) -> CapResult<&mut CSpace> {
        self.holders
            .get_mut(&r.holder)
            .ok_or(CapError::InvalidCapability)?
            .cspace_mut(r.class, r.index)
    }

    pub fn node(&self, id: CapNodeId) -> CapResult<&CapNode> {
        self.nodes.get(&id).ok_or(CapError::InvalidCapability)
    }

    pub fn payload(&self, cap: CapNodeId) -> CapResult<&Payload> {
        let node = self.node(cap)?;
        self.payloads
            .get(&node.payload)
            .ok_or(CapError::PayloadError)
    }

    /// Borrow the raw payload; requires the generic UNWRAP bit.
    pub fn unwrap_payload(&self, cap: CapNodeId) -> CapResult<&Payload> {
        let node = self.node(cap)?;
        if !node.perm.imply_basic(basic::UNWRAP) {
            log::debug!("cap: unwrap denied");
            return Err(CapError::InsufficientPermissions);
        }
        self.payloads
            .get(&node.payload)
            .ok_or(CapError::PayloadError)
    }

    /// Look a slot up without touching holder contexts.
    pub fn get(&self, space: SpaceRef, idx: CapIdx) -> CapResult<CapNodeId> {
        self.cspace(space)?.get(idx)
    }

    /// Resolve an index the way a thread of `holder` would: MAJOR and MINOR
    /// go through the holder's universes, RECV through its receive space.
    pub fn access(&self, holder: HolderId, idx: CapIdx) -> CapResult<CapNodeId> {
        let r = self.holder(holder)?.space_ref(idx)?;
        self.get(r, idx)
    }

    /// Construct a payload and place its root capability (all permissions)
    /// at `idx` of `space`.
    pub fn create_in(
        &mut self,
        space: SpaceRef,
        idx: CapIdx,
        payload: Payload,
    ) -> CapResult<CapNodeId> {
        let ptype = payload.type_id();
        let node_id = CapNodeId(self.next_node);
        let payload_id = PayloadId(self.next_payload);

        self.cspace_mut(space)?.place(idx, node_id)?;
        self.next_node += 1;
        self.next_payload += 1;

        self.payloads.insert(payload_id, payload);
        self.nodes.insert(
            node_id,
            CapNode {
                payload: payload_id,
                is_root: true,
                perm: PermissionBits::all(ptype),
                slot: SlotRef {
                    space,
                    group: idx.group(),
                    slot: idx.slot(),
                },
                parent: None,
                children: Vec::new(),
            },
        );
        Ok(node_id)
    }

    /// Derive a child capability at `dst_idx` of `dst_space`.
    ///
    /// The parent must grant CLONE. The child shares the payload, records
    /// the parent in the derivation tree, and carries `perm` (which the
    /// parent must imply) or a copy of the parent's permissions. For
    /// accessor capabilities, groups the parent may not share are cleared in
    /// the child.
    pub fn clone_into(
        &mut self,
        dst_space: SpaceRef,
        dst_idx: CapIdx,
        parent: CapNodeId,
        perm: Option<PermissionBits>,
    ) -> CapResult<CapNodeId> {
        let parent_node = self.node(parent)?;
        if !parent_node.perm.imply_basic(basic::CLONE) {
            log::debug!("cap: clone denied, parent lacks CLONE");
            return Err(CapError::InsufficientPermissions);
        }
        let mut child_perm = match perm {
            Some(p) => {
                if !parent_node.perm.imply(&p) {
                    log::debug!("cap: clone denied, requested permissions exceed parent");
                    return Err(CapError::InsufficientPermissions);
                }
                p
            }
            None => parent_node.perm.clone(),
        };
        let payload_id = parent_node.payload;

        if child_perm.payload_type() == PayloadType::SpaceAccessor {
            // A group the parent may not share is withheld entirely.
            let parent_perm = parent_node.perm.clone();
            for group in 0..CSPACE_SIZE as u16 {
                let offset = csa::window_offset(group);
                if parent_perm.window(offset, csa::SLOT_BITS) & csa::SLOT_SHARE == 0 {
                    child_perm.clear_window(offset, csa::SLOT_BITS);
                }
            }
        }

        let node_id = CapNodeId(self.next_node);
        self.cspace_mut(dst_space)?.place(dst_idx, node_id)?;
        self.next_node += 1;

        self.nodes.insert(
            node_id,
            CapNode {
                payload: payload_id,
                is_root: false,
                perm: child_perm,
                slot: SlotRef {
                    space: dst_space,
                    group: dst_idx.group(),
                    slot: dst_idx.slot(),
                },
                parent: Some(parent),
                children: Vec::new(),
            },
        );
        self.nodes
            .get_mut(&parent)
            .expect("parent checked above")
            .children
            .push(node_id);
        Ok(node_id)
    }

    /// Move a capability to `dst_idx` of `dst_space`.
    ///
    /// Requires MIGRATE. The node becomes visible in the destination before
    /// the source slot is cleared; a source slot that no longer holds the
    /// node at that point is a fatal inconsistency. Migrations into a
    /// receive space are refused unless the origin's holder is the armed
    /// sender for the destination group.
    pub fn migrate_into(
        &mut self,
        dst_space: SpaceRef,
        dst_idx: CapIdx,
        origin: CapNodeId,
    ) -> CapResult<()> {
        let node = self.node(origin)?;
        if !node.perm.imply_basic(basic::MIGRATE) {
            log::debug!("cap: migrate denied, origin lacks MIGRATE");
            return Err(CapError::InsufficientPermissions);
        }
        let src_slot = node.slot;

        if dst_space.class == SpaceClass::Recv {
            let armed = self
                .holder(dst_space.holder)?
                .recv_space(dst_space.index)
                .ok()
                .and_then(|recv| recv.sender(dst_idx.group()));
            if armed != Some(src_slot.space.holder) {
                log::debug!(
                    "cap: recv space group {} not armed for holder {:?}",
                    dst_idx.group(),
                    src_slot.space.holder
                );
                return Err(CapError::InvalidIndex);
            }
        }

        self.cspace_mut(dst_space)?.place(dst_idx, origin)?;

        let src_idx = CapIdx::major(src_slot.group, src_slot.slot);
        match self.cspace_mut(src_slot.space).and_then(|s| s.take(src_idx)) {
            Ok(taken) if taken == origin => {}
            _ => panic!("cap: migrate left the source slot inconsistent"),
        }

        let node = self.nodes.get_mut(&origin).expect("checked above");
        node.slot = SlotRef {
            space: dst_space,
            group: dst_idx.group(),
            slot: dst_idx.slot(),
        };
        Ok(())
    }

    /// Remove the capability at `idx` of `space`, revoking its entire
    /// derivation subtree across every holder.
    pub fn remove_at(&mut self, space: SpaceRef, idx: CapIdx) -> CapResult<()> {
        let id = self.get(space, idx)?;
        self.revoke(id);
        Ok(())
    }

    /// Revoke `id` and every descendant. Slots are freed bottom-up; the
    /// payload dies last, and only if the removed node owned it.
    pub fn revoke(&mut self, id: CapNodeId) {
        let Some(target) = self.nodes.get(&id) else {
            return;
        };
        let owns_payload = target.is_root;
        let payload_id = target.payload;

        if let Some(parent) = target.parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.children.retain(|c| *c != id);
            }
        }

        // Preorder collection; reversed it frees children before parents.
        let mut order = Vec::new();
        let mut stack = alloc::vec![id];
        while let Some(n) = stack.pop() {
            order.push(n);
            if let Some(node) = self.nodes.get(&n) {
                stack.extend(node.children.iter().copied());
            }
        }

        for &n in order.iter().rev() {
            let node = self.nodes.remove(&n).expect("collected above");
            let slot_idx = CapIdx::major(node.slot.group, node.slot.slot);
            match self.cspace_mut(node.slot.space).and_then(|s| s.take(slot_idx)) {
                Ok(taken) if taken == n => {}
                _ => panic!("cap: revoke found a slot not holding its capability"),
            }
        }

        if owns_payload {
            self.payloads.remove(&payload_id);
        }
    }

    /// Monotone permission reduction in place.
    pub fn downgrade(&mut self, cap: CapNodeId, new: PermissionBits) -> CapResult<()> {
        let node = self.nodes.get_mut(&cap).ok_or(CapError::InvalidCapability)?;
        node.perm.downgrade(&new).inspect_err(|e| {
            log::debug!("cap: downgrade refused: {e:?}");
        })
    }

    /// Arm a receive-space group: only `sender` may migrate into it.
    pub fn recv_set_sender(
        &mut self,
        holder: HolderId,
        space_index: u16,
        group: u16,
        sender: HolderId,
    ) -> CapResult<()> {
        self.holder_mut(holder)?
            .recv_space_mut(space_index)?
            .set_sender(group, sender);
        Ok(())
    }

    /// Every occupied (group, slot, node) of a space; used by fork to clone
    /// the parent's capabilities by derivation.
    pub fn slots_of(&self, space: SpaceRef) -> CapResult<Vec<(u16, u16, CapNodeId)>> {
        Ok(self.cspace(space)?.iter().collect())
    }

    /// Tear down a holder: revoke every capability it still holds (and, by
    /// derivation, every descendant in other holders), then drop it.
    pub fn destroy_holder(&mut self, id: HolderId) {
        let Ok(holder) = self.holder(id) else {
            return;
        };
        let slots: Vec<CapNodeId> = holder.iter_slots().map(|s| s.node).collect();
        for node in slots {
            // Earlier revocations may already have consumed descendants.
            if self.nodes.contains_key(&node) {
                self.revoke(node);
            }
        }
        self.holders.remove(&id);
    }

    // TestObject operations, gated by the payload-specific bits.

    pub fn test_read(&self, cap: CapNodeId) -> CapResult<i64> {
        let node = self.node(cap)?;
        if !node.perm.imply_basic(testobj::READ) {
            log::debug!("cap: test object read denied");
            return Err(CapError::InsufficientPermissions);
        }
        match self.payloads.get(&node.payload) {
            Some(Payload::Test(obj)) => Ok(obj.read()),
            Some(_) => Err(CapError::TypeNotMatched),
            None => Err(CapError::PayloadError),
        }
    }

    pub fn test_write(&mut self, cap: CapNodeId, value: i64) -> CapResult<()> {
        self.test_mutate(cap, |obj| obj.write(value))
    }

    pub fn test_increase(&mut self, cap: CapNodeId) -> CapResult<()> {
        self.test_mutate(cap, |obj| obj.increase())
    }

    pub fn test_decrease(&mut self, cap: CapNodeId) -> CapResult<()> {
        self.test_mutate(cap, |obj| obj.decrease())
    }

    fn test_mutate(
        &mut self,
        cap: CapNodeId,
        f: impl FnOnce(&mut super::object::TestObject),
    ) -> CapResult<()> {
        let node = self.node(cap)?;
        if !node.perm.imply_basic(testobj::WRITE) {
            log::debug!("cap: test object write denied");
            return Err(CapError::InsufficientPermissions);
        }
        let payload_id = node.payload;
        match self.payloads.get_mut(&payload_id) {
            Some(Payload::Test(obj)) => {
                f(obj);
                Ok(())
            }
            Some(_) => Err(CapError::TypeNotMatched),
            None => Err(CapError::PayloadError),
        }
    }
}

impl Default for CapSystem {
    fn default() -> Self {
        Self::new()
    }
}
