//! Capability containers
//!
//! `CGroup` is a fixed table of 64 slots; `CSpace` holds up to 1024 lazily
//! created groups; `CUniverse` holds up to 1024 lazily created spaces.
//! `RecvSpace` wraps a `CSpace` and accepts migrations only from pre-armed
//! senders; everything else it exposes is read/remove-side.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use super::{CapError, CapIdx, CapNodeId, CapResult, HolderId, CGROUP_SLOTS, CSPACE_SIZE, CUNIVERSE_SIZE};

/// Fixed-capacity table of capability placements.
pub struct CGroup {
    slots: [Option<CapNodeId>; CGROUP_SLOTS],
}

impl CGroup {
    pub fn new() -> Self {
        Self {
            slots: [None; CGROUP_SLOTS],
        }
    }

    pub fn get(&self, slot: u16) -> Option<CapNodeId> {
        self.slots.get(slot as usize).copied().flatten()
    }

    pub fn place(&mut self, slot: u16, id: CapNodeId) -> CapResult<()> {
        let entry = self
            .slots
            .get_mut(slot as usize)
            .ok_or(CapError::InvalidIndex)?;
        if entry.is_some() {
            return Err(CapError::SlotBusy);
        }
        *entry = Some(id);
        Ok(())
    }

    pub fn take(&mut self, slot: u16) -> CapResult<CapNodeId> {
        self.slots
            .get_mut(slot as usize)
            .ok_or(CapError::InvalidIndex)?
            .take()
            .ok_or(CapError::InvalidIndex)
    }

    /// First free slot after `last`, or None.
    pub fn lookup_free(&self, last: Option<u16>) -> Option<u16> {
        let start = last.map(|s| s as usize + 1).unwrap_or(0);
        (start..CGROUP_SLOTS)
            .find(|&i| self.slots[i].is_none())
            .map(|i| i as u16)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, CapNodeId)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, id)| id.map(|id| (i as u16, id)))
    }
}

impl Default for CGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Sparse table of capability groups, created on first use.
pub struct CSpace {
    groups: Vec<Option<Box<CGroup>>>,
}

impl CSpace {
    pub fn new() -> Self {
        Self {
            groups: vec_none(CSPACE_SIZE),
        }
    }

    pub fn group(&self, group: u16) -> CapResult<&CGroup> {
        self.groups
            .get(group as usize)
            .ok_or(CapError::InvalidIndex)?
            .as_deref()
            .ok_or(CapError::InvalidIndex)
    }

    /// The group at `group`, created if absent.
    pub fn group_mut(&mut self, group: u16) -> CapResult<&mut CGroup> {
        let entry = self
            .groups
            .get_mut(group as usize)
            .ok_or(CapError::InvalidIndex)?;
        Ok(entry.get_or_insert_with(|| Box::new(CGroup::new())))
    }

    pub fn get(&self, idx: CapIdx) -> CapResult<CapNodeId> {
        self.group(idx.group())?
            .get(idx.slot())
            .ok_or(CapError::InvalidIndex)
    }

    pub fn place(&mut self, idx: CapIdx, id: CapNodeId) -> CapResult<()> {
        if idx.slot() as usize >= CGROUP_SLOTS {
            return Err(CapError::InvalidIndex);
        }
        self.group_mut(idx.group())?.place(idx.slot(), id)
    }

    pub fn take(&mut self, idx: CapIdx) -> CapResult<CapNodeId> {
        self.groups
            .get_mut(idx.group() as usize)
            .ok_or(CapError::InvalidIndex)?
            .as_deref_mut()
            .ok_or(CapError::InvalidIndex)?
            .take(idx.slot())
    }

    /// True when no group has been created (or all were tidied away).
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(Option::is_none)
    }

    /// Whether the group at `group` has been created.
    pub fn has_group(&self, group: u16) -> bool {
        self.groups
            .get(group as usize)
            .map(|g| g.is_some())
            .unwrap_or(false)
    }

    /// Drop every group whose slots are all free.
    pub fn tidyup(&mut self) {
        for entry in self.groups.iter_mut() {
            if entry.as_deref().is_some_and(CGroup::is_empty) {
                *entry = None;
            }
        }
    }

    /// Every occupied (group, slot, node).
    pub fn iter(&self) -> impl Iterator<Item = (u16, u16, CapNodeId)> + '_ {
        self.groups.iter().enumerate().flat_map(|(g, group)| {
            group
                .as_deref()
                .into_iter()
                .flat_map(move |grp| grp.iter().map(move |(s, id)| (g as u16, s, id)))
        })
    }
}

impl Default for CSpace {
    fn default() -> Self {
        Self::new()
    }
}

fn vec_none<T>(len: usize) -> Vec<Option<T>> {
    let mut v = Vec::with_capacity(len);
    v.resize_with(len, || None);
    v
}

/// A CSpace that only pre-armed senders may migrate into.
///
/// The receiver arms a group with `set_sender`; a migration into that group
/// is accepted only when the origin capability's holder matches. The rest of
/// the space surface is deliberately narrow: get, take, group, empty,
/// tidyup.
pub struct RecvSpace {
    space: CSpace,
    /// Armed sender per group; `None` refuses everything.
    senders: Vec<Option<HolderId>>,
}

impl RecvSpace {
    pub fn new() -> Self {
        Self {
            space: CSpace::new(),
            senders: vec![None; CSPACE_SIZE],
        }
    }

    /// Arm `group` to accept migrations from `sender`.
    pub fn set_sender(&mut self, group: u16, sender: HolderId) {
        if let Some(entry) = self.senders.get_mut(group as usize) {
            *entry = Some(sender);
        }
    }

    pub fn sender(&self, group: u16) -> Option<HolderId> {
        self.senders.get(group as usize).copied().flatten()
    }

    /// Disarm `group`.
    pub fn clear_sender(&mut self, group: u16) {
        if let Some(entry) = self.senders.get_mut(group as usize) {
            *entry = None;
        }
    }

    pub fn get(&self, idx: CapIdx) -> CapResult<CapNodeId> {
        self.space.get(idx)
    }

    pub fn take(&mut self, idx: CapIdx) -> CapResult<CapNodeId> {
        self.space.take(idx)
    }

    pub fn group(&self, group: u16) -> CapResult<&CGroup> {
        self.space.group(group)
    }

    pub fn is_empty(&self) -> bool {
        self.space.is_empty()
    }

    pub fn tidyup(&mut self) {
        self.space.tidyup()
    }

    /// Placement is reserved for the migration path, which performs the
    /// sender check first.
    pub(super) fn inner_mut(&mut self) -> &mut CSpace {
        &mut self.space
    }

    pub(super) fn inner(&self) -> &CSpace {
        &self.space
    }
}

impl Default for RecvSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Sparse table of capability spaces, created on first use.
pub struct CUniverse {
    spaces: BTreeMap<u16, CSpace>,
}

impl CUniverse {
    pub fn new() -> Self {
        Self {
            spaces: BTreeMap::new(),
        }
    }

    pub fn space(&self, index: u16) -> CapResult<&CSpace> {
        if index as usize >= CUNIVERSE_SIZE {
            return Err(CapError::InvalidIndex);
        }
        self.spaces.get(&index).ok_or(CapError::InvalidIndex)
    }

    /// The space at `index`, created if absent.
    pub fn space_mut(&mut self, index: u16) -> CapResult<&mut CSpace> {
        if index as usize >= CUNIVERSE_SIZE {
            return Err(CapError::InvalidIndex);
        }
        Ok(self.spaces.entry(index).or_default())
    }

    /// Tidy every space and drop the ones left empty.
    pub fn tidyup(&mut self) {
        self.spaces.retain(|_, space| {
            space.tidyup();
            !space.is_empty()
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &CSpace)> {
        self.spaces.iter().map(|(i, s)| (*i, s))
    }
}

impl Default for CUniverse {
    fn default() -> Self {
        Self::new()
    }
}
