//! Capability holders
//!
//! One `CHolder` per process: a MAJOR universe, a MINOR universe, and the
//! receive spaces. Threads select which space index of each universe they
//! address through the holder's context fields; capability indices carry
//! only the container kind plus (group, slot).
//!
//! Every holder bootstraps with a root `SpaceAccessor` capability over its
//! own MAJOR space 0 at slot (0, 0), granting it self-management.

use alloc::collections::BTreeMap;

use super::space::{CSpace, CUniverse, RecvSpace};
use super::{CapError, CapIdx, CapResult, HolderId, SpaceClass, SpaceRef, CUNIVERSE_SIZE};

pub struct CHolder {
    id: HolderId,
    major: CUniverse,
    minor: CUniverse,
    recv: BTreeMap<u16, RecvSpace>,
    /// Space indices the current thread addresses.
    major_ctx: u16,
    minor_ctx: u16,
    recv_ctx: u16,
    /// Where the root accessor capability lives.
    csa_idx: CapIdx,
}

impl CHolder {
    pub(super) fn new(id: HolderId) -> Self {
        Self {
            id,
            major: CUniverse::new(),
            minor: CUniverse::new(),
            recv: BTreeMap::new(),
            major_ctx: 0,
            minor_ctx: 0,
            recv_ctx: 0,
            csa_idx: CapIdx::NULL,
        }
    }

    pub fn id(&self) -> HolderId {
        self.id
    }

    /// Index of the root accessor capability (MAJOR space 0, slot (0, 0)).
    pub fn csa_idx(&self) -> CapIdx {
        self.csa_idx
    }

    pub(super) fn set_csa_idx(&mut self, idx: CapIdx) {
        self.csa_idx = idx;
    }

    /// The space a `CapIdx` of the given kind resolves to for the current
    /// thread context.
    pub fn space_ref(&self, idx: CapIdx) -> CapResult<SpaceRef> {
        match idx.space() {
            super::SpaceKind::Major => Ok(SpaceRef::major(self.id, self.major_ctx)),
            super::SpaceKind::Minor => Ok(SpaceRef::minor(self.id, self.minor_ctx)),
            super::SpaceKind::Recv => Ok(SpaceRef::recv(self.id, self.recv_ctx)),
            _ => Err(CapError::InvalidIndex),
        }
    }

    pub fn set_major_ctx(&mut self, index: u16) {
        self.major_ctx = index;
    }

    pub fn set_minor_ctx(&mut self, index: u16) {
        self.minor_ctx = index;
    }

    pub fn set_recv_ctx(&mut self, index: u16) {
        self.recv_ctx = index;
    }

    fn universe(&self, class: SpaceClass) -> &CUniverse {
        match class {
            SpaceClass::Major => &self.major,
            SpaceClass::Minor => &self.minor,
            SpaceClass::Recv => unreachable!("recv spaces are not universe-backed"),
        }
    }

    fn universe_mut(&mut self, class: SpaceClass) -> &mut CUniverse {
        match class {
            SpaceClass::Major => &mut self.major,
            SpaceClass::Minor => &mut self.minor,
            SpaceClass::Recv => unreachable!("recv spaces are not universe-backed"),
        }
    }

    pub(super) fn cspace(&self, class: SpaceClass, index: u16) -> CapResult<&CSpace> {
        match class {
            SpaceClass::Recv => Ok(self.recv_space(index)?.inner()),
            _ => self.universe(class).space(index),
        }
    }

    pub(super) fn cspace_mut(&mut self, class: SpaceClass, index: u16) -> CapResult<&mut CSpace> {
        match class {
            SpaceClass::Recv => Ok(self.recv_space_mut(index)?.inner_mut()),
            _ => self.universe_mut(class).space_mut(index),
        }
    }

    pub fn recv_space(&self, index: u16) -> CapResult<&RecvSpace> {
        self.recv.get(&index).ok_or(CapError::InvalidIndex)
    }

    /// The receive space at `index`, created if absent.
    pub fn recv_space_mut(&mut self, index: u16) -> CapResult<&mut RecvSpace> {
        if index as usize >= CUNIVERSE_SIZE {
            return Err(CapError::InvalidIndex);
        }
        Ok(self.recv.entry(index).or_default())
    }

    /// Drop empty groups and spaces in both universes.
    pub fn tidyup(&mut self) {
        self.major.tidyup();
        self.minor.tidyup();
        for recv in self.recv.values_mut() {
            recv.tidyup();
        }
    }

    /// Every occupied slot in every space of this holder.
    pub(super) fn iter_slots(&self) -> impl Iterator<Item = SuperSlot> + '_ {
        let majors = self.major.iter().flat_map(move |(index, space)| {
            space.iter().map(move |(group, slot, node)| SuperSlot {
                class: SpaceClass::Major,
                index,
                group,
                slot,
                node,
            })
        });
        let minors = self.minor.iter().flat_map(move |(index, space)| {
            space.iter().map(move |(group, slot, node)| SuperSlot {
                class: SpaceClass::Minor,
                index,
                group,
                slot,
                node,
            })
        });
        let recvs = self.recv.iter().flat_map(move |(index, space)| {
            space.inner().iter().map(move |(group, slot, node)| SuperSlot {
                class: SpaceClass::Recv,
                index: *index,
                group,
                slot,
                node,
            })
        });
        majors.chain(minors).chain(recvs)
    }
}

/// An occupied slot, as produced by `CHolder::iter_slots`.
#[allow(dead_code)]
pub(super) struct SuperSlot {
    pub class: SpaceClass,
    pub index: u16,
    pub group: u16,
    pub slot: u16,
    pub node: super::CapNodeId,
}
