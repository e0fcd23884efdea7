//! Capability system
//!
//! Every kernel object a process can touch is reached through a capability:
//! an unforgeable slot entry carrying a permission set and a position in the
//! derivation tree. Containers nest as holder → universe → space → group →
//! capability; one process owns one `CHolder`.
//!
//! All capability state lives in a single arena (`CapSystem`): holders,
//! derivation-tree nodes, and payloads are keyed by integer ids, so revoking
//! a subtree that spans several holders is a plain post-order walk.

pub mod csa;
pub mod holder;
pub mod index;
pub mod notification;
pub mod object;
pub mod permission;
pub mod space;
pub mod system;

#[cfg(all(test, not(target_os = "none")))]
mod tests;

pub use holder::CHolder;
pub use index::{CapIdx, SpaceKind};
pub use notification::{Notification, Waiter};
pub use object::{Payload, PayloadType, TestObject};
pub use permission::PermissionBits;
pub use system::{CapNode, CapSystem};

use spin::Mutex;

/// CSpaces per universe
pub const CUNIVERSE_SIZE: usize = 1024;
/// CGroups per CSpace
pub const CSPACE_SIZE: usize = 1024;
/// Capability slots per CGroup
pub const CGROUP_SLOTS: usize = 64;

/// Capability-system error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum CapError {
    InvalidCapability,
    InvalidIndex,
    InsufficientPermissions,
    TypeNotMatched,
    PayloadError,
    CreationFailed,
    SlotBusy,
    Unknown,
}

pub type CapResult<T> = Result<T, CapError>;

/// Identifies one `CHolder` in the arena. Nonzero; zero is the "no sender"
/// sentinel in receive spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HolderId(pub u32);

/// Identifies one derivation-tree node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CapNodeId(pub u32);

/// Identifies one payload in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PayloadId(pub u32);

/// Which container of a holder a space lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceClass {
    Major,
    Minor,
    Recv,
}

/// Addresses one CSpace: holder, container, space index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceRef {
    pub holder: HolderId,
    pub class: SpaceClass,
    pub index: u16,
}

impl SpaceRef {
    pub const fn major(holder: HolderId, index: u16) -> Self {
        Self { holder, class: SpaceClass::Major, index }
    }

    pub const fn minor(holder: HolderId, index: u16) -> Self {
        Self { holder, class: SpaceClass::Minor, index }
    }

    pub const fn recv(holder: HolderId, index: u16) -> Self {
        Self { holder, class: SpaceClass::Recv, index }
    }
}

/// A capability's home slot: space plus (group, slot) within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub space: SpaceRef,
    pub group: u16,
    pub slot: u16,
}

lazy_static::lazy_static! {
    /// The kernel's capability arena.
    pub static ref CAP_SYSTEM: Mutex<CapSystem> = Mutex::new(CapSystem::new());
}

pub fn init() {
    // The arena is ready as soon as the static exists; the kernel holder is
    // created by the task layer for the init process.
    log::info!("cap: capability system ready");
}
