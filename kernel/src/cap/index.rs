//! Capability indices
//!
//! A `CapIdx` is the user-visible 64-bit name of a capability slot:
//! `space << 48 | reserved << 32 | group << 16 | slot`. The space field
//! selects which of the holder's containers the lookup goes through; the
//! reserved field is ignored by comparisons so indices survive syscall
//! round-trips bit-for-bit.

/// Container selector carried in the top 16 bits of a `CapIdx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SpaceKind {
    /// The null index; never resolves
    Nullable = 0,
    /// The thread's primary space
    Major = 1,
    /// The thread's secondary space
    Minor = 2,
    /// Error marker returned by failed operations
    Error = 3,
    /// The holder's receive space
    Recv = 4,
}

impl SpaceKind {
    fn from_bits(bits: u16) -> Self {
        match bits {
            0 => SpaceKind::Nullable,
            1 => SpaceKind::Major,
            2 => SpaceKind::Minor,
            4 => SpaceKind::Recv,
            _ => SpaceKind::Error,
        }
    }
}

/// A 64-bit capability index.
#[derive(Debug, Clone, Copy)]
pub struct CapIdx(u64);

impl CapIdx {
    /// The invalid index: all zero.
    pub const NULL: CapIdx = CapIdx(0);

    pub const fn new(kind: SpaceKind, group: u16, slot: u16) -> Self {
        CapIdx(((kind as u64) << 48) | ((group as u64) << 16) | slot as u64)
    }

    /// Index into the primary space (the common case).
    pub const fn major(group: u16, slot: u16) -> Self {
        Self::new(SpaceKind::Major, group, slot)
    }

    pub const fn minor(group: u16, slot: u16) -> Self {
        Self::new(SpaceKind::Minor, group, slot)
    }

    pub const fn recv(group: u16, slot: u16) -> Self {
        Self::new(SpaceKind::Recv, group, slot)
    }

    pub const fn error() -> Self {
        Self::new(SpaceKind::Error, 0, 0)
    }

    pub const fn from_raw(raw: u64) -> Self {
        CapIdx(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn space(self) -> SpaceKind {
        SpaceKind::from_bits((self.0 >> 48) as u16)
    }

    pub const fn reserved(self) -> u16 {
        (self.0 >> 32) as u16
    }

    pub const fn group(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn slot(self) -> u16 {
        self.0 as u16
    }

    pub fn is_null(self) -> bool {
        self.space() == SpaceKind::Nullable
    }

    pub fn is_error(self) -> bool {
        self.space() == SpaceKind::Error
    }
}

impl PartialEq for CapIdx {
    /// Two indices are equal iff they name the same space/group/slot —
    /// except that any two Nullable indices are equal, as are any two Error
    /// indices, regardless of group and slot. The reserved field never
    /// participates.
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.space(), other.space());
        if a == b && matches!(a, SpaceKind::Nullable | SpaceKind::Error) {
            return true;
        }
        a == b && self.group() == other.group() && self.slot() == other.slot()
    }
}

impl Eq for CapIdx {}

impl core::fmt::Display for CapIdx {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}({}, {})", self.space(), self.group(), self.slot())
    }
}
