//! Kernel error types
//!
//! Every fallible kernel operation returns one of the enums below instead of
//! a bare string, so call sites can match on the failure and tests can assert
//! exact error values.

use core::fmt;

use crate::cap::CapError;

/// Top-level kernel error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-management errors
    Mm(MmError),
    /// Capability-system errors
    Cap(CapError),
    /// Scheduler errors
    Sched(SchedError),
    /// System-call errors
    Syscall(SyscallError),
    /// Subsystem used before its init() ran
    NotInitialized { subsystem: &'static str },
}

/// Memory-management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum MmError {
    /// The frame allocator could not satisfy the request
    OutOfMemory,
    /// Address not aligned for the requested page size
    Unaligned { addr: usize },
    /// W set without R is a reserved PTE encoding
    WriteWithoutRead,
    /// A huge-page leaf blocks the descent to the requested level
    HugePageInTheWay { vaddr: usize },
    /// Interior-node U/G bits disagree with the mapping request
    FlagMismatch { vaddr: usize },
    /// The requested virtual range collides with an existing VMA
    VmaOverlap { vaddr: usize },
    /// No VMA contains the address
    NoVma { vaddr: usize },
    /// The request runs past the end of its VMA
    VmaOutOfBounds { vaddr: usize },
    /// The virtual address has no present mapping
    Unmapped { vaddr: usize },
    /// A fault that demand paging must not repair (protection violation)
    ProtectionFault { vaddr: usize },
}

/// Scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum SchedError {
    /// rp_level outside 0..=3
    InvalidLevel { level: u8 },
    /// No such process
    NoSuchTask { pid: u32 },
    /// No such thread in the target process
    NoSuchThread { tid: u32 },
    /// Operation requires a different task state
    InvalidState,
}

/// System-call errors, mapped to negative return values at the ABI edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum SyscallError {
    /// Unknown system-call number
    UnknownSyscall { number: usize },
    /// A capability argument did not resolve or lacked the required bit
    BadCapability,
    /// A pointer argument did not translate
    BadAddress,
    /// The operation is only valid for the calling process
    NotCaller,
}

impl From<MmError> for KernelError {
    fn from(e: MmError) -> Self {
        KernelError::Mm(e)
    }
}

impl From<CapError> for KernelError {
    fn from(e: CapError) -> Self {
        KernelError::Cap(e)
    }
}

impl From<SchedError> for KernelError {
    fn from(e: SchedError) -> Self {
        KernelError::Sched(e)
    }
}

impl From<SyscallError> for KernelError {
    fn from(e: SyscallError) -> Self {
        KernelError::Syscall(e)
    }
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmError::OutOfMemory => write!(f, "out of physical memory"),
            MmError::Unaligned { addr } => write!(f, "unaligned address {addr:#x}"),
            MmError::WriteWithoutRead => write!(f, "W without R is reserved"),
            MmError::HugePageInTheWay { vaddr } => {
                write!(f, "huge page blocks descent at {vaddr:#x}")
            }
            MmError::FlagMismatch { vaddr } => {
                write!(f, "interior U/G mismatch at {vaddr:#x}")
            }
            MmError::VmaOverlap { vaddr } => write!(f, "VMA overlap at {vaddr:#x}"),
            MmError::NoVma { vaddr } => write!(f, "no VMA contains {vaddr:#x}"),
            MmError::VmaOutOfBounds { vaddr } => {
                write!(f, "request exceeds VMA bounds at {vaddr:#x}")
            }
            MmError::Unmapped { vaddr } => write!(f, "no mapping for {vaddr:#x}"),
            MmError::ProtectionFault { vaddr } => {
                write!(f, "protection violation at {vaddr:#x}")
            }
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Mm(e) => write!(f, "mm: {e}"),
            KernelError::Cap(e) => write!(f, "cap: {e:?}"),
            KernelError::Sched(e) => write!(f, "sched: {e:?}"),
            KernelError::Syscall(e) => write!(f, "syscall: {e:?}"),
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{subsystem} used before init")
            }
        }
    }
}

/// Kernel-wide result alias
pub type KernelResult<T> = Result<T, KernelError>;
