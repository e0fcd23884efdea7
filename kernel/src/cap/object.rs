//! Capability payloads
//!
//! The kernel objects capabilities refer to, as a tagged union. A payload is
//! owned by exactly one derivation-tree root; non-root capabilities share it.

use super::notification::Notification;
use super::SpaceRef;
use crate::task::{Pid, Tid};

/// Runtime type tag of a payload; permissions are only comparable within a
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    /// Accessor over one CSpace
    SpaceAccessor,
    /// Integer cell for exercising the capability machinery
    TestObject,
    /// 256-bit notification bitmap
    Notification,
    /// A process control block
    Process,
    /// A thread control block
    Thread,
}

/// Payload-specific basic bits for `TestObject` (low 16 bits stay generic).
pub mod testobj {
    pub const READ: u64 = 1 << 16;
    pub const WRITE: u64 = 1 << 17;
}

/// Payload-specific basic bits for `Process` capabilities.
pub mod process_cap {
    pub const YIELD: u64 = 1 << 16;
    pub const EXIT: u64 = 1 << 17;
    pub const FORK: u64 = 1 << 18;
    pub const GETPID: u64 = 1 << 19;
    pub const CREATE_THREAD: u64 = 1 << 20;
    pub const WAIT: u64 = 1 << 21;
}

/// Payload-specific basic bits for `Thread` capabilities.
pub mod thread_cap {
    pub const YIELD: u64 = 1 << 16;
    pub const WAIT: u64 = 1 << 17;
}

/// An integer cell used by the capability test suite; operations on it are
/// gated by `testobj::{READ, WRITE}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestObject {
    value: i64,
}

impl TestObject {
    pub const fn new(value: i64) -> Self {
        Self { value }
    }

    pub(crate) fn read(&self) -> i64 {
        self.value
    }

    pub(crate) fn write(&mut self, value: i64) {
        self.value = value;
    }

    pub(crate) fn increase(&mut self) {
        self.value += 1;
    }

    pub(crate) fn decrease(&mut self) {
        self.value -= 1;
    }
}

/// A kernel object reachable through capabilities.
#[derive(Debug)]
pub enum Payload {
    /// Grants operations on the referenced CSpace
    SpaceAccessor(SpaceRef),
    Test(TestObject),
    Notification(Notification),
    /// The process with this pid
    Process(Pid),
    /// The thread `tid` of process `pid`
    Thread { pid: Pid, tid: Tid },
}

impl Payload {
    pub fn type_id(&self) -> PayloadType {
        match self {
            Payload::SpaceAccessor(_) => PayloadType::SpaceAccessor,
            Payload::Test(_) => PayloadType::TestObject,
            Payload::Notification(_) => PayloadType::Notification,
            Payload::Process(_) => PayloadType::Process,
            Payload::Thread { .. } => PayloadType::Thread,
        }
    }
}
