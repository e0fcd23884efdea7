//! Task management
//!
//! Processes own their threads, their address space, and their capability
//! holder; the scheduler only ever sees pids. Teardown releases resources
//! bottom-up: threads (kernel stacks), capabilities, then the address space,
//! and finally the pid.

pub mod pcb;
pub mod pid;
pub mod table;
pub mod tcb;

pub use pcb::{Process, TaskState};
pub use table::ProcessTable;
pub use tcb::Thread;

use spin::Mutex;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier, unique within its process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tid(pub u32);

impl core::fmt::Display for Tid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User address-space layout for new tasks.
pub mod layout {
    use crate::mm::FRAME_SIZE;

    /// Heap base; 128 MiB span.
    pub const USER_HEAP_BASE: usize = 0x4000_0000;
    pub const USER_HEAP_SIZE: usize = 32768 * FRAME_SIZE;
    /// Heap pages pre-allocated at task creation (64 KiB).
    pub const HEAP_PREALLOC_PAGES: usize = 16;

    /// Top of the main thread's stack; 64 KiB, grows down.
    pub const MAIN_STACK_TOP: usize = 0x7000_0000;
    pub const STACK_SIZE: usize = 16 * FRAME_SIZE;

    /// Additional thread stacks are carved downwards from here.
    pub const THREAD_STACK_BASE: usize = 0x6000_0000;
}

lazy_static::lazy_static! {
    /// The kernel's process table.
    pub static ref PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());
}

pub fn init() {
    log::info!("task: process table ready");
}
