//! FerriteOS kernel library
//!
//! A RISC-V 64 (SV39, S-mode) capability-based microkernel: buddy frame
//! allocator, SV39 paging with demand-paged task address spaces, a
//! holder/universe/space/group capability store with derivation trees, a
//! four-level scheduler, and notification-based IPC.
//!
//! The crate builds for `riscv64gc-unknown-none-elf` (the kernel proper)
//! and for the host, where the subsystem logic runs under the standard test
//! harness against an arena standing in for physical memory.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Bare metal uses the kernel heap; the host delegates to the system
// allocator so test code using Vec/BTreeMap runs unmodified.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootstrap;
pub mod cap;
pub mod error;
pub mod ipc;
pub mod log_service;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod task;
pub mod trap;

/// Hand a contiguous physical block to the kernel heap.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn heap_init(start: *mut u8, size: usize) {
    // SAFETY: the block comes fresh from the buddy allocator and is mapped;
    // it is handed to the heap exactly once.
    unsafe {
        ALLOCATOR.lock().init(start, size);
    }
}

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {layout:?}");
}
