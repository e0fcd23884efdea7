//! Thread control blocks
//!
//! A thread owns one physical frame as its kernel stack; the architectural
//! register snapshot lives at the top of that frame, exactly where the trap
//! entry glue saves it.

use crate::arch::TrapContext;
use crate::error::MmError;
use crate::mm::{phys_to_virt, FrameAllocator, PhysAddr, VirtAddr, FRAME_SIZE};

use super::Tid;

pub struct Thread {
    pub tid: Tid,
    pub priority: u8,
    /// The kernel stack frame; returned to the buddy on teardown.
    pub kstack: PhysAddr,
    pub entry: VirtAddr,
    pub user_sp: VirtAddr,
}

impl Thread {
    /// Allocate the kernel stack and seed a fresh U-mode context.
    pub fn new(
        alloc: &mut FrameAllocator,
        tid: Tid,
        priority: u8,
        entry: VirtAddr,
        user_sp: VirtAddr,
    ) -> Result<Self, MmError> {
        let kstack = alloc.alloc_zeroed_frame().ok_or(MmError::OutOfMemory)?;
        let thread = Self {
            tid,
            priority,
            kstack,
            entry,
            user_sp,
        };
        *thread.context_mut() = TrapContext::new_user(entry.as_usize(), user_sp.as_usize());
        Ok(thread)
    }

    /// Address of the saved context at the top of the kernel stack.
    pub fn context_ptr(&self) -> *mut TrapContext {
        let top = phys_to_virt(self.kstack) as usize + FRAME_SIZE;
        (top - core::mem::size_of::<TrapContext>()) as *mut TrapContext
    }

    /// The saved register snapshot.
    #[allow(clippy::mut_from_ref)]
    pub fn context_mut(&self) -> &mut TrapContext {
        // SAFETY: the kernel stack frame is exclusively owned by this thread
        // and the context slot is within its top; single-hart kernel.
        unsafe { &mut *self.context_ptr() }
    }

    pub fn context(&self) -> &TrapContext {
        // SAFETY: as in context_mut, read-only.
        unsafe { &*self.context_ptr() }
    }

    /// Stack-pointer value the trap entry uses for this thread's kernel
    /// stack.
    pub fn kstack_top(&self) -> usize {
        phys_to_virt(self.kstack) as usize + FRAME_SIZE
    }
}
