//! Process table and lifecycle
//!
//! Task creation wires the three resource domains together: the address
//! space gets its heap and stack VMAs with a little pre-allocated backing,
//! the capability holder gets the process's own PCB capability, and the
//! main thread gets its kernel stack and initial context (PCB capability in
//! a0, heap base in a1). Fork deep-copies the address space and derives the
//! parent's capabilities into the child.

use alloc::collections::BTreeMap;

use crate::cap::object::{process_cap, thread_cap};
use crate::cap::permission::basic;
use crate::cap::{CapIdx, CapSystem, Payload, PayloadType, PermissionBits, SpaceRef};
use crate::error::{KernelError, SchedError};
use crate::mm::{FrameAllocator, Rwx, TaskMemory, VirtAddr, VmaKind, FRAME_SIZE};

use super::layout;
use super::pcb::{Process, TaskState};
use super::pid::PidAllocator;
use super::tcb::Thread;
use super::{Pid, Tid};

/// Default rights on a process's own PCB capability.
pub const PCB_DEFAULT_RIGHTS: u64 = basic::UNWRAP
    | basic::CLONE
    | basic::MIGRATE
    | process_cap::YIELD
    | process_cap::EXIT
    | process_cap::FORK
    | process_cap::GETPID
    | process_cap::CREATE_THREAD
    | process_cap::WAIT;

/// Default rights on a TCB capability.
pub const TCB_DEFAULT_RIGHTS: u64 =
    basic::UNWRAP | basic::CLONE | basic::MIGRATE | thread_cap::YIELD | thread_cap::WAIT;

pub struct ProcessTable {
    procs: BTreeMap<Pid, Process>,
    pids: PidAllocator,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
            pids: PidAllocator::new(),
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.procs.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    /// Create a task: address space with heap and main stack, capability
    /// holder with the PCB capability, and the main thread. The new task is
    /// Ready; the caller enqueues it.
    pub fn new_task(
        &mut self,
        alloc: &mut FrameAllocator,
        caps: &mut CapSystem,
        entry: VirtAddr,
        rp_level: u8,
        priority: u8,
        parent: Option<Pid>,
    ) -> Result<Pid, KernelError> {
        if rp_level >= crate::sched::RP_LEVELS as u8 {
            return Err(SchedError::InvalidLevel { level: rp_level }.into());
        }
        let pid = Pid(self.pids.alloc());

        let mut memory = TaskMemory::new(alloc)?;
        // 128 MiB heap, 64 KiB of it backed up front.
        memory.add_vma(VmaKind::Heap, VirtAddr(layout::USER_HEAP_BASE), layout::USER_HEAP_SIZE)?;
        memory.alloc_pages_for(
            alloc,
            VirtAddr(layout::USER_HEAP_BASE),
            layout::HEAP_PREALLOC_PAGES,
            Rwx::RW,
            true,
        )?;
        // Main stack below MAIN_STACK_TOP, top page backed.
        memory.add_vma(
            VmaKind::Stack,
            VirtAddr(layout::MAIN_STACK_TOP - layout::STACK_SIZE),
            layout::STACK_SIZE,
        )?;
        memory.alloc_pages_for(
            alloc,
            VirtAddr(layout::MAIN_STACK_TOP - FRAME_SIZE),
            1,
            Rwx::RW,
            true,
        )?;

        let holder = caps.create_holder();
        let csa = caps.holder(holder)?.csa_idx();
        let pcb_idx = caps.csa_alloc_slot(holder, csa)?;
        let pcb_cap = caps.csa_create(holder, csa, pcb_idx, Payload::Process(pid))?;
        caps.downgrade(
            pcb_cap,
            PermissionBits::new(PCB_DEFAULT_RIGHTS, PayloadType::Process),
        )?;

        let mut proc = Process::new(pid, parent, rp_level, priority, memory, holder);
        let tid = proc.alloc_tid();
        let thread = Thread::new(alloc, tid, 0, entry, VirtAddr(layout::MAIN_STACK_TOP))?;
        // The process receives its PCB capability and heap base as the
        // first two arguments.
        let ctx = thread.context_mut();
        ctx.set_arg(0, pcb_idx.raw() as usize);
        ctx.set_arg(1, layout::USER_HEAP_BASE);
        proc.main_thread = tid;
        proc.attach_thread(thread);

        if let Some(pp) = parent {
            if let Some(parent_proc) = self.procs.get_mut(&pp) {
                parent_proc.children.push(pid);
            }
        }
        log::info!("task: created pid {pid} at rp{rp_level}");
        self.procs.insert(pid, proc);
        Ok(pid)
    }

    /// Add a thread to `pid`: a stack VMA carved below the low-water mark
    /// with its top page backed, a kernel stack, and a TCB capability.
    pub fn create_thread(
        &mut self,
        alloc: &mut FrameAllocator,
        caps: &mut CapSystem,
        pid: Pid,
        entry: VirtAddr,
        priority: u8,
    ) -> Result<(Tid, CapIdx), KernelError> {
        let proc = self
            .procs
            .get_mut(&pid)
            .ok_or(SchedError::NoSuchTask { pid: pid.0 })?;

        let stack_top = proc.thread_stack_top;
        let stack_bottom = VirtAddr(stack_top.as_usize() - layout::STACK_SIZE);
        proc.thread_stack_top = stack_bottom;
        proc.memory
            .add_vma(VmaKind::Stack, stack_bottom, layout::STACK_SIZE)?;
        proc.memory.alloc_pages_for(
            alloc,
            VirtAddr(stack_top.as_usize() - FRAME_SIZE),
            1,
            Rwx::RW,
            true,
        )?;

        let tid = proc.alloc_tid();
        let thread = Thread::new(alloc, tid, priority, entry, stack_top)?;
        proc.attach_thread(thread);

        let holder = proc.holder;
        let csa = caps.holder(holder)?.csa_idx();
        let tcb_idx = caps.csa_alloc_slot(holder, csa)?;
        let tcb_cap = caps.csa_create(holder, csa, tcb_idx, Payload::Thread { pid, tid })?;
        caps.downgrade(
            tcb_cap,
            PermissionBits::new(TCB_DEFAULT_RIGHTS, PayloadType::Thread),
        )?;

        log::debug!("task: pid {pid} gained thread {tid}");
        Ok((tid, tcb_idx))
    }

    /// Fork `parent`: deep-copied address space, derived capabilities, a
    /// fresh PCB capability for the child in the same slot the parent's
    /// occupied, and a copy of the main thread's context with `a0 = 0`.
    ///
    /// Returns the child pid; the caller enqueues the child and delivers
    /// `(pcb_cap, child_pid)` to the parent.
    pub fn fork(
        &mut self,
        alloc: &mut FrameAllocator,
        caps: &mut CapSystem,
        parent_pid: Pid,
    ) -> Result<Pid, KernelError> {
        let parent = self
            .procs
            .get(&parent_pid)
            .ok_or(SchedError::NoSuchTask { pid: parent_pid.0 })?;

        let mut memory = TaskMemory::new(alloc)?;
        memory.clone_from(alloc, &parent.memory)?;

        let child_pid = Pid(self.pids.alloc());
        let child_holder = caps.create_holder();

        // Clone the parent's capabilities by derivation, slot for slot.
        // Slot (0, 0) is the child's own bootstrapped accessor; capabilities
        // over the parent's PCB become a fresh root over the child instead,
        // and the parent's TCB capabilities are not inherited.
        let parent_holder = parent.holder;
        let parent_space = SpaceRef::major(parent_holder, 0);
        let child_space = SpaceRef::major(child_holder, 0);

        enum Inherit {
            Derive,
            FreshPcb,
            Skip,
        }

        for (group, slot, node) in caps.slots_of(parent_space)? {
            if group == 0 && slot == 0 {
                continue;
            }
            let action = match caps.payload(node)? {
                Payload::Process(p) if *p == parent_pid => Inherit::FreshPcb,
                Payload::Thread { pid: p, .. } if *p == parent_pid => Inherit::Skip,
                _ => Inherit::Derive,
            };
            let idx = CapIdx::major(group, slot);
            match action {
                Inherit::Derive => {
                    caps.clone_into(child_space, idx, node, None)?;
                }
                Inherit::FreshPcb => {
                    let rights = caps.node(node)?.perm().clone();
                    let new = caps.create_in(child_space, idx, Payload::Process(child_pid))?;
                    caps.downgrade(new, rights)?;
                }
                Inherit::Skip => {}
            }
        }

        let parent = self.procs.get(&parent_pid).expect("checked above");
        let mut child = Process::new(
            child_pid,
            Some(parent_pid),
            parent.rp_level,
            parent.priority,
            memory,
            child_holder,
        );
        child.rp1_count = parent.rp1_count;
        child.rp2_count = parent.rp2_count;
        child.run_time = parent.run_time;
        child.thread_stack_top = parent.thread_stack_top;

        // Duplicate the main thread: same entry and stack, context copied,
        // a0 = 0 so the child can tell itself apart.
        let parent_main = parent
            .thread(parent.main_thread)
            .ok_or(SchedError::NoSuchThread { tid: parent.main_thread.0 })?;
        let tid = child.alloc_tid();
        let thread = Thread::new(
            alloc,
            tid,
            parent_main.priority,
            parent_main.entry,
            parent_main.user_sp,
        )?;
        *thread.context_mut() = parent_main.context().clone();
        thread.context_mut().set_arg(0, 0);
        child.main_thread = tid;
        child.attach_thread(thread);

        self.procs
            .get_mut(&parent_pid)
            .expect("checked above")
            .children
            .push(child_pid);
        log::info!("task: pid {parent_pid} forked into pid {child_pid}");
        self.procs.insert(child_pid, child);
        Ok(child_pid)
    }

    /// Reap a Zombie: threads, capabilities, address space, pid — in that
    /// order.
    pub fn teardown(&mut self, alloc: &mut FrameAllocator, caps: &mut CapSystem, pid: Pid) {
        let Some(proc) = self.procs.get(&pid) else {
            log::error!("task: teardown of unknown pid {pid}");
            return;
        };
        if proc.state != TaskState::Zombie {
            log::error!("task: refusing to tear down pid {pid} in state {:?}", proc.state);
            return;
        }
        let proc = self.procs.remove(&pid).expect("checked above");

        for thread in proc.threads.values() {
            alloc.free_frame(thread.kstack);
        }
        caps.notification_forget_waiter(pid);
        caps.destroy_holder(proc.holder);
        proc.memory.release(alloc);

        if let Some(pp) = proc.parent {
            if let Some(parent) = self.procs.get_mut(&pp) {
                parent.children.retain(|c| *c != pid);
            }
        }
        for child in proc.children {
            if let Some(orphan) = self.procs.get_mut(&child) {
                orphan.parent = None;
            }
        }
        self.pids.free(pid.0);
        log::info!("task: pid {pid} reaped");
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
