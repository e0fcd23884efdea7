//! Process control blocks

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::cap::HolderId;
use crate::mm::{TaskMemory, VirtAddr};

use super::tcb::Thread;
use super::{Pid, Tid};

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Empty,
    Ready,
    Running,
    Blocked,
    Suspended,
    Zombie,
    /// Voluntarily gave up the CPU; requeued on the next scheduling pass
    Yield,
}

/// A process: threads, address space, capabilities, scheduling bookkeeping.
pub struct Process {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub state: TaskState,

    /// Ready-queue level, 0..=3.
    pub rp_level: u8,
    /// Intra-RP2 weight; scales the RR quantum.
    pub priority: u8,
    /// Remaining quantum at RP1.
    pub rp1_count: u32,
    /// Remaining quantum at RP2.
    pub rp2_count: u32,
    /// Cumulative ticks run; the RP3 ordering key.
    pub run_time: u64,

    pub memory: TaskMemory,
    pub holder: HolderId,
    pub exit_code: i32,
    /// Child pid a wait_process call is blocked on.
    pub waiting_for: Option<Pid>,

    pub threads: BTreeMap<Tid, Thread>,
    /// Round-robin rotation of runnable threads.
    ready_threads: VecDeque<Tid>,
    current_thread: Option<Tid>,
    pub main_thread: Tid,
    next_tid: u32,

    /// Low-water mark for carving additional thread stacks.
    pub thread_stack_top: VirtAddr,
}

impl Process {
    pub fn new(
        pid: Pid,
        parent: Option<Pid>,
        rp_level: u8,
        priority: u8,
        memory: TaskMemory,
        holder: HolderId,
    ) -> Self {
        Self {
            pid,
            parent,
            children: Vec::new(),
            state: TaskState::Ready,
            rp_level,
            priority,
            rp1_count: 0,
            rp2_count: 0,
            run_time: 0,
            memory,
            holder,
            exit_code: 0,
            waiting_for: None,
            threads: BTreeMap::new(),
            ready_threads: VecDeque::new(),
            current_thread: None,
            main_thread: Tid(0),
            next_tid: 1,
            thread_stack_top: VirtAddr(super::layout::THREAD_STACK_BASE),
        }
    }

    /// Next process-unique thread id.
    pub fn alloc_tid(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        tid
    }

    /// Register a thread as runnable.
    pub fn attach_thread(&mut self, thread: Thread) {
        let tid = thread.tid;
        self.threads.insert(tid, thread);
        self.ready_threads.push_back(tid);
    }

    /// Rotate to the next runnable thread (FCFS among a process's threads).
    pub fn next_ready_thread(&mut self) -> Option<Tid> {
        let tid = self.ready_threads.pop_front()?;
        self.ready_threads.push_back(tid);
        self.current_thread = Some(tid);
        Some(tid)
    }

    pub fn current_thread(&self) -> Option<Tid> {
        self.current_thread
    }

    /// Take a thread out of the runnable rotation (thread-level wait).
    pub fn block_thread(&mut self, tid: Tid) {
        self.ready_threads.retain(|t| *t != tid);
        if self.current_thread == Some(tid) {
            self.current_thread = None;
        }
    }

    /// Put a thread back into the rotation.
    pub fn wake_thread(&mut self, tid: Tid) {
        if self.threads.contains_key(&tid) && !self.ready_threads.contains(&tid) {
            self.ready_threads.push_back(tid);
        }
    }

    pub fn has_ready_threads(&self) -> bool {
        !self.ready_threads.is_empty()
    }

    pub fn thread(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(&tid)
    }
}
