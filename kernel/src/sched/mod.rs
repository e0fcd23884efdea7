//! Four-level scheduler
//!
//! Priority-preemptive across levels, with a policy per level:
//!
//! - RP0, real-time: FCFS; once running it keeps the CPU until it blocks or
//!   exits, and nothing below ever preempts it.
//! - RP1, service: round-robin, quantum [`RP1_QUANTUM`].
//! - RP2, user: round-robin, quantum [`RP2_QUANTUM`] scaled by the task's
//!   internal priority weight.
//! - RP3, daemon: shortest-job-first by cumulative run time, updated on
//!   every tick the task runs.
//!
//! Scheduling events are the timer tick, yield, voluntary block,
//! termination, and fork. On every event the lowest-numbered non-empty
//! queue wins; a running task at a numerically higher level is preempted
//! and re-queued.

pub mod queue;

use spin::Mutex;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::task::pcb::TaskState;
use crate::task::{Pid, ProcessTable, Tid};

use queue::ReadyQueues;

/// Number of ready-queue levels.
pub const RP_LEVELS: usize = 4;
/// RP1 round-robin quantum in ticks.
pub const RP1_QUANTUM: u32 = 5;
/// RP2 base quantum in ticks; multiplied by the task's priority weight.
pub const RP2_QUANTUM: u32 = 3;

/// Result of a scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOutcome {
    /// Thread to run next, or None to idle.
    pub next: Option<(Pid, Tid)>,
    /// A Zombie the caller must reap (with the task-table locks held).
    pub reap: Option<Pid>,
}

pub struct Scheduler {
    queues: ReadyQueues,
    current: Option<Pid>,
    /// Sleeping tasks keyed by wake-up tick.
    sleepers: BTreeMap<u64, Vec<Pid>>,
    ticks: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            queues: ReadyQueues::new(),
            current: None,
            sleepers: BTreeMap::new(),
            ticks: 0,
        }
    }

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Make `pid` runnable and queue it at its level.
    pub fn enqueue(&mut self, table: &mut ProcessTable, pid: Pid) {
        let Some(proc) = table.get_mut(pid) else {
            log::error!("sched: enqueue of unknown pid {pid}");
            return;
        };
        proc.state = TaskState::Ready;
        self.queues.push(proc.rp_level, pid, proc.run_time);
    }

    /// Account one timer tick. Returns true when the caller must run
    /// `schedule()`: a higher-priority task became runnable, the current
    /// task's quantum ran out, or the current task can no longer run.
    pub fn tick(&mut self, table: &mut ProcessTable) -> bool {
        self.ticks += 1;
        self.wake_sleepers(table);

        let Some(cur) = self.current else {
            return self.queues.lowest_nonempty().is_some();
        };
        let Some(proc) = table.get_mut(cur) else {
            return true;
        };

        match proc.rp_level {
            1 => proc.rp1_count = proc.rp1_count.saturating_sub(1),
            2 => proc.rp2_count = proc.rp2_count.saturating_sub(1),
            3 => proc.run_time += 1,
            _ => {}
        }

        if proc.state != TaskState::Running {
            return true;
        }
        let level = proc.rp_level;
        let exhausted = match level {
            1 => proc.rp1_count == 0,
            2 => proc.rp2_count == 0,
            _ => false,
        };
        if exhausted {
            return true;
        }
        match self.queues.lowest_nonempty() {
            Some(ready) => ready < level,
            None => false,
        }
    }

    /// Voluntarily give up the CPU; requeued at the level's tail.
    pub fn yield_current(&mut self, table: &mut ProcessTable) {
        if let Some(proc) = self.current.and_then(|c| table.get_mut(c)) {
            proc.state = TaskState::Yield;
        }
    }

    /// Block the current task (waiting on a notification or a child).
    pub fn block_current(&mut self, table: &mut ProcessTable) {
        if let Some(proc) = self.current.and_then(|c| table.get_mut(c)) {
            proc.state = TaskState::Blocked;
        }
    }

    /// Move a blocked task back to Ready and queue it.
    pub fn wake(&mut self, table: &mut ProcessTable, pid: Pid) {
        let Some(proc) = table.get(pid) else {
            return;
        };
        if proc.state == TaskState::Blocked || proc.state == TaskState::Suspended {
            self.enqueue(table, pid);
        }
    }

    /// Put the current task to sleep for `ticks` timer ticks.
    pub fn sleep_current(&mut self, table: &mut ProcessTable, ticks: u64) {
        let Some(cur) = self.current else {
            return;
        };
        if let Some(proc) = table.get_mut(cur) {
            proc.state = TaskState::Blocked;
            self.sleepers.entry(self.ticks + ticks.max(1)).or_default().push(cur);
        }
    }

    fn wake_sleepers(&mut self, table: &mut ProcessTable) {
        let due: Vec<u64> = self
            .sleepers
            .range(..=self.ticks)
            .map(|(t, _)| *t)
            .collect();
        for t in due {
            if let Some(pids) = self.sleepers.remove(&t) {
                for pid in pids {
                    self.wake(table, pid);
                }
            }
        }
    }

    /// Select the next thread, following the level cascade. The current
    /// task is requeued (Running/Yield → Ready), kept (still entitled to
    /// its level), or handed back for reaping (Zombie).
    pub fn schedule(&mut self, table: &mut ProcessTable) -> ScheduleOutcome {
        let prev = self.current;
        let next = self.fetch_next(table);

        // Still the best choice: keep running on the same thread rotation.
        if next.is_some() && next == prev {
            let pid = next.expect("checked");
            let tid = table.get_mut(pid).and_then(|p| p.next_ready_thread());
            return ScheduleOutcome {
                next: tid.map(|t| (pid, t)),
                reap: None,
            };
        }

        let mut reap = None;
        if let Some(cur) = prev {
            if let Some(proc) = table.get_mut(cur) {
                if matches!(proc.state, TaskState::Running | TaskState::Yield) {
                    proc.state = TaskState::Ready;
                }
                match proc.state {
                    TaskState::Ready => {
                        self.queues.push(proc.rp_level, cur, proc.run_time);
                    }
                    TaskState::Zombie => {
                        log::info!("sched: pid {cur} is a zombie, reaping");
                        reap = Some(cur);
                    }
                    _ => {}
                }
            }
            self.current = None;
        }

        let Some(pid) = next else {
            return ScheduleOutcome { next: None, reap };
        };

        let proc = table.get_mut(pid).expect("fetch_next screens liveness");
        proc.state = TaskState::Running;
        match proc.rp_level {
            1 => proc.rp1_count = RP1_QUANTUM,
            2 => proc.rp2_count = RP2_QUANTUM * u32::from(proc.priority.max(1)),
            _ => {}
        }
        log::trace!("sched: switch to pid {pid} at rp{}", proc.rp_level);
        self.current = Some(pid);
        let tid = proc.next_ready_thread();
        ScheduleOutcome {
            next: tid.map(|t| (pid, t)),
            reap,
        }
    }

    /// The level cascade of the ready queues, honoring the current task's
    /// entitlement to continue at its own level.
    fn fetch_next(&mut self, table: &mut ProcessTable) -> Option<Pid> {
        let current = self.current.and_then(|pid| {
            table
                .get(pid)
                .map(|p| (pid, p.state, p.rp_level, p.rp1_count, p.rp2_count))
        });

        // RP0 runs until it blocks or exits.
        if let Some((pid, TaskState::Running, 0, _, _)) = current {
            return Some(pid);
        }
        if let Some(pid) = self.pop_ready(table, 0) {
            return Some(pid);
        }

        if let Some((pid, TaskState::Running, 1, rp1, _)) = current {
            if rp1 > 0 {
                return Some(pid);
            }
        }
        if let Some(pid) = self.pop_ready(table, 1) {
            return Some(pid);
        }

        if let Some((pid, TaskState::Running, 2, _, rp2)) = current {
            if rp2 > 0 {
                return Some(pid);
            }
        }
        if let Some(pid) = self.pop_ready(table, 2) {
            return Some(pid);
        }

        if let Some((pid, TaskState::Running, 3, _, _)) = current {
            return Some(pid);
        }
        if let Some(pid) = self.pop_ready(table, 3) {
            return Some(pid);
        }

        // Nothing queued; a still-running current task carries on.
        if let Some((pid, TaskState::Running, _, _, _)) = current {
            return Some(pid);
        }
        None
    }

    /// Pop entries at `level` until one is actually runnable. Yielded tasks
    /// rotate to the tail; anything else stale is dropped.
    fn pop_ready(&mut self, table: &mut ProcessTable, level: u8) -> Option<Pid> {
        loop {
            let pid = self.queues.pop(level)?;
            match table.get_mut(pid) {
                Some(proc) if proc.state == TaskState::Ready => return Some(pid),
                Some(proc) if proc.state == TaskState::Yield => {
                    proc.state = TaskState::Ready;
                    let run_time = proc.run_time;
                    self.queues.push(level, pid, run_time);
                }
                _ => {
                    log::debug!("sched: dropping stale queue entry pid {pid}");
                }
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    /// The machine's scheduler.
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

pub fn init() {
    log::info!("sched: four-level ready queues online");
}
