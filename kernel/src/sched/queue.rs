//! Ready queues
//!
//! RP0 through RP2 are plain FIFO queues (FCFS / round-robin order); RP3 is
//! kept sorted by cumulative run time, ascending, with ties resolved by
//! insertion order (shortest-job-first).

use alloc::collections::VecDeque;

use crate::task::Pid;

pub struct ReadyQueues {
    fifo: [VecDeque<Pid>; 3],
    sjf: VecDeque<(Pid, u64)>,
}

impl ReadyQueues {
    pub fn new() -> Self {
        Self {
            fifo: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            sjf: VecDeque::new(),
        }
    }

    /// Enqueue at `level`; `run_time` only matters for RP3 ordering.
    pub fn push(&mut self, level: u8, pid: Pid, run_time: u64) {
        match level {
            0..=2 => self.fifo[level as usize].push_back(pid),
            _ => {
                // Insert after every entry with run_time <= ours.
                let pos = self
                    .sjf
                    .iter()
                    .position(|(_, rt)| *rt > run_time)
                    .unwrap_or(self.sjf.len());
                self.sjf.insert(pos, (pid, run_time));
            }
        }
    }

    pub fn pop(&mut self, level: u8) -> Option<Pid> {
        match level {
            0..=2 => self.fifo[level as usize].pop_front(),
            _ => self.sjf.pop_front().map(|(pid, _)| pid),
        }
    }

    pub fn is_empty(&self, level: u8) -> bool {
        match level {
            0..=2 => self.fifo[level as usize].is_empty(),
            _ => self.sjf.is_empty(),
        }
    }

    /// Lowest-numbered non-empty level.
    pub fn lowest_nonempty(&self) -> Option<u8> {
        (0..4u8).find(|&level| !self.is_empty(level))
    }

    /// Drop a pid from whichever queue holds it (process killed while
    /// queued).
    pub fn remove(&mut self, pid: Pid) {
        for queue in self.fifo.iter_mut() {
            queue.retain(|p| *p != pid);
        }
        self.sjf.retain(|(p, _)| *p != pid);
    }
}

impl Default for ReadyQueues {
    fn default() -> Self {
        Self::new()
    }
}
