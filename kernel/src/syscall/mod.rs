//! System calls
//!
//! Numbered dispatch out of the U-mode ecall path. Arguments arrive in
//! a0..a5, the number in a7, and the result goes back in a0. Capability
//! arguments are raw `CapIdx` values resolved against the caller's holder;
//! string arguments cross the boundary through `memcpy_u2k`.

use alloc::vec::Vec;

use crate::arch::riscv64::timer::TICK_MS;
use crate::arch::TrapContext;
use crate::cap::object::{process_cap, thread_cap};
use crate::cap::{CapError, CapIdx, CapNodeId, CapResult, CapSystem, Payload, CAP_SYSTEM};
use crate::ipc;
use crate::mm::{user_copy, VirtAddr};
use crate::sched::SCHEDULER;
use crate::task::{Pid, TaskState, Tid, PROCESS_TABLE};

pub const SYS_EXIT: usize = 1;
pub const SYS_YIELD: usize = 2;
pub const SYS_FORK: usize = 3;
pub const SYS_GETPID: usize = 4;
pub const SYS_CREATE_THREAD: usize = 5;
pub const SYS_WAIT_NOTIFICATION: usize = 6;
pub const SYS_NOTIFICATION_SET: usize = 7;
pub const SYS_WRITE_SERIAL: usize = 8;
pub const SYS_NOTIFICATION_RESET: usize = 9;
pub const SYS_NOTIFICATION_CHECK: usize = 10;
pub const SYS_SLEEP: usize = 11;
pub const SYS_WAIT_PROCESS: usize = 12;
pub const SYS_LOG: usize = 13;

/// Error return value at the ABI edge.
const ERR: usize = usize::MAX;

/// Longest string a user process may pass to the console calls.
const MAX_USER_STR: usize = 1024;

/// Resolve a Process capability argument and check `required`.
fn process_target(caps: &CapSystem, cap: CapNodeId, required: u64) -> CapResult<Pid> {
    let node = caps.node(cap)?;
    if !node.perm().imply_basic(required) {
        log::debug!("syscall: process capability lacks {required:#x}");
        return Err(CapError::InsufficientPermissions);
    }
    match caps.payload(cap)? {
        Payload::Process(pid) => Ok(*pid),
        _ => Err(CapError::TypeNotMatched),
    }
}

/// Resolve a Thread capability argument and check `required`.
fn thread_target(caps: &CapSystem, cap: CapNodeId, required: u64) -> CapResult<(Pid, Tid)> {
    let node = caps.node(cap)?;
    if !node.perm().imply_basic(required) {
        log::debug!("syscall: thread capability lacks {required:#x}");
        return Err(CapError::InsufficientPermissions);
    }
    match caps.payload(cap)? {
        Payload::Thread { pid, tid } => Ok((*pid, *tid)),
        _ => Err(CapError::TypeNotMatched),
    }
}

/// Dispatch a U-mode ecall. Returns true when the caller must reschedule
/// before returning to user mode.
pub fn dispatch(frame: &mut TrapContext) -> bool {
    let number = frame.syscall_number();
    let Some(caller) = SCHEDULER.lock().current() else {
        frame.set_return(ERR);
        return false;
    };

    let (ret, resched) = match number {
        SYS_EXIT => sys_exit(caller, frame.arg(0) as u64, frame.arg(1)),
        SYS_YIELD => sys_yield(caller, frame.arg(0) as u64),
        SYS_FORK => sys_fork(caller, frame.arg(0) as u64),
        SYS_GETPID => sys_getpid(caller, frame.arg(0) as u64),
        SYS_CREATE_THREAD => sys_create_thread(
            caller,
            frame.arg(0) as u64,
            frame.arg(1),
            frame.arg(2) as u8,
        ),
        SYS_WAIT_NOTIFICATION => sys_wait_notification(
            caller,
            frame.arg(0) as u64,
            frame.arg(1) as u64,
            frame.arg(2),
        ),
        SYS_NOTIFICATION_SET => sys_notification_bit(caller, frame.arg(0) as u64, frame.arg(1), BitOp::Set),
        SYS_NOTIFICATION_RESET => {
            sys_notification_bit(caller, frame.arg(0) as u64, frame.arg(1), BitOp::Reset)
        }
        SYS_NOTIFICATION_CHECK => {
            sys_notification_bit(caller, frame.arg(0) as u64, frame.arg(1), BitOp::Check)
        }
        SYS_WRITE_SERIAL => sys_write_serial(caller, frame.arg(1)),
        SYS_LOG => sys_log(caller, frame.arg(0)),
        SYS_SLEEP => sys_sleep(caller, frame.arg(0)),
        SYS_WAIT_PROCESS => sys_wait_process(caller, frame.arg(0) as u64),
        other => {
            log::warn!("syscall: unknown number {other} from pid {caller}");
            (ERR, false)
        }
    };
    frame.set_return(ret);
    resched
}

fn sys_exit(caller: Pid, pcb_raw: u64, code: usize) -> (usize, bool) {
    let mut table = PROCESS_TABLE.lock();
    let caps = CAP_SYSTEM.lock();
    let Some(holder) = table.get(caller).map(|p| p.holder) else {
        return (ERR, false);
    };
    let target = caps
        .access(holder, CapIdx::from_raw(pcb_raw))
        .and_then(|cap| process_target(&caps, cap, process_cap::EXIT));
    let Ok(target) = target else {
        return (ERR, false);
    };

    let waiting_parent = {
        let Some(proc) = table.get_mut(target) else {
            return (ERR, false);
        };
        log::info!("syscall: pid {target} exits with code {code}");
        proc.state = TaskState::Zombie;
        proc.exit_code = code as i32;
        proc.parent
    };
    // A parent blocked in wait_process sees the exit.
    drop(caps);
    if let Some(pp) = waiting_parent {
        let waiting = table
            .get(pp)
            .is_some_and(|p| p.waiting_for == Some(target));
        if waiting {
            if let Some(parent) = table.get_mut(pp) {
                parent.waiting_for = None;
            }
            SCHEDULER.lock().wake(&mut table, pp);
        }
    }
    (0, true)
}

fn sys_yield(caller: Pid, cap_raw: u64) -> (usize, bool) {
    let mut table = PROCESS_TABLE.lock();
    let mut sched = SCHEDULER.lock();
    let caps = CAP_SYSTEM.lock();
    let Some(holder) = table.get(caller).map(|p| p.holder) else {
        return (ERR, false);
    };
    let allowed = caps
        .access(holder, CapIdx::from_raw(cap_raw))
        .and_then(|cap| {
            process_target(&caps, cap, process_cap::YIELD)
                .map(|_| ())
                .or_else(|_| thread_target(&caps, cap, thread_cap::YIELD).map(|_| ()))
        });
    if allowed.is_err() {
        return (ERR, false);
    }
    sched.yield_current(&mut table);
    (0, true)
}

fn sys_fork(caller: Pid, pcb_raw: u64) -> (usize, bool) {
    let mut table = PROCESS_TABLE.lock();
    let mut sched = SCHEDULER.lock();
    let mut alloc = crate::mm::FRAME_ALLOCATOR.lock();
    let mut caps = CAP_SYSTEM.lock();
    let Some(holder) = table.get(caller).map(|p| p.holder) else {
        return (ERR, false);
    };
    let target = caps
        .access(holder, CapIdx::from_raw(pcb_raw))
        .and_then(|cap| process_target(&caps, cap, process_cap::FORK));
    let Ok(target) = target else {
        return (ERR, false);
    };

    match table.fork(&mut alloc, &mut caps, target) {
        Ok(child) => {
            sched.enqueue(&mut table, child);
            (child.0 as usize, true)
        }
        Err(e) => {
            log::error!("syscall: fork failed: {e}");
            (ERR, false)
        }
    }
}

fn sys_getpid(caller: Pid, pcb_raw: u64) -> (usize, bool) {
    let table = PROCESS_TABLE.lock();
    let caps = CAP_SYSTEM.lock();
    let Some(holder) = table.get(caller).map(|p| p.holder) else {
        return (ERR, false);
    };
    match caps
        .access(holder, CapIdx::from_raw(pcb_raw))
        .and_then(|cap| process_target(&caps, cap, process_cap::GETPID))
    {
        Ok(pid) => (pid.0 as usize, false),
        Err(_) => (ERR, false),
    }
}

fn sys_create_thread(caller: Pid, pcb_raw: u64, entry: usize, priority: u8) -> (usize, bool) {
    let mut table = PROCESS_TABLE.lock();
    let mut alloc = crate::mm::FRAME_ALLOCATOR.lock();
    let mut caps = CAP_SYSTEM.lock();
    let Some(holder) = table.get(caller).map(|p| p.holder) else {
        return (ERR, false);
    };
    let target = caps
        .access(holder, CapIdx::from_raw(pcb_raw))
        .and_then(|cap| process_target(&caps, cap, process_cap::CREATE_THREAD));
    let Ok(target) = target else {
        return (ERR, false);
    };

    match table.create_thread(&mut alloc, &mut caps, target, VirtAddr(entry), priority) {
        Ok((_, tcb_idx)) => (tcb_idx.raw() as usize, false),
        Err(e) => {
            log::error!("syscall: create_thread failed: {e}");
            (ERR, false)
        }
    }
}

fn sys_wait_notification(caller: Pid, tcb_raw: u64, notif_raw: u64, bit: usize) -> (usize, bool) {
    let mut table = PROCESS_TABLE.lock();
    let mut sched = SCHEDULER.lock();
    let mut caps = CAP_SYSTEM.lock();

    // An invalid thread capability means a process-level wait.
    let tid = if CapIdx::from_raw(tcb_raw).is_null() {
        None
    } else {
        let Some(holder) = table.get(caller).map(|p| p.holder) else {
            return (ERR, false);
        };
        match caps
            .access(holder, CapIdx::from_raw(tcb_raw))
            .and_then(|cap| thread_target(&caps, cap, thread_cap::WAIT))
        {
            Ok((pid, tid)) if pid == caller => Some(tid),
            _ => return (ERR, false),
        }
    };

    match ipc::wait_notification(
        &mut caps,
        &mut table,
        &mut sched,
        caller,
        tid,
        CapIdx::from_raw(notif_raw),
        bit,
    ) {
        Ok(ipc::WaitOutcome::Immediate) => (0, false),
        Ok(ipc::WaitOutcome::Blocked) => (0, true),
        Err(e) => {
            log::debug!("syscall: wait_notification refused: {e:?}");
            (ERR, false)
        }
    }
}

enum BitOp {
    Set,
    Reset,
    Check,
}

fn sys_notification_bit(caller: Pid, notif_raw: u64, bit: usize, op: BitOp) -> (usize, bool) {
    let mut table = PROCESS_TABLE.lock();
    let mut sched = SCHEDULER.lock();
    let mut caps = CAP_SYSTEM.lock();
    let idx = CapIdx::from_raw(notif_raw);
    let result = match op {
        BitOp::Set => ipc::notification_set(&mut caps, &mut table, &mut sched, caller, idx, bit)
            .map(|()| (0, true)),
        BitOp::Reset => {
            ipc::notification_reset(&mut caps, &table, caller, idx, bit).map(|()| (0, false))
        }
        BitOp::Check => ipc::notification_check(&caps, &table, caller, idx, bit)
            .map(|set| (set as usize, false)),
    };
    result.unwrap_or_else(|e| {
        log::debug!("syscall: notification op refused: {e:?}");
        (ERR, false)
    })
}

fn sys_write_serial(caller: Pid, str_ptr: usize) -> (usize, bool) {
    let table = PROCESS_TABLE.lock();
    let Some(proc) = table.get(caller) else {
        return (ERR, false);
    };
    let mut buf = Vec::new();
    if user_copy::strncpy_u2k(&proc.memory, &mut buf, VirtAddr(str_ptr), MAX_USER_STR).is_err() {
        return (ERR, false);
    }
    let text = core::str::from_utf8(&buf).unwrap_or("<invalid utf-8>");
    print!("{text}");
    (buf.len(), false)
}

fn sys_log(caller: Pid, str_ptr: usize) -> (usize, bool) {
    let table = PROCESS_TABLE.lock();
    let Some(proc) = table.get(caller) else {
        return (ERR, false);
    };
    let mut buf = Vec::new();
    if user_copy::strncpy_u2k(&proc.memory, &mut buf, VirtAddr(str_ptr), MAX_USER_STR).is_err() {
        return (ERR, false);
    }
    log::info!("pid {caller}: {}", core::str::from_utf8(&buf).unwrap_or("<invalid utf-8>"));
    (0, false)
}

fn sys_sleep(caller: Pid, ms: usize) -> (usize, bool) {
    let mut table = PROCESS_TABLE.lock();
    let mut sched = SCHEDULER.lock();
    if sched.current() != Some(caller) {
        return (ERR, false);
    }
    let ticks = (ms as u64).div_ceil(TICK_MS).max(1);
    sched.sleep_current(&mut table, ticks);
    (0, true)
}

fn sys_wait_process(caller: Pid, pcb_raw: u64) -> (usize, bool) {
    let mut table = PROCESS_TABLE.lock();
    let mut sched = SCHEDULER.lock();
    let caps = CAP_SYSTEM.lock();
    let Some(holder) = table.get(caller).map(|p| p.holder) else {
        return (ERR, false);
    };
    let target = caps
        .access(holder, CapIdx::from_raw(pcb_raw))
        .and_then(|cap| process_target(&caps, cap, process_cap::WAIT));
    let Ok(target) = target else {
        return (ERR, false);
    };

    let gone = match table.get(target) {
        None => true,
        Some(p) => p.state == TaskState::Zombie,
    };
    if gone {
        return (0, false);
    }
    if let Some(proc) = table.get_mut(caller) {
        proc.waiting_for = Some(target);
    }
    sched.block_current(&mut table);
    (0, true)
}
