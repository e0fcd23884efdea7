//! Trap core
//!
//! Classifies `scause` and routes: timer interrupts feed the scheduler,
//! U-mode ecalls enter the syscall table, page faults go to the faulting
//! task's memory, and a recognized magic opcode in an illegal-instruction
//! trap is a kernel-extension hook. Any exception taken from S-mode is a
//! kernel bug and panics.
//!
//! The assembly entry glue saves the full register file at the top of the
//! interrupted thread's kernel stack and hands over a pointer to it; on a
//! context switch the pointer is redirected to the next thread's saved
//! context before the glue restores registers.

use crate::arch::riscv64::timer;
use crate::arch::TrapContext;
use crate::cap::CAP_SYSTEM;
use crate::mm::{PageFaultKind, VirtAddr, FRAME_ALLOCATOR};
use crate::sched::SCHEDULER;
use crate::task::{TaskState, PROCESS_TABLE};

/// RISC-V exception codes the core handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InstructionMisaligned,
    InstructionAccessFault,
    IllegalInstruction,
    Breakpoint,
    LoadMisaligned,
    LoadAccessFault,
    StoreMisaligned,
    StoreAccessFault,
    EcallU,
    EcallS,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
    Unknown(usize),
}

impl Exception {
    fn from_code(code: usize) -> Self {
        match code {
            0 => Exception::InstructionMisaligned,
            1 => Exception::InstructionAccessFault,
            2 => Exception::IllegalInstruction,
            3 => Exception::Breakpoint,
            4 => Exception::LoadMisaligned,
            5 => Exception::LoadAccessFault,
            6 => Exception::StoreMisaligned,
            7 => Exception::StoreAccessFault,
            8 => Exception::EcallU,
            9 => Exception::EcallS,
            12 => Exception::InstructionPageFault,
            13 => Exception::LoadPageFault,
            15 => Exception::StorePageFault,
            other => Exception::Unknown(other),
        }
    }

    /// The page-fault classification handed to task memory.
    pub fn page_fault_kind(self) -> Option<PageFaultKind> {
        match self {
            Exception::InstructionAccessFault => Some(PageFaultKind::InstructionFault),
            Exception::LoadAccessFault => Some(PageFaultKind::LoadFault),
            Exception::StoreAccessFault => Some(PageFaultKind::StoreFault),
            Exception::InstructionPageFault => Some(PageFaultKind::InstructionPage),
            Exception::LoadPageFault => Some(PageFaultKind::LoadPage),
            Exception::StorePageFault => Some(PageFaultKind::StorePage),
            _ => None,
        }
    }
}

/// Decoded trap cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    /// S-mode timer interrupt
    Timer,
    Exception(Exception),
    OtherInterrupt(usize),
}

const INTERRUPT_BIT: usize = 1 << (usize::BITS - 1);
const IRQ_S_TIMER: usize = 5;

pub fn classify(scause: usize) -> TrapCause {
    if scause & INTERRUPT_BIT != 0 {
        let code = scause & !INTERRUPT_BIT;
        if code == IRQ_S_TIMER {
            TrapCause::Timer
        } else {
            TrapCause::OtherInterrupt(code)
        }
    } else {
        TrapCause::Exception(Exception::from_code(scause))
    }
}

/// Magic opcodes of the illegal-instruction kernel-extension hook.
const MAGIC_GREETING: u32 = 0x0000_00FF;
const MAGIC_POW: u32 = 0x00FF_00FF;

/// Central trap handler. `ctx` points at the saved context; redirecting it
/// switches which thread the entry glue resumes.
pub fn handle_trap(ctx: &mut *mut TrapContext, scause: usize, stval: usize) {
    match classify(scause) {
        TrapCause::Timer => {
            timer::rearm();
            timer::on_tick();
            on_timer_tick(ctx);
        }
        TrapCause::Exception(e) => handle_exception(ctx, e, stval),
        TrapCause::OtherInterrupt(code) => {
            log::warn!("trap: unhandled interrupt {code}");
        }
    }
}

fn on_timer_tick(ctx: &mut *mut TrapContext) {
    let need_resched = {
        let mut table = PROCESS_TABLE.lock();
        let mut sched = SCHEDULER.lock();
        sched.tick(&mut table)
    };
    if need_resched {
        reschedule(ctx);
    }
}

fn handle_exception(ctx: &mut *mut TrapContext, e: Exception, stval: usize) {
    // SAFETY: ctx points at the saved context on the interrupted thread's
    // kernel stack for the duration of this trap.
    let frame = unsafe { &mut **ctx };

    match e {
        Exception::EcallU => {
            frame.sepc += 4;
            let resched = crate::syscall::dispatch(frame);
            if resched {
                reschedule(ctx);
            }
        }
        Exception::IllegalInstruction => {
            if frame.from_kernel() {
                panic!("illegal instruction in S-mode at {:#x}", frame.sepc);
            }
            handle_illegal_instruction(ctx, frame);
        }
        _ if e.page_fault_kind().is_some() => {
            if frame.from_kernel() {
                panic!("page fault in S-mode at {stval:#x} ({e:?})");
            }
            let kind = e.page_fault_kind().expect("guard");
            let repaired = {
                let mut table = PROCESS_TABLE.lock();
                let mut alloc = FRAME_ALLOCATOR.lock();
                let current = SCHEDULER.lock().current();
                current.and_then(|pid| table.get_mut(pid)).is_some_and(|proc| {
                    proc.memory
                        .handle_fault(&mut alloc, VirtAddr(stval), kind)
                        .is_ok()
                })
            };
            if !repaired {
                terminate_current(ctx);
            }
        }
        _ => {
            if frame.from_kernel() {
                panic!("unhandled exception {e:?} in S-mode, stval={stval:#x}");
            }
            log::error!("trap: unhandled U-mode exception {e:?}, terminating");
            terminate_current(ctx);
        }
    }
}

/// Illegal instructions with a recognized magic encoding are kernel
/// extensions; anything else from U-mode kills the process.
fn handle_illegal_instruction(ctx: &mut *mut TrapContext, frame: &mut TrapContext) {
    let mut opcode = [0u8; 4];
    let read = {
        let table = PROCESS_TABLE.lock();
        let current = SCHEDULER.lock().current();
        current
            .and_then(|pid| table.get(pid))
            .map(|proc| {
                crate::mm::user_copy::memcpy_u2k(
                    &proc.memory,
                    &mut opcode,
                    VirtAddr(frame.sepc),
                )
            })
            .is_some_and(|r| r.is_ok())
    };
    if !read {
        terminate_current(ctx);
        return;
    }

    match u32::from_le_bytes(opcode) {
        MAGIC_GREETING => {
            log::info!("kernel extension: hello from pid {:?}", SCHEDULER.lock().current());
            frame.sepc += 4;
        }
        MAGIC_POW => {
            // pow(t0, t1) -> t0
            let base = frame.t(0) as i64;
            let exp = frame.t(1) as i64;
            let mut result: i64 = 1;
            for _ in 0..exp {
                result = result.wrapping_mul(base);
            }
            frame.set_t(0, result as usize);
            frame.sepc += 4;
        }
        other => {
            log::error!("trap: illegal instruction {other:#010x} at {:#x}", frame.sepc);
            terminate_current(ctx);
        }
    }
}

/// Kill the current process (fault policy, not a panic) and move on.
fn terminate_current(ctx: &mut *mut TrapContext) {
    {
        let mut table = PROCESS_TABLE.lock();
        let sched = SCHEDULER.lock();
        if let Some(proc) = sched.current().and_then(|pid| table.get_mut(pid)) {
            log::info!("trap: terminating pid {}", proc.pid);
            proc.state = TaskState::Zombie;
        }
    }
    reschedule(ctx);
}

/// Run the scheduler and redirect the trap return to the chosen thread.
fn reschedule(ctx: &mut *mut TrapContext) {
    let mut table = PROCESS_TABLE.lock();
    let mut sched = SCHEDULER.lock();
    let outcome = sched.schedule(&mut table);

    if let Some(reap) = outcome.reap {
        let mut alloc = FRAME_ALLOCATOR.lock();
        let mut caps = CAP_SYSTEM.lock();
        table.teardown(&mut alloc, &mut caps, reap);
    }

    if let Some((pid, tid)) = outcome.next {
        let proc = table.get(pid).expect("scheduled pid exists");
        let thread = proc.thread(tid).expect("scheduled tid exists");
        *ctx = thread.context_ptr();
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        proc.memory.table().switch_root();
    } else {
        log::debug!("trap: nothing runnable, idling on the current context");
    }
}

/// Install the trap vector. The entry glue is provided by the boot
/// collaborator.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn init() {
    extern "C" {
        fn __trap_entry();
    }
    // SAFETY: __trap_entry is the linker-provided trap entry stub with the
    // required 4-byte alignment.
    unsafe {
        riscv::register::stvec::write(
            __trap_entry as usize,
            riscv::register::stvec::TrapMode::Direct,
        );
    }
    log::info!("trap: stvec installed");
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn init() {}
