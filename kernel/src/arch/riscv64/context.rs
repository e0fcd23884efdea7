//! Trap context
//!
//! The register snapshot saved at the top of a thread's kernel stack on every
//! trap. Layout matches the trap-entry glue: x1..x31 in order, then sepc and
//! sstatus.

/// Saved register state of an interrupted thread.
///
/// `regs[i]` holds `x(i+1)`; x0 is hardwired to zero and not stored.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct TrapContext {
    /// x1..x31
    pub regs: [usize; 31],
    /// Supervisor exception program counter
    pub sepc: usize,
    /// Supervisor status at trap time
    pub sstatus: usize,
}

/// sstatus.SPP: privilege level the trap came from (1 = S-mode)
pub const SSTATUS_SPP: usize = 1 << 8;
/// sstatus.SPIE: interrupt-enable to restore on sret
pub const SSTATUS_SPIE: usize = 1 << 5;

impl TrapContext {
    /// Zeroed context.
    pub const fn zeroed() -> Self {
        Self {
            regs: [0; 31],
            sepc: 0,
            sstatus: 0,
        }
    }

    /// Fresh U-mode context: entry point, user stack, interrupts enabled
    /// after sret.
    pub fn new_user(entry: usize, user_sp: usize) -> Self {
        let mut ctx = Self::zeroed();
        ctx.sepc = entry;
        ctx.sstatus = SSTATUS_SPIE; // SPP = 0: return to U-mode
        ctx.set_sp(user_sp);
        ctx
    }

    /// True if the trap came from S-mode.
    pub fn from_kernel(&self) -> bool {
        self.sstatus & SSTATUS_SPP != 0
    }

    /// Stack pointer (x2).
    pub fn sp(&self) -> usize {
        self.regs[1]
    }

    pub fn set_sp(&mut self, sp: usize) {
        self.regs[1] = sp;
    }

    /// Argument/return registers a0..a7 are x10..x17.
    pub fn arg(&self, n: usize) -> usize {
        debug_assert!(n < 8);
        self.regs[9 + n]
    }

    pub fn set_arg(&mut self, n: usize, value: usize) {
        debug_assert!(n < 8);
        self.regs[9 + n] = value;
    }

    /// Syscall number register a7.
    pub fn syscall_number(&self) -> usize {
        self.arg(7)
    }

    /// Syscall return value goes in a0.
    pub fn set_return(&mut self, value: usize) {
        self.set_arg(0, value);
    }

    /// Temporary register tN (t0..t2 are x5..x7, t3..t6 are x28..x31).
    pub fn t(&self, n: usize) -> usize {
        debug_assert!(n < 7);
        if n < 3 {
            self.regs[4 + n]
        } else {
            self.regs[24 + n]
        }
    }

    pub fn set_t(&mut self, n: usize, value: usize) {
        debug_assert!(n < 7);
        if n < 3 {
            self.regs[4 + n] = value;
        } else {
            self.regs[24 + n] = value;
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn user_context_targets_umode() {
        let ctx = TrapContext::new_user(0x1000, 0x7fff_f000);
        assert_eq!(ctx.sepc, 0x1000);
        assert_eq!(ctx.sp(), 0x7fff_f000);
        assert!(!ctx.from_kernel());
    }

    #[test]
    fn arg_registers_map_to_a_file() {
        let mut ctx = TrapContext::zeroed();
        ctx.set_arg(0, 11);
        ctx.set_arg(7, 99);
        // a0 is x10 -> regs[9], a7 is x17 -> regs[16]
        assert_eq!(ctx.regs[9], 11);
        assert_eq!(ctx.regs[16], 99);
        assert_eq!(ctx.syscall_number(), 99);
    }

    #[test]
    fn temp_registers_split_banks() {
        let mut ctx = TrapContext::zeroed();
        ctx.set_t(0, 5);
        ctx.set_t(3, 28);
        assert_eq!(ctx.regs[4], 5); // t0 = x5
        assert_eq!(ctx.regs[27], 28); // t3 = x28
    }
}
