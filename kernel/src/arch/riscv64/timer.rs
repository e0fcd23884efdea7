//! RISC-V timer
//!
//! Tick bookkeeping plus the SBI re-arm. The timebase frequency comes from
//! the device tree at boot; QEMU virt's 10 MHz is the default.

use core::sync::atomic::{AtomicU64, Ordering};

use super::sbi;

static TICKS: AtomicU64 = AtomicU64::new(0);
static TICK_INCREMENT: AtomicU64 = AtomicU64::new(0);

/// Scheduler tick period in milliseconds.
pub const TICK_MS: u64 = 10;

const DEFAULT_TIMEBASE_HZ: u64 = 10_000_000;

/// Ticks since boot.
pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Count one tick; called from the trap path on every timer interrupt.
pub fn on_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Current value of the `time` CSR.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn read_time() -> u64 {
    riscv::register::time::read() as u64
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn read_time() -> u64 {
    0
}

/// Program the periodic timer: one interrupt every `TICK_MS` milliseconds.
pub fn init(timebase_hz: Option<u64>) {
    let hz = timebase_hz.unwrap_or(DEFAULT_TIMEBASE_HZ);
    let increment = hz / 1000 * TICK_MS;
    TICK_INCREMENT.store(increment, Ordering::Relaxed);
    sbi::set_timer(read_time() + increment);
}

/// Re-arm the next timer interrupt.
pub fn rearm() {
    let increment = TICK_INCREMENT.load(Ordering::Relaxed);
    sbi::set_timer(read_time() + increment);
}
