//! Architecture support
//!
//! FerriteOS targets RISC-V 64 (SV39, S-mode). The host build keeps the same
//! module tree so subsystem logic and unit tests compile unchanged; only the
//! privileged-instruction paths are bare-metal-only.

pub mod riscv64;

pub use riscv64::context::TrapContext;
