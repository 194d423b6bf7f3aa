// AArch64 EL2 architecture support

pub mod sysreg;
pub mod barrier;
pub mod cache;
pub mod fpu;

// EL2 vector table, exception frame save/restore, entry code and the SMC
// forwarding trampoline template
#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(include_str!("vectors.S"));
