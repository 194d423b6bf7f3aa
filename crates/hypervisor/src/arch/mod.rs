// Architecture support
//
// Everything below `aarch64/` compiles on any host: each function carries a
// real `asm!` body for the aarch64 target and an inert stub otherwise, so
// the state machines layered on top stay unit-testable.

pub mod aarch64;

pub use aarch64::barrier;
pub use aarch64::barrier::*;
pub use aarch64::sysreg;
pub use aarch64::cache;
pub use aarch64::fpu;

/// Mask IRQs on this core, returning the previous DAIF value.
#[inline(always)]
pub fn mask_irq() -> u64 {
    let flags = sysreg::read_daif();
    sysreg::set_daif_irq_masked();
    flags
}

/// Unmask IRQs on this core, returning the previous DAIF value.
#[inline(always)]
pub fn unmask_irq() -> u64 {
    let flags = sysreg::read_daif();
    sysreg::set_daif_irq_unmasked();
    flags
}

#[inline(always)]
pub fn restore_interrupt_flags(flags: u64) {
    unsafe { sysreg::write_daif(flags) }
}
