//! EL2 physical timer (CNTHP)
//!
//! The hypervisor's own alarm clock; the guest never sees it. Used for the
//! debugger's timed waits. The interrupt handler masks the timer until it is
//! reprogrammed.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{barrier, sysreg};

const CNTHP_CTL_ENABLE: u64 = 1 << 0;
const CNTHP_CTL_IMASK: u64 = 1 << 1;
const CNTHP_CTL_ISTATUS: u64 = 1 << 2;

static TIMER_FREQ: AtomicU64 = AtomicU64::new(0);

pub fn frequency() -> u64 {
    TIMER_FREQ.load(Ordering::Relaxed)
}

pub fn ticks_from_us(us: u64) -> u64 {
    us * frequency() / 1_000_000
}

pub fn init() {
    configure(false, false);
    if crate::core_ctx::current_core_ctx().is_boot_core {
        let freq = sysreg::read_cntfrq_el0();
        TIMER_FREQ.store(freq, Ordering::Relaxed);
        crate::info!("timer: frequency {} Hz", freq);
    }
}

pub fn configure(enabled: bool, masked: bool) {
    let mut ctl = 0;
    if enabled {
        ctl |= CNTHP_CTL_ENABLE;
    }
    if masked {
        ctl |= CNTHP_CTL_IMASK;
    }
    unsafe { sysreg::write_cnthp_ctl_el2(ctl) };
    barrier::isb();
}

pub fn set_timeout_ticks(ticks: u64) {
    let now = sysreg::read_cntpct_el0();
    unsafe { sysreg::write_cnthp_cval_el2(now + ticks) };
    configure(true, false);
}

pub fn set_timeout_us(us: u64) {
    set_timeout_ticks(ticks_from_us(us));
}

pub fn interrupt_status() -> bool {
    sysreg::read_cnthp_ctl_el2() & CNTHP_CTL_ISTATUS != 0
}

/// Handler for the hypervisor timer PPI: quiesce until reprogrammed.
pub fn interrupt_handler() {
    configure(false, false);
}

/// Busy-wait with IRQs serviced, so cross-core SGIs keep flowing while we
/// sleep.
pub fn wait_us(us: u64) {
    crate::exceptions::enter_interruptible_hypervisor_code();
    let flags = crate::arch::unmask_irq();
    set_timeout_us(us);
    loop {
        crate::arch::wfi();
        if interrupt_status() {
            break;
        }
        #[cfg(not(target_arch = "aarch64"))]
        break; // host stub: the timer never fires
    }
    crate::arch::restore_interrupt_flags(flags);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversion() {
        TIMER_FREQ.store(19_200_000, Ordering::Relaxed); // Tegra X1 TSC
        assert_eq!(ticks_from_us(1_000_000), 19_200_000);
        assert_eq!(ticks_from_us(500), 9_600);
        TIMER_FREQ.store(0, Ordering::Relaxed);
    }
}
