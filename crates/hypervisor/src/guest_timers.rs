//! The guest's view of time
//!
//! The hypervisor steals slices of real time whenever the guest traps into
//! EL2. `total_time_in_hypervisor` accumulates those slices per core;
//! `CNTVOFF_EL2` mirrors it, so the guest's CNTVCT runs only while the guest
//! itself does.
//!
//! The guest's EL1 physical timer is emulated: CNTHCTL_EL2 traps the CNTP_*
//! registers, writes land in `emul_ptimer_cval` (a *guest-time* deadline),
//! and the hardware compare value is continuously re-derived so the
//! interrupt fires when the guest-time deadline arrives, however much real
//! time that takes.

use crate::arch::sysreg;
use crate::core_ctx::current_core_ctx;
use crate::exceptions::ExceptionStackFrame;

/// Guest-visible counter value at the moment the frame was captured.
pub fn compute_cntvct(frame: &ExceptionStackFrame) -> u64 {
    frame
        .cntpct_el0
        .wrapping_sub(current_core_ctx().total_time_in_hypervisor)
}

/// Guest wrote CNTP_CVAL_EL0: record the guest-time deadline and program the
/// hardware with the equivalent real-time deadline.
pub fn write_emulated_ptimer_cval(frame: &ExceptionStackFrame, val: u64) {
    let vct = compute_cntvct(frame);
    current_core_ctx().emul_ptimer_cval = val;
    unsafe {
        sysreg::write_cntp_cval_el0(frame.cntpct_el0.wrapping_add(val.wrapping_sub(vct)));
    }
}

pub fn read_emulated_ptimer_cval() -> u64 {
    current_core_ctx().emul_ptimer_cval
}

/// Guest wrote CNTP_TVAL_EL0 (a signed 32-bit downcounter).
pub fn write_emulated_ptimer_tval(frame: &ExceptionStackFrame, tval: u32) {
    let delta = tval as i32 as i64 as u64;
    write_emulated_ptimer_cval(frame, compute_cntvct(frame).wrapping_add(delta));
}

pub fn read_emulated_ptimer_tval(frame: &ExceptionStackFrame) -> u32 {
    current_core_ctx()
        .emul_ptimer_cval
        .wrapping_sub(compute_cntvct(frame)) as u32
}

/// On the guest timer IRQ: has the deadline really arrived in guest time?
/// If EL2 stole time since the compare value was programmed the answer is
/// no; push the hardware deadline out by the stolen amount and report false
/// so the top-half swallows the interrupt.
pub fn check_reschedule_emulated_ptimer(frame: &ExceptionStackFrame) -> bool {
    let deadline = current_core_ctx().emul_ptimer_cval;
    let vct = compute_cntvct(frame);

    if deadline > vct {
        unsafe {
            sysreg::write_cntp_cval_el0(
                frame.cntpct_el0.wrapping_add(deadline.wrapping_sub(vct)),
            );
        }
        return false;
    }

    true
}

/// Runs on every EL2 -> guest return: account the time this trap cost and
/// refresh the guest's counter offset.
pub fn update_time_accounting(frame: &ExceptionStackFrame) {
    let ctx = current_core_ctx();
    let now = sysreg::read_cntpct_el0();
    ctx.total_time_in_hypervisor = ctx
        .total_time_in_hypervisor
        .wrapping_add(now.wrapping_sub(frame.cntpct_el0));
    unsafe { sysreg::write_cntvoff_el2(ctx.total_time_in_hypervisor) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_ctx;


    fn frame_at(cntpct: u64) -> ExceptionStackFrame {
        let mut f = ExceptionStackFrame::zeroed();
        f.cntpct_el0 = cntpct;
        f.cntvct_el0 = cntpct;
        f
    }

    #[test]
    fn cntvct_subtracts_stolen_time() {
        let _guard = crate::lib::test_lock();
        core_ctx::init(0, true, 0, false);
        core_ctx::current_core_ctx().total_time_in_hypervisor = 1_000;
        let f = frame_at(10_000);
        assert_eq!(compute_cntvct(&f), 9_000);
        core_ctx::current_core_ctx().total_time_in_hypervisor = 0;
    }

    #[test]
    fn ptimer_deadline_not_due_reschedules() {
        let _guard = crate::lib::test_lock();
        core_ctx::init(0, true, 0, false);
        let ctx = core_ctx::current_core_ctx();
        ctx.total_time_in_hypervisor = 500;
        ctx.emul_ptimer_cval = 10_000;

        // Guest time = 9_500 < deadline: swallowed
        let f = frame_at(10_000);
        assert!(!check_reschedule_emulated_ptimer(&f));

        // Guest time = 10_000: due
        let f = frame_at(10_500);
        assert!(check_reschedule_emulated_ptimer(&f));

        ctx.total_time_in_hypervisor = 0;
        ctx.emul_ptimer_cval = 0;
    }

    #[test]
    fn tval_is_relative_to_guest_time() {
        let _guard = crate::lib::test_lock();
        core_ctx::init(0, true, 0, false);
        let ctx = core_ctx::current_core_ctx();
        ctx.total_time_in_hypervisor = 0;

        let f = frame_at(5_000);
        write_emulated_ptimer_tval(&f, 1_000);
        assert_eq!(ctx.emul_ptimer_cval, 6_000);
        assert_eq!(read_emulated_ptimer_tval(&f), 1_000);
        ctx.emul_ptimer_cval = 0;
    }
}
