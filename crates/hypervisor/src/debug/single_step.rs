//! Software single-step state machine
//!
//! Architectural states (MDSCR_EL1.SS gates the feature, SPSR_EL2.SS decides
//! what the next ERET does):
//!
//! - `Inactive`: stepping off (or the core is parked in the debugger).
//! - `ActiveNotPending` (SPSR.SS = 1): the next ERET executes exactly one
//!   instruction, then the step exception arrives.
//! - `ActivePending` (SPSR.SS = 0): the step exception arrives immediately,
//!   before anything executes.
//!
//! Instructions the hypervisor emulates count as completed steps:
//! `skip_faulting_instruction` moves ActiveNotPending to ActivePending.

use crate::arch::sysreg;
use crate::core_ctx::current_core_ctx;
use crate::exceptions::{Esr, ExceptionStackFrame};

/// SPSR_EL2.SS
const SPSR_SS: u64 = 1 << 21;
/// MDSCR_EL1.SS
const MDSCR_SS: u64 = 1 << 0;
/// MDSCR_EL1.MDE
const MDSCR_MDE: u64 = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleStepState {
    Inactive,
    ActiveNotPending,
    ActivePending,
}

/// State the machine will be in after the next ERET of `frame`.
pub fn get_next_state(frame: &ExceptionStackFrame) -> SingleStepState {
    if sysreg::read_mdscr_el1() & MDSCR_SS == 0 {
        SingleStepState::Inactive
    } else if frame.spsr_el2 & SPSR_SS != 0 {
        SingleStepState::ActiveNotPending
    } else {
        SingleStepState::ActivePending
    }
}

pub fn set_next_state(frame: &mut ExceptionStackFrame, state: SingleStepState) {
    let mdscr = sysreg::read_mdscr_el1();
    match state {
        SingleStepState::Inactive => {
            frame.spsr_el2 &= !SPSR_SS;
            unsafe { sysreg::write_mdscr_el1(mdscr & !MDSCR_SS) };
        }
        SingleStepState::ActiveNotPending => {
            frame.spsr_el2 |= SPSR_SS;
            unsafe { sysreg::write_mdscr_el1(mdscr | MDSCR_SS | MDSCR_MDE) };
        }
        SingleStepState::ActivePending => {
            frame.spsr_el2 &= !SPSR_SS;
            unsafe { sysreg::write_mdscr_el1(mdscr | MDSCR_SS | MDSCR_MDE) };
        }
    }
}

/// Re-derive SPSR.SS right before ERET so an intervening trap cannot leave
/// it inconsistent with MDSCR.
pub fn apply_to_frame(frame: &mut ExceptionStackFrame) {
    match get_next_state(frame) {
        SingleStepState::ActiveNotPending => frame.spsr_el2 |= SPSR_SS,
        _ => frame.spsr_el2 &= !SPSR_SS,
    }
}

/// Software-step exception from the guest.
pub fn handle_single_step(frame: &mut ExceptionStackFrame, esr: Esr) {
    let ctx = current_core_ctx();

    // Range stepping: silently keep going while the PC stays inside the
    // window the debugger gave us
    if ctx.stepping_range_start != ctx.stepping_range_end
        && frame.elr_el2 >= ctx.stepping_range_start
        && frame.elr_el2 < ctx.stepping_range_end
    {
        set_next_state(frame, SingleStepState::ActiveNotPending);
        return;
    }

    crate::debug!(
        "single-step exception ELR={:#x} ISV={}",
        frame.elr_el2,
        (esr.iss() >> 24) & 1
    );

    // The step is done until the debugger asks for another one
    set_next_state(frame, SingleStepState::Inactive);
    crate::debug::manager::report_single_step(frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_mirrors_spsr_bit() {
        let mut frame = ExceptionStackFrame::zeroed();
        // Host stub MDSCR reads 0: machine is inactive, bit must be clear
        frame.spsr_el2 = SPSR_SS;
        apply_to_frame(&mut frame);
        assert_eq!(frame.spsr_el2 & SPSR_SS, 0);
    }

    #[test]
    fn set_state_drives_spsr() {
        let mut frame = ExceptionStackFrame::zeroed();
        set_next_state(&mut frame, SingleStepState::ActiveNotPending);
        assert_ne!(frame.spsr_el2 & SPSR_SS, 0);
        set_next_state(&mut frame, SingleStepState::ActivePending);
        assert_eq!(frame.spsr_el2 & SPSR_SS, 0);
        set_next_state(&mut frame, SingleStepState::Inactive);
        assert_eq!(frame.spsr_el2 & SPSR_SS, 0);
    }
}
