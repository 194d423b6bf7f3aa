//! EL2 exception entry and synchronous dispatch
//!
//! The assembly vectors save a full `ExceptionStackFrame` (including timer
//! snapshots taken at entry, so every handler sees one consistent moment in
//! time) and call into the `ventana_handle_*` functions below. On the way
//! back to the guest the common epilogue runs the debug-pause gate, keeps
//! SPSR_EL2.SS consistent with the single-step state machine, and charges
//! the time spent in EL2 to `CNTVOFF_EL2`.

use crate::arch::{barrier, sysreg};
use crate::core_ctx::current_core_ctx;

/// Saved by the assembly vector entry. Layout shared with vectors.S.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExceptionStackFrame {
    pub x: [u64; 31],
    pub sp_el1: u64,
    pub sp_el0: u64,
    pub elr_el2: u64,
    pub spsr_el2: u64,
    pub esr_el2: u64,
    /// Counter snapshots taken on exception entry
    pub cntpct_el0: u64,
    pub cntvct_el0: u64,
}

static_assertions::const_assert_eq!(core::mem::offset_of!(ExceptionStackFrame, sp_el1), 0xF8);
static_assertions::const_assert_eq!(core::mem::offset_of!(ExceptionStackFrame, elr_el2), 0x108);
static_assertions::const_assert_eq!(core::mem::offset_of!(ExceptionStackFrame, esr_el2), 0x118);
static_assertions::const_assert_eq!(core::mem::offset_of!(ExceptionStackFrame, cntpct_el0), 0x120);
static_assertions::const_assert_eq!(core::mem::size_of::<ExceptionStackFrame>(), 0x130);

impl ExceptionStackFrame {
    pub const fn zeroed() -> Self {
        Self {
            x: [0; 31],
            sp_el1: 0,
            sp_el0: 0,
            elr_el2: 0,
            spsr_el2: 0,
            esr_el2: 0,
            cntpct_el0: 0,
            cntvct_el0: 0,
        }
    }

    /// Read a general register by trap-encoding index; 31 is the zero
    /// register.
    pub fn read_register(&self, n: u32) -> u64 {
        if n >= 31 {
            0
        } else {
            self.x[n as usize]
        }
    }

    /// Write a general register by trap-encoding index; writes to 31 vanish.
    pub fn write_register(&mut self, n: u32, val: u64) {
        if n < 31 {
            self.x[n as usize] = val;
        }
    }
}

/// ESR_EL2 exception classes we dispatch on
pub mod ec {
    pub const UNKNOWN: u32 = 0x00;
    pub const WFX: u32 = 0x01;
    pub const CP15_32: u32 = 0x03;
    pub const CP15_64: u32 = 0x04;
    pub const CP14_32: u32 = 0x05;
    pub const CP14_LDC_STC: u32 = 0x06;
    pub const CP14_64: u32 = 0x0C;
    pub const HVC32: u32 = 0x12;
    pub const SMC32: u32 = 0x13;
    pub const HVC64: u32 = 0x16;
    pub const SMC64: u32 = 0x17;
    pub const SYSREG: u32 = 0x18;
    pub const INSTR_ABORT_LOWER_EL: u32 = 0x20;
    pub const INSTR_ABORT_CURR_EL: u32 = 0x21;
    pub const DATA_ABORT_LOWER_EL: u32 = 0x24;
    pub const DATA_ABORT_CURR_EL: u32 = 0x25;
    pub const BREAKPOINT_LOWER_EL: u32 = 0x30;
    pub const SOFTWARE_STEP_LOWER_EL: u32 = 0x32;
    pub const WATCHPOINT_LOWER_EL: u32 = 0x34;
    pub const BKPT32: u32 = 0x38;
    pub const BRK64: u32 = 0x3C;
}

/// Decoded view of ESR_EL2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Esr(pub u32);

impl Esr {
    pub fn ec(self) -> u32 {
        (self.0 >> 26) & 0x3F
    }

    /// 32-bit instruction length bit
    pub fn il(self) -> bool {
        self.0 & (1 << 25) != 0
    }

    pub fn iss(self) -> u32 {
        self.0 & 0x01FF_FFFF
    }
}

/// Advance past an instruction the hypervisor emulated or chose to ignore.
/// An emulated instruction counts as a completed step for the single-step
/// machine, so an active-pending step becomes pending-done instead of
/// stepping the *next* instruction twice.
pub fn skip_faulting_instruction(frame: &mut ExceptionStackFrame, size: u32) {
    frame.elr_el2 = frame.elr_el2.wrapping_add(size as u64);

    use crate::debug::single_step::{get_next_state, set_next_state, SingleStepState};
    if get_next_state(frame) == SingleStepState::ActiveNotPending {
        set_next_state(frame, SingleStepState::ActivePending);
    }
}

/// Marks sections of EL2 code that are about to unmask IRQs and wait
/// (debug pause, timer waits): publish everything written so far, so the
/// handlers that will run can see it.
pub fn enter_interruptible_hypervisor_code() {
    barrier::dsb_ish();
}

fn handle_hvc(frame: &mut ExceptionStackFrame, esr: Esr) {
    // Reserved for future hypervisor services; HVC already advances ELR
    crate::warn!(
        "unhandled HVC #{:#x} from {:#x}",
        esr.iss() & 0xFFFF,
        frame.elr_el2
    );
}

fn handle_wfx(frame: &mut ExceptionStackFrame, esr: Esr) {
    // Re-issue at EL2 so the core actually idles, then move on
    if esr.iss() & 1 != 0 {
        crate::arch::wfe();
    } else {
        crate::arch::wfi();
    }
    skip_faulting_instruction(frame, if esr.il() { 4 } else { 2 });
}

fn handle_instruction_abort(frame: &mut ExceptionStackFrame, esr: Esr) {
    // No stage-2 paging: the guest jumped somewhere unmapped. Report it and
    // let the guest run into its own fault handling.
    crate::warn!(
        "guest instruction abort at ELR={:#x} IFSC={:#x}",
        frame.elr_el2,
        esr.iss() & 0x3F
    );
    skip_faulting_instruction(frame, 4);
}

/// Synchronous exception from EL1/EL0.
#[no_mangle]
pub extern "C" fn ventana_handle_lower_el_sync(frame: &mut ExceptionStackFrame, _lower_el: u64) {
    let esr = Esr(frame.esr_el2 as u32);
    current_core_ctx().guest_frame = frame as *mut ExceptionStackFrame;

    match esr.ec() {
        ec::WFX => handle_wfx(frame, esr),
        ec::HVC64 | ec::HVC32 => handle_hvc(frame, esr),
        ec::SMC64 | ec::SMC32 => crate::traps::smc::handle_smc_trap(frame, esr),
        ec::SYSREG => crate::traps::sysreg::handle_msr_mrs_trap(frame, esr),
        ec::CP15_32 | ec::CP15_64 | ec::CP14_32 | ec::CP14_64 | ec::CP14_LDC_STC => {
            crate::traps::sysreg::handle_a32_sysreg_stub(frame, esr)
        }
        ec::DATA_ABORT_LOWER_EL => crate::traps::data_abort::handle_lower_el(frame, esr),
        ec::INSTR_ABORT_LOWER_EL => handle_instruction_abort(frame, esr),
        ec::BRK64 | ec::BKPT32 => crate::debug::manager::handle_guest_break(frame, esr),
        ec::BREAKPOINT_LOWER_EL => crate::debug::manager::handle_hw_breakpoint(frame, esr),
        ec::WATCHPOINT_LOWER_EL => crate::debug::manager::handle_watchpoint(frame, esr),
        ec::SOFTWARE_STEP_LOWER_EL => crate::debug::single_step::handle_single_step(frame, esr),
        other => {
            crate::error!(
                "unhandled synchronous exception EC={:#x} ISS={:#x} ELR={:#x}",
                other,
                esr.iss(),
                frame.elr_el2
            );
            skip_faulting_instruction(frame, if esr.il() { 4 } else { 2 });
        }
    }

    exception_return_epilogue(frame);
}

/// IRQ, from the guest or from EL2 code that unmasked (pause/timer waits).
#[no_mangle]
pub extern "C" fn ventana_handle_irq_exception(frame: &mut ExceptionStackFrame, lower_el: u64) {
    if lower_el != 0 {
        current_core_ctx().guest_frame = frame as *mut ExceptionStackFrame;
    }

    crate::irq::handle_irq_exception(frame);

    if lower_el != 0 {
        exception_return_epilogue(frame);
    }
}

/// Fault taken by EL2 itself: unrecoverable.
#[no_mangle]
pub extern "C" fn ventana_handle_same_el_sync(frame: &mut ExceptionStackFrame, _lower_el: u64) {
    let esr = Esr(frame.esr_el2 as u32);
    panic!(
        "EL2 fault: EC={:#x} ISS={:#x} ELR={:#x} FAR={:#x} SP~{:#x}",
        esr.ec(),
        esr.iss(),
        frame.elr_el2,
        sysreg::read_far_el2(),
        frame as *const _ as usize,
    );
}

/// SError. During a tolerant device probe the core context register is
/// deliberately null; restoring it both identifies the situation and makes
/// the probe loop stop with a short count.
#[no_mangle]
pub extern "C" fn ventana_handle_serror(frame: &mut ExceptionStackFrame, lower_el: u64) {
    if lower_el == 0 && crate::core_ctx::is_ctx_register_null() {
        let core = (sysreg::read_mpidr_el1() & 0xFF) as u32;
        crate::core_ctx::restore_ctx_register(core);
        return;
    }

    panic!(
        "SError (lower_el={}) ELR={:#x} ESR={:#x}",
        lower_el, frame.elr_el2, frame.esr_el2
    );
}

/// Everything that must happen between "handler done" and ERET to the guest.
fn exception_return_epilogue(frame: &mut ExceptionStackFrame) {
    // If a debugger paused this core, park here (IRQs get serviced inside);
    // on wake this also decides whether a single-step cycle starts
    crate::debug::manager::handle_pause(frame);

    // SPSR.SS must match what the single-step machine expects to happen next
    crate::debug::single_step::apply_to_frame(frame);

    // Last: bill the whole trap to the guest's counter offset
    crate::guest_timers::update_time_accounting(frame);
}

/// EL2 trap configuration bits
const HCR_RW: u64 = 1 << 31;
const HCR_TSC: u64 = 1 << 19;
const HCR_TVM: u64 = 1 << 26;
const HCR_AMO: u64 = 1 << 5;
const HCR_IMO: u64 = 1 << 4;
const HCR_FMO: u64 = 1 << 3;

const MDCR_TDE: u64 = 1 << 8;
const MDCR_TDA: u64 = 1 << 9;
const MDCR_TDOSA: u64 = 1 << 10;
const MDCR_TDRA: u64 = 1 << 11;

/// Program the EL2 trap surface: aarch64 EL1, SMC traps, VM-control-register
/// write traps (software breakpoints depend on them), physical interrupt
/// routing to EL2, debug exception routing, and the emulated EL1 physical
/// timer (counter and timer register traps via CNTHCTL).
pub fn configure_el2_traps() {
    unsafe {
        let hcr = sysreg::read_hcr_el2();
        sysreg::write_hcr_el2(hcr | HCR_RW | HCR_TSC | HCR_TVM | HCR_AMO | HCR_IMO | HCR_FMO);

        let mdcr = sysreg::read_mdcr_el2();
        sysreg::write_mdcr_el2(mdcr | MDCR_TDE | MDCR_TDA | MDCR_TDOSA | MDCR_TDRA);

        // EL1PCTEN = EL1PCEN = 0: CNTPCT and CNTP_* trap to EL2
        sysreg::write_cnthctl_el2(0);

        sysreg::write_cntvoff_el2(0);

        // RES1 pattern with TFP clear: EL2 may touch the SIMD file (FPU
        // snapshots for the debugger, frame save paths)
        sysreg::write_cptr_el2(0x33FF);
    }
    barrier::isb();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn esr_field_extraction() {
        // EC=0x24 (lower-EL data abort), IL=1, ISS=0x1234
        let esr = Esr((0x24 << 26) | (1 << 25) | 0x1234);
        assert_eq!(esr.ec(), ec::DATA_ABORT_LOWER_EL);
        assert!(esr.il());
        assert_eq!(esr.iss(), 0x1234);
    }

    #[test]
    fn register_31_is_the_zero_register() {
        let mut frame = ExceptionStackFrame::zeroed();
        frame.write_register(31, 0x1234);
        assert_eq!(frame.read_register(31), 0);
        frame.write_register(5, 77);
        assert_eq!(frame.read_register(5), 77);
    }

    #[test]
    fn skip_advances_elr() {
        let mut frame = ExceptionStackFrame::zeroed();
        frame.elr_el2 = 0x2000;
        skip_faulting_instruction(&mut frame, 4);
        assert_eq!(frame.elr_el2, 0x2004);
        skip_faulting_instruction(&mut frame, 2);
        assert_eq!(frame.elr_el2, 0x2006);
    }
}
