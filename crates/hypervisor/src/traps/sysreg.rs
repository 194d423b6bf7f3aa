//! Trapped MSR/MRS emulation
//!
//! Two families of system registers trap here:
//!
//! - The VM-control group (HCR_EL2.TVM): writes to the guest's translation
//!   registers invalidate the VAs software breakpoints were patched at, so
//!   every breakpoint is reverted before the write lands and re-applied
//!   after.
//! - The EL1 physical timer and counter (CNTHCTL_EL2): reads and writes are
//!   redirected through the emulated-timer layer so the guest never notices
//!   the time EL2 steals.
//!
//! Dispatch is a static match over the trapped encodings; anything outside
//! the allowlist is logged and treated as RAZ/WI.

use crate::arch::{barrier, sysreg};
use crate::exceptions::{skip_faulting_instruction, Esr, ExceptionStackFrame};
use crate::guest_timers;

/// ISS encoding of a system register, with Rt and direction masked out.
pub const fn sysreg_iss(op0: u32, op1: u32, crn: u32, crm: u32, op2: u32) -> u32 {
    (op0 << 20) | (op2 << 17) | (op1 << 14) | (crn << 10) | (crm << 1)
}

const ISS_SCTLR_EL1: u32 = sysreg_iss(3, 0, 1, 0, 0);
const ISS_TTBR0_EL1: u32 = sysreg_iss(3, 0, 2, 0, 0);
const ISS_TTBR1_EL1: u32 = sysreg_iss(3, 0, 2, 0, 1);
const ISS_TCR_EL1: u32 = sysreg_iss(3, 0, 2, 0, 2);
const ISS_AFSR0_EL1: u32 = sysreg_iss(3, 0, 5, 1, 0);
const ISS_AFSR1_EL1: u32 = sysreg_iss(3, 0, 5, 1, 1);
const ISS_ESR_EL1: u32 = sysreg_iss(3, 0, 5, 2, 0);
const ISS_FAR_EL1: u32 = sysreg_iss(3, 0, 6, 0, 0);
const ISS_MAIR_EL1: u32 = sysreg_iss(3, 0, 10, 2, 0);
const ISS_AMAIR_EL1: u32 = sysreg_iss(3, 0, 10, 3, 0);
const ISS_CONTEXTIDR_EL1: u32 = sysreg_iss(3, 0, 13, 0, 1);

const ISS_CNTPCT_EL0: u32 = sysreg_iss(3, 3, 14, 0, 1);
const ISS_CNTP_TVAL_EL0: u32 = sysreg_iss(3, 3, 14, 2, 0);
const ISS_CNTP_CTL_EL0: u32 = sysreg_iss(3, 3, 14, 2, 1);
const ISS_CNTP_CVAL_EL0: u32 = sysreg_iss(3, 3, 14, 2, 2);

/// Does a write to this register move the guest's stage-1 view of memory?
fn invalidates_patched_vas(iss: u32) -> bool {
    matches!(
        iss,
        ISS_SCTLR_EL1 | ISS_TTBR0_EL1 | ISS_TTBR1_EL1 | ISS_TCR_EL1
    )
}

fn read_vm_control_register(iss: u32) -> Option<u64> {
    Some(match iss {
        ISS_SCTLR_EL1 => sysreg::read_sctlr_el1(),
        ISS_TTBR0_EL1 => sysreg::read_ttbr0_el1(),
        ISS_TTBR1_EL1 => sysreg::read_ttbr1_el1(),
        ISS_TCR_EL1 => sysreg::read_tcr_el1(),
        ISS_AFSR0_EL1 => sysreg::read_afsr0_el1(),
        ISS_AFSR1_EL1 => sysreg::read_afsr1_el1(),
        ISS_ESR_EL1 => sysreg::read_esr_el1(),
        ISS_FAR_EL1 => sysreg::read_far_el1(),
        ISS_MAIR_EL1 => sysreg::read_mair_el1(),
        ISS_AMAIR_EL1 => sysreg::read_amair_el1(),
        ISS_CONTEXTIDR_EL1 => sysreg::read_contextidr_el1(),
        _ => return None,
    })
}

fn write_vm_control_register(iss: u32, val: u64) -> bool {
    unsafe {
        match iss {
            ISS_SCTLR_EL1 => sysreg::write_sctlr_el1(val),
            ISS_TTBR0_EL1 => sysreg::write_ttbr0_el1(val),
            ISS_TTBR1_EL1 => sysreg::write_ttbr1_el1(val),
            ISS_TCR_EL1 => sysreg::write_tcr_el1(val),
            ISS_AFSR0_EL1 => sysreg::write_afsr0_el1(val),
            ISS_AFSR1_EL1 => sysreg::write_afsr1_el1(val),
            ISS_ESR_EL1 => sysreg::write_esr_el1(val),
            ISS_FAR_EL1 => sysreg::write_far_el1(val),
            ISS_MAIR_EL1 => sysreg::write_mair_el1(val),
            ISS_AMAIR_EL1 => sysreg::write_amair_el1(val),
            ISS_CONTEXTIDR_EL1 => sysreg::write_contextidr_el1(val),
            _ => return false,
        }
    }
    true
}

fn do_system_register_read(frame: &mut ExceptionStackFrame, iss: u32, reg: u32) {
    let val = match iss {
        ISS_CNTPCT_EL0 => guest_timers::compute_cntvct(frame),
        ISS_CNTP_CVAL_EL0 => guest_timers::read_emulated_ptimer_cval(),
        ISS_CNTP_TVAL_EL0 => guest_timers::read_emulated_ptimer_tval(frame) as u64,
        ISS_CNTP_CTL_EL0 => sysreg::read_cntp_ctl_el0(),
        other => match read_vm_control_register(other) {
            Some(v) => v,
            None => {
                crate::warn!("unhandled sysreg read, ISS encoding {:#x}", other);
                0
            }
        },
    };

    frame.write_register(reg, val);
    skip_faulting_instruction(frame, 4);
}

fn do_system_register_write(frame: &mut ExceptionStackFrame, iss: u32, reg: u32) {
    let val = frame.read_register(reg);

    match iss {
        ISS_CNTP_CVAL_EL0 => guest_timers::write_emulated_ptimer_cval(frame, val),
        ISS_CNTP_TVAL_EL0 => guest_timers::write_emulated_ptimer_tval(frame, val as u32),
        ISS_CNTP_CTL_EL0 => unsafe { sysreg::write_cntp_ctl_el0(val) },
        ISS_CNTPCT_EL0 => {
            // Counter writes do not exist; ignore
        }
        other => {
            let reeval = invalidates_patched_vas(other);
            if reeval {
                crate::debug::software_breakpoints::revert_all();
            }

            if !write_vm_control_register(other, val) {
                crate::warn!("unhandled sysreg write, ISS encoding {:#x}", other);
            }

            if reeval {
                barrier::dsb_sy();
                barrier::isb();
                crate::debug::software_breakpoints::apply_all();
            }
        }
    }

    skip_faulting_instruction(frame, 4);
}

pub fn handle_msr_mrs_trap(frame: &mut ExceptionStackFrame, esr: Esr) {
    let iss = esr.iss();
    let reg = (iss >> 5) & 0x1F;
    let is_read = iss & 1 != 0;
    let iss = iss & !((0x1F << 5) | 1);

    if is_read {
        do_system_register_read(frame, iss, reg);
    } else {
        do_system_register_write(frame, iss, reg);
    }
}

/// T32 IT-block flags from SPSR
fn spsr_t32_it_flags(spsr: u64) -> u32 {
    (((spsr >> 10) & 0x3F) << 2) as u32 | ((spsr >> 25) & 3) as u32
}

fn evaluate_condition_code(spsr: u64, condition: u32) -> bool {
    let n = spsr & (1 << 31) != 0;
    let z = spsr & (1 << 30) != 0;
    let c = spsr & (1 << 29) != 0;
    let v = spsr & (1 << 28) != 0;
    match condition & 0xF {
        0x0 => z,
        0x1 => !z,
        0x2 => c,
        0x3 => !c,
        0x4 => n,
        0x5 => !n,
        0x6 => v,
        0x7 => !v,
        0x8 => c && !z,
        0x9 => !c || z,
        0xA => n == v,
        0xB => n != v,
        0xC => !z && n == v,
        0xD => z || n != v,
        _ => true,
    }
}

fn evaluate_mcr_mrc_condition(spsr: u64, condition: u32, cond_valid: bool) -> bool {
    if !cond_valid {
        let it = spsr_t32_it_flags(spsr);
        it == 0 || evaluate_condition_code(spsr, it >> 4)
    } else {
        evaluate_condition_code(spsr, condition)
    }
}

/// AArch32 coprocessor access stub: skip, and read as zero where a value is
/// expected (there are debug registers accessible from EL0).
pub fn handle_a32_sysreg_stub(frame: &mut ExceptionStackFrame, esr: Esr) {
    let iss = esr.iss();
    if iss & 1 != 0
        && evaluate_mcr_mrc_condition(
            frame.spsr_el2,
            (iss >> 20) & 0xF,
            iss & (1 << 24) != 0,
        )
    {
        frame.write_register((iss >> 5) & 0x1F, 0);
    }
    skip_faulting_instruction(frame, if esr.il() { 4 } else { 2 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iss_encoding_distinguishes_registers() {
        assert_ne!(ISS_TTBR0_EL1, ISS_TTBR1_EL1);
        assert_ne!(ISS_TCR_EL1, ISS_TTBR1_EL1);
        assert_ne!(ISS_CNTP_CVAL_EL0, ISS_CNTP_TVAL_EL0);
        // Rt and direction are not part of the match key
        assert_eq!(ISS_SCTLR_EL1 & ((0x1F << 5) | 1), 0);
    }

    #[test]
    fn stage1_registers_trigger_breakpoint_reevaluation() {
        assert!(invalidates_patched_vas(ISS_TTBR0_EL1));
        assert!(invalidates_patched_vas(ISS_SCTLR_EL1));
        assert!(!invalidates_patched_vas(ISS_FAR_EL1));
        assert!(!invalidates_patched_vas(ISS_CNTP_CVAL_EL0));
    }

    #[test]
    fn condition_codes() {
        let z_set = 1u64 << 30;
        assert!(evaluate_condition_code(z_set, 0x0)); // EQ
        assert!(!evaluate_condition_code(z_set, 0x1)); // NE
        assert!(evaluate_condition_code(0, 0xE)); // AL
        let n_set = 1u64 << 31;
        assert!(evaluate_condition_code(n_set, 0x4)); // MI
        assert!(!evaluate_condition_code(n_set, 0xA)); // GE (N != V)
    }
}
