//! Lower-EL data aborts
//!
//! With a static stage-2 map the only *expected* data abort is the guest
//! touching the distributor page, which stage 2 leaves unmapped on purpose.
//! Anything else is a guest bug: dump it, skip the instruction, and let the
//! guest dig its own grave.

use crate::exceptions::{skip_faulting_instruction, Esr, ExceptionStackFrame};
use crate::arch::sysreg;

/// Decoded data-abort ISS
#[derive(Debug, Clone, Copy)]
pub struct DataAbortIss {
    /// Instruction syndrome valid (register/size fields usable)
    pub isv: bool,
    /// log2 of the access size
    pub sas: u32,
    /// Sign-extend the loaded value
    pub sse: bool,
    /// Register transfer number (31 = xzr/wzr)
    pub srt: u32,
    /// 64-bit register width
    pub sf: bool,
    /// Acquire/release semantics
    pub ar: bool,
    /// Write, not read
    pub wnr: bool,
    /// Stage-2 fault during a stage-1 walk
    pub s1ptw: bool,
    /// Cache maintenance operation
    pub cm: bool,
    /// Data fault status code
    pub dfsc: u32,
}

impl DataAbortIss {
    pub fn decode(iss: u32) -> Self {
        Self {
            isv: iss & (1 << 24) != 0,
            sas: (iss >> 22) & 3,
            sse: iss & (1 << 21) != 0,
            srt: (iss >> 16) & 0x1F,
            sf: iss & (1 << 15) != 0,
            ar: iss & (1 << 14) != 0,
            wnr: iss & (1 << 6) != 0,
            s1ptw: iss & (1 << 7) != 0,
            cm: iss & (1 << 8) != 0,
            dfsc: iss & 0x3F,
        }
    }
}

pub fn dump_unhandled_data_abort(iss: DataAbortIss, addr: u64, reason: &str) {
    crate::warn!(
        "unhandled data abort: {} (addr={:#x} wnr={} sas={} dfsc={:#x} isv={})",
        reason,
        addr,
        iss.wnr as u32,
        iss.sas,
        iss.dfsc,
        iss.isv as u32
    );
}

/// Faulting IPA, from HPFAR (page) + FAR (offset bits).
fn fault_ipa() -> u64 {
    let hpfar = sysreg::read_hpfar_el2();
    let far = sysreg::read_far_el2();
    ((hpfar >> 4) << 12) | (far & 0xFFF)
}

pub fn handle_lower_el(frame: &mut ExceptionStackFrame, esr: Esr) {
    let iss = DataAbortIss::decode(esr.iss());
    let ipa = fault_ipa();
    let gicd_pa = crate::platform::active().gicd_pa as u64;

    if ipa & !0xFFF == gicd_pa && !iss.s1ptw && iss.isv && !iss.ar {
        crate::vgic::handle_vgicd_mmio(frame, iss, (ipa & 0xFFF) as usize);
    } else {
        dump_unhandled_data_abort(iss, ipa, "stage-2 abort outside the GICD");
    }

    skip_faulting_instruction(frame, if esr.il() { 4 } else { 2 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iss_decode() {
        // ISV=1, SAS=2 (word), SRT=5, WnR=1, DFSC=0x07
        let iss = (1 << 24) | (2 << 22) | (5 << 16) | (1 << 6) | 0x07;
        let d = DataAbortIss::decode(iss);
        assert!(d.isv);
        assert_eq!(d.sas, 2);
        assert_eq!(d.srt, 5);
        assert!(d.wnr);
        assert!(!d.s1ptw);
        assert_eq!(d.dfsc, 0x07);
        assert_eq!(1usize << d.sas, 4);
    }
}
