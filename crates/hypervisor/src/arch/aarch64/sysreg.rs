//! System register accessors
//!
//! One `read_x`/`write_x` pair per register the hypervisor touches. On the
//! aarch64 target these compile to a single `mrs`/`msr`; on any other
//! architecture they are inert stubs (reads return 0) so host-side unit
//! tests of the surrounding logic can link.
//!
//! Writes are `unsafe`: most of these registers change translation, trap or
//! timer behavior for the whole core.

macro_rules! sysreg_rw {
    ($read_fn:ident, $write_fn:ident, $name:literal) => {
        sysreg_r!($read_fn, $name);
        sysreg_w!($write_fn, $name);
    };
}

macro_rules! sysreg_r {
    ($read_fn:ident, $name:literal) => {
        #[cfg(target_arch = "aarch64")]
        #[inline(always)]
        pub fn $read_fn() -> u64 {
            let v: u64;
            unsafe {
                core::arch::asm!(concat!("mrs {}, ", $name), out(reg) v, options(nomem, nostack));
            }
            v
        }

        #[cfg(not(target_arch = "aarch64"))]
        #[inline(always)]
        pub fn $read_fn() -> u64 {
            0
        }
    };
}

macro_rules! sysreg_w {
    ($write_fn:ident, $name:literal) => {
        #[cfg(target_arch = "aarch64")]
        #[inline(always)]
        pub unsafe fn $write_fn(v: u64) {
            core::arch::asm!(concat!("msr ", $name, ", {}"), in(reg) v, options(nomem, nostack));
        }

        #[cfg(not(target_arch = "aarch64"))]
        #[inline(always)]
        pub unsafe fn $write_fn(_v: u64) {}
    };
}

// Generic counter and timers
sysreg_r!(read_cntpct_el0, "cntpct_el0");
sysreg_r!(read_cntvct_el0, "cntvct_el0");
sysreg_r!(read_cntfrq_el0, "cntfrq_el0");
sysreg_rw!(read_cntp_cval_el0, write_cntp_cval_el0, "cntp_cval_el0");
sysreg_rw!(read_cntp_ctl_el0, write_cntp_ctl_el0, "cntp_ctl_el0");
sysreg_rw!(read_cnthp_cval_el2, write_cnthp_cval_el2, "cnthp_cval_el2");
sysreg_rw!(read_cnthp_ctl_el2, write_cnthp_ctl_el2, "cnthp_ctl_el2");
sysreg_rw!(read_cntvoff_el2, write_cntvoff_el2, "cntvoff_el2");
sysreg_rw!(read_cnthctl_el2, write_cnthctl_el2, "cnthctl_el2");

// Interrupt masking
sysreg_rw!(read_daif, write_daif, "daif");

// EL2 translation control
sysreg_rw!(read_mair_el2, write_mair_el2, "mair_el2");
sysreg_w!(write_tcr_el2, "tcr_el2");
sysreg_w!(write_ttbr0_el2, "ttbr0_el2");
sysreg_rw!(read_sctlr_el2, write_sctlr_el2, "sctlr_el2");
sysreg_w!(write_vbar_el2, "vbar_el2");

// Stage-2 translation control
sysreg_w!(write_vttbr_el2, "vttbr_el2");
sysreg_w!(write_vtcr_el2, "vtcr_el2");
sysreg_rw!(read_hcr_el2, write_hcr_el2, "hcr_el2");
sysreg_w!(write_cptr_el2, "cptr_el2");

// Debug
sysreg_rw!(read_mdcr_el2, write_mdcr_el2, "mdcr_el2");
sysreg_rw!(read_mdscr_el1, write_mdscr_el1, "mdscr_el1");

// Exception syndrome / return state
sysreg_r!(read_esr_el2, "esr_el2");
sysreg_r!(read_far_el2, "far_el2");
sysreg_r!(read_hpfar_el2, "hpfar_el2");
sysreg_rw!(read_elr_el2, write_elr_el2, "elr_el2");
sysreg_rw!(read_spsr_el2, write_spsr_el2, "spsr_el2");

// Address translation result
sysreg_r!(read_par_el1, "par_el1");

// Identification
sysreg_r!(read_id_aa64mmfr0_el1, "id_aa64mmfr0_el1");
sysreg_r!(read_id_aa64dfr0_el1, "id_aa64dfr0_el1");
sysreg_r!(read_mpidr_el1, "mpidr_el1");
sysreg_r!(read_ctr_el0, "ctr_el0");

// Guest EL1 state reachable from EL2
sysreg_rw!(read_sctlr_el1, write_sctlr_el1, "sctlr_el1");
sysreg_rw!(read_ttbr0_el1, write_ttbr0_el1, "ttbr0_el1");
sysreg_rw!(read_ttbr1_el1, write_ttbr1_el1, "ttbr1_el1");
sysreg_rw!(read_tcr_el1, write_tcr_el1, "tcr_el1");
sysreg_rw!(read_esr_el1, write_esr_el1, "esr_el1");
sysreg_rw!(read_far_el1, write_far_el1, "far_el1");
sysreg_rw!(read_afsr0_el1, write_afsr0_el1, "afsr0_el1");
sysreg_rw!(read_afsr1_el1, write_afsr1_el1, "afsr1_el1");
sysreg_rw!(read_mair_el1, write_mair_el1, "mair_el1");
sysreg_rw!(read_amair_el1, write_amair_el1, "amair_el1");
sysreg_rw!(read_contextidr_el1, write_contextidr_el1, "contextidr_el1");
sysreg_rw!(read_sp_el0, write_sp_el0, "sp_el0");
sysreg_rw!(read_sp_el1, write_sp_el1, "sp_el1");
sysreg_rw!(read_elr_el1, write_elr_el1, "elr_el1");
sysreg_rw!(read_spsr_el1, write_spsr_el1, "spsr_el1");

/// Mask IRQs via the immediate form (`msr daifset, #2`).
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn set_daif_irq_masked() {
    unsafe { core::arch::asm!("msr daifset, #2", options(nomem, nostack)) }
}

#[cfg(not(target_arch = "aarch64"))]
#[inline(always)]
pub fn set_daif_irq_masked() {}

/// Unmask IRQs via the immediate form (`msr daifclr, #2`).
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn set_daif_irq_unmasked() {
    unsafe { core::arch::asm!("msr daifclr, #2", options(nomem, nostack)) }
}

#[cfg(not(target_arch = "aarch64"))]
#[inline(always)]
pub fn set_daif_irq_unmasked() {}

macro_rules! dbg_reg_bank {
    ($read_fn:ident, $write_fn:ident, $prefix:literal) => {
        /// Indexed debug-register access; `n` comes from the allocation
        /// bitmaps and is always below the bank size read from
        /// ID_AA64DFR0_EL1 (at most 16).
        #[cfg(target_arch = "aarch64")]
        pub fn $read_fn(n: usize) -> u64 {
            let v: u64;
            unsafe {
                match n {
                    0 => core::arch::asm!(concat!("mrs {}, ", $prefix, "0_el1"), out(reg) v, options(nomem, nostack)),
                    1 => core::arch::asm!(concat!("mrs {}, ", $prefix, "1_el1"), out(reg) v, options(nomem, nostack)),
                    2 => core::arch::asm!(concat!("mrs {}, ", $prefix, "2_el1"), out(reg) v, options(nomem, nostack)),
                    3 => core::arch::asm!(concat!("mrs {}, ", $prefix, "3_el1"), out(reg) v, options(nomem, nostack)),
                    4 => core::arch::asm!(concat!("mrs {}, ", $prefix, "4_el1"), out(reg) v, options(nomem, nostack)),
                    5 => core::arch::asm!(concat!("mrs {}, ", $prefix, "5_el1"), out(reg) v, options(nomem, nostack)),
                    6 => core::arch::asm!(concat!("mrs {}, ", $prefix, "6_el1"), out(reg) v, options(nomem, nostack)),
                    7 => core::arch::asm!(concat!("mrs {}, ", $prefix, "7_el1"), out(reg) v, options(nomem, nostack)),
                    8 => core::arch::asm!(concat!("mrs {}, ", $prefix, "8_el1"), out(reg) v, options(nomem, nostack)),
                    9 => core::arch::asm!(concat!("mrs {}, ", $prefix, "9_el1"), out(reg) v, options(nomem, nostack)),
                    10 => core::arch::asm!(concat!("mrs {}, ", $prefix, "10_el1"), out(reg) v, options(nomem, nostack)),
                    11 => core::arch::asm!(concat!("mrs {}, ", $prefix, "11_el1"), out(reg) v, options(nomem, nostack)),
                    12 => core::arch::asm!(concat!("mrs {}, ", $prefix, "12_el1"), out(reg) v, options(nomem, nostack)),
                    13 => core::arch::asm!(concat!("mrs {}, ", $prefix, "13_el1"), out(reg) v, options(nomem, nostack)),
                    14 => core::arch::asm!(concat!("mrs {}, ", $prefix, "14_el1"), out(reg) v, options(nomem, nostack)),
                    _ => core::arch::asm!(concat!("mrs {}, ", $prefix, "15_el1"), out(reg) v, options(nomem, nostack)),
                }
            }
            v
        }

        #[cfg(not(target_arch = "aarch64"))]
        pub fn $read_fn(_n: usize) -> u64 {
            0
        }

        #[cfg(target_arch = "aarch64")]
        pub unsafe fn $write_fn(n: usize, v: u64) {
            match n {
                0 => core::arch::asm!(concat!("msr ", $prefix, "0_el1, {}"), in(reg) v, options(nomem, nostack)),
                1 => core::arch::asm!(concat!("msr ", $prefix, "1_el1, {}"), in(reg) v, options(nomem, nostack)),
                2 => core::arch::asm!(concat!("msr ", $prefix, "2_el1, {}"), in(reg) v, options(nomem, nostack)),
                3 => core::arch::asm!(concat!("msr ", $prefix, "3_el1, {}"), in(reg) v, options(nomem, nostack)),
                4 => core::arch::asm!(concat!("msr ", $prefix, "4_el1, {}"), in(reg) v, options(nomem, nostack)),
                5 => core::arch::asm!(concat!("msr ", $prefix, "5_el1, {}"), in(reg) v, options(nomem, nostack)),
                6 => core::arch::asm!(concat!("msr ", $prefix, "6_el1, {}"), in(reg) v, options(nomem, nostack)),
                7 => core::arch::asm!(concat!("msr ", $prefix, "7_el1, {}"), in(reg) v, options(nomem, nostack)),
                8 => core::arch::asm!(concat!("msr ", $prefix, "8_el1, {}"), in(reg) v, options(nomem, nostack)),
                9 => core::arch::asm!(concat!("msr ", $prefix, "9_el1, {}"), in(reg) v, options(nomem, nostack)),
                10 => core::arch::asm!(concat!("msr ", $prefix, "10_el1, {}"), in(reg) v, options(nomem, nostack)),
                11 => core::arch::asm!(concat!("msr ", $prefix, "11_el1, {}"), in(reg) v, options(nomem, nostack)),
                12 => core::arch::asm!(concat!("msr ", $prefix, "12_el1, {}"), in(reg) v, options(nomem, nostack)),
                13 => core::arch::asm!(concat!("msr ", $prefix, "13_el1, {}"), in(reg) v, options(nomem, nostack)),
                14 => core::arch::asm!(concat!("msr ", $prefix, "14_el1, {}"), in(reg) v, options(nomem, nostack)),
                _ => core::arch::asm!(concat!("msr ", $prefix, "15_el1, {}"), in(reg) v, options(nomem, nostack)),
            }
        }

        #[cfg(not(target_arch = "aarch64"))]
        pub unsafe fn $write_fn(_n: usize, _v: u64) {}
    };
}

dbg_reg_bank!(read_dbgbvr, write_dbgbvr, "dbgbvr");
dbg_reg_bank!(read_dbgbcr, write_dbgbcr, "dbgbcr");
dbg_reg_bank!(read_dbgwvr, write_dbgwvr, "dbgwvr");
dbg_reg_bank!(read_dbgwcr, write_dbgwcr, "dbgwcr");

/// Translate a guest VA through stages 1 and 2 (as an EL1 read), leaving the
/// result in PAR_EL1.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn at_s12e1r(va: u64) {
    unsafe { core::arch::asm!("at s12e1r, {}", in(reg) va, options(nostack)) }
}

#[cfg(not(target_arch = "aarch64"))]
#[inline(always)]
pub fn at_s12e1r(_va: u64) {}

/// Translate a guest VA through stage 1 only.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn at_s1e1r(va: u64) {
    unsafe { core::arch::asm!("at s1e1r, {}", in(reg) va, options(nostack)) }
}

#[cfg(not(target_arch = "aarch64"))]
#[inline(always)]
pub fn at_s1e1r(_va: u64) {}
