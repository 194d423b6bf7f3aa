//! Cache and TLB maintenance
//!
//! Self-modifying writes (software breakpoints, the SMC trampoline, guest
//! pages written through the aliasing window) follow the standard sequence:
//! clean data cache to PoU, DSB, invalidate instruction cache to PoU, DSB,
//! ISB. CTR_EL0.{IDC,DIC} short-circuit the parts the core does not need.

use super::barrier;
use super::sysreg;

/// Smallest data cache line size, from CTR_EL0.DminLine (log2 words).
pub fn data_cache_line_size() -> usize {
    let ctr = sysreg::read_ctr_el0();
    4usize << ((ctr >> 16) & 0xF)
}

/// Smallest instruction cache line size, from CTR_EL0.IminLine.
pub fn insn_cache_line_size() -> usize {
    let ctr = sysreg::read_ctr_el0();
    4usize << (ctr & 0xF)
}

/// Instruction cache policy from CTR_EL0.L1Ip: 0 = VPIPT, 1 = AIVIVT,
/// 2 = VIVT, 3 = PIPT.
pub fn insn_cache_policy() -> u32 {
    ((sysreg::read_ctr_el0() >> 14) & 3) as u32
}

#[cfg(target_arch = "aarch64")]
mod imp {
    use super::*;

    #[inline(always)]
    fn cache_op_range(addr: usize, size: usize, line: usize, op: unsafe fn(usize)) {
        let begin = addr & !(line - 1);
        let end = (addr + size + line - 1) & !(line - 1);
        let mut pos = begin;
        while pos < end {
            unsafe { op(pos) };
            pos += line;
        }
    }

    unsafe fn dc_cvau(va: usize) {
        core::arch::asm!("dc cvau, {}", in(reg) va, options(nostack));
    }

    unsafe fn dc_civac(va: usize) {
        core::arch::asm!("dc civac, {}", in(reg) va, options(nostack));
    }

    unsafe fn ic_ivau(va: usize) {
        core::arch::asm!("ic ivau, {}", in(reg) va, options(nostack));
    }

    pub fn clean_data_range_pou(addr: usize, size: usize) {
        cache_op_range(addr, size, data_cache_line_size(), dc_cvau);
        barrier::dsb_ish();
    }

    pub fn clean_invalidate_data_range(addr: usize, size: usize) {
        cache_op_range(addr, size, data_cache_line_size(), dc_civac);
        barrier::dsb_ish();
    }

    pub fn invalidate_insn_range_pou(addr: usize, size: usize) {
        cache_op_range(addr, size, insn_cache_line_size(), ic_ivau);
        barrier::dsb_ish();
        barrier::isb();
    }

    pub fn invalidate_insn_all() {
        unsafe { core::arch::asm!("ic ialluis", options(nostack)) };
        barrier::dsb_ish();
        barrier::isb();
    }

    /// Invalidate all EL2 stage-1 TLB entries on this core.
    pub fn tlb_invalidate_el2_local() {
        unsafe { core::arch::asm!("tlbi alle2", options(nostack)) };
    }

    /// Invalidate the EL2 stage-1 TLB entry covering one page on this core.
    pub fn tlb_invalidate_el2_page_local(va: usize) {
        let arg = (va as u64) >> 12;
        unsafe { core::arch::asm!("tlbi vae2, {}", in(reg) arg, options(nostack)) };
    }

    /// Broadcast invalidate of all EL1&0 stage-1 entries for the current VMID.
    pub fn tlb_invalidate_el1() {
        unsafe { core::arch::asm!("tlbi vmalle1is", options(nostack)) };
    }

    /// Invalidate all stage-1 and stage-2 entries for EL1&0, this core only.
    pub fn tlb_invalidate_el1_stage12_local() {
        unsafe { core::arch::asm!("tlbi alle1", options(nostack)) };
    }
}

#[cfg(not(target_arch = "aarch64"))]
mod imp {
    use super::barrier;

    pub fn clean_data_range_pou(_addr: usize, _size: usize) {
        barrier::dsb_ish();
    }

    pub fn clean_invalidate_data_range(_addr: usize, _size: usize) {
        barrier::dsb_ish();
    }

    pub fn invalidate_insn_range_pou(_addr: usize, _size: usize) {
        barrier::dsb_ish();
    }

    pub fn invalidate_insn_all() {}

    pub fn tlb_invalidate_el2_local() {}

    pub fn tlb_invalidate_el2_page_local(_va: usize) {}

    pub fn tlb_invalidate_el1() {}

    pub fn tlb_invalidate_el1_stage12_local() {}
}

pub use imp::*;

/// Make a range of freshly written instructions observable by this core's
/// fetch. CTR_EL0.IDC/DIC elide the halves hardware keeps coherent itself.
pub fn handle_self_modifying_code_pou(addr: usize, size: usize) {
    let ctr = sysreg::read_ctr_el0();
    if ctr & (1 << 28) == 0 {
        clean_data_range_pou(addr, size);
    }
    if ctr & (1 << 29) == 0 {
        invalidate_insn_range_pou(addr, size);
    }
    barrier::isb();
}

/// Coherency for a guest page written through the aliasing window: the write
/// may have touched executable memory or translation tables under any alias.
pub fn coherency_for_guest_write(addr: usize, size: usize) {
    clean_data_range_pou(addr, size);
    let policy = insn_cache_policy();
    if policy == 1 || policy == 2 {
        // AIVIVT / VIVT: range ops are not enough under aliasing
        invalidate_insn_all();
    } else {
        invalidate_insn_range_pou(addr, size);
    }
    tlb_invalidate_el1();
    barrier::dsb_sy();
    barrier::isb();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_sizes_have_sane_floor() {
        // CTR_EL0 reads 0 on the host stub: minimum encodable line is 4 bytes
        assert_eq!(data_cache_line_size(), 4);
        assert_eq!(insn_cache_line_size(), 4);
    }
}
