//! SMC forwarding with PSCI hooks
//!
//! Every guest SMC traps (HCR_EL2.TSC). PSCI power-management calls are
//! inspected first: CPU_ON and CPU_SUSPEND carry the address the guest wants
//! the woken core to start at, and the hypervisor swaps in its own warmboot
//! entry so it regains EL2 on that core before the guest runs. The original
//! entry point is parked in the target core's context.
//!
//! The call is then re-issued to the secure monitor through a trampoline
//! copied to a per-core buffer with the guest's exact SMC immediate patched
//! in (some monitors dispatch on it), made coherent with the standard
//! clean-to-PoU / invalidate-I sequence.

use crate::core_ctx::{core_ctx, current_core_ctx};
use crate::exceptions::{skip_faulting_instruction, Esr, ExceptionStackFrame};
use core::sync::atomic::Ordering;

/// PSCI function identifiers (SMC64 where both widths exist), after the
/// vendor ABI bits are cleared.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsciFunction {
    Version = 0x8400_0000,
    CpuSuspend = 0xC400_0001,
    CpuOff = 0x8400_0002,
    CpuOn = 0xC400_0003,
    SystemOff = 0x8400_0008,
    SystemReset = 0x8400_0009,
    CpuDefaultSuspend = 0xC400_000C,
    SystemSuspend = 0xC400_000E,
}

/// Guest x0 with the vendor's ABI-breaking bits masked out (some stacks set
/// bits in [15:8] of the function id).
pub fn psci_function_id(x0: u64) -> u32 {
    (x0 & !0xFF00) as u32
}

#[cfg(target_arch = "aarch64")]
fn warmboot_entry_pa() -> u64 {
    extern "C" {
        fn ventana_warmboot_start();
    }
    crate::memory_map::image_va_to_pa(ventana_warmboot_start as usize as u64)
}

#[cfg(not(target_arch = "aarch64"))]
fn warmboot_entry_pa() -> u64 {
    0x1000
}

/// CPU_ON(target_mpidr = x1, entrypoint = x2, context_id = x3): capture the
/// entrypoint for the target core and retarget the secure monitor at our own
/// warmboot path. The context id rides through EL3 untouched and is handed
/// to the guest once the target core has re-established EL2.
fn cpu_on_hook(frame: &mut ExceptionStackFrame) {
    let target = (frame.x[1] & 0xFF) as u32;
    let entrypoint = frame.x[2];

    if (target as usize) < crate::core_ctx::MAX_CORES && frame.x[1] & !0xFFu64 == 0 {
        core_ctx(target)
            .kernel_entrypoint
            .store(entrypoint, Ordering::SeqCst);
        frame.x[2] = warmboot_entry_pa();
        crate::debug!(
            "PSCI CPU_ON hook: core {} guest entrypoint {:#x}",
            target,
            entrypoint
        );
    } else {
        crate::warn!("PSCI CPU_ON to unsupported affinity {:#x}", frame.x[1]);
    }
}

/// CPU_SUSPEND(power_state = x1, entrypoint = x2, context_id = x3): same
/// trick for the resume path of a powerdown suspend.
fn cpu_suspend_hook(frame: &mut ExceptionStackFrame) {
    let entrypoint = frame.x[2];
    current_core_ctx()
        .kernel_entrypoint
        .store(entrypoint, Ordering::SeqCst);
    frame.x[2] = warmboot_entry_pa();
    crate::debug!("PSCI CPU_SUSPEND hook: guest resume entrypoint {:#x}", entrypoint);
}

pub fn handle_smc_trap(frame: &mut ExceptionStackFrame, esr: Esr) {
    let smc_id = esr.iss() & 0xFFFF;
    let func = psci_function_id(frame.x[0]);

    if func == PsciFunction::CpuSuspend as u32 {
        cpu_suspend_hook(frame);
    } else if func == PsciFunction::CpuOn as u32 {
        cpu_on_hook(frame);
    } else if func == PsciFunction::CpuOff as u32 {
        crate::debug::manager::report_core_off();
    } else if func == PsciFunction::SystemOff as u32 || func == PsciFunction::SystemReset as u32 {
        crate::info!("PSCI system off/reset requested by the guest");
        crate::debug::manager::report_exit();
    } else if func == PsciFunction::CpuDefaultSuspend as u32
        || func == PsciFunction::SystemSuspend as u32
    {
        cpu_suspend_hook(frame);
    }

    do_smc_indirect_call(frame, smc_id);
    skip_faulting_instruction(frame, 4);
}

#[cfg(target_arch = "aarch64")]
mod trampoline {
    use super::*;

    extern "C" {
        static ventana_smc_template: u8;
        static ventana_smc_template_smc_insn: u8;
        static ventana_smc_template_end: u8;
    }

    const SMC_BUF_INSNS: usize = 64;

    #[repr(C, align(64))]
    struct SmcCallBuffer([u32; SMC_BUF_INSNS]);

    static mut SMC_CALL_BUFFERS: [SmcCallBuffer; crate::core_ctx::MAX_CORES] = [
        SmcCallBuffer([0; SMC_BUF_INSNS]),
        SmcCallBuffer([0; SMC_BUF_INSNS]),
        SmcCallBuffer([0; SMC_BUF_INSNS]),
        SmcCallBuffer([0; SMC_BUF_INSNS]),
    ];

    pub fn call(frame: &mut ExceptionStackFrame, smc_id: u32) {
        let core_id = crate::core_ctx::current_core_id() as usize;
        unsafe {
            let start = core::ptr::addr_of!(ventana_smc_template) as usize;
            let smc_off = core::ptr::addr_of!(ventana_smc_template_smc_insn) as usize - start;
            let len = core::ptr::addr_of!(ventana_smc_template_end) as usize - start;
            debug_assert!(len / 4 <= SMC_BUF_INSNS);

            let buf = core::ptr::addr_of_mut!(SMC_CALL_BUFFERS[core_id].0);
            core::ptr::copy_nonoverlapping(start as *const u32, (*buf).as_mut_ptr(), len / 4);
            // SMC #imm16: immediate lives in bits [20:5]
            (*buf)[smc_off / 4] = 0xD400_0003 | ((smc_id & 0xFFFF) << 5);

            crate::arch::cache::handle_self_modifying_code_pou(buf as usize, len);

            let f: extern "C" fn(*mut ExceptionStackFrame) = core::mem::transmute(buf);
            f(frame as *mut ExceptionStackFrame);
        }
    }
}

#[cfg(target_arch = "aarch64")]
fn do_smc_indirect_call(frame: &mut ExceptionStackFrame, smc_id: u32) {
    trampoline::call(frame, smc_id);
}

#[cfg(not(target_arch = "aarch64"))]
fn do_smc_indirect_call(_frame: &mut ExceptionStackFrame, _smc_id: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_id_masks_vendor_bits() {
        assert_eq!(psci_function_id(0xC400_0003), PsciFunction::CpuOn as u32);
        // Some stacks set bits in [15:8] of the id; they must not defeat the
        // match
        assert_eq!(psci_function_id(0xC400_1203), PsciFunction::CpuOn as u32);
        assert_eq!(psci_function_id(0xC400_0001), PsciFunction::CpuSuspend as u32);
    }

    #[test]
    fn cpu_on_hook_captures_entrypoint_and_retargets() {
        let _guard = crate::lib::test_lock();
        crate::core_ctx::init(0, true, 0, false);
        let mut frame = ExceptionStackFrame::zeroed();
        frame.x[0] = PsciFunction::CpuOn as u64;
        frame.x[1] = 1; // core 1
        frame.x[2] = 0xF000_0000;
        frame.x[3] = 0xDEAD;

        cpu_on_hook(&mut frame);

        assert_eq!(
            core_ctx(1).kernel_entrypoint.load(Ordering::SeqCst),
            0xF000_0000
        );
        // x2 now points at the hypervisor warmboot entry
        assert_eq!(frame.x[2], warmboot_entry_pa());
        // context id untouched
        assert_eq!(frame.x[3], 0xDEAD);
    }

    #[test]
    fn cpu_on_hook_rejects_secondary_clusters() {
        let mut frame = ExceptionStackFrame::zeroed();
        frame.x[1] = 0x100; // Aff1 != 0
        frame.x[2] = 0xF000_0000;
        cpu_on_hook(&mut frame);
        assert_eq!(frame.x[2], 0xF000_0000);
    }
}
