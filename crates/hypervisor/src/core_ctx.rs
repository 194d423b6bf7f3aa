//! Per-core context
//!
//! One statically allocated `CoreCtx` per physical core. The current core's
//! context pointer is parked in `tpidr_el2` for the whole lifetime of the
//! hypervisor; exception entry relies on it, and the tolerant device-memory
//! copy deliberately clears it so the SError vector can tell a probe fault
//! from a real one.
//!
//! Fields read or written by *other* cores (the CPU_ON entrypoint hook, the
//! execute-function RPC slot) are atomics; everything else is owned by the
//! core itself.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::exceptions::ExceptionStackFrame;
use crate::sync::Barrier;

pub const MAX_CORES: usize = 4;

pub struct CoreCtx {
    /// Frame of the exception that brought us out of the guest
    pub guest_frame: *mut ExceptionStackFrame,
    /// Emergency stack for faults taken inside EL2 itself
    pub crash_stack_top: usize,
    /// Where this core enters the guest kernel (hooked by PSCI CPU_ON/SUSPEND)
    pub kernel_entrypoint: AtomicU64,
    /// x0 for the guest kernel entry
    pub kernel_argument: u64,
    pub core_id: u32,
    /// GIC CPU interface self-mask; equals BIT(core_id) on this platform
    pub gic_interface_mask: u8,
    pub is_boot_core: bool,
    pub warmboot: bool,

    // Timer virtualization
    /// Accumulated time stolen by EL2; cntvoff_el2 tracks this value
    pub total_time_in_hypervisor: u64,
    /// Guest-intended EL1 physical timer compare value
    pub emul_ptimer_cval: u64,

    // Execute-function RPC slot (this core as the sender)
    pub executed_function: AtomicUsize,
    pub executed_function_args: AtomicUsize,
    pub executed_function_sync: AtomicBool,
    pub executed_function_barrier: Barrier,

    // Debug
    pub was_paused: bool,
    pub stepping_range_start: u64,
    pub stepping_range_end: u64,
}

impl CoreCtx {
    pub const fn new() -> Self {
        Self {
            guest_frame: core::ptr::null_mut(),
            crash_stack_top: 0,
            kernel_entrypoint: AtomicU64::new(0),
            kernel_argument: 0,
            core_id: 0,
            gic_interface_mask: 0,
            is_boot_core: false,
            warmboot: false,
            total_time_in_hypervisor: 0,
            emul_ptimer_cval: 0,
            executed_function: AtomicUsize::new(0),
            executed_function_args: AtomicUsize::new(0),
            executed_function_sync: AtomicBool::new(false),
            executed_function_barrier: Barrier::new(),
            was_paused: false,
            stepping_range_start: 0,
            stepping_range_end: 0,
        }
    }
}

// The raw frame pointer makes CoreCtx !Sync by default; cross-core access is
// restricted to the atomic fields above.
unsafe impl Sync for CoreCtx {}

static mut G_CORE_CTXS: [CoreCtx; MAX_CORES] = [
    CoreCtx::new(),
    CoreCtx::new(),
    CoreCtx::new(),
    CoreCtx::new(),
];

static ACTIVE_CORE_MASK: AtomicU32 = AtomicU32::new(0);

/// Context of an arbitrary core. Only the atomic fields may be touched when
/// `core_id` is not the caller's own core.
pub fn core_ctx(core_id: u32) -> &'static mut CoreCtx {
    unsafe { &mut *core::ptr::addr_of_mut!(G_CORE_CTXS[core_id as usize & (MAX_CORES - 1)]) }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn ctx_ptr() -> *mut CoreCtx {
    let p: u64;
    unsafe { core::arch::asm!("mrs {}, tpidr_el2", out(reg) p, options(nomem, nostack)) };
    p as *mut CoreCtx
}

#[cfg(not(target_arch = "aarch64"))]
#[inline(always)]
fn ctx_ptr() -> *mut CoreCtx {
    unsafe { core::ptr::addr_of_mut!(G_CORE_CTXS[0]) }
}

/// This core's context. Installed by `init` before anything else runs.
#[inline(always)]
pub fn current_core_ctx() -> &'static mut CoreCtx {
    unsafe { &mut *ctx_ptr() }
}

#[inline(always)]
pub fn current_core_id() -> u32 {
    let p = ctx_ptr();
    if p.is_null() {
        // Pre-init (or mid device-probe): fall back to the hardware id
        (crate::arch::sysreg::read_mpidr_el1() & 0xFF) as u32
    } else {
        unsafe { (*p).core_id }
    }
}

/// Bind this core's context to tpidr_el2 and fill in the identity fields.
/// Called once per core on cold boot and again on warmboot.
pub fn init(core_id: u32, is_boot_core: bool, argument: u64, warmboot: bool) {
    let ctx = core_ctx(core_id);
    ctx.core_id = core_id;
    ctx.is_boot_core = is_boot_core;
    ctx.warmboot = warmboot;
    ctx.kernel_argument = argument;
    ctx.total_time_in_hypervisor = 0;
    if is_boot_core && !warmboot {
        ctx.kernel_entrypoint.store(0, Ordering::Relaxed);
    }

    install_ctx_register(ctx as *mut CoreCtx);
}

#[cfg(target_arch = "aarch64")]
fn install_ctx_register(ctx: *mut CoreCtx) {
    unsafe {
        core::arch::asm!("msr tpidr_el2, {}", in(reg) ctx as u64, options(nomem, nostack));
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn install_ctx_register(_ctx: *mut CoreCtx) {}

/// Clear / restore the context register around tolerant device probes.
#[cfg(target_arch = "aarch64")]
pub fn set_ctx_register_null() {
    unsafe { core::arch::asm!("msr tpidr_el2, xzr", options(nomem, nostack)) };
}

#[cfg(not(target_arch = "aarch64"))]
pub fn set_ctx_register_null() {}

pub fn restore_ctx_register(core_id: u32) {
    install_ctx_register(core_ctx(core_id) as *mut CoreCtx);
}

pub fn is_ctx_register_null() -> bool {
    ctx_ptr().is_null()
}

pub fn set_current_core_active() {
    ACTIVE_CORE_MASK.fetch_or(1 << current_core_id(), Ordering::SeqCst);
}

pub fn set_current_core_inactive() {
    ACTIVE_CORE_MASK.fetch_and(!(1 << current_core_id()), Ordering::SeqCst);
}

pub fn get_active_core_mask() -> u32 {
    ACTIVE_CORE_MASK.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_core_is_core0_on_host() {
        let _guard = crate::lib::test_lock();
        init(0, true, 0xDEAD, false);
        assert_eq!(current_core_id(), 0);
        assert_eq!(current_core_ctx().kernel_argument, 0xDEAD);
        assert!(current_core_ctx().is_boot_core);
    }

    #[test]
    fn active_mask_tracks_current_core() {
        let _guard = crate::lib::test_lock();
        init(0, true, 0, false);
        set_current_core_active();
        assert_ne!(get_active_core_mask() & 1, 0);
    }
}
