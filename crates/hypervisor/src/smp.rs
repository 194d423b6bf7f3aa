//! Cross-core execution
//!
//! A core that needs work done on other cores fills its *own* context slot
//! with `(function, args, sync)` plus a barrier covering the target mask,
//! then broadcasts the ExecuteFunction SGI to the other targets and runs its
//! own share inline. Each recipient recovers the sender's core id from the
//! SGI acknowledge, runs the function, and joins the barrier rendezvous when
//! a synchronous call asked for it.
//!
//! Not reentrant per sender: a core must not issue another RPC while a
//! barrier it owns still has bits set.

use core::sync::atomic::Ordering;

use crate::core_ctx::{self, core_ctx, current_core_ctx, current_core_id};
use crate::irq;

/// SGI ids the hypervisor reserves for itself. The remaining SGIs (4..15)
/// stay available to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HypSgi {
    ExecuteFunction = 0,
    VgicUpdate = 1,
    DebugPause = 2,
    ReportDebuggerBreak = 3,
}

pub const NUM_HYP_SGIS: u16 = 4;

pub type ExecutedFunction = fn(usize);

/// Run `f(args)` on every core in `core_list`. With `sync`, waits until all
/// recipients have finished.
pub fn execute_function_on_cores(f: ExecutedFunction, args: usize, sync: bool, core_list: u32) {
    let ctx = current_core_ctx();

    ctx.executed_function_barrier.init(core_list);
    ctx.executed_function.store(f as usize, Ordering::SeqCst);
    ctx.executed_function_args.store(args, Ordering::SeqCst);
    ctx.executed_function_sync.store(sync, Ordering::SeqCst);

    // Publish the slot before the SGI lands anywhere
    crate::arch::dsb_sy();

    let self_bit = 1u32 << current_core_id();
    irq::generate_sgi_for_list(HypSgi::ExecuteFunction, core_list & !self_bit);

    // Run the local share directly; the remote cores service theirs in the
    // IRQ top-half. With sync set this joins the barrier rendezvous, so the
    // call only returns once every target has finished.
    if core_list & self_bit != 0 {
        execute_function_interrupt_handler(current_core_id());
    }
}

pub fn execute_function_on_all_cores(f: ExecutedFunction, args: usize, sync: bool) {
    execute_function_on_cores(f, args, sync, core_ctx::get_active_core_mask());
}

pub fn execute_function_on_all_cores_but_self(f: ExecutedFunction, args: usize, sync: bool) {
    let mask = core_ctx::get_active_core_mask() & !(1 << current_core_id());
    execute_function_on_cores(f, args, sync, mask);
}

/// IRQ top-half handler for the ExecuteFunction SGI. `src_core` comes from
/// the IAR source field.
pub fn execute_function_interrupt_handler(src_core: u32) {
    let sender = core_ctx(src_core);
    let f = sender.executed_function.load(Ordering::SeqCst);
    let args = sender.executed_function_args.load(Ordering::SeqCst);

    // The slot always holds a valid function here: the SGI is only generated
    // after the sender's DSB
    let f: ExecutedFunction = unsafe { core::mem::transmute(f) };
    f(args);

    if sender.executed_function_sync.load(Ordering::SeqCst) {
        sender.executed_function_barrier.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn bump(args: usize) {
        CALLS.fetch_add(args, Ordering::SeqCst);
    }

    #[test]
    fn rpc_slot_roundtrip() {
        let _guard = crate::lib::test_lock();
        crate::core_ctx::init(0, true, 0, false);
        let ctx = current_core_ctx();
        ctx.executed_function.store(bump as usize, Ordering::SeqCst);
        ctx.executed_function_args.store(3, Ordering::SeqCst);
        ctx.executed_function_sync.store(false, Ordering::SeqCst);

        let before = CALLS.load(Ordering::SeqCst);
        execute_function_interrupt_handler(0);
        assert_eq!(CALLS.load(Ordering::SeqCst), before + 3);
    }

    #[test]
    fn hyp_sgi_ids_are_low_sgis() {
        assert!(NUM_HYP_SGIS <= 16);
        assert_eq!(HypSgi::ExecuteFunction as u16, 0);
        assert_eq!(HypSgi::ReportDebuggerBreak as u16, 3);
    }
}
