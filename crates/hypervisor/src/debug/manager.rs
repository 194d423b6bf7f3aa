//! Debug manager: cross-core pause, debug events, stepping control
//!
//! One `DebugEventInfo` per core, a global `paused_core_list` bitmap, and a
//! single-step request mask. A paused core spins in `handle_pause` on its
//! way back to the guest, with IRQs unmasked so SGIs and the transport keep
//! working, until the debugger clears its bit. Waking also (re)arms or
//! cancels single-step for that core.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::core_ctx::{current_core_ctx, current_core_id};
use crate::exceptions::{Esr, ExceptionStackFrame};
use crate::smp::HypSgi;
use crate::sync::Barrier;

/// What stopped a core (bundled into stop replies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    None,
    /// BRK with one of our software-breakpoint immediates
    SwBreakpoint { uid: u16 },
    /// Guest's own BRK (not one of ours)
    GuestBreak { uid: u16 },
    HwBreakpoint,
    Watchpoint { addr: u64, direction: u32 },
    SingleStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugEventType {
    None,
    DebuggerBreak,
    Exception,
    CoreOn,
    CoreOff,
    Exit,
    OutputString { address: u64, size: usize },
}

#[derive(Clone, Copy)]
pub struct DebugEventInfo {
    pub ty: DebugEventType,
    pub stop_reason: StopReason,
    pub core_id: u32,
    pub frame: *mut ExceptionStackFrame,
    pub handled: bool,
}

impl DebugEventInfo {
    const fn empty() -> Self {
        Self {
            ty: DebugEventType::None,
            stop_reason: StopReason::None,
            core_id: 0,
            frame: core::ptr::null_mut(),
            handled: false,
        }
    }
}

struct DebugManager {
    events: [DebugEventInfo; crate::core_ctx::MAX_CORES],
}

static mut G_DEBUG_MANAGER: DebugManager = DebugManager {
    events: [DebugEventInfo::empty(); crate::core_ctx::MAX_CORES],
};

static PAUSED_CORE_LIST: AtomicU32 = AtomicU32::new(0);
static SINGLE_STEP_CORE_LIST: AtomicU32 = AtomicU32::new(0);
static REPORTING_ENABLED: AtomicBool = AtomicBool::new(false);
static PAUSE_BARRIER: Barrier = Barrier::new();

fn events() -> &'static mut [DebugEventInfo; crate::core_ctx::MAX_CORES] {
    unsafe { &mut *core::ptr::addr_of_mut!(G_DEBUG_MANAGER.events) }
}

pub fn init() {
    for e in events().iter_mut() {
        *e = DebugEventInfo::empty();
    }
    PAUSED_CORE_LIST.store(0, Ordering::SeqCst);
    SINGLE_STEP_CORE_LIST.store(0, Ordering::SeqCst);
    REPORTING_ENABLED.store(false, Ordering::SeqCst);
}

pub fn set_reporting_enabled(enabled: bool) {
    REPORTING_ENABLED.store(enabled, Ordering::SeqCst);
}

pub fn reporting_enabled() -> bool {
    REPORTING_ENABLED.load(Ordering::SeqCst)
}

pub fn paused_core_list() -> u32 {
    PAUSED_CORE_LIST.load(Ordering::SeqCst)
}

pub fn is_core_paused(core_id: u32) -> bool {
    paused_core_list() & (1 << core_id) != 0
}

pub fn has_debug_event(core_id: u32) -> bool {
    is_core_paused(core_id) && events()[core_id as usize].ty != DebugEventType::None
}

pub fn get_debug_event(core_id: u32) -> &'static mut DebugEventInfo {
    &mut events()[core_id as usize]
}

fn do_pause_cores(core_list: u32) {
    let mut desired;
    let mut remaining;
    let mut read = PAUSED_CORE_LIST.load(Ordering::SeqCst);
    loop {
        desired = core_list | read;
        remaining = core_list & !read;
        match PAUSED_CORE_LIST.compare_exchange_weak(
            read,
            desired,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => break,
            Err(v) => read = v,
        }
    }

    let self_bit = 1u32 << current_core_id();

    if remaining & !self_bit != 0 {
        // Other cores have to be dragged out of the guest
        let others = remaining & !self_bit;
        PAUSE_BARRIER.init(others | self_bit);
        crate::irq::generate_sgi_for_list(HypSgi::DebugPause, others);
        PAUSE_BARRIER.wait();
    }

    if remaining & self_bit != 0 {
        current_core_ctx().was_paused = true;
    }

    crate::arch::sev();
}

/// Pause the given cores (atomically; already-paused cores are left alone).
pub fn pause_cores(core_list: u32) {
    let flags = crate::arch::mask_irq();
    do_pause_cores(core_list);
    crate::arch::restore_interrupt_flags(flags);
}

/// DebugPause SGI: acknowledge and join the rendezvous; the actual parking
/// happens in handle_pause on the way back to the guest.
pub fn pause_sgi_handler() {
    current_core_ctx().was_paused = true;
    PAUSE_BARRIER.arrive();
}

/// ReportDebuggerBreak SGI: a remote core asked us to stop and report.
pub fn report_debugger_break_sgi_handler() {
    if !has_debug_event(current_core_id()) {
        report_event(DebugEventType::DebuggerBreak, StopReason::None);
    }
}

/// Resume cores: clear their pause bits and pick which of them single-step.
pub fn unpause_cores(core_list: u32, single_step_list: u32) {
    let single_step_list = single_step_list & core_list;

    for core in 0..crate::core_ctx::MAX_CORES as u32 {
        if core_list & (1 << core) != 0 {
            let ev = &mut events()[core as usize];
            if ev.handled {
                ev.ty = DebugEventType::None;
                ev.stop_reason = StopReason::None;
            }
        }
    }

    SINGLE_STEP_CORE_LIST.store(single_step_list, Ordering::SeqCst);
    PAUSED_CORE_LIST.fetch_and(!core_list, Ordering::SeqCst);

    crate::arch::sev();
}

pub fn set_stepping_range(core_id: u32, start: u64, end: u64) {
    let ctx = crate::core_ctx::core_ctx(core_id);
    ctx.stepping_range_start = start;
    ctx.stepping_range_end = end;
}

/// Park here while our pause bit is set; IRQs are serviced meanwhile. On
/// wake, start or cancel single-stepping per the request mask.
pub fn handle_pause(frame: &mut ExceptionStackFrame) {
    let core = current_core_id();
    let self_bit = 1u32 << core;

    if PAUSED_CORE_LIST.load(Ordering::SeqCst) & self_bit != 0 {
        crate::exceptions::enter_interruptible_hypervisor_code();
        crate::arch::unmask_irq();
        while PAUSED_CORE_LIST.load(Ordering::SeqCst) & self_bit != 0 {
            crate::arch::wfe();
            #[cfg(not(target_arch = "aarch64"))]
            break; // host: nobody will clear the bit
        }
        crate::arch::mask_irq();

        let ev = &mut events()[core as usize];
        if ev.ty != DebugEventType::None && !ev.handled {
            // Still carrying an unreported event; try again
            crate::gdb::debug::try_signal_debug_event(ev);
        }
    }

    current_core_ctx().was_paused = false;

    use crate::debug::single_step::{get_next_state, set_next_state, SingleStepState};
    let requested = SINGLE_STEP_CORE_LIST.load(Ordering::SeqCst) & self_bit != 0;
    let state = get_next_state(frame);
    if requested && state == SingleStepState::Inactive {
        set_next_state(frame, SingleStepState::ActiveNotPending);
    } else if !requested && state != SingleStepState::Inactive {
        set_next_state(frame, SingleStepState::Inactive);
    }
}

/// Record a debug event for this core, pause it, and hand the event to the
/// remote debugger if one is attached. The caller re-examines the pause
/// state afterwards: the debugger may already have continued us.
pub fn report_event(ty: DebugEventType, stop_reason: StopReason) {
    let flags = crate::arch::mask_irq();

    let reporting = reporting_enabled();
    if !reporting && ty != DebugEventType::DebuggerBreak {
        crate::arch::restore_interrupt_flags(flags);
        return;
    }

    let core = current_core_id();
    let ev = &mut events()[core as usize];
    *ev = DebugEventInfo::empty();
    ev.ty = ty;
    ev.stop_reason = stop_reason;
    ev.core_id = core;
    ev.frame = current_core_ctx().guest_frame;

    do_pause_cores(1 << core);

    if reporting {
        crate::exceptions::enter_interruptible_hypervisor_code();
        crate::arch::unmask_irq();
        crate::gdb::debug::try_signal_debug_event(ev);
    }

    crate::arch::restore_interrupt_flags(flags);
}

/// Stop a set of cores on behalf of the debugger (Ctrl-C, vCont pause).
pub fn break_cores(core_list: u32) {
    let core = current_core_id();
    if core_list & !(1 << core) != 0 {
        crate::irq::generate_sgi_for_list(HypSgi::ReportDebuggerBreak, core_list & !(1 << core));
    }
    if core_list & (1 << core) != 0 && !has_debug_event(core) {
        report_event(DebugEventType::DebuggerBreak, StopReason::None);
    }

    // Wait until every targeted core reports paused
    crate::arch::sevl();
    loop {
        crate::arch::wfe();
        if PAUSED_CORE_LIST.load(Ordering::SeqCst) & core_list == core_list {
            break;
        }
        #[cfg(not(target_arch = "aarch64"))]
        break;
    }
}

/// Continue a set of cores on behalf of the debugger.
pub fn continue_cores(core_list: u32, single_step_list: u32) {
    unpause_cores(core_list, single_step_list);

    crate::arch::sevl();
    loop {
        crate::arch::wfe();
        if PAUSED_CORE_LIST.load(Ordering::SeqCst) & core_list == 0 {
            break;
        }
        #[cfg(not(target_arch = "aarch64"))]
        break;
    }
}

// ---- exception-side entry points ----

/// Guest executed a BRK instruction.
pub fn handle_guest_break(frame: &mut ExceptionStackFrame, esr: Esr) {
    let uid = (esr.iss() & 0xFFFF) as u16;
    current_core_ctx().guest_frame = frame as *mut ExceptionStackFrame;

    let reason = if crate::debug::software_breakpoints::match_uid(uid).is_some() {
        StopReason::SwBreakpoint { uid }
    } else {
        StopReason::GuestBreak { uid }
    };

    report_event(DebugEventType::Exception, reason);
}

pub fn handle_hw_breakpoint(frame: &mut ExceptionStackFrame, _esr: Esr) {
    current_core_ctx().guest_frame = frame as *mut ExceptionStackFrame;
    report_event(DebugEventType::Exception, StopReason::HwBreakpoint);
}

pub fn handle_watchpoint(frame: &mut ExceptionStackFrame, esr: Esr) {
    current_core_ctx().guest_frame = frame as *mut ExceptionStackFrame;

    let far = crate::arch::sysreg::read_far_el2();
    let direction = if esr.iss() & (1 << 6) != 0 {
        crate::debug::LSC_STORE
    } else {
        crate::debug::LSC_LOAD
    };

    // Combined watchpoints may be broadened; only report hits an actual
    // split entry accounts for
    if crate::debug::watchpoints::find_split(far, 1, direction, false).is_some() {
        report_event(
            DebugEventType::Exception,
            StopReason::Watchpoint { addr: far, direction },
        );
    } else {
        crate::debug!("watchpoint false positive at {:#x}, not reporting", far);
    }
}

pub fn report_single_step(frame: &mut ExceptionStackFrame) {
    current_core_ctx().guest_frame = frame as *mut ExceptionStackFrame;
    report_event(DebugEventType::Exception, StopReason::SingleStep);
}

pub fn report_core_off() {
    crate::core_ctx::set_current_core_inactive();
    report_event(DebugEventType::CoreOff, StopReason::None);
}

pub fn report_core_on() {
    report_event(DebugEventType::CoreOn, StopReason::None);
}

pub fn report_exit() {
    report_event(DebugEventType::Exit, StopReason::None);
}

#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn pause_bits_are_sticky_and_atomic() {
        let _guard = crate::lib::test_lock();
        crate::core_ctx::init(0, true, 0, false);
        init();

        pause_cores(1 << 0);
        assert!(is_core_paused(0));
        // Pausing again is idempotent
        pause_cores(1 << 0);
        assert!(is_core_paused(0));

        unpause_cores(1 << 0, 0);
        assert!(!is_core_paused(0));
    }

    #[test]
    fn unreported_event_blocks_until_unpaused() {
        let _guard = crate::lib::test_lock();
        crate::core_ctx::init(0, true, 0, false);
        init();

        // Reporting disabled: only DebuggerBreak events stick
        report_event(DebugEventType::Exception, StopReason::SingleStep);
        assert!(!has_debug_event(0));

        report_event(DebugEventType::DebuggerBreak, StopReason::None);
        assert!(is_core_paused(0));
        assert!(has_debug_event(0));

        get_debug_event(0).handled = true;
        unpause_cores(1 << 0, 0);
        assert!(!has_debug_event(0));
        assert_eq!(get_debug_event(0).ty, DebugEventType::None);
    }

    #[test]
    fn stepping_range_lands_in_core_ctx() {
        let _guard = crate::lib::test_lock();
        crate::core_ctx::init(0, true, 0, false);
        set_stepping_range(0, 0x2000, 0x2010);
        assert_eq!(crate::core_ctx::core_ctx(0).stepping_range_start, 0x2000);
        assert_eq!(crate::core_ctx::core_ctx(0).stepping_range_end, 0x2010);
        set_stepping_range(0, 0, 0);
    }
}
