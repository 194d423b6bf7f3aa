//! Physical GIC driver and IRQ exception top-half
//!
//! The boot core resets the whole distributor once; every core resets its
//! banked private-interrupt registers and its CPU interface on (warm)boot.
//! EOIMode is split: the top-half always drops priority, and deactivates
//! only host-owned interrupts; guest interrupts stay active until the guest
//! EOIs them through the virtual interface.

use crate::core_ctx::current_core_ctx;
use crate::gicv2::{GicCpuInterface, GicDistributor, GicHypervisorInterface};
use crate::platform;
use crate::smp::{self, HypSgi};
use crate::sync::RecursiveSpinlock;

pub const IRQ_PRIORITY_HOST: u8 = 0;
pub const IRQ_PRIORITY_GUEST: u8 = 1;

pub struct IrqManager {
    pub gicd: GicDistributor,
    pub gicc: GicCpuInterface,
    pub gich: GicHypervisorInterface,
    pub num_shared_interrupts: u16,
    pub priority_shift: u8,
    pub num_priority_levels: u8,
    pub num_cpu_interfaces: u8,
    pub num_list_registers: u8,
    initialized: bool,
}

/// Held whenever vGIC state or the pending queue is mutated or inspected
/// below top-half granularity. IRQs must be masked while held.
pub static G_IRQ_LOCK: RecursiveSpinlock = RecursiveSpinlock::new();

static mut G_IRQ_MANAGER: IrqManager = IrqManager {
    gicd: GicDistributor::new(0),
    gicc: GicCpuInterface::new(0),
    gich: GicHypervisorInterface::new(0),
    num_shared_interrupts: 0,
    priority_shift: 0,
    num_priority_levels: 0,
    num_cpu_interfaces: 0,
    num_list_registers: 0,
    initialized: false,
};

pub fn irq_manager() -> &'static mut IrqManager {
    unsafe { &mut *core::ptr::addr_of_mut!(G_IRQ_MANAGER) }
}

pub fn gicd() -> GicDistributor {
    irq_manager().gicd
}

pub fn gicc() -> GicCpuInterface {
    irq_manager().gicc
}

pub fn gich() -> GicHypervisorInterface {
    irq_manager().gich
}

#[cfg(target_arch = "aarch64")]
fn init_gic_pointers(mgr: &mut IrqManager) {
    mgr.gicd = GicDistributor::new(crate::memory_map::VA_GICD as usize);
    mgr.gicc = GicCpuInterface::new(crate::memory_map::VA_GICC as usize);
    mgr.gich = GicHypervisorInterface::new(crate::memory_map::VA_GICH as usize);
}

// Host register files standing in for the GIC blocks; vgic tests poke them
// directly.
#[cfg(not(target_arch = "aarch64"))]
pub mod mock {
    #[repr(align(4096))]
    pub struct RegFile<const N: usize>(pub [u32; N]);

    pub static mut GICD: RegFile<0x400> = RegFile([0; 0x400]);
    pub static mut GICC: RegFile<0x500> = RegFile([0; 0x500]);
    pub static mut GICH: RegFile<0x100> = RegFile([0; 0x100]);

    /// Reset the fake register files to a plausible 4-core GIC: 256 SPIs,
    /// 4 list registers, all LRs empty, this core's interface mask = 0x01.
    pub fn reset() {
        unsafe {
            let gicd = &mut *core::ptr::addr_of_mut!(GICD.0);
            let gicc = &mut *core::ptr::addr_of_mut!(GICC.0);
            let gich = &mut *core::ptr::addr_of_mut!(GICH.0);
            gicd.fill(0);
            gicc.fill(0);
            gich.fill(0);
            gicd[crate::gicv2::GICD_TYPER / 4] = 0x7;
            gicd[crate::gicv2::GICD_ITARGETSR / 4] = 0x01;
            gich[crate::gicv2::GICH_VTR / 4] = 3;
            gich[crate::gicv2::GICH_ELSR0 / 4] = 0xF;
        }
    }

    pub fn gicd_base() -> usize {
        core::ptr::addr_of!(GICD) as usize
    }

    pub fn gicc_base() -> usize {
        core::ptr::addr_of!(GICC) as usize
    }

    pub fn gich_base() -> usize {
        core::ptr::addr_of!(GICH) as usize
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn init_gic_pointers(mgr: &mut IrqManager) {
    mgr.gicd = GicDistributor::new(mock::gicd_base());
    mgr.gicc = GicCpuInterface::new(mock::gicc_base());
    mgr.gich = GicHypervisorInterface::new(mock::gich_base());
}

fn init_gic() {
    let ctx = current_core_ctx();
    let mgr = irq_manager();

    if ctx.is_boot_core && !ctx.warmboot {
        init_gic_pointers(mgr);

        // Quiesce forwarding while we reprogram everything
        mgr.gicd.set_ctlr(0);

        mgr.num_shared_interrupts = 32 * (mgr.gicd.typer() as u16 & 0x1F);

        // Unimplemented low priority bits read as zero; probe them
        mgr.gicd.set_priority(0, 0xFF);
        let implemented = mgr.gicd.priority(0).count_ones() as u8;
        mgr.priority_shift = 8 - implemented;
        mgr.num_priority_levels = ((1u16 << implemented) - 1).min(255) as u8;

        mgr.num_cpu_interfaces = 1 + ((mgr.gicd.typer() >> 5) & 7) as u8;
        mgr.num_list_registers = mgr.gich.num_list_registers() as u8;
        mgr.initialized = true;

        crate::info!(
            "GICv2: {} SPIs, {} priority levels, {} CPU interfaces, {} LRs",
            mgr.num_shared_interrupts,
            mgr.num_priority_levels,
            mgr.num_cpu_interfaces,
            mgr.num_list_registers
        );
    }

    // Filter everything while reprogramming, disable preemption
    mgr.gicc.set_pmr(0);
    mgr.gicc.set_bpr(7);

    // The GICD I* registers are banked for private interrupts; only the boot
    // core walks the shared ones
    let num_interrupts = if ctx.is_boot_core {
        32 + mgr.num_shared_interrupts
    } else {
        32
    };

    for i in 0..(num_interrupts as usize / 32) {
        mgr.gicd.0.write32(crate::gicv2::GICD_ICENABLER + 4 * i, 0xFFFF_FFFF);
        mgr.gicd.0.write32(crate::gicv2::GICD_ICACTIVER + 4 * i, 0xFFFF_FFFF);
        mgr.gicd.0.write32(crate::gicv2::GICD_ICPENDR + 4 * i, 0xFFFF_FFFF);
    }

    for id in 0..num_interrupts {
        mgr.gicd.set_priority(id, 0xFF);
    }

    // Shared interrupts: level-sensitive, no targets
    for n in (32 / 16)..(num_interrupts as usize / 16) {
        mgr.gicd.set_icfgr(n, 0x5555_5555);
    }
    for id in 32..num_interrupts {
        mgr.gicd.set_targets(id, 0);
    }

    if ctx.is_boot_core {
        mgr.gicd.set_ctlr(1);
    }

    // Enable the CPU interface with split priority-drop/deactivate
    mgr.gicc.set_ctlr((1 << 9) | 1);
    mgr.gicc.set_pmr(0xFF);

    ctx.gic_interface_mask = mgr.gicd.targets(0);
}

/// Route a shared interrupt to the hypervisor with the given priority and
/// trigger mode.
pub fn configure_interrupt(id: u16, prio: u8, level_sensitive: bool) {
    let mgr = irq_manager();
    mgr.gicd.clear_enable(id);

    if id >= 32 {
        let mut cfgr = mgr.gicd.icfgr(id as usize / 16);
        cfgr &= !(3 << GicDistributor::cfgr_shift(id));
        cfgr |= (if level_sensitive { 1 } else { 3 }) << GicDistributor::cfgr_shift(id);
        mgr.gicd.set_icfgr(id as usize / 16, cfgr);

        let targets = mgr.gicd.targets(id) | current_core_ctx().gic_interface_mask;
        mgr.gicd.set_targets(id, targets);
    }
    mgr.gicd.clear_pending(id);
    mgr.gicd.set_priority(id, prio << mgr.priority_shift);
    mgr.gicd.set_enable(id);
}

/// Move a shared interrupt to another core (transport RX migration).
pub fn set_affinity(id: u16, affinity_mask: u8) {
    let flags = G_IRQ_LOCK.lock_mask_irq();
    irq_manager().gicd.set_targets(id, affinity_mask);
    G_IRQ_LOCK.unlock_restore_irq(flags);
}

/// Is this interrupt owned by the guest (as opposed to the hypervisor)?
pub fn is_guest_interrupt(id: u16) -> bool {
    if (id as usize) < smp::NUM_HYP_SGIS as usize {
        return false;
    }
    if id == platform::GIC_IRQID_MAINTENANCE || id == platform::GIC_IRQID_NS_PHYS_HYP_TIMER {
        return false;
    }
    if id == crate::transport::debug_uart_irq_id() {
        return false;
    }
    id <= platform::active().gic_max_irq_id
}

pub fn generate_sgi_for_list(id: HypSgi, core_list: u32) {
    let mgr = irq_manager();
    if !mgr.initialized || core_list == 0 {
        return;
    }
    mgr.gicd.set_sgir(((core_list & 0xFF) << 16) | (id as u32 & 0xF));
}

pub fn generate_sgi_for_all_others(id: HypSgi) {
    let mgr = irq_manager();
    if !mgr.initialized {
        return;
    }
    mgr.gicd.set_sgir((1 << 24) | (id as u32 & 0xF));
}

/// Initialize the GIC and the vGIC for this core, then enable the
/// hypervisor's own interrupt sources.
pub fn init() {
    let flags = G_IRQ_LOCK.lock_mask_irq();

    init_gic();
    crate::vgic::init();

    for id in 0..smp::NUM_HYP_SGIS {
        configure_interrupt(id, IRQ_PRIORITY_HOST, false);
    }
    configure_interrupt(platform::GIC_IRQID_MAINTENANCE, IRQ_PRIORITY_HOST, true);
    configure_interrupt(platform::GIC_IRQID_NS_PHYS_HYP_TIMER, IRQ_PRIORITY_HOST, true);

    G_IRQ_LOCK.unlock_restore_irq(flags);
}

/// IRQ exception entry, shared between lower-EL and same-EL (unmasked wait
/// loop) interrupts.
pub fn handle_irq_exception(frame: &mut crate::exceptions::ExceptionStackFrame) {
    let mgr = irq_manager();

    // Acknowledge: pending -> active
    let iar = mgr.gicc.iar();
    let irq_id = (iar & 0x3FF) as u16;
    let src_core = (iar >> 10) & 7;

    if irq_id == platform::GIC_IRQID_SPURIOUS {
        return;
    }

    if irq_id == platform::GIC_IRQID_NS_PHYS_TIMER
        && !crate::guest_timers::check_reschedule_emulated_ptimer(frame)
    {
        // The guest's deadline has not really arrived; the timer was
        // reprogrammed, swallow the interrupt entirely
        mgr.gicc.eoir(iar);
        mgr.gicc.dir(iar);
        return;
    }

    let mut is_guest_irq = false;
    let mut is_maintenance = false;

    match irq_id {
        id if id == HypSgi::ExecuteFunction as u16 => {
            smp::execute_function_interrupt_handler(src_core);
        }
        id if id == HypSgi::VgicUpdate as u16 => {
            // Nothing to do: the refresh below picks up the new state
        }
        id if id == HypSgi::DebugPause as u16 => {
            crate::debug::manager::pause_sgi_handler();
        }
        id if id == HypSgi::ReportDebuggerBreak as u16 => {
            crate::debug::manager::report_debugger_break_sgi_handler();
        }
        id if id == platform::GIC_IRQID_MAINTENANCE => {
            is_maintenance = true;
        }
        id if id == platform::GIC_IRQID_NS_PHYS_HYP_TIMER => {
            crate::timer::interrupt_handler();
        }
        id if id == crate::transport::debug_uart_irq_id() => {
            crate::transport::irq_handler(id);
        }
        id => {
            is_guest_irq = id >= 16;
        }
    }

    // Priority drop
    mgr.gicc.eoir(iar);

    let is_guest_irq = is_guest_irq && is_guest_interrupt(irq_id);

    G_IRQ_LOCK.lock();

    if is_guest_irq {
        crate::vgic::enqueue_physical_irq(irq_id);
    } else {
        if is_maintenance {
            crate::vgic::maintenance_interrupt_handler();
        }
        // Host interrupt: deactivate now
        mgr.gicc.dir(iar);
    }

    crate::vgic::update_state();

    G_IRQ_LOCK.unlock();
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single module owning irq-manager-global tests keeps the parallel test
    // runner away from racing initializations.
    #[test]
    fn init_reads_mock_gic_geometry() {
        let _guard = crate::lib::test_lock();
        crate::core_ctx::init(0, true, 0, false);
        mock::reset();
        init();
        let mgr = irq_manager();
        assert_eq!(mgr.num_shared_interrupts, 224);
        assert_eq!(mgr.num_list_registers, 4);
        assert_eq!(mgr.priority_shift, 0);
        assert_eq!(current_core_ctx().gic_interface_mask, 0x01);
    }

    #[test]
    fn hypervisor_interrupts_are_not_guest() {
        assert!(!is_guest_interrupt(0));
        assert!(!is_guest_interrupt(platform::GIC_IRQID_MAINTENANCE));
        assert!(!is_guest_interrupt(platform::GIC_IRQID_NS_PHYS_HYP_TIMER));
        assert!(is_guest_interrupt(42));
        assert!(is_guest_interrupt(platform::GIC_IRQID_NS_PHYS_TIMER));
        assert!(!is_guest_interrupt(platform::GIC_IRQID_MAX + 1));
    }
}
