//! Platform definitions
//!
//! Two supported platforms, selected at compile time:
//! - QEMU `virt` with `-machine virt,gic-version=2` (default)
//! - NVIDIA Tegra X1 (feature `platform-tegra`)
//!
//! The loader has already initialized pinmux/clocks and configured the debug
//! UART line parameters; the hypervisor only moves bytes and gates the RX
//! interrupt.

pub mod qemu_virt;
pub mod tegra210;
pub mod uart;

/// Everything the hypervisor needs to know about the SoC.
#[derive(Debug, Clone, Copy)]
pub struct PlatformDescriptor {
    pub name: &'static str,
    /// GICv2 block physical addresses
    pub gicd_pa: usize,
    pub gicc_pa: usize,
    pub gich_pa: usize,
    pub gicv_pa: usize,
    /// Debug/GDB UART
    pub uart_pa: usize,
    pub uart_kind: uart::UartKind,
    pub uart_irq_id: u16,
    /// Highest interrupt id the platform GIC can report
    pub gic_max_irq_id: u16,
}

#[cfg(not(feature = "platform-tegra"))]
pub fn active() -> &'static PlatformDescriptor {
    &qemu_virt::DESCRIPTOR
}

#[cfg(feature = "platform-tegra")]
pub fn active() -> &'static PlatformDescriptor {
    &tegra210::DESCRIPTOR
}

// PPI ids common to all ARMv8-A platforms
pub const GIC_IRQID_MAINTENANCE: u16 = 25;
pub const GIC_IRQID_NS_PHYS_HYP_TIMER: u16 = 26;
pub const GIC_IRQID_NS_VIRT_TIMER: u16 = 27;
pub const GIC_IRQID_NS_PHYS_TIMER: u16 = 30;

pub const GIC_IRQID_SPURIOUS: u16 = 1023;

/// Upper bound used to size the virtual interrupt tables; covers both
/// supported platforms.
pub const GIC_IRQID_MAX: u16 = 287;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_platform_covers_virq_tables() {
        assert!(active().gic_max_irq_id <= GIC_IRQID_MAX);
    }

    #[test]
    fn gic_block_addresses_are_page_aligned() {
        let p = active();
        assert_eq!(p.gicd_pa & 0xFFF, 0);
        assert_eq!(p.gich_pa & 0xFFF, 0);
    }
}
