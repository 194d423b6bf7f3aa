// NVIDIA Tegra X1 (t210)
//
// The GIC-400 block sits in the PPSB; UART-A is the debug UART the loader
// configures. Pinmux, clock and baud setup all happen before we get control.

use super::uart::UartKind;
use super::PlatformDescriptor;

pub static DESCRIPTOR: PlatformDescriptor = PlatformDescriptor {
    name: "tegra210",
    gicd_pa: 0x5004_1000,
    gicc_pa: 0x5004_2000,
    gich_pa: 0x5004_4000,
    gicv_pa: 0x5004_6000,
    uart_pa: 0x7000_6000,
    uart_kind: UartKind::Ns16550,
    // UART-A interrupt: SPI 36
    uart_irq_id: 32 + 36,
    gic_max_irq_id: 223,
};
