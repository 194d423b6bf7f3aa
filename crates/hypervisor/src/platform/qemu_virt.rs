// QEMU aarch64 virt machine with a GICv2 (-machine virt,gic-version=2)

use super::uart::UartKind;
use super::PlatformDescriptor;

pub static DESCRIPTOR: PlatformDescriptor = PlatformDescriptor {
    name: "qemu-virt",
    gicd_pa: 0x0800_0000,
    gicc_pa: 0x0801_0000,
    gich_pa: 0x0803_0000,
    gicv_pa: 0x0804_0000,
    uart_pa: 0x0900_0000,
    uart_kind: UartKind::Pl011,
    // virt UART0 is SPI 1
    uart_irq_id: 32 + 1,
    // virt advertises up to 256 SPIs with gic-version=2
    gic_max_irq_id: 287,
};
