//! Transport interfaces
//!
//! A transport interface is a byte stream with an optional RX interrupt, the
//! thing the GDB server talks through. Today that means the debug UART; the
//! registry is bounded and lock-protected so a second interface (a second
//! UART, say) is a table entry away.
//!
//! `acquire`/`release` bracket any multi-byte exchange: they gate the RX
//! interrupt so a half-read packet is never preempted by the RX top-half.
//! `set_interrupt_affinity` migrates the RX interrupt to whichever core runs
//! the debugger loop.

use heapless::Vec;

use crate::platform::{self, uart};
use crate::sync::RecursiveSpinlock;

pub const MAX_TRANSPORT_INTERFACES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportInterfaceType {
    Uart,
}

/// Returns how many bytes arrived; called with the interface acquired.
pub type ReceiveDataCallback = fn(iface: &TransportInterface, ctx: usize) -> usize;
/// Consumes what the receive callback announced.
pub type ProcessDataCallback = fn(iface: &TransportInterface, ctx: usize, size: usize);

pub struct TransportInterface {
    pub ty: TransportInterfaceType,
    pub id: u32,
    pub flags: u32,
    lock: RecursiveSpinlock,
    receive_data: Option<ReceiveDataCallback>,
    process_data: Option<ProcessDataCallback>,
    ctx: usize,
}

impl TransportInterface {
    const fn new() -> Self {
        Self {
            ty: TransportInterfaceType::Uart,
            id: 0,
            flags: 0,
            lock: RecursiveSpinlock::new(),
            receive_data: None,
            process_data: None,
            ctx: 0,
        }
    }

    pub fn write_data(&self, buf: &[u8]) {
        match self.ty {
            TransportInterfaceType::Uart => uart::write_bytes(buf),
        }
    }

    pub fn read_data(&self, buf: &mut [u8]) {
        match self.ty {
            TransportInterfaceType::Uart => uart::read_bytes(buf),
        }
    }

    pub fn read_data_max(&self, buf: &mut [u8]) -> usize {
        match self.ty {
            TransportInterfaceType::Uart => uart::read_bytes_max(buf),
        }
    }

    fn set_rx_interrupt(&self, enabled: bool) {
        match self.ty {
            TransportInterfaceType::Uart => uart::set_rx_interrupt(enabled),
        }
    }

    /// Take the interface lock and quiesce the RX interrupt.
    pub fn acquire(&self) {
        self.lock.lock();
        self.set_rx_interrupt(false);
    }

    pub fn release(&self) {
        self.set_rx_interrupt(true);
        self.lock.unlock();
    }

    pub fn irq_id(&self) -> u16 {
        match self.ty {
            TransportInterfaceType::Uart => platform::active().uart_irq_id,
        }
    }

    /// Migrate the RX interrupt to another core.
    pub fn set_interrupt_affinity(&self, affinity_mask: u8) {
        let flags = self.lock.lock_mask_irq();
        crate::irq::set_affinity(self.irq_id(), affinity_mask);
        self.lock.unlock_restore_irq(flags);
    }
}

static G_TRANSPORT_LAYER_LOCK: RecursiveSpinlock = RecursiveSpinlock::new();
static mut G_TRANSPORT_IFACES: Vec<TransportInterface, MAX_TRANSPORT_INTERFACES> = Vec::new();

fn registry() -> &'static mut Vec<TransportInterface, MAX_TRANSPORT_INTERFACES> {
    unsafe { &mut *core::ptr::addr_of_mut!(G_TRANSPORT_IFACES) }
}

/// Register a transport. The UART itself was configured by the loader; this
/// only arms the RX interrupt when a receive callback wants it.
pub fn create(
    ty: TransportInterfaceType,
    id: u32,
    flags: u32,
    receive_data: Option<ReceiveDataCallback>,
    process_data: Option<ProcessDataCallback>,
    ctx: usize,
) -> &'static TransportInterface {
    let irq_flags = G_TRANSPORT_LAYER_LOCK.lock_mask_irq();

    let registry = registry();
    if registry.iter().any(|i| i.ty == ty && i.id == id) {
        panic!("transport: device already registered");
    }

    let mut iface = TransportInterface::new();
    iface.ty = ty;
    iface.id = id;
    iface.flags = flags;
    iface.receive_data = receive_data;
    iface.process_data = process_data;
    iface.ctx = ctx;

    if registry.push(iface).is_err() {
        panic!("transport: registry exhausted");
    }
    let iface = registry.last().unwrap();

    // Route the device interrupt to this core at host priority, then let the
    // device raise it only if someone consumes RX data
    crate::irq::configure_interrupt(iface.irq_id(), crate::irq::IRQ_PRIORITY_HOST, true);
    iface.set_rx_interrupt(receive_data.is_some());

    G_TRANSPORT_LAYER_LOCK.unlock_restore_irq(irq_flags);
    // Entries are never removed, the reference stays valid
    unsafe { core::mem::transmute::<&TransportInterface, &'static TransportInterface>(iface) }
}

pub fn find_by_irq_id(irq_id: u16) -> Option<&'static TransportInterface> {
    let flags = G_TRANSPORT_LAYER_LOCK.lock_mask_irq();
    let found = registry().iter().find(|i| i.irq_id() == irq_id).map(|i| unsafe {
        core::mem::transmute::<&TransportInterface, &'static TransportInterface>(i)
    });
    G_TRANSPORT_LAYER_LOCK.unlock_restore_irq(flags);
    found
}

/// The debug UART's interrupt id, for the IRQ top-half dispatch.
pub fn debug_uart_irq_id() -> u16 {
    platform::active().uart_irq_id
}

/// RX interrupt servicing: read whatever arrived, hand it to the owner.
pub fn irq_handler(irq_id: u16) {
    let Some(iface) = find_by_irq_id(irq_id) else {
        crate::warn!("transport: interrupt {} with no registered interface", irq_id);
        return;
    };

    iface.acquire();
    if let Some(receive) = iface.receive_data {
        let size = receive(iface, iface.ctx);
        if size > 0 {
            if let Some(process) = iface.process_data {
                process(iface, iface.ctx, size);
            }
        }
    }
    iface.release();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_none(_iface: &TransportInterface, _ctx: usize) -> usize {
        0
    }

    #[test]
    fn registry_registers_and_finds_by_irq() {
        let iface = create(TransportInterfaceType::Uart, 7, 0, Some(recv_none), None, 0x55);
        assert_eq!(iface.id, 7);
        assert_eq!(iface.ctx, 0x55);
        assert!(find_by_irq_id(platform::active().uart_irq_id).is_some());
        assert!(find_by_irq_id(0xFFF).is_none());
    }

    #[test]
    #[should_panic]
    fn duplicate_registration_panics() {
        create(TransportInterfaceType::Uart, 9, 0, None, None, 0);
        create(TransportInterfaceType::Uart, 9, 0, None, None, 0);
    }
}
