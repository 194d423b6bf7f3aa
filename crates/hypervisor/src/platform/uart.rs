//! Debug UART access
//!
//! Byte-level driver for the two UART flavors we run on: ARM PL011 (QEMU
//! virt) and the 16550-compatible blocks on the Tegra. Line configuration
//! (baud, 8N1, inversion) is the loader's job; this driver only moves bytes
//! and gates the RX interrupt for the transport layer.
//!
//! Before `init` runs (or on a non-aarch64 host) writes are discarded.

use core::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UartKind {
    Pl011,
    Ns16550,
}

// PL011 registers
const PL011_DR: usize = 0x00;
const PL011_FR: usize = 0x18;
const PL011_IMSC: usize = 0x38;
const PL011_ICR: usize = 0x44;

const PL011_FR_RXFE: u32 = 1 << 4;
const PL011_FR_TXFF: u32 = 1 << 5;
const PL011_IMSC_RXIM: u32 = 1 << 4;
const PL011_ICR_RXIC: u32 = 1 << 4;

// 16550 registers (4-byte stride)
const NS16550_RBR_THR: usize = 0x00;
const NS16550_IER: usize = 0x04;
const NS16550_LSR: usize = 0x14;

const NS16550_LSR_RDR: u32 = 1 << 0;
const NS16550_LSR_THRE: u32 = 1 << 5;
const NS16550_IER_RDA: u32 = 1 << 0;

/// Debug UART base VA, 0 until the MMIO window is mapped
static UART_BASE: AtomicUsize = AtomicUsize::new(0);
static UART_KIND: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn mmio_read(base: usize, off: usize) -> u32 {
    unsafe { core::ptr::read_volatile((base + off) as *const u32) }
}

#[inline]
fn mmio_write(base: usize, off: usize, val: u32) {
    unsafe { core::ptr::write_volatile((base + off) as *mut u32, val) }
}

fn kind() -> UartKind {
    match UART_KIND.load(Ordering::Relaxed) {
        0 => UartKind::Pl011,
        _ => UartKind::Ns16550,
    }
}

/// Register the mapped UART. Called once by the boot core after the MMIO
/// window exists.
pub fn init(base_va: usize, uart_kind: UartKind) {
    UART_KIND.store(
        match uart_kind {
            UartKind::Pl011 => 0,
            UartKind::Ns16550 => 1,
        },
        Ordering::Relaxed,
    );
    UART_BASE.store(base_va, Ordering::Release);
}

fn write_byte(base: usize, b: u8) {
    match kind() {
        UartKind::Pl011 => {
            while mmio_read(base, PL011_FR) & PL011_FR_TXFF != 0 {
                core::hint::spin_loop();
            }
            mmio_write(base, PL011_DR, b as u32);
        }
        UartKind::Ns16550 => {
            while mmio_read(base, NS16550_LSR) & NS16550_LSR_THRE == 0 {
                core::hint::spin_loop();
            }
            mmio_write(base, NS16550_RBR_THR, b as u32);
        }
    }
}

fn read_byte_nonblocking(base: usize) -> Option<u8> {
    match kind() {
        UartKind::Pl011 => {
            if mmio_read(base, PL011_FR) & PL011_FR_RXFE == 0 {
                Some(mmio_read(base, PL011_DR) as u8)
            } else {
                None
            }
        }
        UartKind::Ns16550 => {
            if mmio_read(base, NS16550_LSR) & NS16550_LSR_RDR != 0 {
                Some(mmio_read(base, NS16550_RBR_THR) as u8)
            } else {
                None
            }
        }
    }
}

pub fn write_bytes(data: &[u8]) {
    let base = UART_BASE.load(Ordering::Acquire);
    if base == 0 {
        return;
    }
    for &b in data {
        write_byte(base, b);
    }
}

/// Blocking read of exactly `buf.len()` bytes.
pub fn read_bytes(buf: &mut [u8]) {
    let base = UART_BASE.load(Ordering::Acquire);
    if base == 0 {
        return;
    }
    for slot in buf.iter_mut() {
        loop {
            if let Some(b) = read_byte_nonblocking(base) {
                *slot = b;
                break;
            }
            core::hint::spin_loop();
        }
    }
}

/// Drain whatever is in the RX FIFO, up to `buf.len()` bytes.
pub fn read_bytes_max(buf: &mut [u8]) -> usize {
    let base = UART_BASE.load(Ordering::Acquire);
    if base == 0 {
        return 0;
    }
    let mut n = 0;
    while n < buf.len() {
        match read_byte_nonblocking(base) {
            Some(b) => {
                buf[n] = b;
                n += 1;
            }
            None => break,
        }
    }
    n
}

/// Enable or disable the RX interrupt.
pub fn set_rx_interrupt(enabled: bool) {
    let base = UART_BASE.load(Ordering::Acquire);
    if base == 0 {
        return;
    }
    match kind() {
        UartKind::Pl011 => {
            let mut imsc = mmio_read(base, PL011_IMSC);
            if enabled {
                imsc |= PL011_IMSC_RXIM;
            } else {
                imsc &= !PL011_IMSC_RXIM;
                mmio_write(base, PL011_ICR, PL011_ICR_RXIC);
            }
            mmio_write(base, PL011_IMSC, imsc);
        }
        UartKind::Ns16550 => {
            let mut ier = mmio_read(base, NS16550_IER);
            if enabled {
                ier |= NS16550_IER_RDA;
            } else {
                ier &= !NS16550_IER_RDA;
            }
            mmio_write(base, NS16550_IER, ier);
        }
    }
}

/// Sink for printk. Safe before init (bytes are dropped).
pub fn debug_write(data: &[u8]) {
    #[cfg(test)]
    {
        // Host tests: forward to stdout so failing tests show hypervisor logs
        use std::io::Write;
        let _ = std::io::stdout().write_all(data);
        return;
    }
    #[cfg(not(test))]
    write_bytes(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_uart_drops_io() {
        // UART_BASE is 0 on the host: reads return nothing, writes no-op
        let mut buf = [0u8; 4];
        assert_eq!(read_bytes_max(&mut buf), 0);
        write_bytes(b"dropped");
        set_rx_interrupt(true);
    }
}
